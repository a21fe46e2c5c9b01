use axum::http::HeaderMap;
use n0_error::{Result, StackResultExt, StdResultExt};
use openidconnect::{
    ClientId, IssuerUrl, JsonWebKeySetUrl,
    core::{CoreIdTokenClaims, CoreIdTokenVerifier, CoreJsonWebKeySet, CoreJwsSigningAlgorithm},
};
use tracing::debug;

use super::JWT_HEADER;
use crate::oauthutil::{
    http_client,
    oidc::{accept_any_nonce, parse_id_token},
};

pub const IAP_ISSUER: &str = "https://cloud.google.com/iap";
pub const IAP_JWKS_URL: &str = "https://www.gstatic.com/iap/verify/public_key-jwk";

/// Verifies the signed headers IAP attaches to requests for one backend.
#[derive(derive_more::Debug, Clone)]
pub struct IapVerifier {
    audience: ClientId,
    issuer: IssuerUrl,
    #[debug(skip)]
    jwks: CoreJsonWebKeySet,
    algs: Vec<CoreJwsSigningAlgorithm>,
}

impl IapVerifier {
    /// Fetches Google's current IAP signing keys.
    ///
    /// `audience` has the form `/projects/{number}/global/backendServices/{id}`.
    pub async fn fetch(audience: impl Into<String>) -> Result<Self> {
        let url = JsonWebKeySetUrl::new(IAP_JWKS_URL.to_string()).std_context("Invalid JWKS URL")?;
        let jwks = CoreJsonWebKeySet::fetch_async(&url, &http_client()?)
            .await
            .std_context("Failed to fetch IAP signing keys")?;
        debug!(keys = jwks.keys().len(), "fetched IAP signing keys");
        Self::new(audience, jwks)
    }

    pub fn new(audience: impl Into<String>, jwks: CoreJsonWebKeySet) -> Result<Self> {
        Ok(Self {
            audience: ClientId::new(audience.into()),
            issuer: IssuerUrl::new(IAP_ISSUER.to_string()).std_context("Invalid IAP issuer")?,
            jwks,
            algs: vec![CoreJwsSigningAlgorithm::EcdsaP256Sha256],
        })
    }

    pub fn with_allowed_algs(mut self, algs: Vec<CoreJwsSigningAlgorithm>) -> Self {
        self.algs = algs;
        self
    }

    pub fn audience(&self) -> &str {
        self.audience.as_str()
    }

    pub fn verify(&self, jwt: &str) -> Result<CoreIdTokenClaims> {
        let verifier = CoreIdTokenVerifier::new_public_client(
            self.audience.clone(),
            self.issuer.clone(),
            self.jwks.clone(),
        )
        .set_allowed_algs(self.algs.clone());
        let token = parse_id_token(jwt).std_context("Malformed IAP JWT")?;
        let claims = token
            .claims(&verifier, accept_any_nonce)
            .std_context("JWT is invalid")?;
        Ok(claims.clone())
    }

    /// Verifies `jwt` and returns its email claim.
    pub fn email(&self, jwt: &str) -> Result<String> {
        let claims = self.verify(jwt)?;
        let email = claims.email().context("IAP JWT has no email claim")?;
        Ok(email.as_str().to_string())
    }

    /// Verifies the IAP header of a request and returns the caller's email.
    pub fn email_from_headers(&self, headers: &HeaderMap) -> Result<String> {
        let jwt = headers
            .get(JWT_HEADER)
            .context("Request has no IAP JWT header")?
            .to_str()
            .std_context("IAP JWT header is not ASCII")?;
        self.email(jwt)
    }
}
