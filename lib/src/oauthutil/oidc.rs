use std::sync::Arc;

use async_trait::async_trait;
use axum::http::HeaderMap;
use chrono::{DateTime, Utc};
use n0_error::{Result, StackResultExt, StdResultExt};
use openidconnect::{
    AccessToken, AccessTokenHash, Audience, ClaimsVerificationError, ClientId, ClientSecret,
    CsrfToken, IssuerUrl, Nonce, NonceVerifier, OAuth2TokenResponse, RedirectUrl, RefreshToken,
    Scope, SignatureVerificationError, SigningError, TokenResponse,
    core::{
        CoreAuthenticationFlow, CoreClient, CoreIdToken, CoreIdTokenClaims, CoreProviderMetadata,
    },
};
use serde::{Deserialize, Serialize};
use snafu::Snafu;
use tracing::{debug, info};

use super::{
    cookies::{self, NONCE_COOKIE, STATE_COOKIE},
    handlers::{
        AuthCodeFlow, AuthRedirect, CallbackError, CallbackParams, FLOW_SECRET_BYTES,
        check_callback,
    },
    http_client,
    token::{RefreshingTokenSource, Token, TokenRefresher, TokenSource},
    types::OidcClient,
};
use crate::{jwt, util::random_string};

/// Discovered provider metadata plus the OAuth client registered with it.
#[derive(derive_more::Debug, Clone)]
pub struct OidcProvider {
    #[debug("CoreProviderMetadata")]
    metadata: CoreProviderMetadata,
    client_id: ClientId,
    #[debug(skip)]
    client_secret: Option<ClientSecret>,
    audiences: Arc<Vec<Audience>>,
    #[debug(skip)]
    http: reqwest::Client,
}

impl OidcProvider {
    /// Uses OpenID Connect Discovery to fetch the provider metadata.
    pub async fn discover(
        issuer: &str,
        client_id: ClientId,
        client_secret: Option<ClientSecret>,
    ) -> Result<Self> {
        let http = http_client()?;
        let metadata = CoreProviderMetadata::discover_async(
            IssuerUrl::new(issuer.to_string()).std_context("Invalid OIDC provider issuer URL")?,
            &http,
        )
        .await
        .std_context("Failed to discover OIDC provider metadata")?;
        debug!(%issuer, "discovered OIDC provider");
        Ok(Self {
            metadata,
            client_id,
            client_secret,
            audiences: Default::default(),
            http,
        })
    }

    pub fn from_metadata(
        metadata: CoreProviderMetadata,
        client_id: ClientId,
        client_secret: Option<ClientSecret>,
    ) -> Result<Self> {
        Ok(Self {
            metadata,
            client_id,
            client_secret,
            audiences: Default::default(),
            http: http_client()?,
        })
    }

    /// Additional audiences accepted in ID tokens besides our own client id.
    pub fn with_audiences(mut self, audiences: impl IntoIterator<Item = String>) -> Self {
        self.audiences = Arc::new(audiences.into_iter().map(Audience::new).collect());
        self
    }

    pub fn issuer(&self) -> &IssuerUrl {
        self.metadata.issuer()
    }

    pub fn client_id(&self) -> &ClientId {
        &self.client_id
    }

    fn client(&self) -> OidcClient {
        CoreClient::from_provider_metadata(
            self.metadata.clone(),
            self.client_id.clone(),
            self.client_secret.clone(),
        )
    }

    pub fn verifier(&self) -> IdTokenVerifier {
        IdTokenVerifier {
            client: self.client(),
            audiences: self.audiences.clone(),
        }
    }

    pub fn refresher(&self) -> Arc<dyn TokenRefresher> {
        Arc::new(OidcRefresher {
            client: self.client(),
            http: self.http.clone(),
        })
    }

    /// Wraps `source` so that every retrieval yields a verified ID token.
    pub fn id_token_source(&self, source: Arc<dyn TokenSource>) -> IdTokenSource {
        IdTokenSource::new(source, self.verifier())
    }

    pub fn handlers(
        &self,
        redirect_url: RedirectUrl,
        scopes: impl IntoIterator<Item = String>,
    ) -> OidcHandlers {
        OidcHandlers {
            client: self.client().set_redirect_uri(redirect_url.clone()),
            provider: self.clone(),
            redirect_url,
            // `openid` is always requested.
            scopes: scopes
                .into_iter()
                .filter(|scope| scope != "openid")
                .map(Scope::new)
                .collect(),
            secure_cookies: false,
        }
    }
}

#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum VerifyError {
    #[snafu(display("Malformed ID token"))]
    Malformed { source: serde_json::Error },
    #[snafu(display("Failed to verify ID token claims"))]
    Claims { source: ClaimsVerificationError },
    #[snafu(display("Failed to resolve ID token signing key"))]
    SigningKey { source: SignatureVerificationError },
    #[snafu(display("Failed to hash access token"))]
    AccessTokenHash { source: SigningError },
    #[snafu(display("Access token does not match the ID token"))]
    AccessTokenMismatch,
}

/// Checks signature, issuer, audience and expiry of ID tokens issued to our client.
#[derive(derive_more::Debug, Clone)]
pub struct IdTokenVerifier {
    #[debug("OidcClient")]
    client: OidcClient,
    audiences: Arc<Vec<Audience>>,
}

impl IdTokenVerifier {
    /// Verifies `raw` without checking its nonce.
    pub fn verify(&self, raw: &str) -> Result<VerifiedIdToken, VerifyError> {
        self.verify_with(raw, accept_any_nonce, None)
    }

    /// Verifies `raw` as returned together with `access_token`, including the
    /// `at_hash` claim when present.
    pub fn verify_exchange(
        &self,
        raw: &str,
        access_token: &AccessToken,
    ) -> Result<VerifiedIdToken, VerifyError> {
        self.verify_with(raw, accept_any_nonce, Some(access_token))
    }

    fn verify_with(
        &self,
        raw: &str,
        nonce_verifier: impl NonceVerifier,
        access_token: Option<&AccessToken>,
    ) -> Result<VerifiedIdToken, VerifyError> {
        let id_token = parse_id_token(raw).map_err(|source| VerifyError::Malformed { source })?;
        let audiences = self.audiences.clone();
        let verifier = self
            .client
            .id_token_verifier()
            .set_other_audience_verifier_fn(move |audience| audiences.contains(audience));
        let claims = id_token
            .claims(&verifier, nonce_verifier)
            .map_err(|source| VerifyError::Claims { source })?
            .clone();

        // Make sure the access token hasn't been substituted for another user's.
        if let (Some(expected), Some(access_token)) = (claims.access_token_hash(), access_token) {
            let alg = id_token
                .signing_alg()
                .map_err(|source| VerifyError::SigningKey { source })?;
            let key = id_token
                .signing_key(&verifier)
                .map_err(|source| VerifyError::SigningKey { source })?;
            let actual = AccessTokenHash::from_token(access_token, alg, key)
                .map_err(|source| VerifyError::AccessTokenHash { source })?;
            if actual != *expected {
                return Err(VerifyError::AccessTokenMismatch);
            }
        }

        Ok(VerifiedIdToken {
            raw: raw.to_string(),
            claims,
        })
    }
}

/// Nonces are only checked on the callback that completes a flow.
pub(crate) fn accept_any_nonce(_: Option<&Nonce>) -> Result<(), String> {
    Ok(())
}

pub(crate) fn parse_id_token(raw: &str) -> Result<CoreIdToken, serde_json::Error> {
    serde_json::from_value(serde_json::Value::String(raw.to_string()))
}

/// The compact serialization of `id_token`.
pub(crate) fn id_token_string(id_token: &CoreIdToken) -> Option<String> {
    match serde_json::to_value(id_token) {
        Ok(serde_json::Value::String(raw)) => Some(raw),
        _ => None,
    }
}

/// An ID token whose signature and claims have been checked.
#[derive(derive_more::Debug, Clone)]
pub struct VerifiedIdToken {
    #[debug(skip)]
    raw: String,
    claims: CoreIdTokenClaims,
}

impl VerifiedIdToken {
    /// The compact JWT.
    pub fn raw(&self) -> &str {
        &self.raw
    }

    pub fn claims(&self) -> &CoreIdTokenClaims {
        &self.claims
    }

    pub fn subject(&self) -> &str {
        self.claims.subject().as_str()
    }

    pub fn email(&self) -> Option<&str> {
        self.claims.email().map(|email| email.as_str())
    }

    pub fn nonce(&self) -> Option<&str> {
        self.claims.nonce().map(|nonce| nonce.secret().as_str())
    }

    pub fn expiry(&self) -> DateTime<Utc> {
        self.claims.expiration()
    }

    /// The claim set as sent by Google.
    pub fn common_claims(&self) -> Result<CommonClaims> {
        jwt::decode_claims(&self.raw)
    }

    /// The raw claim set as JSON.
    pub fn claims_json(&self) -> Result<serde_json::Value> {
        jwt::decode_claims(&self.raw)
    }
}

/// Claims commonly found in Google ID tokens.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommonClaims {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub at_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aud: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub azp: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email_verified: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exp: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub family_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub given_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locale: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hd: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iat: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iss: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub picture: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub: Option<String>,
}

/// Hands out verified ID tokens as bearer tokens.
///
/// Every call re-verifies the ID token held by the underlying source, so a
/// token that fails verification is never returned.
#[derive(derive_more::Debug, Clone)]
pub struct IdTokenSource {
    #[debug(skip)]
    source: Arc<dyn TokenSource>,
    verifier: IdTokenVerifier,
}

impl IdTokenSource {
    pub fn new(source: Arc<dyn TokenSource>, verifier: IdTokenVerifier) -> Self {
        Self { source, verifier }
    }

    pub async fn id_token(&self) -> Result<VerifiedIdToken> {
        let token = self.source.token().await?;
        let raw = token
            .id_token
            .as_deref()
            .context("Underlying token source didn't return an ID token")?;
        self.verifier
            .verify(raw)
            .std_context("Failed to verify ID token")
    }

    /// The source of the opaque access tokens, for APIs that don't accept ID tokens.
    pub fn access_token_source(&self) -> Arc<dyn TokenSource> {
        self.source.clone()
    }
}

#[async_trait]
impl TokenSource for IdTokenSource {
    async fn token(&self) -> Result<Token> {
        let id_token = self.id_token().await?;
        Ok(Token::new(id_token.raw())
            .with_expiry(id_token.expiry())
            .with_id_token(Some(id_token.raw().to_string())))
    }
}

/// Authorization-code flow in identity-token mode.
#[derive(derive_more::Debug, Clone)]
pub struct OidcHandlers {
    #[debug("OidcClient")]
    client: OidcClient,
    provider: OidcProvider,
    redirect_url: RedirectUrl,
    scopes: Vec<Scope>,
    secure_cookies: bool,
}

impl OidcHandlers {
    /// Marks the flow cookies `Secure`, for redirect URLs served over TLS.
    pub fn with_secure_cookies(mut self, secure: bool) -> Self {
        self.secure_cookies = secure;
        self
    }

    pub fn secure_cookies(&self) -> bool {
        self.secure_cookies
    }

    pub fn provider(&self) -> &OidcProvider {
        &self.provider
    }
}

#[async_trait]
impl AuthCodeFlow for OidcHandlers {
    type Source = IdTokenSource;

    fn redirect_url(&self) -> &RedirectUrl {
        &self.redirect_url
    }

    fn redirect_to_auth_url(&self) -> Result<AuthRedirect, CallbackError> {
        let state = random_string(FLOW_SECRET_BYTES)
            .map_err(|source| CallbackError::RandomGeneration { source })?;
        let nonce = random_string(FLOW_SECRET_BYTES)
            .map_err(|source| CallbackError::RandomGeneration { source })?;

        let mut request = self.client.authorize_url(
            CoreAuthenticationFlow::AuthorizationCode,
            {
                let state = state.clone();
                move || CsrfToken::new(state)
            },
            {
                let nonce = nonce.clone();
                move || Nonce::new(nonce)
            },
        );
        for scope in &self.scopes {
            request = request.add_scope(scope.clone());
        }
        let (auth_url, _, _) = request.url();

        Ok(AuthRedirect::new(state.clone(), auth_url)
            .with_cookie(cookies::flow_cookie(
                STATE_COOKIE,
                &state,
                self.secure_cookies,
            ))
            .with_cookie(cookies::flow_cookie(
                NONCE_COOKIE,
                &nonce,
                self.secure_cookies,
            )))
    }

    async fn handle_auth_code(
        &self,
        headers: &HeaderMap,
        params: &CallbackParams,
    ) -> Result<(String, IdTokenSource), CallbackError> {
        let (state, code) = check_callback(headers, params)?;

        let response = self
            .client
            .exchange_code(code)
            .map_err(CallbackError::exchange)?
            .request_async(&self.provider.http)
            .await
            .map_err(CallbackError::exchange)?;

        let raw = response
            .id_token()
            .and_then(id_token_string)
            .ok_or(CallbackError::MissingIdToken)?;
        let verifier = self.provider.verifier();
        let verified = verifier
            .verify_exchange(&raw, response.access_token())
            .map_err(|source| CallbackError::InvalidIdToken { source })?;

        let nonce = cookies::find(headers, NONCE_COOKIE).ok_or(CallbackError::MissingNonceCookie)?;
        if verified.nonce() != Some(nonce.as_str()) {
            return Err(CallbackError::NonceMismatch);
        }
        info!(subject = %verified.subject(), email = ?verified.email(), "verified ID token");

        let token = Token::from_response(&response).with_id_token(Some(raw));
        let source = RefreshingTokenSource::new(token, self.provider.refresher());
        Ok((state, IdTokenSource::new(Arc::new(source), verifier)))
    }
}

#[derive(derive_more::Debug)]
struct OidcRefresher {
    #[debug("OidcClient")]
    client: OidcClient,
    #[debug(skip)]
    http: reqwest::Client,
}

#[async_trait]
impl TokenRefresher for OidcRefresher {
    async fn refresh(&self, refresh_token: &RefreshToken) -> Result<Token> {
        let response = self
            .client
            .exchange_refresh_token(refresh_token)
            .std_context("Missing OIDC provider metadata")?
            .request_async(&self.http)
            .await
            .std_context("Failed to refresh tokens")?;
        let id_token = response.id_token().and_then(id_token_string);
        Ok(Token::from_response(&response).with_id_token(id_token))
    }
}
