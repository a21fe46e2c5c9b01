//! Inspecting JWTs.

use data_encoding::BASE64URL_NOPAD;
use n0_error::{Result, StackResultExt, StdResultExt, anyerr};
use openidconnect::{
    ClientId, IssuerUrl, JsonWebKeySetUrl,
    core::{CoreIdTokenVerifier, CoreJsonWebKeySet},
};
use serde::{Serialize, de::DeserializeOwned};
use serde_json::Value;

use crate::oauthutil::oidc::{accept_any_nonce, parse_id_token};

/// Keys for Google-issued ID tokens.
pub const GOOGLE_JWKS_URL: &str = "https://www.googleapis.com/oauth2/v3/certs";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DecodedJwt {
    pub header: Value,
    pub claims: Value,
}

fn segments(jwt: &str) -> Result<(&str, &str)> {
    let mut parts = jwt.trim().split('.');
    match (parts.next(), parts.next(), parts.next(), parts.next()) {
        (Some(header), Some(claims), Some(_signature), None) => Ok((header, claims)),
        _ => Err(anyerr!("JWT must have three dot separated segments")),
    }
}

fn decode_segment<T: DeserializeOwned>(segment: &str) -> Result<T> {
    let bytes = BASE64URL_NOPAD
        .decode(segment.trim_end_matches('=').as_bytes())
        .std_context("JWT segment is not base64url")?;
    serde_json::from_slice(&bytes).std_context("JWT segment is not JSON")
}

/// Decodes header and claims without checking the signature.
pub fn decode_unverified(jwt: &str) -> Result<DecodedJwt> {
    let (header, claims) = segments(jwt)?;
    Ok(DecodedJwt {
        header: decode_segment(header)?,
        claims: decode_segment(claims)?,
    })
}

/// Decodes the claims without checking the signature.
pub fn decode_claims<T: DeserializeOwned>(jwt: &str) -> Result<T> {
    let (_, claims) = segments(jwt)?;
    decode_segment(claims)
}

/// Verifies the signature of `jwt` with the keys at `jwks_url` and decodes it.
///
/// Issuer and audience are taken from the token itself, so this only proves
/// who signed it.
pub async fn verify_with_jwks(
    jwt: &str,
    jwks_url: &str,
    http: &reqwest::Client,
) -> Result<DecodedJwt> {
    let decoded = decode_unverified(jwt)?;
    let issuer = decoded
        .claims
        .get("iss")
        .and_then(Value::as_str)
        .context("JWT has no iss claim")?;
    let audience = match decoded.claims.get("aud") {
        Some(Value::String(audience)) => audience.clone(),
        Some(Value::Array(audiences)) => audiences
            .first()
            .and_then(Value::as_str)
            .context("JWT has an empty aud claim")?
            .to_string(),
        _ => n0_error::bail_any!("JWT has no aud claim"),
    };

    let jwks_url = JsonWebKeySetUrl::new(jwks_url.to_string()).std_context("Invalid JWKS URL")?;
    let jwks = CoreJsonWebKeySet::fetch_async(&jwks_url, http)
        .await
        .with_std_context(|_| format!("Failed to fetch JWKS from {}", jwks_url.as_str()))?;
    let verifier = CoreIdTokenVerifier::new_public_client(
        ClientId::new(audience),
        IssuerUrl::new(issuer.to_string()).std_context("Invalid iss claim")?,
        jwks,
    )
    .allow_any_alg()
    .set_other_audience_verifier_fn(|_| true);

    let token = parse_id_token(jwt).std_context("Malformed JWT")?;
    token
        .claims(&verifier, accept_any_nonce)
        .std_context("JWT failed verification")?;
    Ok(decoded)
}
