//! The two HTTP-facing steps of the authorization-code grant.

use std::sync::Arc;

use async_trait::async_trait;
use axum::{
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use cookie::Cookie;
use n0_error::{Result, StackResultExt, StdResultExt};
use oauth2::basic::BasicClient;
use openidconnect::{
    AuthUrl, AuthorizationCode, CsrfToken, RedirectUrl, RefreshToken, Scope, TokenUrl,
};
use serde::Deserialize;
use snafu::Snafu;
use tracing::{debug, warn};
use url::Url;

use super::{
    cookies::{self, STATE_COOKIE},
    credentials::ClientCredentials,
    http_client,
    oidc::VerifyError,
    token::{RefreshingTokenSource, Token, TokenRefresher},
    types::OAuthClient,
};
use crate::util::random_string;

/// Bytes of entropy in the `state` and `nonce` values.
pub(crate) const FLOW_SECRET_BYTES: usize = 16;

type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Query parameters the identity provider sends to the redirect URL.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CallbackParams {
    pub state: Option<String>,
    pub code: Option<String>,
    pub error: Option<String>,
    pub error_description: Option<String>,
}

/// Protocol failures while starting or finishing a flow. None of them are retried.
#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum CallbackError {
    #[snafu(display("Failed to generate random value"))]
    RandomGeneration { source: std::io::Error },
    #[snafu(display("State cookie not found"))]
    MissingStateCookie,
    #[snafu(display("State did not match"))]
    StateMismatch,
    #[snafu(display("Identity provider returned error {error}: {description}"))]
    Provider { error: String, description: String },
    #[snafu(display("Callback is missing the authorization code"))]
    MissingCode,
    #[snafu(display("Failed to exchange authorization code"))]
    Exchange { source: BoxError },
    #[snafu(display("Token response did not include an ID token"))]
    MissingIdToken,
    #[snafu(display("ID token is invalid"))]
    InvalidIdToken { source: VerifyError },
    #[snafu(display("Nonce cookie not found"))]
    MissingNonceCookie,
    #[snafu(display("Nonce did not match"))]
    NonceMismatch,
}

impl CallbackError {
    pub fn status(&self) -> StatusCode {
        match self {
            CallbackError::MissingStateCookie
            | CallbackError::StateMismatch
            | CallbackError::Provider { .. }
            | CallbackError::MissingCode
            | CallbackError::MissingNonceCookie
            | CallbackError::NonceMismatch => StatusCode::BAD_REQUEST,
            CallbackError::RandomGeneration { .. }
            | CallbackError::Exchange { .. }
            | CallbackError::MissingIdToken
            | CallbackError::InvalidIdToken { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Plain-text response for the browser.
    pub fn response(&self) -> Response {
        (self.status(), self.to_string()).into_response()
    }

    pub(crate) fn exchange(source: impl std::error::Error + Send + Sync + 'static) -> Self {
        CallbackError::Exchange {
            source: Box::new(source),
        }
    }
}

/// Redirect to the identity provider, carrying the flow cookies.
#[derive(Debug)]
pub struct AuthRedirect {
    state: String,
    location: Url,
    cookies: Vec<Cookie<'static>>,
}

impl AuthRedirect {
    pub(crate) fn new(state: String, location: Url) -> Self {
        Self {
            state,
            location,
            cookies: Vec::new(),
        }
    }

    pub(crate) fn with_cookie(mut self, cookie: Cookie<'static>) -> Self {
        self.cookies.push(cookie);
        self
    }

    /// The `state` value, for correlating the callback with this request.
    pub fn state(&self) -> &str {
        &self.state
    }

    pub fn location(&self) -> &Url {
        &self.location
    }

    pub fn cookies(&self) -> &[Cookie<'static>] {
        &self.cookies
    }
}

impl IntoResponse for AuthRedirect {
    fn into_response(self) -> Response {
        found(self.location.as_str(), &self.cookies)
    }
}

/// `302 Found` to `location`, setting `cookies`.
pub(crate) fn found(location: &str, cookies: &[Cookie<'_>]) -> Response {
    let mut headers = HeaderMap::new();
    match HeaderValue::from_str(location) {
        Ok(value) => {
            headers.insert(header::LOCATION, value);
        }
        Err(err) => {
            warn!(%location, "Invalid redirect location: {err}");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    }
    for cookie in cookies {
        match HeaderValue::from_str(&cookie.to_string()) {
            Ok(value) => {
                headers.append(header::SET_COOKIE, value);
            }
            Err(err) => warn!(name = %cookie.name(), "Skipping invalid cookie: {err}"),
        }
    }
    (StatusCode::FOUND, headers).into_response()
}

/// An authorization-code flow that can be served from a local HTTP server.
#[async_trait]
pub trait AuthCodeFlow: Send + Sync + 'static {
    /// What a completed flow hands to the caller.
    type Source: Send + 'static;

    /// Where the provider sends the browser after consent.
    fn redirect_url(&self) -> &RedirectUrl;

    /// Generates `state` (and a nonce where applicable), sets them as cookies
    /// and redirects to the provider.
    fn redirect_to_auth_url(&self) -> Result<AuthRedirect, CallbackError>;

    /// Validates the callback and exchanges the code. Returns the `state` of
    /// the request that started the flow.
    async fn handle_auth_code(
        &self,
        headers: &HeaderMap,
        params: &CallbackParams,
    ) -> Result<(String, Self::Source), CallbackError>;
}

/// Checks the `state` cookie against the callback and extracts the code.
///
/// Runs before any network call is made.
pub(crate) fn check_callback(
    headers: &HeaderMap,
    params: &CallbackParams,
) -> Result<(String, AuthorizationCode), CallbackError> {
    let expected = cookies::find(headers, STATE_COOKIE).ok_or(CallbackError::MissingStateCookie)?;
    if params.state.as_deref() != Some(expected.as_str()) {
        return Err(CallbackError::StateMismatch);
    }
    if let Some(error) = &params.error {
        return Err(CallbackError::Provider {
            error: error.clone(),
            description: params.error_description.clone().unwrap_or_default(),
        });
    }
    let code = params
        .code
        .as_deref()
        .filter(|code| !code.is_empty())
        .ok_or(CallbackError::MissingCode)?;
    Ok((expected, AuthorizationCode::new(code.to_string())))
}

/// Plain OAuth2 flow without an identity token.
#[derive(derive_more::Debug, Clone)]
pub struct OAuthHandlers {
    #[debug("OAuthClient")]
    client: OAuthClient,
    redirect_url: RedirectUrl,
    scopes: Vec<Scope>,
    #[debug(skip)]
    http: reqwest::Client,
    secure_cookies: bool,
}

impl OAuthHandlers {
    pub fn new(
        credentials: &ClientCredentials,
        redirect_url: RedirectUrl,
        scopes: impl IntoIterator<Item = String>,
    ) -> Result<Self> {
        let auth_uri = credentials
            .auth_uri
            .clone()
            .context("Client credentials are missing auth_uri")?;
        let token_uri = credentials
            .token_uri
            .clone()
            .context("Client credentials are missing token_uri")?;
        let mut client = BasicClient::new(credentials.client_id())
            .set_auth_uri(AuthUrl::new(auth_uri).std_context("Invalid auth_uri")?)
            .set_token_uri(TokenUrl::new(token_uri).std_context("Invalid token_uri")?)
            .set_redirect_uri(redirect_url.clone());
        if let Some(secret) = credentials.client_secret() {
            client = client.set_client_secret(secret);
        }
        Ok(Self {
            client,
            redirect_url,
            scopes: scopes.into_iter().map(Scope::new).collect(),
            http: http_client()?,
            secure_cookies: false,
        })
    }

    pub fn with_secure_cookies(mut self, secure: bool) -> Self {
        self.secure_cookies = secure;
        self
    }

    pub fn refresher(&self) -> Arc<dyn TokenRefresher> {
        Arc::new(OAuthRefresher {
            client: self.client.clone(),
            http: self.http.clone(),
        })
    }
}

#[async_trait]
impl AuthCodeFlow for OAuthHandlers {
    type Source = RefreshingTokenSource;

    fn redirect_url(&self) -> &RedirectUrl {
        &self.redirect_url
    }

    fn redirect_to_auth_url(&self) -> Result<AuthRedirect, CallbackError> {
        let state = random_string(FLOW_SECRET_BYTES)
            .map_err(|source| CallbackError::RandomGeneration { source })?;
        let csrf = state.clone();
        let (auth_url, _) = self
            .client
            .authorize_url(move || CsrfToken::new(csrf))
            .add_scopes(self.scopes.iter().cloned())
            .url();
        Ok(AuthRedirect::new(state.clone(), auth_url).with_cookie(cookies::flow_cookie(
            STATE_COOKIE,
            &state,
            self.secure_cookies,
        )))
    }

    async fn handle_auth_code(
        &self,
        headers: &HeaderMap,
        params: &CallbackParams,
    ) -> Result<(String, RefreshingTokenSource), CallbackError> {
        let (state, code) = check_callback(headers, params)?;
        let response = self
            .client
            .exchange_code(code)
            .request_async(&self.http)
            .await
            .map_err(CallbackError::exchange)?;
        debug!("exchanged authorization code");
        let token = Token::from_response(&response);
        Ok((state, RefreshingTokenSource::new(token, self.refresher())))
    }
}

#[derive(derive_more::Debug)]
struct OAuthRefresher {
    #[debug("OAuthClient")]
    client: OAuthClient,
    #[debug(skip)]
    http: reqwest::Client,
}

#[async_trait]
impl TokenRefresher for OAuthRefresher {
    async fn refresh(&self, refresh_token: &RefreshToken) -> Result<Token> {
        let response = self
            .client
            .exchange_refresh_token(refresh_token)
            .request_async(&self.http)
            .await
            .std_context("Failed to refresh tokens")?;
        Ok(Token::from_response(&response))
    }
}
