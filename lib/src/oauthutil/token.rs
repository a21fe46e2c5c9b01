use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use n0_error::{Result, StackResultExt};
use openidconnect::{AccessToken, OAuth2TokenResponse, RefreshToken};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::cache::TokenCache;

/// Tokens are treated as expired this long before their actual expiry.
const EXPIRY_DELTA: Duration = Duration::from_secs(10);

const BEARER: &str = "Bearer";

/// Tokens issued by the identity provider.
///
/// The JSON layout matches the common OAuth2 token cache format
/// (`access_token`, `token_type`, `refresh_token`, `expiry`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Token {
    pub access_token: AccessToken,
    #[serde(default = "default_token_type")]
    pub token_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<RefreshToken>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiry: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id_token: Option<String>,
}

fn default_token_type() -> String {
    BEARER.to_string()
}

impl Token {
    pub fn new(access_token: impl Into<String>) -> Self {
        Self {
            access_token: AccessToken::new(access_token.into()),
            token_type: default_token_type(),
            refresh_token: None,
            expiry: None,
            id_token: None,
        }
    }

    pub fn from_response<R: OAuth2TokenResponse>(response: &R) -> Self {
        let expiry = response
            .expires_in()
            .and_then(|expires_in| chrono::Duration::from_std(expires_in).ok())
            .map(|expires_in| Utc::now() + expires_in);
        Self {
            access_token: response.access_token().clone(),
            token_type: default_token_type(),
            refresh_token: response.refresh_token().cloned(),
            expiry,
            id_token: None,
        }
    }

    pub fn with_id_token(mut self, id_token: Option<String>) -> Self {
        self.id_token = id_token;
        self
    }

    pub fn with_expiry(mut self, expiry: DateTime<Utc>) -> Self {
        self.expiry = Some(expiry);
        self
    }

    pub fn with_refresh_token(mut self, refresh_token: impl Into<String>) -> Self {
        self.refresh_token = Some(RefreshToken::new(refresh_token.into()));
        self
    }

    /// A token is valid if it has an access token that does not expire within
    /// the next few seconds. Tokens without an expiry never expire.
    pub fn is_valid(&self) -> bool {
        if self.access_token.secret().is_empty() {
            return false;
        }
        match self.expiry {
            None => true,
            Some(expiry) => Utc::now() + EXPIRY_DELTA < expiry,
        }
    }

    /// Value for an `Authorization` header.
    pub fn authorization(&self) -> String {
        format!("{BEARER} {}", self.access_token.secret())
    }
}

#[async_trait]
pub trait TokenSource: Send + Sync {
    async fn token(&self) -> Result<Token>;
}

#[async_trait]
impl<T: TokenSource + ?Sized> TokenSource for Arc<T> {
    async fn token(&self) -> Result<Token> {
        (**self).token().await
    }
}

/// Exchanges a refresh token for fresh tokens at the provider's token endpoint.
#[async_trait]
pub trait TokenRefresher: Send + Sync {
    async fn refresh(&self, refresh_token: &RefreshToken) -> Result<Token>;
}

/// Always returns the same token. An empty access token is an error.
#[derive(Debug, Clone)]
pub struct StaticTokenSource(Token);

impl StaticTokenSource {
    pub fn new(token: Token) -> Self {
        Self(token)
    }
}

#[async_trait]
impl TokenSource for StaticTokenSource {
    async fn token(&self) -> Result<Token> {
        if self.0.access_token.secret().is_empty() {
            n0_error::bail_any!("No access token configured");
        }
        Ok(self.0.clone())
    }
}

/// Returns the current token while it is valid and refreshes it once it expires.
#[derive(derive_more::Debug)]
pub struct RefreshingTokenSource {
    current: Mutex<Token>,
    #[debug(skip)]
    refresher: Arc<dyn TokenRefresher>,
    #[debug(skip)]
    cache: Option<Arc<dyn TokenCache>>,
}

impl RefreshingTokenSource {
    pub fn new(token: Token, refresher: Arc<dyn TokenRefresher>) -> Self {
        Self {
            current: Mutex::new(token),
            refresher,
            cache: None,
        }
    }

    /// Refreshed tokens are written to `cache`.
    pub fn with_cache(mut self, cache: Arc<dyn TokenCache>) -> Self {
        self.cache = Some(cache);
        self
    }
}

#[async_trait]
impl TokenSource for RefreshingTokenSource {
    async fn token(&self) -> Result<Token> {
        let mut current = self.current.lock().await;
        if current.is_valid() {
            return Ok(current.clone());
        }
        let refresh_token = current
            .refresh_token
            .clone()
            .context("Token expired and no refresh token is available")?;
        debug!("Refreshing expired token");
        let mut fresh = self
            .refresher
            .refresh(&refresh_token)
            .await
            .context("Failed to refresh token")?;
        // Providers may omit the refresh token on refresh; keep using the old one.
        if fresh.refresh_token.is_none() {
            fresh.refresh_token = Some(refresh_token);
        }
        if let Some(cache) = &self.cache {
            if let Err(err) = cache.save(&fresh).await {
                warn!("Failed to cache refreshed token: {err:#}");
            }
        }
        *current = fresh.clone();
        Ok(fresh)
    }
}
