//! On-disk token cache and the login helper built on it.

use std::{
    io,
    path::{Path, PathBuf},
    sync::Arc,
};

use async_trait::async_trait;
use n0_error::{Result, StackResultExt, StdResultExt};
use tracing::{debug, info, warn};

use super::{
    oidc::{IdTokenSource, OidcProvider},
    token::{RefreshingTokenSource, Token, TokenSource},
    webflow::{BrowserOpener, WebFlowServer, WebFlowTimeouts, free_loopback_port, loopback_redirect_url},
};

#[async_trait]
pub trait TokenCache: Send + Sync {
    /// Returns `None` if nothing was cached yet.
    async fn load(&self) -> Result<Option<Token>>;
    async fn save(&self, token: &Token) -> Result<()>;
}

/// Stores a token as JSON, readable only by the current user.
#[derive(Debug, Clone)]
pub struct FileTokenCache {
    path: PathBuf,
}

impl FileTokenCache {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl TokenCache for FileTokenCache {
    async fn load(&self) -> Result<Option<Token>> {
        let data = match tokio::fs::read(&self.path).await {
            Ok(data) => data,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(err).with_std_context(|_| {
                    format!("Failed to read token cache {}", self.path.display())
                });
            }
        };
        let token = serde_json::from_slice(&data)
            .with_std_context(|_| format!("Failed to parse token cache {}", self.path.display()))?;
        Ok(Some(token))
    }

    async fn save(&self, token: &Token) -> Result<()> {
        if let Some(dir) = self.path.parent() {
            create_private_dir(dir)
                .await
                .with_std_context(|_| format!("Failed to create directory {}", dir.display()))?;
        }
        let data = serde_json::to_vec_pretty(token).anyerr()?;
        write_private_file(&self.path, &data)
            .await
            .with_std_context(|_| format!("Failed to write token cache {}", self.path.display()))?;
        debug!(path = %self.path.display(), "cached token");
        Ok(())
    }
}

#[cfg(unix)]
async fn create_private_dir(dir: &Path) -> io::Result<()> {
    let mut builder = tokio::fs::DirBuilder::new();
    builder.recursive(true).mode(0o700);
    builder.create(dir).await
}

#[cfg(not(unix))]
async fn create_private_dir(dir: &Path) -> io::Result<()> {
    tokio::fs::create_dir_all(dir).await
}

#[cfg(unix)]
async fn write_private_file(path: &Path, data: &[u8]) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    use tokio::io::AsyncWriteExt;

    let mut file = tokio::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)
        .await?;
    file.write_all(data).await?;
    file.flush().await?;
    // `mode` only applies to newly created files.
    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)).await
}

#[cfg(not(unix))]
async fn write_private_file(path: &Path, data: &[u8]) -> io::Result<()> {
    tokio::fs::write(path, data).await
}

/// Returns an [`IdTokenSource`] from the cache when possible and runs the
/// browser flow otherwise.
#[derive(derive_more::Debug)]
pub struct CachedOidcLogin {
    provider: OidcProvider,
    cache: Arc<FileTokenCache>,
    scopes: Vec<String>,
    port: u16,
    timeouts: WebFlowTimeouts,
    #[debug(skip)]
    opener: Option<BrowserOpener>,
}

impl CachedOidcLogin {
    pub fn new(provider: OidcProvider, cache: FileTokenCache) -> Self {
        Self {
            provider,
            cache: Arc::new(cache),
            scopes: super::default_scopes(),
            port: 0,
            timeouts: WebFlowTimeouts::default(),
            opener: None,
        }
    }

    pub fn with_scopes(mut self, scopes: Vec<String>) -> Self {
        self.scopes = scopes;
        self
    }

    /// Port for the loopback server. 0 picks a free one.
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_timeouts(mut self, timeouts: WebFlowTimeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    pub fn with_browser_opener(mut self, opener: BrowserOpener) -> Self {
        self.opener = Some(opener);
        self
    }

    fn source_for(&self, token: Token) -> IdTokenSource {
        let source = RefreshingTokenSource::new(token, self.provider.refresher())
            .with_cache(self.cache.clone());
        self.provider.id_token_source(Arc::new(source))
    }

    /// A source backed by the cached token, if that token is still valid or
    /// can be refreshed and yields a verified ID token.
    pub async fn cached(&self) -> Result<Option<IdTokenSource>> {
        let Some(token) = self.cache.load().await? else {
            debug!("no cached token");
            return Ok(None);
        };
        if !token.is_valid() && token.refresh_token.is_none() {
            debug!("cached token expired and can't be refreshed");
            return Ok(None);
        }
        let source = self.source_for(token);
        match source.id_token().await {
            Ok(id_token) => {
                debug!(email = ?id_token.email(), "using cached token");
                Ok(Some(source))
            }
            Err(err) => {
                warn!("Ignoring cached token: {err:#}");
                Ok(None)
            }
        }
    }

    pub async fn token_source(&self) -> Result<IdTokenSource> {
        if let Some(source) = self.cached().await? {
            return Ok(source);
        }

        let port = match self.port {
            0 => free_loopback_port()?,
            port => port,
        };
        let handlers = self
            .provider
            .handlers(loopback_redirect_url(port)?, self.scopes.clone());
        let mut server = WebFlowServer::new(handlers)?.with_timeouts(self.timeouts);
        if let Some(opener) = &self.opener {
            server = server.with_browser_opener(opener.clone());
        }
        let source = server.run().await.context("Interactive login failed")?;

        let token = source.access_token_source().token().await?;
        self.cache.save(&token).await?;
        info!(path = %self.cache.path().display(), "login succeeded, token cached");
        Ok(self.source_for(token))
    }
}

#[cfg(test)]
mod tests {
    use chrono::{DurationRound, Utc};

    use super::*;

    #[tokio::test]
    async fn round_trip_preserves_tokens() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let cache = FileTokenCache::new(dir.path().join("nested").join("token.json"));
        assert!(cache.load().await?.is_none());

        let expiry = (Utc::now() + chrono::Duration::hours(1))
            .duration_trunc(chrono::Duration::seconds(1))
            .anyerr()?;
        let token = Token::new("access")
            .with_refresh_token("refresh")
            .with_expiry(expiry)
            .with_id_token(Some("a.b.c".to_string()));
        cache.save(&token).await?;

        let loaded = cache.load().await?.context("token missing")?;
        assert_eq!(loaded.access_token.secret(), "access");
        assert_eq!(
            loaded.refresh_token.as_ref().map(|t| t.secret().as_str()),
            Some("refresh")
        );
        assert_eq!(loaded.expiry, Some(expiry));
        assert_eq!(loaded.id_token.as_deref(), Some("a.b.c"));
        Ok(())
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn cache_is_private() -> Result<()> {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir()?;
        let cache_dir = dir.path().join("cache");
        let cache = FileTokenCache::new(cache_dir.join("token.json"));
        cache.save(&Token::new("access")).await?;

        let dir_mode = std::fs::metadata(&cache_dir)?.permissions().mode() & 0o777;
        let file_mode = std::fs::metadata(cache.path())?.permissions().mode() & 0o777;
        assert_eq!(dir_mode, 0o700);
        assert_eq!(file_mode, 0o600);
        Ok(())
    }

    #[tokio::test]
    async fn corrupt_cache_is_an_error() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("token.json");
        tokio::fs::write(&path, b"{").await?;
        assert!(FileTokenCache::new(path).load().await.is_err());
        Ok(())
    }
}
