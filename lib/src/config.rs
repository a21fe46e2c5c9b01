use std::{fs, path::PathBuf};

use n0_error::{Result, StackResultExt, StdResultExt};
use serde::{Deserialize, Serialize};

use crate::oauthutil::{
    self, CachedOidcLogin, ClientCredentials, FileTokenCache, OidcHandlers, OidcProvider,
    WebFlowServer,
    webflow::{free_loopback_port, loopback_redirect_url},
};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct Config {
    #[serde(default)]
    pub oidc: OidcConfig,
    #[serde(default)]
    pub proxy: ProxyConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct OidcConfig {
    /// Issuer used for discovery.
    pub issuer: String,

    /// OAuth client JSON as downloaded from the Google Cloud console.
    ///
    /// Relative paths are resolved against the repo directory.
    pub client_file: Option<PathBuf>,

    pub scopes: Vec<String>,

    /// Port of the loopback redirect server.
    ///
    /// 0 picks a free port, but the redirect URL registered with the provider
    /// may require a fixed one.
    pub port: u16,

    /// Audiences accepted in ID tokens besides our own client id.
    #[serde(default)]
    pub audiences: Vec<String>,
}

impl Default for OidcConfig {
    fn default() -> Self {
        Self {
            issuer: oauthutil::GOOGLE_ISSUER.to_string(),
            client_file: None,
            scopes: oauthutil::default_scopes(),
            port: 0,
            audiences: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct ProxyConfig {
    pub port: u16,
    pub upstream: String,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            port: 9080,
            upstream: oauthutil::proxy::DEFAULT_UPSTREAM.to_string(),
        }
    }
}

impl Config {
    pub async fn from_file(path: PathBuf) -> Result<Self> {
        let config = tokio::fs::read_to_string(path)
            .await
            .context("reading config file")?;
        let config = serde_yml::from_str(&config).std_context("parsing config file")?;
        Ok(config)
    }

    pub async fn write(&self, path: PathBuf) -> Result<()> {
        let data = serde_yml::to_string(self).anyerr()?;
        fs::write(path, data)?;
        Ok(())
    }
}

impl OidcConfig {
    pub async fn client_credentials(&self) -> Result<ClientCredentials> {
        let path = self
            .client_file
            .as_deref()
            .context("No OAuth client file configured (oidc.client_file)")?;
        ClientCredentials::from_file(path).await
    }

    /// Discovers the provider and registers our client with it.
    pub async fn provider(&self) -> Result<OidcProvider> {
        let credentials = self.client_credentials().await?;
        let provider = OidcProvider::discover(
            &self.issuer,
            credentials.client_id(),
            credentials.client_secret(),
        )
        .await?;
        Ok(provider.with_audiences(self.audiences.clone()))
    }

    /// Loopback flow server for an interactive login.
    pub async fn web_flow(&self) -> Result<WebFlowServer<OidcHandlers>> {
        let provider = self.provider().await?;
        let port = match self.port {
            0 => free_loopback_port()?,
            port => port,
        };
        let handlers = provider.handlers(loopback_redirect_url(port)?, self.scopes.clone());
        WebFlowServer::new(handlers)
    }

    /// Login that reuses the token stored in `cache`.
    pub async fn login(&self, cache: FileTokenCache) -> Result<CachedOidcLogin> {
        let provider = self.provider().await?;
        Ok(CachedOidcLogin::new(provider, cache)
            .with_scopes(self.scopes.clone())
            .with_port(self.port))
    }
}
