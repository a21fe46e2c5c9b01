//! OAuth client credentials as downloaded from the Google Cloud console.

use std::path::Path;

use n0_error::{Result, StdResultExt, anyerr};
use openidconnect::{ClientId, ClientSecret};
use serde::Deserialize;

#[derive(derive_more::Debug, Clone, Deserialize)]
pub struct ClientCredentials {
    pub client_id: String,
    #[debug(skip)]
    #[serde(default)]
    pub client_secret: Option<String>,
    #[serde(default)]
    pub project_id: Option<String>,
    #[serde(default)]
    pub auth_uri: Option<String>,
    #[serde(default)]
    pub token_uri: Option<String>,
    #[serde(default)]
    pub redirect_uris: Vec<String>,
}

/// Desktop clients are stored under `installed`, web clients under `web`.
#[derive(Deserialize)]
struct CredentialsFile {
    installed: Option<ClientCredentials>,
    web: Option<ClientCredentials>,
}

impl ClientCredentials {
    pub fn parse(data: &[u8]) -> Result<Self> {
        let file: CredentialsFile =
            serde_json::from_slice(data).std_context("Failed to parse OAuth client credentials")?;
        let credentials = file
            .installed
            .or(file.web)
            .ok_or_else(|| anyerr!("OAuth client credentials have neither an installed nor a web client"))?;
        if credentials.client_id.is_empty() {
            n0_error::bail_any!("OAuth client credentials have an empty client_id");
        }
        Ok(credentials)
    }

    pub async fn from_file(path: &Path) -> Result<Self> {
        let data = tokio::fs::read(path)
            .await
            .with_std_context(|_| format!("Failed to read OAuth client file {}", path.display()))?;
        Self::parse(&data)
    }

    pub fn client_id(&self) -> ClientId {
        ClientId::new(self.client_id.clone())
    }

    pub fn client_secret(&self) -> Option<ClientSecret> {
        self.client_secret.clone().map(ClientSecret::new)
    }
}
