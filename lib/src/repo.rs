use std::path::{Path, PathBuf};

use n0_error::{Result, StackResultExt};
use tracing::{info, warn};

use crate::{config::Config, oauthutil::FileTokenCache};

// Repo builds up a series of file path conventions from a root directory path.
#[derive(Debug, Clone)]
pub struct Repo(PathBuf);

impl Repo {
    const CONFIG_FILE: &str = "config.yml";
    const CLIENT_FILE: &str = "oauth_client.json";
    const ID_TOKEN_CACHE_FILE: &str = "tokens/id_token.json";

    pub fn default_location() -> Result<PathBuf> {
        let dir = dirs_next::config_dir().context("Could not determine the config directory")?;
        Ok(dir.join("devsugar"))
    }

    /// Opens or creates a repo at the given base directory.
    pub async fn open_or_create(base_dir: impl Into<PathBuf>) -> Result<Self> {
        let base_dir = base_dir.into();
        tokio::fs::create_dir_all(&base_dir).await?;
        info!("opening repo at {}", base_dir.display());

        let this = Self(base_dir);

        Ok(this)
    }

    pub fn path(&self) -> &Path {
        &self.0
    }

    /// Loads the config, writing the defaults on first use.
    ///
    /// `oidc.client_file` is made absolute relative to the repo and defaults to
    /// `oauth_client.json` inside it.
    pub async fn config(&self) -> Result<Config> {
        let config_file_path = self.0.join(Self::CONFIG_FILE);
        let mut config = if !config_file_path.exists() {
            warn!("config does not exist. writing defaults");
            let cfg = Config::default();
            cfg.write(config_file_path).await?;
            cfg
        } else {
            Config::from_file(config_file_path).await?
        };

        config.oidc.client_file = Some(match config.oidc.client_file.take() {
            Some(path) if path.is_absolute() => path,
            Some(path) => self.0.join(path),
            None => self.0.join(Self::CLIENT_FILE),
        });
        Ok(config)
    }

    pub fn token_cache_path(&self) -> PathBuf {
        self.0.join(Self::ID_TOKEN_CACHE_FILE)
    }

    pub fn token_cache(&self) -> FileTokenCache {
        FileTokenCache::new(self.token_cache_path())
    }
}
