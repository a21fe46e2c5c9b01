//! Kubernetes client construction.

use std::path::{Path, PathBuf};

use kube::config::{KubeConfigOptions, Kubeconfig, NamedContext};
use n0_error::{Result, StackResultExt, StdResultExt, anyerr};
use tracing::{debug, info};

/// `~/.kube/config`, if there is a home directory.
pub fn default_kubeconfig() -> Option<PathBuf> {
    dirs_next::home_dir().map(|home| home.join(".kube").join("config"))
}

/// The kubeconfig file to edit: `explicit`, else the first entry of
/// `KUBECONFIG`, else `~/.kube/config`.
pub fn kubeconfig_path(explicit: Option<&Path>) -> Result<PathBuf> {
    if let Some(path) = explicit {
        return Ok(path.to_path_buf());
    }
    if let Some(paths) = std::env::var_os("KUBECONFIG") {
        if let Some(first) = std::env::split_paths(&paths).find(|p| !p.as_os_str().is_empty()) {
            return Ok(first);
        }
    }
    default_kubeconfig().context("Could not determine the kubeconfig location")
}

/// Adds a context that copies the current one with `namespace` set.
///
/// The context is named `name`, or after the namespace when no name is given.
/// An existing context of that name is an error.
pub async fn create_context(
    path: &Path,
    name: Option<&str>,
    namespace: &str,
) -> Result<NamedContext> {
    let mut config = Kubeconfig::read_from(path)
        .with_std_context(|_| format!("Failed to read kubeconfig {}", path.display()))?;
    let current = config
        .current_context
        .clone()
        .filter(|current| !current.is_empty())
        .ok_or_else(|| anyerr!("current-context is not set"))?;
    debug!(%current, "starting with context");
    let mut context = config
        .contexts
        .iter()
        .find(|named| named.name == current)
        .and_then(|named| named.context.clone())
        .ok_or_else(|| anyerr!("Current context {current} doesn't exist"))?;

    let name = name
        .filter(|name| !name.is_empty())
        .unwrap_or(namespace)
        .to_string();
    if config.contexts.iter().any(|named| named.name == name) {
        n0_error::bail_any!("Context with name {name} already exists");
    }
    context.namespace = Some(namespace.to_string());
    let named = NamedContext {
        name,
        context: Some(context),
    };
    config.contexts.push(named.clone());

    let data = serde_yml::to_string(&config).std_context("Failed to serialize kubeconfig")?;
    tokio::fs::write(path, data)
        .await
        .with_std_context(|_| format!("Failed to write kubeconfig {}", path.display()))?;
    info!(name = %named.name, %namespace, "created context");
    Ok(named)
}

/// Builds a client from `kubeconfig`, or from the environment when no file is
/// given (in-cluster config, `KUBECONFIG`, then the default kubeconfig).
pub async fn client(kubeconfig: Option<&Path>, context: Option<&str>) -> Result<kube::Client> {
    let config = match kubeconfig {
        Some(path) => {
            let kubeconfig = Kubeconfig::read_from(path).with_std_context(|_| {
                format!("Failed to build config from file {}", path.display())
            })?;
            let options = KubeConfigOptions {
                context: context.map(str::to_string),
                ..Default::default()
            };
            debug!(path = %path.display(), ?context, "loading kubeconfig");
            kube::Config::from_custom_kubeconfig(kubeconfig, &options)
                .await
                .with_std_context(|_| {
                    format!("Failed to build config from file {}", path.display())
                })?
        }
        None => {
            let options = KubeConfigOptions {
                context: context.map(str::to_string),
                ..Default::default()
            };
            match context {
                Some(_) => kube::Config::from_kubeconfig(&options)
                    .await
                    .std_context("Failed to load kubeconfig")?,
                None => kube::Config::infer()
                    .await
                    .std_context("Failed to infer kubernetes config")?,
            }
        }
    };
    kube::Client::try_from(config).std_context("Failed to create kubernetes client")
}
