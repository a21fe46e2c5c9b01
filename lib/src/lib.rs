pub mod config;
pub mod files;
pub mod iap;
pub mod jwt;
pub mod k8s;
pub mod oauthutil;
mod repo;
pub mod status;
pub mod util;

pub use config::{Config, OidcConfig, ProxyConfig};
pub use repo::Repo;

#[cfg(test)]
mod tests;
