//! Reading and writing files that may live on local disk or in GCS.

use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use async_trait::async_trait;
use n0_error::{Result, StdResultExt, anyerr};
use reqwest::StatusCode;
use tracing::{debug, warn};
use url::Url;

use crate::oauthutil::{TokenSource, http_client};

pub const FILE_SCHEME: &str = "file";
pub const GCS_SCHEME: &str = "gs";

pub const GCS_BASE_URL: &str = "https://storage.googleapis.com/";

/// Transparent access to files on different storage systems.
#[async_trait]
pub trait FileHelper: Send + Sync {
    async fn exists(&self, uri: &str) -> Result<bool>;

    async fn read(&self, uri: &str) -> Result<Vec<u8>>;

    /// Writes `data` to `uri`, truncating an existing file.
    async fn write(&self, uri: &str, data: &[u8]) -> Result<()>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct LocalFileHelper;

impl LocalFileHelper {
    fn path(uri: &str) -> PathBuf {
        local_path(uri).to_path_buf()
    }
}

#[async_trait]
impl FileHelper for LocalFileHelper {
    async fn exists(&self, uri: &str) -> Result<bool> {
        let path = Self::path(uri);
        tokio::fs::try_exists(&path)
            .await
            .with_std_context(|_| format!("Could not stat {}", path.display()))
    }

    async fn read(&self, uri: &str) -> Result<Vec<u8>> {
        let path = Self::path(uri);
        tokio::fs::read(&path)
            .await
            .with_std_context(|_| format!("Could not read: {}", path.display()))
    }

    async fn write(&self, uri: &str, data: &[u8]) -> Result<()> {
        let path = Self::path(uri);
        if let Some(dir) = path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(dir)
                .await
                .with_std_context(|_| format!("Could not create directory: {}", dir.display()))?;
        }
        tokio::fs::write(&path, data)
            .await
            .with_std_context(|_| format!("Could not write: {}", path.display()))
    }
}

/// A `gs://bucket/object` location.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GcsPath {
    pub bucket: String,
    pub path: String,
}

impl GcsPath {
    pub fn parse(uri: &str) -> Result<Self> {
        let rest = uri
            .strip_prefix("gs://")
            .ok_or_else(|| anyerr!("Path {uri} doesn't match gs://bucket/object"))?;
        let (bucket, path) = rest.split_once('/').unwrap_or((rest, ""));
        if bucket.is_empty() {
            n0_error::bail_any!("Path {uri} doesn't name a bucket");
        }
        Ok(Self {
            bucket: bucket.to_string(),
            path: path.to_string(),
        })
    }

    pub fn to_uri(&self) -> String {
        if self.path.is_empty() {
            format!("gs://{}", self.bucket)
        } else {
            format!("gs://{}/{}", self.bucket, self.path)
        }
    }

    /// Appends path elements with a single `/` between each.
    pub fn join<'a>(&self, elems: impl IntoIterator<Item = &'a str>) -> Self {
        let path = std::iter::once(self.path.as_str())
            .chain(elems.into_iter().map(|elem| elem))
            .map(|elem| elem.trim_matches('/'))
            .filter(|elem| !elem.is_empty())
            .collect::<Vec<_>>()
            .join("/");
        Self {
            bucket: self.bucket.clone(),
            path,
        }
    }
}

/// Objects in Google Cloud Storage, through the JSON API.
#[derive(derive_more::Debug, Clone)]
pub struct GcsHelper {
    #[debug(skip)]
    tokens: Arc<dyn TokenSource>,
    base_url: Url,
    #[debug(skip)]
    http: reqwest::Client,
}

impl GcsHelper {
    pub fn new(tokens: Arc<dyn TokenSource>) -> Result<Self> {
        Ok(Self {
            tokens,
            base_url: Url::parse(GCS_BASE_URL).std_context("Invalid GCS URL")?,
            http: http_client()?,
        })
    }

    /// Talks to `base_url` instead of the public endpoint.
    pub fn with_base_url(mut self, base_url: Url) -> Self {
        self.base_url = base_url;
        self
    }

    fn url<'a>(&self, segments: impl IntoIterator<Item = &'a str>) -> Result<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| anyerr!("GCS base URL can't have path segments"))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn object_url(&self, path: &GcsPath) -> Result<Url> {
        if path.path.is_empty() {
            n0_error::bail_any!("{} doesn't name an object", path.to_uri());
        }
        self.url(["storage", "v1", "b", &path.bucket, "o", &path.path])
    }

    async fn get(&self, url: Url) -> Result<reqwest::Response> {
        let token = self.tokens.token().await?;
        self.http
            .get(url)
            .header(reqwest::header::AUTHORIZATION, token.authorization())
            .send()
            .await
            .std_context("GCS request failed")
    }
}

#[async_trait]
impl FileHelper for GcsHelper {
    async fn exists(&self, uri: &str) -> Result<bool> {
        let path = GcsPath::parse(uri)?;
        let response = self.get(self.object_url(&path)?).await?;
        match response.status() {
            StatusCode::NOT_FOUND => Ok(false),
            status if status.is_success() => Ok(true),
            status => Err(anyerr!("Failed to check {uri}: {status}")),
        }
    }

    async fn read(&self, uri: &str) -> Result<Vec<u8>> {
        let path = GcsPath::parse(uri)?;
        let mut url = self.object_url(&path)?;
        url.query_pairs_mut().append_pair("alt", "media");
        let bytes = self
            .get(url)
            .await?
            .error_for_status()
            .with_std_context(|_| format!("Could not read: {uri}"))?
            .bytes()
            .await
            .with_std_context(|_| format!("Could not read: {uri}"))?;
        debug!(%uri, len = bytes.len(), "read object");
        Ok(bytes.to_vec())
    }

    async fn write(&self, uri: &str, data: &[u8]) -> Result<()> {
        let path = GcsPath::parse(uri)?;
        if path.path.is_empty() {
            n0_error::bail_any!("{uri} doesn't name an object");
        }
        let mut url = self.url(["upload", "storage", "v1", "b", &path.bucket, "o"])?;
        url.query_pairs_mut()
            .append_pair("uploadType", "media")
            .append_pair("name", &path.path);
        let token = self.tokens.token().await?;
        self.http
            .post(url)
            .header(reqwest::header::AUTHORIZATION, token.authorization())
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .body(data.to_vec())
            .send()
            .await
            .with_std_context(|_| format!("Could not write: {uri}"))?
            .error_for_status()
            .with_std_context(|_| format!("Could not write: {uri}"))?;
        Ok(())
    }
}

/// Dispatches `gs://` URIs to GCS and everything else to local disk.
#[derive(Debug, Clone, Default)]
pub struct UnionFileHelper {
    local: LocalFileHelper,
    gcs: Option<GcsHelper>,
}

impl UnionFileHelper {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_gcs(mut self, gcs: GcsHelper) -> Self {
        self.gcs = Some(gcs);
        self
    }

    fn helper(&self, uri: &str) -> Result<&dyn FileHelper> {
        if uri.starts_with(&format!("{GCS_SCHEME}://")) {
            match &self.gcs {
                Some(gcs) => Ok(gcs),
                None => {
                    warn!(%uri, "GCS access is not configured");
                    Err(anyerr!("No GCS credentials configured to access {uri}"))
                }
            }
        } else {
            Ok(&self.local)
        }
    }
}

#[async_trait]
impl FileHelper for UnionFileHelper {
    async fn exists(&self, uri: &str) -> Result<bool> {
        self.helper(uri)?.exists(uri).await
    }

    async fn read(&self, uri: &str) -> Result<Vec<u8>> {
        self.helper(uri)?.read(uri).await
    }

    async fn write(&self, uri: &str, data: &[u8]) -> Result<()> {
        self.helper(uri)?.write(uri, data).await
    }
}

/// Reads `uri` from wherever it lives.
pub async fn read_uri(helper: &UnionFileHelper, uri: &str) -> Result<Vec<u8>> {
    helper.read(uri).await
}

/// Local path of a `file://` URI or bare path.
pub fn local_path(uri: &str) -> &Path {
    let path = uri
        .strip_prefix(FILE_SCHEME)
        .and_then(|rest| rest.strip_prefix("://"))
        .unwrap_or(uri);
    Path::new(path)
}
