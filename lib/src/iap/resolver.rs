//! Maps Kubernetes services to the GCP backend services that IAP protects.

use std::{collections::BTreeMap, sync::Arc};

use async_trait::async_trait;
use k8s_openapi::api::{core::v1::Service, networking::v1::Ingress};
use kube::{Api, ResourceExt};
use n0_error::{Result, StdResultExt, anyerr};
use serde::Deserialize;
use tracing::{debug, info};
use url::Url;

use crate::oauthutil::{TokenSource, http_client};

pub const BACKENDS_ANNOTATION: &str = "ingress.kubernetes.io/backends";
pub const NEG_ANNOTATION: &str = "cloud.google.com/neg-status";

pub const COMPUTE_BASE_URL: &str = "https://compute.googleapis.com/compute/v1/";

/// The IAP resource name for `backend` in `project`.
pub fn backend_iap_name(project: &str, backend: &str) -> String {
    format!("projects/{project}/iap_web/compute/services/{backend}")
}

/// Fetches the ingress and returns the name of the backend serving `service`.
pub async fn gcp_backend(
    client: &kube::Client,
    namespace: &str,
    service: &str,
    ingress: &str,
) -> Result<String> {
    let api: Api<Ingress> = Api::namespaced(client.clone(), namespace);
    let resource = api
        .get(ingress)
        .await
        .with_std_context(|_| format!("Failed to get ingress: {namespace}.{ingress}"))?;
    gcp_backend_from_ingress(&resource, namespace, service)
}

/// Picks the backend for `service` out of the ingress' backends annotation.
///
/// Backend names embed `-{namespace}-{service}-`; exactly one must match.
pub fn gcp_backend_from_ingress(
    ingress: &Ingress,
    namespace: &str,
    service: &str,
) -> Result<String> {
    let backends_json = ingress
        .annotations()
        .get(BACKENDS_ANNOTATION)
        .ok_or_else(|| {
            let name = ingress.name_any();
            anyerr!("Ingress {namespace}.{name} is missing annotation {BACKENDS_ANNOTATION}")
        })?;
    let backends: BTreeMap<String, String> = serde_json::from_str(backends_json)
        .with_std_context(|_| format!("Could not parse {backends_json} as a map of backends"))?;

    let needle = format!("-{namespace}-{service}-");
    let matches: Vec<&String> = backends.keys().filter(|name| name.contains(&needle)).collect();
    match matches.as_slice() {
        [backend] => Ok(backend.to_string()),
        [] => Err(anyerr!(
            "No backends matched for service {namespace}.{service}; {backends_json}"
        )),
        _ => {
            let names = matches
                .iter()
                .map(|name| name.as_str())
                .collect::<Vec<_>>()
                .join(",");
            Err(anyerr!(
                "Multiple backends matched for service {namespace}.{service}; {names}"
            ))
        }
    }
}

/// The `cloud.google.com/neg-status` annotation of a service.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct NegStatus {
    /// Port to NEG name.
    #[serde(default)]
    pub network_endpoint_groups: BTreeMap<String, String>,
    #[serde(default)]
    pub zones: Vec<String>,
}

impl NegStatus {
    pub fn from_service(service: &Service, namespace: &str) -> Result<Self> {
        let raw = service.annotations().get(NEG_ANNOTATION).ok_or_else(|| {
            let name = service.name_any();
            anyerr!("Service {namespace}.{name} is missing annotation {NEG_ANNOTATION}")
        })?;
        serde_json::from_str(raw).with_std_context(|_| format!("Could not parse {raw} as NegStatus"))
    }

    pub fn neg_names(&self) -> impl Iterator<Item = &str> {
        self.network_endpoint_groups.values().map(String::as_str)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct BackendService {
    pub name: String,
    #[serde(default)]
    pub backends: Vec<Backend>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct Backend {
    /// URL of the instance group or NEG.
    #[serde(default)]
    pub group: Option<String>,
}

/// Lists the backend services of a project.
#[async_trait]
pub trait BackendServiceLister: Send + Sync {
    async fn list(&self, project: &str) -> Result<Vec<BackendService>>;
}

/// Lists backend services through the Compute Engine REST API.
#[derive(derive_more::Debug, Clone)]
pub struct ComputeBackendServices {
    #[debug(skip)]
    tokens: Arc<dyn TokenSource>,
    base_url: Url,
    #[debug(skip)]
    http: reqwest::Client,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BackendServiceList {
    #[serde(default)]
    items: Vec<BackendService>,
    next_page_token: Option<String>,
}

impl ComputeBackendServices {
    pub fn new(tokens: Arc<dyn TokenSource>) -> Result<Self> {
        Ok(Self {
            tokens,
            base_url: Url::parse(COMPUTE_BASE_URL).std_context("Invalid compute URL")?,
            http: http_client()?,
        })
    }

    /// Talks to `base_url` instead of the public endpoint.
    pub fn with_base_url(mut self, base_url: Url) -> Self {
        self.base_url = base_url;
        self
    }

    fn list_url(&self, project: &str) -> Result<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| anyerr!("Compute base URL can't have path segments"))?
            .pop_if_empty()
            .extend(["projects", project, "global", "backendServices"]);
        Ok(url)
    }
}

#[async_trait]
impl BackendServiceLister for ComputeBackendServices {
    async fn list(&self, project: &str) -> Result<Vec<BackendService>> {
        let url = self.list_url(project)?;
        let mut services = Vec::new();
        let mut page_token: Option<String> = None;
        loop {
            let token = self.tokens.token().await?;
            let mut request = self
                .http
                .get(url.clone())
                .header(reqwest::header::AUTHORIZATION, token.authorization());
            if let Some(page_token) = &page_token {
                request = request.query(&[("pageToken", page_token)]);
            }
            let page: BackendServiceList = request
                .send()
                .await
                .std_context("Failed to list backend services")?
                .error_for_status()
                .std_context("Failed to list backend services")?
                .json()
                .await
                .std_context("Failed to parse backend services")?;
            services.extend(page.items);
            match page.next_page_token {
                Some(next) if !next.is_empty() => page_token = Some(next),
                _ => break,
            }
        }
        debug!(%project, count = services.len(), "listed backend services");
        Ok(services)
    }
}

/// The NEG named by a backend group URL, if the group is a NEG.
fn neg_name(group: &str) -> Result<Option<String>> {
    let url = Url::parse(group)
        .with_std_context(|_| format!("Failed to parse backend group url {group}"))?;
    let segments: Vec<&str> = url.path().split('/').collect();
    match segments.as_slice() {
        [.., kind, name] if *kind == "networkEndpointGroups" => Ok(Some(name.to_string())),
        _ => Ok(None),
    }
}

/// Maps each NEG to the backend service that routes to it, `None` when no
/// backend does.
pub fn match_negs_to_backends<'a>(
    negs: impl IntoIterator<Item = &'a str>,
    services: &[BackendService],
) -> Result<BTreeMap<String, Option<String>>> {
    let mut neg_to_backend: BTreeMap<String, Option<String>> =
        negs.into_iter().map(|neg| (neg.to_string(), None)).collect();
    for service in services {
        for group in service.backends.iter().filter_map(|b| b.group.as_deref()) {
            let Some(neg) = neg_name(group)? else {
                continue;
            };
            if let Some(backend) = neg_to_backend.get_mut(&neg) {
                if backend.is_some() {
                    n0_error::bail_any!("Found multiple backends for neg {neg}");
                }
                *backend = Some(service.name.clone());
            }
        }
    }
    Ok(neg_to_backend)
}

/// Resolves the backend services of `service` through its NEGs.
///
/// Returns a map from NEG name to backend service name. A service has one
/// NEG per exposed port.
pub async fn gcp_backend_from_service(
    client: &kube::Client,
    lister: &dyn BackendServiceLister,
    project: &str,
    namespace: &str,
    service: &str,
) -> Result<BTreeMap<String, Option<String>>> {
    if service.is_empty() {
        n0_error::bail_any!("service name cannot be empty");
    }
    if namespace.is_empty() {
        n0_error::bail_any!("namespace cannot be empty");
    }
    let api: Api<Service> = Api::namespaced(client.clone(), namespace);
    let resource = api
        .get(service)
        .await
        .with_std_context(|_| format!("Failed to get service: {namespace}.{service}"))?;
    let status = NegStatus::from_service(&resource, namespace)?;

    let services = lister.list(project).await?;
    for backend in &services {
        info!(name = %backend.name, num_backends = backend.backends.len(), "found backend service");
    }
    match_negs_to_backends(status.neg_names(), &services)
}
