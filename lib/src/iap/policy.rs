//! IAP app policies, modeled on Config Connector's `IAMPolicy`.

use std::path::Path;

use n0_error::{Result, StackResultExt, StdResultExt, anyerr, stack_error};
use serde::{Deserialize, Serialize};
use tracing::info;

use super::resolver::{
    BackendServiceLister, backend_iap_name, gcp_backend, gcp_backend_from_service,
};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IapAppPolicy {
    #[serde(default)]
    pub kind: String,
    pub spec: Policy,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Policy {
    pub resource_ref: ResourceRef,
    #[serde(default)]
    pub bindings: Vec<Binding>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceRef {
    /// Full IAP resource name, e.g.
    /// `projects/{project}/iap_web/compute/services/{backend}`.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub external: String,
    /// A Kubernetes service from which the backend is computed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_ref: Option<ServiceRef>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceRef {
    pub project: String,
    pub service: String,
    /// Not needed for services exposed through a gateway.
    #[serde(default)]
    pub ingress: String,
    pub namespace: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Binding {
    pub role: String,
    #[serde(default)]
    pub members: Vec<String>,
}

#[stack_error(derive)]
#[error("Exactly one of external and serviceRef must be set")]
pub struct InvalidResourceRef;

impl IapAppPolicy {
    pub fn from_yaml(data: &str) -> Result<Self> {
        serde_yml::from_str(data).std_context("Failed to parse IAPAppPolicy")
    }

    pub async fn from_file(path: &Path) -> Result<Self> {
        let data = tokio::fs::read_to_string(path)
            .await
            .with_std_context(|_| format!("Failed to read IAPAppPolicy from {}", path.display()))?;
        Self::from_yaml(&data)
    }

    pub fn validate(&self) -> Result<(), InvalidResourceRef> {
        let external_set = !self.spec.resource_ref.external.is_empty();
        let service_set = self.spec.resource_ref.service_ref.is_some();
        if external_set == service_set {
            return Err(InvalidResourceRef);
        }
        Ok(())
    }

    pub fn is_valid(&self) -> bool {
        self.validate().is_ok()
    }

    /// The explicitly named IAP resource, if the policy has one.
    pub fn external(&self) -> Option<&str> {
        Some(self.spec.resource_ref.external.as_str()).filter(|external| !external.is_empty())
    }

    /// The IAP resource this policy applies to.
    pub async fn resolve_resource(
        &self,
        client: &kube::Client,
        lister: &dyn BackendServiceLister,
    ) -> Result<String> {
        self.validate()?;
        if let Some(external) = self.external() {
            return Ok(external.to_string());
        }
        self.spec
            .resource_ref
            .service_ref
            .as_ref()
            .context("Policy has no serviceRef")?
            .resolve(client, lister)
            .await
    }
}

impl ServiceRef {
    /// The IAP resource of the backend serving this service.
    ///
    /// Goes through the ingress backends annotation when an ingress is named,
    /// and through the service's NEG otherwise.
    pub async fn resolve(
        &self,
        client: &kube::Client,
        lister: &dyn BackendServiceLister,
    ) -> Result<String> {
        let ServiceRef {
            project,
            service,
            ingress,
            namespace,
        } = self;

        let backend = if ingress.is_empty() {
            let negs =
                gcp_backend_from_service(client, lister, project, namespace, service).await?;
            let mut negs = negs.into_iter();
            let (neg, backend) = match (negs.next(), negs.next()) {
                (Some(only), None) => only,
                (None, _) => n0_error::bail_any!("No NEG found for service {namespace}/{service}"),
                (Some(_), Some(_)) => {
                    n0_error::bail_any!("Multiple NEG found for service {namespace}/{service}")
                }
            };
            backend.ok_or_else(|| anyerr!("No backend service routes to NEG {neg}"))?
        } else {
            gcp_backend(client, namespace, service, ingress).await?
        };
        let resource = backend_iap_name(project, &backend);
        info!(%resource, "resolved IAP resource");
        Ok(resource)
    }
}
