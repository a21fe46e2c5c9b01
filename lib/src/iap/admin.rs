//! IAM policies of IAP resources through the IAP admin REST API.

use std::sync::Arc;

use n0_error::{Result, StdResultExt};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::json;
use tracing::{debug, info};
use url::Url;

use super::policy::Binding;
use crate::oauthutil::{TokenSource, http_client};

pub const IAP_BASE_URL: &str = "https://iap.googleapis.com/v1/";

/// An IAM policy as returned by `getIamPolicy`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IamPolicy {
    #[serde(default, skip_serializing_if = "is_zero")]
    pub version: i32,
    #[serde(default)]
    pub bindings: Vec<Binding>,
    /// Guards against concurrent updates; sent back unchanged on set.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub etag: String,
}

fn is_zero(version: &i32) -> bool {
    *version == 0
}

impl IamPolicy {
    pub fn from_bindings(bindings: &[Binding]) -> Self {
        Self {
            bindings: bindings.to_vec(),
            ..Default::default()
        }
    }

    /// Adds the members of `bindings` to the roles already present and
    /// appends roles that aren't.
    pub fn merge_bindings(&mut self, bindings: &[Binding]) {
        for binding in bindings {
            match self.bindings.iter_mut().find(|b| b.role == binding.role) {
                Some(existing) => {
                    for member in &binding.members {
                        if !existing.members.contains(member) {
                            existing.members.push(member.clone());
                        }
                    }
                }
                None => self.bindings.push(binding.clone()),
            }
        }
    }
}

/// Reads and writes the IAM policy of IAP resources.
#[derive(derive_more::Debug, Clone)]
pub struct IapPolicyClient {
    #[debug(skip)]
    tokens: Arc<dyn TokenSource>,
    base_url: Url,
    #[debug(skip)]
    http: reqwest::Client,
}

impl IapPolicyClient {
    pub fn new(tokens: Arc<dyn TokenSource>) -> Result<Self> {
        Ok(Self {
            tokens,
            base_url: Url::parse(IAP_BASE_URL).std_context("Invalid IAP URL")?,
            http: http_client()?,
        })
    }

    /// Talks to `base_url` instead of the public endpoint.
    pub fn with_base_url(mut self, base_url: Url) -> Self {
        self.base_url = base_url;
        self
    }

    fn method_url(&self, resource: &str, method: &str) -> Result<Url> {
        if !resource.starts_with("projects/") {
            n0_error::bail_any!("Invalid IAP resource name {resource}");
        }
        self.base_url
            .join(&format!("{resource}:{method}"))
            .with_std_context(|_| format!("Invalid IAP resource name {resource}"))
    }

    async fn call<T: DeserializeOwned>(
        &self,
        resource: &str,
        method: &str,
        body: serde_json::Value,
    ) -> Result<T> {
        let url = self.method_url(resource, method)?;
        let token = self.tokens.token().await?;
        debug!(%url, "calling IAP admin API");
        self.http
            .post(url)
            .header(reqwest::header::AUTHORIZATION, token.authorization())
            .json(&body)
            .send()
            .await
            .with_std_context(|_| format!("Failed to call {method} on {resource}"))?
            .error_for_status()
            .with_std_context(|_| format!("Failed to call {method} on {resource}"))?
            .json()
            .await
            .with_std_context(|_| format!("Failed to parse {method} response"))
    }

    pub async fn get_iam_policy(&self, resource: &str) -> Result<IamPolicy> {
        self.call(resource, "getIamPolicy", json!({})).await
    }

    /// Replaces the policy of `resource` with `policy`.
    pub async fn set_iam_policy(&self, resource: &str, policy: &IamPolicy) -> Result<IamPolicy> {
        self.call(resource, "setIamPolicy", json!({ "policy": policy }))
            .await
    }

    /// Applies `bindings` to `resource`.
    ///
    /// Without `merge` the existing policy is replaced. With `merge` the
    /// current policy is fetched first and `bindings` are added to it.
    pub async fn apply_bindings(
        &self,
        resource: &str,
        bindings: &[Binding],
        merge: bool,
    ) -> Result<IamPolicy> {
        let policy = if merge {
            let mut current = self.get_iam_policy(resource).await?;
            current.merge_bindings(bindings);
            current
        } else {
            IamPolicy::from_bindings(bindings)
        };
        let updated = self.set_iam_policy(resource, &policy).await?;
        info!(%resource, bindings = updated.bindings.len(), "set IAP IAM policy");
        Ok(updated)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use axum::{
        Json, Router,
        extract::State,
        http::{HeaderMap, StatusCode, Uri},
        response::{IntoResponse, Response},
    };
    use serde_json::Value;

    use super::*;
    use crate::oauthutil::{StaticTokenSource, Token};

    const RESOURCE: &str = "projects/dev-foo/iap_web/compute/services/backend-1";

    fn binding(role: &str, members: &[&str]) -> Binding {
        Binding {
            role: role.to_string(),
            members: members.iter().map(|m| m.to_string()).collect(),
        }
    }

    type Stored = Arc<Mutex<IamPolicy>>;

    async fn iap(
        State(stored): State<Stored>,
        uri: Uri,
        headers: HeaderMap,
        Json(body): Json<Value>,
    ) -> Response {
        assert_eq!(headers["authorization"], "Bearer iap-token");
        let prefix = format!("/v1/{RESOURCE}:");
        let Some(method) = uri.path().strip_prefix(&prefix) else {
            return StatusCode::NOT_FOUND.into_response();
        };
        let mut stored = stored.lock().unwrap();
        match method {
            "getIamPolicy" => Json(stored.clone()).into_response(),
            "setIamPolicy" => {
                let policy: IamPolicy = serde_json::from_value(body["policy"].clone()).unwrap();
                if !stored.etag.is_empty() && policy.etag != stored.etag {
                    return StatusCode::CONFLICT.into_response();
                }
                *stored = IamPolicy {
                    etag: "etag-2".to_string(),
                    ..policy
                };
                Json(stored.clone()).into_response()
            }
            _ => StatusCode::NOT_FOUND.into_response(),
        }
    }

    async fn spawn(initial: IamPolicy) -> (IapPolicyClient, Stored, tokio::task::JoinHandle<()>) {
        let stored = Arc::new(Mutex::new(initial));
        let app = Router::new().fallback(iap).with_state(stored.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        let tokens = Arc::new(StaticTokenSource::new(Token::new("iap-token")));
        let client = IapPolicyClient::new(tokens)
            .unwrap()
            .with_base_url(Url::parse(&format!("http://{addr}/v1/")).unwrap());
        (client, stored, server)
    }

    #[test]
    fn merge_adds_members_and_roles() {
        let mut policy = IamPolicy {
            bindings: vec![binding("roles/viewer", &["user:a@example.com"])],
            etag: "e".to_string(),
            ..Default::default()
        };
        policy.merge_bindings(&[
            binding("roles/viewer", &["user:a@example.com", "user:b@example.com"]),
            binding("roles/iap.httpsResourceAccessor", &["group:dev@example.com"]),
        ]);
        assert_eq!(
            policy.bindings,
            vec![
                binding("roles/viewer", &["user:a@example.com", "user:b@example.com"]),
                binding("roles/iap.httpsResourceAccessor", &["group:dev@example.com"]),
            ]
        );
        assert_eq!(policy.etag, "e");
    }

    #[tokio::test]
    #[n0_tracing_test::traced_test]
    async fn set_replaces_the_policy() {
        let existing = IamPolicy {
            bindings: vec![binding("roles/viewer", &["user:old@example.com"])],
            ..Default::default()
        };
        let (client, stored, server) = spawn(existing).await;

        let bindings = [binding(
            "roles/iap.httpsResourceAccessor",
            &["group:gcp-developers@fooai.com"],
        )];
        let updated = client.apply_bindings(RESOURCE, &bindings, false).await.unwrap();
        assert_eq!(updated.bindings, bindings.to_vec());
        assert_eq!(stored.lock().unwrap().bindings, bindings.to_vec());

        let fetched = client.get_iam_policy(RESOURCE).await.unwrap();
        assert_eq!(fetched, updated);
        server.abort();
    }

    #[tokio::test]
    #[n0_tracing_test::traced_test]
    async fn merge_keeps_existing_bindings_and_etag() {
        let existing = IamPolicy {
            version: 1,
            bindings: vec![binding("roles/viewer", &["user:old@example.com"])],
            etag: "etag-1".to_string(),
        };
        let (client, stored, server) = spawn(existing).await;

        let bindings = [binding("roles/viewer", &["user:new@example.com"])];
        client.apply_bindings(RESOURCE, &bindings, true).await.unwrap();

        let stored = stored.lock().unwrap().clone();
        assert_eq!(
            stored.bindings,
            vec![binding("roles/viewer", &["user:old@example.com", "user:new@example.com"])]
        );
        assert_eq!(stored.version, 1);
        server.abort();
    }

    #[tokio::test]
    async fn rejects_malformed_resource_names() {
        let tokens = Arc::new(StaticTokenSource::new(Token::new("iap-token")));
        let client = IapPolicyClient::new(tokens).unwrap();
        assert!(client.get_iam_policy("backend-1").await.is_err());
        assert!(client.method_url("nope:x", "getIamPolicy").is_err());
        assert_eq!(
            client.method_url(RESOURCE, "getIamPolicy").unwrap().as_str(),
            format!("{IAP_BASE_URL}{RESOURCE}:getIamPolicy")
        );
    }
}
