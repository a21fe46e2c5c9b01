//! Kubernetes secrets holding the OAuth client IAP is configured with.

use std::collections::BTreeMap;

use k8s_openapi::{api::core::v1::Secret, apimachinery::pkg::apis::meta::v1::ObjectMeta};
use kube::{
    Api,
    api::{Patch, PatchParams},
};
use n0_error::{Result, StackResultExt, StdResultExt};
use tracing::info;

use crate::oauthutil::ClientCredentials;

const FIELD_MANAGER: &str = "devsugar";

/// An `Opaque` secret with the `client_id` and `client_secret` keys.
pub fn oauth_client_secret(
    credentials: &ClientCredentials,
    namespace: &str,
    name: &str,
) -> Result<Secret> {
    let client_secret = credentials
        .client_secret
        .clone()
        .filter(|secret| !secret.is_empty())
        .context("OAuth client file has no client_secret")?;
    Ok(Secret {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        },
        string_data: Some(BTreeMap::from([
            ("client_id".to_string(), credentials.client_id.clone()),
            ("client_secret".to_string(), client_secret),
        ])),
        type_: Some("Opaque".to_string()),
        ..Default::default()
    })
}

/// Creates the OAuth client secret, or updates it if it exists.
pub async fn create_secret(
    client: &kube::Client,
    credentials: &ClientCredentials,
    namespace: &str,
    name: &str,
) -> Result<Secret> {
    let secret = oauth_client_secret(credentials, namespace, name)?;
    let api: Api<Secret> = Api::namespaced(client.clone(), namespace);
    let applied = api
        .patch(
            name,
            &PatchParams::apply(FIELD_MANAGER).force(),
            &Patch::Apply(&secret),
        )
        .await
        .with_std_context(|_| format!("Failed to create secret {namespace}.{name}"))?;
    info!(%namespace, %name, "applied OAuth client secret");
    Ok(applied)
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use axum::{
        Router,
        body::Bytes,
        extract::{Query, State},
        http::{HeaderMap, StatusCode, header},
        response::{IntoResponse, Response},
        routing::patch,
    };
    use serde_json::Value;

    use super::*;

    fn credentials(secret: &str) -> ClientCredentials {
        let json = format!(
            r#"{{"web": {{"client_id": "1234.apps.googleusercontent.com", "client_secret": "{secret}"}}}}"#
        );
        ClientCredentials::parse(json.as_bytes()).unwrap()
    }

    #[test]
    fn secret_from_client_file() {
        let secret = oauth_client_secret(&credentials("shh"), "argocd", "iap-oauth").unwrap();
        assert_eq!(secret.metadata.name.as_deref(), Some("iap-oauth"));
        assert_eq!(secret.metadata.namespace.as_deref(), Some("argocd"));
        assert_eq!(secret.type_.as_deref(), Some("Opaque"));
        let data = secret.string_data.unwrap();
        assert_eq!(data["client_id"], "1234.apps.googleusercontent.com");
        assert_eq!(data["client_secret"], "shh");

        assert!(oauth_client_secret(&credentials(""), "argocd", "iap-oauth").is_err());
    }

    #[tokio::test]
    #[n0_tracing_test::traced_test]
    async fn applies_secret_server_side() {
        type Seen = Arc<Mutex<Vec<(String, Value)>>>;

        async fn apply(
            State(seen): State<Seen>,
            Query(query): Query<BTreeMap<String, String>>,
            headers: HeaderMap,
            body: Bytes,
        ) -> Response {
            assert_eq!(query.get("fieldManager").map(String::as_str), Some("devsugar"));
            assert_eq!(query.get("force").map(String::as_str), Some("true"));
            let content_type = headers[header::CONTENT_TYPE].to_str().unwrap().to_string();
            let object: Value = serde_json::from_slice(&body).unwrap();
            seen.lock().unwrap().push((content_type, object));
            (
                StatusCode::OK,
                [(header::CONTENT_TYPE, "application/json")],
                body,
            )
                .into_response()
        }

        let seen: Seen = Default::default();
        let app = Router::new()
            .route("/api/v1/namespaces/argocd/secrets/iap-oauth", patch(apply))
            .with_state(seen.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move { axum::serve(listener, app).await });

        let config = kube::Config::new(format!("http://{addr}").parse().unwrap());
        let client = kube::Client::try_from(config).unwrap();
        let applied = create_secret(&client, &credentials("shh"), "argocd", "iap-oauth")
            .await
            .unwrap();
        assert_eq!(applied.metadata.name.as_deref(), Some("iap-oauth"));

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        let (content_type, object) = &seen[0];
        assert_eq!(content_type, "application/apply-patch+yaml");
        assert_eq!(object["kind"], "Secret");
        assert_eq!(object["stringData"]["client_secret"], "shh");
        server.abort();
    }
}
