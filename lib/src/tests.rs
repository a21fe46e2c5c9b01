use std::{sync::Arc, time::Duration};

use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use n0_error::{Result, StackResultExt, StdResultExt};
use n0_tracing_test::traced_test;
use openidconnect::{ClientId, ClientSecret};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::{
    jwt,
    oauthutil::{
        AuthCodeFlow, BrowserOpener, CachedOidcLogin, CallbackError, CallbackParams,
        FileTokenCache, IdTokenSource, OidcProvider, Proxy, RefreshingTokenSource,
        StaticTokenSource, Token, TokenSource, WebFlowServer, WebFlowTimeouts, default_scopes,
        webflow::{free_loopback_port, loopback_redirect_url},
    },
};

const EMAIL: &str = "dev@example.com";

fn fast_timeouts() -> WebFlowTimeouts {
    WebFlowTimeouts {
        ready: Duration::from_secs(10),
        poll_interval: Duration::from_millis(50),
        completion: Duration::from_secs(10),
    }
}

#[tokio::test]
#[traced_test]
async fn web_flow_logs_in_through_the_browser() -> Result<()> {
    let idp = mock_provider::spawn(EMAIL).await?;
    let provider = idp.provider().await?;
    let handlers = provider.handlers(loopback_redirect_url(free_loopback_port()?)?, default_scopes());

    let (opener, mut pages) = browser::opener();
    let source = WebFlowServer::new(handlers)?
        .with_timeouts(fast_timeouts())
        .with_browser_opener(opener)
        .run()
        .await?;

    let page = pages.recv().await.context("browser never ran")??;
    assert_eq!(page.status, StatusCode::OK);
    assert!(page.body.contains("OAuth flow completed"));

    let id_token = source.id_token().await?;
    assert_eq!(id_token.email(), Some(EMAIL));
    assert_eq!(id_token.subject(), "user-1");
    assert_eq!(idp.code_exchanges(), 1);
    Ok(())
}

#[tokio::test]
#[traced_test]
async fn web_flow_times_out_and_releases_the_port() -> Result<()> {
    let idp = mock_provider::spawn(EMAIL).await?;
    let provider = idp.provider().await?;
    let handlers = provider.handlers(loopback_redirect_url(free_loopback_port()?)?, default_scopes());

    // The user never opens the page.
    let opener: BrowserOpener = Arc::new(|_url: &str| Ok(()));
    let server = WebFlowServer::new(handlers)?
        .with_timeouts(WebFlowTimeouts {
            completion: Duration::from_millis(300),
            ..fast_timeouts()
        })
        .with_browser_opener(opener);
    let health_url = format!("{}/healthz", server.address());

    let err = server.run().await.unwrap_err();
    assert!(err.to_string().contains("Timed out"), "{err}");
    assert!(reqwest::get(&health_url).await.is_err());
    assert_eq!(idp.code_exchanges(), 0);
    Ok(())
}

#[tokio::test]
#[traced_test]
async fn web_flow_rejects_a_replayed_nonce() -> Result<()> {
    let idp = mock_provider::spawn(EMAIL).await?;
    idp.tamper_nonce();
    let provider = idp.provider().await?;
    let handlers = provider.handlers(loopback_redirect_url(free_loopback_port()?)?, default_scopes());

    let (opener, mut pages) = browser::opener();
    let result = WebFlowServer::new(handlers)?
        .with_timeouts(fast_timeouts())
        .with_browser_opener(opener)
        .run()
        .await;
    assert!(result.is_err());

    let page = pages.recv().await.context("browser never ran")??;
    assert_eq!(page.status, StatusCode::BAD_REQUEST);
    assert!(page.body.contains("Nonce did not match"), "{}", page.body);
    Ok(())
}

#[tokio::test]
#[traced_test]
async fn state_mismatch_is_rejected_before_exchange() -> Result<()> {
    let idp = mock_provider::spawn(EMAIL).await?;
    let provider = idp.provider().await?;
    let handlers = provider.handlers(loopback_redirect_url(free_loopback_port()?)?, default_scopes());

    let mut headers = HeaderMap::new();
    headers.insert(
        header::COOKIE,
        HeaderValue::from_static("state=expected; nonce=n"),
    );
    let params = CallbackParams {
        state: Some("forged".to_string()),
        code: Some("code-1".to_string()),
        ..Default::default()
    };
    let err = handlers
        .handle_auth_code(&headers, &params)
        .await
        .unwrap_err();
    assert!(matches!(err, CallbackError::StateMismatch));
    assert_eq!(err.status(), StatusCode::BAD_REQUEST);

    let params = CallbackParams {
        state: Some("expected".to_string()),
        error: Some("access_denied".to_string()),
        ..Default::default()
    };
    let err = handlers
        .handle_auth_code(&headers, &params)
        .await
        .unwrap_err();
    assert_eq!(err.status(), StatusCode::BAD_REQUEST);
    assert_eq!(idp.code_exchanges(), 0);
    Ok(())
}

#[tokio::test]
#[traced_test]
async fn id_token_source_refreshes_once_and_verifies() -> Result<()> {
    let idp = mock_provider::spawn(EMAIL).await?;
    let provider = idp.provider().await?;

    let expired = Token::new("stale-access")
        .with_refresh_token("refresh-token")
        .with_expiry(chrono::Utc::now() - chrono::Duration::minutes(5))
        .with_id_token(Some("not.a.jwt".to_string()));
    let source = provider.id_token_source(Arc::new(RefreshingTokenSource::new(
        expired,
        provider.refresher(),
    )));

    let first = source.token().await?;
    let second = source.token().await?;
    assert_eq!(first.access_token.secret(), second.access_token.secret());
    assert_eq!(idp.refreshes(), 1);

    let claims = jwt::decode_unverified(first.access_token.secret())?.claims;
    assert_eq!(claims["email"], EMAIL);

    // The opaque access token stays available, and kept its refresh token.
    let access = source.access_token_source().token().await?;
    assert_ne!(access.access_token.secret(), "stale-access");
    assert_eq!(
        access.refresh_token.as_ref().map(|t| t.secret().as_str()),
        Some("refresh-token")
    );
    Ok(())
}

#[tokio::test]
#[traced_test]
async fn id_token_source_never_returns_unverified_tokens() -> Result<()> {
    let idp = mock_provider::spawn(EMAIL).await?;
    let provider = idp.provider().await?;

    // Signed by the provider but for somebody else's client.
    let foreign = signing::id_token(&idp.issuer, "other-client", "user-2", EMAIL, None)?;
    let token = Token::new("access").with_id_token(Some(foreign));
    let source: IdTokenSource =
        provider.id_token_source(Arc::new(StaticTokenSource::new(token)));
    assert!(source.token().await.is_err());
    assert!(source.id_token().await.is_err());

    // Not a JWT at all.
    let token = Token::new("access").with_id_token(Some("opaque".to_string()));
    let source = provider.id_token_source(Arc::new(StaticTokenSource::new(token)));
    assert!(source.token().await.is_err());

    // No ID token from the underlying source.
    let source = provider.id_token_source(Arc::new(StaticTokenSource::new(Token::new("access"))));
    assert!(source.token().await.is_err());
    Ok(())
}

#[tokio::test]
#[traced_test]
async fn cached_login_runs_the_browser_once() -> Result<()> {
    let idp = mock_provider::spawn(EMAIL).await?;
    let dir = tempfile::tempdir()?;
    let cache_path = dir.path().join("tokens").join("id_token.json");

    let (opener, mut pages) = browser::opener();
    let login = CachedOidcLogin::new(idp.provider().await?, FileTokenCache::new(&cache_path))
        .with_timeouts(fast_timeouts())
        .with_browser_opener(opener.clone());
    let source = login.token_source().await?;
    assert_eq!(source.id_token().await?.email(), Some(EMAIL));
    assert!(pages.recv().await.is_some());
    assert!(cache_path.exists());

    let login = CachedOidcLogin::new(idp.provider().await?, FileTokenCache::new(&cache_path))
        .with_timeouts(fast_timeouts())
        .with_browser_opener(opener);
    let source = login.token_source().await?;
    assert_eq!(source.id_token().await?.email(), Some(EMAIL));
    assert!(pages.try_recv().is_err());
    assert_eq!(idp.code_exchanges(), 1);
    Ok(())
}

#[tokio::test]
#[traced_test]
async fn proxy_logs_in_sessions_and_forwards_with_jwt() -> Result<()> {
    let idp = mock_provider::spawn(EMAIL).await?;
    let provider = idp.provider().await?;
    let (origin_addr, _origin_task) = origin_server::spawn("origin").await?;

    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let proxy_addr = listener.local_addr()?;
    let handlers = provider.handlers(loopback_redirect_url(proxy_addr.port())?, default_scopes());
    let upstream = Url::parse(&format!("http://{origin_addr}")).anyerr()?;
    let proxy = Proxy::new(handlers, upstream)?.with_max_body_bytes(1024);
    let shutdown = CancellationToken::new();
    let _proxy_task = n0_future::task::AbortOnDropHandle::new(tokio::spawn(
        proxy.clone().serve(listener, shutdown.clone()),
    ));

    let alice = browser::Browser::new();
    let bob = browser::Browser::new();

    // Bob only gets as far as the session cookie.
    let first_hop = bob.get(&format!("http://{proxy_addr}/hello")).await?;
    assert_eq!(first_hop.status(), StatusCode::FOUND);
    assert_eq!(first_hop.headers()[header::LOCATION], "/oidc/start");

    let page = alice.follow(&format!("http://{proxy_addr}/hello?x=1")).await?;
    assert_eq!(page.status, StatusCode::OK);
    let mut lines = page.body.lines();
    assert_eq!(lines.next(), Some("origin GET /hello?x=1"));
    let forwarded_jwt = lines.next().context("origin saw no JWT")?;
    assert_eq!(lines.next(), Some(format!("Bearer {forwarded_jwt}").as_str()));
    assert_eq!(lines.next(), Some("127.0.0.1"));
    assert_eq!(lines.next(), Some(proxy_addr.to_string().as_str()));
    assert_eq!(jwt::decode_unverified(forwarded_jwt)?.claims["email"], EMAIL);

    let alice_sid = alice.cookie("oidc-proxy-sid").context("alice has no session")?;
    let bob_sid = bob.cookie("oidc-proxy-sid").context("bob has no session")?;
    assert_ne!(alice_sid, bob_sid);
    let alice_session = proxy.sessions().get(&alice_sid).await.context("alice session")?;
    let bob_session = proxy.sessions().get(&bob_sid).await.context("bob session")?;
    assert!(alice_session.token_source.is_some());
    assert!(bob_session.token_source.is_none());
    assert_eq!(proxy.sessions().len().await, 2);

    let bob_page = bob.follow(&format!("http://{proxy_addr}/hello")).await;
    let bob_page = bob_page?;
    assert_eq!(bob_page.status, StatusCode::BAD_REQUEST);

    let upload_url = format!("http://{proxy_addr}/upload");
    let small = alice.post(&upload_url, vec![b'x'; 512]).await?;
    assert_eq!(small.status(), StatusCode::OK);
    let large = alice.post(&upload_url, vec![b'x'; 4096]).await?;
    assert_eq!(large.status(), StatusCode::PAYLOAD_TOO_LARGE);

    let debug_page = alice.follow(&format!("http://{proxy_addr}/oidc/token")).await?;
    assert_eq!(debug_page.status, StatusCode::OK);
    let debug: serde_json::Value = serde_json::from_str(&debug_page.body).anyerr()?;
    assert_eq!(debug["email"], EMAIL);
    assert_eq!(debug["claims"]["sub"], "user-1");

    shutdown.cancel();
    Ok(())
}

#[tokio::test]
#[traced_test]
async fn proxy_reports_unreachable_upstream() -> Result<()> {
    let idp = mock_provider::spawn(EMAIL).await?;
    let provider = idp.provider().await?;

    // Nothing listens on the upstream port.
    let upstream_port = free_loopback_port()?;
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let proxy_addr = listener.local_addr()?;
    let handlers = provider.handlers(loopback_redirect_url(proxy_addr.port())?, default_scopes());
    let upstream = Url::parse(&format!("http://127.0.0.1:{upstream_port}")).anyerr()?;
    let proxy = Proxy::new(handlers, upstream)?;
    let shutdown = CancellationToken::new();
    let task = tokio::spawn(proxy.serve(listener, shutdown.clone()));

    let page = browser::Browser::new()
        .follow(&format!("http://{proxy_addr}/"))
        .await?;
    assert_eq!(page.status, StatusCode::BAD_GATEWAY);
    let status: serde_json::Value = serde_json::from_str(&page.body).anyerr()?;
    assert_eq!(status["code"], 502);

    shutdown.cancel();
    task.await.anyerr()??;
    Ok(())
}

#[tokio::test]
async fn provider_from_static_metadata() -> Result<()> {
    let idp = mock_provider::spawn(EMAIL).await?;
    let discovered = idp.provider().await?;
    let provider = OidcProvider::from_metadata(
        idp.metadata(),
        ClientId::new(mock_provider::CLIENT_ID.to_string()),
        Some(ClientSecret::new("secret".to_string())),
    )?;
    assert_eq!(provider.issuer(), discovered.issuer());
    assert_eq!(provider.client_id().as_str(), mock_provider::CLIENT_ID);
    Ok(())
}

#[tokio::test]
async fn jwt_signature_checked_against_jwks() -> Result<()> {
    let idp = mock_provider::spawn(EMAIL).await?;
    let jwks_url = format!("{}/jwks", idp.issuer);
    let http = reqwest::Client::new();

    let jwt = signing::id_token(&idp.issuer, "any-audience", "user-1", EMAIL, None)?;
    let decoded = jwt::verify_with_jwks(&jwt, &jwks_url, &http).await?;
    assert_eq!(decoded.claims["aud"], serde_json::json!(["any-audience"]));
    assert_eq!(decoded.header["kid"], signing::KEY_ID);

    let (head, rest) = jwt.split_once('.').context("not a JWT")?;
    let (_, signature) = rest.split_once('.').context("not a JWT")?;
    let other = signing::id_token(&idp.issuer, "any-audience", "user-2", EMAIL, None)?;
    let other_claims = other.split('.').nth(1).context("not a JWT")?;
    let forged = format!("{head}.{other_claims}.{signature}");
    assert!(jwt::verify_with_jwks(&forged, &jwks_url, &http).await.is_err());
    Ok(())
}

/// RSA key the mock provider signs ID tokens with.
pub(crate) mod signing {
    use chrono::{Duration, Utc};
    use n0_error::{Result, StdResultExt, anyerr};
    use openidconnect::{
        Audience, EmptyAdditionalClaims, EndUserEmail, IssuerUrl, JsonWebKeyId, Nonce,
        PrivateSigningKey, StandardClaims, SubjectIdentifier,
        core::{
            CoreIdToken, CoreIdTokenClaims, CoreJsonWebKeySet, CoreJwsSigningAlgorithm,
            CoreRsaPrivateSigningKey,
        },
    };

    use crate::oauthutil::oidc::id_token_string;

    pub const KEY_ID: &str = "devsugar-test";
    const PEM: &str = include_str!("../testdata/provider-key.pem");

    pub fn key() -> Result<CoreRsaPrivateSigningKey> {
        CoreRsaPrivateSigningKey::from_pem(PEM, Some(JsonWebKeyId::new(KEY_ID.to_string())))
            .map_err(|err| anyerr!("invalid test key: {err}"))
    }

    pub fn jwks() -> Result<CoreJsonWebKeySet> {
        Ok(CoreJsonWebKeySet::new(vec![key()?.as_verification_key()]))
    }

    /// Signs a one hour ID token.
    pub fn id_token(
        issuer: &str,
        audience: &str,
        subject: &str,
        email: &str,
        nonce: Option<&str>,
    ) -> Result<String> {
        let now = Utc::now();
        let claims = CoreIdTokenClaims::new(
            IssuerUrl::new(issuer.to_string()).anyerr()?,
            vec![Audience::new(audience.to_string())],
            now + Duration::hours(1),
            now,
            StandardClaims::new(SubjectIdentifier::new(subject.to_string()))
                .set_email(Some(EndUserEmail::new(email.to_string())))
                .set_email_verified(Some(true)),
            EmptyAdditionalClaims {},
        )
        .set_nonce(nonce.map(|nonce| Nonce::new(nonce.to_string())));
        let token = CoreIdToken::new(
            claims,
            &key()?,
            CoreJwsSigningAlgorithm::RsaSsaPkcs1V15Sha256,
            None,
            None,
        )
        .anyerr()?;
        id_token_string(&token).ok_or_else(|| anyerr!("failed to serialize ID token"))
    }
}

/// An identity provider that logs everybody in as the same user.
mod mock_provider {
    use std::{
        collections::HashMap,
        sync::{
            Arc, Mutex,
            atomic::{AtomicBool, AtomicUsize, Ordering},
        },
    };

    use axum::{
        Form, Json, Router,
        extract::{Query, State},
        http::{StatusCode, header},
        response::{IntoResponse, Response},
        routing::{get, post},
    };
    use n0_error::{Result, StdResultExt};
    use n0_future::task::AbortOnDropHandle;
    use openidconnect::{
        AuthUrl, ClientId, ClientSecret, EmptyAdditionalProviderMetadata, IssuerUrl,
        JsonWebKeySetUrl, ResponseTypes, TokenUrl,
        core::{
            CoreJwsSigningAlgorithm, CoreProviderMetadata, CoreResponseType,
            CoreSubjectIdentifierType,
        },
    };
    use serde_json::json;
    use tokio::net::TcpListener;
    use tracing::debug;
    use url::Url;

    use super::signing;
    use crate::oauthutil::OidcProvider;

    pub const CLIENT_ID: &str = "devsugar-test-client";
    const SUBJECT: &str = "user-1";

    pub struct MockProvider {
        pub issuer: String,
        state: Arc<MockState>,
        _task: AbortOnDropHandle<()>,
    }

    struct MockState {
        issuer: String,
        email: String,
        metadata: CoreProviderMetadata,
        /// Authorization code to the nonce it was requested with.
        codes: Mutex<HashMap<String, Option<String>>>,
        issued: AtomicUsize,
        code_exchanges: AtomicUsize,
        refreshes: AtomicUsize,
        tamper_nonce: AtomicBool,
    }

    pub async fn spawn(email: &str) -> Result<MockProvider> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let issuer = format!("http://{}", listener.local_addr()?);
        let metadata = CoreProviderMetadata::new(
            IssuerUrl::new(issuer.clone()).anyerr()?,
            AuthUrl::new(format!("{issuer}/authorize")).anyerr()?,
            JsonWebKeySetUrl::new(format!("{issuer}/jwks")).anyerr()?,
            vec![ResponseTypes::new(vec![CoreResponseType::Code])],
            vec![CoreSubjectIdentifierType::Public],
            vec![CoreJwsSigningAlgorithm::RsaSsaPkcs1V15Sha256],
            EmptyAdditionalProviderMetadata {},
        )
        .set_token_endpoint(Some(TokenUrl::new(format!("{issuer}/token")).anyerr()?))
        .set_jwks(signing::jwks()?);

        let state = Arc::new(MockState {
            issuer: issuer.clone(),
            email: email.to_string(),
            metadata,
            codes: Default::default(),
            issued: Default::default(),
            code_exchanges: Default::default(),
            refreshes: Default::default(),
            tamper_nonce: Default::default(),
        });
        let app = Router::new()
            .route("/.well-known/openid-configuration", get(discovery))
            .route("/jwks", get(jwks))
            .route("/authorize", get(authorize))
            .route("/token", post(token))
            .with_state(state.clone());
        let task = tokio::spawn(async move {
            if let Err(err) = axum::serve(listener, app).await {
                debug!("mock provider stopped: {err:#}");
            }
        });
        debug!(%issuer, "spawned mock identity provider");
        Ok(MockProvider {
            issuer,
            state,
            _task: AbortOnDropHandle::new(task),
        })
    }

    impl MockProvider {
        pub async fn provider(&self) -> Result<OidcProvider> {
            OidcProvider::discover(
                &self.issuer,
                ClientId::new(CLIENT_ID.to_string()),
                Some(ClientSecret::new("secret".to_string())),
            )
            .await
        }

        pub fn metadata(&self) -> CoreProviderMetadata {
            self.state.metadata.clone()
        }

        /// Makes the provider sign ID tokens with a nonce nobody asked for.
        pub fn tamper_nonce(&self) {
            self.state.tamper_nonce.store(true, Ordering::SeqCst);
        }

        pub fn code_exchanges(&self) -> usize {
            self.state.code_exchanges.load(Ordering::SeqCst)
        }

        pub fn refreshes(&self) -> usize {
            self.state.refreshes.load(Ordering::SeqCst)
        }
    }

    async fn discovery(State(state): State<Arc<MockState>>) -> Json<CoreProviderMetadata> {
        Json(state.metadata.clone())
    }

    async fn jwks() -> Response {
        match signing::jwks() {
            Ok(jwks) => Json(jwks).into_response(),
            Err(err) => (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response(),
        }
    }

    /// Skips the consent screen and sends the browser straight back.
    async fn authorize(
        State(state): State<Arc<MockState>>,
        Query(params): Query<HashMap<String, String>>,
    ) -> Response {
        let Some(mut redirect) = params
            .get("redirect_uri")
            .and_then(|uri| Url::parse(uri).ok())
        else {
            return (StatusCode::BAD_REQUEST, "missing redirect_uri").into_response();
        };
        let code = format!("code-{}", state.issued.fetch_add(1, Ordering::SeqCst));
        if let Ok(mut codes) = state.codes.lock() {
            codes.insert(code.clone(), params.get("nonce").cloned());
        }
        redirect.query_pairs_mut().append_pair("code", &code);
        if let Some(flow_state) = params.get("state") {
            redirect.query_pairs_mut().append_pair("state", flow_state);
        }
        (StatusCode::FOUND, [(header::LOCATION, redirect.to_string())]).into_response()
    }

    async fn token(
        State(state): State<Arc<MockState>>,
        Form(form): Form<HashMap<String, String>>,
    ) -> Response {
        let grant_type = form.get("grant_type").map(String::as_str);
        let (nonce, refresh_token) = match grant_type {
            Some("authorization_code") => {
                let code = form.get("code").cloned().unwrap_or_default();
                let nonce = state.codes.lock().ok().and_then(|mut codes| codes.remove(&code));
                let Some(nonce) = nonce else {
                    return invalid_grant();
                };
                state.code_exchanges.fetch_add(1, Ordering::SeqCst);
                let nonce = if state.tamper_nonce.load(Ordering::SeqCst) {
                    Some("tampered".to_string())
                } else {
                    nonce
                };
                (nonce, Some("refresh-token"))
            }
            Some("refresh_token") if form.get("refresh_token").map(String::as_str) == Some("refresh-token") => {
                state.refreshes.fetch_add(1, Ordering::SeqCst);
                // Refresh responses leave out the refresh token.
                (None, None)
            }
            _ => return invalid_grant(),
        };

        let id_token = match signing::id_token(
            &state.issuer,
            CLIENT_ID,
            SUBJECT,
            &state.email,
            nonce.as_deref(),
        ) {
            Ok(id_token) => id_token,
            Err(err) => {
                return (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response();
            }
        };
        let serial = state.issued.fetch_add(1, Ordering::SeqCst);
        let mut body = json!({
            "access_token": format!("access-{serial}"),
            "token_type": "bearer",
            "expires_in": 3600,
            "id_token": id_token,
        });
        if let Some(refresh_token) = refresh_token {
            body["refresh_token"] = json!(refresh_token);
        }
        Json(body).into_response()
    }

    fn invalid_grant() -> Response {
        (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "invalid_grant"})),
        )
            .into_response()
    }
}

/// A user agent that keeps cookies and follows redirects by hand.
mod browser {
    use std::{collections::BTreeMap, sync::Mutex};

    use axum::http::{StatusCode, header};
    use n0_error::{Result, StdResultExt, anyerr};
    use tokio::sync::mpsc;
    use url::Url;

    use crate::oauthutil::BrowserOpener;

    #[derive(Debug)]
    pub struct Page {
        pub status: StatusCode,
        pub body: String,
    }

    #[derive(Debug)]
    pub struct Browser {
        http: reqwest::Client,
        jar: Mutex<BTreeMap<String, String>>,
    }

    /// An opener that visits the URL in a fresh browser and reports the final page.
    pub fn opener() -> (BrowserOpener, mpsc::UnboundedReceiver<Result<Page>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let opener: BrowserOpener = std::sync::Arc::new(move |url: &str| {
            let url = url.to_string();
            let tx = tx.clone();
            tokio::spawn(async move {
                let page = Browser::new().follow(&url).await;
                let _ = tx.send(page);
            });
            Ok(())
        });
        (opener, rx)
    }

    impl Browser {
        pub fn new() -> Self {
            let http = reqwest::Client::builder()
                .redirect(reqwest::redirect::Policy::none())
                .pool_max_idle_per_host(0)
                .build()
                .expect("http client");
            Self {
                http,
                jar: Default::default(),
            }
        }

        pub fn cookie(&self, name: &str) -> Option<String> {
            self.jar.lock().ok()?.get(name).cloned()
        }

        pub async fn get(&self, url: &str) -> Result<reqwest::Response> {
            self.send(self.http.get(url)).await
        }

        pub async fn post(&self, url: &str, body: Vec<u8>) -> Result<reqwest::Response> {
            self.send(self.http.post(url).body(body)).await
        }

        async fn send(&self, mut request: reqwest::RequestBuilder) -> Result<reqwest::Response> {
            let cookies = {
                let jar = self.jar.lock().map_err(|_| anyerr!("cookie jar poisoned"))?;
                jar.iter()
                    .map(|(name, value)| format!("{name}={value}"))
                    .collect::<Vec<_>>()
                    .join("; ")
            };
            if !cookies.is_empty() {
                request = request.header(header::COOKIE, cookies);
            }
            let response = request.send().await.anyerr()?;
            let mut jar = self.jar.lock().map_err(|_| anyerr!("cookie jar poisoned"))?;
            for value in response.headers().get_all(header::SET_COOKIE) {
                let cookie = cookie::Cookie::parse(value.to_str().anyerr()?.to_string()).anyerr()?;
                jar.insert(cookie.name().to_string(), cookie.value().to_string());
            }
            Ok(response)
        }

        /// Visits `url` and follows redirects until a page is returned.
        pub async fn follow(&self, url: &str) -> Result<Page> {
            let mut url = Url::parse(url).anyerr()?;
            for _ in 0..10 {
                let response = self.get(url.as_str()).await?;
                if response.status().is_redirection() {
                    let location = response
                        .headers()
                        .get(header::LOCATION)
                        .ok_or_else(|| anyerr!("redirect without location"))?
                        .to_str()
                        .anyerr()?;
                    url = url.join(location).anyerr()?;
                    continue;
                }
                let status = response.status();
                let body = response.text().await.anyerr()?;
                return Ok(Page { status, body });
            }
            Err(anyerr!("too many redirects"))
        }
    }
}

mod origin_server {
    use std::{convert::Infallible, net::SocketAddr, sync::Arc};

    use http_body_util::Full;
    use hyper::{Request, Response, body::Bytes, server::conn::http1, service::service_fn};
    use hyper_util::rt::TokioIo;
    use n0_future::task::AbortOnDropHandle;
    use tokio::net::TcpListener;
    use tracing::debug;

    use crate::iap::JWT_HEADER;

    /// Spawns a simple HTTP origin server that echoes back the request line and
    /// the identity headers it received.
    pub async fn spawn(
        label: &'static str,
    ) -> n0_error::Result<(SocketAddr, AbortOnDropHandle<()>)> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let tcp_addr = listener.local_addr()?;
        debug!(%label, %tcp_addr, "spawned origin server");
        let task = tokio::spawn(async move { run(listener, label).await });
        Ok((tcp_addr, AbortOnDropHandle::new(task)))
    }

    /// Returns "{label} {METHOD} {PATH_AND_QUERY}", the IAP JWT, the
    /// authorization header and the forwarding headers, one per line.
    pub(super) async fn run(listener: TcpListener, label: &'static str) {
        let label = Arc::new(label);
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            let io = TokioIo::new(stream);
            let label = label.clone();
            tokio::task::spawn(async move {
                let handler = move |req: Request<hyper::body::Incoming>| {
                    let label = label.clone();
                    async move {
                        let header = |name: &str| {
                            req.headers()
                                .get(name)
                                .and_then(|value| value.to_str().ok())
                                .unwrap_or_default()
                                .to_string()
                        };
                        let path = req
                            .uri()
                            .path_and_query()
                            .map(|pq| pq.as_str())
                            .unwrap_or("/");
                        let body = format!(
                            "{} {} {path}\n{}\n{}\n{}\n{}",
                            *label,
                            req.method(),
                            header(JWT_HEADER),
                            header("authorization"),
                            header("x-forwarded-for"),
                            header("x-forwarded-host"),
                        );
                        Ok::<_, Infallible>(Response::new(Full::new(Bytes::from(body))))
                    }
                };
                let _ = http1::Builder::new()
                    .serve_connection(io, service_fn(handler))
                    .await;
            });
        }
    }
}
