//! A reverse proxy that logs users in with OIDC and forwards their requests
//! with the ID token attached, mimicking Identity-Aware Proxy for local
//! development.

use std::{
    collections::HashMap,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    sync::Arc,
};

use axum::{
    Router,
    body::Body,
    extract::{ConnectInfo, Query, Request, State},
    http::{HeaderMap, HeaderName, HeaderValue, StatusCode, Uri, header, request::Parts},
    response::{IntoResponse, Response},
    routing::get,
};
use http_body_util::LengthLimitError;
use n0_error::{Result, StdResultExt};
use openidconnect::RedirectUrl;
use tokio::{net::TcpListener, sync::Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, Span, debug, error, info, info_span, warn};
use url::Url;

use super::{
    cookies,
    handlers::{AuthCodeFlow, CallbackParams, found},
    http_client,
    oidc::{IdTokenSource, OidcHandlers},
    token::TokenSource,
    webflow::{HEALTH_PATH, health, loopback_redirect_url},
};
use crate::{iap::JWT_HEADER, status::write_status, util};

pub const SESSION_COOKIE: &str = "oidc-proxy-sid";
pub const OAUTH_START_PATH: &str = "/oidc/start";
pub const ID_TOKEN_PATH: &str = "/oidc/token";
pub const DEFAULT_UPSTREAM: &str = "http://localhost:8080";

const SESSION_ID_BYTES: usize = 24;

/// Largest request body forwarded upstream.
pub const MAX_BODY_BYTES: usize = 32 * 1024 * 1024;

const X_FORWARDED_FOR: &str = "x-forwarded-for";
const X_FORWARDED_HOST: &str = "x-forwarded-host";

/// Binds `port` on the loopback interface and returns the redirect URL for
/// the port actually bound, so a port of 0 yields a usable callback.
pub async fn bind_loopback(port: u16) -> Result<(TcpListener, RedirectUrl)> {
    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, port)).await?;
    let port = listener.local_addr()?.port();
    Ok((listener, loopback_redirect_url(port)?))
}

/// Login state of one browser.
#[derive(Debug, Clone, Default)]
pub struct Session {
    /// Set once the login for this session completed.
    pub token_source: Option<IdTokenSource>,
    /// Where to send the browser after login.
    pub next_url: Option<String>,
}

/// Sessions keyed by the session cookie, plus the `state` of pending logins.
///
/// Sessions are never evicted; the store lives as long as the process.
#[derive(Debug, Default)]
pub struct SessionStore {
    inner: Mutex<Sessions>,
}

#[derive(Debug, Default)]
struct Sessions {
    by_id: HashMap<String, Session>,
    state_to_sid: HashMap<String, String>,
}

impl SessionStore {
    pub async fn get(&self, sid: &str) -> Option<Session> {
        self.inner.lock().await.by_id.get(sid).cloned()
    }

    /// Creates a session with a new random id and returns the id.
    pub async fn create(&self, next_url: Option<String>) -> Result<String> {
        let sid = util::random_string(SESSION_ID_BYTES)?;
        let session = Session {
            token_source: None,
            next_url,
        };
        self.inner.lock().await.by_id.insert(sid.clone(), session);
        Ok(sid)
    }

    /// Remembers which session started the login with `state`.
    pub async fn bind_state(&self, state: String, sid: String) {
        self.inner.lock().await.state_to_sid.insert(state, sid);
    }

    /// Attaches `source` to the session that started the login with `state`.
    ///
    /// The `state` is consumed. Returns the updated session, or `None` if no
    /// session is waiting for `state`.
    pub async fn complete_login(&self, state: &str, source: IdTokenSource) -> Option<Session> {
        let mut inner = self.inner.lock().await;
        let sid = inner.state_to_sid.remove(state)?;
        let session = inner.by_id.get_mut(&sid)?;
        session.token_source = Some(source);
        Some(session.clone())
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.by_id.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

/// The dev IAP proxy. Cheap to clone.
#[derive(Debug, Clone)]
pub struct Proxy {
    inner: Arc<Inner>,
    max_body_bytes: usize,
}

#[derive(derive_more::Debug)]
struct Inner {
    handlers: OidcHandlers,
    sessions: SessionStore,
    upstream: Url,
    #[debug(skip)]
    http: reqwest::Client,
    span: Span,
}

impl Proxy {
    /// Sessions are bound to the host of the handlers' redirect URL; users
    /// have to browse the proxy under that host for the login cookies to match.
    pub fn new(handlers: OidcHandlers, upstream: Url) -> Result<Self> {
        let callback_path = handlers.redirect_url().url().path();
        if [HEALTH_PATH, OAUTH_START_PATH, ID_TOKEN_PATH].contains(&callback_path) {
            n0_error::bail_any!("Redirect URL path {callback_path} collides with a proxy route");
        }
        let span = info_span!("iap-proxy", upstream = %upstream);
        Ok(Self {
            inner: Arc::new(Inner {
                handlers,
                sessions: SessionStore::default(),
                upstream,
                http: http_client()?,
                span,
            }),
            max_body_bytes: MAX_BODY_BYTES,
        })
    }

    /// Requests with larger bodies are rejected with 413.
    pub fn with_max_body_bytes(mut self, max_body_bytes: usize) -> Self {
        self.max_body_bytes = max_body_bytes;
        self
    }

    pub fn sessions(&self) -> &SessionStore {
        &self.inner.sessions
    }

    pub fn upstream(&self) -> &Url {
        &self.inner.upstream
    }

    pub fn router(&self) -> Router {
        let callback_path = self.inner.handlers.redirect_url().url().path().to_string();
        Router::new()
            .route(HEALTH_PATH, get(health))
            .route(OAUTH_START_PATH, get(oauth_start))
            .route(&callback_path, get(oauth_callback))
            .route(ID_TOKEN_PATH, get(id_token))
            .fallback(forward)
            .with_state(self.clone())
    }

    /// Serves until `shutdown` is cancelled.
    pub async fn serve(self, listener: TcpListener, shutdown: CancellationToken) -> Result<()> {
        let span = self.inner.span.clone();
        async move {
            let addr = listener.local_addr()?;
            info!(%addr, "IAP proxy listening");
            let app = self
                .router()
                .into_make_service_with_connect_info::<SocketAddr>();
            axum::serve(listener, app)
                .with_graceful_shutdown(shutdown.cancelled_owned())
                .await
                .std_context("IAP proxy server failed")?;
            info!("IAP proxy stopped");
            Ok(())
        }
        .instrument(span)
        .await
    }

    /// Returns the caller's session, or a response that starts a new one.
    async fn ensure_session(&self, headers: &HeaderMap, uri: &Uri) -> Result<Session, Response> {
        if let Some(sid) = cookies::find(headers, SESSION_COOKIE) {
            if let Some(session) = self.inner.sessions.get(&sid).await {
                return Ok(session);
            }
            debug!("unknown session cookie, starting a new session");
        }
        let next_url = uri.path_and_query().map(|pq| pq.to_string());
        let sid = match self.inner.sessions.create(next_url).await {
            Ok(sid) => sid,
            Err(err) => {
                error!("Failed to create session: {err:#}");
                return Err(write_status(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Failed to create session",
                ));
            }
        };
        let cookie = cookies::flow_cookie(
            SESSION_COOKIE,
            &sid,
            self.inner.handlers.secure_cookies(),
        );
        Err(found(OAUTH_START_PATH, &[cookie]))
    }

    async fn forward_upstream(&self, parts: Parts, body: Body, jwt: &str) -> Response {
        let url = upstream_url(&self.inner.upstream, &parts.uri);
        let too_large = || {
            write_status(
                StatusCode::PAYLOAD_TOO_LARGE,
                format!("Request body exceeds {} bytes", self.max_body_bytes),
            )
        };
        let declared_len = parts
            .headers
            .get(header::CONTENT_LENGTH)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.parse::<usize>().ok());
        if declared_len.is_some_and(|len| len > self.max_body_bytes) {
            return too_large();
        }
        let body = match axum::body::to_bytes(body, self.max_body_bytes).await {
            Ok(body) => body,
            Err(err) => {
                let err = err.into_inner();
                if err.downcast_ref::<LengthLimitError>().is_some() {
                    return too_large();
                }
                return write_status(
                    StatusCode::BAD_REQUEST,
                    format!("Failed to read request body: {err}"),
                );
            }
        };
        let client_ip = parts
            .extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| addr.ip());
        let forwarded_for = forwarded_for(&parts.headers, client_ip);
        let forwarded_host = parts.headers.get(header::HOST).cloned();

        let mut request = self.inner.http.request(parts.method.clone(), url.as_str());
        for (name, value) in parts.headers.iter() {
            if is_hop_by_hop(name)
                || name == header::HOST
                || name == header::AUTHORIZATION
                || name.as_str() == JWT_HEADER
                || name.as_str() == X_FORWARDED_FOR
                || name.as_str() == X_FORWARDED_HOST
            {
                continue;
            }
            request = request.header(name, value);
        }
        if let Some(forwarded_for) = forwarded_for {
            request = request.header(X_FORWARDED_FOR, forwarded_for);
        }
        if let Some(host) = forwarded_host {
            request = request.header(X_FORWARDED_HOST, host);
        }
        let request = request
            .header(JWT_HEADER, jwt)
            .header(header::AUTHORIZATION, format!("Bearer {jwt}"))
            .body(body);

        let upstream = match request.send().await {
            Ok(res) => res,
            Err(err) => {
                warn!(%url, "Upstream request failed: {err:#}");
                return write_status(
                    StatusCode::BAD_GATEWAY,
                    format!("Failed to reach upstream {url}"),
                );
            }
        };
        let status = upstream.status();
        let headers = upstream.headers().clone();
        let body = match upstream.bytes().await {
            Ok(body) => body,
            Err(err) => {
                warn!(%url, "Failed to read upstream response: {err:#}");
                return write_status(
                    StatusCode::BAD_GATEWAY,
                    format!("Failed to read response from upstream {url}"),
                );
            }
        };

        let mut response = Response::new(Body::from(body));
        *response.status_mut() = status;
        for (name, value) in headers.iter() {
            if is_hop_by_hop(name) || name == header::CONTENT_LENGTH {
                continue;
            }
            response.headers_mut().append(name, value.clone());
        }
        response
    }
}

async fn oauth_start(State(proxy): State<Proxy>, headers: HeaderMap) -> Response {
    let Some(sid) = cookies::find(&headers, SESSION_COOKIE) else {
        return write_status(
            StatusCode::BAD_REQUEST,
            "Missing session cookie; open the proxied URL first",
        );
    };
    match proxy.inner.handlers.redirect_to_auth_url() {
        Ok(redirect) => {
            proxy
                .inner
                .sessions
                .bind_state(redirect.state().to_string(), sid)
                .await;
            redirect.into_response()
        }
        Err(err) => {
            error!("Failed to start OAuth flow: {err:#}");
            err.response()
        }
    }
}

async fn oauth_callback(
    State(proxy): State<Proxy>,
    headers: HeaderMap,
    Query(params): Query<CallbackParams>,
) -> Response {
    let (state, source) = match proxy.inner.handlers.handle_auth_code(&headers, &params).await {
        Ok(outcome) => outcome,
        Err(err) => {
            error!("OAuth callback failed: {err:#}");
            return err.response();
        }
    };
    let Some(session) = proxy.inner.sessions.complete_login(&state, source).await else {
        return write_status(
            StatusCode::BAD_REQUEST,
            format!("No session is waiting for state {state}"),
        );
    };
    info!("session logged in");
    let next = session
        .next_url
        .unwrap_or_else(|| ID_TOKEN_PATH.to_string());
    found(&next, &[])
}

/// Debug view of the session's verified ID token.
async fn id_token(State(proxy): State<Proxy>, headers: HeaderMap, uri: Uri) -> Response {
    let session = match proxy.ensure_session(&headers, &uri).await {
        Ok(session) => session,
        Err(response) => return response,
    };
    let Some(source) = session.token_source else {
        return write_status(StatusCode::BAD_REQUEST, "Session has no token source");
    };
    let id_token = match source.id_token().await {
        Ok(id_token) => id_token,
        Err(err) => {
            return write_status(
                StatusCode::UNAUTHORIZED,
                format!("Failed to get a valid ID token: {err:#}"),
            );
        }
    };
    let claims = match id_token.claims_json() {
        Ok(claims) => claims,
        Err(err) => {
            return write_status(
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Failed to decode ID token claims: {err:#}"),
            );
        }
    };
    let body = serde_json::json!({
        "subject": id_token.subject(),
        "email": id_token.email(),
        "expiry": id_token.expiry(),
        "claims": claims,
    });
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, HeaderValue::from_static("application/json"))],
        util::pretty_string(&body),
    )
        .into_response()
}

async fn forward(State(proxy): State<Proxy>, request: Request) -> Response {
    let (parts, body) = request.into_parts();
    let session = match proxy.ensure_session(&parts.headers, &parts.uri).await {
        Ok(session) => session,
        Err(response) => return response,
    };
    let Some(source) = session.token_source else {
        return write_status(StatusCode::BAD_REQUEST, "Session has no token source");
    };
    let token = match source.token().await {
        Ok(token) => token,
        Err(err) => {
            return write_status(
                StatusCode::UNAUTHORIZED,
                format!("Failed to get a valid ID token: {err:#}"),
            );
        }
    };
    proxy
        .forward_upstream(parts, body, token.access_token.secret())
        .await
}

/// Target URL for `uri` on `upstream`, joining paths with a single slash and
/// appending the request query to the upstream's own.
fn upstream_url(upstream: &Url, uri: &Uri) -> Url {
    let mut url = upstream.clone();
    url.set_path(&single_joining_slash(upstream.path(), uri.path()));
    let query = match (upstream.query().unwrap_or(""), uri.query().unwrap_or("")) {
        ("", query) | (query, "") => query.to_string(),
        (a, b) => format!("{a}&{b}"),
    };
    url.set_query((!query.is_empty()).then_some(query.as_str()));
    url
}

/// Earlier `X-Forwarded-For` hops followed by the client address.
fn forwarded_for(headers: &HeaderMap, client: Option<IpAddr>) -> Option<String> {
    let mut hops: Vec<String> = headers
        .get_all(X_FORWARDED_FOR)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .map(str::to_string)
        .collect();
    if let Some(client) = client {
        hops.push(client.to_string());
    }
    (!hops.is_empty()).then(|| hops.join(", "))
}

fn single_joining_slash(a: &str, b: &str) -> String {
    match (a.ends_with('/'), b.starts_with('/')) {
        (true, true) => format!("{a}{}", &b[1..]),
        (false, false) => format!("{a}/{b}"),
        _ => format!("{a}{b}"),
    }
}

fn is_hop_by_hop(name: &HeaderName) -> bool {
    matches!(
        name.as_str(),
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailer"
            | "transfer-encoding"
            | "upgrade"
    )
}
