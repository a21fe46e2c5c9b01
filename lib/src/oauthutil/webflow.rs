//! Loopback HTTP server that completes an authorization-code flow in the
//! user's browser.

use std::{
    net::Ipv4Addr,
    sync::Arc,
    time::{Duration, Instant},
};

use axum::{
    Router,
    extract::{Query, State},
    http::{HeaderMap, StatusCode, Uri},
    response::{IntoResponse, Response},
    routing::get,
};
use n0_error::{Result, StackResultExt, StdResultExt};
use n0_future::task::AbortOnDropHandle;
use openidconnect::RedirectUrl;
use tokio::{net::TcpListener, sync::oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, Span, debug, error, info, info_span, warn};

use super::{
    completion::{Completion, completion},
    handlers::{AuthCodeFlow, CallbackError, CallbackParams},
};
use crate::status::write_status;

pub const HEALTH_PATH: &str = "/healthz";
pub const AUTH_START_PATH: &str = "/auth/start";
pub const CALLBACK_PATH: &str = "/auth/callback";

const FLOW_COMPLETE_MESSAGE: &str =
    "OAuth flow completed; you can close this window and return to your application";
const HEALTH_MESSAGE: &str = "OIDC server is running";

/// How long to wait for the server to stop after the flow ended.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy)]
pub struct WebFlowTimeouts {
    /// Deadline for the server to answer its health check.
    pub ready: Duration,
    pub poll_interval: Duration,
    /// Deadline for the provider callback once the browser was opened.
    pub completion: Duration,
}

impl Default for WebFlowTimeouts {
    fn default() -> Self {
        Self {
            ready: Duration::from_secs(3 * 60),
            poll_interval: Duration::from_secs(5),
            completion: Duration::from_secs(3 * 60),
        }
    }
}

/// Opens a URL in the user's browser.
pub type BrowserOpener = Arc<dyn Fn(&str) -> std::io::Result<()> + Send + Sync>;

fn default_browser_opener() -> BrowserOpener {
    Arc::new(|url: &str| open::that(url))
}

/// Picks a free port on the loopback interface.
///
/// The port is released again before returning, so another process may grab
/// it before the flow binds it.
pub fn free_loopback_port() -> Result<u16> {
    let listener = std::net::TcpListener::bind((Ipv4Addr::LOCALHOST, 0))?;
    Ok(listener.local_addr()?.port())
}

/// Redirect URL on the loopback interface. Google requires `127.0.0.1`
/// rather than `localhost` for desktop clients.
pub fn loopback_redirect_url(port: u16) -> Result<RedirectUrl> {
    RedirectUrl::new(format!("http://127.0.0.1:{port}{CALLBACK_PATH}"))
        .std_context("Invalid redirect URL")
}

/// Serves `/healthz`, `/auth/start` and the callback path of the flow's
/// redirect URL for the duration of one login.
#[derive(derive_more::Debug)]
pub struct WebFlowServer<F> {
    #[debug(skip)]
    flow: Arc<F>,
    host: String,
    port: u16,
    callback_path: String,
    timeouts: WebFlowTimeouts,
    #[debug(skip)]
    opener: BrowserOpener,
    span: Span,
}

impl<F: AuthCodeFlow> WebFlowServer<F> {
    pub fn new(flow: F) -> Result<Self> {
        let redirect = flow.redirect_url().url();
        let host = redirect
            .host_str()
            .context("Redirect URL has no host")?
            .to_string();
        let port = redirect
            .port_or_known_default()
            .context("Redirect URL has no port")?;
        let callback_path = redirect.path().to_string();
        if callback_path == HEALTH_PATH || callback_path == AUTH_START_PATH {
            n0_error::bail_any!("Redirect URL path {callback_path} collides with a server route");
        }
        let span = info_span!("web-flow", %host, port);
        Ok(Self {
            flow: Arc::new(flow),
            host,
            port,
            callback_path,
            timeouts: WebFlowTimeouts::default(),
            opener: default_browser_opener(),
            span,
        })
    }

    pub fn with_timeouts(mut self, timeouts: WebFlowTimeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    pub fn with_browser_opener(mut self, opener: BrowserOpener) -> Self {
        self.opener = opener;
        self
    }

    /// Base URL of the server, e.g. `http://127.0.0.1:4567`.
    pub fn address(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }

    /// The URL the user opens to start the flow.
    pub fn auth_start_url(&self) -> String {
        format!("{}{AUTH_START_PATH}", self.address())
    }

    pub fn flow(&self) -> &F {
        &self.flow
    }

    /// Runs the flow to completion.
    ///
    /// Starts the server, waits for it to be ready, opens the start URL in the
    /// browser and waits for the provider callback. The server is shut down
    /// on every exit path.
    pub async fn run(self) -> Result<F::Source> {
        let span = self.span.clone();
        async move {
            let (completion, rx) = completion();
            let cancel_token = CancellationToken::new();
            let server = self.spawn_server(completion, cancel_token.clone());

            let outcome = self.await_outcome(rx).await;

            cancel_token.cancel();
            match tokio::time::timeout(SHUTDOWN_TIMEOUT, server).await {
                Ok(_) => debug!("web flow server stopped"),
                Err(_) => warn!("web flow server did not stop in time, aborting it"),
            }
            outcome
        }
        .instrument(span)
        .await
    }

    fn spawn_server(
        &self,
        completion: Completion<Result<F::Source, CallbackError>>,
        cancel_token: CancellationToken,
    ) -> AbortOnDropHandle<()> {
        let app = router(
            AppState {
                flow: self.flow.clone(),
                completion,
            },
            &self.callback_path,
        );
        let host = self.host.clone();
        let port = self.port;
        let task = tokio::spawn(
            async move {
                let listener = match TcpListener::bind((host.as_str(), port)).await {
                    Ok(listener) => listener,
                    Err(err) => {
                        error!("Failed to bind web flow server: {err:#}");
                        return;
                    }
                };
                match listener.local_addr() {
                    Ok(addr) => info!(%addr, "web flow server listening"),
                    Err(err) => warn!("web flow server listening on unknown address: {err:#}"),
                }
                if let Err(err) = axum::serve(listener, app)
                    .with_graceful_shutdown(cancel_token.cancelled_owned())
                    .await
                {
                    warn!("web flow server failed: {err:#}");
                }
            }
            .instrument(self.span.clone()),
        );
        AbortOnDropHandle::new(task)
    }

    async fn await_outcome(
        &self,
        rx: oneshot::Receiver<Result<F::Source, CallbackError>>,
    ) -> Result<F::Source> {
        self.wait_until_ready().await?;

        let start_url = self.auth_start_url();
        if let Err(err) = (self.opener)(&start_url) {
            warn!("Failed to auto-open url: {err}");
            println!("Open this URL in a browser to complete the login:\n{start_url}");
        }

        let timeout = self.timeouts.completion;
        match tokio::time::timeout(timeout, rx).await {
            Err(_) => {
                n0_error::bail_any!("Timed out after {timeout:?} waiting for the OAuth flow to complete")
            }
            Ok(Err(_)) => n0_error::bail_any!("Web flow server stopped before the flow completed"),
            Ok(Ok(result)) => result.std_context("OAuth flow didn't complete successfully"),
        }
    }

    async fn wait_until_ready(&self) -> Result<()> {
        let url = format!("{}{HEALTH_PATH}", self.address());
        // No pooled connections, so shutting the server down isn't held up by us.
        let http = reqwest::Client::builder()
            .pool_max_idle_per_host(0)
            .build()
            .std_context("Failed to build HTTP client")?;
        let deadline = Instant::now() + self.timeouts.ready;
        loop {
            match http.get(&url).send().await {
                Ok(res) if res.status().is_success() => {
                    debug!("web flow server is ready");
                    return Ok(());
                }
                Ok(res) => debug!(status = %res.status(), "web flow server not ready"),
                Err(err) => debug!("web flow server not ready: {err:#}"),
            }
            if Instant::now() + self.timeouts.poll_interval > deadline {
                n0_error::bail_any!("Timed out waiting for web flow server at {url}");
            }
            tokio::time::sleep(self.timeouts.poll_interval).await;
        }
    }
}

struct AppState<F: AuthCodeFlow> {
    flow: Arc<F>,
    completion: Completion<Result<F::Source, CallbackError>>,
}

impl<F: AuthCodeFlow> Clone for AppState<F> {
    fn clone(&self) -> Self {
        Self {
            flow: self.flow.clone(),
            completion: self.completion.clone(),
        }
    }
}

fn router<F: AuthCodeFlow>(state: AppState<F>, callback_path: &str) -> Router {
    Router::new()
        .route(HEALTH_PATH, get(health))
        .route(AUTH_START_PATH, get(auth_start::<F>))
        .route(callback_path, get(auth_callback::<F>))
        .fallback(not_found)
        .with_state(state)
}

pub(crate) async fn health() -> Response {
    write_status(StatusCode::OK, HEALTH_MESSAGE)
}

pub(crate) async fn not_found(uri: Uri) -> Response {
    write_status(
        StatusCode::NOT_FOUND,
        format!("OIDC server doesn't handle the path; url: {uri}"),
    )
}

async fn auth_start<F: AuthCodeFlow>(State(state): State<AppState<F>>) -> Response {
    match state.flow.redirect_to_auth_url() {
        Ok(redirect) => {
            debug!(state = %redirect.state(), "redirecting to identity provider");
            redirect.into_response()
        }
        Err(err) => {
            error!("Failed to start OAuth flow: {err:#}");
            let response = err.response();
            state.completion.complete(Err(err));
            response
        }
    }
}

async fn auth_callback<F: AuthCodeFlow>(
    State(state): State<AppState<F>>,
    headers: HeaderMap,
    Query(params): Query<CallbackParams>,
) -> Response {
    match state.flow.handle_auth_code(&headers, &params).await {
        Ok((flow_state, source)) => {
            info!(state = %flow_state, "OAuth flow completed");
            if !state.completion.complete(Ok(source)) {
                warn!("Ignoring repeated OAuth callback");
            }
            (StatusCode::OK, FLOW_COMPLETE_MESSAGE).into_response()
        }
        Err(err) => {
            error!("OAuth callback failed: {err:#}");
            let response = err.response();
            if !state.completion.complete(Err(err)) {
                warn!("Ignoring repeated OAuth callback");
            }
            response
        }
    }
}
