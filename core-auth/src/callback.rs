//! Loopback listener for the OAuth2 browser redirect.
//!
//! The server answers a single route, `GET /callback`, and forwards the
//! outcome of the first valid redirect to [`CallbackServer::wait_for_code`].
//! It validates the `state` parameter before looking at anything else.

use crate::error::{AuthError, Result};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::Html;
use axum::routing::get;
use axum::Router;
use serde::Deserialize;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub const CALLBACK_PATH: &str = "/callback";

/// How long [`CallbackServer::shutdown`] waits for in-flight requests.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

const SUCCESS_PAGE: &str = "<html><body><h1>Authentication successful</h1>\
<p>You can close this window and return to the terminal.</p></body></html>";
const FAILURE_PAGE: &str = "<html><body><h1>Authentication failed</h1>\
<p>Return to the terminal for details.</p></body></html>";

#[derive(Debug, Deserialize)]
struct CallbackParams {
    code: Option<String>,
    state: Option<String>,
    error: Option<String>,
    error_description: Option<String>,
}

#[derive(Clone)]
struct CallbackState {
    expected_state: Arc<str>,
    code_tx: mpsc::Sender<String>,
    error_tx: mpsc::Sender<AuthError>,
}

/// Running loopback server for one authorization attempt.
pub struct CallbackServer {
    local_addr: SocketAddr,
    code_rx: mpsc::Receiver<String>,
    error_rx: mpsc::Receiver<AuthError>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl CallbackServer {
    /// Bind `addr` and start serving redirects that must carry `expected_state`.
    pub async fn bind(addr: SocketAddr, expected_state: impl Into<String>) -> Result<Self> {
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .map_err(|e| AuthError::CallbackServer {
                addr: addr.to_string(),
                reason: e.to_string(),
            })?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| AuthError::CallbackServer {
                addr: addr.to_string(),
                reason: e.to_string(),
            })?;

        let (code_tx, code_rx) = mpsc::channel(1);
        let (error_tx, error_rx) = mpsc::channel(1);
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

        let state = CallbackState {
            expected_state: Arc::from(expected_state.into()),
            code_tx,
            error_tx,
        };
        let app = Router::new()
            .route(CALLBACK_PATH, get(handle_callback))
            .with_state(state);

        info!(addr = %local_addr, "Started OAuth callback listener");

        let task = tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    let _ = shutdown_rx.await;
                    debug!("OAuth callback listener shutting down");
                })
                .await
                .map_err(|e| error!(error = %e, "OAuth callback listener error"))
                .ok();
        });

        Ok(Self {
            local_addr,
            code_rx,
            error_rx,
            shutdown_tx: Some(shutdown_tx),
            task: Some(task),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Redirect URI to register with the authorization request.
    pub fn redirect_uri(&self) -> String {
        format!("http://localhost:{}{}", self.local_addr.port(), CALLBACK_PATH)
    }

    /// Wait for the authorization code, an error from the callback, caller
    /// cancellation, or `timeout`, whichever comes first.
    pub async fn wait_for_code(
        &mut self,
        cancel: &CancellationToken,
        timeout: Duration,
    ) -> Result<String> {
        tokio::select! {
            Some(code) = self.code_rx.recv() => Ok(code),
            Some(err) = self.error_rx.recv() => Err(err),
            _ = cancel.cancelled() => Err(AuthError::Cancelled),
            _ = tokio::time::sleep(timeout) => Err(AuthError::OperationTimeout {
                operation: "waiting for OAuth callback".to_string(),
            }),
        }
    }

    /// Stop the listener. Safe to call more than once.
    pub async fn shutdown(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(mut task) = self.task.take() {
            if tokio::time::timeout(SHUTDOWN_GRACE, &mut task).await.is_err() {
                warn!("OAuth callback listener did not stop in time; aborting");
                task.abort();
            }
        }
    }
}

impl Drop for CallbackServer {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

async fn handle_callback(
    State(state): State<CallbackState>,
    Query(params): Query<CallbackParams>,
) -> (StatusCode, Html<&'static str>) {
    let received_state = params.state.unwrap_or_default();
    if received_state != *state.expected_state {
        warn!("OAuth callback state mismatch");
        let _ = state.error_tx.try_send(AuthError::StateMismatch {
            expected: state.expected_state.to_string(),
            actual: received_state,
        });
        return (StatusCode::BAD_REQUEST, Html(FAILURE_PAGE));
    }

    if let Some(error) = params.error {
        let message = match params.error_description {
            Some(description) => format!("{}: {}", error, description),
            None => error,
        };
        warn!(error = %message, "Authorization denied by provider");
        let _ = state.error_tx.try_send(AuthError::ProviderDenied(message));
        return (StatusCode::BAD_REQUEST, Html(FAILURE_PAGE));
    }

    match params.code.filter(|code| !code.is_empty()) {
        Some(code) => {
            debug!("Received authorization code");
            let _ = state.code_tx.try_send(code);
            (StatusCode::OK, Html(SUCCESS_PAGE))
        }
        None => {
            warn!("OAuth callback without authorization code");
            let _ = state.error_tx.try_send(AuthError::MissingAuthCode);
            (StatusCode::BAD_REQUEST, Html(FAILURE_PAGE))
        }
    }
}
