//! Loopback listener for the OAuth redirect.
//!
//! The listener binds `127.0.0.1:<port>` for the duration of one login and
//! serves a single meaningful route, `GET /callback`.  The first redirect
//! that carries either `code` or `error` is stored; later arrivals get a page
//! but never overwrite it.  The waiting side is woken through a
//! [`tokio::sync::watch`] channel, so nothing polls.
//!
//! # Examples
//!
//! ```no_run
//! use std::time::Duration;
//! use gatehouse::auth::callback::CallbackListener;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let listener = CallbackListener::start(3030).await?;
//! println!("redirect to {}", listener.redirect_uri());
//! let params = listener.wait_for_callback(Duration::from_secs(300)).await;
//! listener.stop().await;
//! let params = params?;
//! println!("code {}", params.code);
//! # Ok(())
//! # }
//! ```

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{Html, IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use tokio::runtime::RuntimeFlavor;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::FlowError;
use crate::templates;

/// Upper bound on how long `stop()` waits for in-flight requests.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// What the browser redirect delivered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallbackResult {
    /// The authorization server issued a code.
    Authorized {
        /// The authorization code
        code: String,
        /// The `state` echoed back, if any
        state: Option<String>,
    },
    /// The authorization server redirected with an error.
    Failed {
        /// The OAuth error code, e.g. `access_denied`
        error: String,
        /// Optional `error_description`
        description: Option<String>,
        /// The `state` echoed back, if any
        state: Option<String>,
    },
}

/// Code and state handed to the orchestrator on success.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallbackParams {
    /// The authorization code
    pub code: String,
    /// The `state` echoed back; `None` when the redirect omitted it
    pub state: Option<String>,
}

type ResultSlot = Arc<watch::Sender<Option<CallbackResult>>>;

/// A short-lived local HTTP listener for the authorization redirect.
pub struct CallbackListener {
    local_addr: SocketAddr,
    result_rx: watch::Receiver<Option<CallbackResult>>,
    shutdown: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl CallbackListener {
    /// Binds the listener on `127.0.0.1:port` and starts serving.
    ///
    /// Port `0` lets the OS pick a free port; use [`port`](Self::port) to
    /// learn which one.
    ///
    /// # Errors
    ///
    /// Returns [`FlowError::ListenerBind`] if the socket cannot be bound.
    pub async fn start(port: u16) -> Result<Self, FlowError> {
        let listener = tokio::net::TcpListener::bind(("127.0.0.1", port))
            .await
            .map_err(|e| FlowError::ListenerBind(format!("127.0.0.1:{port}: {e}")))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| FlowError::ListenerBind(e.to_string()))?;

        let (tx, result_rx) = watch::channel(None);
        let app = Router::new()
            .route("/callback", get(handle_callback))
            .fallback(not_found)
            .with_state(Arc::new(tx));

        let shutdown = CancellationToken::new();
        let signal = shutdown.clone();
        let task = tokio::spawn(async move {
            let server = axum::serve(listener, app)
                .with_graceful_shutdown(async move { signal.cancelled().await });
            if let Err(e) = server.await {
                tracing::warn!("Callback listener terminated with error: {}", e);
            }
        });

        tracing::debug!(addr = %local_addr, "Callback listener started");

        Ok(Self {
            local_addr,
            result_rx,
            shutdown,
            task: Mutex::new(Some(task)),
        })
    }

    /// The bound port.
    pub fn port(&self) -> u16 {
        self.local_addr.port()
    }

    /// The bound socket address.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// The redirect URI to register and send with the authorization request.
    pub fn redirect_uri(&self) -> String {
        format!("http://localhost:{}/callback", self.port())
    }

    /// Returns the stored result without waiting.
    pub fn result(&self) -> Option<CallbackResult> {
        self.result_rx.borrow().clone()
    }

    /// Waits until a callback arrives or `timeout` elapses.
    ///
    /// # Errors
    ///
    /// - [`FlowError::CallbackTimeout`] when nothing arrived in time.
    /// - [`FlowError::CallbackError`] when the redirect carried an `error`,
    ///   or the listener was stopped while waiting.
    pub async fn wait_for_callback(&self, timeout: Duration) -> Result<CallbackParams, FlowError> {
        let mut rx = self.result_rx.clone();
        let received = match tokio::time::timeout(timeout, rx.wait_for(Option::is_some)).await {
            Err(_) => {
                return Err(FlowError::CallbackTimeout {
                    seconds: timeout.as_secs(),
                })
            }
            Ok(Err(_)) => {
                return Err(FlowError::CallbackError(
                    "callback listener stopped".to_string(),
                ))
            }
            Ok(Ok(value)) => value.clone(),
        };

        match received {
            Some(CallbackResult::Authorized { code, state }) => Ok(CallbackParams { code, state }),
            Some(CallbackResult::Failed { error, .. }) => Err(FlowError::CallbackError(error)),
            None => Err(FlowError::CallbackError(
                "callback listener stopped".to_string(),
            )),
        }
    }

    /// Shuts the listener down and releases the port.
    ///
    /// Safe to call repeatedly and from several tasks at once; only the
    /// first call waits for the server task.
    pub async fn stop(&self) {
        self.shutdown.cancel();

        let task = match self.task.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };

        if let Some(mut task) = task {
            if tokio::time::timeout(SHUTDOWN_GRACE, &mut task).await.is_err() {
                tracing::warn!("Callback listener did not drain in time, aborting");
                task.abort();
            }
            tracing::debug!(addr = %self.local_addr, "Callback listener stopped");
        }
    }

    /// Returns `true` once [`stop`](Self::stop) has been called.
    pub fn is_stopped(&self) -> bool {
        self.shutdown.is_cancelled()
    }
}

impl Drop for CallbackListener {
    fn drop(&mut self) {
        self.shutdown.cancel();
        let task = match self.task.get_mut() {
            Ok(slot) => slot.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        let Some(task) = task else {
            return;
        };
        task.abort();

        // Wait for the aborted task so the socket is closed before drop
        // returns.  A current-thread runtime cannot block here; there the
        // port is released on the runtime's next turn.
        match tokio::runtime::Handle::try_current() {
            Ok(handle) if handle.runtime_flavor() == RuntimeFlavor::MultiThread => {
                tokio::task::block_in_place(|| {
                    let _ = handle.block_on(task);
                });
                tracing::debug!(addr = %self.local_addr, "Callback listener released on drop");
            }
            _ => tracing::debug!(addr = %self.local_addr, "Callback listener aborted on drop"),
        }
    }
}

async fn handle_callback(
    State(slot): State<ResultSlot>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let state = params.get("state").cloned();

    if let Some(error) = params.get("error") {
        let result = CallbackResult::Failed {
            error: error.clone(),
            description: params.get("error_description").cloned(),
            state,
        };
        store_first(&slot, result);
        return (
            StatusCode::BAD_REQUEST,
            Html(templates::callback_error_page(error)),
        )
            .into_response();
    }

    if let Some(code) = params.get("code") {
        store_first(
            &slot,
            CallbackResult::Authorized {
                code: code.clone(),
                state,
            },
        );
        return Html(templates::callback_success_page()).into_response();
    }

    tracing::debug!("Callback without code or error");
    (StatusCode::NOT_FOUND, "Not Found").into_response()
}

/// Stores `result` only if nothing was stored yet.
fn store_first(slot: &ResultSlot, result: CallbackResult) {
    let stored = slot.send_if_modified(|current| {
        if current.is_some() {
            return false;
        }
        *current = Some(result);
        true
    });
    if stored {
        tracing::info!("Received OAuth callback");
    } else {
        tracing::debug!("Ignoring additional OAuth callback");
    }
}

async fn not_found() -> impl IntoResponse {
    (StatusCode::NOT_FOUND, "Not Found")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn slot() -> (ResultSlot, watch::Receiver<Option<CallbackResult>>) {
        let (tx, rx) = watch::channel(None);
        (Arc::new(tx), rx)
    }

    #[test]
    fn test_store_first_keeps_first_result() {
        let (tx, rx) = slot();
        store_first(
            &tx,
            CallbackResult::Authorized {
                code: "first".to_string(),
                state: None,
            },
        );
        store_first(
            &tx,
            CallbackResult::Failed {
                error: "access_denied".to_string(),
                description: None,
                state: None,
            },
        );
        assert_eq!(
            *rx.borrow(),
            Some(CallbackResult::Authorized {
                code: "first".to_string(),
                state: None
            })
        );
    }

    #[tokio::test]
    async fn test_wait_times_out_without_callback() {
        let listener = CallbackListener::start(0).await.unwrap();
        let err = listener
            .wait_for_callback(Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, FlowError::CallbackTimeout { .. }));
        listener.stop().await;
    }

    #[tokio::test]
    async fn test_redirect_uri_uses_bound_port() {
        let listener = CallbackListener::start(0).await.unwrap();
        assert_ne!(listener.port(), 0);
        assert_eq!(
            listener.redirect_uri(),
            format!("http://localhost:{}/callback", listener.port())
        );
        listener.stop().await;
    }

    #[tokio::test]
    async fn test_stop_wakes_waiter() {
        let listener = Arc::new(CallbackListener::start(0).await.unwrap());
        let waiter = {
            let listener = Arc::clone(&listener);
            tokio::spawn(async move { listener.wait_for_callback(Duration::from_secs(30)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        listener.stop().await;

        let outcome = tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(outcome, Err(FlowError::CallbackError(_))));
    }

    #[tokio::test]
    async fn test_bind_conflict_is_listener_bind_error() {
        let first = CallbackListener::start(0).await.unwrap();
        let err = CallbackListener::start(first.port()).await.err().unwrap();
        assert!(matches!(err, FlowError::ListenerBind(_)));
        first.stop().await;
    }
}
