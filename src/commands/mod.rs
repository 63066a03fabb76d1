//! Command handlers for the CLI
//!
//! - `serve`  -- run the authorization server or the resource server
//! - `login`  -- interactive browser login against a protected resource
//! - `verify` -- check a bearer token with the configured verifier

use tokio_util::sync::CancellationToken;

pub mod login;
pub mod serve;
pub mod verify;

/// A token cancelled on Ctrl-C.
pub(crate) fn shutdown_on_ctrl_c() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => tracing::info!("Shutdown requested"),
            Err(e) => tracing::warn!("Failed to listen for Ctrl-C: {}", e),
        }
        trigger.cancel();
    });
    token
}
