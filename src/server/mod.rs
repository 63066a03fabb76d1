//! Authorization server
//!
//! A small in-memory OAuth 2.0 authorization server: discovery, dynamic
//! registration, the authorization endpoint with a username/password login
//! challenge, code exchange, introspection and revocation.
//!
//! # Endpoints
//!
//! | Method | Path | Purpose |
//! |---|---|---|
//! | GET | `/.well-known/oauth-authorization-server` | RFC 8414 metadata |
//! | GET | `/.well-known/openid-configuration` | same document |
//! | POST | `/register` | RFC 7591 registration |
//! | GET | `/authorize` | start a grant |
//! | GET | `/login` | login challenge |
//! | POST | `/login/callback` | credential check, code issuance |
//! | POST | `/token` | code exchange |
//! | POST | `/introspect` | RFC 7662 |
//! | POST | `/revoke` | RFC 7009 |

pub mod handlers;
pub mod provider;

use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use tokio_util::sync::CancellationToken;

use crate::config::AuthServerConfig;
use crate::error::{GatehouseError, Result};

pub use provider::{AuthorizationServerProvider, GrantPhase, IntrospectionResponse, TokenStatus};

/// Builds the router for `provider`.
pub fn router(provider: Arc<AuthorizationServerProvider>) -> Router {
    Router::new()
        .route(
            "/.well-known/oauth-authorization-server",
            get(handlers::metadata),
        )
        .route("/.well-known/openid-configuration", get(handlers::metadata))
        .route("/register", post(handlers::register))
        .route("/authorize", get(handlers::authorize))
        .route("/login", get(handlers::login_page))
        .route("/login/callback", post(handlers::login_callback))
        .route("/token", post(handlers::token))
        .route("/introspect", post(handlers::introspect))
        .route("/revoke", post(handlers::revoke))
        .with_state(provider)
}

/// Binds `host:port` and serves until `shutdown` fires.
///
/// # Errors
///
/// Returns [`GatehouseError::Server`] when the socket cannot be bound or
/// the server fails.
pub async fn serve(config: AuthServerConfig, shutdown: CancellationToken) -> Result<()> {
    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| GatehouseError::Server(format!("failed to bind {addr}: {e}")))?;

    let provider = Arc::new(AuthorizationServerProvider::new(config));
    tracing::info!(
        addr = %addr,
        issuer = provider.issuer(),
        "Authorization server listening"
    );

    axum::serve(listener, router(provider))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .map_err(|e| GatehouseError::Server(format!("authorization server failed: {e}")))?;

    tracing::info!("Authorization server stopped");
    Ok(())
}
