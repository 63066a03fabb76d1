//! Protected resource server
//!
//! Serves RFC 9728 Protected Resource Metadata and one bearer-protected
//! MCP endpoint.  Tokens are checked by whichever
//! [`TokenVerifier`] the deployment selects.

pub mod middleware;
pub mod tools;

use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Extension, Json, Router};
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::auth::discovery::{
    protected_resource_metadata_url, ProtectedResourceMetadata, PROTECTED_RESOURCE_WELL_KNOWN,
};
use crate::config::{Config, VerifierMode};
use crate::error::{GatehouseError, Result};
use crate::verifier::{self, AccessTokenInfo, TokenVerifier};

/// Everything the resource routes share.
pub struct ResourceState {
    /// Token verifier for the protected endpoint
    pub verifier: Arc<dyn TokenVerifier>,
    /// Document served at the well-known URIs
    pub metadata: ProtectedResourceMetadata,
    /// Absolute URL of the metadata document, advertised in challenges
    pub metadata_url: String,
    /// Scope a token must carry
    pub required_scope: String,
    /// Route of the protected endpoint
    pub resource_path: String,
}

impl ResourceState {
    /// Creates the state for a resource identified by `resource_url`.
    ///
    /// # Errors
    ///
    /// Returns a configuration error when `resource_url` is not absolute.
    pub fn new(
        verifier: Arc<dyn TokenVerifier>,
        resource_url: &str,
        authorization_server: &str,
        required_scope: &str,
    ) -> Result<Self> {
        let url = Url::parse(resource_url).map_err(|e| {
            GatehouseError::Config(format!("invalid resource URL {resource_url}: {e}"))
        })?;
        let resource_path = match url.path() {
            "" => "/".to_string(),
            p => p.to_string(),
        };

        Ok(Self {
            verifier,
            metadata: ProtectedResourceMetadata {
                resource: resource_url.to_string(),
                authorization_servers: vec![authorization_server.trim_end_matches('/').to_string()],
                scopes_supported: Some(vec![required_scope.to_string()]),
                bearer_methods_supported: Some(vec!["header".to_string()]),
            },
            metadata_url: protected_resource_metadata_url(&url).to_string(),
            required_scope: required_scope.to_string(),
            resource_path,
        })
    }

    /// Builds the state, including the verifier, from configuration.
    ///
    /// In JWKS mode the advertised authorization server is the token issuer
    /// and the required scope is the one the JWKS verifier enforces.
    ///
    /// # Errors
    ///
    /// Propagates verifier construction errors.
    pub fn from_config(config: &Config) -> Result<Self> {
        let rs = &config.resource_server;
        let verifier = verifier::from_config(config)?;

        let (authorization_server, scope) = match rs.verifier {
            VerifierMode::Jwks => (
                config
                    .jwks
                    .resolved_issuer()
                    .unwrap_or_else(|| rs.auth_server_url.clone()),
                config.jwks.required_scope.clone(),
            ),
            VerifierMode::Introspection => (rs.auth_server_url.clone(), rs.mcp_scope.clone()),
        };

        let mut state = Self::new(verifier, &rs.resource_url(), &authorization_server, &scope)?;
        state.resource_path = rs.resource_path.clone();
        Ok(state)
    }
}

/// Builds the resource server router.
pub fn router(state: Arc<ResourceState>) -> Router {
    let protected = Router::new()
        .route(&state.resource_path, post(mcp_endpoint))
        .route_layer(axum::middleware::from_fn_with_state(
            state.clone(),
            middleware::require_bearer,
        ));

    let mut app = Router::new().route(PROTECTED_RESOURCE_WELL_KNOWN, get(resource_metadata));
    let path = state.resource_path.trim_end_matches('/');
    if !path.is_empty() {
        app = app.route(
            &format!("{PROTECTED_RESOURCE_WELL_KNOWN}{path}"),
            get(resource_metadata),
        );
    }

    app.merge(protected).with_state(state)
}

async fn resource_metadata(State(state): State<Arc<ResourceState>>) -> Json<ProtectedResourceMetadata> {
    Json(state.metadata.clone())
}

async fn mcp_endpoint(
    Extension(caller): Extension<AccessTokenInfo>,
    body: std::result::Result<Json<tools::JsonRpcRequest>, JsonRejection>,
) -> Response {
    let Json(request) = match body {
        Ok(body) => body,
        Err(rejection) => {
            let error = serde_json::json!({
                "jsonrpc": "2.0",
                "id": null,
                "error": { "code": -32700, "message": rejection.body_text() },
            });
            return (StatusCode::BAD_REQUEST, Json(error)).into_response();
        }
    };

    match tools::dispatch(request, &caller) {
        Some(response) => Json(response).into_response(),
        None => StatusCode::ACCEPTED.into_response(),
    }
}

/// Binds the configured address and serves until `shutdown` fires.
///
/// # Errors
///
/// Returns an error when the verifier cannot be built, the socket cannot
/// be bound, or the server fails.
pub async fn serve(config: &Config, shutdown: CancellationToken) -> Result<()> {
    let state = Arc::new(ResourceState::from_config(config)?);
    let rs = &config.resource_server;
    let addr = format!("{}:{}", rs.host, rs.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| GatehouseError::Server(format!("failed to bind {addr}: {e}")))?;

    tracing::info!(
        addr = %addr,
        resource = %state.metadata.resource,
        verifier = state.verifier.name(),
        required_scope = %state.required_scope,
        "Resource server listening"
    );

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .map_err(|e| GatehouseError::Server(format!("resource server failed: {e}")))?;

    tracing::info!("Resource server stopped");
    Ok(())
}
