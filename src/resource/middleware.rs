//! Bearer token enforcement for the protected routes.
//!
//! Every failure to verify produces the same `401` with the same
//! description; the verifier's reason only reaches the logs.

use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::{header, HeaderValue, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;

use crate::oauth::OAuthErrorResponse;
use crate::resource::ResourceState;

const INVALID_TOKEN_DESCRIPTION: &str = "Authentication required";

/// Verifies the bearer token and stores the resulting
/// [`AccessTokenInfo`](crate::verifier::AccessTokenInfo) as a request
/// extension.
pub async fn require_bearer(
    State(state): State<Arc<ResourceState>>,
    mut request: Request,
    next: Next,
) -> Response {
    let token = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(bearer_token)
        .map(str::to_string);

    let Some(token) = token else {
        tracing::debug!("Request without bearer token");
        return unauthorized(&state);
    };

    let Some(info) = state.verifier.verify(&token).await else {
        return unauthorized(&state);
    };

    if !info.has_scope(&state.required_scope) {
        tracing::warn!(
            client_id = %info.client_id,
            required = %state.required_scope,
            "Token lacks required scope"
        );
        return insufficient_scope(&state);
    }

    request.extensions_mut().insert(info);
    next.run(request).await
}

/// Extracts the credential from an `Authorization` header value.
///
/// The scheme is matched case-insensitively.
pub fn bearer_token(value: &str) -> Option<&str> {
    let (scheme, credential) = value.split_once(' ')?;
    let credential = credential.trim();
    (scheme.eq_ignore_ascii_case("bearer") && !credential.is_empty()).then_some(credential)
}

fn unauthorized(state: &ResourceState) -> Response {
    challenge(
        StatusCode::UNAUTHORIZED,
        format!(
            "Bearer error=\"invalid_token\", error_description=\"{INVALID_TOKEN_DESCRIPTION}\", resource_metadata=\"{}\"",
            state.metadata_url
        ),
        OAuthErrorResponse::new("invalid_token", INVALID_TOKEN_DESCRIPTION),
    )
}

fn insufficient_scope(state: &ResourceState) -> Response {
    challenge(
        StatusCode::FORBIDDEN,
        format!(
            "Bearer error=\"insufficient_scope\", scope=\"{}\", resource_metadata=\"{}\"",
            state.required_scope, state.metadata_url
        ),
        OAuthErrorResponse::new(
            "insufficient_scope",
            format!("Required scope: {}", state.required_scope),
        ),
    )
}

fn challenge(status: StatusCode, www_authenticate: String, body: OAuthErrorResponse) -> Response {
    let mut resp = (status, Json(body)).into_response();
    match HeaderValue::from_str(&www_authenticate) {
        Ok(value) => {
            resp.headers_mut().insert(header::WWW_AUTHENTICATE, value);
        }
        Err(e) => tracing::error!("Invalid WWW-Authenticate value: {}", e),
    }
    resp
}
