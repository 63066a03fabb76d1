//! HTTP handlers for the authorization server endpoints.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::rejection::{FormRejection, JsonRejection};
use axum::extract::{Form, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{Html, IntoResponse, Redirect, Response};
use axum::Json;
use base64::Engine as _;
use serde::Deserialize;

use crate::oauth::{ClientMetadata, OAuthErrorResponse};
use crate::server::provider::{
    AuthorizationServerProvider, AuthorizeError, AuthorizeParams, LoginError, ProviderError,
    TokenRequest,
};
use crate::templates;

/// Shared handler state.
pub type ProviderState = Arc<AuthorizationServerProvider>;

/// `GET /.well-known/oauth-authorization-server` and the OIDC alias.
pub async fn metadata(State(provider): State<ProviderState>) -> impl IntoResponse {
    Json(provider.metadata())
}

/// `POST /register`
pub async fn register(
    State(provider): State<ProviderState>,
    body: Result<Json<ClientMetadata>, JsonRejection>,
) -> Response {
    let Json(metadata) = match body {
        Ok(body) => body,
        Err(rejection) => {
            return oauth_error(
                StatusCode::BAD_REQUEST,
                OAuthErrorResponse::new("invalid_client_metadata", rejection.body_text()),
            );
        }
    };

    match provider.register_client(metadata) {
        Ok(client) => (StatusCode::CREATED, Json(client)).into_response(),
        Err(e) => provider_error(e),
    }
}

/// `GET /authorize`
pub async fn authorize(
    State(provider): State<ProviderState>,
    Query(params): Query<AuthorizeParams>,
) -> Response {
    match provider.authorize(params) {
        Ok(login_path) => Redirect::to(&login_path).into_response(),
        Err(AuthorizeError::Untrusted { error, description }) => {
            tracing::warn!(error, %description, "Authorization request rejected");
            (
                StatusCode::BAD_REQUEST,
                Html(templates::error_page("Invalid authorization request", &description)),
            )
                .into_response()
        }
        Err(err) => match err.redirect_url() {
            Some(url) => Redirect::to(&url).into_response(),
            None => (
                StatusCode::BAD_REQUEST,
                Html(templates::error_page(
                    "Invalid authorization request",
                    "malformed redirect",
                )),
            )
                .into_response(),
        },
    }
}

/// `GET /login?state=...`
pub async fn login_page(
    State(provider): State<ProviderState>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let Some(state) = params.get("state").filter(|s| !s.is_empty()) else {
        return (
            StatusCode::BAD_REQUEST,
            Html(templates::error_page("Missing state", "state parameter is required")),
        )
            .into_response();
    };

    match provider.login_context(state) {
        Some((client_name, scope)) => {
            Html(templates::login_page(state, &client_name, &scope, None)).into_response()
        }
        None => unknown_request(),
    }
}

/// Form posted by the login page.
#[derive(Debug, Deserialize)]
pub struct LoginForm {
    #[serde(default)]
    state: String,
    #[serde(default)]
    username: String,
    #[serde(default)]
    password: String,
    #[serde(default)]
    action: Option<String>,
}

/// `POST /login/callback`
pub async fn login_callback(
    State(provider): State<ProviderState>,
    Form(form): Form<LoginForm>,
) -> Response {
    if form.action.as_deref() == Some("deny") {
        return match provider.deny(&form.state) {
            Some(url) => Redirect::to(&url).into_response(),
            None => unknown_request(),
        };
    }

    match provider.complete_login(&form.state, &form.username, &form.password) {
        Ok(url) => Redirect::to(&url).into_response(),
        Err(LoginError::InvalidCredentials) => {
            let (client_name, scope) = provider
                .login_context(&form.state)
                .unwrap_or_else(|| (String::new(), String::new()));
            (
                StatusCode::UNAUTHORIZED,
                Html(templates::login_page(
                    &form.state,
                    &client_name,
                    &scope,
                    Some("Invalid username or password."),
                )),
            )
                .into_response()
        }
        Err(LoginError::UnknownState) => unknown_request(),
    }
}

/// `POST /token`
pub async fn token(
    State(provider): State<ProviderState>,
    headers: HeaderMap,
    Form(request): Form<TokenRequest>,
) -> Response {
    let basic = match basic_credentials(&headers) {
        Ok(basic) => basic,
        Err(e) => return provider_error(e),
    };

    match provider.exchange_code(request, basic) {
        Ok(resp) => (
            [
                (header::CACHE_CONTROL, "no-store"),
                (header::PRAGMA, "no-cache"),
            ],
            Json(resp),
        )
            .into_response(),
        Err(e) => {
            tracing::warn!(error = e.error, description = %e.description, "Token request rejected");
            provider_error(e)
        }
    }
}

/// `POST /introspect`
///
/// Bodies that are not `application/x-www-form-urlencoded`, and an empty
/// `token`, are `invalid_request`.
pub async fn introspect(
    State(provider): State<ProviderState>,
    form: Result<Form<HashMap<String, String>>, FormRejection>,
) -> Response {
    let form = match form {
        Ok(Form(form)) => form,
        Err(rejection) => {
            return oauth_error(
                StatusCode::BAD_REQUEST,
                OAuthErrorResponse::new("invalid_request", rejection.body_text()),
            )
        }
    };
    match form.get("token").filter(|t| !t.is_empty()) {
        Some(token) => Json(provider.introspect(token)).into_response(),
        None => oauth_error(
            StatusCode::BAD_REQUEST,
            OAuthErrorResponse::new("invalid_request", "token is required"),
        ),
    }
}

/// `POST /revoke`
pub async fn revoke(
    State(provider): State<ProviderState>,
    form: Result<Form<HashMap<String, String>>, FormRejection>,
) -> Response {
    match form {
        Ok(Form(form)) => {
            if let Some(token) = form.get("token").filter(|t| !t.is_empty()) {
                provider.revoke(token);
            }
            StatusCode::OK.into_response()
        }
        Err(rejection) => oauth_error(
            StatusCode::BAD_REQUEST,
            OAuthErrorResponse::new("invalid_request", rejection.body_text()),
        ),
    }
}

fn basic_credentials(headers: &HeaderMap) -> Result<Option<(String, String)>, ProviderError> {
    let Some(value) = headers.get(header::AUTHORIZATION) else {
        return Ok(None);
    };
    let invalid = || ProviderError {
        error: "invalid_client",
        description: "malformed Basic credentials".to_string(),
    };

    let value = value.to_str().map_err(|_| invalid())?;
    let Some(encoded) = value
        .strip_prefix("Basic ")
        .or_else(|| value.strip_prefix("basic "))
    else {
        return Ok(None);
    };
    let decoded = base64::engine::general_purpose::STANDARD
        .decode(encoded.trim())
        .map_err(|_| invalid())?;
    let decoded = String::from_utf8(decoded).map_err(|_| invalid())?;
    let (id, secret) = decoded.split_once(':').ok_or_else(invalid)?;
    Ok(Some((id.to_string(), secret.to_string())))
}

fn provider_error(e: ProviderError) -> Response {
    let status = StatusCode::from_u16(e.status()).unwrap_or(StatusCode::BAD_REQUEST);
    let mut resp = oauth_error(status, e.body());
    if status == StatusCode::UNAUTHORIZED {
        resp.headers_mut().insert(
            header::WWW_AUTHENTICATE,
            header::HeaderValue::from_static("Basic realm=\"token\""),
        );
    }
    resp
}

fn oauth_error(status: StatusCode, body: OAuthErrorResponse) -> Response {
    (status, Json(body)).into_response()
}

fn unknown_request() -> Response {
    (
        StatusCode::BAD_REQUEST,
        Html(templates::error_page(
            "Unknown authorization request",
            "The authorization request was not found or has expired. Start the login again.",
        )),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_basic_credentials_parses_header() {
        let mut headers = HeaderMap::new();
        let encoded = base64::engine::general_purpose::STANDARD.encode("client:secret");
        headers.insert(
            header::AUTHORIZATION,
            format!("Basic {encoded}").parse().unwrap(),
        );
        assert_eq!(
            basic_credentials(&headers).unwrap(),
            Some(("client".to_string(), "secret".to_string()))
        );
    }

    #[test]
    fn test_basic_credentials_ignores_other_schemes() {
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, "Bearer abc".parse().unwrap());
        assert_eq!(basic_credentials(&headers).unwrap(), None);
        assert_eq!(basic_credentials(&HeaderMap::new()).unwrap(), None);
    }

    #[test]
    fn test_basic_credentials_rejects_garbage() {
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, "Basic !!!".parse().unwrap());
        assert_eq!(basic_credentials(&headers).unwrap_err().error, "invalid_client");
    }
}
