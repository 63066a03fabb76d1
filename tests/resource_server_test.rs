//! Resource server tests: metadata, bearer enforcement, tool dispatch

use std::sync::Arc;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{header, Method, Request, StatusCode};
use axum::Router;
use serde_json::{json, Value};
use tower::ServiceExt;

use gatehouse::error::VerificationError;
use gatehouse::resource::{self, ResourceState};
use gatehouse::verifier::{AccessTokenInfo, TokenVerifier};

const RESOURCE: &str = "http://localhost:8001/mcp";
const AUTH_SERVER: &str = "http://localhost:9000";

/// Accepts `good` with scope `user` and `narrow` with scope `profile`.
struct FixedVerifier;

#[async_trait]
impl TokenVerifier for FixedVerifier {
    async fn verify_detailed(&self, token: &str) -> Result<AccessTokenInfo, VerificationError> {
        let scopes = match token {
            "good" => vec!["user".to_string()],
            "narrow" => vec!["profile".to_string()],
            _ => return Err(VerificationError::InactiveToken),
        };
        Ok(AccessTokenInfo {
            token: token.to_string(),
            client_id: "client-1".to_string(),
            scopes,
            expires_at: None,
            resource: Some(RESOURCE.to_string()),
        })
    }

    fn name(&self) -> &'static str {
        "fixed"
    }
}

fn app() -> Router {
    let state = ResourceState::new(Arc::new(FixedVerifier), RESOURCE, AUTH_SERVER, "user").unwrap();
    resource::router(Arc::new(state))
}

fn rpc(token: Option<&str>, body: &Value) -> Request<Body> {
    let mut builder = Request::builder()
        .method(Method::POST)
        .uri("/mcp")
        .header(header::CONTENT_TYPE, "application/json");
    if let Some(token) = token {
        builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
    }
    builder.body(Body::from(body.to_string())).unwrap()
}

async fn send(request: Request<Body>) -> (StatusCode, Option<String>, Value) {
    let resp = app().oneshot(request).await.unwrap();
    let status = resp.status();
    let challenge = resp
        .headers()
        .get(header::WWW_AUTHENTICATE)
        .map(|v| v.to_str().unwrap().to_string());
    let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, challenge, body)
}

fn tools_list() -> Value {
    json!({"jsonrpc": "2.0", "id": 1, "method": "tools/list"})
}

#[tokio::test]
async fn test_protected_resource_metadata_at_both_paths() {
    for path in [
        "/.well-known/oauth-protected-resource",
        "/.well-known/oauth-protected-resource/mcp",
    ] {
        let (status, _, body) = send(Request::builder().uri(path).body(Body::empty()).unwrap()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["resource"], RESOURCE);
        assert_eq!(body["authorization_servers"], json!([AUTH_SERVER]));
        assert_eq!(body["scopes_supported"], json!(["user"]));
    }
}

#[tokio::test]
async fn test_missing_token_gets_challenge_with_metadata_url() {
    let (status, challenge, body) = send(rpc(None, &tools_list())).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    let challenge = challenge.unwrap();
    assert!(challenge.starts_with("Bearer "));
    assert!(challenge.contains("error=\"invalid_token\""));
    assert!(challenge.contains(
        "resource_metadata=\"http://localhost:8001/.well-known/oauth-protected-resource/mcp\""
    ));
    assert_eq!(body["error"], "invalid_token");
}

#[tokio::test]
async fn test_invalid_token_gets_same_response_as_missing() {
    let (missing_status, missing_challenge, missing_body) = send(rpc(None, &tools_list())).await;
    let (status, challenge, body) = send(rpc(Some("forged"), &tools_list())).await;
    assert_eq!(status, missing_status);
    assert_eq!(challenge, missing_challenge);
    assert_eq!(body, missing_body);
}

#[tokio::test]
async fn test_token_without_required_scope_is_forbidden() {
    let (status, challenge, body) = send(rpc(Some("narrow"), &tools_list())).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert!(challenge.unwrap().contains("error=\"insufficient_scope\""));
    assert_eq!(body["error"], "insufficient_scope");
}

#[tokio::test]
async fn test_valid_token_lists_tools() {
    let (status, _, body) = send(rpc(Some("good"), &tools_list())).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["id"], 1);
    let tools = body["result"]["tools"].as_array().unwrap();
    assert!(tools.iter().any(|t| t["name"] == "get_time"));
}

#[tokio::test]
async fn test_valid_token_calls_get_time() {
    let call = json!({
        "jsonrpc": "2.0",
        "id": "call-1",
        "method": "tools/call",
        "params": {"name": "get_time", "arguments": {}},
    });
    let (status, _, body) = send(rpc(Some("good"), &call)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["id"], "call-1");
    assert_eq!(body["result"]["structuredContent"]["timezone"], "UTC");
}

#[tokio::test]
async fn test_unknown_method_is_jsonrpc_error() {
    let (status, _, body) = send(rpc(
        Some("good"),
        &json!({"jsonrpc": "2.0", "id": 7, "method": "resources/list"}),
    ))
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["error"]["code"], -32601);
}

#[tokio::test]
async fn test_notification_is_accepted_without_body() {
    let (status, _, _) = send(rpc(
        Some("good"),
        &json!({"jsonrpc": "2.0", "method": "notifications/initialized"}),
    ))
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
}

#[tokio::test]
async fn test_malformed_body_is_parse_error() {
    let request = Request::builder()
        .method(Method::POST)
        .uri("/mcp")
        .header(header::CONTENT_TYPE, "application/json")
        .header(header::AUTHORIZATION, "Bearer good")
        .body(Body::from("{not json"))
        .unwrap();
    let (status, _, body) = send(request).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], -32700);
}
