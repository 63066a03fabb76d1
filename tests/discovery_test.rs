//! Authorization server discovery tests using wiremock

use serde_json::json;
use url::Url;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use gatehouse::auth::discovery::{
    discover, fetch_authorization_server_metadata, fetch_protected_resource_metadata,
};

fn resource_metadata(resource: &str, issuer: &str) -> serde_json::Value {
    json!({
        "resource": resource,
        "authorization_servers": [issuer],
        "scopes_supported": ["user"],
    })
}

fn server_metadata(issuer: &str) -> serde_json::Value {
    json!({
        "issuer": issuer,
        "authorization_endpoint": format!("{issuer}/authorize"),
        "token_endpoint": format!("{issuer}/token"),
        "registration_endpoint": format!("{issuer}/register"),
        "response_types_supported": ["code"],
        "code_challenge_methods_supported": ["S256"],
    })
}

#[tokio::test]
async fn test_metadata_url_from_challenge_is_used_first() {
    let server = MockServer::start().await;
    let base = server.uri();
    Mock::given(method("GET"))
        .and(path("/custom/prm"))
        .respond_with(ResponseTemplate::new(200).set_body_json(resource_metadata(&base, &base)))
        .expect(1)
        .mount(&server)
        .await;

    let challenge = format!(r#"Bearer error="invalid_token", resource_metadata="{base}/custom/prm""#);
    let meta = fetch_protected_resource_metadata(
        &reqwest::Client::new(),
        &Url::parse(&format!("{base}/mcp")).unwrap(),
        Some(&challenge),
    )
    .await
    .unwrap();
    assert_eq!(meta.resource, base);
}

#[tokio::test]
async fn test_broken_challenge_url_falls_back_to_path_inserted_well_known() {
    let server = MockServer::start().await;
    let base = server.uri();
    Mock::given(method("GET"))
        .and(path("/custom/prm"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/.well-known/oauth-protected-resource/mcp"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(resource_metadata(&format!("{base}/mcp"), &base)),
        )
        .mount(&server)
        .await;

    let challenge = format!(r#"Bearer resource_metadata="{base}/custom/prm""#);
    let meta = fetch_protected_resource_metadata(
        &reqwest::Client::new(),
        &Url::parse(&format!("{base}/mcp")).unwrap(),
        Some(&challenge),
    )
    .await
    .unwrap();
    assert_eq!(meta.resource, format!("{base}/mcp"));
}

#[tokio::test]
async fn test_issuer_with_path_falls_through_to_openid_configuration() {
    let server = MockServer::start().await;
    let issuer = format!("{}/tenant", server.uri());
    Mock::given(method("GET"))
        .and(path("/tenant/.well-known/openid-configuration"))
        .respond_with(ResponseTemplate::new(200).set_body_json(server_metadata(&issuer)))
        .mount(&server)
        .await;

    let meta = fetch_authorization_server_metadata(
        &reqwest::Client::new(),
        &Url::parse(&issuer).unwrap(),
    )
    .await
    .unwrap();
    assert_eq!(meta.issuer, issuer);
    assert_eq!(meta.token_endpoint, format!("{issuer}/token"));
}

#[tokio::test]
async fn test_no_metadata_anywhere_is_discovery_error() {
    let server = MockServer::start().await;
    let err = fetch_authorization_server_metadata(
        &reqwest::Client::new(),
        &Url::parse(&server.uri()).unwrap(),
    )
    .await
    .unwrap_err();
    assert!(matches!(
        err.downcast_ref::<gatehouse::error::FlowError>(),
        Some(gatehouse::error::FlowError::Discovery(_))
    ));
}

#[tokio::test]
async fn test_discover_follows_resource_to_authorization_server() {
    let resource = MockServer::start().await;
    let auth = MockServer::start().await;
    let resource_url = format!("{}/mcp", resource.uri());

    Mock::given(method("GET"))
        .and(path("/.well-known/oauth-protected-resource/mcp"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(resource_metadata(&resource_url, &auth.uri())),
        )
        .mount(&resource)
        .await;
    Mock::given(method("GET"))
        .and(path("/.well-known/oauth-authorization-server"))
        .respond_with(ResponseTemplate::new(200).set_body_json(server_metadata(&auth.uri())))
        .mount(&auth)
        .await;

    let found = discover(&reqwest::Client::new(), &Url::parse(&resource_url).unwrap())
        .await
        .unwrap();
    assert_eq!(found.server.issuer, auth.uri());
    assert_eq!(found.default_scope().as_deref(), Some("user"));
    assert!(found.resource.is_some());
}

#[tokio::test]
async fn test_discover_without_resource_metadata_uses_origin() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/.well-known/oauth-authorization-server"))
        .respond_with(ResponseTemplate::new(200).set_body_json(server_metadata(&server.uri())))
        .mount(&server)
        .await;

    let found = discover(
        &reqwest::Client::new(),
        &Url::parse(&format!("{}/mcp", server.uri())).unwrap(),
    )
    .await
    .unwrap();
    assert!(found.resource.is_none());
    assert_eq!(found.server.issuer, server.uri());
}
