//! OAuth / OIDC discovery
//!
//! RFC 9728 Protected Resource Metadata and RFC 8414 / OpenID Connect
//! Discovery.  The same document types are served by the resource server
//! and the authorization server in this crate and consumed by the login
//! client.
//!
//! # Discovery sequence
//!
//! 1. The client issues an unauthenticated request to the resource server.
//! 2. The server answers `401` with `WWW-Authenticate: Bearer
//!    resource_metadata="<url>"`.
//! 3. [`fetch_protected_resource_metadata`] retrieves that document, or
//!    falls back to the RFC 9728 well-known URI.
//! 4. The first listed authorization server is resolved with
//!    [`fetch_authorization_server_metadata`], which tries the RFC 8414 and
//!    OIDC well-known locations in order.
//! 5. Without protected-resource metadata the resource origin itself is
//!    tried as the issuer.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{FlowError, Result};

/// RFC 9728 well-known path prefix.
pub const PROTECTED_RESOURCE_WELL_KNOWN: &str = "/.well-known/oauth-protected-resource";

/// RFC 8414 well-known path prefix.
pub const AUTHORIZATION_SERVER_WELL_KNOWN: &str = "/.well-known/oauth-authorization-server";

const OPENID_WELL_KNOWN: &str = "/.well-known/openid-configuration";

/// Metadata document describing a protected resource (RFC 9728).
///
/// # Examples
///
/// ```
/// use gatehouse::auth::discovery::ProtectedResourceMetadata;
///
/// let json = r#"{
///     "resource": "https://api.example.com/mcp",
///     "authorization_servers": ["https://auth.example.com"]
/// }"#;
///
/// let meta: ProtectedResourceMetadata = serde_json::from_str(json).unwrap();
/// assert_eq!(meta.authorization_servers.len(), 1);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProtectedResourceMetadata {
    /// The canonical URI of the protected resource.
    pub resource: String,

    /// Issuer URIs of the authorization servers protecting this resource.
    pub authorization_servers: Vec<String>,

    /// Scopes the resource understands.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scopes_supported: Option<Vec<String>>,

    /// Supported ways of presenting a bearer token.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bearer_methods_supported: Option<Vec<String>>,
}

/// Metadata document describing an authorization server (RFC 8414).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthorizationServerMetadata {
    /// The issuer identifier.
    pub issuer: String,

    /// Authorization endpoint (RFC 6749 section 3.1).
    pub authorization_endpoint: String,

    /// Token endpoint (RFC 6749 section 3.2).
    pub token_endpoint: String,

    /// Dynamic Client Registration endpoint (RFC 7591).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub registration_endpoint: Option<String>,

    /// Token introspection endpoint (RFC 7662).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub introspection_endpoint: Option<String>,

    /// Token revocation endpoint (RFC 7009).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revocation_endpoint: Option<String>,

    /// Key set URL for signed tokens.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jwks_uri: Option<String>,

    /// Scopes the server supports.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scopes_supported: Option<Vec<String>>,

    /// Supported `response_type` values.
    #[serde(default)]
    pub response_types_supported: Vec<String>,

    /// Supported grant types.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub grant_types_supported: Option<Vec<String>>,

    /// Supported token endpoint client authentication methods.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_endpoint_auth_methods_supported: Option<Vec<String>>,

    /// Supported PKCE methods.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code_challenge_methods_supported: Option<Vec<String>>,

    /// Fields not modelled above.
    #[serde(flatten)]
    pub extra: HashMap<String, serde_json::Value>,
}

/// What discovery found for a resource.
#[derive(Debug, Clone)]
pub struct DiscoveredServer {
    /// The resource's own metadata, when it publishes any.
    pub resource: Option<ProtectedResourceMetadata>,

    /// The authorization server to log in with.
    pub server: AuthorizationServerMetadata,
}

impl DiscoveredServer {
    /// The scope to request when none is configured: the resource's
    /// advertised scopes, else the server's.
    pub fn default_scope(&self) -> Option<String> {
        self.resource
            .as_ref()
            .and_then(|r| r.scopes_supported.clone())
            .or_else(|| self.server.scopes_supported.clone())
            .filter(|s| !s.is_empty())
            .map(|s| s.join(" "))
    }
}

/// Extracts an auth-param such as `resource_metadata` or `scope` from a
/// `WWW-Authenticate` challenge.
///
/// Quoted and unquoted values are both accepted.
pub fn parse_challenge_param(www_authenticate: &str, name: &str) -> Option<String> {
    let key = format!("{name}=");
    let mut search_from = 0;
    while let Some(found) = www_authenticate[search_from..].find(&key) {
        let pos = search_from + found;
        // Skip matches inside a longer parameter name (e.g. `error_description=`).
        let boundary = pos == 0
            || www_authenticate[..pos]
                .chars()
                .next_back()
                .is_some_and(|c| c == ' ' || c == ',');
        if boundary {
            let rest = &www_authenticate[pos + key.len()..];
            return if let Some(inner) = rest.strip_prefix('"') {
                let end = inner.find('"')?;
                Some(inner[..end].to_string())
            } else {
                let end = rest
                    .find(|c: char| c.is_whitespace() || c == ',')
                    .unwrap_or(rest.len());
                Some(rest[..end].to_string())
            };
        }
        search_from = pos + key.len();
    }
    None
}

/// Sends an unauthenticated request to the resource and returns its
/// `WWW-Authenticate` challenge, if it answered `401`.
pub async fn probe_resource(http: &reqwest::Client, resource_url: &Url) -> Option<String> {
    let resp = http
        .post(resource_url.clone())
        .json(&serde_json::json!({"jsonrpc": "2.0", "id": 0, "method": "initialize"}))
        .send()
        .await
        .ok()?;
    if resp.status() != reqwest::StatusCode::UNAUTHORIZED {
        return None;
    }
    resp.headers()
        .get(reqwest::header::WWW_AUTHENTICATE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

/// The RFC 9728 well-known URI for `resource_url`.
pub fn protected_resource_metadata_url(resource_url: &Url) -> Url {
    let path = resource_url.path().trim_end_matches('/');
    let mut url = resource_url.clone();
    url.set_path(&format!("{PROTECTED_RESOURCE_WELL_KNOWN}{path}"));
    url.set_query(None);
    url.set_fragment(None);
    url
}

/// Fetches the RFC 9728 Protected Resource Metadata document.
///
/// Uses the `resource_metadata` URL from `www_authenticate` when present,
/// otherwise the well-known URI built from `resource_url`.
///
/// # Errors
///
/// Returns [`FlowError::Discovery`] if neither location yields a document.
pub async fn fetch_protected_resource_metadata(
    http: &reqwest::Client,
    resource_url: &Url,
    www_authenticate: Option<&str>,
) -> Result<ProtectedResourceMetadata> {
    let advertised = www_authenticate
        .and_then(|h| parse_challenge_param(h, "resource_metadata"))
        .and_then(|u| Url::parse(&u).ok());

    let candidates: Vec<Url> = advertised
        .into_iter()
        .chain(std::iter::once(protected_resource_metadata_url(resource_url)))
        .collect();

    for candidate in candidates {
        tracing::debug!(url = %candidate, "Fetching protected resource metadata");
        let resp = match http.get(candidate.clone()).send().await {
            Ok(r) => r,
            Err(e) => {
                tracing::debug!("Metadata fetch from {} failed: {}", candidate, e);
                continue;
            }
        };
        if !resp.status().is_success() {
            continue;
        }
        match resp.json::<ProtectedResourceMetadata>().await {
            Ok(meta) => return Ok(meta),
            Err(e) => tracing::debug!("Invalid metadata at {}: {}", candidate, e),
        }
    }

    Err(FlowError::Discovery(format!(
        "protected resource metadata not found for {resource_url}"
    ))
    .into())
}

/// Candidate well-known URLs for an issuer, in the order they are tried.
///
/// 1. `/.well-known/oauth-authorization-server<path>`
/// 2. `/.well-known/openid-configuration<path>`
/// 3. `<issuer>/.well-known/openid-configuration`
/// 4. `/.well-known/oauth-authorization-server`
/// 5. `/.well-known/openid-configuration`
///
/// Duplicates (an issuer without a path) are removed.
pub fn build_as_candidate_urls(issuer: &Url) -> Vec<Url> {
    let path = issuer.path().trim_end_matches('/').to_string();
    let at = |p: String| {
        let mut u = issuer.clone();
        u.set_path(&p);
        u.set_query(None);
        u.set_fragment(None);
        u
    };

    let all = [
        at(format!("{AUTHORIZATION_SERVER_WELL_KNOWN}{path}")),
        at(format!("{OPENID_WELL_KNOWN}{path}")),
        at(format!("{path}{OPENID_WELL_KNOWN}")),
        at(AUTHORIZATION_SERVER_WELL_KNOWN.to_string()),
        at(OPENID_WELL_KNOWN.to_string()),
    ];

    let mut candidates: Vec<Url> = Vec::with_capacity(all.len());
    for url in all {
        if !candidates.contains(&url) {
            candidates.push(url);
        }
    }
    candidates
}

/// Fetches the authorization server metadata for `issuer`.
///
/// # Errors
///
/// Returns [`FlowError::Discovery`] if every candidate fails.
pub async fn fetch_authorization_server_metadata(
    http: &reqwest::Client,
    issuer: &Url,
) -> Result<AuthorizationServerMetadata> {
    for candidate in build_as_candidate_urls(issuer) {
        let resp = match http.get(candidate.clone()).send().await {
            Ok(r) => r,
            Err(_) => continue,
        };
        if !resp.status().is_success() {
            continue;
        }
        if let Ok(meta) = resp.json::<AuthorizationServerMetadata>().await {
            tracing::debug!(url = %candidate, issuer = %meta.issuer, "Discovered authorization server");
            return Ok(meta);
        }
    }

    Err(FlowError::Discovery(format!(
        "authorization server metadata not found for issuer {issuer}"
    ))
    .into())
}

/// Resolves the authorization server protecting `resource_url`.
///
/// # Errors
///
/// Returns [`FlowError::Discovery`] if no authorization server can be found.
pub async fn discover(http: &reqwest::Client, resource_url: &Url) -> Result<DiscoveredServer> {
    let challenge = probe_resource(http, resource_url).await;
    let resource =
        match fetch_protected_resource_metadata(http, resource_url, challenge.as_deref()).await {
            Ok(meta) => Some(meta),
            Err(e) => {
                tracing::info!("No protected resource metadata ({}), trying resource origin", e);
                None
            }
        };

    let issuer = match resource
        .as_ref()
        .and_then(|r| r.authorization_servers.first())
    {
        Some(issuer) => Url::parse(issuer)
            .map_err(|e| FlowError::Discovery(format!("invalid issuer {issuer}: {e}")))?,
        None => {
            let mut origin = resource_url.clone();
            origin.set_path("/");
            origin.set_query(None);
            origin.set_fragment(None);
            origin
        }
    };

    let server = fetch_authorization_server_metadata(http, &issuer).await?;
    Ok(DiscoveredServer { resource, server })
}
