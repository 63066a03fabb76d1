//! OAuth 2.0 wire types shared by the client flow, the verifiers, and the
//! authorization server.
//!
//! # References
//!
//! - RFC 6749 OAuth 2.0 <https://www.rfc-editor.org/rfc/rfc6749>
//! - RFC 7591 Dynamic Registration <https://www.rfc-editor.org/rfc/rfc7591>
//! - RFC 8707 Resource Indicators <https://www.rfc-editor.org/rfc/rfc8707>

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

/// Grant type for the authorization code flow.
pub const GRANT_AUTHORIZATION_CODE: &str = "authorization_code";

/// Token type issued by the authorization server.
pub const BEARER: &str = "Bearer";

// ---------------------------------------------------------------------------
// Client registration
// ---------------------------------------------------------------------------

/// A registered OAuth client.
///
/// Either created by Dynamic Client Registration (one per login flow,
/// discarded afterwards) or loaded once from configuration as a
/// pre-registered client that stays immutable for the process lifetime.
///
/// # Examples
///
/// ```
/// use gatehouse::oauth::ClientRegistration;
///
/// let client = ClientRegistration::public(
///     "my-client",
///     ["http://localhost:3030/callback".to_string()],
/// );
/// assert!(client.allows_redirect("http://localhost:3030/callback"));
/// assert!(!client.allows_redirect("http://evil.example.com/callback"));
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientRegistration {
    /// Client identifier issued by the authorization server.
    pub client_id: String,

    /// Client secret for confidential clients.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_secret: Option<String>,

    /// Human-readable client name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_name: Option<String>,

    /// Exact redirect URIs this client may use.
    pub redirect_uris: BTreeSet<String>,

    /// Grant types the client registered for.
    #[serde(default = "default_grant_types")]
    pub grant_types: BTreeSet<String>,

    /// How the client authenticates at the token endpoint
    /// (`client_secret_post`, `client_secret_basic` or `none`).
    #[serde(default = "default_auth_method")]
    pub token_endpoint_auth_method: String,

    /// Space-separated scopes the client may request.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,

    /// Epoch seconds at which the client id was issued.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id_issued_at: Option<u64>,
}

fn default_grant_types() -> BTreeSet<String> {
    BTreeSet::from([GRANT_AUTHORIZATION_CODE.to_string()])
}

fn default_auth_method() -> String {
    "client_secret_post".to_string()
}

impl ClientRegistration {
    /// Creates a public client (`token_endpoint_auth_method = none`).
    pub fn public(
        client_id: impl Into<String>,
        redirect_uris: impl IntoIterator<Item = String>,
    ) -> Self {
        Self {
            client_id: client_id.into(),
            client_secret: None,
            client_name: None,
            redirect_uris: redirect_uris.into_iter().collect(),
            grant_types: default_grant_types(),
            token_endpoint_auth_method: "none".to_string(),
            scope: None,
            client_id_issued_at: None,
        }
    }

    /// Returns `true` when `redirect_uri` was registered verbatim.
    pub fn allows_redirect(&self, redirect_uri: &str) -> bool {
        self.redirect_uris.contains(redirect_uri)
    }

    /// Resolves the redirect URI for an authorization request.
    ///
    /// An explicit URI must be registered.  When omitted, the client must
    /// have exactly one registered URI.
    pub fn resolve_redirect(&self, requested: Option<&str>) -> Option<String> {
        match requested {
            Some(uri) if self.allows_redirect(uri) => Some(uri.to_string()),
            Some(_) => None,
            None if self.redirect_uris.len() == 1 => self.redirect_uris.iter().next().cloned(),
            None => None,
        }
    }

    /// Returns `true` when the client must present its secret.
    pub fn is_confidential(&self) -> bool {
        self.token_endpoint_auth_method != "none"
    }
}

/// Client metadata posted to a registration endpoint (RFC 7591 section 2).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientMetadata {
    /// Human-readable client name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_name: Option<String>,

    /// Redirect URIs the client will use.
    #[serde(default)]
    pub redirect_uris: Vec<String>,

    /// Requested grant types.
    #[serde(default)]
    pub grant_types: Vec<String>,

    /// Requested response types.
    #[serde(default)]
    pub response_types: Vec<String>,

    /// Requested token endpoint authentication method.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_endpoint_auth_method: Option<String>,

    /// Space-separated scopes the client intends to request.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
}

// ---------------------------------------------------------------------------
// Token endpoint
// ---------------------------------------------------------------------------

/// JSON body returned by a token endpoint on success (RFC 6749 section 5.1).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenResponse {
    /// The issued access token.
    pub access_token: String,

    /// Token type, always `Bearer` here.
    pub token_type: String,

    /// Lifetime in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_in: Option<u64>,

    /// Refresh token, when issued.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,

    /// Granted scopes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
}

/// Error body defined by RFC 6749 section 5.2.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OAuthErrorResponse {
    /// Error code such as `invalid_grant`.
    pub error: String,

    /// Human-readable explanation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_description: Option<String>,
}

impl OAuthErrorResponse {
    /// Creates an error body with a description.
    pub fn new(error: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            error_description: Some(description.into()),
        }
    }
}

// ---------------------------------------------------------------------------
// Audience
// ---------------------------------------------------------------------------

/// Audience claim value, which can be a single string or array of strings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TokenAudience {
    /// A single audience string.
    Single(String),
    /// Multiple audience strings.
    Multiple(Vec<String>),
}

impl TokenAudience {
    /// Check if the audience contains a specific value.
    ///
    /// Comparison ignores a single trailing `/` on either side.
    pub fn contains(&self, value: &str) -> bool {
        match self {
            TokenAudience::Single(s) => same_resource(s, value),
            TokenAudience::Multiple(v) => v.iter().any(|s| same_resource(s, value)),
        }
    }

    /// Renders the audience for logs and error messages.
    pub fn display(&self) -> String {
        match self {
            TokenAudience::Single(s) => s.clone(),
            TokenAudience::Multiple(v) => v.join(" "),
        }
    }
}

/// Compares two resource identifiers, ignoring one trailing slash.
pub fn same_resource(a: &str, b: &str) -> bool {
    a.trim_end_matches('/') == b.trim_end_matches('/')
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Splits a space-separated scope string into an ordered, de-duplicated list.
///
/// # Examples
///
/// ```
/// use gatehouse::oauth::parse_scopes;
///
/// assert_eq!(parse_scopes("openid  profile openid"), vec!["openid", "profile"]);
/// assert!(parse_scopes("").is_empty());
/// ```
pub fn parse_scopes(scope: &str) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for s in scope.split_whitespace() {
        if !out.iter().any(|existing| existing == s) {
            out.push(s.to_string());
        }
    }
    out
}

/// Current time as epoch seconds.
pub fn now_epoch() -> u64 {
    u64::try_from(chrono::Utc::now().timestamp()).unwrap_or_default()
}

/// Generates `prefix` followed by `bytes` random bytes in hex.
pub fn random_token(prefix: &str, bytes: usize) -> String {
    use rand::RngCore as _;
    let mut buf = vec![0u8; bytes];
    rand::rng().fill_bytes(&mut buf);
    format!("{prefix}{}", hex::encode(buf))
}

/// Short, non-reversible label for a token, safe for logs.
pub fn fingerprint(token: &str) -> String {
    use sha2::{Digest, Sha256};
    let digest = Sha256::digest(token.as_bytes());
    hex::encode(&digest[..6])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_redirect_single_registered_uri() {
        let client = ClientRegistration::public("c", ["http://localhost:3030/callback".to_string()]);
        assert_eq!(
            client.resolve_redirect(None).as_deref(),
            Some("http://localhost:3030/callback")
        );
    }

    #[test]
    fn test_resolve_redirect_requires_exact_match() {
        let client = ClientRegistration::public("c", ["http://localhost:3030/callback".to_string()]);
        assert!(client
            .resolve_redirect(Some("http://localhost:3030/callback/extra"))
            .is_none());
    }

    #[test]
    fn test_resolve_redirect_ambiguous_without_request() {
        let client = ClientRegistration::public(
            "c",
            [
                "http://localhost:3030/callback".to_string(),
                "http://127.0.0.1:3030/callback".to_string(),
            ],
        );
        assert!(client.resolve_redirect(None).is_none());
    }

    #[test]
    fn test_registration_defaults_from_json() {
        let json = r#"{"client_id": "abc", "redirect_uris": ["http://localhost:3030/callback"]}"#;
        let client: ClientRegistration = serde_json::from_str(json).unwrap();
        assert!(client.grant_types.contains(GRANT_AUTHORIZATION_CODE));
        assert_eq!(client.token_endpoint_auth_method, "client_secret_post");
        assert!(client.is_confidential());
    }

    #[test]
    fn test_token_audience_single_and_multiple() {
        let single: TokenAudience = serde_json::from_str(r#""https://api.example.com/mcp""#).unwrap();
        assert!(single.contains("https://api.example.com/mcp/"));
        assert!(!single.contains("https://other.example.com/mcp"));

        let multi: TokenAudience =
            serde_json::from_str(r#"["https://a.example.com", "https://b.example.com"]"#).unwrap();
        assert!(multi.contains("https://b.example.com"));
        assert!(!multi.contains("https://c.example.com"));
    }

    #[test]
    fn test_random_token_prefix_and_length() {
        let token = random_token("mcp_", 32);
        assert!(token.starts_with("mcp_"));
        assert_eq!(token.len(), 4 + 64);
        assert_ne!(token, random_token("mcp_", 32));
    }

    #[test]
    fn test_fingerprint_is_short_and_stable() {
        assert_eq!(fingerprint("abc"), fingerprint("abc"));
        assert_eq!(fingerprint("abc").len(), 12);
        assert_ne!(fingerprint("abc"), fingerprint("abd"));
    }
}
