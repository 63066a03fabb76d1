//! Tokens obtained by the login flow and the session that uses them.

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{GatehouseError, Result};
use crate::oauth::{parse_scopes, TokenResponse};
use crate::verifier::AccessTokenInfo;

/// A token endpoint response with its expiry made absolute.
///
/// # Examples
///
/// ```
/// use gatehouse::auth::session::OAuthToken;
/// use chrono::{Duration, Utc};
///
/// let token = OAuthToken {
///     access_token: "tok".to_string(),
///     token_type: "Bearer".to_string(),
///     expires_at: Some(Utc::now() + Duration::hours(1)),
///     refresh_token: None,
///     scope: Some("user".to_string()),
/// };
/// assert!(!token.is_expired());
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OAuthToken {
    /// The bearer credential.
    pub access_token: String,

    /// Token type, normally `Bearer`.
    pub token_type: String,

    /// When the token expires; `None` means the server did not say.
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "chrono::serde::ts_seconds_option"
    )]
    pub expires_at: Option<DateTime<Utc>>,

    /// Refresh token, when issued.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,

    /// Granted scopes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
}

impl OAuthToken {
    /// Converts a token endpoint response, anchoring `expires_in` at now.
    pub fn from_response(response: TokenResponse) -> Self {
        let expires_at = response.expires_in.and_then(|secs| {
            let secs = i64::try_from(secs).ok()?;
            Utc::now().checked_add_signed(chrono::Duration::try_seconds(secs)?)
        });
        Self {
            access_token: response.access_token,
            token_type: response.token_type,
            expires_at,
            refresh_token: response.refresh_token,
            scope: response.scope,
        }
    }

    /// Returns `true` when the token expires within the next 60 seconds.
    pub fn is_expired(&self) -> bool {
        match self.expires_at {
            None => false,
            Some(expires_at) => Utc::now() >= expires_at - chrono::Duration::seconds(60),
        }
    }
}

/// An authenticated connection to a protected resource.
///
/// Returned by [`AuthorizationFlow::authorize`](crate::auth::flow::AuthorizationFlow::authorize).
pub struct AuthorizedSession {
    http: reqwest::Client,
    resource_url: Url,
    token: OAuthToken,
    info: AccessTokenInfo,
    next_id: AtomicU64,
}

impl std::fmt::Debug for AuthorizedSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthorizedSession")
            .field("resource_url", &self.resource_url.as_str())
            .field("client_id", &self.info.client_id)
            .field("scopes", &self.info.scopes)
            .finish()
    }
}

impl AuthorizedSession {
    /// Wraps a freshly issued token for `resource_url`.
    pub fn new(
        http: reqwest::Client,
        resource_url: Url,
        token: OAuthToken,
        client_id: impl Into<String>,
    ) -> Self {
        let info = AccessTokenInfo {
            token: token.access_token.clone(),
            client_id: client_id.into(),
            scopes: parse_scopes(token.scope.as_deref().unwrap_or("")),
            expires_at: token
                .expires_at
                .and_then(|t| u64::try_from(t.timestamp()).ok()),
            resource: Some(resource_url.to_string()),
        };
        Self {
            http,
            resource_url,
            token,
            info,
            next_id: AtomicU64::new(1),
        }
    }

    /// The raw token.
    pub fn token(&self) -> &OAuthToken {
        &self.token
    }

    /// The token's claims as known to the client.
    pub fn info(&self) -> &AccessTokenInfo {
        &self.info
    }

    /// The protected resource this session talks to.
    pub fn resource_url(&self) -> &Url {
        &self.resource_url
    }

    /// Sends one JSON-RPC request with the bearer token and returns `result`.
    ///
    /// # Errors
    ///
    /// Returns [`GatehouseError::Server`] when the resource rejects the
    /// token, answers with a JSON-RPC error, or returns garbage.
    pub async fn request(
        &self,
        method: &str,
        params: serde_json::Value,
    ) -> Result<serde_json::Value> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let body = serde_json::json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });

        let resp = self
            .http
            .post(self.resource_url.clone())
            .bearer_auth(&self.token.access_token)
            .json(&body)
            .send()
            .await?;

        let status = resp.status();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            let challenge = resp
                .headers()
                .get(reqwest::header::WWW_AUTHENTICATE)
                .and_then(|v| v.to_str().ok())
                .unwrap_or("")
                .to_string();
            return Err(GatehouseError::Server(format!(
                "resource server refused the token ({status}): {challenge}"
            ))
            .into());
        }
        if !status.is_success() {
            return Err(GatehouseError::Server(format!("resource server returned {status}")).into());
        }

        let mut reply: serde_json::Value = resp.json().await?;
        if let Some(error) = reply.get("error") {
            return Err(GatehouseError::Server(format!("{method} failed: {error}")).into());
        }
        Ok(reply
            .get_mut("result")
            .map(serde_json::Value::take)
            .unwrap_or(serde_json::Value::Null))
    }

    /// Lists the tools the resource exposes.
    ///
    /// # Errors
    ///
    /// See [`request`](Self::request).
    pub async fn list_tools(&self) -> Result<Vec<serde_json::Value>> {
        let result = self.request("tools/list", serde_json::json!({})).await?;
        Ok(result
            .get("tools")
            .and_then(|t| t.as_array())
            .cloned()
            .unwrap_or_default())
    }

    /// Calls one tool.
    ///
    /// # Errors
    ///
    /// See [`request`](Self::request).
    pub async fn call_tool(
        &self,
        name: &str,
        arguments: serde_json::Value,
    ) -> Result<serde_json::Value> {
        self.request(
            "tools/call",
            serde_json::json!({"name": name, "arguments": arguments}),
        )
        .await
    }
}
