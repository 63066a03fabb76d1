//! Remote token verification via RFC 7662 introspection
//!
//! Every verification is one form POST to the authorization server.  The
//! verifier fails closed: an unreachable server, a non-2xx answer, or a body
//! that does not parse all reject the token.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use url::Url;

use crate::config::ResourceServerConfig;
use crate::error::{GatehouseError, Result, VerificationError};
use crate::oauth::{now_epoch, parse_scopes, TokenAudience};
use crate::verifier::{AccessTokenInfo, TokenVerifier};

/// Settings for an [`IntrospectionVerifier`].
#[derive(Debug, Clone)]
pub struct IntrospectionVerifierConfig {
    /// Introspection endpoint; must be HTTPS or loopback.
    pub endpoint: String,

    /// This resource server's canonical URL.
    pub resource_url: String,

    /// Require `aud` to name `resource_url`.
    pub strict: bool,

    /// Bound on one introspection round trip.
    pub timeout: Duration,

    /// Tolerance applied to the local `exp` re-check.
    pub leeway: u64,
}

impl IntrospectionVerifierConfig {
    /// Creates non-strict settings with a 10 s timeout and no leeway.
    pub fn new(endpoint: impl Into<String>, resource_url: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            resource_url: resource_url.into(),
            strict: false,
            timeout: Duration::from_secs(10),
            leeway: 0,
        }
    }

    /// Derives settings from the resource server section.
    pub fn from_config(config: &ResourceServerConfig) -> Self {
        Self {
            endpoint: config.introspection_url(),
            resource_url: config.resource_url(),
            strict: config.oauth_strict,
            timeout: Duration::from_secs(config.introspection_timeout_seconds),
            leeway: 0,
        }
    }
}

#[derive(Debug, Deserialize)]
struct IntrospectionResponse {
    #[serde(default)]
    active: Option<bool>,
    #[serde(default)]
    client_id: Option<String>,
    #[serde(default)]
    scope: Option<String>,
    #[serde(default)]
    exp: Option<u64>,
    #[serde(default)]
    aud: Option<TokenAudience>,
}

/// Verifies opaque tokens by asking the authorization server.
pub struct IntrospectionVerifier {
    config: IntrospectionVerifierConfig,
    http: reqwest::Client,
}

impl IntrospectionVerifier {
    /// Creates a verifier.
    ///
    /// # Errors
    ///
    /// Returns a configuration error when the endpoint is not a valid URL,
    /// is neither HTTPS nor loopback, or the HTTP client cannot be built.
    ///
    /// # Examples
    ///
    /// ```
    /// use gatehouse::verifier::{IntrospectionVerifier, IntrospectionVerifierConfig};
    ///
    /// let ok = IntrospectionVerifierConfig::new(
    ///     "http://localhost:9000/introspect",
    ///     "http://localhost:8001/mcp",
    /// );
    /// assert!(IntrospectionVerifier::new(ok).is_ok());
    ///
    /// let remote_http = IntrospectionVerifierConfig::new(
    ///     "http://auth.example.com/introspect",
    ///     "http://localhost:8001/mcp",
    /// );
    /// assert!(IntrospectionVerifier::new(remote_http).is_err());
    /// ```
    pub fn new(config: IntrospectionVerifierConfig) -> Result<Self> {
        check_endpoint(&config.endpoint)?;
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| GatehouseError::Config(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { config, http })
    }

    fn resource_binding(
        &self,
        aud: Option<&TokenAudience>,
    ) -> std::result::Result<Option<String>, VerificationError> {
        if self.config.strict {
            return match aud {
                Some(aud) if aud.contains(&self.config.resource_url) => {
                    Ok(Some(self.config.resource_url.clone()))
                }
                Some(aud) => Err(VerificationError::ResourceMismatch {
                    expected: self.config.resource_url.clone(),
                    actual: aud.display(),
                }),
                None => Err(VerificationError::ResourceMismatch {
                    expected: self.config.resource_url.clone(),
                    actual: "<missing>".to_string(),
                }),
            };
        }

        Ok(aud.and_then(|aud| match aud {
            TokenAudience::Single(s) => Some(s.clone()),
            TokenAudience::Multiple(v) => v.first().cloned(),
        }))
    }
}

fn check_endpoint(endpoint: &str) -> Result<()> {
    let url = Url::parse(endpoint).map_err(|e| {
        GatehouseError::Config(format!("invalid introspection endpoint {endpoint}: {e}"))
    })?;
    let loopback = matches!(
        url.host_str(),
        Some("localhost") | Some("127.0.0.1") | Some("[::1]")
    );
    match url.scheme() {
        "https" => Ok(()),
        "http" if loopback => Ok(()),
        _ => Err(GatehouseError::Config(format!(
            "introspection endpoint must use https or a loopback host: {endpoint}"
        ))
        .into()),
    }
}

#[async_trait]
impl TokenVerifier for IntrospectionVerifier {
    async fn verify_detailed(
        &self,
        token: &str,
    ) -> std::result::Result<AccessTokenInfo, VerificationError> {
        let resp = self
            .http
            .post(&self.config.endpoint)
            .form(&[("token", token)])
            .send()
            .await
            .map_err(|e| VerificationError::IntrospectionUnreachable(e.to_string()))?;

        if !resp.status().is_success() {
            return Err(VerificationError::IntrospectionUnreachable(format!(
                "introspection endpoint returned {}",
                resp.status()
            )));
        }

        let body: IntrospectionResponse = resp.json().await.map_err(|e| {
            VerificationError::IntrospectionUnreachable(format!("invalid response: {e}"))
        })?;

        if body.active != Some(true) {
            return Err(VerificationError::InactiveToken);
        }

        if let Some(exp) = body.exp {
            if exp.saturating_add(self.config.leeway) < now_epoch() {
                return Err(VerificationError::ExpiredToken);
            }
        }

        let resource = self.resource_binding(body.aud.as_ref())?;

        Ok(AccessTokenInfo {
            token: token.to_string(),
            client_id: body.client_id.unwrap_or_else(|| "unknown".to_string()),
            scopes: parse_scopes(body.scope.as_deref().unwrap_or("")),
            expires_at: body.exp,
            resource,
        })
    }

    fn name(&self) -> &'static str {
        "introspection"
    }
}
