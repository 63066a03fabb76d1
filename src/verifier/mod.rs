//! Bearer token verification
//!
//! A resource server validates every presented token through one
//! [`TokenVerifier`].  Two implementations exist, chosen by deployment mode:
//!
//! - [`JwksVerifier`]: local signature and claims checks against a cached
//!   key set.
//! - [`IntrospectionVerifier`]: remote RFC 7662 introspection against the
//!   authorization server.
//!
//! Every failure collapses to `None` at [`TokenVerifier::verify`].  The
//! detailed [`VerificationError`] is logged and available to in-process
//! callers through [`TokenVerifier::verify_detailed`], but must never reach
//! the party presenting the token.

pub mod introspection;
pub mod jwks;

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;

use crate::config::{Config, VerifierMode};
use crate::error::{GatehouseError, Result, VerificationError};
use crate::oauth;

pub use introspection::{IntrospectionVerifier, IntrospectionVerifierConfig};
pub use jwks::{JwksVerifier, JwksVerifierConfig};

/// Verified claims of a bearer token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AccessTokenInfo {
    /// The token as presented.
    #[serde(skip_serializing)]
    pub token: String,

    /// The client the token was issued to.
    pub client_id: String,

    /// Granted scopes in the order the issuer listed them.
    pub scopes: Vec<String>,

    /// Expiry in epoch seconds, when the issuer reported one.
    pub expires_at: Option<u64>,

    /// RFC 8707 resource the token is bound to, when bound.
    pub resource: Option<String>,
}

impl AccessTokenInfo {
    /// Returns `true` when `scope` was granted.
    pub fn has_scope(&self, scope: &str) -> bool {
        self.scopes.iter().any(|s| s == scope)
    }

    /// Returns `true` when the expiry plus `leeway` lies before `now`.
    pub fn is_expired_at(&self, now: u64, leeway: u64) -> bool {
        self.expires_at
            .is_some_and(|exp| exp.saturating_add(leeway) < now)
    }
}

/// Validates bearer tokens.
#[async_trait]
pub trait TokenVerifier: Send + Sync {
    /// Verifies `token` and reports why it was rejected.
    ///
    /// # Errors
    ///
    /// Returns the [`VerificationError`] describing the first failed check.
    async fn verify_detailed(&self, token: &str)
        -> std::result::Result<AccessTokenInfo, VerificationError>;

    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// Verifies `token`, returning `None` on any failure.
    ///
    /// The failure reason is logged with a token fingerprint and then
    /// discarded.
    async fn verify(&self, token: &str) -> Option<AccessTokenInfo> {
        match self.verify_detailed(token).await {
            Ok(info) => {
                tracing::debug!(
                    verifier = self.name(),
                    token = %oauth::fingerprint(token),
                    client_id = %info.client_id,
                    "Token accepted"
                );
                Some(info)
            }
            Err(reason) => {
                tracing::warn!(
                    verifier = self.name(),
                    token = %oauth::fingerprint(token),
                    %reason,
                    "Token rejected"
                );
                None
            }
        }
    }
}

/// Builds the verifier selected by `config.resource_server.verifier`.
///
/// # Errors
///
/// Returns a configuration error when the selected mode lacks required
/// settings, or when the introspection endpoint is not HTTPS or loopback.
///
/// # Examples
///
/// ```
/// use gatehouse::config::Config;
/// use gatehouse::verifier;
///
/// let verifier = verifier::from_config(&Config::default()).unwrap();
/// assert_eq!(verifier.name(), "introspection");
/// ```
pub fn from_config(config: &Config) -> Result<Arc<dyn TokenVerifier>> {
    match config.resource_server.verifier {
        VerifierMode::Introspection => {
            let settings = IntrospectionVerifierConfig::from_config(&config.resource_server);
            Ok(Arc::new(IntrospectionVerifier::new(settings)?))
        }
        VerifierMode::Jwks => {
            let settings = JwksVerifierConfig::from_config(config).ok_or_else(|| {
                GatehouseError::Config(
                    "jwks verifier requires jwks_url, issuer and client_id".to_string(),
                )
            })?;
            Ok(Arc::new(JwksVerifier::new(settings)?))
        }
    }
}
