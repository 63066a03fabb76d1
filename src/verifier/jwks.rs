//! Local JWT verification against a cached key set
//!
//! The key set is fetched lazily on first use and then reused for the
//! lifetime of the verifier.  Concurrent first use triggers a single fetch:
//! callers that find the cache empty queue on a fetch lock and re-check the
//! cache once they hold it.
//!
//! Tokens are classified by their `token_use` claim before any signature
//! work beyond key lookup:
//!
//! | kind     | audience check                                   | client check            |
//! |----------|--------------------------------------------------|-------------------------|
//! | `access` | optional; when present must be `expected_resource` | `client_id == client`  |
//! | `id`     | `aud` must equal the client id                   | via `aud`               |
//!
//! Any other kind is rejected.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::jwk::{Jwk, PublicKeyUse};
use jsonwebtoken::{Algorithm, DecodingKey, Validation};
use serde::Deserialize;
use tokio::sync::{Mutex, RwLock};

use crate::config::Config;
use crate::error::{GatehouseError, Result, VerificationError};
use crate::oauth::{parse_scopes, TokenAudience};
use crate::verifier::{AccessTokenInfo, TokenVerifier};

/// Settings for a [`JwksVerifier`].
#[derive(Debug, Clone)]
pub struct JwksVerifierConfig {
    /// Key-distribution endpoint.
    pub jwks_url: String,

    /// Expected `iss`.
    pub issuer: String,

    /// Expected client id.
    pub client_id: String,

    /// RFC 8707 resource that a present `aud` must match.  `None` skips the
    /// check entirely.
    pub expected_resource: Option<String>,

    /// Scope every token must carry.
    pub required_scope: String,

    /// Clock-skew tolerance in seconds.
    pub leeway: u64,

    /// Refetch the key set once when a `kid` is missing.
    pub refresh_on_key_miss: bool,

    /// Minimum age of the cached key set before a `kid` miss may refetch it.
    pub refresh_cooldown: Duration,

    /// Bound on the key set request.
    pub fetch_timeout: Duration,
}

impl JwksVerifierConfig {
    /// Creates settings with the default scope (`openid`), leeway (300 s)
    /// and fetch-once caching.
    pub fn new(
        jwks_url: impl Into<String>,
        issuer: impl Into<String>,
        client_id: impl Into<String>,
    ) -> Self {
        Self {
            jwks_url: jwks_url.into(),
            issuer: issuer.into(),
            client_id: client_id.into(),
            expected_resource: None,
            required_scope: "openid".to_string(),
            leeway: 300,
            refresh_on_key_miss: false,
            refresh_cooldown: Duration::from_secs(60),
            fetch_timeout: Duration::from_secs(10),
        }
    }

    /// Sets the RFC 8707 resource to bind access tokens to.
    pub fn with_expected_resource(mut self, resource: impl Into<String>) -> Self {
        self.expected_resource = Some(resource.into());
        self
    }

    /// Derives settings from the `jwks` section.
    ///
    /// In Cognito mode an unset `expected_resource` defaults to the resource
    /// server's own URL.  Returns `None` when URL, issuer or client id
    /// cannot be determined.
    pub fn from_config(config: &Config) -> Option<Self> {
        let jwks = &config.jwks;
        let client_id = jwks.client_id.clone().filter(|c| !c.is_empty())?;
        let expected_resource = jwks.expected_resource.clone().or_else(|| {
            jwks.is_cognito()
                .then(|| config.resource_server.resource_url())
        });

        Some(Self {
            jwks_url: jwks.resolved_jwks_url()?,
            issuer: jwks.resolved_issuer()?,
            client_id,
            expected_resource,
            required_scope: jwks.required_scope.clone(),
            leeway: jwks.leeway_seconds,
            refresh_on_key_miss: jwks.refresh_on_key_miss,
            refresh_cooldown: Duration::from_secs(jwks.refresh_cooldown_seconds),
            fetch_timeout: Duration::from_secs(jwks.fetch_timeout_seconds),
        })
    }
}

/// Closed set of token kinds carried in `token_use`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    /// An OAuth access token.
    Access,
    /// An OpenID Connect ID token.
    Id,
}

impl TokenKind {
    /// Parses a `token_use` value.
    ///
    /// # Errors
    ///
    /// Returns [`VerificationError::UnknownTokenKind`] for anything but
    /// `access` or `id`, including a missing claim.
    pub fn parse(token_use: Option<&str>) -> std::result::Result<Self, VerificationError> {
        match token_use {
            Some("access") => Ok(Self::Access),
            Some("id") => Ok(Self::Id),
            Some(other) => Err(VerificationError::UnknownTokenKind(other.to_string())),
            None => Err(VerificationError::UnknownTokenKind("<missing>".to_string())),
        }
    }
}

struct CachedKey {
    key: DecodingKey,
    algorithm: Option<Algorithm>,
}

/// One fetched generation of the key set.
pub struct JwksCache {
    keys: HashMap<String, CachedKey>,
    fetched_at: DateTime<Utc>,
    generation: u64,
}

impl JwksCache {
    /// Key ids in this generation.
    pub fn key_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.keys.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// When this generation was fetched.
    pub fn fetched_at(&self) -> DateTime<Utc> {
        self.fetched_at
    }

    /// Returns `true` when this generation was fetched less than `window`
    /// ago.  A fetch time in the future counts as fresh.
    fn age_below(&self, window: Duration) -> bool {
        (Utc::now() - self.fetched_at)
            .to_std()
            .map_or(true, |age| age < window)
    }

    /// Monotonic fetch counter, starting at 1.
    pub fn generation(&self) -> u64 {
        self.generation
    }
}

impl std::fmt::Debug for JwksCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JwksCache")
            .field("keys", &self.key_ids())
            .field("fetched_at", &self.fetched_at)
            .field("generation", &self.generation)
            .finish()
    }
}

#[derive(Debug, Deserialize)]
struct KindProbe {
    #[serde(default)]
    token_use: Option<String>,
}

#[derive(Debug, Deserialize)]
struct JwtClaims {
    #[serde(default)]
    client_id: Option<String>,
    #[serde(default)]
    aud: Option<TokenAudience>,
    #[serde(default)]
    scope: Option<String>,
    exp: u64,
}

/// Verifies signed JWTs locally.
pub struct JwksVerifier {
    config: JwksVerifierConfig,
    http: reqwest::Client,
    cache: RwLock<Option<Arc<JwksCache>>>,
    fetch_lock: Mutex<()>,
}

impl JwksVerifier {
    /// Creates a verifier.  Nothing is fetched until the first token.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the HTTP client cannot be built.
    pub fn new(config: JwksVerifierConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.fetch_timeout)
            .build()
            .map_err(|e| GatehouseError::Config(format!("failed to build HTTP client: {e}")))?;
        Ok(Self::with_client(config, http))
    }

    /// Creates a verifier that uses `http` for key set requests.
    pub fn with_client(config: JwksVerifierConfig, http: reqwest::Client) -> Self {
        Self {
            config,
            http,
            cache: RwLock::new(None),
            fetch_lock: Mutex::new(()),
        }
    }

    /// The current key set generation, if one was fetched.
    pub async fn cached(&self) -> Option<Arc<JwksCache>> {
        self.cache.read().await.clone()
    }

    /// Returns the cached key set, fetching it once if absent.
    async fn key_set(&self) -> std::result::Result<Arc<JwksCache>, VerificationError> {
        if let Some(cache) = self.cache.read().await.as_ref() {
            return Ok(Arc::clone(cache));
        }

        let _guard = self.fetch_lock.lock().await;
        if let Some(cache) = self.cache.read().await.as_ref() {
            return Ok(Arc::clone(cache));
        }

        let fresh = Arc::new(self.fetch(1).await?);
        *self.cache.write().await = Some(Arc::clone(&fresh));
        Ok(fresh)
    }

    /// Replaces generation `seen` with a fresh fetch, unless another caller
    /// already did or `seen` is younger than the refresh cooldown.
    async fn refresh_after(
        &self,
        seen: u64,
    ) -> std::result::Result<Arc<JwksCache>, VerificationError> {
        let _guard = self.fetch_lock.lock().await;
        if let Some(cache) = self.cache.read().await.as_ref() {
            if cache.generation != seen || cache.age_below(self.config.refresh_cooldown) {
                return Ok(Arc::clone(cache));
            }
        }

        tracing::info!(generation = seen + 1, "Refreshing key set after kid miss");
        let fresh = Arc::new(self.fetch(seen + 1).await?);
        *self.cache.write().await = Some(Arc::clone(&fresh));
        Ok(fresh)
    }

    async fn fetch(&self, generation: u64) -> std::result::Result<JwksCache, VerificationError> {
        tracing::debug!(url = %self.config.jwks_url, "Fetching key set");

        let resp = self
            .http
            .get(&self.config.jwks_url)
            .header(reqwest::header::ACCEPT, "application/json")
            .send()
            .await
            .map_err(|e| VerificationError::KeySetUnavailable(e.to_string()))?;

        if !resp.status().is_success() {
            return Err(VerificationError::KeySetUnavailable(format!(
                "key set endpoint returned {}",
                resp.status()
            )));
        }

        let document: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| VerificationError::KeySetUnavailable(format!("invalid key set: {e}")))?;

        let raw_keys = document
            .get("keys")
            .and_then(|k| k.as_array())
            .ok_or_else(|| {
                VerificationError::KeySetUnavailable("key set has no keys array".to_string())
            })?;

        let mut keys = HashMap::new();
        for raw in raw_keys {
            let jwk: Jwk = match serde_json::from_value(raw.clone()) {
                Ok(jwk) => jwk,
                Err(e) => {
                    tracing::debug!("Skipping unsupported key: {}", e);
                    continue;
                }
            };
            if matches!(jwk.common.public_key_use, Some(PublicKeyUse::Encryption)) {
                continue;
            }
            let Some(kid) = jwk.common.key_id.clone() else {
                continue;
            };
            match DecodingKey::from_jwk(&jwk) {
                Ok(key) => {
                    keys.insert(
                        kid,
                        CachedKey {
                            key,
                            algorithm: jwk_algorithm(&jwk),
                        },
                    );
                }
                Err(e) => tracing::debug!(kid = %kid, "Skipping unusable key: {}", e),
            }
        }

        tracing::info!(keys = keys.len(), generation, "Key set cached");
        Ok(JwksCache {
            keys,
            fetched_at: Utc::now(),
            generation,
        })
    }

    fn validation(&self, algorithm: Algorithm, kind: TokenKind) -> Validation {
        let mut validation = Validation::new(algorithm);
        validation.leeway = self.config.leeway;
        validation.set_issuer(&[self.config.issuer.as_str()]);
        validation.validate_exp = true;
        match kind {
            TokenKind::Access => {
                validation.validate_aud = false;
                validation.set_required_spec_claims(&["exp", "iss"]);
            }
            TokenKind::Id => {
                validation.set_audience(&[self.config.client_id.as_str()]);
                validation.set_required_spec_claims(&["exp", "iss", "aud"]);
            }
        }
        validation
    }

    fn check_resource(&self, aud: &TokenAudience) -> std::result::Result<String, VerificationError> {
        match &self.config.expected_resource {
            Some(expected) if aud.contains(expected) => Ok(expected.clone()),
            Some(expected) => Err(VerificationError::ResourceMismatch {
                expected: expected.clone(),
                actual: aud.display(),
            }),
            None => Ok(match aud {
                TokenAudience::Single(s) => s.clone(),
                TokenAudience::Multiple(v) => v.first().cloned().unwrap_or_default(),
            }),
        }
    }
}

#[async_trait]
impl TokenVerifier for JwksVerifier {
    async fn verify_detailed(
        &self,
        token: &str,
    ) -> std::result::Result<AccessTokenInfo, VerificationError> {
        let header = jsonwebtoken::decode_header(token)
            .map_err(|e| VerificationError::MalformedToken(e.to_string()))?;
        let kid = header
            .kid
            .clone()
            .ok_or_else(|| VerificationError::MalformedToken("missing kid".to_string()))?;

        let mut keys = self.key_set().await?;
        if !keys.keys.contains_key(&kid)
            && self.config.refresh_on_key_miss
            && !keys.age_below(self.config.refresh_cooldown)
        {
            keys = self.refresh_after(keys.generation).await?;
        }
        let cached = keys
            .keys
            .get(&kid)
            .ok_or_else(|| VerificationError::KeyNotFound(kid.clone()))?;

        let kind = TokenKind::parse(unverified_payload(token)?.token_use.as_deref())?;

        let algorithm = cached.algorithm.unwrap_or(header.alg);
        let validation = self.validation(algorithm, kind);
        let claims = jsonwebtoken::decode::<JwtClaims>(token, &cached.key, &validation)
            .map_err(map_jwt_error)?
            .claims;

        let (client_id, resource) = match kind {
            TokenKind::Access => {
                let resource = match &claims.aud {
                    Some(aud) => Some(self.check_resource(aud)?),
                    None => None,
                };
                match claims.client_id {
                    Some(ref id) if *id == self.config.client_id => {}
                    Some(ref id) => return Err(VerificationError::ClientIdMismatch(id.clone())),
                    None => {
                        return Err(VerificationError::ClientIdMismatch("<missing>".to_string()))
                    }
                }
                (self.config.client_id.clone(), resource)
            }
            TokenKind::Id => (self.config.client_id.clone(), None),
        };

        let scopes = parse_scopes(claims.scope.as_deref().unwrap_or(""));
        if !scopes.iter().any(|s| *s == self.config.required_scope) {
            return Err(VerificationError::MissingScope(
                self.config.required_scope.clone(),
            ));
        }

        Ok(AccessTokenInfo {
            token: token.to_string(),
            client_id,
            scopes,
            expires_at: Some(claims.exp),
            resource,
        })
    }

    fn name(&self) -> &'static str {
        "jwks"
    }
}

/// Reads the payload without checking the signature.  Only used to pick
/// the validation rules; every claim that matters is re-read from the
/// verified token.
fn unverified_payload(token: &str) -> std::result::Result<KindProbe, VerificationError> {
    let mut parts = token.split('.');
    let payload = match (parts.next(), parts.next(), parts.next(), parts.next()) {
        (Some(_), Some(payload), Some(_), None) => payload,
        _ => {
            return Err(VerificationError::MalformedToken(
                "expected three segments".to_string(),
            ))
        }
    };
    let bytes = base64::engine::general_purpose::URL_SAFE_NO_PAD
        .decode(payload.trim_end_matches('='))
        .map_err(|e| VerificationError::MalformedToken(format!("payload encoding: {e}")))?;
    serde_json::from_slice(&bytes)
        .map_err(|e| VerificationError::MalformedToken(format!("payload json: {e}")))
}

fn map_jwt_error(err: jsonwebtoken::errors::Error) -> VerificationError {
    match err.kind() {
        ErrorKind::ExpiredSignature => VerificationError::ExpiredToken,
        ErrorKind::InvalidIssuer => VerificationError::IssuerMismatch,
        ErrorKind::InvalidAudience => VerificationError::AudienceMismatch,
        ErrorKind::InvalidSignature => VerificationError::InvalidSignature,
        ErrorKind::MissingRequiredClaim(claim) if claim == "aud" => {
            VerificationError::AudienceMismatch
        }
        ErrorKind::MissingRequiredClaim(claim) if claim == "iss" => {
            VerificationError::IssuerMismatch
        }
        _ => VerificationError::MalformedToken(err.to_string()),
    }
}

fn jwk_algorithm(jwk: &Jwk) -> Option<Algorithm> {
    use jsonwebtoken::jwk::KeyAlgorithm;

    jwk.common.key_algorithm.as_ref().and_then(|alg| match alg {
        KeyAlgorithm::RS256 => Some(Algorithm::RS256),
        KeyAlgorithm::RS384 => Some(Algorithm::RS384),
        KeyAlgorithm::RS512 => Some(Algorithm::RS512),
        KeyAlgorithm::ES256 => Some(Algorithm::ES256),
        KeyAlgorithm::ES384 => Some(Algorithm::ES384),
        KeyAlgorithm::PS256 => Some(Algorithm::PS256),
        KeyAlgorithm::PS384 => Some(Algorithm::PS384),
        KeyAlgorithm::PS512 => Some(Algorithm::PS512),
        KeyAlgorithm::EdDSA => Some(Algorithm::EdDSA),
        _ => None,
    })
}
