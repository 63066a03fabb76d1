//! Error types for Gatehouse
//!
//! This module defines the error taxonomy shared by the client-side login
//! flow, the token verifiers, and the authorization server, using
//! `thiserror` for ergonomic error handling.
//!
//! Flow errors are surfaced to the party attempting to log in and carry
//! enough detail to retry or abort.  Verification errors are for logs only:
//! at the [`TokenVerifier`](crate::verifier::TokenVerifier) boundary every
//! variant collapses to a single "not authenticated" outcome.

use thiserror::Error;

/// Main error type for Gatehouse operations
#[derive(Error, Debug)]
pub enum GatehouseError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Authorization or resource server runtime errors
    #[error("Server error: {0}")]
    Server(String),

    /// Interactive authorization flow errors
    #[error(transparent)]
    Flow(#[from] FlowError),

    /// Token verification errors
    #[error(transparent)]
    Verification(#[from] VerificationError),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// YAML parsing errors
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// HTTP request errors
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

/// Failures of the client-side authorization code flow.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FlowError {
    /// No callback reached the loopback listener before the deadline.
    #[error("OAuth callback wait timed out after {seconds}s")]
    CallbackTimeout {
        /// The timeout that elapsed
        seconds: u64,
    },

    /// The loopback listener received an `error` redirect.
    #[error("OAuth callback error: {0}")]
    CallbackError(String),

    /// The user or the authorization server refused the request.
    #[error("Authorization denied: {0}")]
    AuthorizationDenied(String),

    /// The callback `state` did not match the one sent with the request.
    #[error("state mismatch in OAuth callback")]
    StateMismatch,

    /// The token endpoint rejected the code or returned garbage.
    #[error("Token exchange failed: {0}")]
    TokenExchangeFailed(String),

    /// The loopback listener could not be bound.
    #[error("Failed to bind callback listener: {0}")]
    ListenerBind(String),

    /// Authorization server metadata could not be discovered.
    #[error("Discovery failed: {0}")]
    Discovery(String),

    /// Client registration (dynamic or pre-registered) failed.
    #[error("Client registration failed: {0}")]
    Registration(String),
}

/// Reasons a bearer token failed verification.
///
/// These are logged by the verifiers and never echoed to the caller that
/// presented the token.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum VerificationError {
    /// The token's `kid` is not in the cached key set.
    #[error("signing key not found: kid={0}")]
    KeyNotFound(String),

    /// The token-kind claim is neither `access` nor `id`.
    #[error("unknown token kind: {0}")]
    UnknownTokenKind(String),

    /// The `iss` claim does not match the configured issuer.
    #[error("issuer mismatch")]
    IssuerMismatch,

    /// The `aud` claim of an ID token does not match the client id.
    #[error("audience mismatch")]
    AudienceMismatch,

    /// The RFC 8707 resource binding does not match this resource server.
    #[error("resource mismatch: expected {expected}, got {actual}")]
    ResourceMismatch {
        /// The configured resource identifier
        expected: String,
        /// The audience carried by the token
        actual: String,
    },

    /// The `client_id` claim does not match the configured client.
    #[error("client id mismatch: {0}")]
    ClientIdMismatch(String),

    /// The required scope is not granted.
    #[error("missing required scope: {0}")]
    MissingScope(String),

    /// The token expired beyond the allowed clock skew.
    #[error("token expired")]
    ExpiredToken,

    /// The signature does not verify against the selected key.
    #[error("invalid signature")]
    InvalidSignature,

    /// The token could not be parsed.
    #[error("malformed token: {0}")]
    MalformedToken(String),

    /// The key set could not be fetched or parsed.
    #[error("key set unavailable: {0}")]
    KeySetUnavailable(String),

    /// The introspection endpoint could not be reached or answered garbage.
    #[error("introspection unreachable: {0}")]
    IntrospectionUnreachable(String),

    /// The authorization server reported the token as inactive.
    #[error("token inactive")]
    InactiveToken,
}

/// Result type alias for Gatehouse operations
///
/// This is a convenience alias that uses `anyhow::Error` as the error type,
/// allowing for rich error context and easy error propagation.  Typed
/// errors can be recovered with `downcast_ref::<FlowError>()`.
pub type Result<T> = anyhow::Result<T>;
