//! Gatehouse - OAuth trust boundary for protected MCP tool endpoints
//!
//! This library issues and verifies the bearer tokens that gate access to
//! protected tool calls, and drives the interactive login that obtains them.
//!
//! # Architecture
//!
//! The library is organized into the following modules:
//!
//! - `auth`: client side: loopback callback listener, discovery, PKCE, the
//!   authorization code flow and the resulting session
//! - `verifier`: the `TokenVerifier` trait with JWKS and introspection
//!   implementations
//! - `server`: the in-memory authorization server (codes, tokens,
//!   introspection, revocation, registration)
//! - `resource`: a protected resource server with RFC 9728 metadata
//! - `oauth`: wire types shared by all of the above
//! - `config`: configuration management and validation
//! - `error`: error types and result aliases
//! - `cli`: command-line interface definition
//!
//! # Example
//!
//! ```no_run
//! use gatehouse::Config;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::default();
//!     config.validate()?;
//!
//!     let verifier = gatehouse::verifier::from_config(&config)?;
//!     if verifier.verify("mcp_...").await.is_none() {
//!         println!("rejected");
//!     }
//!     Ok(())
//! }
//! ```

pub mod auth;
pub mod cli;
pub mod commands;
pub mod config;
pub mod error;
pub mod oauth;
pub mod resource;
pub mod server;
pub mod templates;
pub mod verifier;

// Re-export commonly used types
pub use auth::{AuthorizationFlow, AuthorizedSession, CallbackListener, RegistrationMode};
pub use config::Config;
pub use error::{FlowError, GatehouseError, Result, VerificationError};
pub use server::AuthorizationServerProvider;
pub use verifier::{AccessTokenInfo, IntrospectionVerifier, JwksVerifier, TokenVerifier};
