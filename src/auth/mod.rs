//! Client side of the OAuth authorization code flow
//!
//! Everything a command-line client needs to obtain a bearer token for a
//! protected MCP resource and use it.
//!
//! # Module Layout
//!
//! - [`callback`]  -- loopback listener receiving the authorization redirect
//! - [`discovery`] -- RFC 9728 protected resource metadata and RFC 8414 /
//!   OIDC discovery
//! - [`flow`]      -- authorization code flow with PKCE and dynamic
//!   registration
//! - [`pkce`]      -- PKCE `S256` challenge generation and verification
//! - [`session`]   -- issued token plus bearer-authenticated tool calls

pub mod callback;
pub mod discovery;
pub mod flow;
pub mod pkce;
pub mod session;

pub use callback::{CallbackListener, CallbackParams, CallbackResult};
pub use flow::{
    AuthorizationFlow, AuthorizationFlowConfig, BrowserLauncher, NoBrowser, RegistrationMode,
    SystemBrowser,
};
pub use session::{AuthorizedSession, OAuthToken};
