//! `auth-server` and `resource-server` commands.

use crate::config::Config;
use crate::error::Result;
use crate::{resource, server};

/// Runs the authorization server until Ctrl-C.
///
/// # Errors
///
/// Returns an error if the server cannot bind or fails while serving.
pub async fn run_auth_server(config: Config) -> Result<()> {
    let shutdown = super::shutdown_on_ctrl_c();
    server::serve(config.authorization_server, shutdown).await
}

/// Runs the protected resource server until Ctrl-C.
///
/// # Errors
///
/// Returns an error if the verifier cannot be built, or the server cannot
/// bind or fails while serving.
pub async fn run_resource_server(config: Config) -> Result<()> {
    let shutdown = super::shutdown_on_ctrl_c();
    resource::serve(&config, shutdown).await
}
