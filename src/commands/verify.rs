//! `verify` command: run one token through the configured verifier.

use crate::config::Config;
use crate::error::{GatehouseError, Result};
use crate::verifier;

/// Verifies `token` and prints its claims as JSON.
///
/// Unlike the resource server, this reports the rejection reason: the
/// operator running it already holds the token.
///
/// # Errors
///
/// Returns the verification error when the token is rejected.
pub async fn run_verify(config: Config, token: String) -> Result<()> {
    let verifier = verifier::from_config(&config)?;
    tracing::debug!(verifier = verifier.name(), "Verifying token");

    let info = verifier
        .verify_detailed(&token)
        .await
        .map_err(GatehouseError::from)?;
    println!("{}", serde_json::to_string_pretty(&info)?);
    Ok(())
}
