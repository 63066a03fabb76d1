//! Gatehouse - OAuth trust boundary for protected MCP tool endpoints
//!
#![doc = "Main entry point for the Gatehouse binary."]

use anyhow::Result;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use gatehouse::cli::{Cli, Commands};
use gatehouse::commands;
use gatehouse::config::Config;

#[tokio::main]
async fn main() -> Result<()> {
    // Parse command line arguments
    let cli = Cli::parse_args();

    init_tracing(cli.verbose, cli.json_logs);

    // Load configuration
    let config_path = cli.config.as_deref().unwrap_or("config/config.yaml");
    let config = Config::load(config_path, &cli)?;

    // Validate configuration
    config.validate()?;

    // Execute command
    match cli.command {
        Commands::AuthServer { .. } => {
            tracing::info!("Starting authorization server");
            commands::serve::run_auth_server(config).await?;
            Ok(())
        }
        Commands::ResourceServer { .. } => {
            tracing::info!(
                verifier = ?config.resource_server.verifier,
                "Starting resource server"
            );
            commands::serve::run_resource_server(config).await?;
            Ok(())
        }
        Commands::Login { call_tool, .. } => {
            tracing::info!("Starting interactive login");
            if let Some(tool) = &call_tool {
                tracing::debug!("Will call tool after login: {}", tool);
            }
            commands::login::run_login(config, call_tool).await?;
            Ok(())
        }
        Commands::Verify { token } => {
            tracing::debug!("Verifying token");
            commands::verify::run_verify(config, token).await?;
            Ok(())
        }
    }
}

fn init_tracing(verbose: bool, json: bool) {
    let default_level = if verbose { "gatehouse=debug" } else { "gatehouse=info" };
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let registry = tracing_subscriber::registry().with(env_filter);
    if json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}
