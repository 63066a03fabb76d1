//! Command-line interface definition for Gatehouse
//!
//! This module defines the CLI structure using clap's derive API,
//! providing commands to run the authorization server and the protected
//! resource server, to log in interactively, and to check a token.

use crate::config::VerifierMode;
use clap::{Parser, Subcommand};

/// Gatehouse - OAuth trust boundary for protected tool endpoints
///
/// Issues and verifies bearer tokens for MCP tool calls.
#[derive(Parser, Debug, Clone)]
#[command(name = "gatehouse")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "config/config.yaml")]
    pub config: Option<String>,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long)]
    pub json_logs: bool,

    /// Command to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands for Gatehouse
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Run the authorization server
    AuthServer {
        /// Port to listen on
        #[arg(short, long)]
        port: Option<u16>,

        /// Public issuer URL
        #[arg(long)]
        server_url: Option<String>,
    },

    /// Run the protected resource server
    ResourceServer {
        /// Port to listen on
        #[arg(short, long)]
        port: Option<u16>,

        /// Canonical resource URL
        #[arg(long)]
        server_url: Option<String>,

        /// Token verifier (introspection, jwks)
        #[arg(long)]
        verifier: Option<VerifierMode>,

        /// Require the token audience to match this server
        #[arg(long)]
        strict: bool,
    },

    /// Log in to a protected resource through the browser
    Login {
        /// URL of the protected resource
        #[arg(long)]
        server_url: Option<String>,

        /// Register a fresh client for this login
        #[arg(long, conflicts_with = "pre_registered")]
        dcr: bool,

        /// Use the configured client id and secret
        #[arg(long)]
        pre_registered: bool,

        /// Loopback port for the redirect
        #[arg(long)]
        callback_port: Option<u16>,

        /// Print the authorization URL instead of opening a browser
        #[arg(long)]
        no_browser: bool,

        /// Call this tool once logged in
        #[arg(long)]
        call_tool: Option<String>,
    },

    /// Verify a bearer token with the configured verifier
    Verify {
        /// The token to verify
        token: String,
    },
}

impl Cli {
    /// Parse command line arguments
    pub fn parse_args() -> Self {
        Self::parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parse_auth_server() {
        let cli = Cli::try_parse_from(["gatehouse", "auth-server", "--port", "9100"]).unwrap();
        match cli.command {
            Commands::AuthServer { port, server_url } => {
                assert_eq!(port, Some(9100));
                assert!(server_url.is_none());
            }
            _ => panic!("Expected AuthServer command"),
        }
    }

    #[test]
    fn test_cli_parse_resource_server_with_verifier() {
        let cli = Cli::try_parse_from([
            "gatehouse",
            "resource-server",
            "--verifier",
            "jwks",
            "--strict",
        ])
        .unwrap();
        match cli.command {
            Commands::ResourceServer {
                verifier, strict, ..
            } => {
                assert_eq!(verifier, Some(VerifierMode::Jwks));
                assert!(strict);
            }
            _ => panic!("Expected ResourceServer command"),
        }
    }

    #[test]
    fn test_cli_rejects_unknown_verifier() {
        assert!(
            Cli::try_parse_from(["gatehouse", "resource-server", "--verifier", "ldap"]).is_err()
        );
    }

    #[test]
    fn test_cli_parse_login() {
        let cli = Cli::try_parse_from([
            "gatehouse",
            "-v",
            "--json-logs",
            "login",
            "--server-url",
            "http://localhost:8001/mcp",
            "--no-browser",
            "--call-tool",
            "get_time",
        ])
        .unwrap();
        assert!(cli.verbose);
        assert!(cli.json_logs);
        match cli.command {
            Commands::Login {
                server_url,
                no_browser,
                call_tool,
                dcr,
                ..
            } => {
                assert_eq!(server_url.as_deref(), Some("http://localhost:8001/mcp"));
                assert!(no_browser);
                assert!(!dcr);
                assert_eq!(call_tool.as_deref(), Some("get_time"));
            }
            _ => panic!("Expected Login command"),
        }
    }

    #[test]
    fn test_cli_login_dcr_conflicts_with_pre_registered() {
        assert!(Cli::try_parse_from(["gatehouse", "login", "--dcr", "--pre-registered"]).is_err());
    }

    #[test]
    fn test_cli_parse_verify_requires_token() {
        assert!(Cli::try_parse_from(["gatehouse", "verify"]).is_err());
        let cli = Cli::try_parse_from(["gatehouse", "verify", "abc"]).unwrap();
        assert!(matches!(cli.command, Commands::Verify { token } if token == "abc"));
    }

    #[test]
    fn test_cli_default_config_path() {
        let cli = Cli::try_parse_from(["gatehouse", "verify", "abc"]).unwrap();
        assert_eq!(cli.config.as_deref(), Some("config/config.yaml"));
    }
}
