//! Configuration management for Gatehouse
//!
//! This module handles loading, parsing, validating, and managing
//! configuration from files, environment variables, and CLI overrides.
//!
//! The environment is read exactly once, inside [`Config::load`].  Components
//! receive the resolved sections through their constructors and never consult
//! the process environment themselves.

use crate::error::{GatehouseError, Result};
use crate::oauth::ClientRegistration;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Main configuration structure for Gatehouse
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Authorization server settings
    #[serde(default)]
    pub authorization_server: AuthServerConfig,

    /// Protected resource server settings
    #[serde(default)]
    pub resource_server: ResourceServerConfig,

    /// Local JWT verification settings
    #[serde(default)]
    pub jwks: JwksConfig,

    /// Interactive login client settings
    #[serde(default)]
    pub client: ClientConfig,
}

/// Authorization server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthServerConfig {
    /// Interface to bind
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to bind
    #[serde(default = "default_auth_port")]
    pub port: u16,

    /// Public issuer URL; derived from host and port when unset
    #[serde(default)]
    pub server_url: Option<String>,

    /// Username accepted by the login challenge
    #[serde(default = "default_demo_username")]
    pub demo_username: String,

    /// Password accepted by the login challenge
    #[serde(default = "default_demo_password")]
    pub demo_password: String,

    /// Scope granted when the client requests none; also the only valid scope
    /// besides those listed in `extra_scopes`
    #[serde(default = "default_scope")]
    pub scope: String,

    /// Additional scopes clients may request
    #[serde(default)]
    pub extra_scopes: Vec<String>,

    /// Authorization code lifetime
    #[serde(default = "default_code_ttl")]
    pub code_ttl_seconds: u64,

    /// Access token lifetime
    #[serde(default = "default_token_ttl")]
    pub token_ttl_seconds: u64,

    /// Pre-registered clients, immutable for the process lifetime
    #[serde(default)]
    pub clients: Vec<ClientRegistration>,
}

fn default_host() -> String {
    "localhost".to_string()
}

fn default_auth_port() -> u16 {
    9000
}

fn default_demo_username() -> String {
    "demo_user".to_string()
}

fn default_demo_password() -> String {
    "demo_password".to_string()
}

fn default_scope() -> String {
    "user".to_string()
}

fn default_code_ttl() -> u64 {
    300
}

fn default_token_ttl() -> u64 {
    3600
}

impl Default for AuthServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_auth_port(),
            server_url: None,
            demo_username: default_demo_username(),
            demo_password: default_demo_password(),
            scope: default_scope(),
            extra_scopes: Vec::new(),
            code_ttl_seconds: default_code_ttl(),
            token_ttl_seconds: default_token_ttl(),
            clients: Vec::new(),
        }
    }
}

impl AuthServerConfig {
    /// The issuer URL advertised in discovery metadata.
    pub fn issuer_url(&self) -> String {
        match &self.server_url {
            Some(url) => url.trim_end_matches('/').to_string(),
            None => format!("http://{}:{}", self.host, self.port),
        }
    }

    /// Every scope a client may request.
    pub fn valid_scopes(&self) -> Vec<String> {
        let mut scopes = vec![self.scope.clone()];
        for s in &self.extra_scopes {
            if !scopes.contains(s) {
                scopes.push(s.clone());
            }
        }
        scopes
    }
}

/// How the resource server validates bearer tokens
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VerifierMode {
    /// Ask the authorization server (RFC 7662)
    #[default]
    Introspection,
    /// Validate signed JWTs against a key set
    Jwks,
}

impl std::str::FromStr for VerifierMode {
    type Err = GatehouseError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "introspection" => Ok(Self::Introspection),
            "jwks" | "jwt" => Ok(Self::Jwks),
            other => Err(GatehouseError::Config(format!(
                "Invalid verifier: {}. Must be one of: introspection, jwks",
                other
            ))),
        }
    }
}

/// Protected resource server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceServerConfig {
    /// Interface to bind
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to bind
    #[serde(default = "default_resource_port")]
    pub port: u16,

    /// Canonical resource identifier; derived from host, port and path when unset
    #[serde(default)]
    pub server_url: Option<String>,

    /// Path of the protected tool endpoint
    #[serde(default = "default_resource_path")]
    pub resource_path: String,

    /// Authorization server protecting this resource
    #[serde(default = "default_auth_server_url")]
    pub auth_server_url: String,

    /// Introspection endpoint; `{auth_server_url}/introspect` when unset
    #[serde(default)]
    pub introspection_endpoint: Option<String>,

    /// Scope required to call tools
    #[serde(default = "default_scope")]
    pub mcp_scope: String,

    /// Require the introspected `aud` to equal this server's URL
    #[serde(default)]
    pub oauth_strict: bool,

    /// Token validation strategy
    #[serde(default)]
    pub verifier: VerifierMode,

    /// Bound on a single introspection round trip
    #[serde(default = "default_http_timeout")]
    pub introspection_timeout_seconds: u64,
}

fn default_resource_port() -> u16 {
    8001
}

fn default_resource_path() -> String {
    "/mcp".to_string()
}

fn default_auth_server_url() -> String {
    "http://localhost:9000".to_string()
}

fn default_http_timeout() -> u64 {
    10
}

impl Default for ResourceServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_resource_port(),
            server_url: None,
            resource_path: default_resource_path(),
            auth_server_url: default_auth_server_url(),
            introspection_endpoint: None,
            mcp_scope: default_scope(),
            oauth_strict: false,
            verifier: VerifierMode::default(),
            introspection_timeout_seconds: default_http_timeout(),
        }
    }
}

impl ResourceServerConfig {
    /// The canonical resource identifier used for RFC 8707 binding.
    pub fn resource_url(&self) -> String {
        match &self.server_url {
            Some(url) => url.clone(),
            None => format!("http://{}:{}{}", self.host, self.port, self.resource_path),
        }
    }

    /// The introspection endpoint to call.
    pub fn introspection_url(&self) -> String {
        match &self.introspection_endpoint {
            Some(url) => url.clone(),
            None => format!("{}/introspect", self.auth_server_url.trim_end_matches('/')),
        }
    }
}

/// A Cognito user pool id such as `us-east-1_AbCdEf`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CognitoPool {
    /// The full pool id
    pub pool_id: String,
    /// AWS region, the part before `_`
    pub region: String,
}

impl CognitoPool {
    /// Parses a pool id; returns `None` when it has no region prefix.
    ///
    /// # Examples
    ///
    /// ```
    /// use gatehouse::config::CognitoPool;
    ///
    /// let pool = CognitoPool::parse("eu-west-1_Abc123").unwrap();
    /// assert_eq!(pool.region, "eu-west-1");
    /// assert_eq!(
    ///     pool.jwks_url(),
    ///     "https://cognito-idp.eu-west-1.amazonaws.com/eu-west-1_Abc123/.well-known/jwks.json"
    /// );
    /// ```
    pub fn parse(pool_id: &str) -> Option<Self> {
        let (region, rest) = pool_id.split_once('_')?;
        if region.is_empty() || rest.is_empty() {
            return None;
        }
        Some(Self {
            pool_id: pool_id.to_string(),
            region: region.to_string(),
        })
    }

    /// The token issuer for this pool.
    pub fn issuer(&self) -> String {
        format!(
            "https://cognito-idp.{}.amazonaws.com/{}",
            self.region, self.pool_id
        )
    }

    /// The key-distribution endpoint for this pool.
    pub fn jwks_url(&self) -> String {
        format!("{}/.well-known/jwks.json", self.issuer())
    }
}

/// Local JWT verification configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JwksConfig {
    /// Key set URL; derived from the Cognito pool when unset
    #[serde(default)]
    pub jwks_url: Option<String>,

    /// Expected `iss`; derived from the Cognito pool when unset
    #[serde(default)]
    pub issuer: Option<String>,

    /// Expected client id (`client_id` of access tokens, `aud` of ID tokens)
    #[serde(default)]
    pub client_id: Option<String>,

    /// RFC 8707 resource the `aud` of access tokens must match, when present
    #[serde(default)]
    pub expected_resource: Option<String>,

    /// Scope every token must carry
    #[serde(default = "default_required_scope")]
    pub required_scope: String,

    /// Clock-skew tolerance for `exp`
    #[serde(default = "default_leeway")]
    pub leeway_seconds: u64,

    /// Refetch the key set once when a `kid` is not found
    #[serde(default)]
    pub refresh_on_key_miss: bool,

    /// Minimum key set age before a `kid` miss may trigger a refetch
    #[serde(default = "default_refresh_cooldown")]
    pub refresh_cooldown_seconds: u64,

    /// Bound on the key set fetch
    #[serde(default = "default_http_timeout")]
    pub fetch_timeout_seconds: u64,

    /// Cognito user pool id used to derive issuer and key set URL
    #[serde(default)]
    pub cognito_user_pool_id: Option<String>,
}

fn default_required_scope() -> String {
    "openid".to_string()
}

fn default_leeway() -> u64 {
    300
}

fn default_refresh_cooldown() -> u64 {
    60
}

impl Default for JwksConfig {
    fn default() -> Self {
        Self {
            jwks_url: None,
            issuer: None,
            client_id: None,
            expected_resource: None,
            required_scope: default_required_scope(),
            leeway_seconds: default_leeway(),
            refresh_on_key_miss: false,
            refresh_cooldown_seconds: default_refresh_cooldown(),
            fetch_timeout_seconds: default_http_timeout(),
            cognito_user_pool_id: None,
        }
    }
}

impl JwksConfig {
    fn cognito_pool(&self) -> Option<CognitoPool> {
        self.cognito_user_pool_id
            .as_deref()
            .and_then(CognitoPool::parse)
    }

    /// Key set URL, explicit or derived.
    pub fn resolved_jwks_url(&self) -> Option<String> {
        self.jwks_url
            .clone()
            .or_else(|| self.cognito_pool().map(|p| p.jwks_url()))
    }

    /// Issuer, explicit or derived.
    pub fn resolved_issuer(&self) -> Option<String> {
        self.issuer
            .clone()
            .or_else(|| self.cognito_pool().map(|p| p.issuer()))
    }

    /// Returns `true` when a Cognito pool is configured.
    pub fn is_cognito(&self) -> bool {
        self.cognito_pool().is_some()
    }
}

/// Interactive login client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// URL of the protected resource to log in to
    #[serde(default = "default_client_server_url")]
    pub server_url: String,

    /// Register a fresh client per login (RFC 7591) instead of using
    /// `client_id`/`client_secret`
    #[serde(default = "default_use_dcr")]
    pub use_dcr: bool,

    /// Pre-registered client id
    #[serde(default)]
    pub client_id: Option<String>,

    /// Pre-registered client secret
    #[serde(default)]
    pub client_secret: Option<String>,

    /// Client name sent with dynamic registration
    #[serde(default = "default_client_name")]
    pub client_name: String,

    /// Scopes to request; taken from discovery metadata when unset
    #[serde(default)]
    pub scope: Option<String>,

    /// Loopback port for the redirect URI
    #[serde(default = "default_callback_port")]
    pub callback_port: u16,

    /// How long to wait for the browser redirect
    #[serde(default = "default_callback_timeout")]
    pub callback_timeout_seconds: u64,

    /// Launch the system browser; otherwise only print the URL
    #[serde(default = "default_open_browser")]
    pub open_browser: bool,
}

fn default_client_server_url() -> String {
    "http://localhost:8001/mcp".to_string()
}

fn default_use_dcr() -> bool {
    true
}

fn default_client_name() -> String {
    "gatehouse".to_string()
}

fn default_callback_port() -> u16 {
    3030
}

fn default_callback_timeout() -> u64 {
    300
}

fn default_open_browser() -> bool {
    true
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_url: default_client_server_url(),
            use_dcr: default_use_dcr(),
            client_id: None,
            client_secret: None,
            client_name: default_client_name(),
            scope: None,
            callback_port: default_callback_port(),
            callback_timeout_seconds: default_callback_timeout(),
            open_browser: default_open_browser(),
        }
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn env_parsed<T: std::str::FromStr>(name: &str) -> Option<T> {
    let raw = std::env::var(name).ok()?;
    match raw.parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!("Invalid {}: {}", name, raw);
            None
        }
    }
}

fn env_bool(name: &str) -> Option<bool> {
    let raw = std::env::var(name).ok()?;
    let parsed = parse_bool(&raw);
    if parsed.is_none() {
        tracing::warn!("Invalid {}: {}", name, raw);
    }
    parsed
}

impl Config {
    /// Load configuration from file with environment and CLI overrides
    ///
    /// # Arguments
    ///
    /// * `path` - Path to configuration file
    /// * `cli` - CLI arguments for overrides
    ///
    /// # Errors
    ///
    /// Returns error if the file exists but cannot be read or parsed
    pub fn load(path: &str, cli: &crate::cli::Cli) -> Result<Self> {
        let mut config = if Path::new(path).exists() {
            Self::from_file(path)?
        } else {
            tracing::warn!("Config file not found at {}, using defaults", path);
            Self::default()
        };

        config.apply_env_vars();
        config.apply_cli_overrides(cli);

        Ok(config)
    }

    fn from_file(path: &str) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| GatehouseError::Config(format!("Failed to read config file: {}", e)))?;
        serde_yaml::from_str(&contents)
            .map_err(|e| GatehouseError::Config(format!("Failed to parse config: {}", e)).into())
    }

    fn apply_env_vars(&mut self) {
        // Authorization server
        if let Ok(host) = std::env::var("MCP_AUTH_HOST") {
            self.authorization_server.host = host;
        }
        if let Some(port) = env_parsed("MCP_AUTH_PORT") {
            self.authorization_server.port = port;
        }
        if let Ok(url) = std::env::var("MCP_AUTH_SERVER_URL") {
            self.authorization_server.server_url = Some(url);
        }
        if let Ok(username) = std::env::var("MCP_AUTH_DEMO_USERNAME") {
            self.authorization_server.demo_username = username;
        }
        if let Ok(password) = std::env::var("MCP_AUTH_DEMO_PASSWORD") {
            self.authorization_server.demo_password = password;
        }
        if let Ok(scope) = std::env::var("MCP_AUTH_SCOPE") {
            self.authorization_server.scope = scope;
        }

        // Resource server
        if let Ok(host) = std::env::var("MCP_RESOURCE_HOST") {
            self.resource_server.host = host;
        }
        if let Some(port) = env_parsed("MCP_RESOURCE_PORT") {
            self.resource_server.port = port;
        }
        if let Ok(url) = std::env::var("MCP_RESOURCE_SERVER_URL") {
            self.resource_server.server_url = Some(url);
        }
        if let Ok(url) = std::env::var("MCP_RESOURCE_AUTH_SERVER_URL") {
            self.resource_server.auth_server_url = url;
        }
        if let Ok(url) = std::env::var("MCP_RESOURCE_AUTH_SERVER_INTROSPECTION_ENDPOINT") {
            self.resource_server.introspection_endpoint = Some(url);
        }
        if let Ok(scope) = std::env::var("MCP_RESOURCE_MCP_SCOPE") {
            self.resource_server.mcp_scope = scope;
        }
        if let Some(strict) = env_bool("MCP_RESOURCE_OAUTH_STRICT") {
            self.resource_server.oauth_strict = strict;
        }
        if let Some(mode) = env_parsed("MCP_RESOURCE_VERIFIER") {
            self.resource_server.verifier = mode;
        }

        // Cognito
        if let Ok(pool) = std::env::var("COGNITO_USER_POOL_ID") {
            self.jwks.cognito_user_pool_id = Some(pool);
        }
        if let Ok(client_id) = std::env::var("COGNITO_APP_CLIENT_ID") {
            self.jwks.client_id = Some(client_id.clone());
            self.client.client_id = Some(client_id);
        }
        if let Ok(secret) = std::env::var("COGNITO_APP_CLIENT_SECRET") {
            self.client.client_secret = Some(secret);
        }

        // Login client
        if let Ok(url) = std::env::var("MCP_SERVER_URL") {
            self.client.server_url = url;
        }
        if let Some(dcr) = env_bool("MCP_USE_DCR") {
            self.client.use_dcr = dcr;
        }
        if let Some(port) = env_parsed("MCP_CALLBACK_PORT") {
            self.client.callback_port = port;
        }
    }

    fn apply_cli_overrides(&mut self, cli: &crate::cli::Cli) {
        use crate::cli::Commands;

        if cli.verbose {
            tracing::debug!("Verbose mode enabled");
        }

        match &cli.command {
            Commands::AuthServer { port, server_url } => {
                if let Some(port) = port {
                    self.authorization_server.port = *port;
                }
                if let Some(url) = server_url {
                    self.authorization_server.server_url = Some(url.clone());
                }
            }
            Commands::ResourceServer {
                port,
                server_url,
                verifier,
                strict,
            } => {
                if let Some(port) = port {
                    self.resource_server.port = *port;
                }
                if let Some(url) = server_url {
                    self.resource_server.server_url = Some(url.clone());
                }
                if let Some(mode) = verifier {
                    self.resource_server.verifier = *mode;
                }
                if *strict {
                    self.resource_server.oauth_strict = true;
                }
            }
            Commands::Login {
                server_url,
                dcr,
                pre_registered,
                callback_port,
                no_browser,
                ..
            } => {
                if let Some(url) = server_url {
                    self.client.server_url = url.clone();
                }
                if *dcr {
                    self.client.use_dcr = true;
                }
                if *pre_registered {
                    self.client.use_dcr = false;
                }
                if let Some(port) = callback_port {
                    self.client.callback_port = *port;
                }
                if *no_browser {
                    self.client.open_browser = false;
                }
            }
            Commands::Verify { .. } => {}
        }
    }

    /// Validate the configuration
    ///
    /// Ensures all configuration values are within acceptable ranges
    /// and that required fields are properly set for the selected modes.
    ///
    /// # Errors
    ///
    /// Returns error if any validation check fails
    pub fn validate(&self) -> Result<()> {
        let auth = &self.authorization_server;
        if auth.port == 0 {
            return Err(GatehouseError::Config(
                "authorization_server.port must be greater than 0".to_string(),
            )
            .into());
        }
        if auth.demo_username.is_empty() || auth.demo_password.is_empty() {
            return Err(GatehouseError::Config(
                "authorization_server demo credentials cannot be empty".to_string(),
            )
            .into());
        }
        if auth.scope.trim().is_empty() {
            return Err(GatehouseError::Config(
                "authorization_server.scope cannot be empty".to_string(),
            )
            .into());
        }
        if auth.code_ttl_seconds == 0 || auth.token_ttl_seconds == 0 {
            return Err(GatehouseError::Config(
                "code_ttl_seconds and token_ttl_seconds must be greater than 0".to_string(),
            )
            .into());
        }
        for client in &auth.clients {
            if client.client_id.is_empty() || client.redirect_uris.is_empty() {
                return Err(GatehouseError::Config(
                    "pre-registered clients need a client_id and at least one redirect_uri"
                        .to_string(),
                )
                .into());
            }
        }

        let resource = &self.resource_server;
        if resource.port == 0 {
            return Err(GatehouseError::Config(
                "resource_server.port must be greater than 0".to_string(),
            )
            .into());
        }
        if !resource.resource_path.starts_with('/') {
            return Err(GatehouseError::Config(
                "resource_server.resource_path must start with '/'".to_string(),
            )
            .into());
        }
        if resource.introspection_timeout_seconds == 0 {
            return Err(GatehouseError::Config(
                "resource_server.introspection_timeout_seconds must be greater than 0".to_string(),
            )
            .into());
        }

        if resource.verifier == VerifierMode::Jwks {
            if self.jwks.resolved_jwks_url().is_none() {
                return Err(GatehouseError::Config(
                    "jwks verifier requires jwks.jwks_url or jwks.cognito_user_pool_id".to_string(),
                )
                .into());
            }
            if self.jwks.resolved_issuer().is_none() {
                return Err(GatehouseError::Config(
                    "jwks verifier requires jwks.issuer or jwks.cognito_user_pool_id".to_string(),
                )
                .into());
            }
            if self.jwks.client_id.as_deref().unwrap_or("").is_empty() {
                return Err(GatehouseError::Config(
                    "jwks verifier requires jwks.client_id".to_string(),
                )
                .into());
            }
        }

        if self.client.callback_port == 0 {
            return Err(GatehouseError::Config(
                "client.callback_port must be greater than 0".to_string(),
            )
            .into());
        }
        if self.client.callback_timeout_seconds == 0 {
            return Err(GatehouseError::Config(
                "client.callback_timeout_seconds must be greater than 0".to_string(),
            )
            .into());
        }
        if !self.client.use_dcr && self.client.client_id.as_deref().unwrap_or("").is_empty() {
            return Err(GatehouseError::Config(
                "pre-registered login requires client.client_id".to_string(),
            )
            .into());
        }

        Ok(())
    }
}
