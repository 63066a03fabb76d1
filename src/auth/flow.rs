//! Interactive OAuth authorization code flow with PKCE
//!
//! [`AuthorizationFlow::authorize`] drives one login end to end:
//!
//! 1. Discover the authorization server protecting the resource.
//! 2. Start the loopback [`CallbackListener`].
//! 3. Resolve a client: register one dynamically (RFC 7591) or use the
//!    pre-registered credentials.
//! 4. Generate `state` and a PKCE S256 pair, build the authorization URL
//!    (with the RFC 8707 `resource` indicator) and hand it to the browser.
//! 5. Wait for the redirect, check `state`.
//! 6. Stop the listener, whatever happened above.
//! 7. Exchange the code at the token endpoint.
//!
//! # References
//!
//! - RFC 6749 section 4.1 <https://www.rfc-editor.org/rfc/rfc6749#section-4.1>
//! - RFC 7636 PKCE <https://www.rfc-editor.org/rfc/rfc7636>
//! - RFC 7591 Dynamic Registration <https://www.rfc-editor.org/rfc/rfc7591>
//! - RFC 8707 Resource Indicators <https://www.rfc-editor.org/rfc/rfc8707>

use std::sync::Arc;
use std::time::Duration;

use base64::Engine as _;
use url::Url;

use crate::auth::callback::{CallbackListener, CallbackResult};
use crate::auth::discovery::{self, AuthorizationServerMetadata, DiscoveredServer};
use crate::auth::pkce;
use crate::auth::session::{AuthorizedSession, OAuthToken};
use crate::config::ClientConfig;
use crate::error::{FlowError, Result};
use crate::oauth::{ClientMetadata, ClientRegistration, OAuthErrorResponse, TokenResponse};

/// How the flow obtains client credentials.
#[derive(Debug, Clone)]
pub enum RegistrationMode {
    /// Register a fresh client for this login and discard it afterwards.
    Dynamic {
        /// Name sent in the registration request
        client_name: String,
    },
    /// Use a client registered out of band.
    PreRegistered(ClientRegistration),
}

impl RegistrationMode {
    /// Selects the mode described by the login client settings.
    ///
    /// # Errors
    ///
    /// Returns [`FlowError::Registration`] when pre-registered mode is
    /// selected without a client id.
    pub fn from_config(config: &ClientConfig) -> Result<Self> {
        if config.use_dcr {
            return Ok(Self::Dynamic {
                client_name: config.client_name.clone(),
            });
        }

        let client_id = config
            .client_id
            .clone()
            .filter(|id| !id.is_empty())
            .ok_or_else(|| FlowError::Registration("no client id configured".to_string()))?;
        let mut client = ClientRegistration::public(
            client_id,
            [format!("http://localhost:{}/callback", config.callback_port)],
        );
        if let Some(secret) = &config.client_secret {
            client.client_secret = Some(secret.clone());
            client.token_endpoint_auth_method = "client_secret_post".to_string();
        }
        client.client_name = Some(config.client_name.clone());
        client.scope = Some(
            config
                .scope
                .clone()
                .unwrap_or_else(|| "openid profile email".to_string()),
        );
        Ok(Self::PreRegistered(client))
    }
}

/// Opens the authorization URL for the user.
pub trait BrowserLauncher: Send + Sync {
    /// Navigates to `url`.
    ///
    /// # Errors
    ///
    /// Returns an error when no browser could be started; the flow logs it
    /// and keeps waiting, since the URL is also printed.
    fn open(&self, url: &str) -> Result<()>;
}

/// Uses the platform's default URL handler.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemBrowser;

impl BrowserLauncher for SystemBrowser {
    fn open(&self, url: &str) -> Result<()> {
        #[cfg(target_os = "macos")]
        let program = "open";
        #[cfg(target_os = "windows")]
        let program = "explorer";
        #[cfg(not(any(target_os = "macos", target_os = "windows")))]
        let program = "xdg-open";

        std::process::Command::new(program).arg(url).spawn()?;
        Ok(())
    }
}

/// Does nothing; the user copies the printed URL.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoBrowser;

impl BrowserLauncher for NoBrowser {
    fn open(&self, _url: &str) -> Result<()> {
        Ok(())
    }
}

/// Settings for one [`AuthorizationFlow`].
#[derive(Debug, Clone)]
pub struct AuthorizationFlowConfig {
    /// Loopback port; `0` picks a free one.
    pub callback_port: u16,

    /// How long to wait for the redirect.
    pub callback_timeout: Duration,

    /// Scope to request; falls back to the client's, then to discovery.
    pub scope: Option<String>,
}

impl Default for AuthorizationFlowConfig {
    fn default() -> Self {
        Self {
            callback_port: 3030,
            callback_timeout: Duration::from_secs(300),
            scope: None,
        }
    }
}

impl From<&ClientConfig> for AuthorizationFlowConfig {
    fn from(config: &ClientConfig) -> Self {
        Self {
            callback_port: config.callback_port,
            callback_timeout: Duration::from_secs(config.callback_timeout_seconds),
            scope: config.scope.clone(),
        }
    }
}

#[derive(serde::Deserialize)]
struct DcrResponse {
    client_id: String,
    #[serde(default)]
    client_secret: Option<String>,
    #[serde(default)]
    token_endpoint_auth_method: Option<String>,
}

struct AuthorizationRequest {
    client: ClientRegistration,
    redirect_uri: String,
    verifier: String,
}

/// Drives the browser-based authorization code flow.
///
/// # Examples
///
/// ```no_run
/// use std::sync::Arc;
/// use gatehouse::auth::flow::{
///     AuthorizationFlow, AuthorizationFlowConfig, RegistrationMode, SystemBrowser,
/// };
///
/// # async fn example() -> anyhow::Result<()> {
/// let flow = AuthorizationFlow::new(
///     reqwest::Client::new(),
///     AuthorizationFlowConfig::default(),
///     Arc::new(SystemBrowser),
/// );
/// let mode = RegistrationMode::Dynamic { client_name: "gatehouse".to_string() };
/// let session = flow.authorize("http://localhost:8001/mcp", &mode).await?;
/// println!("{:?}", session.list_tools().await?);
/// # Ok(())
/// # }
/// ```
pub struct AuthorizationFlow {
    http: reqwest::Client,
    config: AuthorizationFlowConfig,
    browser: Arc<dyn BrowserLauncher>,
}

impl AuthorizationFlow {
    /// Creates a flow.
    pub fn new(
        http: reqwest::Client,
        config: AuthorizationFlowConfig,
        browser: Arc<dyn BrowserLauncher>,
    ) -> Self {
        Self {
            http,
            config,
            browser,
        }
    }

    /// Logs in to the resource at `server_url`.
    ///
    /// # Errors
    ///
    /// Fails with a [`FlowError`] (recoverable with `downcast_ref`):
    ///
    /// - `Discovery` / `Registration` / `ListenerBind` before the browser
    ///   is involved.
    /// - `AuthorizationDenied` when the redirect carried an error.
    /// - `CallbackTimeout` when no redirect arrived in time.
    /// - `StateMismatch` when `state` does not match; no exchange happens.
    /// - `TokenExchangeFailed` when the token endpoint refuses the code.
    pub async fn authorize(
        &self,
        server_url: &str,
        mode: &RegistrationMode,
    ) -> Result<AuthorizedSession> {
        let resource_url = Url::parse(server_url)
            .map_err(|e| FlowError::Discovery(format!("invalid server URL {server_url}: {e}")))?;

        let discovered = discovery::discover(&self.http, &resource_url).await?;
        pkce::verify_s256_support(&discovered.server)?;

        let listener = CallbackListener::start(self.config.callback_port).await?;
        let outcome = self
            .obtain_code(&listener, &discovered, &resource_url, mode)
            .await;
        listener.stop().await;
        let (code, request) = outcome?;

        let token = self
            .exchange_code(&discovered.server, &code, &request, &resource_url)
            .await?;
        tracing::info!(client_id = %request.client.client_id, "Authorization complete");

        Ok(AuthorizedSession::new(
            self.http.clone(),
            resource_url,
            token,
            request.client.client_id,
        ))
    }

    /// Everything that needs the listener alive.
    async fn obtain_code(
        &self,
        listener: &CallbackListener,
        discovered: &DiscoveredServer,
        resource_url: &Url,
        mode: &RegistrationMode,
    ) -> Result<(String, AuthorizationRequest)> {
        let redirect_uri = listener.redirect_uri();
        let client = self
            .resolve_client(&discovered.server, mode, &redirect_uri)
            .await?;

        let scope = self
            .config
            .scope
            .clone()
            .or_else(|| client.scope.clone())
            .or_else(|| discovered.default_scope());
        let state = generate_state();
        let pair = pkce::generate();

        let auth_url = build_authorization_url(
            &discovered.server,
            &client.client_id,
            &redirect_uri,
            scope.as_deref(),
            &state,
            &pair.challenge,
            resource_url,
        )?;

        eprintln!("Open the following URL in your browser to authorize:\n{auth_url}");
        if let Err(e) = self.browser.open(&auth_url) {
            tracing::warn!("Could not open browser: {}", e);
        }

        let params = match listener
            .wait_for_callback(self.config.callback_timeout)
            .await
        {
            Ok(params) => params,
            Err(FlowError::CallbackError(reason)) => {
                return Err(match listener.result() {
                    Some(CallbackResult::Failed { error, .. }) => {
                        FlowError::AuthorizationDenied(error)
                    }
                    _ => FlowError::CallbackError(reason),
                }
                .into());
            }
            Err(other) => return Err(other.into()),
        };

        if params.state.as_deref() != Some(state.as_str()) {
            tracing::warn!("Callback state did not match the authorization request");
            return Err(FlowError::StateMismatch.into());
        }

        Ok((
            params.code,
            AuthorizationRequest {
                client,
                redirect_uri,
                verifier: pair.verifier,
            },
        ))
    }

    async fn resolve_client(
        &self,
        server: &AuthorizationServerMetadata,
        mode: &RegistrationMode,
        redirect_uri: &str,
    ) -> Result<ClientRegistration> {
        match mode {
            RegistrationMode::PreRegistered(client) => {
                if !client.allows_redirect(redirect_uri) {
                    tracing::warn!(
                        client_id = %client.client_id,
                        redirect_uri,
                        "Redirect URI is not among the client's registered URIs"
                    );
                }
                Ok(client.clone())
            }
            RegistrationMode::Dynamic { client_name } => {
                let endpoint = server.registration_endpoint.as_deref().ok_or_else(|| {
                    FlowError::Registration(
                        "authorization server has no registration endpoint".to_string(),
                    )
                })?;
                self.register_client(endpoint, client_name, redirect_uri)
                    .await
            }
        }
    }

    /// Performs Dynamic Client Registration (RFC 7591).
    async fn register_client(
        &self,
        endpoint: &str,
        client_name: &str,
        redirect_uri: &str,
    ) -> Result<ClientRegistration> {
        let metadata = ClientMetadata {
            client_name: Some(client_name.to_string()),
            redirect_uris: vec![redirect_uri.to_string()],
            grant_types: vec!["authorization_code".to_string(), "refresh_token".to_string()],
            response_types: vec!["code".to_string()],
            token_endpoint_auth_method: Some("client_secret_post".to_string()),
            scope: None,
        };

        let resp = self
            .http
            .post(endpoint)
            .json(&metadata)
            .send()
            .await
            .map_err(|e| FlowError::Registration(format!("request failed: {e}")))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(
                FlowError::Registration(format!("endpoint returned {status}: {body}")).into(),
            );
        }

        let dcr: DcrResponse = resp
            .json()
            .await
            .map_err(|e| FlowError::Registration(format!("invalid response: {e}")))?;
        tracing::info!(client_id = %dcr.client_id, "Registered client");

        let mut client = ClientRegistration::public(dcr.client_id, [redirect_uri.to_string()]);
        client.client_name = Some(client_name.to_string());
        client.token_endpoint_auth_method = dcr
            .token_endpoint_auth_method
            .unwrap_or_else(|| "client_secret_post".to_string());
        client.client_secret = dcr.client_secret;
        Ok(client)
    }

    /// Exchanges the code at the token endpoint.
    async fn exchange_code(
        &self,
        server: &AuthorizationServerMetadata,
        code: &str,
        request: &AuthorizationRequest,
        resource_url: &Url,
    ) -> Result<OAuthToken> {
        let client = &request.client;
        let mut form: Vec<(&str, &str)> = vec![
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", request.redirect_uri.as_str()),
            ("code_verifier", request.verifier.as_str()),
            ("resource", resource_url.as_str()),
        ];

        let mut builder = self.http.post(&server.token_endpoint);
        match (
            client.token_endpoint_auth_method.as_str(),
            client.client_secret.as_deref(),
        ) {
            ("client_secret_basic", Some(secret)) => {
                builder = builder.basic_auth(&client.client_id, Some(secret));
            }
            (_, Some(secret)) => {
                form.push(("client_id", client.client_id.as_str()));
                form.push(("client_secret", secret));
            }
            (_, None) => form.push(("client_id", client.client_id.as_str())),
        }

        let resp = builder
            .form(&form)
            .send()
            .await
            .map_err(|e| FlowError::TokenExchangeFailed(format!("request failed: {e}")))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            let reason = serde_json::from_str::<OAuthErrorResponse>(&body)
                .map(|e| match e.error_description {
                    Some(d) => format!("{}: {}", e.error, d),
                    None => e.error,
                })
                .unwrap_or_else(|_| format!("token endpoint returned {status}"));
            return Err(FlowError::TokenExchangeFailed(reason).into());
        }

        let raw: TokenResponse = resp
            .json()
            .await
            .map_err(|e| FlowError::TokenExchangeFailed(format!("invalid token response: {e}")))?;

        Ok(OAuthToken::from_response(raw))
    }
}

/// 16 random bytes, base64url without padding.
fn generate_state() -> String {
    use rand::RngCore as _;
    let mut bytes = [0u8; 16];
    rand::rng().fill_bytes(&mut bytes);
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes)
}

/// Builds the authorization URL.
fn build_authorization_url(
    server: &AuthorizationServerMetadata,
    client_id: &str,
    redirect_uri: &str,
    scope: Option<&str>,
    state: &str,
    code_challenge: &str,
    resource_url: &Url,
) -> Result<String> {
    let mut url = Url::parse(&server.authorization_endpoint).map_err(|e| {
        FlowError::Discovery(format!("invalid authorization endpoint URL: {e}"))
    })?;

    {
        let mut query = url.query_pairs_mut();
        query.append_pair("response_type", "code");
        query.append_pair("client_id", client_id);
        query.append_pair("redirect_uri", redirect_uri);
        if let Some(s) = scope {
            query.append_pair("scope", s);
        }
        query.append_pair("state", state);
        query.append_pair("code_challenge", code_challenge);
        query.append_pair("code_challenge_method", pkce::S256);
        query.append_pair("resource", resource_url.as_str());
    }

    Ok(url.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn server() -> AuthorizationServerMetadata {
        AuthorizationServerMetadata {
            issuer: "https://auth.example.com".to_string(),
            authorization_endpoint: "https://auth.example.com/authorize".to_string(),
            token_endpoint: "https://auth.example.com/token".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_generate_state_produces_unique_values() {
        let a = generate_state();
        let b = generate_state();
        assert_eq!(a.len(), 22);
        assert_ne!(a, b);
    }

    #[test]
    fn test_build_authorization_url_contains_required_params() {
        let resource = Url::parse("http://localhost:8001/mcp").unwrap();
        let url = build_authorization_url(
            &server(),
            "client-1",
            "http://localhost:3030/callback",
            Some("user"),
            "abc123",
            "challenge",
            &resource,
        )
        .unwrap();

        let parsed = Url::parse(&url).unwrap();
        let params: HashMap<String, String> = parsed.query_pairs().into_owned().collect();
        assert_eq!(params["response_type"], "code");
        assert_eq!(params["client_id"], "client-1");
        assert_eq!(params["redirect_uri"], "http://localhost:3030/callback");
        assert_eq!(params["scope"], "user");
        assert_eq!(params["state"], "abc123");
        assert_eq!(params["code_challenge"], "challenge");
        assert_eq!(params["code_challenge_method"], "S256");
        assert_eq!(params["resource"], "http://localhost:8001/mcp");
    }

    #[test]
    fn test_build_authorization_url_omits_scope_when_none() {
        let resource = Url::parse("http://localhost:8001/mcp").unwrap();
        let url = build_authorization_url(
            &server(),
            "c",
            "http://localhost:3030/callback",
            None,
            "s",
            "ch",
            &resource,
        )
        .unwrap();
        assert!(!url.contains("scope="));
    }

    #[test]
    fn test_registration_mode_from_config_dynamic() {
        let config = ClientConfig::default();
        assert!(matches!(
            RegistrationMode::from_config(&config).unwrap(),
            RegistrationMode::Dynamic { .. }
        ));
    }

    #[test]
    fn test_registration_mode_from_config_pre_registered() {
        let config = ClientConfig {
            use_dcr: false,
            client_id: Some("cognito-app".to_string()),
            client_secret: Some("secret".to_string()),
            ..Default::default()
        };
        match RegistrationMode::from_config(&config).unwrap() {
            RegistrationMode::PreRegistered(client) => {
                assert_eq!(client.client_id, "cognito-app");
                assert_eq!(client.token_endpoint_auth_method, "client_secret_post");
                assert!(client.allows_redirect("http://localhost:3030/callback"));
                assert_eq!(client.scope.as_deref(), Some("openid profile email"));
            }
            other => panic!("unexpected mode: {other:?}"),
        }
    }

    #[test]
    fn test_registration_mode_pre_registered_without_id_fails() {
        let config = ClientConfig {
            use_dcr: false,
            ..Default::default()
        };
        let err = RegistrationMode::from_config(&config).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<FlowError>(),
            Some(FlowError::Registration(_))
        ));
    }
}
