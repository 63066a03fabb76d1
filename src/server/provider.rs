//! Authorization server state and grant logic
//!
//! [`AuthorizationServerProvider`] owns every piece of authorization server
//! state: registered clients, authorization requests waiting for login,
//! issued codes and issued tokens.  All of it lives in [`DashMap`]s so that
//! concurrent introspection calls from several resource servers never
//! contend on a single lock.
//!
//! An authorization request moves through
//! `PendingLogin -> Authenticated -> CodeIssued -> TokenIssued`.  The token
//! it produces is then `Active` until it expires or is revoked.
//!
//! The HTTP layer in [`handlers`](super::handlers) is a thin translation of
//! these methods.

use std::collections::HashSet;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::auth::discovery::AuthorizationServerMetadata;
use crate::auth::pkce;
use crate::config::AuthServerConfig;
use crate::oauth::{
    now_epoch, parse_scopes, random_token, same_resource, ClientMetadata, ClientRegistration,
    OAuthErrorResponse, TokenResponse, BEARER, GRANT_AUTHORIZATION_CODE,
};

/// Prefix of every code and token minted here.
pub const TOKEN_PREFIX: &str = "mcp_";

const CODE_BYTES: usize = 16;
const TOKEN_BYTES: usize = 32;

const SUPPORTED_AUTH_METHODS: [&str; 3] = ["client_secret_post", "client_secret_basic", "none"];

// ---------------------------------------------------------------------------
// State machine
// ---------------------------------------------------------------------------

/// Where an authorization request stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GrantPhase {
    /// `/authorize` accepted the request; the login form is waiting.
    PendingLogin,
    /// The user's credentials were accepted.
    Authenticated,
    /// A code was minted and sent to the redirect URI.
    CodeIssued,
    /// The code was exchanged for a token.
    TokenIssued,
}

/// Lifecycle of an issued token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenStatus {
    /// Usable.
    Active,
    /// Past its expiry.
    Expired,
    /// Explicitly revoked.
    Revoked,
}

/// An authorization request accepted at `/authorize`, keyed by `state`.
#[derive(Debug, Clone)]
pub struct PendingAuthorization {
    /// Requesting client
    pub client_id: String,
    /// Resolved redirect URI
    pub redirect_uri: String,
    /// Whether the request named the redirect URI explicitly
    pub redirect_uri_provided: bool,
    /// Requested scopes, validated
    pub scopes: Vec<String>,
    /// PKCE S256 challenge
    pub code_challenge: String,
    /// RFC 8707 resource indicator
    pub resource: Option<String>,
    /// Client-chosen state
    pub state: String,
    /// Epoch seconds when the request was accepted
    pub created_at: u64,
    /// Current phase
    pub phase: GrantPhase,
}

/// A minted, unused authorization code.
#[derive(Debug, Clone)]
struct AuthorizationCode {
    client_id: String,
    redirect_uri: String,
    redirect_uri_provided: bool,
    scopes: Vec<String>,
    code_challenge: String,
    resource: Option<String>,
    state: String,
    expires_at: u64,
}

/// A token minted by the token endpoint.
#[derive(Debug, Clone)]
pub struct IssuedToken {
    /// Client the token was issued to
    pub client_id: String,
    /// Granted scopes
    pub scopes: Vec<String>,
    /// Resource the token is bound to
    pub resource: Option<String>,
    /// Epoch seconds of issuance
    pub issued_at: u64,
    /// Epoch seconds of expiry
    pub expires_at: u64,
    /// Set by revocation
    pub revoked: bool,
}

impl IssuedToken {
    /// The token's status at `now`.
    pub fn status(&self, now: u64) -> TokenStatus {
        if self.revoked {
            TokenStatus::Revoked
        } else if now >= self.expires_at {
            TokenStatus::Expired
        } else {
            TokenStatus::Active
        }
    }
}

// ---------------------------------------------------------------------------
// Requests and errors
// ---------------------------------------------------------------------------

/// Query parameters of `GET /authorize`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AuthorizeParams {
    pub response_type: Option<String>,
    pub client_id: Option<String>,
    pub redirect_uri: Option<String>,
    pub scope: Option<String>,
    pub state: Option<String>,
    pub code_challenge: Option<String>,
    pub code_challenge_method: Option<String>,
    pub resource: Option<String>,
}

/// Why `/authorize` refused a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthorizeError {
    /// The client or redirect URI cannot be trusted; render an error page
    /// instead of redirecting.
    Untrusted {
        /// Short error code
        error: &'static str,
        /// Detail for the page
        description: String,
    },
    /// Report the error to the client through its redirect URI.
    Redirect {
        /// Verified redirect URI
        redirect_uri: String,
        /// RFC 6749 section 4.1.2.1 error code
        error: &'static str,
        /// Detail for the client
        description: String,
        /// State to echo, when the request had one
        state: Option<String>,
    },
}

impl AuthorizeError {
    fn redirect(
        redirect_uri: &str,
        error: &'static str,
        description: impl Into<String>,
        state: Option<&str>,
    ) -> Self {
        Self::Redirect {
            redirect_uri: redirect_uri.to_string(),
            error,
            description: description.into(),
            state: state.map(str::to_string),
        }
    }

    /// Target URL for the `Redirect` variant.
    pub fn redirect_url(&self) -> Option<String> {
        match self {
            Self::Untrusted { .. } => None,
            Self::Redirect {
                redirect_uri,
                error,
                description,
                state,
            } => {
                let mut params = vec![("error", *error), ("error_description", description.as_str())];
                if let Some(s) = state {
                    params.push(("state", s.as_str()));
                }
                append_query(redirect_uri, &params)
            }
        }
    }
}

/// Why a login attempt did not produce a code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoginError {
    /// No pending request for this state, or it expired.
    UnknownState,
    /// Username or password did not match.
    InvalidCredentials,
}

/// Form body of `POST /token`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TokenRequest {
    pub grant_type: Option<String>,
    pub code: Option<String>,
    pub redirect_uri: Option<String>,
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    pub code_verifier: Option<String>,
    pub resource: Option<String>,
}

/// An RFC 6749 section 5.2 error from the token or registration endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderError {
    /// Error code
    pub error: &'static str,
    /// Detail for the client
    pub description: String,
}

impl ProviderError {
    fn new(error: &'static str, description: impl Into<String>) -> Self {
        Self {
            error,
            description: description.into(),
        }
    }

    /// HTTP status for this error: 401 for `invalid_client`, 400 otherwise.
    pub fn status(&self) -> u16 {
        if self.error == "invalid_client" {
            401
        } else {
            400
        }
    }

    /// JSON body.
    pub fn body(&self) -> OAuthErrorResponse {
        OAuthErrorResponse::new(self.error, self.description.clone())
    }
}

/// RFC 7662 introspection response.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntrospectionResponse {
    pub active: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exp: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iat: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aud: Option<String>,
}

impl IntrospectionResponse {
    /// `{"active": false}`
    pub fn inactive() -> Self {
        Self::default()
    }
}

// ---------------------------------------------------------------------------
// Provider
// ---------------------------------------------------------------------------

/// In-memory authorization server.
///
/// # Examples
///
/// ```
/// use gatehouse::config::AuthServerConfig;
/// use gatehouse::server::AuthorizationServerProvider;
///
/// let provider = AuthorizationServerProvider::new(AuthServerConfig::default());
/// assert_eq!(provider.issuer(), "http://localhost:9000");
/// assert!(!provider.introspect("mcp_unknown").active);
/// ```
#[derive(Debug)]
pub struct AuthorizationServerProvider {
    config: AuthServerConfig,
    issuer: String,
    clients: DashMap<String, ClientRegistration>,
    pending: DashMap<String, PendingAuthorization>,
    codes: DashMap<String, AuthorizationCode>,
    tokens: DashMap<String, IssuedToken>,
}

impl AuthorizationServerProvider {
    /// Creates a provider and loads the pre-registered clients.
    pub fn new(config: AuthServerConfig) -> Self {
        let clients = DashMap::new();
        for client in &config.clients {
            clients.insert(client.client_id.clone(), client.clone());
        }
        tracing::info!(
            clients = config.clients.len(),
            "Loaded pre-registered clients"
        );
        Self {
            issuer: config.issuer_url(),
            config,
            clients,
            pending: DashMap::new(),
            codes: DashMap::new(),
            tokens: DashMap::new(),
        }
    }

    /// Issuer identifier, without a trailing slash.
    pub fn issuer(&self) -> &str {
        &self.issuer
    }

    /// The RFC 8414 discovery document.
    pub fn metadata(&self) -> AuthorizationServerMetadata {
        let endpoint = |path: &str| format!("{}{}", self.issuer, path);
        AuthorizationServerMetadata {
            issuer: self.issuer.clone(),
            authorization_endpoint: endpoint("/authorize"),
            token_endpoint: endpoint("/token"),
            registration_endpoint: Some(endpoint("/register")),
            introspection_endpoint: Some(endpoint("/introspect")),
            revocation_endpoint: Some(endpoint("/revoke")),
            jwks_uri: None,
            scopes_supported: Some(self.config.valid_scopes()),
            response_types_supported: vec!["code".to_string()],
            grant_types_supported: Some(vec![GRANT_AUTHORIZATION_CODE.to_string()]),
            token_endpoint_auth_methods_supported: Some(
                SUPPORTED_AUTH_METHODS.iter().map(|m| m.to_string()).collect(),
            ),
            code_challenge_methods_supported: Some(vec![pkce::S256.to_string()]),
            extra: Default::default(),
        }
    }

    /// Looks up a registered client.
    pub fn client(&self, client_id: &str) -> Option<ClientRegistration> {
        self.clients.get(client_id).map(|c| c.value().clone())
    }

    /// Dynamic Client Registration (RFC 7591).
    ///
    /// # Errors
    ///
    /// `invalid_redirect_uri` when no usable redirect URI is given,
    /// `invalid_client_metadata` for unsupported grant types, auth methods
    /// or scopes.
    pub fn register_client(
        &self,
        metadata: ClientMetadata,
    ) -> Result<ClientRegistration, ProviderError> {
        if metadata.redirect_uris.is_empty() {
            return Err(ProviderError::new(
                "invalid_redirect_uri",
                "at least one redirect_uri is required",
            ));
        }
        if let Some(bad) = metadata
            .redirect_uris
            .iter()
            .find(|u| Url::parse(u).is_err())
        {
            return Err(ProviderError::new(
                "invalid_redirect_uri",
                format!("invalid redirect_uri: {bad}"),
            ));
        }

        let auth_method = metadata
            .token_endpoint_auth_method
            .clone()
            .unwrap_or_else(|| "client_secret_post".to_string());
        if !SUPPORTED_AUTH_METHODS.contains(&auth_method.as_str()) {
            return Err(ProviderError::new(
                "invalid_client_metadata",
                format!("unsupported token_endpoint_auth_method: {auth_method}"),
            ));
        }

        if let Some(scope) = &metadata.scope {
            let valid = self.config.valid_scopes();
            if let Some(unknown) = parse_scopes(scope).into_iter().find(|s| !valid.contains(s)) {
                return Err(ProviderError::new(
                    "invalid_client_metadata",
                    format!("unknown scope: {unknown}"),
                ));
            }
        }

        let mut grant_types: std::collections::BTreeSet<String> =
            metadata.grant_types.iter().cloned().collect();
        if grant_types.is_empty() {
            grant_types.insert(GRANT_AUTHORIZATION_CODE.to_string());
        }
        if !grant_types.contains(GRANT_AUTHORIZATION_CODE) {
            return Err(ProviderError::new(
                "invalid_client_metadata",
                "grant_types must include authorization_code",
            ));
        }

        let client_secret = (auth_method != "none").then(|| random_token("", TOKEN_BYTES));
        let client = ClientRegistration {
            client_id: uuid::Uuid::new_v4().to_string(),
            client_secret,
            client_name: metadata.client_name,
            redirect_uris: metadata.redirect_uris.into_iter().collect(),
            grant_types,
            token_endpoint_auth_method: auth_method,
            scope: metadata.scope,
            client_id_issued_at: Some(now_epoch()),
        };

        tracing::info!(
            client_id = %client.client_id,
            client_name = client.client_name.as_deref().unwrap_or(""),
            "Registered client"
        );
        self.clients
            .insert(client.client_id.clone(), client.clone());
        Ok(client)
    }

    /// Validates an authorization request and parks it for login.
    ///
    /// Returns the path of the login page for the request's `state`.
    ///
    /// # Errors
    ///
    /// [`AuthorizeError::Untrusted`] for an unknown client or an
    /// unregistered redirect URI, [`AuthorizeError::Redirect`] for anything
    /// else.
    pub fn authorize(&self, params: AuthorizeParams) -> Result<String, AuthorizeError> {
        let client_id = params
            .client_id
            .as_deref()
            .filter(|id| !id.is_empty())
            .ok_or_else(|| AuthorizeError::Untrusted {
                error: "invalid_request",
                description: "client_id is required".to_string(),
            })?;
        let client = self.client(client_id).ok_or_else(|| AuthorizeError::Untrusted {
            error: "invalid_client",
            description: format!("unknown client: {client_id}"),
        })?;
        let redirect_uri = client
            .resolve_redirect(params.redirect_uri.as_deref())
            .ok_or_else(|| AuthorizeError::Untrusted {
                error: "invalid_request",
                description: "redirect_uri is not registered for this client".to_string(),
            })?;

        let state = params.state.as_deref().filter(|s| !s.is_empty());

        if params.response_type.as_deref() != Some("code") {
            return Err(AuthorizeError::redirect(
                &redirect_uri,
                "unsupported_response_type",
                "only response_type=code is supported",
                state,
            ));
        }

        let Some(state) = state else {
            return Err(AuthorizeError::redirect(
                &redirect_uri,
                "invalid_request",
                "state is required",
                None,
            ));
        };

        let code_challenge = match (
            params.code_challenge.as_deref(),
            params.code_challenge_method.as_deref(),
        ) {
            (Some(challenge), Some(pkce::S256)) if !challenge.is_empty() => challenge.to_string(),
            _ => {
                return Err(AuthorizeError::redirect(
                    &redirect_uri,
                    "invalid_request",
                    "code_challenge with code_challenge_method=S256 is required",
                    Some(state),
                ));
            }
        };

        let requested = parse_scopes(params.scope.as_deref().unwrap_or(""));
        let scopes = if requested.is_empty() {
            vec![self.config.scope.clone()]
        } else {
            let valid = self.config.valid_scopes();
            if let Some(unknown) = requested.iter().find(|s| !valid.contains(s)) {
                return Err(AuthorizeError::redirect(
                    &redirect_uri,
                    "invalid_scope",
                    format!("unknown scope: {unknown}"),
                    Some(state),
                ));
            }
            requested
        };

        let resource = params.resource.filter(|r| !r.is_empty());
        if let Some(r) = &resource {
            if Url::parse(r).is_err() {
                return Err(AuthorizeError::redirect(
                    &redirect_uri,
                    "invalid_target",
                    "resource must be an absolute URI",
                    Some(state),
                ));
            }
        }

        let now = now_epoch();
        self.prune_expired(now);
        let request = PendingAuthorization {
            client_id: client.client_id.clone(),
            redirect_uri: redirect_uri.clone(),
            redirect_uri_provided: params.redirect_uri.is_some(),
            scopes,
            code_challenge,
            resource,
            state: state.to_string(),
            created_at: now,
            phase: GrantPhase::PendingLogin,
        };

        match self.pending.entry(state.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(mut entry) => {
                if entry.get().phase == GrantPhase::PendingLogin && !self.request_expired(entry.get(), now) {
                    return Err(AuthorizeError::redirect(
                        &redirect_uri,
                        "invalid_request",
                        "state is already in use",
                        Some(state),
                    ));
                }
                entry.insert(request);
            }
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                entry.insert(request);
            }
        }

        tracing::info!(client_id = %client.client_id, "Authorization request pending login");
        Ok(append_query("/login", &[("state", state)]).unwrap_or_else(|| "/login".to_string()))
    }

    /// Client name and scope for rendering the login form, when `state`
    /// names a request still waiting for login.
    pub fn login_context(&self, state: &str) -> Option<(String, String)> {
        let request = self.pending.get(state)?;
        if request.phase != GrantPhase::PendingLogin
            || self.request_expired(request.value(), now_epoch())
        {
            return None;
        }
        let client_id = request.client_id.clone();
        let scope = request.scopes.join(" ");
        drop(request);

        let name = self
            .client(&client_id)
            .and_then(|c| c.client_name)
            .unwrap_or(client_id);
        Some((name, scope))
    }

    /// Checks the credentials for `state` and mints a code.
    ///
    /// Returns the redirect URL carrying `code` and `state`.
    ///
    /// # Errors
    ///
    /// [`LoginError::InvalidCredentials`] leaves the request in
    /// `PendingLogin`; [`LoginError::UnknownState`] when there is no such
    /// request waiting.
    pub fn complete_login(
        &self,
        state: &str,
        username: &str,
        password: &str,
    ) -> Result<String, LoginError> {
        let now = now_epoch();
        let mut request = self
            .pending
            .get_mut(state)
            .ok_or(LoginError::UnknownState)?;
        if request.phase != GrantPhase::PendingLogin || self.request_expired(request.value(), now) {
            return Err(LoginError::UnknownState);
        }

        if !constant_time_eq(username, &self.config.demo_username)
            || !constant_time_eq(password, &self.config.demo_password)
        {
            tracing::warn!(client_id = %request.client_id, "Login rejected: invalid credentials");
            return Err(LoginError::InvalidCredentials);
        }
        request.phase = GrantPhase::Authenticated;

        let code = random_token(TOKEN_PREFIX, CODE_BYTES);
        let record = AuthorizationCode {
            client_id: request.client_id.clone(),
            redirect_uri: request.redirect_uri.clone(),
            redirect_uri_provided: request.redirect_uri_provided,
            scopes: request.scopes.clone(),
            code_challenge: request.code_challenge.clone(),
            resource: request.resource.clone(),
            state: request.state.clone(),
            expires_at: now.saturating_add(self.config.code_ttl_seconds),
        };
        request.phase = GrantPhase::CodeIssued;
        let redirect_uri = request.redirect_uri.clone();
        tracing::info!(client_id = %request.client_id, "Authorization code issued");
        drop(request);

        self.codes.insert(code.clone(), record);
        append_query(&redirect_uri, &[("code", code.as_str()), ("state", state)])
            .ok_or(LoginError::UnknownState)
    }

    /// The user pressed Deny; ends the request and returns the redirect URL
    /// carrying `error=access_denied`.
    pub fn deny(&self, state: &str) -> Option<String> {
        let (_, request) = self
            .pending
            .remove_if(state, |_, r| r.phase == GrantPhase::PendingLogin)?;
        tracing::info!(client_id = %request.client_id, "Authorization denied by user");
        append_query(
            &request.redirect_uri,
            &[
                ("error", "access_denied"),
                ("error_description", "the user denied the request"),
                ("state", state),
            ],
        )
    }

    /// Phase of the request identified by `state`.
    pub fn grant_phase(&self, state: &str) -> Option<GrantPhase> {
        self.pending.get(state).map(|r| r.phase)
    }

    /// Exchanges an authorization code for an access token.
    ///
    /// `basic` carries credentials from an HTTP Basic `Authorization`
    /// header; they take precedence over form credentials.
    ///
    /// # Errors
    ///
    /// An RFC 6749 section 5.2 error.
    pub fn exchange_code(
        &self,
        request: TokenRequest,
        basic: Option<(String, String)>,
    ) -> Result<TokenResponse, ProviderError> {
        match request.grant_type.as_deref() {
            Some(GRANT_AUTHORIZATION_CODE) => {}
            Some(other) => {
                return Err(ProviderError::new(
                    "unsupported_grant_type",
                    format!("unsupported grant_type: {other}"),
                ))
            }
            None => return Err(ProviderError::new("invalid_request", "grant_type is required")),
        }

        let (client_id, secret, via_basic) = match basic {
            Some((id, secret)) => (Some(id), Some(secret), true),
            None => (request.client_id.clone(), request.client_secret.clone(), false),
        };
        let client = self.authenticate_client(client_id.as_deref(), secret.as_deref(), via_basic)?;

        let code = request
            .code
            .as_deref()
            .filter(|c| !c.is_empty())
            .ok_or_else(|| ProviderError::new("invalid_request", "code is required"))?;
        let verifier = request
            .code_verifier
            .as_deref()
            .ok_or_else(|| ProviderError::new("invalid_request", "code_verifier is required"))?;

        // Removal makes the code single-use even under concurrent exchanges.
        let (_, grant) = self
            .codes
            .remove(code)
            .ok_or_else(|| ProviderError::new("invalid_grant", "unknown or used code"))?;

        let now = now_epoch();
        if now >= grant.expires_at {
            return Err(ProviderError::new("invalid_grant", "code expired"));
        }
        if grant.client_id != client.client_id {
            tracing::warn!(client_id = %client.client_id, "Code presented by another client");
            return Err(ProviderError::new("invalid_grant", "code was issued to another client"));
        }
        match request.redirect_uri.as_deref() {
            Some(uri) if uri != grant.redirect_uri => {
                return Err(ProviderError::new("invalid_grant", "redirect_uri mismatch"));
            }
            None if grant.redirect_uri_provided => {
                return Err(ProviderError::new("invalid_request", "redirect_uri is required"));
            }
            _ => {}
        }
        if !pkce::verify(verifier, &grant.code_challenge) {
            return Err(ProviderError::new("invalid_grant", "PKCE verification failed"));
        }
        let resource = match (grant.resource, request.resource.filter(|r| !r.is_empty())) {
            (Some(bound), Some(asked)) if !same_resource(&bound, &asked) => {
                return Err(ProviderError::new(
                    "invalid_target",
                    "resource does not match the authorization request",
                ));
            }
            (Some(bound), _) => Some(bound),
            (None, asked) => asked,
        };

        let token = random_token(TOKEN_PREFIX, TOKEN_BYTES);
        let issued = IssuedToken {
            client_id: client.client_id.clone(),
            scopes: grant.scopes,
            resource,
            issued_at: now,
            expires_at: now.saturating_add(self.config.token_ttl_seconds),
            revoked: false,
        };
        let scope = issued.scopes.join(" ");
        self.tokens.insert(token.clone(), issued);

        if let Some(mut pending) = self.pending.get_mut(&grant.state) {
            pending.phase = GrantPhase::TokenIssued;
        }

        tracing::info!(
            client_id = %client.client_id,
            token = %crate::oauth::fingerprint(&token),
            "Access token issued"
        );

        Ok(TokenResponse {
            access_token: token,
            token_type: BEARER.to_string(),
            expires_in: Some(self.config.token_ttl_seconds),
            refresh_token: None,
            scope: Some(scope),
        })
    }

    /// RFC 7662 introspection.  Unknown, expired and revoked tokens are
    /// reported as `{"active": false}`.
    pub fn introspect(&self, token: &str) -> IntrospectionResponse {
        let Some(issued) = self.tokens.get(token) else {
            return IntrospectionResponse::inactive();
        };
        if issued.status(now_epoch()) != TokenStatus::Active {
            return IntrospectionResponse::inactive();
        }
        IntrospectionResponse {
            active: true,
            client_id: Some(issued.client_id.clone()),
            scope: Some(issued.scopes.join(" ")),
            exp: Some(issued.expires_at),
            iat: Some(issued.issued_at),
            token_type: Some(BEARER.to_string()),
            aud: issued.resource.clone(),
        }
    }

    /// Status of an issued token.
    pub fn token_status(&self, token: &str) -> Option<TokenStatus> {
        self.tokens.get(token).map(|t| t.status(now_epoch()))
    }

    /// RFC 7009 revocation.  Returns `true` when a token was revoked.
    pub fn revoke(&self, token: &str) -> bool {
        match self.tokens.get_mut(token) {
            Some(mut issued) => {
                issued.revoked = true;
                tracing::info!(token = %crate::oauth::fingerprint(token), "Token revoked");
                true
            }
            None => false,
        }
    }

    fn authenticate_client(
        &self,
        client_id: Option<&str>,
        secret: Option<&str>,
        via_basic: bool,
    ) -> Result<ClientRegistration, ProviderError> {
        let client_id = client_id
            .filter(|id| !id.is_empty())
            .ok_or_else(|| ProviderError::new("invalid_client", "client authentication required"))?;
        let client = self
            .client(client_id)
            .ok_or_else(|| ProviderError::new("invalid_client", "unknown client"))?;

        if !client.is_confidential() {
            return Ok(client);
        }

        let method_ok = match client.token_endpoint_auth_method.as_str() {
            "client_secret_basic" => via_basic,
            _ => true,
        };
        let secret_ok = match (client.client_secret.as_deref(), secret) {
            (Some(expected), Some(given)) => constant_time_eq(expected, given),
            _ => false,
        };
        if method_ok && secret_ok {
            Ok(client)
        } else {
            tracing::warn!(client_id, "Client authentication failed");
            Err(ProviderError::new("invalid_client", "client authentication failed"))
        }
    }

    fn request_expired(&self, request: &PendingAuthorization, now: u64) -> bool {
        now >= request.created_at.saturating_add(self.config.code_ttl_seconds)
    }

    /// Drops expired codes, and requests past their TTL that no live code
    /// still refers to.
    fn prune_expired(&self, now: u64) {
        self.codes.retain(|_, code| now < code.expires_at);
        let live: HashSet<String> = self.codes.iter().map(|c| c.state.clone()).collect();

        let before = self.pending.len();
        self.pending
            .retain(|state, request| !self.request_expired(request, now) || live.contains(state));
        let removed = before.saturating_sub(self.pending.len());
        if removed > 0 {
            tracing::debug!(removed, "Pruned expired authorization requests");
        }
    }
}

/// Appends query parameters to `base`, keeping any it already has.
fn append_query(base: &str, params: &[(&str, &str)]) -> Option<String> {
    if base.starts_with('/') {
        let mut url = Url::parse("http://placeholder").ok()?.join(base).ok()?;
        url.query_pairs_mut().extend_pairs(params);
        let mut out = url.path().to_string();
        if let Some(q) = url.query() {
            out.push('?');
            out.push_str(q);
        }
        return Some(out);
    }
    let mut url = Url::parse(base).ok()?;
    url.query_pairs_mut().extend_pairs(params);
    Some(url.to_string())
}

fn constant_time_eq(a: &str, b: &str) -> bool {
    let (a, b) = (a.as_bytes(), b.as_bytes());
    a.len() == b.len() && a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    const REDIRECT: &str = "http://localhost:3030/callback";

    fn provider() -> AuthorizationServerProvider {
        let mut config = AuthServerConfig::default();
        let mut client = ClientRegistration::public("test-client", [REDIRECT.to_string()]);
        client.client_secret = Some("s3cret".to_string());
        client.token_endpoint_auth_method = "client_secret_post".to_string();
        config.clients.push(client);
        AuthorizationServerProvider::new(config)
    }

    fn params(state: &str, challenge: &str) -> AuthorizeParams {
        AuthorizeParams {
            response_type: Some("code".to_string()),
            client_id: Some("test-client".to_string()),
            redirect_uri: Some(REDIRECT.to_string()),
            scope: Some("user".to_string()),
            state: Some(state.to_string()),
            code_challenge: Some(challenge.to_string()),
            code_challenge_method: Some("S256".to_string()),
            resource: Some("http://localhost:8001/mcp".to_string()),
        }
    }

    fn query(url: &str) -> HashMap<String, String> {
        Url::parse(url).unwrap().query_pairs().into_owned().collect()
    }

    fn token_request(code: &str, verifier: &str) -> TokenRequest {
        TokenRequest {
            grant_type: Some("authorization_code".to_string()),
            code: Some(code.to_string()),
            redirect_uri: Some(REDIRECT.to_string()),
            client_id: Some("test-client".to_string()),
            client_secret: Some("s3cret".to_string()),
            code_verifier: Some(verifier.to_string()),
            resource: Some("http://localhost:8001/mcp".to_string()),
        }
    }

    /// Runs authorize + login and returns (code, verifier).
    fn issue_code(p: &AuthorizationServerProvider, state: &str) -> (String, String) {
        let pair = pkce::generate();
        p.authorize(params(state, &pair.challenge)).unwrap();
        let redirect = p.complete_login(state, "demo_user", "demo_password").unwrap();
        (query(&redirect)["code"].clone(), pair.verifier)
    }

    #[test]
    fn test_authorize_returns_login_path() {
        let p = provider();
        let path = p.authorize(params("abc123", "challenge")).unwrap();
        assert_eq!(path, "/login?state=abc123");
        assert_eq!(p.grant_phase("abc123"), Some(GrantPhase::PendingLogin));
    }

    #[test]
    fn test_authorize_unknown_client_is_untrusted() {
        let p = provider();
        let mut req = params("s", "c");
        req.client_id = Some("nobody".to_string());
        assert!(matches!(
            p.authorize(req),
            Err(AuthorizeError::Untrusted { error: "invalid_client", .. })
        ));
    }

    #[test]
    fn test_authorize_unregistered_redirect_is_untrusted() {
        let p = provider();
        let mut req = params("s", "c");
        req.redirect_uri = Some("http://evil.example.com/cb".to_string());
        let err = p.authorize(req).unwrap_err();
        assert!(err.redirect_url().is_none());
    }

    #[test]
    fn test_authorize_invalid_scope_redirects() {
        let p = provider();
        let mut req = params("s", "c");
        req.scope = Some("admin".to_string());
        let err = p.authorize(req).unwrap_err();
        let url = err.redirect_url().unwrap();
        let q = query(&url);
        assert_eq!(q["error"], "invalid_scope");
        assert_eq!(q["state"], "s");
    }

    #[test]
    fn test_authorize_requires_pkce() {
        let p = provider();
        let mut req = params("s", "c");
        req.code_challenge_method = Some("plain".to_string());
        let url = p.authorize(req).unwrap_err().redirect_url().unwrap();
        assert_eq!(query(&url)["error"], "invalid_request");
    }

    #[test]
    fn test_login_wrong_password_stays_pending() {
        let p = provider();
        p.authorize(params("s", "c")).unwrap();
        assert_eq!(
            p.complete_login("s", "demo_user", "wrong"),
            Err(LoginError::InvalidCredentials)
        );
        assert_eq!(p.grant_phase("s"), Some(GrantPhase::PendingLogin));
    }

    #[test]
    fn test_login_unknown_state() {
        let p = provider();
        assert_eq!(
            p.complete_login("nope", "demo_user", "demo_password"),
            Err(LoginError::UnknownState)
        );
    }

    #[test]
    fn test_full_grant_lifecycle() {
        let p = provider();
        let (code, verifier) = issue_code(&p, "abc123");
        assert!(code.starts_with(TOKEN_PREFIX));
        assert_eq!(code.len(), TOKEN_PREFIX.len() + 32);
        assert_eq!(p.grant_phase("abc123"), Some(GrantPhase::CodeIssued));

        let resp = p.exchange_code(token_request(&code, &verifier), None).unwrap();
        assert_eq!(resp.token_type, "Bearer");
        assert_eq!(resp.expires_in, Some(3600));
        assert_eq!(resp.access_token.len(), TOKEN_PREFIX.len() + 64);
        assert_eq!(p.grant_phase("abc123"), Some(GrantPhase::TokenIssued));

        let info = p.introspect(&resp.access_token);
        assert!(info.active);
        assert_eq!(info.client_id.as_deref(), Some("test-client"));
        assert_eq!(info.scope.as_deref(), Some("user"));
        assert_eq!(info.aud.as_deref(), Some("http://localhost:8001/mcp"));
        assert!(info.iat.unwrap() <= info.exp.unwrap());

        assert!(p.revoke(&resp.access_token));
        assert_eq!(p.token_status(&resp.access_token), Some(TokenStatus::Revoked));
        assert!(!p.introspect(&resp.access_token).active);
    }

    #[test]
    fn test_authorize_prunes_expired_requests_and_codes() {
        let p = provider();
        p.pending.insert(
            "stale".to_string(),
            PendingAuthorization {
                client_id: "test-client".to_string(),
                redirect_uri: REDIRECT.to_string(),
                redirect_uri_provided: true,
                scopes: vec!["user".to_string()],
                code_challenge: "c".to_string(),
                resource: None,
                state: "stale".to_string(),
                created_at: 0,
                phase: GrantPhase::PendingLogin,
            },
        );
        p.codes.insert(
            "mcp_stale".to_string(),
            AuthorizationCode {
                client_id: "test-client".to_string(),
                redirect_uri: REDIRECT.to_string(),
                redirect_uri_provided: true,
                scopes: vec!["user".to_string()],
                code_challenge: "c".to_string(),
                resource: None,
                state: "stale".to_string(),
                expires_at: 0,
            },
        );
        let (live_code, _) = issue_code(&p, "live");

        p.authorize(params("fresh", "c")).unwrap();

        assert_eq!(p.grant_phase("stale"), None);
        assert!(!p.codes.contains_key("mcp_stale"));
        assert!(p.codes.contains_key(&live_code));
        assert_eq!(p.grant_phase("live"), Some(GrantPhase::CodeIssued));
        assert_eq!(p.grant_phase("fresh"), Some(GrantPhase::PendingLogin));
    }

    #[test]
    fn test_huge_ttls_do_not_overflow() {
        let mut config = AuthServerConfig::default();
        let mut client = ClientRegistration::public("test-client", [REDIRECT.to_string()]);
        client.client_secret = Some("s3cret".to_string());
        client.token_endpoint_auth_method = "client_secret_post".to_string();
        config.clients.push(client);
        config.code_ttl_seconds = u64::MAX;
        config.token_ttl_seconds = u64::MAX;
        let p = AuthorizationServerProvider::new(config);

        let (code, verifier) = issue_code(&p, "s");
        let resp = p.exchange_code(token_request(&code, &verifier), None).unwrap();
        assert_eq!(p.token_status(&resp.access_token), Some(TokenStatus::Active));
        assert_eq!(p.introspect(&resp.access_token).exp, Some(u64::MAX));
    }

    #[test]
    fn test_code_is_single_use() {
        let p = provider();
        let (code, verifier) = issue_code(&p, "s");
        assert!(p.exchange_code(token_request(&code, &verifier), None).is_ok());
        let err = p
            .exchange_code(token_request(&code, &verifier), None)
            .unwrap_err();
        assert_eq!(err.error, "invalid_grant");
    }

    #[test]
    fn test_exchange_rejects_bad_verifier() {
        let p = provider();
        let (code, _) = issue_code(&p, "s");
        let other = pkce::generate().verifier;
        let err = p.exchange_code(token_request(&code, &other), None).unwrap_err();
        assert_eq!(err.error, "invalid_grant");
    }

    #[test]
    fn test_exchange_rejects_wrong_secret_with_401() {
        let p = provider();
        let (code, verifier) = issue_code(&p, "s");
        let mut req = token_request(&code, &verifier);
        req.client_secret = Some("wrong".to_string());
        let err = p.exchange_code(req, None).unwrap_err();
        assert_eq!(err.error, "invalid_client");
        assert_eq!(err.status(), 401);
    }

    #[test]
    fn test_exchange_accepts_basic_credentials() {
        let p = provider();
        let (code, verifier) = issue_code(&p, "s");
        let mut req = token_request(&code, &verifier);
        req.client_id = None;
        req.client_secret = None;
        let basic = Some(("test-client".to_string(), "s3cret".to_string()));
        assert!(p.exchange_code(req, basic).is_ok());
    }

    #[test]
    fn test_exchange_rejects_other_resource() {
        let p = provider();
        let (code, verifier) = issue_code(&p, "s");
        let mut req = token_request(&code, &verifier);
        req.resource = Some("http://other.example.com/mcp".to_string());
        assert_eq!(p.exchange_code(req, None).unwrap_err().error, "invalid_target");
    }

    #[test]
    fn test_unsupported_grant_type() {
        let p = provider();
        let mut req = token_request("x", "y");
        req.grant_type = Some("password".to_string());
        assert_eq!(
            p.exchange_code(req, None).unwrap_err().error,
            "unsupported_grant_type"
        );
    }

    #[test]
    fn test_deny_redirects_with_access_denied() {
        let p = provider();
        p.authorize(params("s", "c")).unwrap();
        let url = p.deny("s").unwrap();
        let q = query(&url);
        assert_eq!(q["error"], "access_denied");
        assert_eq!(q["state"], "s");
        assert!(p.grant_phase("s").is_none());
    }

    #[test]
    fn test_register_client_issues_credentials() {
        let p = provider();
        let client = p
            .register_client(ClientMetadata {
                client_name: Some("Simple Auth Client".to_string()),
                redirect_uris: vec![REDIRECT.to_string()],
                grant_types: vec!["authorization_code".to_string(), "refresh_token".to_string()],
                response_types: vec!["code".to_string()],
                token_endpoint_auth_method: Some("client_secret_post".to_string()),
                scope: None,
            })
            .unwrap();
        assert!(client.client_secret.is_some());
        assert!(p.client(&client.client_id).is_some());
    }

    #[test]
    fn test_register_client_requires_redirect_uris() {
        let p = provider();
        let err = p
            .register_client(ClientMetadata {
                client_name: None,
                redirect_uris: vec![],
                grant_types: vec![],
                response_types: vec![],
                token_endpoint_auth_method: None,
                scope: None,
            })
            .unwrap_err();
        assert_eq!(err.error, "invalid_redirect_uri");
    }

    #[test]
    fn test_issued_token_status() {
        let token = IssuedToken {
            client_id: "c".to_string(),
            scopes: vec![],
            resource: None,
            issued_at: 100,
            expires_at: 200,
            revoked: false,
        };
        assert_eq!(token.status(150), TokenStatus::Active);
        assert_eq!(token.status(200), TokenStatus::Expired);
    }

    #[test]
    fn test_append_query_relative_and_absolute() {
        assert_eq!(
            append_query("/login", &[("state", "a b")]).unwrap(),
            "/login?state=a+b"
        );
        assert_eq!(
            append_query("http://localhost:3030/callback?x=1", &[("code", "c")]).unwrap(),
            "http://localhost:3030/callback?x=1&code=c"
        );
    }
}
