//! Out-of-band OAuth authorization for MCP servers that answer 401.
//!
//! [`OAuthCoordinator`] owns the loopback callback listener and the
//! deadline; everything provider specific (metadata discovery, client
//! registration, token exchange, storage) sits behind
//! [`AuthorizationProvider`].

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::core::builtin_oauth::OAuthCallbackVariant;
use crate::core::config::OAuthSettings;
use crate::core::mcp_auth::{McpOAuthGrant, McpTokenStore};
use crate::core::oauth::{
    authorization_url, fresh_access_token, open_in_browser, random_token, unix_now,
    write_callback_page, write_not_found, AuthServerMetadata, AuthorizeQuery, CallbackQuery,
    OAuthError, OAuthHttp, Pkce,
};
use crate::mcp::error::McpError;

const CALLBACK_READ_BUFFER_BYTES: usize = 16 * 1024;

/// URL the user must visit, plus the `state` the callback has to echo.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthorizationRequest {
    pub url: String,
    pub state: String,
}

#[async_trait]
pub trait AuthorizationProvider: Send + Sync {
    /// Value for the `Authorization` header, if a token is available.
    async fn authorization_header(&self) -> Option<String>;

    async fn start_authorization(&self, redirect_uri: &str)
        -> Result<AuthorizationRequest, McpError>;

    async fn finish_authorization(&self, code: &str) -> Result<(), McpError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OAuthFlowState {
    Idle,
    AwaitingCallback { deadline: Instant },
    Authenticated,
    Failed(String),
    TimedOut,
}

/// Runs one authorization-code handshake at a time on a loopback listener.
pub struct OAuthCoordinator {
    callback_port: u16,
    callback_path: String,
    timeout: Duration,
    state: Mutex<OAuthFlowState>,
}

impl OAuthCoordinator {
    pub fn new(callback_port: u16, callback_path: impl Into<String>, timeout: Duration) -> Self {
        Self {
            callback_port,
            callback_path: callback_path.into(),
            timeout,
            state: Mutex::new(OAuthFlowState::Idle),
        }
    }

    pub fn from_settings(settings: &OAuthSettings) -> Self {
        Self::new(
            settings.callback_port(),
            settings.callback_path(),
            settings.timeout(),
        )
    }

    pub fn state(&self) -> OAuthFlowState {
        self.state
            .lock()
            .map(|guard| guard.clone())
            .unwrap_or(OAuthFlowState::Idle)
    }

    fn set_state(&self, next: OAuthFlowState) {
        if let Ok(mut guard) = self.state.lock() {
            *guard = next;
        }
    }

    /// Drive the handshake to completion. The callback listener is closed
    /// before this returns, whatever the outcome.
    pub async fn authorize(
        &self,
        server_label: &str,
        provider: &dyn AuthorizationProvider,
    ) -> Result<(), McpError> {
        let result = self.run(server_label, provider).await;
        match &result {
            Ok(()) => {
                info!(server = %server_label, "MCP OAuth authorization complete");
                self.set_state(OAuthFlowState::Authenticated);
            }
            Err(McpError::OAuthTimeout { .. }) => {
                warn!(server = %server_label, "MCP OAuth authorization timed out");
                self.set_state(OAuthFlowState::TimedOut);
            }
            Err(err) => {
                warn!(server = %server_label, error = %err, "MCP OAuth authorization failed");
                self.set_state(OAuthFlowState::Failed(err.to_string()));
            }
        }
        result
    }

    async fn run(
        &self,
        server_label: &str,
        provider: &dyn AuthorizationProvider,
    ) -> Result<(), McpError> {
        let listener = TcpListener::bind(("127.0.0.1", self.callback_port))
            .await
            .map_err(|err| {
                McpError::OAuthFailure(format!(
                    "Unable to bind OAuth callback listener on port {}: {err}",
                    self.callback_port
                ))
            })?;
        let port = listener
            .local_addr()
            .map_err(|err| McpError::OAuthFailure(err.to_string()))?
            .port();
        let redirect_uri = format!("http://127.0.0.1:{port}{}", self.callback_path);

        let request = provider
            .start_authorization(&redirect_uri)
            .await
            .map_err(into_oauth_failure)?;

        let (code_tx, code_rx) = oneshot::channel();
        let guard = CallbackListener::spawn(
            listener,
            self.callback_path.clone(),
            request.state.clone(),
            code_tx,
        );
        let deadline = Instant::now() + self.timeout;
        self.set_state(OAuthFlowState::AwaitingCallback { deadline });
        info!(
            server = %server_label,
            redirect_uri = %redirect_uri,
            "Waiting for MCP OAuth callback"
        );

        let outcome = tokio::time::timeout_at(deadline, code_rx).await;
        guard.close().await;

        let code = match outcome {
            Err(_) => {
                return Err(McpError::OAuthTimeout {
                    server: server_label.to_string(),
                    timeout: self.timeout,
                })
            }
            Ok(Err(_)) => {
                return Err(McpError::OAuthFailure(
                    "OAuth callback listener stopped unexpectedly.".to_string(),
                ))
            }
            Ok(Ok(Err(message))) => return Err(McpError::OAuthFailure(message)),
            Ok(Ok(Ok(code))) => code,
        };

        provider
            .finish_authorization(&code)
            .await
            .map_err(into_oauth_failure)
    }
}

fn into_oauth_failure(err: McpError) -> McpError {
    match err {
        McpError::OAuthFailure(_) | McpError::OAuthTimeout { .. } => err,
        other => McpError::OAuthFailure(other.to_string()),
    }
}

/// Accept loop for the redirect URI. Dropping or closing it releases the
/// port.
struct CallbackListener {
    handle: Option<JoinHandle<()>>,
}

impl CallbackListener {
    fn spawn(
        listener: TcpListener,
        callback_path: String,
        expected_state: String,
        code_tx: oneshot::Sender<Result<String, String>>,
    ) -> Self {
        let handle = tokio::spawn(serve_callbacks(
            listener,
            callback_path,
            expected_state,
            code_tx,
        ));
        Self {
            handle: Some(handle),
        }
    }

    async fn close(mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
            let _ = handle.await;
        }
    }
}

impl Drop for CallbackListener {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

async fn serve_callbacks(
    listener: TcpListener,
    callback_path: String,
    expected_state: String,
    code_tx: oneshot::Sender<Result<String, String>>,
) {
    loop {
        let mut stream = match listener.accept().await {
            Ok((stream, _)) => stream,
            Err(err) => {
                debug!(error = %err, "OAuth callback accept failed");
                continue;
            }
        };
        let params = match read_callback(&mut stream).await {
            Some(params) if params.path == callback_path => params,
            _ => {
                let _ = write_not_found(&mut stream).await;
                continue;
            }
        };

        let outcome = callback_outcome(&params, &expected_state);
        let written = match &outcome {
            Ok(_) => {
                write_callback_page(
                    &mut stream,
                    OAuthCallbackVariant::Success,
                    "You're authorized",
                    "Close this tab and return to toolrelay.",
                )
                .await
            }
            Err(message) => {
                write_callback_page(
                    &mut stream,
                    OAuthCallbackVariant::Error,
                    "OAuth authorization failed",
                    message,
                )
                .await
            }
        };
        if let Err(err) = written {
            debug!(error = %err, "Failed to write OAuth callback page");
        }
        let _ = code_tx.send(outcome);
        return;
    }
}

async fn read_callback(stream: &mut TcpStream) -> Option<CallbackQuery> {
    let mut buffer = vec![0_u8; CALLBACK_READ_BUFFER_BYTES];
    let bytes_read = stream.read(&mut buffer).await.ok()?;
    if bytes_read == 0 {
        return None;
    }
    let request = String::from_utf8_lossy(&buffer[..bytes_read]);
    CallbackQuery::from_request(&request)
}

/// Decide what a request on the callback path means for the flow.
fn callback_outcome(params: &CallbackQuery, expected_state: &str) -> Result<String, String> {
    if let Some(error) = &params.error {
        let detail = params.error_description.as_deref().unwrap_or_default();
        return Err(format!("OAuth callback error: {error} {detail}")
            .trim_end()
            .to_string());
    }
    if params.state.as_deref() != Some(expected_state) {
        return Err("OAuth callback state mismatch".to_string());
    }
    params
        .code
        .clone()
        .filter(|code| !code.trim().is_empty())
        .ok_or_else(|| "OAuth callback missing authorization code".to_string())
}

struct PendingAuthorization {
    pkce: Pkce,
    redirect_uri: String,
    client_id: Option<String>,
    metadata: AuthServerMetadata,
}

fn oauth_failure(context: &str) -> impl FnOnce(OAuthError) -> McpError + '_ {
    move |err| McpError::OAuthFailure(format!("{context}: {err}"))
}

/// OAuth 2.1 authorization-code provider with PKCE, metadata discovery,
/// dynamic client registration and refresh, backed by [`McpTokenStore`].
pub struct OAuthClientProvider {
    server_id: String,
    base_url: String,
    token_store: McpTokenStore,
    http: OAuthHttp,
    pending: Mutex<Option<PendingAuthorization>>,
}

impl OAuthClientProvider {
    pub fn new(
        server_id: impl Into<String>,
        base_url: impl Into<String>,
        token_store: McpTokenStore,
    ) -> Self {
        Self {
            server_id: server_id.into(),
            base_url: base_url.into(),
            token_store,
            http: OAuthHttp::new(),
            pending: Mutex::new(None),
        }
    }

    /// Reuse the client id registered for this redirect URI, or register a
    /// new one when the server supports it.
    async fn client_id_for(
        &self,
        metadata: &AuthServerMetadata,
        redirect_uri: &str,
    ) -> Result<Option<String>, McpError> {
        let registered = self
            .token_store
            .grant(&self.server_id)
            .ok()
            .flatten()
            .filter(|grant| grant.redirect_uri.as_deref() == Some(redirect_uri))
            .and_then(|grant| grant.client_id);
        if registered.is_some() {
            return Ok(registered);
        }
        let Some(endpoint) = metadata.registration_endpoint.as_deref() else {
            return Ok(None);
        };
        debug!(server_id = %self.server_id, "Registering MCP OAuth client");
        self.http
            .register_client(endpoint, redirect_uri)
            .await
            .map(Some)
            .map_err(oauth_failure("Client registration failed"))
    }

    fn take_pending(&self) -> Option<PendingAuthorization> {
        self.pending
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
    }
}

#[async_trait]
impl AuthorizationProvider for OAuthClientProvider {
    async fn authorization_header(&self) -> Option<String> {
        let refreshed = fresh_access_token(&self.http, &self.token_store, &self.server_id).await;
        let token = match refreshed {
            Ok(Some(token)) => Some(token),
            Ok(None) => None,
            Err(err) => {
                warn!(server_id = %self.server_id, error = %err, "MCP OAuth refresh failed");
                None
            }
        };
        token
            .or_else(|| self.token_store.access_token(&self.server_id).ok().flatten())
            .filter(|token| !token.trim().is_empty())
            .map(|token| format!("Bearer {token}"))
    }

    async fn start_authorization(
        &self,
        redirect_uri: &str,
    ) -> Result<AuthorizationRequest, McpError> {
        let metadata = self
            .http
            .discover(&self.base_url)
            .await
            .map_err(oauth_failure("OAuth discovery failed"))?
            .ok_or_else(|| {
                McpError::OAuthFailure(format!(
                    "{} does not advertise OAuth metadata.",
                    self.base_url
                ))
            })?;
        let endpoint = metadata.authorization_endpoint.as_deref().ok_or_else(|| {
            McpError::OAuthFailure("OAuth metadata has no authorization endpoint.".to_string())
        })?;
        let client_id = self.client_id_for(&metadata, redirect_uri).await?;

        let pkce = Pkce::generate().map_err(oauth_failure("PKCE setup failed"))?;
        let state = random_token(24).map_err(oauth_failure("PKCE setup failed"))?;
        let scope = metadata.requested_scope();
        let url = authorization_url(
            endpoint,
            AuthorizeQuery {
                client_id: client_id.as_deref(),
                redirect_uri,
                state: &state,
                code_challenge: &pkce.challenge,
                scope: scope.as_deref(),
                resource: metadata.issuer.as_deref(),
            },
        )
        .map_err(oauth_failure("Invalid authorization endpoint"))?
        .to_string();

        let browser_url = url.clone();
        match tokio::task::spawn_blocking(move || open_in_browser(&browser_url)).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => warn!(server_id = %self.server_id, error = %err, "Unable to open browser"),
            Err(err) => warn!(server_id = %self.server_id, error = %err, "Browser launcher task failed"),
        }
        info!(server_id = %self.server_id, url = %url, "Open this URL to authorize");

        *self
            .pending
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(PendingAuthorization {
            pkce,
            redirect_uri: redirect_uri.to_string(),
            client_id,
            metadata,
        });
        Ok(AuthorizationRequest { url, state })
    }

    async fn finish_authorization(&self, code: &str) -> Result<(), McpError> {
        let pending = self.take_pending().ok_or_else(|| {
            McpError::OAuthFailure("No OAuth authorization in progress.".to_string())
        })?;
        let PendingAuthorization {
            pkce,
            redirect_uri,
            client_id,
            metadata,
        } = pending;
        let token_endpoint = metadata.token_endpoint.ok_or_else(|| {
            McpError::OAuthFailure("OAuth metadata has no token endpoint.".to_string())
        })?;

        let token = self
            .http
            .exchange_code(
                &token_endpoint,
                client_id.as_deref(),
                &redirect_uri,
                code,
                &pkce.verifier,
            )
            .await
            .map_err(oauth_failure("Token exchange failed"))?;

        let grant = token.merge_into(
            &McpOAuthGrant {
                client_id,
                redirect_uri: Some(redirect_uri),
                authorization_endpoint: metadata.authorization_endpoint,
                token_endpoint: Some(token_endpoint),
                revocation_endpoint: metadata.revocation_endpoint,
                issuer: metadata.issuer,
                ..Default::default()
            },
            unix_now(),
        );
        let persist = |err: crate::core::mcp_auth::TokenStoreError| {
            McpError::OAuthFailure(format!("Unable to store OAuth grant: {err}"))
        };
        self.token_store
            .store_grant(&self.server_id, &grant)
            .map_err(persist)?;
        self.token_store
            .store_access_token(&self.server_id, &grant.access_token)
            .map_err(persist)?;
        Ok(())
    }
}

/// Shared handle used by transports and the coordinator.
pub type SharedAuthorizationProvider = Arc<dyn AuthorizationProvider>;
