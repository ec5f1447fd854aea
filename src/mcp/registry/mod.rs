//! Pool of live sessions keyed by descriptor fingerprint.
//!
//! A short std mutex guards the slot map; each fingerprint has its own
//! async mutex held across ping, eviction and creation, so one fingerprint
//! never ends up with two live sessions while unrelated servers proceed in
//! parallel.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info, warn};

use crate::core::config::{Config, ServerDescriptor};
use crate::core::mcp_auth::McpTokenStore;
use crate::mcp::builtin::{builtin_name, spawn_builtin, BuiltinServerFactory, DefaultBuiltinFactory};
use crate::mcp::environment::CommandEnvironment;
use crate::mcp::error::McpError;
use crate::mcp::fingerprint::fingerprint;
use crate::mcp::oauth::{
    AuthorizationProvider, OAuthClientProvider, OAuthCoordinator, OAuthFlowState,
    SharedAuthorizationProvider,
};
use crate::mcp::session::Session;
use crate::mcp::transport::http::{build_mcp_http_client, require_http_base_url, HttpChannel};
use crate::mcp::transport::sse::SseTransport;
use crate::mcp::transport::stdio::StdioTransport;
use crate::mcp::transport::streamable_http::StreamableHttpTransport;
use crate::mcp::transport::{McpTransport, McpTransportKind};

/// Builds transports for descriptors.
#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn create(
        &self,
        descriptor: &ServerDescriptor,
        auth: Option<SharedAuthorizationProvider>,
    ) -> Result<Arc<dyn McpTransport>, McpError>;

    /// Provider used for the OAuth handshake and bearer headers. `None`
    /// means a 401 from this server is final.
    fn authorization_provider(
        &self,
        _descriptor: &ServerDescriptor,
    ) -> Option<SharedAuthorizationProvider> {
        None
    }
}

/// Transport factory for real servers.
pub struct DefaultTransportFactory {
    environment: CommandEnvironment,
    builtins: Arc<dyn BuiltinServerFactory>,
    token_store: McpTokenStore,
    http_client: reqwest::Client,
    default_timeout: Duration,
    providers: Mutex<HashMap<String, SharedAuthorizationProvider>>,
}

impl DefaultTransportFactory {
    pub fn new(config: &Config, token_store: McpTokenStore) -> Result<Self, McpError> {
        Ok(Self {
            environment: CommandEnvironment::new(config.bin_dir()),
            builtins: Arc::new(DefaultBuiltinFactory),
            token_store,
            http_client: build_mcp_http_client()?,
            default_timeout: config.request_timeout(),
            providers: Mutex::new(HashMap::new()),
        })
    }

    pub fn with_builtins(mut self, builtins: Arc<dyn BuiltinServerFactory>) -> Self {
        self.builtins = builtins;
        self
    }

    pub fn environment(&self) -> &CommandEnvironment {
        &self.environment
    }

    fn endpoint_timeout(&self, descriptor: &ServerDescriptor) -> Duration {
        descriptor
            .timeout_seconds
            .map(Duration::from_secs)
            .unwrap_or(self.default_timeout)
    }
}

#[async_trait]
impl TransportFactory for DefaultTransportFactory {
    async fn create(
        &self,
        descriptor: &ServerDescriptor,
        auth: Option<SharedAuthorizationProvider>,
    ) -> Result<Arc<dyn McpTransport>, McpError> {
        let channel = || {
            HttpChannel::new(
                self.http_client.clone(),
                descriptor.headers.clone().unwrap_or_default(),
                auth.clone(),
            )
        };
        let transport: Arc<dyn McpTransport> = match McpTransportKind::from_descriptor(descriptor)? {
            McpTransportKind::Stdio => {
                let command = self.environment.resolve(descriptor).await?;
                Arc::new(StdioTransport::new(descriptor.label(), command))
            }
            McpTransportKind::Sse => Arc::new(SseTransport::new(
                descriptor.id.clone(),
                require_http_base_url(descriptor)?,
                channel(),
                self.endpoint_timeout(descriptor),
            )),
            McpTransportKind::StreamableHttp => Arc::new(StreamableHttpTransport::new(
                descriptor.id.clone(),
                require_http_base_url(descriptor)?,
                channel(),
            )),
            McpTransportKind::InProcess => {
                let server = self.builtins.create(
                    builtin_name(descriptor),
                    descriptor.args(),
                    &descriptor.env.clone().unwrap_or_default(),
                )?;
                Arc::new(spawn_builtin(server))
            }
        };
        Ok(transport)
    }

    fn authorization_provider(
        &self,
        descriptor: &ServerDescriptor,
    ) -> Option<SharedAuthorizationProvider> {
        let kind = McpTransportKind::from_descriptor(descriptor).ok()?;
        if !matches!(kind, McpTransportKind::Sse | McpTransportKind::StreamableHttp) {
            return None;
        }
        let base_url = descriptor.base_url.as_deref()?.trim().to_string();
        let mut providers = self.providers.lock().ok()?;
        let key = format!("{}|{}", descriptor.id, base_url);
        let provider = providers.entry(key).or_insert_with(|| {
            Arc::new(OAuthClientProvider::new(
                descriptor.id.clone(),
                base_url,
                self.token_store.clone(),
            )) as SharedAuthorizationProvider
        });
        Some(Arc::clone(provider))
    }
}

type Slot = Arc<AsyncMutex<Option<Arc<Session>>>>;

pub struct ClientRegistry {
    factory: Arc<dyn TransportFactory>,
    slots: Mutex<HashMap<String, Slot>>,
    health_check_timeout: Duration,
    request_timeout: Duration,
    oauth: OAuthCoordinator,
    oauth_gate: AsyncMutex<()>,
}

impl ClientRegistry {
    pub fn new(factory: Arc<dyn TransportFactory>, config: &Config) -> Self {
        Self::with_settings(
            factory,
            config.health_check_timeout(),
            config.request_timeout(),
            OAuthCoordinator::from_settings(&config.oauth),
        )
    }

    pub fn with_settings(
        factory: Arc<dyn TransportFactory>,
        health_check_timeout: Duration,
        request_timeout: Duration,
        oauth: OAuthCoordinator,
    ) -> Self {
        Self {
            factory,
            slots: Mutex::new(HashMap::new()),
            health_check_timeout,
            request_timeout,
            oauth,
            oauth_gate: AsyncMutex::new(()),
        }
    }

    pub fn oauth_state(&self) -> OAuthFlowState {
        self.oauth.state()
    }

    fn slots(&self) -> MutexGuard<'_, HashMap<String, Slot>> {
        self.slots
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn slot(&self, fingerprint: &str) -> Slot {
        Arc::clone(self.slots().entry(fingerprint.to_string()).or_default())
    }

    fn existing_slot(&self, fingerprint: &str) -> Option<Slot> {
        self.slots().get(fingerprint).cloned()
    }

    /// Forget `slot` when it is empty and nobody else holds it. `slot` is the
    /// caller's own handle, so an unshared slot has exactly two owners.
    fn release_slot(&self, fingerprint: &str, slot: &Slot) {
        let mut slots = self.slots();
        let idle = slots
            .get(fingerprint)
            .is_some_and(|pooled| Arc::ptr_eq(pooled, slot))
            && Arc::strong_count(slot) == 2
            && slot.try_lock().is_ok_and(|guard| guard.is_none());
        if idle {
            slots.remove(fingerprint);
        }
    }

    /// Return the live session for `descriptor`, health checking a pooled
    /// one and creating a fresh one when it is missing or unhealthy.
    pub async fn acquire(&self, descriptor: &ServerDescriptor) -> Result<Arc<Session>, McpError> {
        let fingerprint = fingerprint(descriptor);
        let slot = self.slot(&fingerprint);
        let mut guard = slot.lock().await;

        if let Some(session) = guard.as_ref().cloned() {
            match session.ping(self.health_check_timeout).await {
                Ok(()) => return Ok(session),
                Err(err) => {
                    warn!(
                        server_id = %descriptor.id,
                        error = %err,
                        "MCP session failed health check; reconnecting"
                    );
                    *guard = None;
                    if let Err(err) = session.close().await {
                        debug!(server_id = %descriptor.id, error = %err, "Failed to close stale MCP session");
                    }
                }
            }
        }

        let session = match self.create_session(&fingerprint, descriptor).await {
            Ok(session) => Arc::new(session),
            Err(err) => {
                drop(guard);
                self.release_slot(&fingerprint, &slot);
                return Err(err);
            }
        };
        info!(server_id = %descriptor.id, fingerprint = %fingerprint, "MCP session established");
        *guard = Some(Arc::clone(&session));
        Ok(session)
    }

    async fn create_session(
        &self,
        fingerprint: &str,
        descriptor: &ServerDescriptor,
    ) -> Result<Session, McpError> {
        let provider = self.factory.authorization_provider(descriptor);
        match self.connect(fingerprint, descriptor, provider.clone()).await {
            Err(err) if err.is_unauthorized() => {
                let Some(provider) = provider else {
                    return Err(err);
                };
                info!(server_id = %descriptor.id, "MCP server requires authorization");
                {
                    let _gate = self.oauth_gate.lock().await;
                    self.oauth
                        .authorize(descriptor.label(), provider.as_ref())
                        .await?;
                }
                self.connect(fingerprint, descriptor, Some(provider)).await
            }
            other => other,
        }
    }

    async fn connect(
        &self,
        fingerprint: &str,
        descriptor: &ServerDescriptor,
        auth: Option<Arc<dyn AuthorizationProvider>>,
    ) -> Result<Session, McpError> {
        let transport = self.factory.create(descriptor, auth).await?;
        let request_timeout = descriptor
            .timeout_seconds
            .map(Duration::from_secs)
            .unwrap_or(self.request_timeout);
        Session::connect(fingerprint, descriptor, transport, request_timeout).await
    }

    /// Close and forget the session for `descriptor`. Close failures are
    /// logged, never returned.
    pub async fn stop(&self, descriptor: &ServerDescriptor) {
        let fingerprint = fingerprint(descriptor);
        let Some(slot) = self.existing_slot(&fingerprint) else {
            return;
        };
        let session = slot.lock().await.take();
        self.release_slot(&fingerprint, &slot);
        if let Some(session) = session {
            match session.close().await {
                Ok(()) => info!(server_id = %descriptor.id, "Stopped MCP session"),
                Err(err) => {
                    warn!(server_id = %descriptor.id, error = %err, "Failed to close MCP session")
                }
            }
        }
    }

    pub async fn restart(&self, descriptor: &ServerDescriptor) -> Result<Arc<Session>, McpError> {
        self.stop(descriptor).await;
        self.acquire(descriptor).await
    }

    /// True when a session is pooled for `descriptor`. Does not ping.
    pub async fn is_live(&self, descriptor: &ServerDescriptor) -> bool {
        let Some(slot) = self.existing_slot(&fingerprint(descriptor)) else {
            return false;
        };
        let guard = slot.lock().await;
        guard.as_ref().is_some_and(|session| !session.is_closed())
    }

    /// Close every pooled session.
    pub async fn shutdown(&self) {
        let slots: Vec<Slot> = self.slots().values().cloned().collect();
        for slot in slots {
            let session = slot.lock().await.take();
            let Some(session) = session else {
                continue;
            };
            if let Err(err) = session.close().await {
                warn!(server_id = %session.server_id(), error = %err, "Failed to close MCP session during shutdown");
            }
        }
        debug!("MCP registry shut down");
    }
}
