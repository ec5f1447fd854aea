//! Operation surface for host applications.
//!
//! Every call resolves a pooled session through the registry. Discovery
//! and fetch results are memoized per fingerprint. Runtime faults become
//! response data; only configuration faults come back as `Err`.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use serde_json::{json, Map, Value};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::core::cache::{CacheStore, TtlCache};
use crate::core::config::{CacheSettings, Config, ServerDescriptor};
use crate::core::mcp_auth::McpTokenStore;
use crate::mcp::environment::CommandEnvironment;
use crate::mcp::error::McpError;
use crate::mcp::fingerprint::fingerprint;
use crate::mcp::registry::{ClientRegistry, DefaultTransportFactory};
use crate::mcp::types::{
    CallToolResponse, InstallInfo, PromptDescriptor, PromptResponse, ResourceDescriptor,
    ResourceResponse, RerunStatus, RerunUpdate, ToolDescriptor,
};

#[derive(Debug, Clone, PartialEq, Eq)]
struct PromptKey {
    fingerprint: String,
    name: String,
    arguments: Option<BTreeMap<String, String>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct ResourceKey {
    fingerprint: String,
    uri: String,
}

fn prompt_cache_key(key: &PromptKey) -> String {
    let arguments = key
        .arguments
        .as_ref()
        .and_then(|arguments| serde_json::to_string(arguments).ok())
        .unwrap_or_else(|| "no-args".to_string());
    format!("mcp:get_prompt:{}:{}:{}", key.fingerprint, key.name, arguments)
}

/// Rerun observer. `tool_call_id` limits delivery to one call's updates.
struct Listener {
    tool_call_id: Option<String>,
    sink: mpsc::UnboundedSender<RerunUpdate>,
}

type ListenerMap = Arc<Mutex<HashMap<u64, Listener>>>;

fn lock_listeners(listeners: &ListenerMap) -> MutexGuard<'_, HashMap<u64, Listener>> {
    listeners
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Unregisters a rerun listener when dropped.
struct ListenerGuard {
    listeners: ListenerMap,
    id: u64,
}

impl Drop for ListenerGuard {
    fn drop(&mut self) {
        lock_listeners(&self.listeners).remove(&self.id);
    }
}

pub struct McpService {
    registry: Arc<ClientRegistry>,
    environment: CommandEnvironment,
    store: Arc<CacheStore>,
    tools: TtlCache<String, Vec<ToolDescriptor>>,
    prompts: TtlCache<String, Vec<PromptDescriptor>>,
    resources: TtlCache<String, Vec<ResourceDescriptor>>,
    prompt: TtlCache<PromptKey, PromptResponse>,
    resource: TtlCache<ResourceKey, ResourceResponse>,
    listeners: ListenerMap,
    next_listener_id: AtomicU64,
}

impl McpService {
    /// Service over real transports, using `token_store` for OAuth grants.
    pub fn new(config: &Config, token_store: McpTokenStore) -> Result<Self, McpError> {
        let factory = DefaultTransportFactory::new(config, token_store)?;
        let environment = factory.environment().clone();
        let registry = ClientRegistry::new(Arc::new(factory), config);
        Ok(Self::with_registry(
            Arc::new(registry),
            environment,
            &config.cache,
        ))
    }

    pub fn with_registry(
        registry: Arc<ClientRegistry>,
        environment: CommandEnvironment,
        cache: &CacheSettings,
    ) -> Self {
        let store = Arc::new(CacheStore::new());
        Self {
            registry,
            environment,
            tools: TtlCache::new(
                Arc::clone(&store),
                cache.tools_ttl(),
                |fingerprint: &String| format!("mcp:list_tools:{fingerprint}"),
                "list_tools",
            ),
            prompts: TtlCache::new(
                Arc::clone(&store),
                cache.prompts_ttl(),
                |fingerprint: &String| format!("mcp:list_prompts:{fingerprint}"),
                "list_prompts",
            ),
            resources: TtlCache::new(
                Arc::clone(&store),
                cache.resources_ttl(),
                |fingerprint: &String| format!("mcp:list_resources:{fingerprint}"),
                "list_resources",
            ),
            prompt: TtlCache::new(
                Arc::clone(&store),
                cache.prompt_ttl(),
                prompt_cache_key,
                "get_prompt",
            ),
            resource: TtlCache::new(
                Arc::clone(&store),
                cache.resource_ttl(),
                |key: &ResourceKey| format!("mcp:get_resource:{}:{}", key.fingerprint, key.uri),
                "get_resource",
            ),
            store,
            listeners: Arc::new(Mutex::new(HashMap::new())),
            next_listener_id: AtomicU64::new(1),
        }
    }

    pub fn registry(&self) -> &ClientRegistry {
        &self.registry
    }

    pub fn cache(&self) -> &CacheStore {
        &self.store
    }

    pub async fn list_tools(
        &self,
        descriptor: &ServerDescriptor,
    ) -> Result<Vec<ToolDescriptor>, McpError> {
        let result = self
            .tools
            .get_or_compute(&fingerprint(descriptor), || async {
                let session = self.registry.acquire(descriptor).await?;
                let tools = session.list_tools().await?;
                Ok::<_, McpError>(
                    tools
                        .into_iter()
                        .map(|tool| ToolDescriptor::from_tool(descriptor, tool))
                        .collect(),
                )
            })
            .await;
        degrade_listing(descriptor, "tools", result)
    }

    pub async fn list_prompts(
        &self,
        descriptor: &ServerDescriptor,
    ) -> Result<Vec<PromptDescriptor>, McpError> {
        let result = self
            .prompts
            .get_or_compute(&fingerprint(descriptor), || async {
                let session = self.registry.acquire(descriptor).await?;
                let prompts = session.list_prompts().await?;
                Ok::<_, McpError>(
                    prompts
                        .into_iter()
                        .map(|prompt| PromptDescriptor::from_prompt(descriptor, prompt))
                        .collect(),
                )
            })
            .await;
        degrade_listing(descriptor, "prompts", result)
    }

    pub async fn list_resources(
        &self,
        descriptor: &ServerDescriptor,
    ) -> Result<Vec<ResourceDescriptor>, McpError> {
        let result = self
            .resources
            .get_or_compute(&fingerprint(descriptor), || async {
                let session = self.registry.acquire(descriptor).await?;
                let resources = session.list_resources().await?;
                Ok::<_, McpError>(
                    resources
                        .into_iter()
                        .map(|resource| ResourceDescriptor::from_resource(descriptor, resource))
                        .collect(),
                )
            })
            .await;
        degrade_listing(descriptor, "resources", result)
    }

    /// Drop the cached tool list and fetch a fresh one.
    pub async fn reset_tools_list(
        &self,
        descriptor: &ServerDescriptor,
    ) -> Result<Vec<ToolDescriptor>, McpError> {
        self.tools.reset(&fingerprint(descriptor));
        self.list_tools(descriptor).await
    }

    pub async fn call_tool(
        &self,
        descriptor: &ServerDescriptor,
        name: &str,
        arguments: Map<String, Value>,
    ) -> Result<CallToolResponse, McpError> {
        match self.invoke_tool(descriptor, name, arguments).await {
            Ok(response) => Ok(response),
            Err(err) if err.is_configuration() => Err(err),
            Err(err) => {
                error!(server_id = %descriptor.id, tool = %name, error = %err, "MCP tool call failed");
                Ok(CallToolResponse::error_text(format!(
                    "Error calling tool {name}: {err}"
                )))
            }
        }
    }

    async fn invoke_tool(
        &self,
        descriptor: &ServerDescriptor,
        name: &str,
        arguments: Map<String, Value>,
    ) -> Result<CallToolResponse, McpError> {
        let session = self.registry.acquire(descriptor).await?;
        debug!(server_id = %descriptor.id, tool = %name, "Calling MCP tool");
        let outcome = session.call_tool(name, arguments).await?;
        Ok(CallToolResponse {
            is_error: outcome.is_error.unwrap_or(false),
            content: outcome.content,
        })
    }

    pub async fn get_prompt(
        &self,
        descriptor: &ServerDescriptor,
        name: &str,
        arguments: Option<HashMap<String, String>>,
    ) -> Result<PromptResponse, McpError> {
        let key = PromptKey {
            fingerprint: fingerprint(descriptor),
            name: name.to_string(),
            arguments: arguments
                .as_ref()
                .map(|arguments| arguments.clone().into_iter().collect()),
        };
        let result = self
            .prompt
            .get_or_compute(&key, || async {
                let session = self.registry.acquire(descriptor).await?;
                let outcome = session.get_prompt(name, arguments.clone()).await?;
                Ok::<_, McpError>(PromptResponse {
                    description: outcome.description,
                    messages: outcome.messages,
                    is_error: false,
                })
            })
            .await;
        match result {
            Ok(response) => Ok(response),
            Err(err) if err.is_configuration() => Err(err),
            Err(err) => {
                error!(server_id = %descriptor.id, prompt = %name, error = %err, "Failed to get MCP prompt");
                Ok(PromptResponse::error_text(format!(
                    "Error getting prompt {name}: {err}"
                )))
            }
        }
    }

    pub async fn get_resource(
        &self,
        descriptor: &ServerDescriptor,
        uri: &str,
    ) -> Result<ResourceResponse, McpError> {
        let key = ResourceKey {
            fingerprint: fingerprint(descriptor),
            uri: uri.to_string(),
        };
        let result = self
            .resource
            .get_or_compute(&key, || async {
                let session = self.registry.acquire(descriptor).await?;
                let outcome = session.read_resource(uri).await?;
                Ok::<_, McpError>(ResourceResponse {
                    contents: outcome
                        .contents
                        .into_iter()
                        .map(|content| tag_with_server(content, descriptor))
                        .collect(),
                    is_error: false,
                })
            })
            .await;
        match result {
            Ok(response) => Ok(response),
            Err(err) if err.is_configuration() => Err(err),
            Err(err) => {
                error!(server_id = %descriptor.id, uri = %uri, error = %err, "Failed to read MCP resource");
                Ok(ResourceResponse::error_text(format!(
                    "Error reading resource {uri}: {err}"
                )))
            }
        }
    }

    /// Observe rerun progress for every tool call. The receiver stays
    /// registered until it is dropped.
    pub fn subscribe_reruns(&self) -> mpsc::UnboundedReceiver<RerunUpdate> {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.next_listener_id.fetch_add(1, Ordering::SeqCst);
        let listener = Listener {
            tool_call_id: None,
            sink: tx,
        };
        lock_listeners(&self.listeners).insert(id, listener);
        rx
    }

    pub fn active_rerun_listeners(&self) -> usize {
        lock_listeners(&self.listeners)
            .values()
            .filter(|listener| !listener.sink.is_closed())
            .count()
    }

    fn register_listener(
        &self,
        tool_call_id: &str,
        sink: mpsc::UnboundedSender<RerunUpdate>,
    ) -> ListenerGuard {
        let id = self.next_listener_id.fetch_add(1, Ordering::SeqCst);
        let listener = Listener {
            tool_call_id: Some(tool_call_id.to_string()),
            sink,
        };
        lock_listeners(&self.listeners).insert(id, listener);
        ListenerGuard {
            listeners: Arc::clone(&self.listeners),
            id,
        }
    }

    fn emit(&self, update: RerunUpdate) {
        let mut listeners = lock_listeners(&self.listeners);
        listeners.retain(|_, listener| {
            let wanted = listener
                .tool_call_id
                .as_deref()
                .is_none_or(|id| id == update.tool_call_id);
            !wanted || listener.sink.send(update.clone()).is_ok()
        });
    }

    /// Re-execute a previous tool call, reporting `rerunning` and then
    /// `done` or `error` to `sink` and to rerun subscribers.
    pub async fn rerun_tool(
        &self,
        message_id: &str,
        tool_call_id: &str,
        descriptor: &ServerDescriptor,
        name: &str,
        arguments: Map<String, Value>,
        sink: mpsc::UnboundedSender<RerunUpdate>,
    ) -> Result<CallToolResponse, McpError> {
        let _listener = self.register_listener(tool_call_id, sink);
        let update = |status, response: Option<CallToolResponse>, error: Option<String>| {
            RerunUpdate {
                message_id: message_id.to_string(),
                tool_call_id: tool_call_id.to_string(),
                status,
                args: Value::Object(arguments.clone()),
                response,
                error,
            }
        };

        info!(server_id = %descriptor.id, tool = %name, tool_call_id = %tool_call_id, "Rerunning MCP tool");
        self.emit(update(RerunStatus::Rerunning, None, None));
        match self.invoke_tool(descriptor, name, arguments.clone()).await {
            Ok(response) => {
                self.emit(update(RerunStatus::Done, Some(response.clone()), None));
                Ok(response)
            }
            Err(err) => {
                warn!(server_id = %descriptor.id, tool = %name, error = %err, "MCP tool rerun failed");
                let message = format!("Error rerunning tool {name}: {err}");
                self.emit(update(RerunStatus::Error, None, Some(message.clone())));
                if err.is_configuration() {
                    return Err(err);
                }
                Ok(CallToolResponse::error_text(message))
            }
        }
    }

    pub async fn stop_server(&self, descriptor: &ServerDescriptor) {
        self.registry.stop(descriptor).await;
    }

    pub async fn restart_server(&self, descriptor: &ServerDescriptor) -> Result<(), McpError> {
        match self.registry.restart(descriptor).await {
            Ok(_) => Ok(()),
            Err(err) if err.is_configuration() => Err(err),
            Err(err) => {
                error!(server_id = %descriptor.id, error = %err, "Failed to restart MCP server");
                Ok(())
            }
        }
    }

    /// Stop the server and forget everything cached for it.
    pub async fn remove_server(&self, descriptor: &ServerDescriptor) {
        self.stop_server(descriptor).await;
        let fingerprint = fingerprint(descriptor);
        let removed = self.store.remove_where(|key| key.contains(&fingerprint));
        debug!(server_id = %descriptor.id, removed, "Dropped cached MCP listings");
    }

    pub fn get_install_info(&self) -> InstallInfo {
        self.environment.install_info()
    }

    /// Close every session. Call once on process shutdown.
    pub async fn cleanup(&self) {
        self.registry.shutdown().await;
        self.store.clear();
    }
}

fn degrade_listing<T>(
    descriptor: &ServerDescriptor,
    what: &str,
    result: Result<Vec<T>, McpError>,
) -> Result<Vec<T>, McpError> {
    match result {
        Ok(items) => Ok(items),
        Err(err) if err.is_configuration() => Err(err),
        Err(err) => {
            error!(server_id = %descriptor.id, listing = %what, error = %err, "Failed to list MCP {what}");
            Ok(Vec::new())
        }
    }
}

fn tag_with_server(content: Value, descriptor: &ServerDescriptor) -> Value {
    match content {
        Value::Object(mut object) => {
            object.insert("serverId".to_string(), json!(descriptor.id));
            object.insert("serverName".to_string(), json!(descriptor.name));
            Value::Object(object)
        }
        other => other,
    }
}
