//! Scripted MCP servers for unit tests.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rust_mcp_schema::LATEST_PROTOCOL_VERSION;
use serde_json::{json, Map, Value};

use crate::core::config::ServerDescriptor;
use crate::mcp::error::McpError;
use crate::mcp::fingerprint::fingerprint;
use crate::mcp::oauth::SharedAuthorizationProvider;
use crate::mcp::registry::TransportFactory;
use crate::mcp::session::Session;
use crate::mcp::transport::in_process::{linked_pair, InProcessTransport};
use crate::mcp::transport::{McpTransport, McpTransportKind};

/// In-process server answering from a fixed script.
///
/// Tools: `echo` returns its `text` argument, `fail` returns an error
/// result, `explode` answers with a JSON-RPC error. Prompt `greet` and
/// `memo://{n}` resources are available unless disabled.
pub(crate) struct ScriptedServer {
    name: String,
    resource_count: usize,
    prompts: bool,
    stall_pings: AtomicBool,
    calls: Mutex<HashMap<String, usize>>,
}

impl ScriptedServer {
    pub(crate) fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            resource_count: 1,
            prompts: true,
            stall_pings: AtomicBool::new(false),
            calls: Mutex::new(HashMap::new()),
        }
    }

    /// Serve `count` resources, one per `resources/list` page.
    pub(crate) fn with_paged_resources(mut self, count: usize) -> Self {
        self.resource_count = count;
        self
    }

    pub(crate) fn without_prompts(mut self) -> Self {
        self.prompts = false;
        self
    }

    /// Leave `ping` requests unanswered while set.
    pub(crate) fn stall_pings(&self, stall: bool) {
        self.stall_pings.store(stall, Ordering::SeqCst);
    }

    pub(crate) fn calls(&self, method: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .get(method)
            .copied()
            .unwrap_or_default()
    }

    pub(crate) fn spawn(self: &Arc<Self>) -> InProcessTransport {
        let (transport, mut endpoint) = linked_pair();
        let server = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(message) = endpoint.recv().await {
                let Some(method) = message.get("method").and_then(Value::as_str) else {
                    continue;
                };
                *server
                    .calls
                    .lock()
                    .unwrap()
                    .entry(method.to_string())
                    .or_default() += 1;
                let Some(id) = message.get("id").cloned() else {
                    continue;
                };
                let params = message.get("params").cloned().unwrap_or(Value::Null);
                let reply = match server.answer(method, &params) {
                    Some(Ok(result)) => json!({ "jsonrpc": "2.0", "id": id, "result": result }),
                    Some(Err((code, text))) => json!({
                        "jsonrpc": "2.0",
                        "id": id,
                        "error": { "code": code, "message": text }
                    }),
                    None => continue,
                };
                if endpoint.send(reply).is_err() {
                    break;
                }
            }
        });
        transport
    }

    fn answer(&self, method: &str, params: &Value) -> Option<Result<Value, (i64, String)>> {
        let not_found = || Err((-32601, format!("Method not found: {method}")));
        let reply = match method {
            "initialize" => Ok(json!({
                "protocolVersion": LATEST_PROTOCOL_VERSION,
                "capabilities": { "tools": {}, "prompts": {}, "resources": {} },
                "serverInfo": { "name": self.name, "version": "0.1.0" }
            })),
            "ping" if self.stall_pings.load(Ordering::SeqCst) => return None,
            "ping" => Ok(json!({})),
            "tools/list" => Ok(json!({
                "tools": [
                    {
                        "name": "echo",
                        "description": "Echo the text argument",
                        "inputSchema": {
                            "type": "object",
                            "required": ["text"],
                            "properties": { "text": { "type": "string" } }
                        }
                    },
                    {
                        "name": "fail",
                        "description": "Always fails",
                        "inputSchema": { "type": "object", "required": [], "properties": {} }
                    }
                ]
            })),
            "tools/call" => {
                let name = params.get("name").and_then(Value::as_str).unwrap_or_default();
                match name {
                    "echo" => {
                        let text = params
                            .pointer("/arguments/text")
                            .and_then(Value::as_str)
                            .unwrap_or_default();
                        Ok(json!({ "content": [{ "type": "text", "text": text }] }))
                    }
                    "fail" => Ok(json!({
                        "content": [{ "type": "text", "text": "boom" }],
                        "isError": true
                    })),
                    "explode" => Err((-32603, "exploded".to_string())),
                    other => Err((-32602, format!("Unknown tool: {other}"))),
                }
            }
            "prompts/list" if self.prompts => Ok(json!({
                "prompts": [{
                    "name": "greet",
                    "description": "Say hello",
                    "arguments": [{ "name": "name", "required": false }]
                }]
            })),
            "prompts/get" if self.prompts => {
                let who = params
                    .pointer("/arguments/name")
                    .and_then(Value::as_str)
                    .unwrap_or("friend");
                Ok(json!({
                    "description": "Greeting",
                    "messages": [{
                        "role": "user",
                        "content": { "type": "text", "text": format!("Hello, {who}!") }
                    }]
                }))
            }
            "resources/list" => {
                let index = params
                    .get("cursor")
                    .and_then(Value::as_str)
                    .and_then(|cursor| cursor.parse::<usize>().ok())
                    .unwrap_or(0);
                let mut page = json!({
                    "resources": [{
                        "uri": format!("memo://{index}"),
                        "name": format!("memo {index}")
                    }]
                });
                if self.resource_count == 0 {
                    page = json!({ "resources": [] });
                } else if index + 1 < self.resource_count {
                    page["nextCursor"] = json!((index + 1).to_string());
                }
                Ok(page)
            }
            "resources/read" => {
                let uri = params.get("uri").and_then(Value::as_str).unwrap_or_default();
                Ok(json!({
                    "contents": [{ "uri": uri, "mimeType": "text/plain", "text": format!("contents of {uri}") }]
                }))
            }
            _ => not_found(),
        };
        Some(reply)
    }
}

pub(crate) fn scripted_descriptor(id: &str) -> ServerDescriptor {
    ServerDescriptor {
        id: id.to_string(),
        name: id.to_string(),
        kind: Some("in-process".to_string()),
        command: Some(id.to_string()),
        ..Default::default()
    }
}

pub(crate) async fn connect_scripted(server: &Arc<ScriptedServer>, id: &str) -> Session {
    let descriptor = scripted_descriptor(id);
    let transport: Arc<dyn McpTransport> = Arc::new(server.spawn());
    Session::connect(
        fingerprint(&descriptor),
        &descriptor,
        transport,
        Duration::from_secs(5),
    )
    .await
    .expect("scripted session connects")
}

/// Transport factory serving [`ScriptedServer`]s keyed by descriptor id.
#[derive(Default)]
pub(crate) struct ScriptedFactory {
    servers: Mutex<HashMap<String, Arc<ScriptedServer>>>,
    created: Mutex<HashMap<String, usize>>,
    refused: Mutex<HashSet<String>>,
    unauthorized: AtomicUsize,
    provider: Option<SharedAuthorizationProvider>,
    create_delay: Option<Duration>,
}

impl ScriptedFactory {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn with_server(self, id: &str, server: ScriptedServer) -> Self {
        self.servers
            .lock()
            .unwrap()
            .insert(id.to_string(), Arc::new(server));
        self
    }

    pub(crate) fn with_provider(mut self, provider: SharedAuthorizationProvider) -> Self {
        self.provider = Some(provider);
        self
    }

    pub(crate) fn with_create_delay(mut self, delay: Duration) -> Self {
        self.create_delay = Some(delay);
        self
    }

    /// Answer the next `times` creations with [`McpError::Unauthorized`].
    pub(crate) fn require_authorization(&self, times: usize) {
        self.unauthorized.store(times, Ordering::SeqCst);
    }

    /// Fail every creation for `id` with a connection error.
    pub(crate) fn refuse(&self, id: &str) {
        self.refused.lock().unwrap().insert(id.to_string());
    }

    pub(crate) fn server(&self, id: &str) -> Arc<ScriptedServer> {
        Arc::clone(
            self.servers
                .lock()
                .unwrap()
                .entry(id.to_string())
                .or_insert_with(|| Arc::new(ScriptedServer::new(id))),
        )
    }

    pub(crate) fn created(&self, id: &str) -> usize {
        self.created
            .lock()
            .unwrap()
            .get(id)
            .copied()
            .unwrap_or_default()
    }
}

#[async_trait]
impl TransportFactory for ScriptedFactory {
    async fn create(
        &self,
        descriptor: &ServerDescriptor,
        _auth: Option<SharedAuthorizationProvider>,
    ) -> Result<Arc<dyn McpTransport>, McpError> {
        McpTransportKind::from_descriptor(descriptor)?;
        *self
            .created
            .lock()
            .unwrap()
            .entry(descriptor.id.clone())
            .or_default() += 1;
        if let Some(delay) = self.create_delay {
            tokio::time::sleep(delay).await;
        }
        if self.refused.lock().unwrap().contains(&descriptor.id) {
            return Err(McpError::Connection(format!(
                "{} refused the connection",
                descriptor.id
            )));
        }
        let remaining = self.unauthorized.load(Ordering::SeqCst);
        if remaining > 0 {
            self.unauthorized.store(remaining - 1, Ordering::SeqCst);
            return Err(McpError::Unauthorized("401 Unauthorized".to_string()));
        }
        Ok(Arc::new(self.server(&descriptor.id).spawn()))
    }

    fn authorization_provider(
        &self,
        _descriptor: &ServerDescriptor,
    ) -> Option<SharedAuthorizationProvider> {
        self.provider.clone()
    }
}

/// Arguments map from `key = value` pairs.
pub(crate) fn arguments(pairs: &[(&str, Value)]) -> Map<String, Value> {
    pairs
        .iter()
        .map(|(key, value)| (key.to_string(), value.clone()))
        .collect()
}
