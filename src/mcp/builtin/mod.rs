//! Built-in MCP servers that run on an in-process channel.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use rust_mcp_schema::LATEST_PROTOCOL_VERSION;
use serde_json::{json, Map, Value};
use tracing::{debug, info};

use crate::core::config::ServerDescriptor;
use crate::mcp::error::McpError;
use crate::mcp::protocol::MCP_METHOD_NOT_FOUND;
use crate::mcp::transport::in_process::{linked_pair, InProcessEndpoint, InProcessTransport};

pub mod timetools;

pub const JSONRPC_INVALID_PARAMS: i64 = -32602;
pub const JSONRPC_INTERNAL_ERROR: i64 = -32603;

/// JSON-RPC error produced by a built-in server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuiltinError {
    pub code: i64,
    pub message: String,
}

impl BuiltinError {
    pub fn method_not_found(method: &str) -> Self {
        Self {
            code: MCP_METHOD_NOT_FOUND,
            message: format!("Method not found: {method}"),
        }
    }

    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self {
            code: JSONRPC_INVALID_PARAMS,
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self {
            code: JSONRPC_INTERNAL_ERROR,
            message: message.into(),
        }
    }
}

/// A server implemented inside this process. Tool, prompt and resource
/// shapes are the protocol's JSON objects.
#[async_trait]
pub trait BuiltinServer: Send + Sync {
    /// `{ "name": ..., "version": ... }`
    fn server_info(&self) -> Value;

    fn tools(&self) -> Vec<Value>;

    /// Returns a `tools/call` result object.
    async fn call_tool(&self, name: &str, arguments: Map<String, Value>)
        -> Result<Value, BuiltinError>;

    /// `None` when the server has no prompt support.
    fn prompts(&self) -> Option<Vec<Value>> {
        None
    }

    async fn get_prompt(
        &self,
        _name: &str,
        _arguments: Map<String, Value>,
    ) -> Result<Value, BuiltinError> {
        Err(BuiltinError::method_not_found("prompts/get"))
    }

    /// `None` when the server has no resource support.
    fn resources(&self) -> Option<Vec<Value>> {
        None
    }

    async fn read_resource(&self, _uri: &str) -> Result<Value, BuiltinError> {
        Err(BuiltinError::method_not_found("resources/read"))
    }
}

/// Creates built-in servers by name.
pub trait BuiltinServerFactory: Send + Sync {
    fn create(
        &self,
        name: &str,
        args: &[String],
        env: &HashMap<String, String>,
    ) -> Result<Arc<dyn BuiltinServer>, McpError>;
}

/// Factory for the servers shipped with this crate.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultBuiltinFactory;

impl BuiltinServerFactory for DefaultBuiltinFactory {
    fn create(
        &self,
        name: &str,
        args: &[String],
        _env: &HashMap<String, String>,
    ) -> Result<Arc<dyn BuiltinServer>, McpError> {
        info!(server = %name, args = ?args, "Creating in-process MCP server");
        match name {
            timetools::TIMETOOLS_SERVER => Ok(Arc::new(timetools::TimeToolsServer)),
            other => Err(McpError::Configuration(format!(
                "Unknown in-process MCP server: {other}"
            ))),
        }
    }
}

/// Built-in server name for a descriptor: `command`, falling back to `name`.
pub fn builtin_name(descriptor: &ServerDescriptor) -> &str {
    descriptor
        .command
        .as_deref()
        .map(str::trim)
        .filter(|command| !command.is_empty())
        .unwrap_or(descriptor.name.trim())
}

/// Start `server` on a fresh linked pair and return the client side.
pub fn spawn_builtin(server: Arc<dyn BuiltinServer>) -> InProcessTransport {
    let (transport, endpoint) = linked_pair();
    tokio::spawn(serve(server, endpoint));
    transport
}

/// Answer client messages until the client closes its side.
pub async fn serve(server: Arc<dyn BuiltinServer>, mut endpoint: InProcessEndpoint) {
    while let Some(message) = endpoint.recv().await {
        let Some(method) = message.get("method").and_then(Value::as_str) else {
            continue;
        };
        let Some(id) = message.get("id").cloned() else {
            debug!(method = %method, "Ignoring notification in built-in server");
            continue;
        };
        let params = message.get("params").cloned().unwrap_or(Value::Null);
        let reply = match handle_request(server.as_ref(), method, params).await {
            Ok(result) => json!({ "jsonrpc": "2.0", "id": id, "result": result }),
            Err(error) => json!({
                "jsonrpc": "2.0",
                "id": id,
                "error": { "code": error.code, "message": error.message }
            }),
        };
        if endpoint.send(reply).is_err() {
            break;
        }
    }
}

fn object_param(params: &Value, key: &str) -> Map<String, Value> {
    params
        .get(key)
        .and_then(Value::as_object)
        .cloned()
        .unwrap_or_default()
}

fn string_param<'a>(params: &'a Value, key: &str) -> Result<&'a str, BuiltinError> {
    params
        .get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| BuiltinError::invalid_params(format!("Missing required parameter: {key}")))
}

async fn handle_request(
    server: &dyn BuiltinServer,
    method: &str,
    params: Value,
) -> Result<Value, BuiltinError> {
    match method {
        "initialize" => {
            let protocol_version = params
                .get("protocolVersion")
                .and_then(Value::as_str)
                .filter(|version| !version.trim().is_empty())
                .unwrap_or(LATEST_PROTOCOL_VERSION)
                .to_string();
            let mut capabilities = Map::new();
            capabilities.insert("tools".to_string(), json!({}));
            if server.prompts().is_some() {
                capabilities.insert("prompts".to_string(), json!({}));
            }
            if server.resources().is_some() {
                capabilities.insert("resources".to_string(), json!({}));
            }
            Ok(json!({
                "protocolVersion": protocol_version,
                "capabilities": capabilities,
                "serverInfo": server.server_info(),
            }))
        }
        "ping" => Ok(json!({})),
        "tools/list" => Ok(json!({ "tools": server.tools() })),
        "tools/call" => {
            let name = string_param(&params, "name")?;
            server
                .call_tool(name, object_param(&params, "arguments"))
                .await
        }
        "prompts/list" => server
            .prompts()
            .map(|prompts| json!({ "prompts": prompts }))
            .ok_or_else(|| BuiltinError::method_not_found(method)),
        "prompts/get" => {
            let name = string_param(&params, "name")?;
            server
                .get_prompt(name, object_param(&params, "arguments"))
                .await
        }
        "resources/list" => server
            .resources()
            .map(|resources| json!({ "resources": resources }))
            .ok_or_else(|| BuiltinError::method_not_found(method)),
        "resources/read" => {
            let uri = string_param(&params, "uri")?;
            server.read_resource(uri).await
        }
        other => Err(BuiltinError::method_not_found(other)),
    }
}

/// `tools/call` result holding one text block.
pub fn text_result(text: impl Into<String>, is_error: bool) -> Value {
    json!({
        "content": [{ "type": "text", "text": text.into() }],
        "isError": is_error,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::mcp::transport::McpTransport;
    use rust_mcp_schema::schema_utils::ServerMessage;

    #[tokio::test]
    async fn initialize_echoes_protocol_version_and_capabilities() {
        let result = handle_request(
            &timetools::TimeToolsServer,
            "initialize",
            json!({
                "protocolVersion": "2025-06-18",
                "capabilities": {},
                "clientInfo": {"name": "test", "version": "0"}
            }),
        )
        .await
        .expect("initialize");
        assert_eq!(result["protocolVersion"], "2025-06-18");
        assert!(result["capabilities"]["tools"].is_object());
        assert!(result["capabilities"].get("prompts").is_none());
        assert_eq!(result["serverInfo"]["name"], "time-tools-server");
    }

    #[tokio::test]
    async fn unsupported_methods_answer_method_not_found() {
        for method in ["prompts/list", "resources/read", "sampling/createMessage"] {
            let err = handle_request(
                &timetools::TimeToolsServer,
                method,
                json!({"uri": "memo://x"}),
            )
            .await
            .expect_err("unsupported");
            assert_eq!(err.code, MCP_METHOD_NOT_FOUND);
        }
    }

    #[tokio::test]
    async fn tools_call_requires_a_name() {
        let err = handle_request(&timetools::TimeToolsServer, "tools/call", json!({}))
            .await
            .expect_err("missing name");
        assert_eq!(err.code, JSONRPC_INVALID_PARAMS);
    }

    #[tokio::test]
    async fn serve_loop_answers_requests_and_skips_notifications() {
        let transport = spawn_builtin(Arc::new(timetools::TimeToolsServer));
        let notification = serde_json::from_value(json!({
            "jsonrpc": "2.0",
            "method": "notifications/initialized"
        }))
        .expect("notification");
        let ping = serde_json::from_value(json!({
            "jsonrpc": "2.0",
            "id": 9,
            "method": "ping"
        }))
        .expect("ping");
        transport.send(notification).await.expect("send notification");
        transport.send(ping).await.expect("send ping");
        assert!(matches!(
            transport.receive().await,
            Some(ServerMessage::Response(_))
        ));
        transport.close().await.expect("close");
    }

    #[test]
    fn default_factory_rejects_unknown_names() {
        let factory = DefaultBuiltinFactory;
        assert!(factory
            .create(timetools::TIMETOOLS_SERVER, &[], &HashMap::new())
            .is_ok());
        let err = factory
            .create("@toolrelay/nope", &[], &HashMap::new())
            .err()
            .expect("unknown server");
        assert!(err.is_configuration());
    }

    #[test]
    fn builtin_name_prefers_command() {
        let mut descriptor = ServerDescriptor {
            name: "@toolrelay/timetools".to_string(),
            ..Default::default()
        };
        assert_eq!(builtin_name(&descriptor), "@toolrelay/timetools");
        descriptor.command = Some("@toolrelay/other".to_string());
        assert_eq!(builtin_name(&descriptor), "@toolrelay/other");
    }
}
