//! Descriptor and response shapes handed to host applications.
//!
//! Everything here serializes camelCase so hosts can pass values straight
//! through to JSON consumers.

use rust_mcp_schema::{Prompt, PromptArgument, Resource, Tool};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::PathBuf;

use crate::core::config::ServerDescriptor;

/// Stable identifier for a tool across servers.
pub fn tool_key(server_id: &str, tool_name: &str) -> String {
    format!("{server_id}-{tool_name}")
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolDescriptor {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_schema: Option<Value>,
    pub server_id: String,
    pub server_name: String,
    pub tool_key: String,
}

impl ToolDescriptor {
    pub fn from_tool(server: &ServerDescriptor, tool: Tool) -> Self {
        let key = tool_key(&server.id, &tool.name);
        Self {
            id: key.clone(),
            input_schema: serde_json::to_value(&tool.input_schema).ok(),
            description: tool.description,
            name: tool.name,
            server_id: server.id.clone(),
            server_name: server.name.clone(),
            tool_key: key,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PromptDescriptor {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arguments: Option<Vec<PromptArgument>>,
    pub server_id: String,
    pub server_name: String,
}

impl PromptDescriptor {
    pub fn from_prompt(server: &ServerDescriptor, prompt: Prompt) -> Self {
        Self {
            id: format!("p-{}-{}", server.id, prompt.name),
            description: prompt.description,
            arguments: if prompt.arguments.is_empty() {
                None
            } else {
                Some(prompt.arguments)
            },
            name: prompt.name,
            server_id: server.id.clone(),
            server_name: server.name.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceDescriptor {
    pub uri: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<i64>,
    pub server_id: String,
    pub server_name: String,
}

impl ResourceDescriptor {
    pub fn from_resource(server: &ServerDescriptor, resource: Resource) -> Self {
        Self {
            uri: resource.uri,
            name: resource.name,
            description: resource.description,
            mime_type: resource.mime_type,
            size: resource.size,
            server_id: server.id.clone(),
            server_name: server.name.clone(),
        }
    }
}

/// Outcome of a tool invocation. Failures are reported in-band with
/// `is_error` set and a single text item describing the fault.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallToolResponse {
    pub is_error: bool,
    pub content: Vec<Value>,
}

impl CallToolResponse {
    pub fn error_text(text: impl Into<String>) -> Self {
        Self {
            is_error: true,
            content: vec![text_item(text)],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PromptResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub messages: Vec<Value>,
    pub is_error: bool,
}

impl PromptResponse {
    pub fn error_text(text: impl Into<String>) -> Self {
        Self {
            description: None,
            messages: vec![serde_json::json!({
                "role": "assistant",
                "content": text_item(text),
            })],
            is_error: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceResponse {
    pub contents: Vec<Value>,
    pub is_error: bool,
}

impl ResourceResponse {
    pub fn error_text(text: impl Into<String>) -> Self {
        Self {
            contents: vec![text_item(text)],
            is_error: true,
        }
    }
}

pub(crate) fn text_item(text: impl Into<String>) -> Value {
    serde_json::json!({ "type": "text", "text": text.into() })
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstallInfo {
    pub dir: PathBuf,
    pub uv_path: PathBuf,
    pub bun_path: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RerunStatus {
    Rerunning,
    Done,
    Error,
}

/// Progress event for a re-executed tool call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RerunUpdate {
    pub message_id: String,
    pub tool_call_id: String,
    pub status: RerunStatus,
    pub args: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<CallToolResponse>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn server(id: &str) -> ServerDescriptor {
        ServerDescriptor {
            id: id.to_string(),
            name: format!("{id} server"),
            ..Default::default()
        }
    }

    fn tool(name: &str) -> Tool {
        serde_json::from_value(serde_json::json!({
            "name": name,
            "description": "runs things",
            "inputSchema": {"type": "object", "properties": {}}
        }))
        .expect("tool parses")
    }

    #[test]
    fn tool_keys_distinguish_servers_sharing_a_tool_name() {
        let a = ToolDescriptor::from_tool(&server("a"), tool("run"));
        let b = ToolDescriptor::from_tool(&server("b"), tool("run"));
        assert_eq!(a.tool_key, "a-run");
        assert_eq!(b.tool_key, "b-run");
        assert_ne!(a.tool_key, b.tool_key);
        assert_eq!(a.server_name, "a server");
    }

    #[test]
    fn descriptors_serialize_camel_case() {
        let descriptor = ToolDescriptor::from_tool(&server("a"), tool("run"));
        let value = serde_json::to_value(&descriptor).expect("serialize");
        assert_eq!(value["toolKey"], "a-run");
        assert_eq!(value["serverId"], "a");
        assert_eq!(value["inputSchema"]["type"], "object");

        let response = CallToolResponse::error_text("Error calling tool run: boom");
        let value = serde_json::to_value(&response).expect("serialize");
        assert_eq!(value["isError"], true);
        assert_eq!(value["content"][0]["type"], "text");
    }

    #[test]
    fn rerun_status_serializes_lowercase() {
        let update = RerunUpdate {
            message_id: "m1".to_string(),
            tool_call_id: "t1".to_string(),
            status: RerunStatus::Rerunning,
            args: serde_json::json!({}),
            response: None,
            error: None,
        };
        let value = serde_json::to_value(&update).expect("serialize");
        assert_eq!(value["status"], "rerunning");
        assert_eq!(value["toolCallId"], "t1");
        assert!(value.get("response").is_none());
    }
}
