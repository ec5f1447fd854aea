//! Request construction and response decoding shared by every transport.

use rust_mcp_schema::schema_utils::ServerMessage;
use rust_mcp_schema::{
    ClientCapabilities, Implementation, InitializeRequestParams, InitializeResult, Prompt,
    Resource, RpcError, Tool, LATEST_PROTOCOL_VERSION,
};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;

use crate::mcp::error::McpError;

/// JSON-RPC code used by servers to indicate unsupported methods.
pub const MCP_METHOD_NOT_FOUND: i64 = -32601;

/// Upper bound on pages fetched for one listing.
pub const MCP_MAX_LIST_PAGES: usize = 50;

const CLIENT_NAME: &str = "toolrelay";

/// Parameters toolrelay sends with `initialize`.
pub fn initialize_params() -> InitializeRequestParams {
    InitializeRequestParams {
        protocol_version: LATEST_PROTOCOL_VERSION.to_string(),
        capabilities: ClientCapabilities::default(),
        client_info: Implementation {
            name: CLIENT_NAME.to_string(),
            title: Some("toolrelay MCP client".to_string()),
            version: env!("CARGO_PKG_VERSION").to_string(),
            description: Some("Multi-transport MCP client runtime".to_string()),
            website_url: None,
            icons: Vec::new(),
        },
        meta: None,
    }
}

pub fn parse_initialize_result(message: ServerMessage) -> Result<InitializeResult, McpError> {
    let result: InitializeResult = parse_response(message)?;
    if result.protocol_version.trim().is_empty() {
        return Err(McpError::Protocol(
            "initialize response carries no protocol version".to_string(),
        ));
    }
    Ok(result)
}

/// Decode the `result` of a response into `T`. JSON-RPC errors and
/// non-response messages become [`McpError::Protocol`].
pub fn parse_response<T: DeserializeOwned>(message: ServerMessage) -> Result<T, McpError> {
    let protocol = |detail: String| McpError::Protocol(detail);
    let result = match message {
        ServerMessage::Response(response) => response.result,
        ServerMessage::Error(error) => return Err(protocol(describe_rpc_error(&error.error))),
        other => return Err(protocol(format!("Unexpected MCP server message: {other:?}"))),
    };
    serde_json::to_value(result)
        .and_then(serde_json::from_value)
        .map_err(|err| protocol(format!("Malformed MCP result: {err}")))
}

pub fn is_method_not_found(message: &ServerMessage) -> bool {
    matches!(
        message,
        ServerMessage::Error(error) if error.error.code == MCP_METHOD_NOT_FOUND
    )
}

/// `MCP error <code>: <message>`, followed by the error data on its own
/// line. A `details` string inside the data is preferred over the raw value.
pub fn describe_rpc_error(error: &RpcError) -> String {
    let heading = format!("MCP error {}: {}", error.code, error.message);
    let details = error.data.as_ref().and_then(|data| match data {
        Value::String(text) => Some(text.clone()),
        _ => match data.get("details") {
            Some(Value::String(text)) => Some(text.clone()),
            _ => serde_json::to_string_pretty(data).ok(),
        },
    });
    match details.filter(|details| !details.is_empty()) {
        Some(details) => format!("{heading}\n{details}"),
        None => heading,
    }
}

/// One page of a paginated listing.
pub trait ListPage: DeserializeOwned {
    type Item;

    fn into_parts(self) -> (Vec<Self::Item>, Option<String>);
}

macro_rules! list_page {
    ($page:ident, $field:ident, $item:ty) => {
        #[derive(Debug, Deserialize)]
        #[serde(rename_all = "camelCase")]
        pub struct $page {
            #[serde(default)]
            pub $field: Vec<$item>,
            #[serde(default)]
            pub next_cursor: Option<String>,
        }

        impl ListPage for $page {
            type Item = $item;

            fn into_parts(self) -> (Vec<$item>, Option<String>) {
                (self.$field, self.next_cursor)
            }
        }
    };
}

list_page!(ToolsPage, tools, Tool);
list_page!(PromptsPage, prompts, Prompt);
list_page!(ResourcesPage, resources, Resource);

/// `tools/call` result. Content blocks stay as raw JSON so new block types
/// pass through untouched.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCallOutcome {
    #[serde(default)]
    pub content: Vec<Value>,
    #[serde(default)]
    pub is_error: Option<bool>,
    #[serde(default)]
    pub structured_content: Option<Value>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PromptOutcome {
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub messages: Vec<Value>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceOutcome {
    #[serde(default)]
    pub contents: Vec<Value>,
}
