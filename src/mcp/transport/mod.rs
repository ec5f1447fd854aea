//! Shared MCP transport abstractions.
//!
//! Every backend moves protocol messages in both directions and nothing
//! more: request/response correlation lives in
//! [`crate::mcp::session::Session`], so the four transports only differ in
//! how frames reach the server.

use async_trait::async_trait;
use rust_mcp_schema::schema_utils::{ClientMessage, ServerMessage};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::core::config::ServerDescriptor;
use crate::mcp::error::McpError;

pub mod event_stream;
pub mod http;
pub mod in_process;
pub mod sse;
pub mod stdio;
pub mod streamable_http;

/// Supported MCP transport backends.
///
/// - [`McpTransportKind::Stdio`] for locally spawned processes.
/// - [`McpTransportKind::Sse`] for the legacy GET stream + POST endpoint pair.
/// - [`McpTransportKind::StreamableHttp`] for remote servers over HTTP/SSE.
/// - [`McpTransportKind::InProcess`] for built-in servers on a linked channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum McpTransportKind {
    Stdio,
    Sse,
    StreamableHttp,
    InProcess,
}

impl McpTransportKind {
    /// Resolves the transport for a descriptor. Without an explicit kind,
    /// a command with no base URL means stdio; anything else is streamable
    /// HTTP.
    pub fn from_descriptor(descriptor: &ServerDescriptor) -> Result<Self, McpError> {
        let Some(kind) = descriptor
            .kind
            .as_deref()
            .map(str::trim)
            .filter(|kind| !kind.is_empty())
        else {
            if descriptor.command.is_some() && descriptor.base_url.is_none() {
                return Ok(McpTransportKind::Stdio);
            }
            return Ok(McpTransportKind::StreamableHttp);
        };

        match kind.to_ascii_lowercase().as_str() {
            "stdio" => Ok(McpTransportKind::Stdio),
            "sse" => Ok(McpTransportKind::Sse),
            "streamable-http" | "streamable_http" | "streamablehttp" | "http" => {
                Ok(McpTransportKind::StreamableHttp)
            }
            "in-process" | "in_process" | "inmemory" | "in-memory" => {
                Ok(McpTransportKind::InProcess)
            }
            other => Err(McpError::Configuration(format!(
                "Unsupported MCP transport: {other}"
            ))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            McpTransportKind::Stdio => "stdio",
            McpTransportKind::Sse => "sse",
            McpTransportKind::StreamableHttp => "streamable-http",
            McpTransportKind::InProcess => "in-process",
        }
    }
}

#[async_trait]
/// Bidirectional message channel to one MCP server.
pub trait McpTransport: Send + Sync {
    fn kind(&self) -> McpTransportKind;

    /// Establish the underlying channel. Called once before any send.
    async fn connect(&self) -> Result<(), McpError>;

    async fn send(&self, message: ClientMessage) -> Result<(), McpError>;

    /// Next inbound message; `None` once the channel is closed.
    async fn receive(&self) -> Option<ServerMessage>;

    async fn close(&self) -> Result<(), McpError>;

    /// Record the protocol version negotiated during initialize.
    fn set_protocol_version(&self, _protocol_version: &str) {}
}

/// Inbound queue shared by transport implementations.
///
/// Producers push decoded messages; `receive` yields queued messages first
/// and reports closure once the queue is drained and the token is
/// cancelled.
pub(crate) struct Inbox {
    tx: mpsc::UnboundedSender<ServerMessage>,
    rx: Mutex<mpsc::UnboundedReceiver<ServerMessage>>,
    closed: CancellationToken,
}

impl Inbox {
    pub(crate) fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: Mutex::new(rx),
            closed: CancellationToken::new(),
        }
    }

    pub(crate) fn sender(&self) -> mpsc::UnboundedSender<ServerMessage> {
        self.tx.clone()
    }

    pub(crate) fn closed_token(&self) -> CancellationToken {
        self.closed.clone()
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    pub(crate) fn push(&self, message: ServerMessage) {
        let _ = self.tx.send(message);
    }

    pub(crate) fn close(&self) {
        self.closed.cancel();
    }

    pub(crate) async fn receive(&self) -> Option<ServerMessage> {
        let mut rx = self.rx.lock().await;
        tokio::select! {
            biased;
            message = rx.recv() => message,
            _ = self.closed.cancelled() => None,
        }
    }
}

/// Decode one JSON frame that may hold a single message or a batch.
pub(crate) fn decode_frame(payload: &str) -> Result<Vec<ServerMessage>, String> {
    let value =
        serde_json::from_str::<serde_json::Value>(payload).map_err(|err| err.to_string())?;
    decode_value(value)
}

pub(crate) fn decode_value(value: serde_json::Value) -> Result<Vec<ServerMessage>, String> {
    match value {
        serde_json::Value::Array(items) => Ok(items
            .into_iter()
            .filter_map(|item| match serde_json::from_value::<ServerMessage>(item) {
                Ok(message) => Some(message),
                Err(err) => {
                    debug!(error = %err, "Skipping undecodable MCP batch entry");
                    None
                }
            })
            .collect()),
        other => serde_json::from_value::<ServerMessage>(other)
            .map(|message| vec![message])
            .map_err(|err| err.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(kind: Option<&str>, command: Option<&str>, base_url: Option<&str>) -> ServerDescriptor {
        ServerDescriptor {
            id: "s".to_string(),
            name: "s".to_string(),
            kind: kind.map(str::to_string),
            command: command.map(str::to_string),
            base_url: base_url.map(str::to_string),
            ..Default::default()
        }
    }

    #[test]
    fn kind_inferred_from_descriptor_shape() {
        assert_eq!(
            McpTransportKind::from_descriptor(&descriptor(None, Some("node"), None)).unwrap(),
            McpTransportKind::Stdio
        );
        assert_eq!(
            McpTransportKind::from_descriptor(&descriptor(None, None, Some("https://x"))).unwrap(),
            McpTransportKind::StreamableHttp
        );
        assert_eq!(
            McpTransportKind::from_descriptor(&descriptor(Some("SSE"), None, None)).unwrap(),
            McpTransportKind::Sse
        );
        assert_eq!(
            McpTransportKind::from_descriptor(&descriptor(Some("inMemory"), None, None)).unwrap(),
            McpTransportKind::InProcess
        );
    }

    #[test]
    fn unknown_kind_is_configuration_error() {
        let err = McpTransportKind::from_descriptor(&descriptor(Some("carrier-pigeon"), None, None))
            .expect_err("unsupported");
        assert!(err.is_configuration());
        assert!(err.to_string().contains("carrier-pigeon"));
    }

    #[test]
    fn decode_frame_handles_batches() {
        let messages = decode_frame(
            r#"[{"jsonrpc":"2.0","id":1,"result":{}},{"jsonrpc":"2.0","method":"notifications/tools/list_changed"}]"#,
        )
        .expect("batch decodes");
        assert_eq!(messages.len(), 2);
        assert!(decode_frame("not json").is_err());
    }

    #[tokio::test]
    async fn inbox_drains_queued_messages_before_reporting_closed() {
        let inbox = Inbox::new();
        let message = decode_frame(r#"{"jsonrpc":"2.0","id":1,"result":{}}"#)
            .expect("decodes")
            .remove(0);
        inbox.push(message);
        inbox.close();
        assert!(inbox.receive().await.is_some());
        assert!(inbox.receive().await.is_none());
        assert!(inbox.is_closed());
    }
}
