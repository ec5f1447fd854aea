use std::sync::Mutex;

use async_trait::async_trait;
use rust_mcp_schema::schema_utils::{ClientMessage, ServerMessage};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::{decode_value, Inbox, McpTransport, McpTransportKind};
use crate::mcp::error::McpError;

/// Client half of a linked in-process channel.
pub struct InProcessTransport {
    outbound: Mutex<Option<mpsc::UnboundedSender<Value>>>,
    inbox: Inbox,
}

/// Server half of a linked in-process channel, driven by a built-in server.
pub struct InProcessEndpoint {
    inbound: mpsc::UnboundedReceiver<Value>,
    replies: mpsc::UnboundedSender<ServerMessage>,
    closed: CancellationToken,
}

/// Create a connected client transport and server endpoint.
pub fn linked_pair() -> (InProcessTransport, InProcessEndpoint) {
    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
    let inbox = Inbox::new();
    let endpoint = InProcessEndpoint {
        inbound: outbound_rx,
        replies: inbox.sender(),
        closed: inbox.closed_token(),
    };
    let transport = InProcessTransport {
        outbound: Mutex::new(Some(outbound_tx)),
        inbox,
    };
    (transport, endpoint)
}

impl InProcessEndpoint {
    /// Next client message as raw JSON; `None` once the client closed.
    pub async fn recv(&mut self) -> Option<Value> {
        tokio::select! {
            biased;
            message = self.inbound.recv() => message,
            _ = self.closed.cancelled() => None,
        }
    }

    /// Deliver a server message to the client.
    pub fn send(&self, message: Value) -> Result<(), McpError> {
        if self.closed.is_cancelled() {
            return Err(McpError::Transport("In-process client closed.".to_string()));
        }
        for decoded in decode_value(message).map_err(McpError::Protocol)? {
            self.replies
                .send(decoded)
                .map_err(|_| McpError::Transport("In-process client closed.".to_string()))?;
        }
        Ok(())
    }
}

impl Drop for InProcessEndpoint {
    fn drop(&mut self) {
        self.closed.cancel();
    }
}

#[async_trait]
impl McpTransport for InProcessTransport {
    fn kind(&self) -> McpTransportKind {
        McpTransportKind::InProcess
    }

    async fn connect(&self) -> Result<(), McpError> {
        if self.inbox.is_closed() {
            return Err(McpError::Connection(
                "In-process server is not running.".to_string(),
            ));
        }
        Ok(())
    }

    async fn send(&self, message: ClientMessage) -> Result<(), McpError> {
        let value =
            serde_json::to_value(&message).map_err(|err| McpError::Protocol(err.to_string()))?;
        let guard = self
            .outbound
            .lock()
            .map_err(|_| McpError::Transport("In-process channel poisoned.".to_string()))?;
        let sender = guard
            .as_ref()
            .ok_or_else(|| McpError::Transport("In-process transport closed.".to_string()))?;
        sender
            .send(value)
            .map_err(|_| McpError::Transport("In-process server stopped.".to_string()))
    }

    async fn receive(&self) -> Option<ServerMessage> {
        self.inbox.receive().await
    }

    async fn close(&self) -> Result<(), McpError> {
        if let Ok(mut guard) = self.outbound.lock() {
            guard.take();
        }
        self.inbox.close();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn initialized() -> ClientMessage {
        serde_json::from_value(json!({
            "jsonrpc": "2.0",
            "method": "notifications/initialized"
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn messages_flow_in_both_directions() {
        let (transport, mut endpoint) = linked_pair();
        transport.connect().await.expect("connect");
        transport.send(initialized()).await.expect("send");

        let received = endpoint.recv().await.expect("server receives");
        assert_eq!(received["method"], "notifications/initialized");

        endpoint
            .send(json!({"jsonrpc": "2.0", "id": 7, "result": {}}))
            .expect("reply");
        assert!(matches!(
            transport.receive().await,
            Some(ServerMessage::Response(_))
        ));
    }

    #[tokio::test]
    async fn closing_the_client_ends_the_server_loop() {
        let (transport, mut endpoint) = linked_pair();
        transport.close().await.expect("close");
        assert!(endpoint.recv().await.is_none());
        assert!(endpoint.send(json!({"jsonrpc": "2.0", "id": 1, "result": {}})).is_err());
        assert!(matches!(
            transport.send(initialized()).await,
            Err(McpError::Transport(_))
        ));
    }

    #[tokio::test]
    async fn dropping_the_endpoint_closes_the_client() {
        let (transport, endpoint) = linked_pair();
        drop(endpoint);
        assert!(transport.receive().await.is_none());
        assert!(transport.connect().await.is_err());
    }
}
