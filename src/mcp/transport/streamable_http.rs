use std::sync::Mutex;

use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use reqwest::{StatusCode, Url};
use rust_mcp_schema::schema_utils::{ClientMessage, ServerMessage};
use tracing::{debug, warn};

use super::event_stream::{forward_event_messages, is_event_stream, pump_event_stream};
use super::http::{header_value, HttpChannel, McpRequestExt, SESSION_ID_HEADER};
use super::{decode_frame, Inbox, McpTransport, McpTransportKind};
use crate::mcp::error::McpError;

/// Values the server hands back that later requests must echo.
#[derive(Debug, Default)]
struct Negotiated {
    session_id: Option<String>,
    protocol_version: Option<String>,
}

/// Streamable HTTP transport. Every outbound message is its own POST; the
/// server answers with a JSON body, a per-request event stream, or 202.
pub struct StreamableHttpTransport {
    server_id: String,
    endpoint: Url,
    channel: HttpChannel,
    negotiated: Mutex<Negotiated>,
    inbox: Inbox,
}

impl StreamableHttpTransport {
    pub fn new(server_id: impl Into<String>, endpoint: Url, channel: HttpChannel) -> Self {
        Self {
            server_id: server_id.into(),
            endpoint,
            channel,
            negotiated: Mutex::new(Negotiated::default()),
            inbox: Inbox::new(),
        }
    }

    fn negotiated(&self) -> std::sync::MutexGuard<'_, Negotiated> {
        self.negotiated
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn session_id(&self) -> Option<String> {
        self.negotiated().session_id.clone()
    }

    fn with_session(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        let negotiated = self.negotiated();
        request
            .mcp_protocol_version(negotiated.protocol_version.as_deref())
            .mcp_session(negotiated.session_id.as_deref())
    }

    /// Stream the events of one response into the inbox in the background.
    fn spawn_event_reader(&self, response: reqwest::Response) {
        let tx = self.inbox.sender();
        let cancel = self.inbox.closed_token();
        let server_id = self.server_id.clone();
        tokio::spawn(async move {
            let pumped = pump_event_stream(response, cancel, |event| {
                forward_event_messages(&server_id, &tx, event)
            })
            .await;
            if let Err(err) = pumped {
                warn!(server_id = %server_id, error = %err, "MCP event stream ended with error");
            }
        });
    }
}

#[async_trait]
impl McpTransport for StreamableHttpTransport {
    fn kind(&self) -> McpTransportKind {
        McpTransportKind::StreamableHttp
    }

    async fn connect(&self) -> Result<(), McpError> {
        // initialize is the first POST; there is nothing to open beforehand.
        Ok(())
    }

    async fn send(&self, message: ClientMessage) -> Result<(), McpError> {
        if self.inbox.is_closed() {
            return Err(McpError::Transport("MCP HTTP transport closed.".to_string()));
        }
        let payload =
            serde_json::to_vec(&message).map_err(|err| McpError::Protocol(err.to_string()))?;
        debug!(server_id = %self.server_id, url = %self.endpoint, "Sending MCP HTTP request");

        let request = self
            .with_session(self.channel.post(self.endpoint.clone()).mcp_post())
            .body(payload);
        let response = self.channel.execute(request, "MCP POST failed").await?;

        if let Some(session_id) = header_value(&response, SESSION_ID_HEADER) {
            self.negotiated().session_id = Some(session_id.to_string());
        }
        if response.status() == StatusCode::ACCEPTED {
            return Ok(());
        }
        if is_event_stream(header_value(&response, CONTENT_TYPE.as_str())) {
            self.spawn_event_reader(response);
            return Ok(());
        }

        let body = response
            .text()
            .await
            .map_err(|err| McpError::Transport(err.to_string()))?;
        if body.trim().is_empty() {
            return Ok(());
        }
        for message in decode_frame(&body).map_err(McpError::Protocol)? {
            self.inbox.push(message);
        }
        Ok(())
    }

    async fn receive(&self) -> Option<ServerMessage> {
        self.inbox.receive().await
    }

    async fn close(&self) -> Result<(), McpError> {
        if self.inbox.is_closed() {
            return Ok(());
        }
        self.inbox.close();
        if self.session_id().is_none() {
            return Ok(());
        }
        // Session termination is best effort; servers may not support DELETE.
        let request = self.with_session(self.channel.delete(self.endpoint.clone()));
        match self.channel.execute(request, "MCP session DELETE failed").await {
            Ok(response) => debug!(
                server_id = %self.server_id,
                status = %response.status(),
                "Terminated MCP HTTP session"
            ),
            Err(err) => debug!(server_id = %self.server_id, error = %err, "MCP session DELETE failed"),
        }
        Ok(())
    }

    fn set_protocol_version(&self, protocol_version: &str) {
        self.negotiated().protocol_version = Some(protocol_version.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn transport() -> StreamableHttpTransport {
        StreamableHttpTransport::new(
            "remote",
            Url::parse("http://127.0.0.1:9/mcp").expect("url"),
            HttpChannel::new(reqwest::Client::new(), HashMap::new(), None),
        )
    }

    #[test]
    fn negotiated_values_are_echoed() {
        let transport = transport();
        let request = transport
            .with_session(reqwest::Client::new().post("http://127.0.0.1:9/mcp"))
            .build()
            .expect("request");
        assert!(request.headers().get(SESSION_ID_HEADER).is_none());

        transport.set_protocol_version("2025-11-25");
        transport.negotiated().session_id = Some("sess-1".to_string());
        let request = transport
            .with_session(reqwest::Client::new().post("http://127.0.0.1:9/mcp"))
            .build()
            .expect("request");
        assert_eq!(request.headers()[SESSION_ID_HEADER], "sess-1");
        assert_eq!(request.headers()["mcp-protocol-version"], "2025-11-25");
        assert_eq!(transport.session_id().as_deref(), Some("sess-1"));
    }

    #[tokio::test]
    async fn closed_transport_refuses_sends() {
        let transport = transport();
        transport.close().await.expect("close without session");
        assert!(transport.receive().await.is_none());

        let message: ClientMessage = serde_json::from_value(serde_json::json!({
            "jsonrpc": "2.0",
            "method": "notifications/initialized"
        }))
        .expect("notification");
        assert!(matches!(
            transport.send(message).await,
            Err(McpError::Transport(_))
        ));
    }
}
