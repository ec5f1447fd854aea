use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use reqwest::Url;
use rust_mcp_schema::schema_utils::{ClientMessage, ServerMessage};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::event_stream::{forward_event_messages, pump_event_stream, SseEvent};
use super::http::{HttpChannel, McpRequestExt, EVENT_STREAM, JSON};
use super::{Inbox, McpTransport, McpTransportKind};
use crate::mcp::error::McpError;

const ENDPOINT_EVENT: &str = "endpoint";
const MESSAGE_EVENT: &str = "message";

/// Legacy HTTP+SSE transport: a long-lived GET stream for server messages
/// and a POST endpoint announced by the stream's first `endpoint` event.
pub struct SseTransport {
    server_id: String,
    stream_url: Url,
    channel: HttpChannel,
    endpoint_timeout: Duration,
    endpoint: Mutex<Option<Url>>,
    protocol_version: Mutex<Option<String>>,
    reader: Mutex<Option<JoinHandle<()>>>,
    inbox: Inbox,
}

impl SseTransport {
    pub fn new(
        server_id: impl Into<String>,
        stream_url: Url,
        channel: HttpChannel,
        endpoint_timeout: Duration,
    ) -> Self {
        Self {
            server_id: server_id.into(),
            stream_url,
            channel,
            endpoint_timeout,
            endpoint: Mutex::new(None),
            protocol_version: Mutex::new(None),
            reader: Mutex::new(None),
            inbox: Inbox::new(),
        }
    }

    pub fn endpoint(&self) -> Option<Url> {
        lock(&self.endpoint).clone()
    }

    /// Route stream events: the first `endpoint` event goes to
    /// `endpoint_tx`, message events to the inbox.
    fn spawn_reader(&self, response: reqwest::Response, endpoint_tx: oneshot::Sender<String>) {
        let tx = self.inbox.sender();
        let cancel = self.inbox.closed_token();
        let server_id = self.server_id.clone();
        let handle = tokio::spawn(async move {
            let mut endpoint_tx = Some(endpoint_tx);
            let pumped = pump_event_stream(response, cancel.clone(), |event: SseEvent| {
                let name = event.event.clone();
                match name.as_deref() {
                    Some(ENDPOINT_EVENT) => {
                        if let Some(sender) = endpoint_tx.take() {
                            let _ = sender.send(event.data);
                        }
                    }
                    None | Some(MESSAGE_EVENT) => forward_event_messages(&server_id, &tx, event),
                    Some(other) => {
                        debug!(server_id = %server_id, event = %other, "Ignoring SSE event");
                    }
                }
            })
            .await;
            match pumped {
                Ok(()) => info!(server_id = %server_id, "MCP SSE stream closed"),
                Err(err) => warn!(server_id = %server_id, error = %err, "MCP SSE stream failed"),
            }
            cancel.cancel();
        });
        *lock(&self.reader) = Some(handle);
    }

    /// Open the GET stream and wait for the announced POST endpoint.
    async fn open_stream(&self) -> Result<Url, McpError> {
        let request = self
            .channel
            .get(self.stream_url.clone())
            .header(ACCEPT, EVENT_STREAM);
        let response = self
            .channel
            .execute(request, "MCP SSE stream rejected")
            .await?;

        let (endpoint_tx, endpoint_rx) = oneshot::channel();
        self.spawn_reader(response, endpoint_tx);

        let data = match tokio::time::timeout(self.endpoint_timeout, endpoint_rx).await {
            Ok(Ok(data)) => data,
            Ok(Err(_)) => {
                return Err(McpError::Connection(
                    "MCP SSE stream ended before announcing an endpoint.".to_string(),
                ))
            }
            Err(_) => {
                return Err(McpError::Connection(format!(
                    "MCP SSE endpoint not announced within {:?}.",
                    self.endpoint_timeout
                )))
            }
        };
        resolve_endpoint(&self.stream_url, &data)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Resolve the `endpoint` event payload against the stream URL.
pub fn resolve_endpoint(stream_url: &Url, data: &str) -> Result<Url, McpError> {
    stream_url
        .join(data.trim())
        .map_err(|err| McpError::Protocol(format!("Invalid SSE endpoint {data}: {err}")))
}

#[async_trait]
impl McpTransport for SseTransport {
    fn kind(&self) -> McpTransportKind {
        McpTransportKind::Sse
    }

    async fn connect(&self) -> Result<(), McpError> {
        match self.open_stream().await {
            Ok(endpoint) => {
                debug!(server_id = %self.server_id, endpoint = %endpoint, "MCP SSE endpoint announced");
                *lock(&self.endpoint) = Some(endpoint);
                Ok(())
            }
            Err(err) => {
                // Stop the reader so the GET stream does not outlive the failure.
                let _ = self.close().await;
                Err(err)
            }
        }
    }

    async fn send(&self, message: ClientMessage) -> Result<(), McpError> {
        if self.inbox.is_closed() {
            return Err(McpError::Transport("MCP SSE transport closed.".to_string()));
        }
        let endpoint = self
            .endpoint()
            .ok_or_else(|| McpError::Transport("MCP SSE transport not connected.".to_string()))?;
        let payload =
            serde_json::to_vec(&message).map_err(|err| McpError::Protocol(err.to_string()))?;
        let protocol_version = lock(&self.protocol_version).clone();
        let request = self
            .channel
            .post(endpoint)
            .header(CONTENT_TYPE, JSON)
            .mcp_protocol_version(protocol_version.as_deref())
            .body(payload);
        // Replies arrive on the event stream; the POST body is ignored.
        self.channel.execute(request, "MCP SSE POST failed").await?;
        Ok(())
    }

    async fn receive(&self) -> Option<ServerMessage> {
        self.inbox.receive().await
    }

    async fn close(&self) -> Result<(), McpError> {
        self.inbox.close();
        let handle = lock(&self.reader).take();
        if let Some(handle) = handle {
            handle.abort();
        }
        Ok(())
    }

    fn set_protocol_version(&self, protocol_version: &str) {
        *lock(&self.protocol_version) = Some(protocol_version.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_resolves_relative_to_stream_url() {
        let base = Url::parse("https://mcp.example.com/v1/sse").unwrap();
        assert_eq!(
            resolve_endpoint(&base, "/messages?sessionId=abc")
                .unwrap()
                .as_str(),
            "https://mcp.example.com/messages?sessionId=abc"
        );
        assert_eq!(
            resolve_endpoint(&base, "messages").unwrap().as_str(),
            "https://mcp.example.com/v1/messages"
        );
        assert_eq!(
            resolve_endpoint(&base, "https://other.example.com/post")
                .unwrap()
                .as_str(),
            "https://other.example.com/post"
        );
    }

    /// Serve one SSE response announcing `endpoint`, then report whether the
    /// client hung up within `wait`.
    async fn serve_endpoint_once(
        listener: tokio::net::TcpListener,
        endpoint: &'static str,
        wait: Duration,
    ) -> bool {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let (mut socket, _) = listener.accept().await.expect("accept");
        let mut request = Vec::new();
        let mut buf = [0u8; 1024];
        while !request.windows(4).any(|window| window == b"\r\n\r\n") {
            let read = socket.read(&mut buf).await.expect("read request");
            assert!(read > 0, "client closed before sending a request");
            request.extend_from_slice(&buf[..read]);
        }
        let response = format!(
            "HTTP/1.1 200 OK\r\ncontent-type: text/event-stream\r\n\r\nevent: endpoint\ndata: {endpoint}\n\n"
        );
        socket
            .write_all(response.as_bytes())
            .await
            .expect("write events");

        // EOF or a reset both mean the client let go of the stream.
        loop {
            match tokio::time::timeout(wait, socket.read(&mut buf)).await {
                Ok(Ok(0)) | Ok(Err(_)) => return true,
                Ok(Ok(_)) => continue,
                Err(_) => return false,
            }
        }
    }

    #[tokio::test]
    async fn invalid_endpoint_releases_the_stream() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let port = listener.local_addr().expect("addr").port();
        let server = tokio::spawn(serve_endpoint_once(
            listener,
            "http://[::1",
            Duration::from_secs(2),
        ));

        let transport = SseTransport::new(
            "legacy",
            Url::parse(&format!("http://127.0.0.1:{port}/sse")).unwrap(),
            HttpChannel::new(reqwest::Client::new(), std::collections::HashMap::new(), None),
            Duration::from_secs(2),
        );
        let err = transport.connect().await.expect_err("invalid endpoint");
        assert!(matches!(err, McpError::Protocol(_)));
        assert!(transport.endpoint().is_none());
        assert!(transport.receive().await.is_none());

        assert!(server.await.expect("server task"), "stream left open");
    }

    #[tokio::test]
    async fn send_before_connect_is_a_transport_error() {
        let transport = SseTransport::new(
            "legacy",
            Url::parse("http://127.0.0.1:9/sse").unwrap(),
            HttpChannel::new(reqwest::Client::new(), std::collections::HashMap::new(), None),
            Duration::from_secs(1),
        );
        let message: ClientMessage = serde_json::from_value(serde_json::json!({
            "jsonrpc": "2.0",
            "method": "notifications/initialized"
        }))
        .unwrap();
        assert!(matches!(
            transport.send(message).await,
            Err(McpError::Transport(_))
        ));
    }
}
