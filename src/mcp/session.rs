//! One initialized MCP connection over one transport.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rust_mcp_schema::schema_utils::{
    ClientMessage, FromMessage, MessageFromClient, NotificationFromClient, RequestFromClient,
    ServerMessage,
};
use rust_mcp_schema::{
    CallToolRequestParams, GetPromptRequestParams, InitializeResult, PaginatedRequestParams,
    Prompt, ReadResourceRequestParams, RequestId, Resource, RpcError, Tool,
};
use serde_json::{json, Map, Value};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::core::config::ServerDescriptor;
use crate::mcp::error::McpError;
use crate::mcp::protocol::{
    describe_rpc_error, initialize_params, is_method_not_found, parse_initialize_result,
    parse_response, ListPage, PromptOutcome, PromptsPage, ResourceOutcome, ResourcesPage,
    ToolCallOutcome, ToolsPage, MCP_MAX_LIST_PAGES,
};
use crate::mcp::transport::McpTransport;

type PendingMap = Arc<Mutex<HashMap<RequestId, oneshot::Sender<ServerMessage>>>>;

pub struct Session {
    fingerprint: String,
    server_id: String,
    transport: Arc<dyn McpTransport>,
    pending: PendingMap,
    next_request_id: AtomicI64,
    request_timeout: Duration,
    server_details: OnceLock<InitializeResult>,
    created_at: DateTime<Utc>,
    reader: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

/// Removes a pending entry when the waiting request is dropped or times out.
struct PendingGuard<'a> {
    pending: &'a PendingMap,
    id: RequestId,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        if let Ok(mut pending) = self.pending.lock() {
            pending.remove(&self.id);
        }
    }
}

impl Session {
    /// Connect the transport, start routing inbound messages and run the
    /// initialize handshake. The transport is closed again when any step
    /// fails.
    pub async fn connect(
        fingerprint: impl Into<String>,
        descriptor: &ServerDescriptor,
        transport: Arc<dyn McpTransport>,
        request_timeout: Duration,
    ) -> Result<Self, McpError> {
        if let Err(err) = transport.connect().await {
            let _ = transport.close().await;
            return Err(err);
        }
        let session = Self {
            fingerprint: fingerprint.into(),
            server_id: descriptor.id.clone(),
            transport,
            pending: Arc::new(Mutex::new(HashMap::new())),
            next_request_id: AtomicI64::new(1),
            request_timeout,
            server_details: OnceLock::new(),
            created_at: Utc::now(),
            reader: Mutex::new(None),
            closed: AtomicBool::new(false),
        };
        session.spawn_reader();

        match session.initialize().await {
            Ok(()) => Ok(session),
            Err(err) => {
                let _ = session.close().await;
                Err(err)
            }
        }
    }

    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    pub fn server_id(&self) -> &str {
        &self.server_id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn server_info(&self) -> Option<&InitializeResult> {
        self.server_details.get()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn spawn_reader(&self) {
        let transport = Arc::clone(&self.transport);
        let pending = Arc::clone(&self.pending);
        let server_id = self.server_id.clone();
        let handle = tokio::spawn(async move {
            while let Some(message) = transport.receive().await {
                dispatch_message(&pending, transport.as_ref(), &server_id, message).await;
            }
            debug!(server_id = %server_id, "MCP session inbound channel closed");
            if let Ok(mut pending) = pending.lock() {
                pending.clear();
            }
        });
        if let Ok(mut reader) = self.reader.lock() {
            *reader = Some(handle);
        }
    }

    async fn initialize(&self) -> Result<(), McpError> {
        let response = self
            .request(RequestFromClient::InitializeRequest(initialize_params()))
            .await?;
        let result = parse_initialize_result(response)?;
        debug!(
            server_id = %self.server_id,
            server = %result.server_info.name,
            protocol_version = %result.protocol_version,
            "MCP session initialized"
        );
        self.transport.set_protocol_version(&result.protocol_version);
        let _ = self.server_details.set(result);
        self.notify(NotificationFromClient::InitializedNotification(None))
            .await
    }

    fn next_request_id(&self) -> RequestId {
        RequestId::Integer(self.next_request_id.fetch_add(1, Ordering::SeqCst))
    }

    async fn send_request(&self, request: RequestFromClient) -> Result<ServerMessage, McpError> {
        if self.is_closed() {
            return Err(McpError::Connection("MCP session closed.".to_string()));
        }
        let request_id = self.next_request_id();
        let message = ClientMessage::from_message(
            MessageFromClient::RequestFromClient(request),
            Some(request_id.clone()),
        )
        .map_err(|err| McpError::Protocol(err.to_string()))?;

        let (tx, rx) = oneshot::channel();
        if let Ok(mut pending) = self.pending.lock() {
            pending.insert(request_id.clone(), tx);
        }
        let _guard = PendingGuard {
            pending: &self.pending,
            id: request_id.clone(),
        };

        debug!(server_id = %self.server_id, request_id = ?request_id, "Sending MCP request");
        self.transport.send(message).await?;
        rx.await
            .map_err(|_| McpError::Connection("MCP connection closed before responding.".to_string()))
    }

    /// Send a request and wait for its response within the session's
    /// request timeout.
    async fn request(&self, request: RequestFromClient) -> Result<ServerMessage, McpError> {
        tokio::time::timeout(self.request_timeout, self.send_request(request))
            .await
            .map_err(|_| {
                McpError::Transport(format!(
                    "MCP request timed out after {}s.",
                    self.request_timeout.as_secs()
                ))
            })?
    }

    async fn notify(&self, notification: NotificationFromClient) -> Result<(), McpError> {
        let message =
            ClientMessage::from_message(MessageFromClient::NotificationFromClient(notification), None)
                .map_err(|err| McpError::Protocol(err.to_string()))?;
        self.transport.send(message).await
    }

    /// Liveness probe. Exceeding `timeout` is reported as
    /// [`McpError::HealthCheckTimeout`].
    pub async fn ping(&self, timeout: Duration) -> Result<(), McpError> {
        let response = tokio::time::timeout(
            timeout,
            self.send_request(RequestFromClient::PingRequest(None)),
        )
        .await
        .map_err(|_| McpError::HealthCheckTimeout { timeout })??;
        match response {
            ServerMessage::Error(error) => Err(McpError::Protocol(describe_rpc_error(&error.error))),
            _ => Ok(()),
        }
    }

    async fn list_all<P, F>(&self, method: &str, build: F) -> Result<Vec<P::Item>, McpError>
    where
        P: ListPage,
        F: Fn(Option<PaginatedRequestParams>) -> RequestFromClient,
    {
        let mut items = Vec::new();
        let mut cursor: Option<String> = None;
        for _ in 0..MCP_MAX_LIST_PAGES {
            let params = cursor.take().map(|cursor| PaginatedRequestParams {
                cursor: Some(cursor),
                meta: None,
            });
            let response = self.request(build(params)).await?;
            if is_method_not_found(&response) {
                debug!(server_id = %self.server_id, method = %method, "Server does not implement listing");
                return Ok(items);
            }
            let page: P = parse_response(response)?;
            let (mut page_items, next_cursor) = page.into_parts();
            items.append(&mut page_items);
            match next_cursor.filter(|cursor| !cursor.trim().is_empty()) {
                Some(next) => cursor = Some(next),
                None => return Ok(items),
            }
        }
        warn!(
            server_id = %self.server_id,
            method = %method,
            pages = MCP_MAX_LIST_PAGES,
            "MCP listing truncated at page limit"
        );
        Ok(items)
    }

    pub async fn list_tools(&self) -> Result<Vec<Tool>, McpError> {
        self.list_all::<ToolsPage, _>("tools/list", RequestFromClient::ListToolsRequest)
            .await
    }

    pub async fn list_prompts(&self) -> Result<Vec<Prompt>, McpError> {
        self.list_all::<PromptsPage, _>("prompts/list", RequestFromClient::ListPromptsRequest)
            .await
    }

    pub async fn list_resources(&self) -> Result<Vec<Resource>, McpError> {
        self.list_all::<ResourcesPage, _>(
            "resources/list",
            RequestFromClient::ListResourcesRequest,
        )
        .await
    }

    pub async fn call_tool(
        &self,
        name: &str,
        arguments: Map<String, Value>,
    ) -> Result<ToolCallOutcome, McpError> {
        let params = CallToolRequestParams::new(name).with_arguments(arguments);
        let response = self
            .request(RequestFromClient::CallToolRequest(params))
            .await?;
        parse_response(response)
    }

    pub async fn get_prompt(
        &self,
        name: &str,
        arguments: Option<HashMap<String, String>>,
    ) -> Result<PromptOutcome, McpError> {
        let params = GetPromptRequestParams {
            name: name.to_string(),
            arguments,
            meta: None,
        };
        let response = self
            .request(RequestFromClient::GetPromptRequest(params))
            .await?;
        parse_response(response)
    }

    pub async fn read_resource(&self, uri: &str) -> Result<ResourceOutcome, McpError> {
        let params = ReadResourceRequestParams {
            meta: None,
            uri: uri.to_string(),
        };
        let response = self
            .request(RequestFromClient::ReadResourceRequest(params))
            .await?;
        parse_response(response)
    }

    /// Close the transport and stop routing. Safe to call more than once.
    pub async fn close(&self) -> Result<(), McpError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let result = self.transport.close().await;
        let reader = self.reader.lock().ok().and_then(|mut guard| guard.take());
        if let Some(reader) = reader {
            reader.abort();
        }
        if let Ok(mut pending) = self.pending.lock() {
            pending.clear();
        }
        debug!(server_id = %self.server_id, "MCP session closed");
        result
    }
}

async fn dispatch_message(
    pending: &PendingMap,
    transport: &dyn McpTransport,
    server_id: &str,
    message: ServerMessage,
) {
    match &message {
        ServerMessage::Response(response) => {
            debug!(server_id = %server_id, response_id = ?response.id, "Received MCP response");
            let waiter = pending
                .lock()
                .ok()
                .and_then(|mut pending| pending.remove(&response.id));
            if let Some(tx) = waiter {
                let _ = tx.send(message);
            }
        }
        ServerMessage::Error(error) => {
            debug!(
                server_id = %server_id,
                error_id = ?error.id,
                error_code = error.error.code,
                "Received MCP error"
            );
            let waiter = error.id.as_ref().and_then(|id| {
                pending
                    .lock()
                    .ok()
                    .and_then(|mut pending| pending.remove(id))
            });
            if let Some(tx) = waiter {
                let _ = tx.send(message);
            }
        }
        ServerMessage::Request(request) => {
            let method = request.method().to_string();
            let request_id = request.request_id().clone();
            debug!(
                server_id = %server_id,
                method = %method,
                request_id = ?request_id,
                "Received MCP server request"
            );
            let reply = if method == "ping" {
                empty_result(&request_id)
            } else {
                ClientMessage::from_message(
                    MessageFromClient::Error(
                        RpcError::method_not_found()
                            .with_message(format!("Client does not support {method}")),
                    ),
                    Some(request_id),
                )
                .map_err(|err| err.to_string())
            };
            match reply {
                Ok(reply) => {
                    if let Err(err) = transport.send(reply).await {
                        warn!(server_id = %server_id, error = %err, "Failed to answer MCP server request");
                    }
                }
                Err(err) => {
                    warn!(server_id = %server_id, error = %err, "Failed to build MCP reply");
                }
            }
        }
        ServerMessage::Notification(_) => {
            debug!(server_id = %server_id, "Received MCP notification");
        }
    }
}

fn empty_result(request_id: &RequestId) -> Result<ClientMessage, String> {
    serde_json::from_value(json!({
        "jsonrpc": "2.0",
        "id": request_id,
        "result": {}
    }))
    .map_err(|err| err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcp::test_support::{connect_scripted, ScriptedServer};

    #[tokio::test]
    async fn initialize_records_server_details() {
        let server = Arc::new(ScriptedServer::new("alpha"));
        let session = connect_scripted(&server, "alpha").await;
        let details = session.server_info().expect("initialized");
        assert_eq!(details.server_info.name, "alpha");
        assert!(!details.protocol_version.is_empty());
        assert_eq!(session.server_id(), "alpha");
        assert!(session.created_at() <= Utc::now());
    }

    #[tokio::test]
    async fn discovery_and_invocation_round_trip() {
        let server = Arc::new(ScriptedServer::new("alpha"));
        let session = connect_scripted(&server, "alpha").await;

        let tools = session.list_tools().await.expect("tools");
        assert_eq!(
            tools.iter().map(|tool| tool.name.as_str()).collect::<Vec<_>>(),
            vec!["echo", "fail"]
        );

        let mut args = Map::new();
        args.insert("text".to_string(), json!("hello"));
        let outcome = session.call_tool("echo", args).await.expect("call");
        assert_eq!(outcome.content[0]["text"], "hello");
        assert_ne!(outcome.is_error, Some(true));

        let prompt = session
            .get_prompt("greet", Some(HashMap::from([("name".to_string(), "Ada".to_string())])))
            .await
            .expect("prompt");
        assert_eq!(prompt.messages.len(), 1);

        let resource = session
            .read_resource("memo://one")
            .await
            .expect("resource");
        assert_eq!(resource.contents[0]["uri"], "memo://one");
    }

    #[tokio::test]
    async fn listings_follow_cursors() {
        let server = Arc::new(ScriptedServer::new("alpha").with_paged_resources(3));
        let session = connect_scripted(&server, "alpha").await;
        let resources = session.list_resources().await.expect("resources");
        assert_eq!(resources.len(), 3);
    }

    #[tokio::test]
    async fn method_not_found_means_empty_listing() {
        let server = Arc::new(ScriptedServer::new("bare").without_prompts());
        let session = connect_scripted(&server, "bare").await;
        assert!(session.list_prompts().await.expect("prompts").is_empty());
    }

    #[tokio::test]
    async fn ping_times_out_when_server_stalls() {
        let server = Arc::new(ScriptedServer::new("alpha"));
        let session = connect_scripted(&server, "alpha").await;
        session.ping(Duration::from_secs(1)).await.expect("healthy");

        server.stall_pings(true);
        let err = session
            .ping(Duration::from_millis(50))
            .await
            .expect_err("stalled");
        assert!(matches!(err, McpError::HealthCheckTimeout { .. }));
    }

    /// Transport whose connect always fails, counting close calls.
    #[derive(Default)]
    struct RefusingTransport {
        closes: std::sync::atomic::AtomicUsize,
    }

    #[async_trait::async_trait]
    impl McpTransport for RefusingTransport {
        fn kind(&self) -> crate::mcp::transport::McpTransportKind {
            crate::mcp::transport::McpTransportKind::Sse
        }

        async fn connect(&self) -> Result<(), McpError> {
            Err(McpError::Connection("stream refused".to_string()))
        }

        async fn send(&self, _message: ClientMessage) -> Result<(), McpError> {
            Err(McpError::Transport("not connected".to_string()))
        }

        async fn receive(&self) -> Option<ServerMessage> {
            None
        }

        async fn close(&self) -> Result<(), McpError> {
            self.closes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn failed_connect_closes_the_transport() {
        let transport = Arc::new(RefusingTransport::default());
        let descriptor = ServerDescriptor {
            id: "legacy".to_string(),
            ..Default::default()
        };
        let err = Session::connect(
            "fp",
            &descriptor,
            Arc::clone(&transport) as Arc<dyn McpTransport>,
            Duration::from_secs(1),
        )
        .await
        .err()
        .expect("connect fails");
        assert!(matches!(err, McpError::Connection(_)));
        assert_eq!(transport.closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn closed_session_rejects_requests() {
        let server = Arc::new(ScriptedServer::new("alpha"));
        let session = connect_scripted(&server, "alpha").await;
        session.close().await.expect("close");
        session.close().await.expect("second close is a no-op");
        assert!(session.is_closed());
        assert!(matches!(
            session.list_tools().await,
            Err(McpError::Connection(_))
        ));
    }
}
