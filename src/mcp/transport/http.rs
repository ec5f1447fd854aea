//! Request plumbing shared by the SSE and streamable HTTP transports.

use std::collections::HashMap;
use std::time::Duration;

use reqwest::header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE};
use reqwest::{RequestBuilder, Response, StatusCode, Url};
use tracing::warn;

use crate::core::config::ServerDescriptor;
use crate::mcp::error::McpError;
use crate::mcp::oauth::SharedAuthorizationProvider;

pub const JSON: &str = "application/json";
pub const EVENT_STREAM: &str = "text/event-stream";
pub const JSON_OR_EVENT_STREAM: &str = "application/json, text/event-stream";
pub const PROTOCOL_VERSION_HEADER: &str = "MCP-Protocol-Version";
pub const SESSION_ID_HEADER: &str = "mcp-session-id";

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(90);
const POOL_MAX_IDLE_PER_HOST: usize = 8;

/// Client shared by every HTTP transport the factory creates.
///
/// There is no overall request timeout: event streams stay open for the
/// life of a session, and request deadlines belong to the session layer.
pub fn build_mcp_http_client() -> Result<reqwest::Client, McpError> {
    reqwest::Client::builder()
        .connect_timeout(CONNECT_TIMEOUT)
        .pool_idle_timeout(POOL_IDLE_TIMEOUT)
        .pool_max_idle_per_host(POOL_MAX_IDLE_PER_HOST)
        .build()
        .map_err(|err| McpError::Configuration(format!("Unable to build HTTP client: {err}")))
}

pub fn require_http_base_url(descriptor: &ServerDescriptor) -> Result<Url, McpError> {
    let raw = descriptor
        .base_url
        .as_deref()
        .map(str::trim)
        .filter(|url| !url.is_empty())
        .ok_or_else(|| {
            McpError::Configuration(format!(
                "MCP server '{}' needs a base_url for HTTP transports.",
                descriptor.id
            ))
        })?;
    Url::parse(raw)
        .map_err(|err| McpError::Configuration(format!("Invalid MCP base_url {raw}: {err}")))
}

/// MCP-specific headers on a request builder.
pub trait McpRequestExt: Sized {
    /// `Content-Type` and `Accept` for a JSON-RPC POST that may be answered
    /// with either JSON or an event stream.
    fn mcp_post(self) -> Self;
    fn mcp_protocol_version(self, version: Option<&str>) -> Self;
    fn mcp_session(self, session_id: Option<&str>) -> Self;
    fn extra_headers(self, headers: &HashMap<String, String>) -> Self;
}

impl McpRequestExt for RequestBuilder {
    fn mcp_post(self) -> Self {
        self.header(CONTENT_TYPE, JSON)
            .header(ACCEPT, JSON_OR_EVENT_STREAM)
    }

    fn mcp_protocol_version(self, version: Option<&str>) -> Self {
        match version.map(str::trim).filter(|version| !version.is_empty()) {
            Some(version) => self.header(PROTOCOL_VERSION_HEADER, version),
            None => self,
        }
    }

    fn mcp_session(self, session_id: Option<&str>) -> Self {
        match session_id {
            Some(session_id) => self.header(SESSION_ID_HEADER, session_id),
            None => self,
        }
    }

    fn extra_headers(self, headers: &HashMap<String, String>) -> Self {
        headers
            .iter()
            .fold(self, |request, (name, value)| request.header(name, value))
    }
}

/// Client, configured headers, and optional OAuth provider for one server.
#[derive(Clone)]
pub struct HttpChannel {
    client: reqwest::Client,
    headers: HashMap<String, String>,
    auth: Option<SharedAuthorizationProvider>,
}

impl HttpChannel {
    pub fn new(
        client: reqwest::Client,
        headers: HashMap<String, String>,
        auth: Option<SharedAuthorizationProvider>,
    ) -> Self {
        Self {
            client,
            headers,
            auth,
        }
    }

    pub fn get(&self, url: Url) -> RequestBuilder {
        self.client.get(url).extra_headers(&self.headers)
    }

    pub fn post(&self, url: Url) -> RequestBuilder {
        self.client.post(url).extra_headers(&self.headers)
    }

    pub fn delete(&self, url: Url) -> RequestBuilder {
        self.client.delete(url).extra_headers(&self.headers)
    }

    /// Attach the bearer token, send, and map failures onto [`McpError`].
    /// A 401 becomes [`McpError::Unauthorized`] so the registry can run the
    /// OAuth flow.
    pub async fn execute(&self, request: RequestBuilder, context: &str) -> Result<Response, McpError> {
        let request = match &self.auth {
            Some(provider) => match provider.authorization_header().await {
                Some(value) => request.header(AUTHORIZATION, value),
                None => request,
            },
            None => request,
        };
        let response = request
            .send()
            .await
            .map_err(|err| McpError::Connection(format!("{context}: {err}")))?;
        check_status(response, context).await
    }
}

async fn check_status(response: Response, context: &str) -> Result<Response, McpError> {
    let status = response.status();
    if status == StatusCode::UNAUTHORIZED {
        return Err(McpError::Unauthorized(format!("{context}: HTTP {status}")));
    }
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    if !body.trim().is_empty() {
        warn!(status = %status, body = %body.trim(), "MCP HTTP request rejected");
    }
    Err(McpError::Transport(format!("{context}: HTTP error: {status}")))
}

/// Value of a response header, when present and valid ASCII.
pub fn header_value<'a>(response: &'a Response, name: &str) -> Option<&'a str> {
    response
        .headers()
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn built(request: RequestBuilder) -> reqwest::Request {
        request.build().expect("request builds")
    }

    #[test]
    fn blank_protocol_version_is_not_sent() {
        let client = reqwest::Client::new();
        let request = built(client.post("https://example.com").mcp_protocol_version(Some("  ")));
        assert!(request.headers().get(PROTOCOL_VERSION_HEADER).is_none());
    }

    #[test]
    fn post_carries_negotiation_headers() {
        let client = reqwest::Client::new();
        let request = built(
            client
                .post("https://example.com")
                .mcp_post()
                .mcp_protocol_version(Some("2025-11-25"))
                .mcp_session(Some("abc")),
        );
        let headers = request.headers();
        assert_eq!(headers[ACCEPT], JSON_OR_EVENT_STREAM);
        assert_eq!(headers[CONTENT_TYPE], JSON);
        assert_eq!(headers[PROTOCOL_VERSION_HEADER], "2025-11-25");
        assert_eq!(headers[SESSION_ID_HEADER], "abc");
    }

    #[test]
    fn channel_forwards_configured_headers() {
        let channel = HttpChannel::new(
            reqwest::Client::new(),
            HashMap::from([("X-Api-Key".to_string(), "secret".to_string())]),
            None,
        );
        let url = Url::parse("https://example.com/mcp").expect("url");
        assert_eq!(built(channel.get(url.clone())).headers()["x-api-key"], "secret");
        assert_eq!(built(channel.delete(url)).headers()["x-api-key"], "secret");
    }

    #[test]
    fn base_url_is_required_and_validated() {
        let mut descriptor = ServerDescriptor {
            id: "remote".to_string(),
            ..Default::default()
        };
        let err = require_http_base_url(&descriptor).expect_err("missing");
        assert!(err.is_configuration());
        assert!(err.to_string().contains("'remote'"));

        descriptor.base_url = Some("not a url".to_string());
        assert!(require_http_base_url(&descriptor)
            .expect_err("invalid")
            .is_configuration());

        descriptor.base_url = Some(" https://example.com/mcp ".to_string());
        assert_eq!(require_http_base_url(&descriptor).expect("valid").path(), "/mcp");
    }
}
