//! Error taxonomy shared by transports, sessions, the registry, and the
//! operation surface.
//!
//! Structural faults ([`McpError::Configuration`], [`McpError::ProcessSpawn`])
//! are returned to callers. Operational faults are absorbed by
//! [`crate::mcp::service::McpService`] and turned into response data.

use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum McpError {
    /// Missing or contradictory descriptor fields.
    #[error("Invalid MCP server configuration: {0}")]
    Configuration(String),

    /// The transport could not be established.
    #[error("MCP connection failed: {0}")]
    Connection(String),

    /// The server demanded authorization before accepting the session.
    #[error("MCP server requires authorization: {0}")]
    Unauthorized(String),

    #[error("MCP health check timed out after {timeout:?}")]
    HealthCheckTimeout { timeout: Duration },

    #[error("OAuth authorization for {server} timed out after {timeout:?}")]
    OAuthTimeout { server: String, timeout: Duration },

    #[error("OAuth authentication failed: {0}")]
    OAuthFailure(String),

    #[error("Tool invocation failed: {0}")]
    ToolInvocation(String),

    #[error("Failed to start MCP server process {command}: {reason}")]
    ProcessSpawn { command: String, reason: String },

    /// Malformed response or a JSON-RPC error returned by the server.
    #[error("{0}")]
    Protocol(String),

    /// I/O failure on an already established channel.
    #[error("MCP transport error: {0}")]
    Transport(String),
}

impl McpError {
    /// True for faults that indicate caller misconfiguration rather than a
    /// runtime condition. These are the only errors the operation surface
    /// lets escape.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            McpError::Configuration(_) | McpError::ProcessSpawn { .. }
        )
    }

    pub fn is_unauthorized(&self) -> bool {
        matches!(self, McpError::Unauthorized(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_structural_faults_count_as_configuration() {
        assert!(McpError::Configuration("no command".into()).is_configuration());
        assert!(McpError::ProcessSpawn {
            command: "bun".into(),
            reason: "missing".into()
        }
        .is_configuration());
        assert!(!McpError::Connection("refused".into()).is_configuration());
        assert!(!McpError::ToolInvocation("boom".into()).is_configuration());
        assert!(!McpError::OAuthFailure("denied".into()).is_configuration());
    }

    #[test]
    fn oauth_timeout_message_names_server() {
        let err = McpError::OAuthTimeout {
            server: "github".into(),
            timeout: Duration::from_secs(300),
        };
        assert_eq!(
            err.to_string(),
            "OAuth authorization for github timed out after 300s"
        );
    }

    #[test]
    fn sub_second_timeouts_keep_their_precision() {
        let err = McpError::OAuthTimeout {
            server: "github".into(),
            timeout: Duration::from_millis(150),
        };
        assert_eq!(
            err.to_string(),
            "OAuth authorization for github timed out after 150ms"
        );
        let err = McpError::HealthCheckTimeout {
            timeout: Duration::from_millis(200),
        };
        assert_eq!(err.to_string(), "MCP health check timed out after 200ms");
    }
}
