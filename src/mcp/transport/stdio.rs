use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use rust_mcp_schema::schema_utils::{ClientMessage, ServerMessage};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::{decode_frame, Inbox, McpTransport, McpTransportKind};
use crate::mcp::error::McpError;

const STDIN_LOCK_TIMEOUT: Duration = Duration::from_secs(10);
const STDIN_WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// Fully resolved launch parameters for a subprocess server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
    /// Complete child environment; the parent environment is not inherited.
    pub env: HashMap<String, String>,
}

/// Subprocess transport speaking newline-delimited JSON over stdio.
pub struct StdioTransport {
    server_name: String,
    command: ResolvedCommand,
    child: Mutex<Option<Child>>,
    stdin: Mutex<Option<ChildStdin>>,
    inbox: Inbox,
}

impl StdioTransport {
    pub fn new(server_name: impl Into<String>, command: ResolvedCommand) -> Self {
        Self {
            server_name: server_name.into(),
            command,
            child: Mutex::new(None),
            stdin: Mutex::new(None),
            inbox: Inbox::new(),
        }
    }

    pub fn command(&self) -> &ResolvedCommand {
        &self.command
    }

    fn spawn_stdout_reader(&self, stdout: tokio::process::ChildStdout) {
        let tx = self.inbox.sender();
        let closed = self.inbox.closed_token();
        let server_name = self.server_name.clone();
        tokio::spawn(async move {
            let mut reader = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = reader.next_line().await {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                match decode_frame(line) {
                    Ok(messages) => {
                        for message in messages {
                            let _ = tx.send(message);
                        }
                    }
                    Err(err) => {
                        debug!(server = %server_name, error = %err, "Ignoring non-JSON stdout line");
                    }
                }
            }
            debug!(server = %server_name, "MCP stdio stdout closed");
            closed.cancel();
        });
    }

    fn spawn_stderr_forwarder(&self, stderr: tokio::process::ChildStderr) {
        let server_name = self.server_name.clone();
        tokio::spawn(async move {
            let mut reader = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = reader.next_line().await {
                if !line.trim().is_empty() {
                    info!(server = %server_name, "[stderr] {}", line);
                }
            }
        });
    }
}

#[async_trait]
impl McpTransport for StdioTransport {
    fn kind(&self) -> McpTransportKind {
        McpTransportKind::Stdio
    }

    async fn connect(&self) -> Result<(), McpError> {
        let program = self.command.program.display().to_string();
        debug!(
            server = %self.server_name,
            command = %program,
            args = ?self.command.args,
            "Starting MCP stdio server"
        );
        let mut cmd = Command::new(&self.command.program);
        cmd.args(&self.command.args)
            .env_clear()
            .envs(&self.command.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|err| McpError::ProcessSpawn {
            command: program.clone(),
            reason: err.to_string(),
        })?;
        let spawn_error = |what: &str| McpError::ProcessSpawn {
            command: program.clone(),
            reason: format!("Unable to retrieve {what}."),
        };
        let stdin = child.stdin.take().ok_or_else(|| spawn_error("stdin"))?;
        let stdout = child.stdout.take().ok_or_else(|| spawn_error("stdout"))?;
        let stderr = child.stderr.take().ok_or_else(|| spawn_error("stderr"))?;

        self.spawn_stdout_reader(stdout);
        self.spawn_stderr_forwarder(stderr);
        *self.stdin.lock().await = Some(stdin);
        *self.child.lock().await = Some(child);
        Ok(())
    }

    async fn send(&self, message: ClientMessage) -> Result<(), McpError> {
        let payload =
            serde_json::to_string(&message).map_err(|err| McpError::Protocol(err.to_string()))?;
        let mut guard = tokio::time::timeout(STDIN_LOCK_TIMEOUT, self.stdin.lock())
            .await
            .map_err(|_| {
                McpError::Transport("Timed out waiting for MCP stdio stdin lock.".to_string())
            })?;
        let stdin = guard
            .as_mut()
            .ok_or_else(|| McpError::Transport("MCP stdio transport not connected.".to_string()))?;

        let write = async {
            stdin.write_all(payload.as_bytes()).await?;
            stdin.write_all(b"\n").await?;
            stdin.flush().await
        };
        tokio::time::timeout(STDIN_WRITE_TIMEOUT, write)
            .await
            .map_err(|_| McpError::Transport("Timed out writing MCP stdio message.".to_string()))?
            .map_err(|err| McpError::Transport(err.to_string()))
    }

    async fn receive(&self) -> Option<ServerMessage> {
        self.inbox.receive().await
    }

    async fn close(&self) -> Result<(), McpError> {
        self.inbox.close();
        self.stdin.lock().await.take();
        let child = self.child.lock().await.take();
        if let Some(mut child) = child {
            if let Err(err) = child.kill().await {
                warn!(server = %self.server_name, error = %err, "Failed to stop MCP stdio server");
            } else {
                debug!(server = %self.server_name, "Stopped MCP stdio server");
            }
        }
        Ok(())
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn shell_command(script: &str) -> ResolvedCommand {
        ResolvedCommand {
            program: PathBuf::from("/bin/sh"),
            args: vec!["-c".to_string(), script.to_string()],
            env: HashMap::from([("PATH".to_string(), "/usr/bin:/bin".to_string())]),
        }
    }

    #[tokio::test]
    async fn reads_single_messages_and_batches_from_stdout() {
        let transport = StdioTransport::new(
            "echo",
            shell_command(
                r#"echo 'not json'; echo '{"jsonrpc":"2.0","id":1,"result":{}}'; echo '[{"jsonrpc":"2.0","id":2,"result":{}},{"jsonrpc":"2.0","id":3,"result":{}}]'"#,
            ),
        );
        transport.connect().await.expect("spawn");

        let mut ids = Vec::new();
        while let Some(message) = transport.receive().await {
            if let ServerMessage::Response(response) = message {
                ids.push(response.id);
            }
        }
        assert_eq!(ids.len(), 3);
        transport.close().await.expect("close");
    }

    #[tokio::test]
    async fn missing_program_is_a_spawn_error() {
        let transport = StdioTransport::new(
            "missing",
            ResolvedCommand {
                program: PathBuf::from("/definitely/not/a/binary"),
                args: Vec::new(),
                env: HashMap::new(),
            },
        );
        let err = transport.connect().await.expect_err("spawn should fail");
        assert!(matches!(err, McpError::ProcessSpawn { .. }));
        assert!(err.is_configuration());
    }

    #[tokio::test]
    async fn close_kills_long_running_child() {
        let transport = StdioTransport::new("sleeper", shell_command("sleep 30"));
        transport.connect().await.expect("spawn");
        tokio::time::timeout(Duration::from_secs(5), transport.close())
            .await
            .expect("close should not hang")
            .expect("close");
        assert!(transport.receive().await.is_none());
        assert!(transport.child.lock().await.is_none());
    }
}
