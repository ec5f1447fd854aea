use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// One configured MCP server.
///
/// Descriptors are immutable per call; pooling identity is derived from a
/// subset of these fields (see [`crate::mcp::fingerprint`]), never stored.
#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct ServerDescriptor {
    pub id: String,
    pub name: String,
    /// Transport name: `stdio`, `sse`, `streamable-http`, or `in-process`.
    /// When absent, descriptors with a command and no base URL use stdio,
    /// everything else uses streamable HTTP.
    #[serde(default, alias = "type", alias = "transport")]
    pub kind: Option<String>,
    pub base_url: Option<String>,
    pub command: Option<String>,
    pub args: Option<Vec<String>>,
    pub env: Option<HashMap<String, String>>,
    pub headers: Option<HashMap<String, String>>,
    /// Alternate package index injected into package-runner environments.
    pub registry_url: Option<String>,
    pub timeout_seconds: Option<u64>,
    pub enabled: Option<bool>,
}

impl ServerDescriptor {
    pub fn is_enabled(&self) -> bool {
        self.enabled.unwrap_or(true)
    }

    pub fn args(&self) -> &[String] {
        self.args.as_deref().unwrap_or_default()
    }

    /// Name used in logs; falls back to the id when no display name is set.
    pub fn label(&self) -> &str {
        if self.name.trim().is_empty() {
            &self.id
        } else {
            &self.name
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct OAuthSettings {
    /// Loopback port for the authorization callback listener.
    pub callback_port: Option<u16>,
    pub callback_path: Option<String>,
    pub timeout_seconds: Option<u64>,
    /// Persist OAuth grants in the platform keyring. When disabled, grants
    /// live only for the lifetime of the process.
    pub use_keyring: Option<bool>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct CacheSettings {
    pub tools_ttl_seconds: Option<u64>,
    pub prompts_ttl_seconds: Option<u64>,
    pub resources_ttl_seconds: Option<u64>,
    pub prompt_ttl_seconds: Option<u64>,
    pub resource_ttl_seconds: Option<u64>,
}

#[derive(Debug, Serialize, Deserialize, Default, Clone)]
pub struct Config {
    #[serde(default)]
    pub mcp_servers: Vec<ServerDescriptor>,
    #[serde(default)]
    pub oauth: OAuthSettings,
    #[serde(default)]
    pub cache: CacheSettings,
    /// Upper bound for the liveness ping issued before reusing a session.
    pub health_check_timeout_seconds: Option<u64>,
    /// Default per-request timeout when a descriptor sets none.
    pub request_timeout_seconds: Option<u64>,
    /// Directory holding the app-managed helper binaries (`bun`, `uv`).
    pub bin_dir: Option<PathBuf>,
}

/// Get a user-friendly display string for a path
/// Converts absolute paths to use ~ notation on Unix-like systems when possible
///
/// # Examples
/// - Unix: `/home/user/.config/toolrelay/config.toml` → `~/.config/toolrelay/config.toml`
/// - macOS: `/Users/user/Library/Application Support/...` → `~/Library/Application Support/...`
pub fn path_display<P: AsRef<Path>>(path: P) -> String {
    let path = path.as_ref();

    #[cfg(unix)]
    {
        if let Some(home) = std::env::var_os("HOME") {
            let home_path = PathBuf::from(home);
            if let Ok(relative) = path.strip_prefix(&home_path) {
                return format!("~/{}", relative.display());
            }
        }
    }

    path.display().to_string()
}

impl Config {
    pub fn find_server(&self, id: &str) -> Option<&ServerDescriptor> {
        self.mcp_servers
            .iter()
            .find(|server| server.id.eq_ignore_ascii_case(id))
    }

    pub fn enabled_servers(&self) -> impl Iterator<Item = &ServerDescriptor> {
        self.mcp_servers.iter().filter(|server| server.is_enabled())
    }

    pub fn add_server(&mut self, server: ServerDescriptor) {
        self.remove_server(&server.id);
        self.mcp_servers.push(server);
    }

    pub fn remove_server(&mut self, id: &str) {
        self.mcp_servers
            .retain(|server| !server.id.eq_ignore_ascii_case(id));
    }
}
