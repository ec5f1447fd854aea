//! Launch environment for subprocess servers: helper-binary aliasing,
//! the inherited variable whitelist and an enhanced `PATH`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use crate::core::config::ServerDescriptor;
use crate::mcp::error::McpError;
use crate::mcp::transport::stdio::ResolvedCommand;
use crate::mcp::types::InstallInfo;

#[cfg(windows)]
pub const PATH_SEPARATOR: char = ';';
#[cfg(not(windows))]
pub const PATH_SEPARATOR: char = ':';

#[cfg(windows)]
const INHERITED_ENV_VARS: &[&str] = &[
    "APPDATA",
    "HOMEDRIVE",
    "HOMEPATH",
    "LOCALAPPDATA",
    "PATH",
    "PROCESSOR_ARCHITECTURE",
    "SYSTEMDRIVE",
    "SYSTEMROOT",
    "TEMP",
    "USERNAME",
    "USERPROFILE",
];
#[cfg(not(windows))]
const INHERITED_ENV_VARS: &[&str] = &["HOME", "LOGNAME", "PATH", "SHELL", "TERM", "USER"];

const SHELL_PATH_PROBE_TIMEOUT: Duration = Duration::from_secs(10);
const AUTO_INSTALL_SERVER_MARKER: &str = "mcp-auto-install";

const ZSH_PROFILE_SCRIPT: &str = "source /etc/zshenv 2>/dev/null || true; source ~/.zshenv 2>/dev/null || true; source /etc/zprofile 2>/dev/null || true; source ~/.zprofile 2>/dev/null || true; source /etc/zshrc 2>/dev/null || true; source ~/.zshrc 2>/dev/null || true; source /etc/zlogin 2>/dev/null || true; source ~/.zlogin 2>/dev/null || true; echo $PATH";
const BASH_PROFILE_SCRIPT: &str = "source /etc/profile 2>/dev/null || true; source ~/.bash_profile 2>/dev/null || true; source ~/.bash_login 2>/dev/null || true; source ~/.profile 2>/dev/null || true; source ~/.bashrc 2>/dev/null || true; echo $PATH";
const FISH_PROFILE_SCRIPT: &str = "source /etc/fish/config.fish 2>/dev/null; source ~/.config/fish/config.fish 2>/dev/null; string join : $PATH";
const POSIX_PROFILE_SCRIPT: &str =
    ". /etc/profile 2>/dev/null || true; . ~/.profile 2>/dev/null || true; echo $PATH";

static SYSTEM_PATH: OnceCell<Option<String>> = OnceCell::const_new();

/// Platform executable name for a helper binary.
pub fn binary_name(name: &str) -> String {
    if cfg!(windows) {
        format!("{name}.exe")
    } else {
        name.to_string()
    }
}

fn home_dir() -> PathBuf {
    directories::BaseDirs::new()
        .map(|dirs| dirs.home_dir().to_path_buf())
        .unwrap_or_default()
}

/// Command and variables after helper aliasing, before the environment is
/// assembled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AliasedCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
}

/// Resolves descriptors into launchable commands against an app-managed
/// bin directory.
#[derive(Debug, Clone)]
pub struct CommandEnvironment {
    bin_dir: PathBuf,
}

impl CommandEnvironment {
    pub fn new(bin_dir: impl Into<PathBuf>) -> Self {
        Self {
            bin_dir: bin_dir.into(),
        }
    }

    pub fn bin_dir(&self) -> &Path {
        &self.bin_dir
    }

    pub fn binary_path(&self, name: &str) -> PathBuf {
        self.bin_dir.join(binary_name(name))
    }

    pub fn install_info(&self) -> InstallInfo {
        InstallInfo {
            dir: self.bin_dir.clone(),
            uv_path: self.binary_path("uv"),
            bun_path: self.binary_path("bun"),
        }
    }

    fn helper_binary(&self, name: &str) -> Result<PathBuf, McpError> {
        let path = self.binary_path(name);
        if !path.is_file() {
            return Err(McpError::ProcessSpawn {
                command: name.to_string(),
                reason: format!("helper binary not found at {}", path.display()),
            });
        }
        Ok(path)
    }

    /// Map `npx`, `uv` and `uvx` to the app-managed binaries and inject
    /// registry variables.
    pub fn alias(&self, descriptor: &ServerDescriptor) -> Result<AliasedCommand, McpError> {
        let command = descriptor
            .command
            .as_deref()
            .map(str::trim)
            .filter(|command| !command.is_empty())
            .ok_or_else(|| {
                McpError::Configuration("MCP command is required for stdio transports.".to_string())
            })?;
        let mut args = descriptor.args().to_vec();
        let mut env = HashMap::new();
        let registry_url = descriptor
            .registry_url
            .as_deref()
            .map(str::trim)
            .filter(|url| !url.is_empty());

        let program = match command {
            "npx" => {
                let bun = self.helper_binary("bun")?;
                if !args.is_empty() {
                    if !args.iter().any(|arg| arg == "-y") {
                        args.insert(0, "-y".to_string());
                    }
                    if !args.iter().any(|arg| arg == "x") {
                        args.insert(0, "x".to_string());
                    }
                }
                if let Some(registry_url) = registry_url {
                    env.insert("NPM_CONFIG_REGISTRY".to_string(), registry_url.to_string());
                    if descriptor.name.contains(AUTO_INSTALL_SERVER_MARKER) {
                        let registry_path = self
                            .bin_dir
                            .join("..")
                            .join("config")
                            .join("mcp-registry.json");
                        env.insert(
                            "MCP_REGISTRY_PATH".to_string(),
                            registry_path.display().to_string(),
                        );
                    }
                }
                bun
            }
            "uv" | "uvx" => {
                let binary = self.helper_binary(command)?;
                if let Some(registry_url) = registry_url {
                    env.insert("UV_DEFAULT_INDEX".to_string(), registry_url.to_string());
                    env.insert("PIP_INDEX_URL".to_string(), registry_url.to_string());
                }
                binary
            }
            other => PathBuf::from(other),
        };

        Ok(AliasedCommand { program, args, env })
    }

    /// Full launch parameters: whitelisted parent variables, the enhanced
    /// `PATH`, alias variables, then the descriptor's own `env`.
    pub async fn resolve(&self, descriptor: &ServerDescriptor) -> Result<ResolvedCommand, McpError> {
        let aliased = self.alias(descriptor)?;
        let current_path = std::env::var("PATH").unwrap_or_default();
        let system_path = system_path().await.unwrap_or_default();
        let path = enhance_path(
            &system_path,
            &current_path,
            &well_known_dirs(&home_dir(), &self.bin_dir),
            PATH_SEPARATOR,
        );

        let mut env = default_environment();
        env.insert("PATH".to_string(), path);
        env.extend(aliased.env);
        if let Some(overrides) = &descriptor.env {
            env.extend(overrides.clone());
        }
        info!(
            server = %descriptor.label(),
            command = %aliased.program.display(),
            args = ?aliased.args,
            "Resolved MCP stdio command"
        );
        Ok(ResolvedCommand {
            program: aliased.program,
            args: aliased.args,
            env,
        })
    }
}

/// Parent environment restricted to the platform whitelist.
pub fn default_environment() -> HashMap<String, String> {
    INHERITED_ENV_VARS
        .iter()
        .filter_map(|key| {
            std::env::var(key)
                .ok()
                .filter(|value| !value.starts_with("()"))
                .map(|value| (key.to_string(), value))
        })
        .collect()
}

/// Tool directories commonly missing from GUI-launched processes.
pub fn well_known_dirs(home: &Path, bin_dir: &Path) -> Vec<String> {
    let home = home.display();
    let mut dirs: Vec<String> = Vec::new();
    if cfg!(target_os = "macos") {
        dirs.extend(
            [
                "/bin",
                "/usr/bin",
                "/usr/local/bin",
                "/usr/local/sbin",
                "/opt/homebrew/bin",
                "/opt/homebrew/sbin",
                "/usr/local/opt/node/bin",
            ]
            .map(str::to_string),
        );
        dirs.push(format!("{home}/.nvm/current/bin"));
        dirs.push(format!("{home}/.npm-global/bin"));
        dirs.push(format!("{home}/.yarn/bin"));
        dirs.push(format!("{home}/.cargo/bin"));
        dirs.push(bin_dir.display().to_string());
        dirs.push("/opt/local/bin".to_string());
    } else if cfg!(windows) {
        if let Ok(appdata) = std::env::var("APPDATA") {
            dirs.push(format!("{appdata}\\npm"));
        }
        dirs.push(format!("{home}\\AppData\\Local\\Yarn\\bin"));
        dirs.push(format!("{home}\\.cargo\\bin"));
        dirs.push(bin_dir.display().to_string());
    } else {
        dirs.extend(["/bin", "/usr/bin", "/usr/local/bin"].map(str::to_string));
        dirs.push(format!("{home}/.nvm/current/bin"));
        dirs.push(format!("{home}/.npm-global/bin"));
        dirs.push(format!("{home}/.yarn/bin"));
        dirs.push(format!("{home}/.cargo/bin"));
        dirs.push(bin_dir.display().to_string());
        dirs.push("/snap/bin".to_string());
    }
    dirs
}

/// Order-preserving union of the login-shell PATH, the current PATH and
/// `extra` directories.
pub fn enhance_path(
    system_path: &str,
    current_path: &str,
    extra: &[String],
    separator: char,
) -> String {
    let mut seen = std::collections::HashSet::new();
    let mut entries = Vec::new();
    let candidates = system_path
        .split(separator)
        .chain(current_path.split(separator))
        .chain(extra.iter().map(String::as_str));
    for entry in candidates {
        let entry = entry.trim();
        if entry.is_empty() {
            continue;
        }
        if seen.insert(entry.to_string()) {
            entries.push(entry.to_string());
        }
    }
    entries.join(&separator.to_string())
}

/// Shell and script used to print the login PATH.
pub fn shell_path_probe(shell: Option<&str>) -> (String, Vec<String>) {
    if cfg!(windows) {
        return (
            "powershell.exe".to_string(),
            vec!["-Command".to_string(), "$env:PATH".to_string()],
        );
    }
    let shell = shell
        .map(str::trim)
        .filter(|shell| !shell.is_empty())
        .map(str::to_string)
        .unwrap_or_else(fallback_shell);
    let script = if shell.contains("zsh") {
        ZSH_PROFILE_SCRIPT
    } else if shell.contains("bash") {
        BASH_PROFILE_SCRIPT
    } else if shell.contains("fish") {
        FISH_PROFILE_SCRIPT
    } else {
        POSIX_PROFILE_SCRIPT
    };
    (shell, vec!["-c".to_string(), script.to_string()])
}

fn fallback_shell() -> String {
    ["/bin/zsh", "/bin/bash", "/bin/fish"]
        .into_iter()
        .find(|candidate| Path::new(candidate).exists())
        .unwrap_or("/bin/sh")
        .to_string()
}

/// Extract a PATH from probe output. Profile scripts may print banners, so
/// only the last non-empty line counts, and only absolute entries survive.
pub fn parse_shell_path_output(output: &str, separator: char) -> Option<String> {
    let line = output
        .lines()
        .map(str::trim)
        .rfind(|line| !line.is_empty())?;
    if line.contains('\0') {
        return None;
    }
    let entries: Vec<&str> = line
        .split(separator)
        .map(str::trim)
        .filter(|entry| !entry.is_empty() && Path::new(entry).is_absolute())
        .collect();
    if entries.is_empty() {
        return None;
    }
    Some(entries.join(&separator.to_string()))
}

async fn probe_system_path() -> Option<String> {
    let shell_env = std::env::var("SHELL").ok();
    let (shell, args) = shell_path_probe(shell_env.as_deref());
    debug!(shell = %shell, "Probing login shell PATH");
    let mut command = tokio::process::Command::new(&shell);
    command
        .args(&args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true);
    let home = home_dir();
    if home.is_dir() {
        command.current_dir(home);
    }

    let output = match tokio::time::timeout(SHELL_PATH_PROBE_TIMEOUT, command.output()).await {
        Ok(Ok(output)) => output,
        Ok(Err(err)) => {
            warn!(shell = %shell, error = %err, "Failed to probe login shell PATH");
            return None;
        }
        Err(_) => {
            warn!(shell = %shell, "Timed out probing login shell PATH");
            return None;
        }
    };
    if !output.status.success() {
        warn!(shell = %shell, status = %output.status, "Login shell PATH probe failed");
        return None;
    }
    parse_shell_path_output(&String::from_utf8_lossy(&output.stdout), PATH_SEPARATOR)
}

/// Login-shell PATH, probed once per process.
pub async fn system_path() -> Option<String> {
    SYSTEM_PATH.get_or_init(probe_system_path).await.clone()
}
