use crate::core::config::data::{CacheSettings, Config, OAuthSettings};
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_OAUTH_CALLBACK_PORT: u16 = 12346;
pub const DEFAULT_OAUTH_CALLBACK_PATH: &str = "/oauth/callback";
pub const DEFAULT_OAUTH_TIMEOUT_SECONDS: u64 = 300;
pub const DEFAULT_HEALTH_CHECK_TIMEOUT_SECONDS: u64 = 10;
pub const DEFAULT_REQUEST_TIMEOUT_SECONDS: u64 = 60;

pub const DEFAULT_TOOLS_TTL_SECONDS: u64 = 5 * 60;
pub const DEFAULT_PROMPTS_TTL_SECONDS: u64 = 60 * 60;
pub const DEFAULT_RESOURCES_TTL_SECONDS: u64 = 60 * 60;
pub const DEFAULT_PROMPT_TTL_SECONDS: u64 = 30 * 60;
pub const DEFAULT_RESOURCE_TTL_SECONDS: u64 = 30 * 60;

/// Directory under the home dir that holds app-managed helper binaries.
pub const APP_HOME_DIR: &str = ".toolrelay";

impl OAuthSettings {
    pub fn callback_port(&self) -> u16 {
        self.callback_port.unwrap_or(DEFAULT_OAUTH_CALLBACK_PORT)
    }

    pub fn callback_path(&self) -> String {
        let path = self
            .callback_path
            .as_deref()
            .map(str::trim)
            .filter(|path| !path.is_empty())
            .unwrap_or(DEFAULT_OAUTH_CALLBACK_PATH);
        if path.starts_with('/') {
            path.to_string()
        } else {
            format!("/{path}")
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(
            self.timeout_seconds
                .unwrap_or(DEFAULT_OAUTH_TIMEOUT_SECONDS),
        )
    }

    pub fn use_keyring(&self) -> bool {
        self.use_keyring.unwrap_or(true)
    }
}

fn ttl(value: Option<u64>, default: u64) -> Duration {
    Duration::from_secs(value.unwrap_or(default))
}

impl CacheSettings {
    pub fn tools_ttl(&self) -> Duration {
        ttl(self.tools_ttl_seconds, DEFAULT_TOOLS_TTL_SECONDS)
    }

    pub fn prompts_ttl(&self) -> Duration {
        ttl(self.prompts_ttl_seconds, DEFAULT_PROMPTS_TTL_SECONDS)
    }

    pub fn resources_ttl(&self) -> Duration {
        ttl(self.resources_ttl_seconds, DEFAULT_RESOURCES_TTL_SECONDS)
    }

    pub fn prompt_ttl(&self) -> Duration {
        ttl(self.prompt_ttl_seconds, DEFAULT_PROMPT_TTL_SECONDS)
    }

    pub fn resource_ttl(&self) -> Duration {
        ttl(self.resource_ttl_seconds, DEFAULT_RESOURCE_TTL_SECONDS)
    }
}

impl Config {
    pub fn health_check_timeout(&self) -> Duration {
        Duration::from_secs(
            self.health_check_timeout_seconds
                .unwrap_or(DEFAULT_HEALTH_CHECK_TIMEOUT_SECONDS),
        )
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(
            self.request_timeout_seconds
                .unwrap_or(DEFAULT_REQUEST_TIMEOUT_SECONDS),
        )
    }

    /// Resolve the app-managed binary directory, falling back to
    /// `~/.toolrelay/bin`.
    pub fn bin_dir(&self) -> PathBuf {
        if let Some(dir) = &self.bin_dir {
            return dir.clone();
        }
        default_bin_dir()
    }
}

pub fn default_bin_dir() -> PathBuf {
    let home = directories::BaseDirs::new()
        .map(|dirs| dirs.home_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from("."));
    home.join(APP_HOME_DIR).join("bin")
}
