use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use directories::ProjectDirs;
use tempfile::NamedTempFile;
use thiserror::Error;

use crate::core::config::data::{path_display, Config};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config at {}: {source}", path_display(.path))]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to parse config at {}: {source}", path_display(.path))]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("Failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),
    #[error("Failed to write config at {}: {source}", path_display(.path))]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl Config {
    /// Load the config at `path`. A missing file yields defaults.
    pub fn load_from_path(path: &Path) -> Result<Config, ConfigError> {
        let contents = match fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Config::default()),
            Err(source) => {
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };
        toml::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Write the config atomically: serialize into a temp file beside
    /// `path`, sync it, then rename over the target.
    pub fn save_to_path(&self, path: &Path) -> Result<(), ConfigError> {
        let contents = toml::to_string_pretty(self)?;
        let write_error = |source| ConfigError::Write {
            path: path.to_path_buf(),
            source,
        };

        let dir = path.parent().filter(|dir| !dir.as_os_str().is_empty());
        let mut staged = match dir {
            Some(dir) => {
                fs::create_dir_all(dir).map_err(write_error)?;
                NamedTempFile::new_in(dir)
            }
            None => NamedTempFile::new(),
        }
        .map_err(write_error)?;
        staged.write_all(contents.as_bytes()).map_err(write_error)?;
        staged.as_file().sync_all().map_err(write_error)?;
        staged
            .persist(path)
            .map_err(|err| write_error(err.error))?;
        Ok(())
    }

    /// Platform config location, or `None` when no home directory can be
    /// determined.
    pub fn default_config_path() -> Option<PathBuf> {
        ProjectDirs::from("org", "toolrelay", "toolrelay")
            .map(|dirs| dirs.config_dir().join("config.toml"))
    }
}
