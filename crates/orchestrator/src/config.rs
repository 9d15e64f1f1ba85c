//! `notebookd` configuration.
//!
//! Read from `~/.config/notebookd/config.json` (or `--config`). A missing file
//! means defaults; missing fields take their default values.

use std::path::{Path, PathBuf};
use std::time::Duration;

use kernel_host::HostConfig;
use notebook_client::ClientConfig;
use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Gateway process to supervise.
    pub gateway: HostConfig,
    /// How long each shutdown step waits for the gateway tree to exit.
    pub shutdown_grace_ms: u64,
    /// Liveness poll interval during shutdown.
    pub shutdown_poll_ms: u64,
    /// Settings handed to notebook clients.
    pub client: ClientConfig,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            gateway: HostConfig::default(),
            shutdown_grace_ms: 5000,
            shutdown_poll_ms: 100,
            client: ClientConfig::default(),
        }
    }
}

impl OrchestratorConfig {
    /// Load from `path`, falling back to defaults if it does not exist.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = match std::fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                log::debug!("[orchestrator] No config at {:?}; using defaults", path);
                return Ok(Self::default());
            }
            Err(source) => {
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };
        serde_json::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    pub fn shutdown_poll(&self) -> Duration {
        Duration::from_millis(self.shutdown_poll_ms.max(1))
    }
}

/// `~/.config/notebookd/config.json` (platform config dir).
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("notebookd")
        .join("config.json")
}
