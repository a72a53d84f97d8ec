//! Client configuration.
//!
//! Loaded from a TOML file; every field has a default so a missing file or a
//! partial one works. CLI flags may override individual fields after loading.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

const DEFAULT_SOCKET: &str = "/var/run/brume/daemon.sock";

/// Configuration for the Brume client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Unix socket the daemon listens on
    pub daemon_socket: PathBuf,

    /// Daemon executable launched by the lifecycle manager
    pub daemon_binary: PathBuf,

    /// Client data directory: persisted state and extracted resources
    pub data_dir: PathBuf,

    /// Legacy data directory migrated into `data_dir` on startup, if any
    pub legacy_data_dir: Option<PathBuf>,

    /// Directory holding the bundled static resources shipped with the client
    pub resource_dir: Option<PathBuf>,

    /// Default log filter, overridable through `BRUME_LOG`
    pub log_level: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        let data_dir = dirs::data_local_dir()
            .map(|dir| dir.join("brume"))
            .unwrap_or_else(|| PathBuf::from("."));

        ClientConfig {
            daemon_socket: PathBuf::from(DEFAULT_SOCKET),
            daemon_binary: PathBuf::from("brume-daemon"),
            data_dir,
            legacy_data_dir: None,
            resource_dir: None,
            log_level: "info".to_string(),
        }
    }
}

impl ClientConfig {
    /// Load the configuration file at `path`, or the defaults when `path` is
    /// `None`. A named file that does not exist is an error; relying on
    /// defaults is not.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(path) => path,
            None => return Ok(ClientConfig::default()),
        };

        let contents = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;

        toml::from_str(&contents)
            .map_err(|e| Error::Config(format!("Failed to parse {}: {}", path.display(), e)))
    }
}
