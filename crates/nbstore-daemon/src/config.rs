//! Configuration loading and management

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// How served spaces are stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Backend {
    /// One SQLite database per space under the data directory
    Embedded,
    /// One directory of record files per space under the data directory
    NativeFile,
    /// Nothing survives a restart
    Memory,
}

/// Main configuration for the daemon
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DaemonConfig {
    /// Address to accept WebSocket connections on
    #[serde(default = "default_listen")]
    pub listen: String,

    /// Where space data lives
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    #[serde(default = "default_backend")]
    pub backend: Backend,
}

fn default_listen() -> String {
    "127.0.0.1:3010".to_string()
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}

fn default_backend() -> Backend {
    Backend::NativeFile
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            data_dir: default_data_dir(),
            backend: default_backend(),
        }
    }
}

impl DaemonConfig {
    /// Load configuration from `path`, writing the defaults there if it
    /// doesn't exist yet.
    pub fn load(path: &Path) -> Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {:?}", path))?;
            let config: DaemonConfig = serde_json::from_str(&content)
                .with_context(|| format!("Failed to parse {:?}", path))?;
            tracing::info!("Loaded configuration from {:?}", path);
            Ok(config)
        } else {
            tracing::info!("No config file found at {:?}, using defaults", path);
            let config = DaemonConfig::default();

            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create config directory: {:?}", parent))?;
            }

            let content = serde_json::to_string_pretty(&config)?;
            std::fs::write(path, content)
                .with_context(|| format!("Failed to write default config: {:?}", path))?;
            tracing::info!("Created default config at {:?}", path);

            Ok(config)
        }
    }

    /// In-memory config bound to an ephemeral port.
    pub fn ephemeral() -> Self {
        Self {
            listen: "127.0.0.1:0".to_string(),
            data_dir: default_data_dir(),
            backend: Backend::Memory,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_writes_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("daemon.json");

        let config = DaemonConfig::load(&path).unwrap();
        assert_eq!(config, DaemonConfig::default());
        assert!(path.exists());

        // Written defaults load back unchanged.
        assert_eq!(DaemonConfig::load(&path).unwrap(), config);
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("daemon.json");
        std::fs::write(&path, r#"{"backend":"embedded","dataDir":"/srv/spaces"}"#).unwrap();

        let config = DaemonConfig::load(&path).unwrap();
        assert_eq!(config.backend, Backend::Embedded);
        assert_eq!(config.data_dir, PathBuf::from("/srv/spaces"));
        assert_eq!(config.listen, "127.0.0.1:3010");
    }

    #[test]
    fn test_malformed_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("daemon.json");
        std::fs::write(&path, "{ not json").unwrap();
        assert!(DaemonConfig::load(&path).is_err());
    }
}
