//! Ingestion server configuration

use crate::error::IngestConfigError;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

/// Server settings, loadable from TOML
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    /// `host:port` to bind
    pub listen: String,
    /// JSON-lines journal; volatile when unset
    pub journal_path: Option<PathBuf>,
    /// Devices pre-registered at startup
    pub devices: Vec<String>,
}

impl IngestConfig {
    /// Defaults
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Load from a TOML file
    ///
    /// # Errors
    /// `IngestConfigError::Read` / `Parse`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, IngestConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| IngestConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&raw).map_err(|source| IngestConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Set the bind address
    #[must_use]
    pub fn with_listen(mut self, listen: impl Into<String>) -> Self {
        self.listen = listen.into();
        self
    }

    /// Set the journal path
    #[must_use]
    pub fn with_journal(mut self, path: impl Into<PathBuf>) -> Self {
        self.journal_path = Some(path.into());
        self
    }

    /// Parsed bind address
    ///
    /// # Errors
    /// `IngestConfigError::Listen` if `listen` is not a socket address.
    pub fn socket_addr(&self) -> Result<SocketAddr, IngestConfigError> {
        self.listen
            .parse()
            .map_err(|_| IngestConfigError::Listen(self.listen.clone()))
    }
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:8080".to_string(),
            journal_path: None,
            devices: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_file_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ingest.toml");
        std::fs::write(&path, "devices = [\"airplane-N20503\"]\n").unwrap();

        let config = IngestConfig::load(&path).unwrap();
        assert_eq!(config.listen, "127.0.0.1:8080");
        assert_eq!(config.devices, vec!["airplane-N20503".to_string()]);
    }

    #[test]
    fn bad_listen_address_is_reported() {
        let config = IngestConfig::new().with_listen("nowhere");
        assert!(matches!(config.socket_addr(), Err(IngestConfigError::Listen(_))));
        assert!(IngestConfig::new().socket_addr().is_ok());
    }
}
