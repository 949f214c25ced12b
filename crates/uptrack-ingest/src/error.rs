//! Error types for the ingestion side

use std::net::SocketAddr;
use std::path::PathBuf;

/// Top-level server error
#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    /// Store failure
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Configuration failure
    #[error("configuration error: {0}")]
    Config(#[from] IngestConfigError),

    /// Listener could not be bound
    #[error("cannot bind {addr}: {message}")]
    Bind {
        /// Requested address
        addr: SocketAddr,
        /// Server error text
        message: String,
    },
}

/// Rejected payloads; answered with 400
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PayloadError {
    /// Body is not a record
    #[error("malformed body: {0}")]
    Malformed(String),

    /// Required field present but empty
    #[error("empty field: {0}")]
    EmptyField(&'static str),
}

/// Storage failures; answered with 500 so the device retries
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Journal I/O failed
    #[error("journal I/O on {path}: {source}")]
    Io {
        /// Journal file
        path: PathBuf,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },

    /// A journal line before the tail could not be decoded
    #[error("journal corrupt at line {line}: {source}")]
    Corrupt {
        /// 1-based line number
        line: usize,
        /// Decode error
        #[source]
        source: serde_json::Error,
    },

    /// Record could not be encoded
    #[error("encode failed: {0}")]
    Encode(#[from] serde_json::Error),
}

impl StoreError {
    /// Check if the device should retry after this error
    #[inline]
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Io { .. })
    }

    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Config file problems
#[derive(Debug, thiserror::Error)]
pub enum IngestConfigError {
    /// File unreadable
    #[error("cannot read {path}: {source}")]
    Read {
        /// Config file
        path: PathBuf,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },

    /// File is not valid TOML for this config
    #[error("cannot parse {path}: {source}")]
    Parse {
        /// Config file
        path: PathBuf,
        /// Parse error
        #[source]
        source: toml::de::Error,
    },

    /// Listen address is not `host:port`
    #[error("invalid listen address {0:?}")]
    Listen(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_io_is_retryable() {
        let io = StoreError::io("/tmp/x", std::io::Error::other("disk"));
        assert!(io.is_retryable());

        let bad = serde_json::from_str::<u8>("x").unwrap_err();
        assert!(!StoreError::Encode(bad).is_retryable());
    }

    #[test]
    fn payload_errors_name_the_problem() {
        assert_eq!(
            PayloadError::EmptyField("device_identifier").to_string(),
            "empty field: device_identifier"
        );
    }
}
