//! Error types for uptrack core
//!
//! Three classes of failure:
//! - Transient delivery failures (always retried by the flush scheduler)
//! - Local queue exhaustion / storage failures (reported, never silent)
//! - Configuration problems (files only; bad values are clamped instead)

use std::path::PathBuf;

/// Main uptrack error type
#[derive(Debug, thiserror::Error)]
pub enum UptrackError {
    /// Outbox failure
    #[error("outbox error: {0}")]
    Outbox(#[from] OutboxError),

    /// Delivery failure
    #[error("delivery error: {0}")]
    Delivery(#[from] DeliveryError),

    /// Session lifecycle misuse
    #[error("session error: {0}")]
    Session(#[from] SessionError),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Checkpoint persistence error
    #[error("checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),
}

impl UptrackError {
    /// Check if error is retryable
    #[inline]
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Delivery(e) => e.is_retryable(),
            Self::Outbox(e) => e.is_retryable(),
            Self::Session(_) | Self::Config(_) | Self::Checkpoint(_) => false,
        }
    }
}

/// Single delivery attempt failures
///
/// The transport makes no retriable/fatal distinction; every variant leaves
/// the record queued for the next flush.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DeliveryError {
    /// Device has no link (simulated or detected)
    #[error("device offline")]
    Offline,

    /// Injected server-side failure
    #[error("simulated server failure")]
    SimulatedServerFailure,

    /// Endpoint answered with a non-2xx status
    #[error("server status {0}")]
    Status(u16),

    /// Request exceeded the fixed timeout
    #[error("request timed out after {0}ms")]
    Timeout(u64),

    /// Connection or protocol failure
    #[error("transport failure: {0}")]
    Transport(String),
}

impl DeliveryError {
    /// Every delivery failure is transient from the device's point of view
    #[inline]
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        true
    }
}

/// Outbox storage errors
#[derive(Debug, thiserror::Error)]
pub enum OutboxError {
    /// Bounded outbox with reject policy is full
    #[error("outbox full ({capacity} records pending)")]
    Full {
        /// Configured capacity
        capacity: usize,
    },

    /// Journal I/O failed
    #[error("outbox journal i/o on {path}: {source}")]
    Io {
        /// Journal path
        path: PathBuf,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },

    /// Journal entry could not be decoded
    #[error("outbox journal corrupt at line {line}: {source}")]
    Corrupt {
        /// 1-based line number
        line: usize,
        /// Decode error
        #[source]
        source: serde_json::Error,
    },

    /// Journal entry could not be encoded
    #[error("outbox journal encode failed: {0}")]
    Encode(#[source] serde_json::Error),
}

impl OutboxError {
    /// A full outbox may drain; storage faults do not heal by themselves
    #[inline]
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Full { .. })
    }

    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Session state machine errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    /// `close` was called on an already closed session
    #[error("session already closed")]
    AlreadyClosed,
}

/// Configuration file errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// File could not be read
    #[error("cannot read {path}: {source}")]
    Read {
        /// Config path
        path: PathBuf,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },

    /// File is not valid TOML for the expected schema
    #[error("cannot parse {path}: {source}")]
    Parse {
        /// Config path
        path: PathBuf,
        /// Underlying error
        #[source]
        source: toml::de::Error,
    },
}

/// Session checkpoint errors
#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    /// File I/O failed
    #[error("checkpoint i/o on {path}: {source}")]
    Io {
        /// Checkpoint path
        path: PathBuf,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },

    /// Checkpoint could not be encoded or decoded
    #[error("checkpoint format: {0}")]
    Format(#[from] serde_json::Error),
}
