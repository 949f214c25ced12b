//! Device configuration
//!
//! Loaded from TOML, overridden by environment and CLI flags. Out-of-range
//! values never fail startup: [`DeviceConfig::sanitized`] clamps them so an
//! unattended device keeps running.

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable overriding the device identity
pub const DEVICE_ID_ENV: &str = "DEVICE_ID";
/// Environment variable overriding the ingest endpoint
pub const INGEST_URL_ENV: &str = "INGEST_URL";

/// What a bounded outbox does when it is full
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OverflowPolicy {
    /// Refuse the new record with [`crate::OutboxError::Full`]
    #[default]
    Reject,
    /// Drop the oldest pending record to make room
    EvictOldest,
}

/// Device-side configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Stable device identity
    pub device_id: String,
    /// Ingest endpoint URL
    pub endpoint: String,
    /// Sessions to simulate in one run
    pub sessions: u32,
    /// Minimum session duration (minutes)
    pub min_session_minutes: u32,
    /// Maximum session duration (minutes)
    pub max_session_minutes: u32,
    /// Real milliseconds per tick
    pub tick_interval_ms: u64,
    /// Device seconds credited per tick
    pub tick_seconds: u64,
    /// Emit an update every N ticks
    pub emit_every_ticks: u32,
    /// Probability in [0, 1] that a delivery attempt finds the link down
    pub offline_probability: f64,
    /// Probability in [0, 1] of a simulated server error
    pub server_error_probability: f64,
    /// Max records delivered per flush cycle
    pub batch_size: usize,
    /// Flush period (ms)
    pub flush_interval_ms: u64,
    /// Tick jitter bound (± ms)
    pub jitter_ms: u64,
    /// RNG seed; `None` seeds from entropy
    pub seed: Option<u64>,
    /// Verbose per-record logging
    pub verbose: bool,
    /// Fixed per-request timeout (ms)
    pub request_timeout_ms: u64,
    /// Pause between drain rounds at shutdown (ms)
    pub drain_backoff_ms: u64,
    /// Upper bound on drain rounds at shutdown
    pub drain_max_rounds: u32,
    /// Durable outbox journal; in-memory when unset
    pub outbox_path: Option<PathBuf>,
    /// Outbox capacity; unbounded when unset
    pub outbox_capacity: Option<usize>,
    /// Behaviour of a full bounded outbox
    pub overflow_policy: OverflowPolicy,
    /// Session checkpoint file; no crash recovery when unset
    pub checkpoint_path: Option<PathBuf>,
}

impl DeviceConfig {
    /// Create default configuration
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Load from a TOML file
    ///
    /// # Errors
    /// - `ConfigError::Read` if the file cannot be read
    /// - `ConfigError::Parse` if it is not valid TOML for this schema
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Apply `DEVICE_ID` / `INGEST_URL` overrides when set and non-empty
    #[must_use]
    pub fn with_env_overrides(mut self) -> Self {
        if let Some(id) = non_empty_env(DEVICE_ID_ENV) {
            self.device_id = id;
        }
        if let Some(url) = non_empty_env(INGEST_URL_ENV) {
            self.endpoint = url;
        }
        self
    }

    /// With device identity
    #[inline]
    #[must_use]
    pub fn with_device_id(mut self, device_id: impl Into<String>) -> Self {
        self.device_id = device_id.into();
        self
    }

    /// With ingest endpoint
    #[inline]
    #[must_use]
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    /// With RNG seed
    #[inline]
    #[must_use]
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Clamp every value into its operating range
    ///
    /// Each correction is logged at `warn` level.
    #[must_use]
    pub fn sanitized(mut self) -> Self {
        let defaults = Self::default();

        if self.device_id.trim().is_empty() {
            tracing::warn!("empty device id, using {}", defaults.device_id);
            self.device_id = defaults.device_id;
        }
        clamp_min(&mut self.sessions, 1, "sessions");
        clamp_min(&mut self.min_session_minutes, 1, "min_session_minutes");
        if self.max_session_minutes < self.min_session_minutes {
            tracing::warn!(
                "max_session_minutes {} below minimum {}, raising",
                self.max_session_minutes,
                self.min_session_minutes
            );
            self.max_session_minutes = self.min_session_minutes;
        }
        clamp_min(&mut self.tick_interval_ms, 1, "tick_interval_ms");
        clamp_min(&mut self.tick_seconds, 1, "tick_seconds");
        clamp_min(&mut self.emit_every_ticks, 1, "emit_every_ticks");
        clamp_probability(&mut self.offline_probability, "offline_probability");
        clamp_probability(&mut self.server_error_probability, "server_error_probability");
        clamp_min(&mut self.batch_size, 1, "batch_size");
        clamp_min(&mut self.flush_interval_ms, 1, "flush_interval_ms");
        clamp_min(&mut self.request_timeout_ms, 1, "request_timeout_ms");
        clamp_min(&mut self.drain_max_rounds, 1, "drain_max_rounds");
        if self.outbox_capacity == Some(0) {
            tracing::warn!("outbox_capacity 0 is unusable, clamping to 1");
            self.outbox_capacity = Some(1);
        }
        self
    }

    /// Emission interval in device seconds
    #[inline]
    #[must_use]
    pub fn emit_interval_seconds(&self) -> u64 {
        self.tick_seconds
            .max(1)
            .saturating_mul(u64::from(self.emit_every_ticks.max(1)))
    }

    /// Tick pacing
    #[inline]
    #[must_use]
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    /// Flush period
    #[inline]
    #[must_use]
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    /// Per-request timeout
    #[inline]
    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Backoff between drain rounds
    #[inline]
    #[must_use]
    pub fn drain_backoff(&self) -> Duration {
        Duration::from_millis(self.drain_backoff_ms)
    }
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            device_id: "airplane-N20503".to_string(),
            endpoint: "http://127.0.0.1:8080/ingest".to_string(),
            sessions: 5,
            min_session_minutes: 5,
            max_session_minutes: 60,
            tick_interval_ms: 200,
            tick_seconds: 60,
            emit_every_ticks: 1,
            offline_probability: 0.2,
            server_error_probability: 0.1,
            batch_size: 8,
            flush_interval_ms: 400,
            jitter_ms: 75,
            seed: None,
            verbose: false,
            request_timeout_ms: 8_000,
            drain_backoff_ms: 200,
            drain_max_rounds: 64,
            outbox_path: None,
            outbox_capacity: None,
            overflow_policy: OverflowPolicy::Reject,
            checkpoint_path: None,
        }
    }
}

fn non_empty_env(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn clamp_min<T>(value: &mut T, min: T, name: &str)
where
    T: PartialOrd + Copy + std::fmt::Display,
{
    if *value < min {
        tracing::warn!("{name} {value} below minimum, clamping to {min}");
        *value = min;
    }
}

fn clamp_probability(value: &mut f64, name: &str) {
    let clamped = if value.is_nan() { 0.0 } else { value.clamp(0.0, 1.0) };
    if (clamped - *value).abs() > f64::EPSILON || value.is_nan() {
        tracing::warn!("{name} {value} outside [0, 1], clamping to {clamped}");
        *value = clamped;
    }
}
