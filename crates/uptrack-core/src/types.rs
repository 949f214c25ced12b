//! Core record types
//!
//! Defines the data exchanged between device and collector:
//! - Session status
//! - Dedup keys
//! - Update records (the wire payload)

use chrono::{DateTime, Duration, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle status carried by every update record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    /// Session still running; more records will follow
    Open,
    /// Final record of the session
    Closed,
}

impl SessionStatus {
    /// Wire representation
    #[inline]
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Closed => "closed",
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Deterministic identifier the collector uses to collapse re-deliveries
///
/// Format: `<device_identifier>:<session_start RFC3339>:<run_seconds>`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DedupKey(String);

impl DedupKey {
    /// Derive the key for one progress point of one session
    #[must_use]
    pub fn derive(device_identifier: &str, session_start: DateTime<Utc>, run_seconds: u64) -> Self {
        Self(format!(
            "{}:{}:{}",
            device_identifier,
            rfc3339::format(session_start),
            run_seconds
        ))
    }

    /// Wrap a key received over the wire
    #[inline]
    #[must_use]
    pub fn from_wire(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    /// Key as a string slice
    #[inline]
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DedupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One snapshot of session progress, as delivered to the collector
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateRecord {
    /// Reporting device
    pub device_identifier: String,
    /// Session identity anchor
    #[serde(with = "rfc3339")]
    pub session_start: DateTime<Utc>,
    /// Cumulative run time within the session
    pub run_seconds: u64,
    /// `session_start + run_seconds`
    #[serde(with = "rfc3339")]
    pub last_update: DateTime<Utc>,
    /// Open or closed
    pub status: SessionStatus,
    /// Receiver-side idempotency key
    pub dedup_key: DedupKey,
}

impl UpdateRecord {
    /// Build a record, deriving `last_update` and `dedup_key`
    #[must_use]
    pub fn new(
        device_identifier: impl Into<String>,
        session_start: DateTime<Utc>,
        run_seconds: u64,
        status: SessionStatus,
    ) -> Self {
        let device_identifier = device_identifier.into();
        let session_start = session_start.trunc_subsecs(0);
        let offset = i64::try_from(run_seconds).unwrap_or(i64::MAX);
        let last_update = Duration::try_seconds(offset)
            .and_then(|delta| session_start.checked_add_signed(delta))
            .unwrap_or(session_start);
        let dedup_key = DedupKey::derive(&device_identifier, session_start, run_seconds);

        Self {
            device_identifier,
            session_start,
            run_seconds,
            last_update,
            status,
            dedup_key,
        }
    }

    /// Whether this is the final record of its session
    #[inline]
    #[must_use]
    pub fn is_closing(&self) -> bool {
        self.status == SessionStatus::Closed
    }

    /// Short human-readable label used in log lines
    #[must_use]
    pub fn label(&self) -> String {
        format!(
            "{} run={}s{}",
            rfc3339::format(self.session_start),
            self.run_seconds,
            if self.is_closing() { " (closed)" } else { "" }
        )
    }
}

/// RFC3339 UTC timestamps with whole seconds and a `Z` suffix
pub mod rfc3339 {
    use chrono::{DateTime, SecondsFormat, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    /// Format a timestamp as `YYYY-MM-DDTHH:MM:SSZ`
    #[must_use]
    pub fn format(ts: DateTime<Utc>) -> String {
        ts.to_rfc3339_opts(SecondsFormat::Secs, true)
    }

    /// Serde serializer
    ///
    /// # Errors
    /// Propagates serializer errors.
    pub fn serialize<S>(ts: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&format(*ts))
    }

    /// Serde deserializer accepting any RFC3339 offset
    ///
    /// # Errors
    /// Fails on strings that are not RFC3339.
    pub fn deserialize<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        DateTime::parse_from_rfc3339(&raw)
            .map(|ts| ts.with_timezone(&Utc))
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 10, 23, 18, 0, 0).unwrap()
    }

    #[test]
    fn record_derives_last_update_and_key() {
        let record = UpdateRecord::new("car-esp32-01", start(), 1200, SessionStatus::Open);

        assert_eq!(record.last_update, Utc.with_ymd_and_hms(2025, 10, 23, 18, 20, 0).unwrap());
        assert_eq!(record.dedup_key.as_str(), "car-esp32-01:2025-10-23T18:00:00Z:1200");
        assert!(!record.is_closing());
    }

    #[test]
    fn dedup_key_distinguishes_devices_and_progress() {
        let a = DedupKey::derive("a", start(), 60);
        let b = DedupKey::derive("b", start(), 60);
        let c = DedupKey::derive("a", start(), 120);

        assert_ne!(a, b);
        assert_ne!(a, c);
        assert_eq!(a, DedupKey::derive("a", start(), 60));
    }

    #[test]
    fn wire_format_uses_whole_second_utc() {
        let record = UpdateRecord::new("dev", start(), 60, SessionStatus::Closed);
        let json = serde_json::to_value(&record).unwrap();

        assert_eq!(json["session_start"], "2025-10-23T18:00:00Z");
        assert_eq!(json["last_update"], "2025-10-23T18:01:00Z");
        assert_eq!(json["status"], "closed");
        assert_eq!(json["dedup_key"], "dev:2025-10-23T18:00:00Z:60");
    }

    #[test]
    fn subsecond_start_is_truncated() {
        let precise = start() + Duration::milliseconds(750);
        let record = UpdateRecord::new("dev", precise, 0, SessionStatus::Open);

        assert_eq!(record.session_start, start());
    }

    #[test]
    fn deserialize_accepts_offset_timestamps() {
        let raw = r#"{
            "device_identifier": "dev",
            "session_start": "2025-10-23T20:00:00+02:00",
            "run_seconds": 60,
            "last_update": "2025-10-23T18:01:00Z",
            "status": "open",
            "dedup_key": "dev:2025-10-23T18:00:00Z:60"
        }"#;
        let record: UpdateRecord = serde_json::from_str(raw).unwrap();

        assert_eq!(record.session_start, start());
    }
}
