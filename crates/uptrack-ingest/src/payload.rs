//! Incoming wire payload
//!
//! Accepts both the current field names and the legacy ones (`device_id`,
//! `msg_id`). A missing dedup key is derived from the record identity, and
//! `last_update` is always recomputed from `session_start + run_seconds`.
//! Wire keys are scoped by device: a key that does not already start with
//! `<device_identifier>:` gets that prefix, so legacy `msg_id`s from two
//! devices never collide.

use crate::error::PayloadError;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use uptrack_core::types::rfc3339;
use uptrack_core::{DedupKey, SessionStatus, UpdateRecord};

/// Record as received, before normalization
#[derive(Debug, Clone, Deserialize)]
pub struct IncomingRecord {
    /// Reporting device
    #[serde(alias = "device_id")]
    pub device_identifier: String,
    /// Session identity anchor
    #[serde(with = "rfc3339")]
    pub session_start: DateTime<Utc>,
    /// Cumulative run time
    pub run_seconds: u64,
    /// Open or closed
    pub status: SessionStatus,
    /// Idempotency key, derived when absent
    #[serde(default, alias = "msg_id")]
    pub dedup_key: Option<String>,
}

impl IncomingRecord {
    /// Parse a request body
    ///
    /// # Errors
    /// `PayloadError::Malformed` if the body is not a record.
    pub fn from_slice(body: &[u8]) -> Result<Self, PayloadError> {
        serde_json::from_slice(body).map_err(|e| PayloadError::Malformed(e.to_string()))
    }

    /// Validate and convert into a stored record
    ///
    /// # Errors
    /// `PayloadError::EmptyField` for a blank device identifier.
    pub fn into_record(self) -> Result<UpdateRecord, PayloadError> {
        let device = self.device_identifier.trim();
        if device.is_empty() {
            return Err(PayloadError::EmptyField("device_identifier"));
        }

        let mut record = UpdateRecord::new(device, self.session_start, self.run_seconds, self.status);
        if let Some(key) = self.dedup_key.as_deref().map(str::trim).filter(|k| !k.is_empty()) {
            record.dedup_key = scoped_key(device, key);
        }
        Ok(record)
    }
}

fn scoped_key(device: &str, key: &str) -> DedupKey {
    let owned = key
        .strip_prefix(device)
        .is_some_and(|rest| rest.starts_with(':'));
    if owned {
        DedupKey::from_wire(key)
    } else {
        DedupKey::from_wire(format!("{device}:{key}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;

    #[test]
    fn current_format_round_trips() {
        let start = Utc.with_ymd_and_hms(2025, 10, 23, 18, 0, 0).unwrap();
        let sent = UpdateRecord::new("dev", start, 120, SessionStatus::Open);
        let body = serde_json::to_vec(&sent).unwrap();

        let received = IncomingRecord::from_slice(&body).unwrap().into_record().unwrap();
        assert_eq!(received, sent);
    }

    #[test]
    fn legacy_field_names_are_accepted() {
        let body = br#"{
            "device_id": "car-esp32-01",
            "session_start": "2025-10-23T18:00:00Z",
            "run_seconds": 60,
            "last_update": "2025-10-23T18:01:00Z",
            "status": "open",
            "msg_id": "2025-10-23T18:00:00Z:60"
        }"#;

        let record = IncomingRecord::from_slice(body).unwrap().into_record().unwrap();
        assert_eq!(record.device_identifier, "car-esp32-01");
        assert_eq!(record.dedup_key.as_str(), "car-esp32-01:2025-10-23T18:00:00Z:60");
    }

    #[test]
    fn legacy_keys_from_different_devices_stay_distinct() {
        let body = |device: &str| {
            format!(
                r#"{{"device_id":"{device}","session_start":"2025-10-23T18:00:00Z","run_seconds":60,"status":"open","msg_id":"2025-10-23T18:00:00Z:60"}}"#
            )
        };
        let a = IncomingRecord::from_slice(body("car-a").as_bytes()).unwrap().into_record().unwrap();
        let b = IncomingRecord::from_slice(body("car-b").as_bytes()).unwrap().into_record().unwrap();

        assert_ne!(a.dedup_key, b.dedup_key);
        assert_eq!(a.dedup_key.as_str(), "car-a:2025-10-23T18:00:00Z:60");
    }

    #[test]
    fn keys_already_scoped_are_kept() {
        let body = br#"{"device_identifier":"car","session_start":"2025-10-23T18:00:00Z","run_seconds":60,"status":"open","dedup_key":"car:custom-7"}"#;
        let record = IncomingRecord::from_slice(body).unwrap().into_record().unwrap();
        assert_eq!(record.dedup_key.as_str(), "car:custom-7");

        let prefix_only = br#"{"device_identifier":"car","session_start":"2025-10-23T18:00:00Z","run_seconds":60,"status":"open","dedup_key":"carpool:1"}"#;
        let record = IncomingRecord::from_slice(prefix_only).unwrap().into_record().unwrap();
        assert_eq!(record.dedup_key.as_str(), "car:carpool:1");
    }

    #[test]
    fn missing_key_is_derived_and_offsets_normalized() {
        let body = br#"{
            "device_identifier": "dev",
            "session_start": "2025-10-23T20:00:00+02:00",
            "run_seconds": 300,
            "status": "closed"
        }"#;

        let record = IncomingRecord::from_slice(body).unwrap().into_record().unwrap();
        assert_eq!(record.dedup_key.as_str(), "dev:2025-10-23T18:00:00Z:300");
        assert!(record.is_closing());
    }

    #[test]
    fn bad_bodies_are_rejected() {
        assert!(matches!(
            IncomingRecord::from_slice(b"{\"run_seconds\": 1}"),
            Err(PayloadError::Malformed(_))
        ));

        let blank = IncomingRecord::from_slice(
            br#"{"device_identifier":" ","session_start":"2025-10-23T18:00:00Z","run_seconds":1,"status":"open"}"#,
        )
        .unwrap();
        assert_eq!(blank.into_record(), Err(PayloadError::EmptyField("device_identifier")));
    }
}
