//! Idempotent session store
//!
//! Rows are keyed by dedup key. A redelivered record is a no-op, except that
//! a `closed` record upgrades a stored `open` row with the same key (a device
//! recovering from power loss closes a session at its last checkpoint).
//! Closed is sticky; nothing reopens a row.
//!
//! With a journal, every state-changing record is appended and synced before
//! the in-memory state changes, so an acknowledgment always means the record
//! survives a restart.

use crate::error::StoreError;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use uptrack_core::types::rfc3339;
use uptrack_core::{DedupKey, SessionStatus, UpdateRecord};

/// What an upsert did
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum UpsertOutcome {
    /// New progress point stored
    Inserted,
    /// Already stored; nothing changed
    Duplicate,
    /// Stored `open` row became `closed`
    Upgraded,
}

impl UpsertOutcome {
    /// Whether persisted state changed
    #[inline]
    #[must_use]
    pub fn is_change(self) -> bool {
        !matches!(self, Self::Duplicate)
    }
}

/// Per-session rollup
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionAggregate {
    /// Reporting device
    pub device_identifier: String,
    /// Session identity anchor
    #[serde(with = "rfc3339")]
    pub session_start: DateTime<Utc>,
    /// Highest run time seen
    pub max_run_seconds: u64,
    /// Latest `last_update` seen
    #[serde(with = "rfc3339")]
    pub last_update: DateTime<Utc>,
    /// Sticky close flag
    pub closed: bool,
    /// Distinct progress points stored
    pub progress_points: u64,
}

/// Device "last seen" marker
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceSeen {
    /// Device identifier
    pub device_identifier: String,
    /// Last delivery received, if any
    pub last_seen: Option<DateTime<Utc>>,
    /// Deliveries received, duplicates included
    pub deliveries: u64,
    /// Known to the operator
    pub registered: bool,
}

type SessionId = (String, DateTime<Utc>);

#[derive(Debug, Default)]
struct StoreState {
    rows: HashMap<DedupKey, UpdateRecord>,
    sessions: BTreeMap<SessionId, SessionAggregate>,
}

impl StoreState {
    fn classify(&self, record: &UpdateRecord) -> UpsertOutcome {
        match self.rows.get(&record.dedup_key) {
            None => UpsertOutcome::Inserted,
            Some(row) if row.status == SessionStatus::Open && record.is_closing() => {
                UpsertOutcome::Upgraded
            }
            Some(_) => UpsertOutcome::Duplicate,
        }
    }

    fn apply(&mut self, record: UpdateRecord, outcome: UpsertOutcome) {
        let id = (record.device_identifier.clone(), record.session_start);
        let aggregate = self.sessions.entry(id).or_insert_with(|| SessionAggregate {
            device_identifier: record.device_identifier.clone(),
            session_start: record.session_start,
            max_run_seconds: 0,
            last_update: record.session_start,
            closed: false,
            progress_points: 0,
        });

        match outcome {
            UpsertOutcome::Inserted => {
                aggregate.progress_points += 1;
                aggregate.max_run_seconds = aggregate.max_run_seconds.max(record.run_seconds);
                aggregate.last_update = aggregate.last_update.max(record.last_update);
                aggregate.closed |= record.is_closing();
                self.rows.insert(record.dedup_key.clone(), record);
            }
            UpsertOutcome::Upgraded => {
                aggregate.closed = true;
                if let Some(row) = self.rows.get_mut(&record.dedup_key) {
                    row.status = SessionStatus::Closed;
                }
            }
            UpsertOutcome::Duplicate => {}
        }
    }
}

#[derive(Debug)]
struct Journal {
    path: PathBuf,
    file: File,
}

impl Journal {
    fn append(&mut self, record: &UpdateRecord) -> Result<(), StoreError> {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');
        self.file
            .write_all(&line)
            .map_err(|e| StoreError::io(&self.path, e))?;
        self.file
            .sync_data()
            .map_err(|e| StoreError::io(&self.path, e))
    }
}

#[derive(Debug)]
struct Inner {
    state: StoreState,
    journal: Option<Journal>,
}

/// Collector-side store
#[derive(Debug)]
pub struct IngestStore {
    inner: Mutex<Inner>,
    devices: DashMap<String, DeviceSeen>,
}

impl IngestStore {
    /// Volatile store
    #[must_use]
    pub fn in_memory() -> Self {
        Self {
            inner: Mutex::new(Inner {
                state: StoreState::default(),
                journal: None,
            }),
            devices: DashMap::new(),
        }
    }

    /// Journal-backed store; replays `path` if it exists
    ///
    /// # Errors
    /// `StoreError::Io` if the journal cannot be read or opened, `Corrupt` if
    /// a line before the tail is unreadable.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let (state, replayed) = replay(&path)?;
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| StoreError::io(&path, e))?;

        tracing::info!(
            "ingest journal {} replayed: {replayed} entries, {} sessions",
            path.display(),
            state.sessions.len()
        );

        Ok(Self {
            inner: Mutex::new(Inner {
                state,
                journal: Some(Journal { path, file }),
            }),
            devices: DashMap::new(),
        })
    }

    /// Idempotent upsert keyed by the record's dedup key
    ///
    /// The device's last-seen marker is refreshed on every call, duplicates
    /// included.
    ///
    /// # Errors
    /// `StoreError` if the journal append fails; state is then unchanged and
    /// the caller must not acknowledge.
    pub fn upsert(&self, record: UpdateRecord) -> Result<UpsertOutcome, StoreError> {
        self.touch(&record.device_identifier);

        let mut inner = self.inner.lock();
        let outcome = inner.state.classify(&record);
        if outcome.is_change() {
            if let Some(journal) = inner.journal.as_mut() {
                journal.append(&record)?;
            }
            tracing::debug!("[{outcome:?}] {}", record.dedup_key);
        }
        inner.state.apply(record, outcome);
        Ok(outcome)
    }

    /// Mark a device as known to the operator
    pub fn register_device(&self, device_identifier: &str) {
        self.devices
            .entry(device_identifier.to_string())
            .and_modify(|seen| seen.registered = true)
            .or_insert_with(|| DeviceSeen {
                device_identifier: device_identifier.to_string(),
                last_seen: None,
                deliveries: 0,
                registered: true,
            });
    }

    /// Last-seen marker for one device
    #[must_use]
    pub fn device(&self, device_identifier: &str) -> Option<DeviceSeen> {
        self.devices.get(device_identifier).map(|seen| seen.clone())
    }

    /// All last-seen markers, sorted by identifier
    #[must_use]
    pub fn devices(&self) -> Vec<DeviceSeen> {
        let mut all: Vec<_> = self.devices.iter().map(|seen| seen.value().clone()).collect();
        all.sort_by(|a, b| a.device_identifier.cmp(&b.device_identifier));
        all
    }

    /// Session rollups for one device, oldest session first
    #[must_use]
    pub fn sessions(&self, device_identifier: &str) -> Vec<SessionAggregate> {
        self.inner
            .lock()
            .state
            .sessions
            .values()
            .filter(|s| s.device_identifier == device_identifier)
            .cloned()
            .collect()
    }

    /// Rollup for one session
    #[must_use]
    pub fn session(&self, device_identifier: &str, session_start: DateTime<Utc>) -> Option<SessionAggregate> {
        self.inner
            .lock()
            .state
            .sessions
            .get(&(device_identifier.to_string(), session_start))
            .cloned()
    }

    /// Stored row for a dedup key
    #[must_use]
    pub fn get(&self, key: &DedupKey) -> Option<UpdateRecord> {
        self.inner.lock().state.rows.get(key).cloned()
    }

    /// Distinct rows stored
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().state.rows.len()
    }

    /// Whether nothing is stored
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn touch(&self, device_identifier: &str) {
        let now = Utc::now();
        self.devices
            .entry(device_identifier.to_string())
            .and_modify(|seen| {
                seen.last_seen = Some(now);
                seen.deliveries += 1;
            })
            .or_insert_with(|| DeviceSeen {
                device_identifier: device_identifier.to_string(),
                last_seen: Some(now),
                deliveries: 1,
                registered: false,
            });
    }
}

impl Default for IngestStore {
    fn default() -> Self {
        Self::in_memory()
    }
}

fn replay(path: &Path) -> Result<(StoreState, usize), StoreError> {
    let mut state = StoreState::default();
    let raw = match std::fs::read(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok((state, 0)),
        Err(e) => return Err(StoreError::io(path, e)),
    };

    let mut replayed = 0usize;
    let mut offset = 0usize;
    for (index, chunk) in raw.split_inclusive(|b| *b == b'\n').enumerate() {
        let terminated = chunk.last() == Some(&b'\n');
        let line = chunk.strip_suffix(b"\n").unwrap_or(chunk);
        if !line.iter().all(u8::is_ascii_whitespace) {
            match serde_json::from_slice::<UpdateRecord>(line) {
                Ok(record) => {
                    let outcome = state.classify(&record);
                    state.apply(record, outcome);
                    replayed += 1;
                    if !terminated {
                        tracing::warn!(
                            "ingest journal {}: terminating complete entry at line {}",
                            path.display(),
                            index + 1
                        );
                        let mut file = OpenOptions::new()
                            .append(true)
                            .open(path)
                            .map_err(|e| StoreError::io(path, e))?;
                        file.write_all(b"\n")
                            .and_then(|()| file.sync_data())
                            .map_err(|e| StoreError::io(path, e))?;
                    }
                }
                Err(source) if !terminated => {
                    tracing::warn!(
                        "ingest journal {}: discarding torn entry at line {}: {source}",
                        path.display(),
                        index + 1
                    );
                    let file = OpenOptions::new()
                        .write(true)
                        .open(path)
                        .map_err(|e| StoreError::io(path, e))?;
                    file.set_len(offset as u64)
                        .map_err(|e| StoreError::io(path, e))?;
                    break;
                }
                Err(source) => {
                    return Err(StoreError::Corrupt {
                        line: index + 1,
                        source,
                    })
                }
            }
        }
        offset += chunk.len();
    }

    Ok((state, replayed))
}
