//! Session state machine
//!
//! One session runs from boot to close. Ticks advance elapsed time; records
//! are emitted on a cadence decoupled from the tick rate, and `close` always
//! produces exactly one terminal record at the target duration.
//!
//! `run_seconds` strictly increases across a session's records: once the
//! target is reached no `open` record is emitted, so a normal closing record
//! never shares a dedup key with an earlier one. A session interrupted by
//! power loss closes at its last emitted progress instead, upgrading that
//! record in place at the collector.

use crate::error::SessionError;
use crate::types::{SessionStatus, UpdateRecord};
use chrono::{DateTime, Duration, SubsecRound, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Session lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionState {
    /// Accepting ticks and emitting progress
    Open,
    /// Terminal; no further transitions
    Closed,
}

/// Identity and length of a session, decided at creation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionPlan {
    /// Session identity anchor (whole seconds)
    pub start: DateTime<Utc>,
    /// Target run time
    pub target_duration_seconds: u64,
}

impl SessionPlan {
    /// Plan a session starting at `start`
    #[must_use]
    pub fn new(start: DateTime<Utc>, target_duration_seconds: u64) -> Self {
        Self {
            start: start.trunc_subsecs(0),
            target_duration_seconds,
        }
    }

    /// Random whole-minute duration in `[min_minutes, max_minutes]`, starting
    /// somewhere within the 24 hours before `now`
    pub fn random<R: Rng + ?Sized>(
        rng: &mut R,
        min_minutes: u32,
        max_minutes: u32,
        now: DateTime<Utc>,
    ) -> Self {
        let min_minutes = min_minutes.max(1);
        let max_minutes = max_minutes.max(min_minutes);
        let minutes = rng.random_range(min_minutes..=max_minutes);
        let back = rng.random_range(0..24 * 60);
        let start = now - Duration::minutes(back);

        Self::new(start, u64::from(minutes) * 60)
    }
}

/// Persistable view of a session, used for crash recovery
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    /// Reporting device
    pub device_identifier: String,
    /// Session identity anchor
    #[serde(with = "crate::types::rfc3339")]
    pub start: DateTime<Utc>,
    /// Target run time
    pub target_duration_seconds: u64,
    /// Run time reached so far
    pub elapsed_seconds: u64,
    /// Run time of the last emitted record
    pub last_emitted_seconds: u64,
    /// Whether the closing record was produced
    pub closed: bool,
}

/// State machine for one session
#[derive(Debug, Clone)]
pub struct SessionMachine {
    device_identifier: String,
    start: DateTime<Utc>,
    target_duration_seconds: u64,
    emit_interval_seconds: u64,
    elapsed_seconds: u64,
    last_emitted_seconds: u64,
    state: SessionState,
}

impl SessionMachine {
    /// Open a new session
    #[must_use]
    pub fn open(device_identifier: impl Into<String>, plan: SessionPlan, emit_interval_seconds: u64) -> Self {
        Self {
            device_identifier: device_identifier.into(),
            start: plan.start,
            target_duration_seconds: plan.target_duration_seconds,
            emit_interval_seconds: emit_interval_seconds.max(1),
            elapsed_seconds: 0,
            last_emitted_seconds: 0,
            state: SessionState::Open,
        }
    }

    /// Rebuild a machine from a checkpoint
    #[must_use]
    pub fn restore(snapshot: SessionSnapshot, emit_interval_seconds: u64) -> Self {
        let elapsed = snapshot.elapsed_seconds.min(snapshot.target_duration_seconds);
        Self {
            device_identifier: snapshot.device_identifier,
            start: snapshot.start,
            target_duration_seconds: snapshot.target_duration_seconds,
            emit_interval_seconds: emit_interval_seconds.max(1),
            elapsed_seconds: elapsed,
            last_emitted_seconds: snapshot.last_emitted_seconds.min(elapsed),
            state: if snapshot.closed {
                SessionState::Closed
            } else {
                SessionState::Open
            },
        }
    }

    /// Advance elapsed time; saturates at the target and is a no-op once closed
    pub fn advance(&mut self, delta_seconds: u64) {
        if self.state == SessionState::Closed {
            return;
        }
        self.elapsed_seconds = self
            .elapsed_seconds
            .saturating_add(delta_seconds)
            .min(self.target_duration_seconds);
    }

    /// Emit an `open` record if a full emission interval has elapsed
    pub fn maybe_emit(&mut self) -> Option<UpdateRecord> {
        if self.state == SessionState::Closed || self.is_due() {
            return None;
        }
        if self.elapsed_seconds - self.last_emitted_seconds < self.emit_interval_seconds {
            return None;
        }
        self.last_emitted_seconds = self.elapsed_seconds;
        Some(self.record(self.elapsed_seconds, SessionStatus::Open))
    }

    /// Close the session and produce its terminal record
    ///
    /// # Errors
    /// `SessionError::AlreadyClosed` on a second call.
    pub fn close(&mut self) -> Result<UpdateRecord, SessionError> {
        if self.state == SessionState::Closed {
            return Err(SessionError::AlreadyClosed);
        }
        self.state = SessionState::Closed;
        self.elapsed_seconds = self.target_duration_seconds;
        self.last_emitted_seconds = self.target_duration_seconds;
        Ok(self.record(self.target_duration_seconds, SessionStatus::Closed))
    }

    /// Close a session cut short by power loss at its current progress
    ///
    /// The target shrinks to the elapsed time, so the closing record still
    /// carries `run_seconds == target`.
    ///
    /// # Errors
    /// `SessionError::AlreadyClosed` if the session was closed normally.
    pub fn interrupt(&mut self) -> Result<UpdateRecord, SessionError> {
        if self.state == SessionState::Closed {
            return Err(SessionError::AlreadyClosed);
        }
        self.target_duration_seconds = self.elapsed_seconds;
        self.close()
    }

    /// The terminal record of a closed session, rebuilt from its state
    #[must_use]
    pub fn closing_record(&self) -> Option<UpdateRecord> {
        (self.state == SessionState::Closed)
            .then(|| self.record(self.target_duration_seconds, SessionStatus::Closed))
    }

    /// Elapsed time reached the target
    #[inline]
    #[must_use]
    pub fn is_due(&self) -> bool {
        self.elapsed_seconds >= self.target_duration_seconds
    }

    /// Current state
    #[inline]
    #[must_use]
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Session identity anchor
    #[inline]
    #[must_use]
    pub fn start(&self) -> DateTime<Utc> {
        self.start
    }

    /// Target duration
    #[inline]
    #[must_use]
    pub fn target_duration_seconds(&self) -> u64 {
        self.target_duration_seconds
    }

    /// Elapsed run time
    #[inline]
    #[must_use]
    pub fn elapsed_seconds(&self) -> u64 {
        self.elapsed_seconds
    }

    /// Checkpoint view
    #[must_use]
    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            device_identifier: self.device_identifier.clone(),
            start: self.start,
            target_duration_seconds: self.target_duration_seconds,
            elapsed_seconds: self.elapsed_seconds,
            last_emitted_seconds: self.last_emitted_seconds,
            closed: self.state == SessionState::Closed,
        }
    }

    fn record(&self, run_seconds: u64, status: SessionStatus) -> UpdateRecord {
        UpdateRecord::new(self.device_identifier.clone(), self.start, run_seconds, status)
    }
}
