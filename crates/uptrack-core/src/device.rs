//! Device runner
//!
//! The producer side: plans sessions, drives each session machine from the
//! tick source, and enqueues every emitted record. Delivery problems never
//! reach this loop; a refused enqueue is logged and counted, and the session
//! keeps running.
//!
//! The checkpoint is written before each record is enqueued, so after a power
//! loss it never trails the outbox. Recovery therefore closes at or beyond
//! the last queued progress, and a session that already produced its closing
//! record is only re-queued if that record is no longer pending.

use crate::checkpoint::CheckpointStore;
use crate::clock::TickSource;
use crate::config::DeviceConfig;
use crate::error::UptrackError;
use crate::outbox::Outbox;
use crate::session::{SessionMachine, SessionPlan};
use crate::types::{rfc3339, UpdateRecord};
use chrono::Utc;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use std::sync::Arc;

/// Producer-side counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeviceReport {
    /// Sessions run to completion
    pub sessions: u32,
    /// Records produced by session machines
    pub emitted: u64,
    /// Records accepted by the outbox
    pub enqueued: u64,
    /// Records the outbox refused
    pub refused: u64,
    /// Interrupted sessions closed during recovery
    pub recovered: u32,
}

/// Tick loop driving sessions into the outbox
pub struct DeviceRunner<T> {
    config: DeviceConfig,
    outbox: Arc<Outbox>,
    ticks: T,
    rng: Arc<Mutex<StdRng>>,
    checkpoint: Option<CheckpointStore>,
    report: DeviceReport,
}

impl<T: TickSource> DeviceRunner<T> {
    /// Create a runner; `config` is sanitized here
    #[must_use]
    pub fn new(config: DeviceConfig, outbox: Arc<Outbox>, ticks: T, rng: Arc<Mutex<StdRng>>) -> Self {
        let config = config.sanitized();
        let checkpoint = config.checkpoint_path.clone().map(CheckpointStore::new);
        Self {
            config,
            outbox,
            ticks,
            rng,
            checkpoint,
            report: DeviceReport::default(),
        }
    }

    /// Counters so far
    #[inline]
    #[must_use]
    pub fn report(&self) -> DeviceReport {
        self.report
    }

    /// Finish the session a power loss interrupted, if the checkpoint holds one
    ///
    /// An open session is closed at its checkpointed progress. A session
    /// whose closing record was produced gets that record re-queued unless it
    /// is still pending.
    ///
    /// # Errors
    /// `UptrackError::Checkpoint` if the checkpoint cannot be read or cleared.
    pub fn recover(&mut self) -> Result<Option<UpdateRecord>, UptrackError> {
        let Some(store) = self.checkpoint.clone() else {
            return Ok(None);
        };
        let Some(snapshot) = store.load()? else {
            return Ok(None);
        };

        let mut machine = SessionMachine::restore(snapshot, self.config.emit_interval_seconds());
        let record = match machine.closing_record() {
            Some(record) if self.outbox.contains(&record.dedup_key) => None,
            Some(record) => Some(record),
            None => Some(machine.interrupt()?),
        };

        if let Some(record) = &record {
            tracing::warn!(
                "recovered interrupted session {} at {}s",
                rfc3339::format(machine.start()),
                record.run_seconds
            );
            self.enqueue(record.clone());
            self.report.recovered += 1;
        }

        store.clear()?;
        Ok(record)
    }

    /// Run `config.sessions` randomly planned sessions back to back
    ///
    /// An unreadable checkpoint is moved aside and the device starts fresh.
    pub async fn run(&mut self) -> DeviceReport {
        if let Err(e) = self.recover() {
            tracing::error!("session recovery failed, starting fresh: {e}");
            self.discard_checkpoint();
        }

        for index in 0..self.config.sessions {
            let plan = SessionPlan::random(
                &mut *self.rng.lock(),
                self.config.min_session_minutes,
                self.config.max_session_minutes,
                Utc::now(),
            );
            tracing::info!(
                "new session #{} start={} target={}m",
                index + 1,
                rfc3339::format(plan.start),
                plan.target_duration_seconds / 60
            );
            self.run_session(plan).await;
        }

        self.report
    }

    /// Drive one session from open to its closing record
    pub async fn run_session(&mut self, plan: SessionPlan) {
        let mut machine = SessionMachine::open(
            self.config.device_id.clone(),
            plan,
            self.config.emit_interval_seconds(),
        );
        self.save_checkpoint(&machine);

        while !machine.is_due() {
            let delta = self.ticks.tick().await;
            machine.advance(delta);
            if let Some(record) = machine.maybe_emit() {
                self.save_checkpoint(&machine);
                self.enqueue(record);
            }
        }

        match machine.close() {
            Ok(record) => {
                self.save_checkpoint(&machine);
                self.enqueue(record);
            }
            Err(e) => tracing::warn!("session close skipped: {e}"),
        }
        if let Some(store) = &self.checkpoint {
            if let Err(e) = store.clear() {
                tracing::warn!("cannot clear session checkpoint: {e}");
            }
        }
        self.report.sessions += 1;
    }

    fn enqueue(&mut self, record: UpdateRecord) {
        self.report.emitted += 1;
        let label = record.label();
        match self.outbox.enqueue(record) {
            Ok(()) => {
                self.report.enqueued += 1;
                tracing::debug!("[queue] {label} ({} pending)", self.outbox.len());
            }
            Err(e) => {
                self.report.refused += 1;
                tracing::error!("[drop] {label}: {e}");
            }
        }
    }

    fn discard_checkpoint(&self) {
        let Some(store) = &self.checkpoint else {
            return;
        };
        match store.quarantine() {
            Ok(Some(aside)) => tracing::warn!("unreadable checkpoint moved to {}", aside.display()),
            Ok(None) => {}
            Err(e) => tracing::error!("cannot discard checkpoint: {e}"),
        }
    }

    fn save_checkpoint(&self, machine: &SessionMachine) {
        if let Some(store) = &self.checkpoint {
            if let Err(e) = store.save(&machine.snapshot()) {
                tracing::warn!("cannot checkpoint session: {e}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{shared_rng, InstantTicks};
    use crate::types::SessionStatus;
    use chrono::TimeZone;

    fn runner(config: DeviceConfig) -> DeviceRunner<InstantTicks> {
        let ticks = InstantTicks::new(config.tick_seconds);
        DeviceRunner::new(config, Arc::new(Outbox::in_memory()), ticks, shared_rng(Some(7)))
    }

    #[tokio::test]
    async fn session_records_land_in_outbox_in_order() {
        let mut runner = runner(DeviceConfig::new().with_device_id("dev"));
        let plan = SessionPlan::new(Utc.with_ymd_and_hms(2025, 10, 23, 18, 0, 0).unwrap(), 300);

        runner.run_session(plan).await;

        let pending = runner.outbox.pending();
        let seconds: Vec<_> = pending.iter().map(|r| r.run_seconds).collect();
        assert_eq!(seconds, vec![60, 120, 180, 240, 300]);
        assert_eq!(pending.last().unwrap().status, SessionStatus::Closed);
        assert_eq!(runner.report().emitted, 5);
    }

    #[tokio::test]
    async fn run_produces_one_closing_record_per_session() {
        let config = DeviceConfig {
            sessions: 3,
            min_session_minutes: 2,
            max_session_minutes: 4,
            ..DeviceConfig::new()
        };
        let mut runner = runner(config);

        let report = runner.run().await;

        let closed = runner.outbox.pending().iter().filter(|r| r.is_closing()).count();
        assert_eq!(report.sessions, 3);
        assert_eq!(closed, 3);
        assert_eq!(report.enqueued, report.emitted);
    }

    #[tokio::test]
    async fn refused_records_are_counted_not_fatal() {
        use crate::config::OverflowPolicy;
        use crate::outbox::OutboxOptions;

        let config = DeviceConfig::new();
        let outbox = Arc::new(Outbox::with_options(
            OutboxOptions::new().with_capacity(2, OverflowPolicy::Reject),
        ));
        let mut runner =
            DeviceRunner::new(config, Arc::clone(&outbox), InstantTicks::new(60), shared_rng(Some(1)));
        let plan = SessionPlan::new(Utc::now(), 300);

        runner.run_session(plan).await;

        assert_eq!(outbox.len(), 2);
        assert_eq!(runner.report().refused, 3);
        assert_eq!(runner.report().sessions, 1);
    }

    #[test]
    fn recover_closes_interrupted_session_once() {
        let dir = tempfile::tempdir().unwrap();
        let config = DeviceConfig {
            checkpoint_path: Some(dir.path().join("session.json")),
            ..DeviceConfig::new().with_device_id("dev")
        };
        let store = CheckpointStore::new(dir.path().join("session.json"));
        let mut machine = SessionMachine::open(
            "dev",
            SessionPlan::new(Utc.with_ymd_and_hms(2025, 10, 23, 18, 0, 0).unwrap(), 3600),
            60,
        );
        machine.advance(180);
        machine.maybe_emit();
        store.save(&machine.snapshot()).unwrap();

        let mut runner = runner(config);
        let record = runner.recover().unwrap().unwrap();
        assert_eq!(record.run_seconds, 180);
        assert_eq!(record.status, SessionStatus::Closed);
        assert_eq!(runner.report().recovered, 1);

        assert_eq!(runner.recover().unwrap(), None);
        assert_eq!(runner.outbox.len(), 1);
    }

    fn start() -> chrono::DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 10, 23, 18, 0, 0).unwrap()
    }

    fn closed_seconds(outbox: &Outbox) -> Vec<u64> {
        outbox
            .pending()
            .iter()
            .filter(|r| r.is_closing())
            .map(|r| r.run_seconds)
            .collect()
    }

    fn checkpointed(dir: &tempfile::TempDir) -> DeviceConfig {
        DeviceConfig {
            checkpoint_path: Some(dir.path().join("session.json")),
            ..DeviceConfig::new().with_device_id("dev")
        }
    }

    #[tokio::test]
    async fn power_loss_before_checkpoint_clear_closes_once() {
        let dir = tempfile::tempdir().unwrap();
        let mut runner = runner(checkpointed(&dir));
        runner.run_session(SessionPlan::new(start(), 300)).await;

        // the closed checkpoint as it stood just before it was cleared
        let mut machine = SessionMachine::open("dev", SessionPlan::new(start(), 300), 60);
        machine.close().unwrap();
        CheckpointStore::new(dir.path().join("session.json"))
            .save(&machine.snapshot())
            .unwrap();

        assert_eq!(runner.recover().unwrap(), None);
        assert_eq!(closed_seconds(&runner.outbox), vec![300]);
        assert_eq!(runner.report().recovered, 0);
    }

    #[test]
    fn power_loss_before_closing_enqueue_requeues_the_close() {
        let dir = tempfile::tempdir().unwrap();
        let mut runner = runner(checkpointed(&dir));
        let mut machine = SessionMachine::open("dev", SessionPlan::new(start(), 300), 60);
        for _ in 0..4 {
            machine.advance(60);
            runner.outbox.enqueue(machine.maybe_emit().unwrap()).unwrap();
        }
        machine.close().unwrap();
        CheckpointStore::new(dir.path().join("session.json"))
            .save(&machine.snapshot())
            .unwrap();

        let record = runner.recover().unwrap().unwrap();

        assert_eq!(record.run_seconds, 300);
        let seconds: Vec<_> = runner.outbox.pending().iter().map(|r| r.run_seconds).collect();
        assert_eq!(seconds, vec![60, 120, 180, 240, 300]);
        assert_eq!(closed_seconds(&runner.outbox), vec![300]);
    }

    #[test]
    fn power_loss_before_open_enqueue_never_regresses() {
        let dir = tempfile::tempdir().unwrap();
        let mut runner = runner(checkpointed(&dir));
        let mut machine = SessionMachine::open("dev", SessionPlan::new(start(), 600), 60);
        for _ in 0..3 {
            machine.advance(60);
            runner.outbox.enqueue(machine.maybe_emit().unwrap()).unwrap();
        }
        // checkpointed at 240, record not yet queued
        machine.advance(60);
        machine.maybe_emit().unwrap();
        CheckpointStore::new(dir.path().join("session.json"))
            .save(&machine.snapshot())
            .unwrap();

        runner.recover().unwrap();

        let seconds: Vec<_> = runner.outbox.pending().iter().map(|r| r.run_seconds).collect();
        assert_eq!(seconds, vec![60, 120, 180, 240]);
        assert_eq!(closed_seconds(&runner.outbox), vec![240]);
    }

    #[tokio::test]
    async fn unreadable_checkpoint_does_not_stop_the_device() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.json");
        std::fs::write(&path, b"{\"device_identifier\":\"dev\",\"sta").unwrap();
        let config = DeviceConfig {
            sessions: 2,
            min_session_minutes: 2,
            max_session_minutes: 2,
            ..checkpointed(&dir)
        };
        let mut runner = runner(config);

        let report = runner.run().await;

        assert_eq!(report.sessions, 2);
        assert_eq!(report.recovered, 0);
        assert_eq!(closed_seconds(&runner.outbox), vec![120, 120]);
        assert!(dir.path().join("session.json.bad").exists());
        assert!(!path.exists());
    }
}
