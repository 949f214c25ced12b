//! Testing utilities for the uptrack workspace
//!
//! Shared fixtures, scripted transports, and a throwaway ingest server.

#![allow(missing_docs)]

use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use uptrack_core::{
    DeliveryError, SessionMachine, SessionPlan, SessionStatus, Transport, UpdateRecord,
};
use uptrack_ingest::IngestStore;

pub const TEST_DEVICE: &str = "airplane-N20503";

pub fn fixed_start() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 10, 23, 18, 0, 0)
        .single()
        .unwrap_or_else(Utc::now)
}

pub fn record(run_seconds: u64, status: SessionStatus) -> UpdateRecord {
    UpdateRecord::new(TEST_DEVICE, fixed_start(), run_seconds, status)
}

pub fn open_records(seconds: impl IntoIterator<Item = u64>) -> Vec<UpdateRecord> {
    seconds
        .into_iter()
        .map(|s| record(s, SessionStatus::Open))
        .collect()
}

/// Every record one session emits, closing record last
pub fn session_records(target_seconds: u64, tick_seconds: u64, cadence_seconds: u64) -> Vec<UpdateRecord> {
    let plan = SessionPlan::new(fixed_start(), target_seconds);
    let mut machine = SessionMachine::open(TEST_DEVICE, plan, cadence_seconds);
    let mut records = Vec::new();
    while !machine.is_due() {
        machine.advance(tick_seconds.max(1));
        records.extend(machine.maybe_emit());
    }
    records.extend(machine.close().ok());
    records
}

#[derive(Debug, Default)]
struct Script {
    outcomes: VecDeque<Result<(), DeliveryError>>,
    fallback: Option<DeliveryError>,
    attempts: usize,
    delivered: Vec<UpdateRecord>,
}

/// Transport replaying a fixed outcome sequence, then a fallback
#[derive(Debug, Default)]
pub struct ScriptedTransport {
    script: Mutex<Script>,
}

impl ScriptedTransport {
    pub fn new(outcomes: impl IntoIterator<Item = Result<(), DeliveryError>>) -> Self {
        Self {
            script: Mutex::new(Script {
                outcomes: outcomes.into_iter().collect(),
                ..Script::default()
            }),
        }
    }

    pub fn always_ok() -> Self {
        Self::default()
    }

    pub fn always_failing(error: DeliveryError) -> Self {
        let transport = Self::default();
        transport.script.lock().fallback = Some(error);
        transport
    }

    /// The `k`-th attempt (1-based) fails, all others succeed
    pub fn fail_at(k: usize, error: DeliveryError) -> Self {
        let mut outcomes: Vec<_> = (1..k).map(|_| Ok(())).collect();
        outcomes.push(Err(error));
        Self::new(outcomes)
    }

    pub fn attempts(&self) -> usize {
        self.script.lock().attempts
    }

    pub fn delivered(&self) -> Vec<UpdateRecord> {
        self.script.lock().delivered.clone()
    }

    pub fn delivered_seconds(&self) -> Vec<u64> {
        self.script.lock().delivered.iter().map(|r| r.run_seconds).collect()
    }

    /// Switch the fallback outcome; `None` means success
    pub fn set_fallback(&self, error: Option<DeliveryError>) {
        self.script.lock().fallback = error;
    }
}

#[async_trait::async_trait]
impl Transport for ScriptedTransport {
    async fn attempt_deliver(&self, record: &UpdateRecord) -> Result<(), DeliveryError> {
        let mut script = self.script.lock();
        script.attempts += 1;
        let outcome = match script.outcomes.pop_front() {
            Some(outcome) => outcome,
            None => script.fallback.clone().map_or(Ok(()), Err),
        };
        if outcome.is_ok() {
            script.delivered.push(record.clone());
        }
        outcome
    }
}

/// Transport delivering straight into an ingest store
///
/// The first `lost_acks` attempts are stored but reported as timeouts, the
/// way a reply lost on the wire looks to the device.
#[derive(Debug)]
pub struct StoreTransport {
    store: Arc<IngestStore>,
    lost_acks: Mutex<usize>,
}

impl StoreTransport {
    pub fn new(store: Arc<IngestStore>) -> Self {
        Self::losing_acks(store, 0)
    }

    pub fn losing_acks(store: Arc<IngestStore>, lost_acks: usize) -> Self {
        Self {
            store,
            lost_acks: Mutex::new(lost_acks),
        }
    }

    pub fn store(&self) -> &Arc<IngestStore> {
        &self.store
    }
}

#[async_trait::async_trait]
impl Transport for StoreTransport {
    async fn attempt_deliver(&self, record: &UpdateRecord) -> Result<(), DeliveryError> {
        self.store
            .upsert(record.clone())
            .map_err(|_| DeliveryError::Status(500))?;

        let mut lost = self.lost_acks.lock();
        if *lost > 0 {
            *lost -= 1;
            return Err(DeliveryError::Timeout(0));
        }
        Ok(())
    }
}

/// Ingest server on an ephemeral local port
#[derive(Debug)]
pub struct TestIngestServer {
    pub addr: SocketAddr,
    pub store: Arc<IngestStore>,
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl TestIngestServer {
    pub fn spawn(store: Arc<IngestStore>) -> Self {
        let (tx, rx) = oneshot::channel::<()>();
        let signal = async move {
            let _ = rx.await;
        };
        let (addr, server) = uptrack_ingest::bind(
            Arc::clone(&store),
            SocketAddr::from(([127, 0, 0, 1], 0)),
            signal,
        )
        .expect("bind ingest test server");

        Self {
            addr,
            store,
            shutdown: Some(tx),
            task: tokio::spawn(server),
        }
    }

    pub fn url(&self) -> String {
        format!("http://{}/ingest", self.addr)
    }

    pub async fn stop(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        let _ = (&mut self.task).await;
    }
}
