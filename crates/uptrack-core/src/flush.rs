//! Flush scheduler
//!
//! Periodically drains the outbox oldest-first. Within a batch, delivery stops
//! at the first failure: the failed record and everything behind it stay
//! queued in order, and only the successful prefix is acknowledged. Skipping
//! ahead past a failed record would break ordering and is not done.

use crate::config::DeviceConfig;
use crate::error::DeliveryError;
use crate::outbox::Outbox;
use crate::transport::Transport;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Scheduler tuning
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlushSettings {
    /// Max records attempted per cycle
    pub batch_size: usize,
    /// Cycle period
    pub period: Duration,
    /// Pause between drain rounds
    pub drain_backoff: Duration,
    /// Upper bound on drain rounds
    pub drain_max_rounds: u32,
}

impl FlushSettings {
    /// Derive from device configuration
    #[must_use]
    pub fn from_config(config: &DeviceConfig) -> Self {
        Self {
            batch_size: config.batch_size.max(1),
            period: config.flush_interval().max(Duration::from_millis(1)),
            drain_backoff: config.drain_backoff(),
            drain_max_rounds: config.drain_max_rounds.max(1),
        }
    }
}

impl Default for FlushSettings {
    fn default() -> Self {
        Self::from_config(&DeviceConfig::default())
    }
}

/// Result of one flush cycle
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlushOutcome {
    /// Delivery attempts made (successes plus at most one failure)
    pub attempted: usize,
    /// Records acknowledged and removed
    pub delivered: usize,
    /// The failure that ended the cycle early, if any
    pub failure: Option<DeliveryError>,
    /// Records still queued afterwards
    pub remaining: usize,
}

impl FlushOutcome {
    /// Whether the cycle had nothing to do
    #[inline]
    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.attempted == 0
    }
}

/// Result of a drain
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
    /// Flush rounds run
    pub rounds: u32,
    /// Records delivered during the drain
    pub delivered: usize,
    /// Records left behind
    pub remaining: usize,
}

/// Lifetime summary of a scheduler run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushReport {
    /// Non-idle cycles
    pub cycles: u64,
    /// Records delivered by periodic cycles
    pub delivered: u64,
    /// Cycles that ended on a failure
    pub failed_cycles: u64,
    /// Final drain
    pub drain: DrainReport,
}

/// Consumer side of the outbox
pub struct FlushScheduler {
    outbox: Arc<Outbox>,
    transport: Arc<dyn Transport>,
    settings: FlushSettings,
}

impl std::fmt::Debug for FlushScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlushScheduler")
            .field("outbox", &self.outbox)
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl FlushScheduler {
    /// Create a scheduler over a shared outbox
    #[must_use]
    pub fn new(outbox: Arc<Outbox>, transport: Arc<dyn Transport>, settings: FlushSettings) -> Self {
        Self {
            outbox,
            transport,
            settings,
        }
    }

    /// Shared outbox
    #[inline]
    #[must_use]
    pub fn outbox(&self) -> &Arc<Outbox> {
        &self.outbox
    }

    /// One cycle: peek, deliver in order until the first failure, ack prefix
    pub async fn flush_once(&self) -> FlushOutcome {
        let batch = self.outbox.peek_batch(self.settings.batch_size);
        if batch.is_empty() {
            return FlushOutcome::default();
        }

        let mut sent = 0usize;
        let mut failure = None;
        for record in &batch {
            match self.transport.attempt_deliver(record).await {
                Ok(()) => {
                    sent += 1;
                    tracing::debug!("[flushed] {}", record.label());
                }
                Err(e) => {
                    tracing::debug!("[hold] retry fail -> {} err={e}", record.label());
                    failure = Some(e);
                    break;
                }
            }
        }

        let delivered = match self.outbox.acknowledge_prefix(sent) {
            Ok(n) => n,
            Err(e) => {
                tracing::error!("ack of {sent} delivered records failed, will resend: {e}");
                0
            }
        };
        let outcome = FlushOutcome {
            attempted: sent + usize::from(failure.is_some()),
            delivered,
            failure,
            remaining: self.outbox.len(),
        };

        match &outcome.failure {
            Some(e) => tracing::info!(
                "flush: {} delivered, stopped on failure ({e}), {} pending",
                outcome.delivered,
                outcome.remaining
            ),
            None => tracing::info!(
                "flush: {} delivered, {} pending",
                outcome.delivered,
                outcome.remaining
            ),
        }
        outcome
    }

    /// Flush repeatedly with backoff until empty or a round makes no progress
    pub async fn drain(&self) -> DrainReport {
        let mut report = DrainReport::default();

        while !self.outbox.is_empty() && report.rounds < self.settings.drain_max_rounds {
            let outcome = self.flush_once().await;
            report.rounds += 1;
            report.delivered += outcome.delivered;

            if outcome.delivered == 0 || outcome.remaining == 0 {
                break;
            }
            tokio::time::sleep(self.settings.drain_backoff).await;
        }

        report.remaining = self.outbox.len();
        tracing::info!(
            "drain: {} delivered in {} rounds, {} left",
            report.delivered,
            report.rounds,
            report.remaining
        );
        report
    }

    /// Periodic loop; on shutdown performs a final drain and returns
    ///
    /// The shutdown signal is observed at the top of each period; a cycle
    /// already in flight runs to completion. A dropped sender counts as
    /// shutdown.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> FlushReport {
        let mut report = FlushReport::default();
        let mut ticker = tokio::time::interval(self.settings.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                _ = ticker.tick() => {
                    let outcome = self.flush_once().await;
                    if !outcome.is_idle() {
                        report.cycles += 1;
                        report.delivered += outcome.delivered as u64;
                        if outcome.failure.is_some() {
                            report.failed_cycles += 1;
                        }
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        tracing::info!("flush scheduler stopping, draining {} pending", self.outbox.len());
        report.drain = self.drain().await;
        report
    }

    /// Run on a spawned task
    #[must_use]
    pub fn spawn(self: Arc<Self>, shutdown: watch::Receiver<bool>) -> JoinHandle<FlushReport> {
        tokio::spawn(async move { self.run(shutdown).await })
    }
}
