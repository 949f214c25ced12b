//! End-to-end device simulation
//!
//! Wires the two independent schedules together: the device runner producing
//! into the outbox and the flush scheduler consuming from it. When the
//! sessions are done the scheduler is signalled, drains, and both reports are
//! returned.

use crate::clock::{shared_rng, PacedTicks, TickSource};
use crate::config::DeviceConfig;
use crate::device::{DeviceReport, DeviceRunner};
use crate::error::UptrackError;
use crate::flush::{FlushReport, FlushScheduler, FlushSettings};
use crate::outbox::{Outbox, OutboxOptions, OutboxStats};
use crate::policy::RandomFaults;
use crate::transport::{FaultyTransport, HttpTransport, Transport};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use std::sync::Arc;
use tokio::sync::watch;

/// Combined result of a simulation run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SimulationReport {
    /// Producer side
    pub device: DeviceReport,
    /// Consumer side
    pub flush: FlushReport,
    /// Final outbox counters
    pub outbox: OutboxStats,
}

impl SimulationReport {
    /// One-line summary
    #[must_use]
    pub fn summary(&self) -> String {
        format!(
            "sessions={} emitted={} sent={} pending={} evicted={} refused={}",
            self.device.sessions,
            self.device.emitted,
            self.outbox.delivered,
            self.outbox.pending,
            self.outbox.evicted,
            self.device.refused,
        )
    }
}

/// Open the outbox described by `config` (journal-backed when a path is set)
///
/// # Errors
/// `UptrackError::Outbox` if the journal cannot be opened or replayed.
pub fn open_outbox(config: &DeviceConfig) -> Result<Outbox, UptrackError> {
    let mut options = OutboxOptions::new();
    if let Some(capacity) = config.outbox_capacity {
        options = options.with_capacity(capacity, config.overflow_policy);
    }
    Ok(match &config.outbox_path {
        Some(path) => Outbox::open(path, options)?,
        None => Outbox::with_options(options),
    })
}

/// Run the simulator against a real HTTP endpoint
///
/// # Errors
/// Outbox or HTTP client construction failures. Delivery failures are
/// never errors.
pub async fn run_simulation(config: DeviceConfig) -> Result<SimulationReport, UptrackError> {
    let config = config.sanitized();
    let rng = shared_rng(config.seed);
    let outbox = Arc::new(open_outbox(&config)?);

    let http = HttpTransport::new(config.endpoint.clone(), config.request_timeout())?;
    let faults = RandomFaults::new(
        config.offline_probability,
        config.server_error_probability,
        Arc::clone(&rng),
    );
    let transport: Arc<dyn Transport> = Arc::new(FaultyTransport::new(http, faults));
    let ticks = PacedTicks::new(
        config.tick_interval(),
        config.jitter_ms,
        config.tick_seconds,
        Arc::clone(&rng),
    );

    tracing::info!(
        "starting simulator: device={} url={} sessions={}",
        config.device_id,
        config.endpoint,
        config.sessions
    );
    Ok(run_simulation_with(config, outbox, transport, ticks, rng).await)
}

/// Run the simulator with injected collaborators
pub async fn run_simulation_with<T>(
    config: DeviceConfig,
    outbox: Arc<Outbox>,
    transport: Arc<dyn Transport>,
    ticks: T,
    rng: Arc<Mutex<StdRng>>,
) -> SimulationReport
where
    T: TickSource,
{
    let config = config.sanitized();
    let scheduler = Arc::new(FlushScheduler::new(
        Arc::clone(&outbox),
        transport,
        FlushSettings::from_config(&config),
    ));
    let (stop_tx, stop_rx) = watch::channel(false);
    let flush_task = Arc::clone(&scheduler).spawn(stop_rx);

    let mut runner = DeviceRunner::new(config, Arc::clone(&outbox), ticks, rng);
    let device = runner.run().await;

    let _ = stop_tx.send(true);
    let flush = match flush_task.await {
        Ok(report) => report,
        Err(e) => {
            tracing::error!("flush task ended abnormally: {e}");
            FlushReport::default()
        }
    };

    let report = SimulationReport {
        device,
        flush,
        outbox: outbox.stats(),
    };
    tracing::info!("done: {}", report.summary());
    report
}
