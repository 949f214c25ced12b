//! Uptrack Core - device-side run-time session sync
//!
//! A device tracks run-time sessions and reports their progress to a remote
//! collector over an unreliable link:
//! - Session state machine emitting cumulative progress on a fixed cadence
//! - Durable FIFO outbox decoupling production from delivery
//! - Flush scheduler that delivers oldest-first and stops at the first failure
//! - Transport client making one best-effort attempt per record
//!
//! Every record carries a dedup key, so redelivery after a lost
//! acknowledgment is harmless at an idempotent receiver.
//!
//! # Example
//!
//! ```rust,ignore
//! use uptrack_core::prelude::*;
//!
//! # async fn example() -> Result<(), UptrackError> {
//! let config = DeviceConfig::new()
//!     .with_device_id("airplane-N20503")
//!     .with_endpoint("http://127.0.0.1:8080/ingest");
//! let report = run_simulation(config).await?;
//!
//! println!("{}", report.summary());
//! # Ok(())
//! # }
//! ```

pub mod checkpoint;
pub mod clock;
pub mod config;
pub mod device;
pub mod error;
pub mod flush;
pub mod outbox;
pub mod policy;
pub mod session;
pub mod simulation;
pub mod transport;
pub mod types;

// Re-exports for convenience
pub use checkpoint::CheckpointStore;
pub use clock::{shared_rng, InstantTicks, PacedTicks, TickSource};
pub use config::{DeviceConfig, OverflowPolicy, DEVICE_ID_ENV, INGEST_URL_ENV};
pub use device::{DeviceReport, DeviceRunner};
pub use error::{
    CheckpointError, ConfigError, DeliveryError, OutboxError, SessionError, UptrackError,
};
pub use flush::{DrainReport, FlushOutcome, FlushReport, FlushScheduler, FlushSettings};
pub use outbox::{Outbox, OutboxOptions, OutboxStats};
pub use policy::{FaultPolicy, NoFaults, RandomFaults, ScriptedFaults};
pub use session::{SessionMachine, SessionPlan, SessionSnapshot, SessionState};
pub use simulation::{open_outbox, run_simulation, run_simulation_with, SimulationReport};
pub use transport::{FaultyTransport, HttpTransport, Transport};
pub use types::{DedupKey, SessionStatus, UpdateRecord};

/// Prelude module for common imports
pub mod prelude {
    //! Common imports for working with Uptrack Core
    pub use crate::{
        run_simulation, DeliveryError, DeviceConfig, FlushScheduler, FlushSettings, Outbox,
        SessionMachine, SessionPlan, SessionStatus, Transport, UpdateRecord, UptrackError,
    };
}

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
