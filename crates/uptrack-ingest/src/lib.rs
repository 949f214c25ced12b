//! Uptrack Ingest - idempotent collector for session updates
//!
//! Devices deliver records at least once; this crate makes that safe. Each
//! record is upserted by its dedup key, so redelivery never duplicates a
//! progress point or corrupts a session rollup.
//!
//! # Example
//!
//! ```rust,ignore
//! use uptrack_ingest::{serve, IngestConfig};
//!
//! # async fn example() -> Result<(), uptrack_ingest::IngestError> {
//! let config = IngestConfig::new().with_journal("ingest.jsonl");
//! serve(&config, async { tokio::signal::ctrl_c().await.ok(); }).await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod payload;
pub mod server;
pub mod store;

pub use config::IngestConfig;
pub use error::{IngestConfigError, IngestError, PayloadError, StoreError};
pub use payload::IncomingRecord;
pub use server::{bind, open_store, routes, serve, IngestReply, MAX_BODY_BYTES};
pub use store::{DeviceSeen, IngestStore, SessionAggregate, UpsertOutcome};

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
