//! Tick sources
//!
//! A tick source yields the device seconds credited to the running session at
//! each step. [`PacedTicks`] sleeps between ticks with optional jitter;
//! [`InstantTicks`] never sleeps and is used for deterministic runs.

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::Arc;
use std::time::Duration;

/// Producer of monotonic device time
#[async_trait::async_trait]
pub trait TickSource: Send {
    /// Wait for the next tick and return the device seconds it represents
    async fn tick(&mut self) -> u64;
}

/// Real-time ticks: one tick every `interval ± jitter`
#[derive(Debug)]
pub struct PacedTicks {
    interval: Duration,
    jitter_ms: u64,
    seconds_per_tick: u64,
    rng: Arc<Mutex<StdRng>>,
}

impl PacedTicks {
    /// Create a paced source sharing the simulation RNG
    #[must_use]
    pub fn new(
        interval: Duration,
        jitter_ms: u64,
        seconds_per_tick: u64,
        rng: Arc<Mutex<StdRng>>,
    ) -> Self {
        Self {
            interval,
            jitter_ms,
            seconds_per_tick: seconds_per_tick.max(1),
            rng,
        }
    }

    /// Next sleep duration, never below one millisecond
    #[must_use]
    pub fn next_delay(&self) -> Duration {
        let base = i128::try_from(self.interval.as_millis()).unwrap_or(i128::MAX);
        let jitter = if self.jitter_ms > 0 {
            let bound = i128::from(self.jitter_ms);
            self.rng.lock().random_range(-bound..=bound)
        } else {
            0
        };
        let millis = (base + jitter).max(1);
        Duration::from_millis(u64::try_from(millis).unwrap_or(u64::MAX))
    }
}

#[async_trait::async_trait]
impl TickSource for PacedTicks {
    async fn tick(&mut self) -> u64 {
        tokio::time::sleep(self.next_delay()).await;
        self.seconds_per_tick
    }
}

/// Unpaced ticks of a fixed size
#[derive(Debug, Clone, Copy)]
pub struct InstantTicks {
    seconds_per_tick: u64,
}

impl InstantTicks {
    /// Create an unpaced source
    #[inline]
    #[must_use]
    pub fn new(seconds_per_tick: u64) -> Self {
        Self {
            seconds_per_tick: seconds_per_tick.max(1),
        }
    }
}

#[async_trait::async_trait]
impl TickSource for InstantTicks {
    async fn tick(&mut self) -> u64 {
        tokio::task::yield_now().await;
        self.seconds_per_tick
    }
}

/// Seeded (or entropy-seeded) RNG shared across the simulation
#[must_use]
pub fn shared_rng(seed: Option<u64>) -> Arc<Mutex<StdRng>> {
    let rng = match seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_os_rng(),
    };
    Arc::new(Mutex::new(rng))
}
