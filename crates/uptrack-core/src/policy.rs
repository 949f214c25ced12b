//! Fault policies
//!
//! A fault policy decides, before each delivery attempt, whether the attempt
//! is simulated as failing. Production runs use [`NoFaults`]; the simulator
//! uses [`RandomFaults`]; tests script exact failure sequences with
//! [`ScriptedFaults`].

use crate::error::DeliveryError;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::Rng;
use std::collections::VecDeque;
use std::sync::Arc;

/// Injectable failure decision
pub trait FaultPolicy: Send + Sync {
    /// `Err` to fail the upcoming attempt without touching the network
    ///
    /// # Errors
    /// The simulated failure.
    fn check(&self) -> Result<(), DeliveryError>;
}

impl<P: FaultPolicy + ?Sized> FaultPolicy for Arc<P> {
    fn check(&self) -> Result<(), DeliveryError> {
        (**self).check()
    }
}

/// Never fails
#[derive(Debug, Clone, Copy, Default)]
pub struct NoFaults;

impl FaultPolicy for NoFaults {
    fn check(&self) -> Result<(), DeliveryError> {
        Ok(())
    }
}

/// Independent per-attempt offline / server-error draws
#[derive(Debug)]
pub struct RandomFaults {
    offline_probability: f64,
    server_error_probability: f64,
    rng: Arc<Mutex<StdRng>>,
}

impl RandomFaults {
    /// Create a policy drawing from the shared simulation RNG
    #[must_use]
    pub fn new(offline_probability: f64, server_error_probability: f64, rng: Arc<Mutex<StdRng>>) -> Self {
        Self {
            offline_probability: offline_probability.clamp(0.0, 1.0),
            server_error_probability: server_error_probability.clamp(0.0, 1.0),
            rng,
        }
    }
}

impl FaultPolicy for RandomFaults {
    fn check(&self) -> Result<(), DeliveryError> {
        let mut rng = self.rng.lock();
        if self.offline_probability > 0.0 && rng.random::<f64>() < self.offline_probability {
            return Err(DeliveryError::Offline);
        }
        if self.server_error_probability > 0.0 && rng.random::<f64>() < self.server_error_probability {
            return Err(DeliveryError::SimulatedServerFailure);
        }
        Ok(())
    }
}

/// Plays back a fixed outcome sequence, then succeeds
#[derive(Debug, Default)]
pub struct ScriptedFaults {
    script: Mutex<VecDeque<Result<(), DeliveryError>>>,
}

impl ScriptedFaults {
    /// Create from an outcome sequence
    #[must_use]
    pub fn new(script: impl IntoIterator<Item = Result<(), DeliveryError>>) -> Self {
        Self {
            script: Mutex::new(script.into_iter().collect()),
        }
    }

    /// Fail the first `n` attempts with `error`
    #[must_use]
    pub fn fail_first(n: usize, error: DeliveryError) -> Self {
        Self::new(std::iter::repeat(Err(error)).take(n))
    }

    /// Outcomes not yet consumed
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.script.lock().len()
    }
}

impl FaultPolicy for ScriptedFaults {
    fn check(&self) -> Result<(), DeliveryError> {
        self.script.lock().pop_front().unwrap_or(Ok(()))
    }
}
