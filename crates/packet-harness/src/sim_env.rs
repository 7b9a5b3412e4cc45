//! Deterministic [`Environment`] backed by turmoil's virtual clock and a
//! seeded RNG, for reproducible simulation of timer-driven behavior
//! (heartbeats, pending/idle reaps) without wall-clock sleeps.

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use packet_core::Environment;
use rand::{RngCore, SeedableRng};
use rand_chacha::ChaCha8Rng;

/// Simulation environment: virtual time (via turmoil's patched `tokio::time`)
/// and a seeded `ChaCha8Rng` for deterministic "randomness".
#[derive(Clone)]
pub struct SimEnv {
    rng: Arc<Mutex<ChaCha8Rng>>,
}

impl SimEnv {
    /// Builds a simulation environment seeded with `seed`. Same seed, same
    /// sequence of `random_*` outputs.
    #[must_use]
    pub fn with_seed(seed: u64) -> Self {
        Self { rng: Arc::new(Mutex::new(ChaCha8Rng::seed_from_u64(seed))) }
    }

    /// Builds a simulation environment with a fixed default seed.
    #[must_use]
    pub fn new() -> Self {
        Self::with_seed(0)
    }
}

impl Default for SimEnv {
    fn default() -> Self {
        Self::new()
    }
}

impl Environment for SimEnv {
    type Instant = tokio::time::Instant;

    fn now(&self) -> Self::Instant {
        tokio::time::Instant::now()
    }

    fn wall_clock_secs(&self) -> u64 {
        0
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }

    fn random_bytes(&self, buffer: &mut [u8]) {
        self.rng.lock().expect("sim RNG lock poisoned").fill_bytes(buffer);
    }
}
