//! Production Environment implementation using system time and RNG.

use std::time::{Duration, Instant};

use chaining_core::Environment;
use rand::{SeedableRng, rngs::StdRng};

/// Production environment using system time and OS-seeded randomness.
///
/// Each call to [`Environment::rng`] returns an independent `StdRng` seeded
/// from the OS entropy pool.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemEnv;

impl SystemEnv {
    /// Create a new system environment.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl Environment for SystemEnv {
    type Rng = StdRng;

    fn now(&self) -> Instant {
        Instant::now()
    }

    fn sleep(&self, duration: Duration) -> impl std::future::Future<Output = ()> + Send {
        tokio::time::sleep(duration)
    }

    fn rng(&self) -> Self::Rng {
        StdRng::from_entropy()
    }
}
