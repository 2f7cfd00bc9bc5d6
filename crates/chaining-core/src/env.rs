//! Environment abstraction for time, sleeping and randomness.
//!
//! Role drivers never call the clock, the async sleeper or an OS RNG
//! directly; they go through an [`Environment`]. Production binds it to the
//! system. Test environments hand out seeded RNGs and sleeps that return at
//! once, so connection retry runs without waiting.
//!
//! # Invariants
//!
//! - Monotonicity: `env.now()` must never go backwards
//! - Determinism: given the same seed, `rng()` yields the same stream

use std::time::{Duration, Instant};

use rand::{CryptoRng, RngCore};

/// Time, sleeping and randomness for protocol drivers.
pub trait Environment: Clone + Send + Sync + 'static {
    /// Cryptographic RNG handed to encryption and key generation.
    type Rng: RngCore + CryptoRng + Send;

    /// Returns the current time.
    fn now(&self) -> Instant;

    /// Sleeps for the specified duration.
    ///
    /// Only used by connection retry; protocol rounds never time out.
    fn sleep(&self, duration: Duration) -> impl std::future::Future<Output = ()> + Send;

    /// A fresh RNG for one role or one batch.
    fn rng(&self) -> Self::Rng;
}
