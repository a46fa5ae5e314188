//! Injected time and randomness
//!
//! The execution engine never reads system time or entropy directly.
//! Both come in through these traits so a test run with fixed seeds
//! replays to byte-identical store contents.

use chrono::{DateTime, TimeZone, Utc};
use rand::rngs::StdRng;
use rand::{Rng, RngCore, SeedableRng};
use std::sync::atomic::{AtomicI64, Ordering};

/// Source of "now" for every timestamp the core writes.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;

    fn now_millis(&self) -> i64 {
        self.now().timestamp_millis()
    }
}

/// Wall clock, millisecond precision.
#[derive(Debug, Default, Clone)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        let millis = Utc::now().timestamp_millis();
        Utc.timestamp_millis_opt(millis).single().unwrap_or_else(Utc::now)
    }
}

/// Manually advanced clock for deterministic tests.
///
/// Only moves forward; advancing backward is a programming error.
#[derive(Debug)]
pub struct SimClock {
    millis: AtomicI64,
}

impl SimClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            millis: AtomicI64::new(start.timestamp_millis()),
        }
    }

    pub fn from_millis(millis: i64) -> Self {
        Self {
            millis: AtomicI64::new(millis),
        }
    }

    pub fn advance_ms(&self, delta: i64) {
        debug_assert!(delta >= 0, "SimClock: delta must be non-negative");
        self.millis.fetch_add(delta, Ordering::SeqCst);
    }

    pub fn set_millis(&self, millis: i64) {
        debug_assert!(
            millis >= self.millis.load(Ordering::SeqCst),
            "SimClock: cannot go backward"
        );
        self.millis.store(millis, Ordering::SeqCst);
    }
}

impl Clock for SimClock {
    fn now(&self) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(self.millis.load(Ordering::SeqCst))
            .single()
            .expect("SimClock millis out of chrono range")
    }

    fn now_millis(&self) -> i64 {
        self.millis.load(Ordering::SeqCst)
    }
}

/// Source of uniform random draws for slippage and latency jitter.
pub trait RandomSource: Send {
    /// Uniform draw in `[lo, hi)`. An empty range returns `lo`.
    fn uniform(&mut self, lo: f64, hi: f64) -> f64;

    fn next_u64(&mut self) -> u64;
}

/// Deterministic source backed by a seeded `StdRng`.
#[derive(Debug)]
pub struct SeededRng {
    rng: StdRng,
}

impl SeededRng {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }
}

impl RandomSource for SeededRng {
    fn uniform(&mut self, lo: f64, hi: f64) -> f64 {
        if hi <= lo {
            return lo;
        }
        self.rng.gen_range(lo..hi)
    }

    fn next_u64(&mut self) -> u64 {
        self.rng.next_u64()
    }
}

/// Entropy-seeded source for live runs.
#[derive(Debug)]
pub struct OsRandom {
    rng: StdRng,
}

impl Default for OsRandom {
    fn default() -> Self {
        Self {
            rng: StdRng::from_entropy(),
        }
    }
}

impl RandomSource for OsRandom {
    fn uniform(&mut self, lo: f64, hi: f64) -> f64 {
        if hi <= lo {
            return lo;
        }
        self.rng.gen_range(lo..hi)
    }

    fn next_u64(&mut self) -> u64 {
        self.rng.next_u64()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sim_clock_advances() {
        let clock = SimClock::from_millis(1_000);
        assert_eq!(clock.now_millis(), 1_000);
        clock.advance_ms(500);
        assert_eq!(clock.now_millis(), 1_500);
    }

    #[test]
    fn test_seeded_rng_replays() {
        let mut a = SeededRng::new(42);
        let mut b = SeededRng::new(42);
        for _ in 0..32 {
            assert_eq!(a.uniform(0.0, 1.0).to_bits(), b.uniform(0.0, 1.0).to_bits());
        }
    }

    #[test]
    fn test_uniform_empty_range_returns_lo() {
        let mut rng = SeededRng::new(7);
        assert_eq!(rng.uniform(0.0, 0.0), 0.0);
        assert_eq!(rng.uniform(3.0, 3.0), 3.0);
    }

    #[test]
    fn test_uniform_stays_in_range() {
        let mut rng = SeededRng::new(99);
        for _ in 0..1000 {
            let x = rng.uniform(2.0, 5.0);
            assert!((2.0..5.0).contains(&x));
        }
    }
}
