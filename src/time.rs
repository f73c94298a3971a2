//! Time sources
//!
//! The clock reads seconds from an injected source so that tests and offline
//! renders can run on virtual time.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// A monotonically non-decreasing reading in seconds.
pub trait TimeSource: Send + Sync {
    fn now(&self) -> f64;
}

impl<F> TimeSource for F
where
    F: Fn() -> f64 + Send + Sync,
{
    fn now(&self) -> f64 {
        self()
    }
}

/// Wall-clock seconds since construction.
#[derive(Clone, Copy, Debug)]
pub struct MonotonicTime {
    anchor: Instant,
}

impl MonotonicTime {
    pub fn new() -> Self {
        Self {
            anchor: Instant::now(),
        }
    }
}

impl Default for MonotonicTime {
    fn default() -> Self {
        Self::new()
    }
}

impl TimeSource for MonotonicTime {
    fn now(&self) -> f64 {
        self.anchor.elapsed().as_secs_f64()
    }
}

/// Manually advanced time. Clones share the same reading.
#[derive(Clone, Debug, Default)]
pub struct VirtualTime {
    bits: Arc<AtomicU64>,
}

impl VirtualTime {
    pub fn new(start: f64) -> Self {
        Self {
            bits: Arc::new(AtomicU64::new(start.to_bits())),
        }
    }

    pub fn set(&self, seconds: f64) {
        self.bits.store(seconds.to_bits(), Ordering::SeqCst);
    }

    pub fn advance(&self, seconds: f64) {
        self.set(self.now() + seconds);
    }
}

impl TimeSource for VirtualTime {
    fn now(&self) -> f64 {
        f64::from_bits(self.bits.load(Ordering::SeqCst))
    }
}
