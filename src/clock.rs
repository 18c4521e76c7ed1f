//! Monotonic millisecond clock and the optional debug drop-rate source.

use std::time::Instant;

/// A source of monotonic milliseconds, abstracted so tests can substitute a
/// controllable clock without touching real time.
pub trait Clock: Send + Sync {
    /// Milliseconds elapsed since the clock was created. Must be
    /// monotonically non-decreasing.
    fn now_ms(&self) -> u64;
}

/// The real wall clock, backed by [`std::time::Instant`].
#[derive(Debug)]
pub struct SystemClock {
    epoch: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }
}

/// A clock driven entirely by test code, for deterministic timer tests.
#[cfg(test)]
pub struct ManualClock {
    ms: std::sync::atomic::AtomicU64,
}

#[cfg(test)]
impl ManualClock {
    pub fn new() -> Self {
        Self {
            ms: std::sync::atomic::AtomicU64::new(0),
        }
    }

    pub fn advance(&self, ms: u64) {
        self.ms.fetch_add(ms, std::sync::atomic::Ordering::SeqCst);
    }
}

#[cfg(test)]
impl Clock for ManualClock {
    fn now_ms(&self) -> u64 {
        self.ms.load(std::sync::atomic::Ordering::SeqCst)
    }
}

/// Debug-mode packet drop simulator, consulted only at the socket-write
/// boundary when the crate is built with the `chaos` feature.
#[cfg(feature = "chaos")]
pub struct DropSimulator {
    drop_rate: f32,
}

#[cfg(feature = "chaos")]
impl DropSimulator {
    pub fn new(drop_rate: f32) -> Self {
        Self {
            drop_rate: drop_rate.clamp(0.0, 1.0),
        }
    }

    /// Returns `true` if this outgoing packet should be silently dropped.
    pub fn should_drop(&self) -> bool {
        if self.drop_rate <= 0.0 {
            return false;
        }
        rand::Rng::gen::<f32>(&mut rand::thread_rng()) < self.drop_rate
    }
}
