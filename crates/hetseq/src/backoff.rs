//! Adaptive backoff for the blocking paths of the queue.
//!
//! The lock-free core never waits; waiting is confined to `Blocking`
//! operations that lose a page-rollover race or find the free-page cache
//! empty. Those spin with PAUSE hints first, then yield to the OS.

use std::hint;
use std::thread;

/// Adaptive backoff strategy (Crossbeam-style).
///
/// Progressively increases wait time: spin with PAUSE → yield to OS.
/// Unlike a bounded retry helper, blocking queue operations never give up;
/// [`is_saturated`](Backoff::is_saturated) only reports that the backoff has
/// reached the yield stage.
#[derive(Debug, Default)]
pub struct Backoff {
    step: u32,
}

impl Backoff {
    const SPIN_LIMIT: u32 = 6; // 2^6 = 64 spins max before yielding

    /// Creates a new backoff instance.
    #[inline]
    pub fn new() -> Self {
        Self { step: 0 }
    }

    /// Light spin with PAUSE hints.
    #[inline]
    pub fn spin(&mut self) {
        let spins = 1 << self.step.min(Self::SPIN_LIMIT);
        for _ in 0..spins {
            hint::spin_loop();
        }
        if self.step <= Self::SPIN_LIMIT {
            self.step += 1;
        }
    }

    /// Heavier backoff: spin while cheap, then yield the thread.
    #[inline]
    pub fn snooze(&mut self) {
        if self.step <= Self::SPIN_LIMIT {
            self.spin();
        } else {
            thread::yield_now();
        }
    }

    /// True once the backoff has escalated past spinning.
    #[inline]
    pub fn is_saturated(&self) -> bool {
        self.step > Self::SPIN_LIMIT
    }

    /// Reset for the next wait cycle.
    #[inline]
    pub fn reset(&mut self) {
        self.step = 0;
    }
}
