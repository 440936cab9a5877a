// This file is part of the edge orchestrator, a video-analytics edge appliance runtime.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Clock interface and implementations for testability.
//!
//! Nearly every component on the edge needs "what time is it" (for baseline staleness,
//! retention ages, heartbeat cadence, tunnel reconnect backoff). Routing all of that through
//! a trait rather than calling `jiff::Timestamp::now()` / `std::time::Instant::now()` directly
//! lets tests advance time deterministically instead of sleeping for real.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use jiff::Timestamp;

/// Abstract interface to the system clocks.
pub trait Clocks: Send + Sync + 'static {
    /// Returns the current wall-clock time.
    fn realtime(&self) -> Timestamp;

    /// Returns a monotonic instant, unaffected by wall-clock adjustments.
    fn monotonic(&self) -> Instant;

    /// Blocks the current thread for `how_long`. Implementations used in async contexts
    /// should prefer `tokio::time::sleep`; this exists for the handful of call sites (CLI
    /// startup checks, blocking retry loops) that run outside the runtime.
    fn sleep(&self, how_long: Duration);
}

/// The real system clock.
#[derive(Clone, Copy, Debug, Default)]
pub struct RealClocks;

impl Clocks for RealClocks {
    fn realtime(&self) -> Timestamp {
        Timestamp::now()
    }

    fn monotonic(&self) -> Instant {
        Instant::now()
    }

    fn sleep(&self, how_long: Duration) {
        std::thread::sleep(how_long);
    }
}

/// A clock that only advances when told to, for deterministic tests of timers, baseline
/// staleness, and retry backoff.
#[derive(Clone)]
pub struct SimulatedClocks(Arc<Mutex<SimulatedClocksInner>>);

struct SimulatedClocksInner {
    realtime: Timestamp,
    monotonic: Instant,
    elapsed: Duration,
}

impl SimulatedClocks {
    pub fn new(start: Timestamp) -> Self {
        SimulatedClocks(Arc::new(Mutex::new(SimulatedClocksInner {
            realtime: start,
            monotonic: Instant::now(),
            elapsed: Duration::ZERO,
        })))
    }

    /// Advances both the simulated wall clock and monotonic clock by `by`.
    pub fn advance(&self, by: Duration) {
        let mut l = self.0.lock().unwrap();
        l.realtime = l.realtime.checked_add(by).expect("no timestamp overflow");
        l.elapsed += by;
    }
}

impl Clocks for SimulatedClocks {
    fn realtime(&self) -> Timestamp {
        self.0.lock().unwrap().realtime
    }

    fn monotonic(&self) -> Instant {
        let l = self.0.lock().unwrap();
        l.monotonic + l.elapsed
    }

    fn sleep(&self, how_long: Duration) {
        self.advance(how_long);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn simulated_clock_advances_on_sleep() {
        let start = Timestamp::now();
        let c = SimulatedClocks::new(start);
        let before = c.monotonic();
        c.sleep(Duration::from_secs(30));
        assert_eq!(c.realtime(), start.checked_add(Duration::from_secs(30)).unwrap());
        assert_eq!(c.monotonic() - before, Duration::from_secs(30));
    }
}
