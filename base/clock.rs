// This file is part of a security camera network recording coordinator.
// Copyright (C) 2018 The Moonfire NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Clock interface and implementations for testability.
//!
//! The recording state machine and the time-sync monitor both reason about
//! wall-clock time (`started_at`, session IDs) and about a monotonic clock
//! (round-trip times, deadlines). Routing both through this trait lets tests
//! drive the clock deterministically instead of sleeping in real time.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Abstract interface to the system clocks. This is for testability.
pub trait Clocks: Send + Sync + 'static {
    /// The current wall-clock time.
    fn utc_now(&self) -> jiff::Timestamp;

    /// A monotonically increasing instant; never adjusted backwards by NTP.
    fn monotonic_now(&self) -> std::time::Instant;

    /// Sleeps the current (blocking) thread for `d`.
    fn sleep(&self, d: Duration);
}

#[derive(Copy, Clone, Default)]
pub struct RealClocks {}

impl Clocks for RealClocks {
    fn utc_now(&self) -> jiff::Timestamp {
        jiff::Timestamp::now()
    }

    fn monotonic_now(&self) -> std::time::Instant {
        std::time::Instant::now()
    }

    fn sleep(&self, d: Duration) {
        std::thread::sleep(d)
    }
}

/// A simulated clock for deterministic tests.
///
/// Time only ever advances via [`SimulatedClocks::advance`] (or `sleep`);
/// nothing here actually blocks the thread.
#[derive(Clone)]
pub struct SimulatedClocks(Arc<Inner>);

struct Inner {
    boot: jiff::Timestamp,
    base: std::time::Instant,
    elapsed_nanos: AtomicI64,
}

impl SimulatedClocks {
    pub fn new(boot: jiff::Timestamp) -> Self {
        SimulatedClocks(Arc::new(Inner {
            boot,
            base: std::time::Instant::now(),
            elapsed_nanos: AtomicI64::new(0),
        }))
    }

    /// Advances the clock by `d` without sleeping.
    pub fn advance(&self, d: Duration) {
        self.0
            .elapsed_nanos
            .fetch_add(d.as_nanos() as i64, Ordering::SeqCst);
    }

    fn elapsed(&self) -> Duration {
        Duration::from_nanos(self.0.elapsed_nanos.load(Ordering::SeqCst) as u64)
    }
}

impl Clocks for SimulatedClocks {
    fn utc_now(&self) -> jiff::Timestamp {
        let span: jiff::Span = self.elapsed().try_into().unwrap_or_default();
        self.0.boot.checked_add(span).unwrap_or(self.0.boot)
    }

    fn monotonic_now(&self) -> std::time::Instant {
        self.0.base + self.elapsed()
    }

    fn sleep(&self, d: Duration) {
        self.advance(d);
    }
}

/// Logs a warning if the guarded operation takes longer than expected.
pub struct TimerGuard<'a, C: Clocks + ?Sized, S: AsRef<str>, F: FnOnce() -> S + 'a> {
    clocks: &'a C,
    label_f: Option<F>,
    start: std::time::Instant,
    warn_after: Duration,
}

impl<'a, C: Clocks + ?Sized, S: AsRef<str>, F: FnOnce() -> S + 'a> TimerGuard<'a, C, S, F> {
    pub fn new(clocks: &'a C, label_f: F) -> Self {
        Self::with_threshold(clocks, label_f, Duration::from_secs(1))
    }

    pub fn with_threshold(clocks: &'a C, label_f: F, warn_after: Duration) -> Self {
        TimerGuard {
            clocks,
            label_f: Some(label_f),
            start: clocks.monotonic_now(),
            warn_after,
        }
    }
}

impl<'a, C, S, F> Drop for TimerGuard<'a, C, S, F>
where
    C: Clocks + ?Sized,
    S: AsRef<str>,
    F: FnOnce() -> S + 'a,
{
    fn drop(&mut self) {
        let elapsed = self.clocks.monotonic_now().duration_since(self.start);
        if elapsed >= self.warn_after {
            let label_f = self.label_f.take().unwrap();
            tracing::warn!(?elapsed, "{} took longer than expected", label_f().as_ref());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn simulated_clock_advances_both_clocks_together() {
        let boot = jiff::Timestamp::now();
        let c = SimulatedClocks::new(boot);
        let t0 = c.utc_now();
        let m0 = c.monotonic_now();
        c.advance(Duration::from_secs(5));
        assert_eq!(c.utc_now().since(t0).unwrap().total(jiff::Unit::Second).unwrap(), 5.0);
        assert_eq!(c.monotonic_now().duration_since(m0), Duration::from_secs(5));
    }
}
