// This file is part of a security camera network recording coordinator.
// Copyright (C) 2018 The Moonfire NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Time-Sync Discipline: slaves query the master periodically
//! and estimate clock offset with a simple round-trip estimator.

use base::clock::Clocks;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// The four timestamps of one round-trip sync query.
#[derive(Copy, Clone, Debug)]
pub struct RoundTrip {
    pub t_slave_send: jiff::Timestamp,
    pub t_master_recv: jiff::Timestamp,
    pub t_master_send: jiff::Timestamp,
    pub t_slave_recv: jiff::Timestamp,
}

impl RoundTrip {
    /// `offset ~= ((t_master_recv + t_master_send) / 2) - ((t_slave_send + t_slave_recv) / 2)`.
    pub fn offset_ms(&self) -> f64 {
        let master_mid = midpoint(self.t_master_recv, self.t_master_send);
        let slave_mid = midpoint(self.t_slave_send, self.t_slave_recv);
        master_mid.since(slave_mid).and_then(|s| s.total(jiff::Unit::Millisecond)).unwrap_or(f64::NAN)
    }

    pub fn rtt_ms(&self) -> f64 {
        self.t_slave_recv
            .since(self.t_slave_send)
            .and_then(|s| s.total(jiff::Unit::Millisecond))
            .unwrap_or(f64::NAN)
    }
}

fn midpoint(a: jiff::Timestamp, b: jiff::Timestamp) -> jiff::Timestamp {
    let span = b.since(a).unwrap_or_default();
    let half_ns = span.total(jiff::Unit::Nanosecond).unwrap_or(0.0) / 2.0;
    let half_span = jiff::Span::new().nanoseconds(half_ns as i64);
    a.checked_add(half_span).unwrap_or(a)
}

#[derive(Copy, Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncClass {
    Ok,
    Warn,
    Fail,
}

#[derive(Copy, Clone, Debug, Serialize, Deserialize)]
pub struct SyncStatus {
    pub offset_ms: f64,
    pub rtt_ms: f64,
    pub classification: SyncClass,
    pub last_success_age: Option<Duration>,
}

struct State {
    offset_ms: f64,
    rtt_ms: f64,
    last_success_monotonic: Option<std::time::Instant>,
}

/// Classifies offset/rtt/staleness into ok/warn/fail. The master node is
/// always `Ok` by definition -- it is the reference, not a slave of itself.
pub struct SyncMonitor<C: Clocks> {
    clocks: C,
    tolerance_ms: f64,
    rtt_max_ms: f64,
    stale: Duration,
    is_master: bool,
    state: Mutex<State>,
}

impl<C: Clocks> SyncMonitor<C> {
    pub fn new(clocks: C, tolerance_ms: f64, rtt_max_ms: f64, stale: Duration, is_master: bool) -> Self {
        SyncMonitor {
            clocks,
            tolerance_ms,
            rtt_max_ms,
            stale,
            is_master,
            state: Mutex::new(State {
                offset_ms: 0.0,
                rtt_ms: 0.0,
                last_success_monotonic: None,
            }),
        }
    }

    /// Records the result of a completed round-trip. A sync
    /// query superseded by a newer one, or abandoned at shutdown, simply
    /// never calls this -- it never blocks a state transition.
    pub fn record(&self, rt: RoundTrip) {
        let mut state = self.state.lock();
        state.offset_ms = rt.offset_ms();
        state.rtt_ms = rt.rtt_ms();
        state.last_success_monotonic = Some(self.clocks.monotonic_now());
    }

    pub fn status(&self) -> SyncStatus {
        if self.is_master {
            return SyncStatus {
                offset_ms: 0.0,
                rtt_ms: 0.0,
                classification: SyncClass::Ok,
                last_success_age: Some(Duration::ZERO),
            };
        }
        let state = self.state.lock();
        let age = state
            .last_success_monotonic
            .map(|t| self.clocks.monotonic_now().duration_since(t));
        let classification = match age {
            None => SyncClass::Fail,
            Some(age) if age > self.stale => SyncClass::Fail,
            Some(_) => {
                if state.offset_ms.abs() <= self.tolerance_ms && state.rtt_ms <= self.rtt_max_ms {
                    SyncClass::Ok
                } else if state.offset_ms.abs() <= 2.0 * self.tolerance_ms {
                    SyncClass::Warn
                } else {
                    SyncClass::Fail
                }
            }
        };
        SyncStatus {
            offset_ms: state.offset_ms,
            rtt_ms: state.rtt_ms,
            classification,
            last_success_age: age,
        }
    }

    /// The value fed to the state machine's `arm` precondition.
    /// `NaN` (never synced) fails the `|offset| <= tolerance` check there.
    pub fn offset_ms(&self) -> f64 {
        if self.is_master {
            return 0.0;
        }
        let state = self.state.lock();
        match state.last_success_monotonic {
            Some(t) if self.clocks.monotonic_now().duration_since(t) <= self.stale => state.offset_ms,
            _ => f64::NAN,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use base::clock::SimulatedClocks;

    fn rt(offset_ms: i64, rtt_ms: i64, boot: jiff::Timestamp) -> RoundTrip {
        let t_slave_send = boot;
        let t_slave_recv = boot.checked_add(jiff::Span::new().milliseconds(rtt_ms)).unwrap();
        let mid = boot.checked_add(jiff::Span::new().milliseconds(rtt_ms / 2 + offset_ms)).unwrap();
        RoundTrip {
            t_slave_send,
            t_master_recv: mid,
            t_master_send: mid,
            t_slave_recv,
        }
    }

    #[test]
    fn master_is_always_ok() {
        let clocks = SimulatedClocks::new(jiff::Timestamp::now());
        let mon = SyncMonitor::new(clocks, 5.0, 50.0, Duration::from_secs(60), true);
        assert_eq!(mon.status().classification, SyncClass::Ok);
        assert_eq!(mon.offset_ms(), 0.0);
    }

    #[test]
    fn unsynced_slave_is_fail() {
        let clocks = SimulatedClocks::new(jiff::Timestamp::now());
        let mon = SyncMonitor::new(clocks, 5.0, 50.0, Duration::from_secs(60), false);
        assert_eq!(mon.status().classification, SyncClass::Fail);
        assert!(mon.offset_ms().is_nan());
    }

    #[test]
    fn within_tolerance_classifies_ok() {
        let boot = jiff::Timestamp::now();
        let clocks = SimulatedClocks::new(boot);
        let mon = SyncMonitor::new(clocks, 5.0, 50.0, Duration::from_secs(60), false);
        mon.record(rt(2, 10, boot));
        assert_eq!(mon.status().classification, SyncClass::Ok);
    }

    #[test]
    fn double_tolerance_classifies_warn() {
        let boot = jiff::Timestamp::now();
        let clocks = SimulatedClocks::new(boot);
        let mon = SyncMonitor::new(clocks, 5.0, 50.0, Duration::from_secs(60), false);
        mon.record(rt(8, 10, boot));
        assert_eq!(mon.status().classification, SyncClass::Warn);
    }

    #[test]
    fn beyond_double_tolerance_classifies_fail() {
        let boot = jiff::Timestamp::now();
        let clocks = SimulatedClocks::new(boot);
        let mon = SyncMonitor::new(clocks, 5.0, 50.0, Duration::from_secs(60), false);
        mon.record(rt(50, 10, boot));
        assert_eq!(mon.status().classification, SyncClass::Fail);
    }

    #[test]
    fn stale_master_classifies_fail() {
        let boot = jiff::Timestamp::now();
        let clocks = SimulatedClocks::new(boot);
        let mon = SyncMonitor::new(clocks.clone(), 5.0, 50.0, Duration::from_secs(60), false);
        mon.record(rt(1, 5, boot));
        assert_eq!(mon.status().classification, SyncClass::Ok);
        clocks.advance(Duration::from_secs(61));
        assert_eq!(mon.status().classification, SyncClass::Fail);
        assert!(mon.offset_ms().is_nan());
    }
}
