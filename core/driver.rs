// This file is part of a security camera network recording coordinator.
// Copyright (C) 2018 The Moonfire NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! The camera driver contract: `open(path) -> handle`,
//! `stop(handle) -> result`, `abort(handle)`. The real driver that talks to
//! camera hardware is out of scope here; this module defines the interface
//! and two stand-ins used in development and tests.
//!
//! The driver is treated as a black box that may block, so it
//! runs on its own thread and communicates via channels rather than sharing
//! mutable state with the state machine that owns it.

use base::bail_t;
use std::path::PathBuf;
use std::time::Duration;

/// Outcome of closing a recording file.
#[derive(Clone, Debug)]
pub struct FinalizeResult {
    pub size_bytes: u64,
    pub duration_seconds: f64,
}

/// A handle to an open recording session on a single node.
pub trait DriverHandle: Send + 'static {
    /// Signals the driver to stop and flush, blocking up to `grace`.
    /// Must return within `grace` even if flushing hasn't finished; in that
    /// case the file is forcefully closed at its last fsynced length.
    fn stop(self: Box<Self>, grace: Duration) -> Result<FinalizeResult, base::Error>;

    /// Aborts an armed-but-not-started recording; no file is preserved.
    fn abort(self: Box<Self>);
}

/// Selected at startup from configuration.
pub trait CameraDriver: Send + Sync + 'static {
    /// Whether a camera is currently detected on this node.
    fn camera_detected(&self) -> bool;

    /// Opens a new recording file at `path`. Called on `arm`.
    fn open(&self, path: &PathBuf) -> Result<Box<dyn DriverHandle>, base::Error>;
}

/// A driver that behaves as if a camera were attached and recording
/// succeeds, writing a tiny placeholder file so the rest of the pipeline
/// (checksum, manifest, offload) has real bytes to operate on.
pub struct SimulatedDriver {
    camera_detected: bool,
}

impl SimulatedDriver {
    pub fn new(camera_detected: bool) -> Self {
        SimulatedDriver { camera_detected }
    }
}

struct SimulatedHandle {
    path: PathBuf,
    opened_at: std::time::Instant,
}

impl DriverHandle for SimulatedHandle {
    fn stop(self: Box<Self>, _grace: Duration) -> Result<FinalizeResult, base::Error> {
        let duration_seconds = self.opened_at.elapsed().as_secs_f64();
        let payload = format!(
            "simulated recording\nopened {} ago\n",
            humanize(self.opened_at.elapsed())
        );
        std::fs::write(&self.path, payload.as_bytes())?;
        let size_bytes = std::fs::metadata(&self.path)?.len();
        Ok(FinalizeResult {
            size_bytes,
            duration_seconds,
        })
    }

    fn abort(self: Box<Self>) {
        let _ = std::fs::remove_file(&self.path);
    }
}

fn humanize(d: Duration) -> String {
    format!("{:.1}s", d.as_secs_f64())
}

impl CameraDriver for SimulatedDriver {
    fn camera_detected(&self) -> bool {
        self.camera_detected
    }

    fn open(&self, path: &PathBuf) -> Result<Box<dyn DriverHandle>, base::Error> {
        if !self.camera_detected {
            bail_t!(Unavailable, "no camera detected");
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, b"")?;
        Ok(Box::new(SimulatedHandle {
            path: path.clone(),
            opened_at: std::time::Instant::now(),
        }))
    }
}

/// A driver fixture for unit tests: deterministic, optionally fails `open`
/// or `stop` to exercise the `DriverFailure` / `ERROR` path.
pub struct TestFixtureDriver {
    pub camera_detected: bool,
    pub fail_open: bool,
    pub fail_stop: bool,
}

impl Default for TestFixtureDriver {
    fn default() -> Self {
        TestFixtureDriver {
            camera_detected: true,
            fail_open: false,
            fail_stop: false,
        }
    }
}

struct TestFixtureHandle {
    path: PathBuf,
    fail_stop: bool,
}

impl DriverHandle for TestFixtureHandle {
    fn stop(self: Box<Self>, _grace: Duration) -> Result<FinalizeResult, base::Error> {
        if self.fail_stop {
            bail_t!(Internal, "fixture: simulated driver write failure");
        }
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.path, b"fixture recording")?;
        Ok(FinalizeResult {
            size_bytes: std::fs::metadata(&self.path)?.len(),
            duration_seconds: 1.0,
        })
    }

    fn abort(self: Box<Self>) {
        let _ = std::fs::remove_file(&self.path);
    }
}

impl CameraDriver for TestFixtureDriver {
    fn camera_detected(&self) -> bool {
        self.camera_detected
    }

    fn open(&self, path: &PathBuf) -> Result<Box<dyn DriverHandle>, base::Error> {
        if !self.camera_detected {
            bail_t!(Unavailable, "fixture: no camera detected");
        }
        if self.fail_open {
            bail_t!(Internal, "fixture: simulated open failure");
        }
        Ok(Box::new(TestFixtureHandle {
            path: path.clone(),
            fail_stop: self.fail_stop,
        }))
    }
}

