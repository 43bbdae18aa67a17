// This file is part of a security camera network recording coordinator.
// Copyright (C) 2018 The Moonfire NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! The per-node recording state machine. Transitions are
//! serialized by a single mutex; status reads take the same mutex so they observe a consistent
//! snapshot.

use crate::checksum::sha256_file;
use crate::config::Config;
use crate::driver::{CameraDriver, DriverHandle};
use crate::manifest::{
    ChecksumInfo, DeviceInfo, FileInfo, Manifest, QualityInfo, RecordingRef, TimingInfo, VideoInfo,
};
use crate::model::{NodeId, NodeIdentity, OffloadState, Position, Recording, RecordingState, SessionId};
use base::clock::Clocks;
use base::{bail_t, format_err_t};
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// What `arm` reserved, carried forward to `start` and `stop`.
struct Armed {
    session_id: SessionId,
    handle: Box<dyn DriverHandle>,
    file_path: PathBuf,
    started_monotonic: Option<std::time::Instant>,
    started_wall: Option<jiff::Timestamp>,
}

enum Inner {
    Idle,
    Armed(Armed),
    Recording(Armed),
    /// Finalizing holds no driver handle; `stop` already consumed it.
    Finalizing { session_id: SessionId },
    Error { session_id: Option<SessionId> },
}

impl Inner {
    fn state(&self) -> RecordingState {
        match self {
            Inner::Idle => RecordingState::Idle,
            Inner::Armed(_) => RecordingState::Armed,
            Inner::Recording(_) => RecordingState::Recording,
            Inner::Finalizing { .. } => RecordingState::Finalizing,
            Inner::Error { .. } => RecordingState::Error,
        }
    }

    fn session_id(&self) -> Option<&SessionId> {
        match self {
            Inner::Idle => None,
            Inner::Armed(a) | Inner::Recording(a) => Some(&a.session_id),
            Inner::Finalizing { session_id } => Some(session_id),
            Inner::Error { session_id } => session_id.as_ref(),
        }
    }
}

/// Everything the state machine needs to decide whether `arm` may proceed
///, supplied by the node loop each call
/// since storage/sync/temperature are read fresh.
pub struct Preconditions {
    pub camera_detected: bool,
    pub storage_free_bytes: i64,
    pub sync_offset_ms: f64,
}

#[derive(Clone, Debug)]
pub struct StopSummary {
    pub recording: Recording,
}

/// The bounded per-node recording state machine. One instance per node
/// process; `identity` and `config` are immutable for its lifetime.
pub struct StateMachine<C: Clocks> {
    identity: NodeIdentity,
    config: Arc<Config>,
    driver: Arc<dyn CameraDriver>,
    clocks: C,
    inner: Mutex<Inner>,
    /// The most recently finalized session's summary, kept so a repeat
    /// `stop` call for it is idempotent rather than an error. Cleared on
    /// the next successful `arm` so a later, genuinely unstarted session
    /// can't be confused for this one.
    last_finalized: Mutex<Option<StopSummary>>,
}

impl<C: Clocks> StateMachine<C> {
    pub fn new(identity: NodeIdentity, config: Arc<Config>, driver: Arc<dyn CameraDriver>, clocks: C) -> Self {
        StateMachine {
            identity,
            config,
            driver,
            clocks,
            inner: Mutex::new(Inner::Idle),
            last_finalized: Mutex::new(None),
        }
    }

    pub fn current_state(&self) -> RecordingState {
        self.inner.lock().state()
    }

    pub fn current_session_id(&self) -> Option<SessionId> {
        self.inner.lock().session_id().cloned()
    }

    /// The full set of node ids participating in this cluster (this node
    /// plus every statically configured peer), used as the manifest's
    /// `expected_cameras` so the ingest server waits for all of them before
    /// publishing a session.
    fn cluster_node_ids(&self) -> Vec<NodeId> {
        std::iter::once(self.identity.node_id.clone())
            .chain(self.config.static_peers.iter().map(|p| p.node_id.clone()))
            .collect()
    }

    fn recording_path(&self, session_id: &SessionId) -> PathBuf {
        let recording_id = crate::model::recording_id(session_id, &self.identity.node_id);
        self.config
            .recordings_root
            .join(session_id.as_str())
            .join(&self.identity.node_id)
            .join(format!("{recording_id}.mov"))
    }

    /// `IDLE --arm(session_id)--> ARMED`.
    pub fn arm(&self, session_id: SessionId, pre: Preconditions) -> Result<(), base::Error> {
        let mut guard = self.inner.lock();
        if !matches!(&*guard, Inner::Idle) {
            bail_t!(
                FailedPrecondition,
                "cannot arm: node is {}, not IDLE",
                guard.state()
            );
        }
        if !pre.camera_detected {
            bail_t!(Unavailable, "no camera detected");
        }
        if pre.storage_free_bytes < self.config.min_free_bytes {
            bail_t!(
                FailedPrecondition,
                "only {} bytes free, need {}",
                pre.storage_free_bytes,
                self.config.min_free_bytes
            );
        }
        if !self.identity.is_master && pre.sync_offset_ms.abs() > self.config.sync_tolerance_ms {
            bail_t!(
                FailedPrecondition,
                "sync offset {:.2}ms exceeds tolerance {:.2}ms",
                pre.sync_offset_ms,
                self.config.sync_tolerance_ms
            );
        }

        let file_path = self.recording_path(&session_id);
        let handle = self.driver.open(&file_path)?;
        info!(node_id = %self.identity.node_id, %session_id, "armed");
        *guard = Inner::Armed(Armed {
            session_id,
            handle,
            file_path,
            started_monotonic: None,
            started_wall: None,
        });
        *self.last_finalized.lock() = None;
        Ok(())
    }

    /// `ARMED --abort--> IDLE`.
    pub fn abort(&self) -> Result<(), base::Error> {
        let mut guard = self.inner.lock();
        let armed = match std::mem::replace(&mut *guard, Inner::Idle) {
            Inner::Armed(a) => a,
            other => {
                let state = other.state();
                *guard = other;
                bail_t!(FailedPrecondition, "cannot abort: node is {}, not ARMED", state);
            }
        };
        armed.handle.abort();
        info!(node_id = %self.identity.node_id, session_id = %armed.session_id, "aborted");
        Ok(())
    }

    /// `ARMED --start--> RECORDING`.
    pub fn start(&self) -> Result<jiff::Timestamp, base::Error> {
        let mut guard = self.inner.lock();
        let mut armed = match std::mem::replace(&mut *guard, Inner::Idle) {
            Inner::Armed(a) => a,
            other => {
                let state = other.state();
                *guard = other;
                bail_t!(FailedPrecondition, "cannot start: node is {}, not ARMED", state);
            }
        };
        let wall = self.clocks.utc_now();
        armed.started_monotonic = Some(self.clocks.monotonic_now());
        armed.started_wall = Some(wall);
        info!(node_id = %self.identity.node_id, session_id = %armed.session_id, started_at = %wall, "recording");
        *guard = Inner::Recording(armed);
        Ok(wall)
    }

    /// `RECORDING --driver_fail--> ERROR`, called by whatever
    /// observes the driver failure (the node loop's watchdog).
    pub fn driver_fail(&self, reason: &str) {
        let mut guard = self.inner.lock();
        let session_id = match &*guard {
            Inner::Recording(a) => Some(a.session_id.clone()),
            _ => return,
        };
        warn!(node_id = %self.identity.node_id, ?session_id, %reason, "driver failure, entering ERROR");
        *guard = Inner::Error { session_id };
    }

    /// `RECORDING --stop--> FINALIZING --ok--> IDLE`. Idempotent:
    /// calling `stop` again for the same (or no) session after it has
    /// already finalized returns success without re-finalizing.
    pub fn stop(&self) -> Result<StopSummary, base::Error> {
        let mut guard = self.inner.lock();
        let armed = match std::mem::replace(&mut *guard, Inner::Idle) {
            Inner::Recording(a) => a,
            Inner::Idle => {
                *guard = Inner::Idle;
                drop(guard);
                if let Some(summary) = self.last_finalized.lock().clone() {
                    return Ok(summary);
                }
                bail_t!(FailedPrecondition, "cannot stop: node is IDLE, never recorded");
            }
            other @ (Inner::Armed(_) | Inner::Finalizing { .. } | Inner::Error { .. }) => {
                let state = other.state();
                *guard = other;
                bail_t!(FailedPrecondition, "cannot stop: node is {}, not RECORDING", state);
            }
        };
        let session_id = armed.session_id.clone();
        *guard = Inner::Finalizing {
            session_id: session_id.clone(),
        };
        drop(guard);

        let result = self.finalize(armed);

        let mut guard = self.inner.lock();
        match &result {
            Ok(summary) => {
                *guard = Inner::Idle;
                *self.last_finalized.lock() = Some(summary.clone());
            }
            Err(_) => {
                *guard = Inner::Error {
                    session_id: Some(session_id),
                };
            }
        }
        result
    }

    /// `FINALIZING --ok/fail--> IDLE/ERROR`: stops the driver, hashes the
    /// file, and writes the manifest.
    fn finalize(&self, armed: Armed) -> Result<StopSummary, base::Error> {
        let Armed {
            session_id,
            handle,
            file_path,
            started_monotonic,
            started_wall,
        } = armed;
        let result = handle.stop(self.config.stop_grace)?;
        let checksum = sha256_file(&file_path)?;
        let started_wall = started_wall
            .ok_or_else(|| format_err_t!(Internal, "finalizing a recording that never started"))?;
        let started_monotonic = started_monotonic
            .ok_or_else(|| format_err_t!(Internal, "finalizing a recording that never started"))?;
        let elapsed_span: jiff::Span = started_monotonic.elapsed().try_into().unwrap_or_default();
        let ended_wall = started_wall.checked_add(elapsed_span).unwrap_or(started_wall);

        let manifest = Manifest {
            version: crate::manifest::MANIFEST_VERSION.to_string(),
            recording: RecordingRef {
                id: crate::model::recording_id(&session_id, &self.identity.node_id),
                session_id: session_id.clone(),
                node_id: self.identity.node_id.clone(),
                position: self.identity.position,
            },
            file: FileInfo {
                name: file_path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .unwrap_or_default()
                    .to_string(),
                size_bytes: result.size_bytes,
                container: "mov".to_string(),
                codec: "h264".to_string(),
            },
            video: VideoInfo {
                width: 3840,
                height: 2160,
                fps: 30.0,
                bitrate_mbps: 0.0,
                duration_sec: result.duration_seconds,
            },
            timing: TimingInfo {
                start_time: started_wall,
                end_time: ended_wall,
                sync_ok: true,
                sync_offset_ms: 0.0,
            },
            checksum: ChecksumInfo {
                algorithm: "sha256".to_string(),
                value: checksum.clone(),
            },
            device: DeviceInfo {
                hostname: self.identity.node_id.clone(),
                endpoint: self.identity.endpoint.clone(),
                software_version: env!("CARGO_PKG_VERSION").to_string(),
            },
            quality: QualityInfo {
                dropped_frames: 0,
                temperature_avg_c: f64::NAN,
                temperature_max_c: f64::NAN,
            },
            expected_cameras: self.cluster_node_ids(),
        };

        let manifest_path = file_path.with_extension("json");
        std::fs::write(&manifest_path, manifest.to_json_vec())?;

        let recording = Recording {
            recording_id: manifest.recording.id.clone(),
            session_id,
            node_id: self.identity.node_id.clone(),
            file_path,
            size_bytes: result.size_bytes,
            duration_seconds: result.duration_seconds,
            checksum: Some(checksum),
            offload_state: OffloadState::Local,
        };
        info!(node_id = %self.identity.node_id, recording_id = %recording.recording_id, "finalized");
        Ok(StopSummary { recording })
    }

    /// `ERROR --reset--> IDLE`; an administrative recovery
    /// action, not part of the coordinator's normal fan-out.
    pub fn reset(&self) -> Result<(), base::Error> {
        let mut guard = self.inner.lock();
        if !matches!(&*guard, Inner::Error { .. }) {
            bail_t!(FailedPrecondition, "cannot reset: node is {}, not ERROR", guard.state());
        }
        *guard = Inner::Idle;
        Ok(())
    }

    pub fn identity(&self) -> &NodeIdentity {
        &self.identity
    }

    pub fn position(&self) -> Position {
        self.identity.position
    }
}

/// Blocks the calling thread waiting up to `grace` for the state machine to
/// leave RECORDING/FINALIZING on its own (used by node shutdown).
pub fn wait_for_quiescent<C: Clocks>(sm: &StateMachine<C>, grace: Duration) -> bool {
    let deadline = std::time::Instant::now() + grace;
    loop {
        match sm.current_state() {
            RecordingState::Recording | RecordingState::Finalizing => {
                if std::time::Instant::now() >= deadline {
                    return false;
                }
                std::thread::sleep(Duration::from_millis(20));
            }
            _ => return true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::TestFixtureDriver;
    use base::clock::SimulatedClocks;

    fn test_config(root: &std::path::Path) -> Arc<Config> {
        Arc::new(Config {
            identity: test_identity(),
            static_peers: vec![],
            master_endpoint: None,
            min_free_bytes: Config::default_min_free_bytes(),
            sync_tolerance_ms: Config::default_sync_tolerance_ms(),
            sync_rtt_max_ms: Config::default_sync_rtt_max_ms(),
            sync_stale: Config::default_sync_stale(),
            sync_interval: Config::default_sync_interval(),
            stop_grace: Config::default_stop_grace(),
            stop_timeout: Config::default_stop_timeout(),
            arm_timeout: Config::default_arm_timeout(),
            status_timeout: Config::default_status_timeout(),
            min_participants: Config::default_min_participants(),
            peer_timeout: Config::default_peer_timeout(),
            shutdown_grace: Config::default_shutdown_grace(),
            test_duration: Config::default_test_duration(),
            delete_after_confirm: false,
            recordings_root: root.to_path_buf(),
        })
    }

    fn test_config_with_peers(root: &std::path::Path, peers: Vec<crate::config::StaticPeer>) -> Arc<Config> {
        let mut config = (*test_config(root)).clone();
        config.static_peers = peers;
        Arc::new(config)
    }

    fn test_identity() -> NodeIdentity {
        NodeIdentity {
            node_id: "CAM_L".to_string(),
            position: Position::Left,
            is_master: false,
            endpoint: "127.0.0.1:1".to_string(),
        }
    }

    fn ok_preconditions() -> Preconditions {
        Preconditions {
            camera_detected: true,
            storage_free_bytes: 100 << 30,
            sync_offset_ms: 0.0,
        }
    }

    fn sm_with_driver(
        root: &std::path::Path,
        driver: TestFixtureDriver,
    ) -> StateMachine<SimulatedClocks> {
        StateMachine::new(
            test_identity(),
            test_config(root),
            Arc::new(driver),
            SimulatedClocks::new(jiff::Timestamp::now()),
        )
    }

    #[test]
    fn happy_path_arm_start_stop() {
        let dir = tempfile::tempdir().unwrap();
        let sm = sm_with_driver(dir.path(), TestFixtureDriver::default());
        let session_id = SessionId::parse("GAME_20240315_140000").unwrap();

        sm.arm(session_id.clone(), ok_preconditions()).unwrap();
        assert_eq!(sm.current_state(), RecordingState::Armed);

        sm.start().unwrap();
        assert_eq!(sm.current_state(), RecordingState::Recording);

        let summary = sm.stop().unwrap();
        assert_eq!(sm.current_state(), RecordingState::Idle);
        assert_eq!(summary.recording.offload_state, OffloadState::Local);
        assert!(summary.recording.checksum.is_some());
    }

    #[test]
    fn idempotent_stop_after_finalize() {
        let dir = tempfile::tempdir().unwrap();
        let sm = sm_with_driver(dir.path(), TestFixtureDriver::default());
        let session_id = SessionId::parse("GAME_20240315_140000").unwrap();
        sm.arm(session_id, ok_preconditions()).unwrap();
        sm.start().unwrap();
        let first = sm.stop().unwrap();

        // Second stop for the same, already-finalized session returns the
        // cached summary rather than erroring or re-finalizing.
        let second = sm.stop().unwrap();
        assert_eq!(sm.current_state(), RecordingState::Idle);
        assert_eq!(second.recording.recording_id, first.recording.recording_id);
        assert_eq!(second.recording.checksum, first.recording.checksum);
    }

    #[test]
    fn stop_without_ever_recording_fails() {
        let dir = tempfile::tempdir().unwrap();
        let sm = sm_with_driver(dir.path(), TestFixtureDriver::default());
        let err = sm.stop().unwrap_err();
        assert_eq!(err.kind(), base::ErrorKind::FailedPrecondition);
    }

    #[test]
    fn finalize_writes_manifest_expecting_every_cluster_peer() {
        let dir = tempfile::tempdir().unwrap();
        let peers = vec![
            crate::config::StaticPeer {
                node_id: "CAM_C".to_string(),
                endpoint: "127.0.0.1:2".to_string(),
            },
            crate::config::StaticPeer {
                node_id: "CAM_R".to_string(),
                endpoint: "127.0.0.1:3".to_string(),
            },
        ];
        let sm = StateMachine::new(
            test_identity(),
            test_config_with_peers(dir.path(), peers),
            Arc::new(TestFixtureDriver::default()),
            SimulatedClocks::new(jiff::Timestamp::now()),
        );
        let session_id = SessionId::parse("GAME_20240315_140000").unwrap();
        sm.arm(session_id.clone(), ok_preconditions()).unwrap();
        sm.start().unwrap();
        let summary = sm.stop().unwrap();

        let manifest_path = summary.recording.file_path.with_extension("json");
        let bytes = std::fs::read(manifest_path).unwrap();
        let manifest = crate::manifest::Manifest::parse(&bytes).unwrap();
        assert_eq!(
            manifest.expected_cameras,
            vec!["CAM_L".to_string(), "CAM_C".to_string(), "CAM_R".to_string()]
        );
    }

    #[test]
    fn arm_rejects_no_camera() {
        let dir = tempfile::tempdir().unwrap();
        let sm = sm_with_driver(
            dir.path(),
            TestFixtureDriver {
                camera_detected: false,
                ..Default::default()
            },
        );
        let session_id = SessionId::parse("GAME_20240315_140000").unwrap();
        assert!(sm.arm(session_id, ok_preconditions()).is_err());
        assert_eq!(sm.current_state(), RecordingState::Idle);
    }

    #[test]
    fn arm_rejects_low_storage() {
        let dir = tempfile::tempdir().unwrap();
        let sm = sm_with_driver(dir.path(), TestFixtureDriver::default());
        let session_id = SessionId::parse("GAME_20240315_140000").unwrap();
        let pre = Preconditions {
            storage_free_bytes: 5 << 30,
            ..ok_preconditions()
        };
        let err = sm.arm(session_id, pre).unwrap_err();
        assert_eq!(err.kind(), base::ErrorKind::FailedPrecondition);
    }

    #[test]
    fn arm_rejects_sync_out_of_tolerance_for_non_master() {
        let dir = tempfile::tempdir().unwrap();
        let sm = sm_with_driver(dir.path(), TestFixtureDriver::default());
        let session_id = SessionId::parse("GAME_20240315_140000").unwrap();
        let pre = Preconditions {
            sync_offset_ms: 50.0,
            ..ok_preconditions()
        };
        assert!(sm.arm(session_id, pre).is_err());
    }

    #[test]
    fn abort_returns_to_idle_without_recording() {
        let dir = tempfile::tempdir().unwrap();
        let sm = sm_with_driver(dir.path(), TestFixtureDriver::default());
        let session_id = SessionId::parse("GAME_20240315_140000").unwrap();
        sm.arm(session_id, ok_preconditions()).unwrap();
        sm.abort().unwrap();
        assert_eq!(sm.current_state(), RecordingState::Idle);
        assert!(sm.start().is_err());
    }

    #[test]
    fn driver_fail_during_recording_enters_error() {
        let dir = tempfile::tempdir().unwrap();
        let sm = sm_with_driver(dir.path(), TestFixtureDriver::default());
        let session_id = SessionId::parse("GAME_20240315_140000").unwrap();
        sm.arm(session_id, ok_preconditions()).unwrap();
        sm.start().unwrap();
        sm.driver_fail("write error");
        assert_eq!(sm.current_state(), RecordingState::Error);
        sm.reset().unwrap();
        assert_eq!(sm.current_state(), RecordingState::Idle);
    }

    #[test]
    fn stop_failure_enters_error_not_idle() {
        let dir = tempfile::tempdir().unwrap();
        let sm = sm_with_driver(
            dir.path(),
            TestFixtureDriver {
                fail_stop: true,
                ..Default::default()
            },
        );
        let session_id = SessionId::parse("GAME_20240315_140000").unwrap();
        sm.arm(session_id, ok_preconditions()).unwrap();
        sm.start().unwrap();
        assert!(sm.stop().is_err());
        assert_eq!(sm.current_state(), RecordingState::Error);
    }
}
