// This file is part of a security camera network recording coordinator.
// Copyright (C) 2018 The Moonfire NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! `camrigd`: the per-node recording daemon. Wires the state
//! machine, peer registry, sync monitor and coordinator to the Node control
//! API and Coordinator API, and runs the offload client loop for
//! recordings left behind in `LOCAL`.

use base::clock::RealClocks;
use base::Error;
use bpaf::Parser;
use core::config::Config;
use core::coordinator::{ClusterMember, Coordinator};
use core::driver::{CameraDriver, SimulatedDriver};
use core::model::{OffloadState, Recording, RecordingState, SessionId};
use core::peers::PeerRegistry;
use core::statemachine::StateMachine;
use core::sync::SyncMonitor;
use std::ffi::OsStr;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info, warn};

use camrig_node::http_client;

mod ingest_client;
mod peer_client;
mod web;

// Set by build.rs from `git describe`, falling back to the `VERSION` env var if present.
const VERSION: &str = env!("VERSION");

#[derive(Debug)]
struct Args {
    config: PathBuf,
    listen: SocketAddr,
    ingest_url: Option<String>,
}

/// `camrigd`: records one camera's feed and participates in the cluster
/// coordinator.
fn args() -> impl Parser<Args> {
    let config = bpaf::long("config")
        .help("Path to this node's JSON configuration file.")
        .argument::<PathBuf>("PATH")
        .fallback("/etc/camrig/node.json".into())
        .debug_fallback();
    let listen = bpaf::long("listen")
        .help("Address to bind the Node control API and Coordinator API to.")
        .argument::<SocketAddr>("ADDR")
        .fallback("0.0.0.0:8080".parse().unwrap())
        .debug_fallback();
    let ingest_url = bpaf::long("ingest-url")
        .help("Base URL of the ingest server (e.g. http://ingest.example:9000); omit to disable offload.")
        .argument::<String>("URL")
        .optional();
    bpaf::construct!(Args { config, listen, ingest_url }).to_options().version(VERSION)
}

fn load_config(path: &Path) -> Result<Config, Error> {
    let bytes = std::fs::read(path)
        .map_err(|e| base::format_err_t!(NotFound, "reading config {}: {e}", path.display()))?;
    serde_json::from_slice(&bytes)
        .map_err(|e| base::format_err_t!(InvalidArgument, "parsing config {}: {e}", path.display()))
}

#[tokio::main]
async fn main() {
    base::tracing_setup::install();

    let progname = std::env::args_os().next().map(PathBuf::from);
    let progname = progname
        .as_deref()
        .and_then(Path::file_name)
        .and_then(OsStr::to_str)
        .unwrap_or(env!("CARGO_PKG_NAME"));

    let args = match args().run_inner(bpaf::Args::current_args().set_name(progname)) {
        Ok(a) => a,
        Err(e) => std::process::exit(e.exit_code()),
    };

    if let Err(e) = run(args).await {
        error!(err = %e.chain(), "exiting due to error");
        std::process::exit(1);
    }
}

async fn run(args: Args) -> Result<(), Error> {
    let config = Arc::new(load_config(&args.config)?);
    info!(node_id = %config.identity.node_id, position = %config.identity.position, "starting camrigd");

    std::fs::create_dir_all(&config.recordings_root)?;

    let clocks = RealClocks {};
    let driver: Arc<dyn CameraDriver> = Arc::new(SimulatedDriver::new(true));
    let sm = Arc::new(StateMachine::new(config.identity.clone(), Arc::clone(&config), Arc::clone(&driver), clocks));
    let sync = Arc::new(SyncMonitor::new(
        clocks,
        config.sync_tolerance_ms,
        config.sync_rtt_max_ms,
        config.sync_stale,
        config.identity.is_master,
    ));
    let peers = Arc::new(PeerRegistry::new(clocks, config.peer_timeout));
    for p in &config.static_peers {
        peers.add_static(p.node_id.clone(), p.endpoint.clone());
    }

    let members: Vec<ClusterMember> = config
        .static_peers
        .iter()
        .map(|p| ClusterMember { node_id: p.node_id.clone(), endpoint: p.endpoint.clone() })
        .chain(std::iter::once(ClusterMember {
            node_id: config.identity.node_id.clone(),
            endpoint: config.identity.endpoint.clone(),
        }))
        .collect();
    let peer_client = Arc::new(peer_client::HyperPeerClient::new(config.arm_timeout));
    let coordinator = Arc::new(Coordinator::new(Arc::clone(&config), peer_client, members));

    let state = Arc::new(web::AppState {
        identity: config.identity.clone(),
        config: Arc::clone(&config),
        sm: Arc::clone(&sm),
        sync: Arc::clone(&sync),
        peers: Arc::clone(&peers),
        coordinator,
        driver,
        clocks,
        http_client: http_client::new_client(),
    });

    if !config.identity.is_master {
        tokio::spawn(sync_loop(Arc::clone(&state)));
    }
    if let Some(ingest_url) = args.ingest_url {
        tokio::spawn(offload_loop(Arc::clone(&sm), Arc::clone(&config), ingest_url));
    } else {
        warn!("no --ingest-url given: recordings will accumulate locally and never offload");
    }

    let (shutdown_tx, shutdown_rx) = base::shutdown::channel();
    let serve_task = tokio::spawn(web::serve(Arc::clone(&state), args.listen, shutdown_rx));

    wait_for_shutdown_signal().await;
    info!("shutdown requested; draining connections and finalizing any in-progress recording");
    drop(shutdown_tx);

    if sm.current_state() == RecordingState::Recording {
        if let Err(e) = sm.stop() {
            warn!(error = %e, "failed to stop in-progress recording during shutdown");
        }
    }
    let grace = config.shutdown_grace;
    let quiescent = tokio::task::spawn_blocking(move || core::statemachine::wait_for_quiescent(&sm, grace))
        .await
        .unwrap_or(false);
    if !quiescent {
        warn!(?grace, "recording still finalizing past shutdown grace period");
    }

    serve_task
        .await
        .map_err(|e| base::format_err_t!(Internal, "server task panicked: {e}"))?
}

/// Waits for SIGINT or SIGTERM.
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut int = signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");
    let mut term = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
    tokio::select! {
        _ = int.recv() => info!("received SIGINT"),
        _ = term.recv() => info!("received SIGTERM"),
    }
}

/// Periodically forces a sync pass against the master. Best-effort: a failed round trip just leaves the monitor
/// stale, which `arm`'s precondition check already accounts for.
async fn sync_loop(state: Arc<web::AppState>) {
    let mut ticker = tokio::time::interval(state.config.sync_interval);
    loop {
        ticker.tick().await;
        if let Err(e) = web::run_sync_pass(&state).await {
            warn!(error = %e, "periodic sync pass failed");
        }
    }
}

/// Watches the recordings root for `LOCAL` recordings with a manifest and
/// offloads them one at a time. A production driver would hand finished recordings to this loop
/// directly; this daemon instead polls disk, which is sufficient since
/// `finalize` only ever writes a manifest once a recording is fully closed.
async fn offload_loop(sm: Arc<StateMachine<RealClocks>>, config: Arc<Config>, ingest_url: String) {
    let client = ingest_client::HyperIngestClient::new(
        ingest_url,
        config.arm_timeout,
        config.recordings_root.clone(),
    );
    let mut ticker = tokio::time::interval(std::time::Duration::from_secs(30));
    loop {
        ticker.tick().await;
        let pending = match find_pending_recordings(&config, &sm) {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, "scanning for pending recordings failed");
                continue;
            }
        };
        for mut recording in pending {
            info!(recording_id = %recording.recording_id, "offloading recording");
            if let Err(e) =
                core::offload::offload(&RealClocks {}, &client, &mut recording, core::offload::CHUNK_SIZE).await
            {
                error!(recording_id = %recording.recording_id, error = %e, "offload failed");
                continue;
            }
            if core::offload::eligible_for_deletion(&recording, config.delete_after_confirm) {
                if let Err(e) = std::fs::remove_file(&recording.file_path) {
                    warn!(recording_id = %recording.recording_id, error = %e, "failed to delete confirmed recording");
                }
            }
        }
    }
}

/// Scans `{recordings_root}/*/{node_id}/*.json` manifests for recordings
/// that haven't been offloaded yet. Skips the session currently recording,
/// if any (its manifest doesn't exist yet).
fn find_pending_recordings(config: &Config, sm: &StateMachine<RealClocks>) -> Result<Vec<Recording>, Error> {
    let current = sm.current_session_id();
    let mut out = Vec::new();
    let Ok(sessions) = std::fs::read_dir(&config.recordings_root) else {
        return Ok(out);
    };
    for session_entry in sessions.flatten() {
        let session_dir = session_entry.path();
        if !session_dir.is_dir() {
            continue;
        }
        let Some(session_name) = session_dir.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if current.as_ref().map(|s| s.as_str() == session_name).unwrap_or(false) {
            continue;
        }
        let Ok(session_id) = SessionId::parse(session_name.to_string()) else {
            continue;
        };
        let node_dir = session_dir.join(&config.identity.node_id);
        let Ok(entries) = std::fs::read_dir(&node_dir) else {
            continue;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let manifest_bytes = std::fs::read(&path)?;
            let manifest = core::manifest::Manifest::parse(&manifest_bytes)?;
            let file_path = path.with_extension(&manifest.file.container);
            if !file_path.exists() {
                continue;
            }
            out.push(Recording {
                recording_id: manifest.recording.id,
                session_id: session_id.clone(),
                node_id: config.identity.node_id.clone(),
                file_path,
                size_bytes: manifest.file.size_bytes,
                duration_seconds: manifest.video.duration_sec,
                checksum: Some(manifest.checksum.value),
                offload_state: OffloadState::Local,
            });
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::config::StaticPeer;
    use core::manifest::{ChecksumInfo, DeviceInfo, FileInfo, Manifest, QualityInfo, RecordingRef, TimingInfo, VideoInfo};
    use core::model::{Checksum, NodeIdentity, Position};

    fn test_identity() -> NodeIdentity {
        NodeIdentity { node_id: "CAM_L".to_string(), position: Position::Left, is_master: false, endpoint: "127.0.0.1:1".to_string() }
    }

    fn test_config(root: &Path) -> Config {
        Config {
            identity: test_identity(),
            static_peers: Vec::<StaticPeer>::new(),
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
        }
    }

    fn write_manifest(node_dir: &Path, recording_id: &str, session_id: &SessionId) {
        std::fs::create_dir_all(node_dir).unwrap();
        let manifest = Manifest {
            version: core::manifest::MANIFEST_VERSION.to_string(),
            recording: RecordingRef {
                id: recording_id.to_string(),
                session_id: session_id.clone(),
                node_id: "CAM_L".to_string(),
                position: Position::Left,
            },
            file: FileInfo { name: format!("{recording_id}.mov"), size_bytes: 42, container: "mov".to_string(), codec: "h264".to_string() },
            video: VideoInfo { width: 3840, height: 2160, fps: 30.0, bitrate_mbps: 50.0, duration_sec: 12.0 },
            timing: TimingInfo {
                start_time: "2024-03-15T14:00:00Z".parse().unwrap(),
                end_time: "2024-03-15T14:00:12Z".parse().unwrap(),
                sync_ok: true,
                sync_offset_ms: 1.0,
            },
            checksum: ChecksumInfo { algorithm: "sha256".to_string(), value: Checksum([0u8; 32]) },
            device: DeviceInfo { hostname: "cam-l.local".to_string(), endpoint: "127.0.0.1:1".to_string(), software_version: "0.1.0".to_string() },
            quality: QualityInfo { dropped_frames: 0, temperature_avg_c: 40.0, temperature_max_c: 45.0 },
            expected_cameras: vec!["CAM_L".to_string(), "CAM_C".to_string(), "CAM_R".to_string()],
        };
        std::fs::write(node_dir.join(format!("{recording_id}.json")), manifest.to_json_vec()).unwrap();
        std::fs::write(node_dir.join(format!("{recording_id}.mov")), b"fake video bytes").unwrap();
    }

    #[test]
    fn finds_manifested_recordings_with_a_data_file() {
        let tmp = tempfile::tempdir().unwrap();
        let session_id = SessionId::parse("GAME_20240315_140000").unwrap();
        let node_dir = tmp.path().join(session_id.as_str()).join("CAM_L");
        write_manifest(&node_dir, "GAME_20240315_140000_CAM_L", &session_id);

        let config = test_config(tmp.path());
        let driver: Arc<dyn CameraDriver> = Arc::new(SimulatedDriver::new(true));
        let sm = StateMachine::new(config.identity.clone(), Arc::new(config.clone()), driver, RealClocks {});

        let pending = find_pending_recordings(&config, &sm).unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].recording_id, "GAME_20240315_140000_CAM_L");
        assert_eq!(pending[0].offload_state, OffloadState::Local);
    }

    #[test]
    fn skips_a_manifest_with_no_matching_data_file() {
        let tmp = tempfile::tempdir().unwrap();
        let session_id = SessionId::parse("GAME_20240315_140000").unwrap();
        let node_dir = tmp.path().join(session_id.as_str()).join("CAM_L");
        write_manifest(&node_dir, "GAME_20240315_140000_CAM_L", &session_id);
        std::fs::remove_file(node_dir.join("GAME_20240315_140000_CAM_L.mov")).unwrap();

        let config = test_config(tmp.path());
        let driver: Arc<dyn CameraDriver> = Arc::new(SimulatedDriver::new(true));
        let sm = StateMachine::new(config.identity.clone(), Arc::new(config.clone()), driver, RealClocks {});

        let pending = find_pending_recordings(&config, &sm).unwrap();
        assert!(pending.is_empty());
    }

    #[test]
    fn ignores_non_manifest_files_and_empty_recordings_root() {
        let tmp = tempfile::tempdir().unwrap();
        let config = test_config(tmp.path());
        let driver: Arc<dyn CameraDriver> = Arc::new(SimulatedDriver::new(true));
        let sm = StateMachine::new(config.identity.clone(), Arc::new(config.clone()), driver, RealClocks {});

        // recordings_root exists but is empty.
        assert!(find_pending_recordings(&config, &sm).unwrap().is_empty());

        // a stray non-directory entry at the session level is skipped, not an error.
        std::fs::write(tmp.path().join("not_a_session_dir"), b"x").unwrap();
        assert!(find_pending_recordings(&config, &sm).unwrap().is_empty());
    }
}
