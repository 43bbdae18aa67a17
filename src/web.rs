// This file is part of a security camera network recording coordinator.
// Copyright (C) 2018 The Moonfire NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! The Node control API and the Coordinator API, both served on
//! the same listener since they share process state.

use base::clock::RealClocks;
use base::ErrorKind;
use bytes::Bytes;
use core::config::Config;
use core::coordinator::{Coordinator, PreflightCheck, PreflightReport};
use core::driver::CameraDriver;
use core::model::{NodeIdentity, SessionId};
use core::peers::PeerRegistry;
use core::statemachine::{Preconditions, StateMachine};
use core::sync::SyncMonitor;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use hyper_util::server::graceful::GracefulShutdown;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

type BoxBody = http_body_util::combinators::BoxBody<Bytes, hyper::Error>;

pub struct AppState {
    pub identity: NodeIdentity,
    pub config: Arc<Config>,
    pub sm: Arc<StateMachine<RealClocks>>,
    pub sync: Arc<SyncMonitor<RealClocks>>,
    pub peers: Arc<PeerRegistry<RealClocks>>,
    pub coordinator: Arc<Coordinator>,
    pub driver: Arc<dyn CameraDriver>,
    pub clocks: RealClocks,
    pub http_client: camrig_node::http_client::HttpClient,
}

/// Free/total bytes for the filesystem holding `path` (mirrors the ingest
/// server's `storage_free_bytes`, used as the arm storage precondition).
fn storage_stats(path: &Path) -> Result<(i64, i64), base::Error> {
    let stat = nix::sys::statvfs::statvfs(path)
        .map_err(|e| base::format_err_t!(Internal, "statvfs({}): {e}", path.display()))?;
    let frag = stat.fragment_size();
    let free = (stat.blocks_available() as u64).saturating_mul(frag) as i64;
    let total = (stat.blocks() as u64).saturating_mul(frag) as i64;
    Ok((free, total))
}

fn snapshot(state: &AppState) -> Result<core::model::NodeState, base::Error> {
    let (free, total) = storage_stats(&state.config.recordings_root)?;
    Ok(core::model::NodeState {
        node_id: state.identity.node_id.clone(),
        position: state.identity.position,
        is_master: state.identity.is_master,
        camera_detected: state.driver.camera_detected(),
        recording_state: state.sm.current_state(),
        current_session_id: state.sm.current_session_id(),
        storage_free_bytes: free,
        storage_total_bytes: total,
        sync_offset_ms: state.sync.offset_ms(),
        temperature_c: f64::NAN,
        last_heartbeat_at: state.clocks.utc_now(),
    })
}

/// Builds this node's own preflight report,
/// reused both by the coordinator's per-peer `preflight` RPC and the
/// aggregate `/coordinator/preflight` endpoint when this node is itself a
/// cluster member.
fn local_preflight(state: &AppState) -> Result<PreflightReport, base::Error> {
    let (free, _total) = storage_stats(&state.config.recordings_root)?;
    let camera_detected = state.driver.camera_detected();
    let sync_offset = state.sync.offset_ms();
    let sync_ok = state.identity.is_master || sync_offset.abs() <= state.config.sync_tolerance_ms;
    let checks = vec![
        PreflightCheck {
            name: "camera".to_string(),
            passed: camera_detected,
            message: if camera_detected {
                "camera detected".to_string()
            } else {
                "no camera detected".to_string()
            },
        },
        PreflightCheck {
            name: "storage".to_string(),
            passed: free >= state.config.min_free_bytes,
            message: format!("{free} bytes free, need {}", state.config.min_free_bytes),
        },
        PreflightCheck {
            name: "sync".to_string(),
            passed: sync_ok,
            message: format!("offset {sync_offset:.2}ms, tolerance {:.2}ms", state.config.sync_tolerance_ms),
        },
    ];
    Ok(PreflightReport {
        node_id: state.identity.node_id.clone(),
        checks,
    })
}

/// Serves the Node control API and Coordinator API until `shutdown_rx` fires,
/// then stops accepting new connections and waits for in-flight ones to
/// finish via [`GracefulShutdown`].
pub async fn serve(
    state: Arc<AppState>,
    addr: SocketAddr,
    shutdown_rx: base::shutdown::Receiver,
) -> Result<(), base::Error> {
    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "node control API listening");
    let graceful = GracefulShutdown::new();
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!(error = %e, "accept failed");
                        continue;
                    }
                };
                let state = Arc::clone(&state);
                let io = TokioIo::new(stream);
                let service = service_fn(move |req| {
                    let state = Arc::clone(&state);
                    async move { Ok::<_, hyper::Error>(route(state, req).await) }
                });
                let conn = graceful.watch(http1::Builder::new().serve_connection(io, service));
                tokio::spawn(async move {
                    if let Err(e) = conn.await {
                        warn!(%peer, error = %e, "connection error");
                    }
                });
            }
            () = shutdown_rx.as_future() => {
                info!("no longer accepting new connections, draining in-flight requests");
                break;
            }
        }
    }
    graceful.shutdown().await;
    Ok(())
}

async fn route(state: Arc<AppState>, req: Request<Incoming>) -> Response<BoxBody> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let result = match (&method, path.as_str()) {
        (&Method::GET, "/status") => handle_status(&state),
        (&Method::POST, "/preflight") => local_preflight(&state).map(|r| json_response(StatusCode::OK, &r)),
        (&Method::POST, "/arm") => handle_arm(&state, req).await,
        (&Method::POST, "/start") => handle_start(&state),
        (&Method::POST, "/stop") => handle_stop(&state),
        (&Method::POST, "/abort") => handle_abort(&state),
        (&Method::GET, "/sync/query") => Ok(handle_sync_query(&state)),
        (&Method::POST, "/sync/trigger") => handle_sync_trigger(&state).await,
        (&Method::GET, "/coordinator/status") => Ok(json_response(StatusCode::OK, &state.coordinator.status().await)),
        (&Method::POST, "/coordinator/preflight") => {
            Ok(json_response(StatusCode::OK, &state.coordinator.preflight().await))
        }
        (&Method::POST, "/coordinator/start") => handle_coordinator_start(&state, req).await,
        (&Method::POST, "/coordinator/stop") => Ok(json_response(StatusCode::OK, &state.coordinator.stop().await)),
        (&Method::POST, "/coordinator/sync") => {
            state.coordinator.sync().await;
            Ok(json_response(StatusCode::OK, &serde_json::json!({"ok": true})))
        }
        (&Method::POST, "/coordinator/test") => handle_coordinator_test(&state).await,
        (&Method::GET, "/coordinator/peers") => {
            Ok(json_response(StatusCode::OK, &state.peers.all()))
        }
        (&Method::POST, "/coordinator/peers") => handle_add_peer(&state, req).await,
        (&Method::DELETE, p) if p.starts_with("/coordinator/peers/") => {
            let id = p.trim_start_matches("/coordinator/peers/");
            let removed = state.peers.admin_remove(id);
            Ok(json_response(StatusCode::OK, &serde_json::json!({"removed": removed})))
        }
        _ => Err(base::format_err_t!(NotFound, "no such route: {method} {path}")),
    };
    match result {
        Ok(resp) => resp,
        Err(e) => {
            error!(%method, %path, error = %e, "request failed");
            error_response(&e, &method, &path)
        }
    }
}

async fn body_json<T: for<'de> Deserialize<'de>>(req: Request<Incoming>) -> Result<T, base::Error> {
    let bytes = req
        .collect()
        .await
        .map_err(|e| base::format_err_t!(InvalidArgument, "reading request body: {e}"))?
        .to_bytes();
    if bytes.is_empty() {
        return serde_json::from_slice(b"null")
            .map_err(|e| base::format_err_t!(InvalidArgument, "malformed json: {e}"));
    }
    serde_json::from_slice(&bytes).map_err(|e| base::format_err_t!(InvalidArgument, "malformed json: {e}"))
}

fn json_response<T: Serialize>(status: StatusCode, body: &T) -> Response<BoxBody> {
    let bytes = serde_json::to_vec(body).expect("response always serializes");
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(Full::new(Bytes::from(bytes)).map_err(|never| match never {}).boxed())
        .expect("static response is well-formed")
}

/// Generic error-kind-to-status mapping.
fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::InvalidArgument | ErrorKind::OutOfRange => StatusCode::BAD_REQUEST,
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::AlreadyExists => StatusCode::CONFLICT,
        ErrorKind::FailedPrecondition => StatusCode::CONFLICT,
        ErrorKind::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
        ErrorKind::DeadlineExceeded => StatusCode::GATEWAY_TIMEOUT,
        ErrorKind::PermissionDenied | ErrorKind::Unauthenticated => StatusCode::FORBIDDEN,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// `/arm`'s status split is finer than the generic mapping; the
/// state machine reports both "wrong state" and "precondition" failures as
/// `FailedPrecondition`, so the split is inferred from the message here.
fn arm_status_for(e: &base::Error) -> StatusCode {
    match e.kind() {
        ErrorKind::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
        ErrorKind::FailedPrecondition if e.to_string().contains("not IDLE") => StatusCode::CONFLICT,
        ErrorKind::FailedPrecondition => StatusCode::PRECONDITION_FAILED,
        kind => status_for(kind),
    }
}

fn error_response(e: &base::Error, method: &Method, path: &str) -> Response<BoxBody> {
    #[derive(Serialize)]
    struct Body {
        error: String,
    }
    let status = if method == Method::POST && path == "/arm" {
        arm_status_for(e)
    } else {
        status_for(e.kind())
    };
    json_response(status, &Body { error: e.to_string() })
}

fn handle_status(state: &AppState) -> Result<Response<BoxBody>, base::Error> {
    Ok(json_response(StatusCode::OK, &snapshot(state)?))
}

#[derive(Deserialize)]
struct ArmRequest {
    session_id: String,
}

async fn handle_arm(state: &AppState, req: Request<Incoming>) -> Result<Response<BoxBody>, base::Error> {
    let r: ArmRequest = body_json(req).await?;
    let session_id = SessionId::parse(r.session_id)?;
    let (free, _total) = storage_stats(&state.config.recordings_root)?;
    let pre = Preconditions {
        camera_detected: state.driver.camera_detected(),
        storage_free_bytes: free,
        sync_offset_ms: state.sync.offset_ms(),
    };
    state.sm.arm(session_id, pre)?;
    Ok(json_response(StatusCode::OK, &serde_json::json!({"ok": true})))
}

fn handle_start(state: &AppState) -> Result<Response<BoxBody>, base::Error> {
    let started_at = state.sm.start()?;
    Ok(json_response(StatusCode::OK, &serde_json::json!({"started_at": started_at})))
}

fn handle_stop(state: &AppState) -> Result<Response<BoxBody>, base::Error> {
    let summary = state.sm.stop()?;
    #[derive(Serialize)]
    struct Body {
        recording_id: String,
        size_bytes: u64,
        duration_seconds: f64,
    }
    Ok(json_response(
        StatusCode::OK,
        &Body {
            recording_id: summary.recording.recording_id,
            size_bytes: summary.recording.size_bytes,
            duration_seconds: summary.recording.duration_seconds,
        },
    ))
}

fn handle_abort(state: &AppState) -> Result<Response<BoxBody>, base::Error> {
    state.sm.abort()?;
    Ok(json_response(StatusCode::OK, &serde_json::json!({"ok": true})))
}

/// The master's half of the round-trip estimator; meaningless
/// (but harmless) if queried on a non-master node.
#[derive(Serialize, Deserialize)]
struct SyncQueryResponse {
    t_master_recv: jiff::Timestamp,
    t_master_send: jiff::Timestamp,
}

fn handle_sync_query(state: &AppState) -> Response<BoxBody> {
    let t_master_recv = state.clocks.utc_now();
    let t_master_send = state.clocks.utc_now();
    json_response(StatusCode::OK, &SyncQueryResponse { t_master_recv, t_master_send })
}

/// Queries the master's `/sync/query` and records the round trip. Shared
/// by the `/sync/trigger` handler and the daemon's periodic sync loop.
pub async fn run_sync_pass(state: &AppState) -> Result<core::sync::RoundTrip, base::Error> {
    let master_endpoint = state
        .config
        .master_endpoint
        .as_deref()
        .ok_or_else(|| base::format_err_t!(Unavailable, "no master_endpoint configured"))?;

    let t_slave_send = state.clocks.utc_now();
    let resp: SyncQueryResponse = camrig_node::http_client::request_json(
        &state.http_client,
        Method::GET,
        &format!("http://{master_endpoint}/sync/query"),
        None::<&()>,
        state.config.arm_timeout,
    )
    .await
    .map_err(|e| base::format_err_t!(Unavailable, "master unreachable: {e}"))?;
    let t_slave_recv = state.clocks.utc_now();

    let rt = core::sync::RoundTrip {
        t_slave_send,
        t_master_recv: resp.t_master_recv,
        t_master_send: resp.t_master_send,
        t_slave_recv,
    };
    state.sync.record(rt);
    Ok(rt)
}

/// Forces a sync pass. The master itself has
/// no peer to query and simply reports its trivial `Ok` status.
async fn handle_sync_trigger(state: &AppState) -> Result<Response<BoxBody>, base::Error> {
    if state.identity.is_master {
        let status = state.sync.status();
        return Ok(json_response(
            StatusCode::OK,
            &serde_json::json!({"offset_ms": status.offset_ms, "rtt_ms": status.rtt_ms}),
        ));
    }
    let rt = run_sync_pass(state).await?;
    Ok(json_response(
        StatusCode::OK,
        &serde_json::json!({"offset_ms": rt.offset_ms(), "rtt_ms": rt.rtt_ms()}),
    ))
}

#[derive(Deserialize, Default)]
struct CoordinatorStartRequest {
    session_id: Option<String>,
}

async fn handle_coordinator_start(state: &AppState, req: Request<Incoming>) -> Result<Response<BoxBody>, base::Error> {
    let r: CoordinatorStartRequest = body_json(req).await.unwrap_or_default();
    let session_id = r.session_id.map(SessionId::parse).transpose()?;
    let resp = state.coordinator.start(session_id).await?;
    Ok(json_response(StatusCode::OK, &resp))
}

/// `POST /coordinator/test`: a short end-to-end smoke test --
/// starts a throwaway cluster recording, waits `test_duration`, then stops
/// it and reports both phases.
async fn handle_coordinator_test(state: &AppState) -> Result<Response<BoxBody>, base::Error> {
    let session_id = SessionId::generate(state.clocks.utc_now())?;
    let start = state.coordinator.start(Some(session_id.clone())).await?;
    if !start.success {
        return Ok(json_response(
            StatusCode::OK,
            &serde_json::json!({"session_id": session_id, "success": false, "start": start}),
        ));
    }
    tokio::time::sleep(state.config.test_duration).await;
    let stop = state.coordinator.stop().await;
    Ok(json_response(
        StatusCode::OK,
        &serde_json::json!({"session_id": session_id, "success": true, "start": start, "stop": stop}),
    ))
}

#[derive(Deserialize)]
struct AddPeerRequest {
    node_id: String,
    endpoint: String,
}

async fn handle_add_peer(state: &AppState, req: Request<Incoming>) -> Result<Response<BoxBody>, base::Error> {
    let r: AddPeerRequest = body_json(req).await?;
    state.peers.admin_add(r.node_id, r.endpoint);
    Ok(json_response(StatusCode::OK, &serde_json::json!({"ok": true})))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arm_status_splits_not_idle_from_other_preconditions() {
        let not_idle = base::format_err_t!(FailedPrecondition, "not IDLE: currently Recording");
        assert_eq!(arm_status_for(&not_idle), StatusCode::CONFLICT);

        let low_storage = base::format_err_t!(FailedPrecondition, "insufficient storage: 1 < 100");
        assert_eq!(arm_status_for(&low_storage), StatusCode::PRECONDITION_FAILED);

        let no_camera = base::Error::from(ErrorKind::Unavailable);
        assert_eq!(arm_status_for(&no_camera), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn generic_status_mapping_matches_error_kinds() {
        assert_eq!(status_for(ErrorKind::NotFound), StatusCode::NOT_FOUND);
        assert_eq!(status_for(ErrorKind::AlreadyExists), StatusCode::CONFLICT);
        assert_eq!(status_for(ErrorKind::Unavailable), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(status_for(ErrorKind::Internal), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
