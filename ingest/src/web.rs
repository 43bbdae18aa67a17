// This file is part of a security camera network recording coordinator.
// Copyright (C) 2018 The Moonfire NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! The Ingest API: `/upload/init`, `/upload/chunk`,
//! `/upload/finalize`, `/upload/confirm`, `/sessions/{id}`, `/health`.

use crate::store::Store;
use base::ErrorKind;
use bytes::Bytes;
use core::manifest::Manifest;
use core::model::{Checksum, SessionId};
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

type BoxBody = http_body_util::combinators::BoxBody<Bytes, hyper::Error>;

pub async fn serve(store: Arc<Store>, addr: SocketAddr) -> Result<(), base::Error> {
    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "ingest server listening");
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(pair) => pair,
            Err(e) => {
                warn!(error = %e, "accept failed");
                continue;
            }
        };
        let store = Arc::clone(&store);
        tokio::spawn(async move {
            let io = TokioIo::new(stream);
            let service = service_fn(move |req| {
                let store = Arc::clone(&store);
                async move { Ok::<_, hyper::Error>(route(store, req).await) }
            });
            if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                warn!(%peer, error = %e, "connection error");
            }
        });
    }
}

async fn route(store: Arc<Store>, req: Request<Incoming>) -> Response<BoxBody> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let result = match (&method, path.as_str()) {
        (&Method::POST, "/upload/init") => handle_init(store, req).await,
        (&Method::POST, "/upload/chunk") => handle_chunk(store, req).await,
        (&Method::POST, "/upload/finalize") => handle_finalize(store, req).await,
        (&Method::POST, "/upload/confirm") => handle_confirm(store, req).await,
        (&Method::GET, "/health") => handle_health(store).await,
        (&Method::GET, p) if p.starts_with("/sessions/") => {
            handle_session_status(store, p.trim_start_matches("/sessions/")).await
        }
        _ => Err(base::format_err_t!(NotFound, "no such route: {method} {path}")),
    };
    match result {
        Ok(resp) => resp,
        Err(e) => {
            error!(%method, %path, error = %e, "request failed");
            error_response(&e)
        }
    }
}

async fn body_json<T: for<'de> Deserialize<'de>>(req: Request<Incoming>) -> Result<T, base::Error> {
    let bytes = req
        .collect()
        .await
        .map_err(|e| base::format_err_t!(InvalidArgument, "reading request body: {e}"))?
        .to_bytes();
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

/// Maps the error taxonomy onto HTTP status codes.
fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::InvalidArgument | ErrorKind::OutOfRange => StatusCode::BAD_REQUEST,
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::AlreadyExists => StatusCode::CONFLICT,
        ErrorKind::FailedPrecondition => StatusCode::PRECONDITION_FAILED,
        ErrorKind::DataLoss => StatusCode::UNPROCESSABLE_ENTITY,
        ErrorKind::DeadlineExceeded => StatusCode::GATEWAY_TIMEOUT,
        ErrorKind::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
        ErrorKind::PermissionDenied | ErrorKind::Unauthenticated => StatusCode::FORBIDDEN,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_response(e: &base::Error) -> Response<BoxBody> {
    #[derive(Serialize)]
    struct Body {
        error: String,
    }
    json_response(status_for(e.kind()), &Body { error: e.to_string() })
}

#[derive(Deserialize)]
struct InitRequest {
    node_id: String,
    session_id: String,
    recording_id: String,
    file_size: u64,
    chunk_size: u64,
    checksum: String,
}

#[derive(Serialize)]
struct InitResponseBody {
    upload_id: String,
    received_chunks: Vec<u64>,
}

async fn handle_init(store: Arc<Store>, req: Request<Incoming>) -> Result<Response<BoxBody>, base::Error> {
    let r: InitRequest = body_json(req).await?;
    let session_id = SessionId::parse(r.session_id)?;
    let checksum = Checksum::from_hex(&r.checksum)?;
    let resp = store.init(&r.node_id, &session_id, &r.recording_id, r.file_size, r.chunk_size, &checksum)?;
    Ok(json_response(
        StatusCode::OK,
        &InitResponseBody {
            upload_id: resp.upload_id,
            received_chunks: resp.received_chunks.into_iter().collect(),
        },
    ))
}

#[derive(Deserialize)]
struct ChunkRequest {
    upload_id: String,
    chunk_index: u64,
    #[serde(with = "base64_bytes")]
    data: Vec<u8>,
}

mod base64_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&base64::Engine::encode(&base64::engine::general_purpose::STANDARD, bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(d)?;
        base64::Engine::decode(&base64::engine::general_purpose::STANDARD, s).map_err(serde::de::Error::custom)
    }
}

async fn handle_chunk(store: Arc<Store>, req: Request<Incoming>) -> Result<Response<BoxBody>, base::Error> {
    let r: ChunkRequest = body_json(req).await?;
    store.chunk(&r.upload_id, r.chunk_index, &r.data)?;
    Ok(json_response(StatusCode::OK, &serde_json::json!({"ok": true})))
}

#[derive(Deserialize)]
struct FinalizeRequest {
    upload_id: String,
    total_chunks: u64,
}

#[derive(Serialize)]
struct FinalizeResponseBody {
    checksum: String,
    size_bytes: u64,
}

async fn handle_finalize(store: Arc<Store>, req: Request<Incoming>) -> Result<Response<BoxBody>, base::Error> {
    let r: FinalizeRequest = body_json(req).await?;
    let resp = store.finalize(&r.upload_id, r.total_chunks)?;
    Ok(json_response(
        StatusCode::OK,
        &FinalizeResponseBody {
            checksum: resp.checksum.to_hex(),
            size_bytes: resp.size_bytes,
        },
    ))
}

#[derive(Deserialize)]
struct ConfirmRequest {
    session_id: String,
    node_id: String,
    manifest: serde_json::Value,
}

#[derive(Serialize)]
struct ConfirmResponseBody {
    checksum: String,
}

async fn handle_confirm(store: Arc<Store>, req: Request<Incoming>) -> Result<Response<BoxBody>, base::Error> {
    let r: ConfirmRequest = body_json(req).await?;
    let session_id = SessionId::parse(r.session_id)?;
    let manifest_bytes = serde_json::to_vec(&r.manifest)
        .map_err(|e| base::format_err_t!(InvalidArgument, "re-encoding manifest: {e}"))?;
    let manifest = Manifest::parse(&manifest_bytes)?;
    let checksum = store.confirm(&session_id, &r.node_id, &manifest)?;
    Ok(json_response(
        StatusCode::OK,
        &ConfirmResponseBody {
            checksum: checksum.to_hex(),
        },
    ))
}

async fn handle_health(store: Arc<Store>) -> Result<Response<BoxBody>, base::Error> {
    let (storage_free_bytes, active_uploads) = store.health()?;
    Ok(json_response(
        StatusCode::OK,
        &serde_json::json!({
            "status": "ok",
            "storage_free_bytes": storage_free_bytes,
            "active_uploads": active_uploads,
        }),
    ))
}

async fn handle_session_status(store: Arc<Store>, id: &str) -> Result<Response<BoxBody>, base::Error> {
    let session_id = SessionId::parse(id.to_string())?;
    let status = store.session_status(&session_id)?;
    Ok(json_response(StatusCode::OK, &status))
}
