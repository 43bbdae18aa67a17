// This file is part of a security camera network recording coordinator.
// Copyright (C) 2018 The Moonfire NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! [`IngestClient`] over hyper: the offload client's transport to the
//! ingest server's Ingest API.
//!
//! The trait's `confirm` takes only `(session_id, node_id)`, matching the
//! literal `/upload/confirm` wire contract. But the ingest server must
//! re-verify the manifest's checksum and needs `expected_cameras` to decide
//! publication -- so this implementation reads the `.json` manifest written
//! by the state machine alongside the recording file and folds it into the
//! request body as an extra field, which a server ignoring unknown fields
//! would simply skip.

use async_trait::async_trait;
use camrig_node::http_client::{request_json, HttpClient};
use core::model::{Checksum, SessionId};
use core::offload::{FinalizeResponse, IngestClient, InitResponse};
use hyper::Method;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

pub struct HyperIngestClient {
    client: HttpClient,
    base_url: String,
    timeout: Duration,
    manifest_dir: PathBuf,
}

impl HyperIngestClient {
    /// `manifest_dir` is the node's `recordings_root`; manifests live at
    /// `{recordings_root}/{session_id}/{node_id}/{recording_id}.json`.
    pub fn new(base_url: String, timeout: Duration, manifest_dir: PathBuf) -> Self {
        HyperIngestClient {
            client: camrig_node::http_client::new_client(),
            base_url,
            timeout,
            manifest_dir,
        }
    }

    fn manifest_path(&self, session_id: &SessionId, node_id: &str, recording_id: &str) -> PathBuf {
        self.manifest_dir
            .join(session_id.as_str())
            .join(node_id)
            .join(format!("{recording_id}.json"))
    }
}

#[derive(Serialize)]
struct InitRequest<'a> {
    node_id: &'a str,
    session_id: &'a SessionId,
    recording_id: &'a str,
    file_size: u64,
    chunk_size: u64,
    checksum: String,
}

#[derive(Deserialize)]
struct InitResponseBody {
    upload_id: String,
    received_chunks: Vec<u64>,
}

#[derive(Serialize)]
struct ChunkRequest {
    upload_id: String,
    chunk_index: u64,
    #[serde(with = "base64_bytes")]
    data: Vec<u8>,
}

mod base64_bytes {
    use base64::Engine;
    use serde::Serializer;

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&base64::engine::general_purpose::STANDARD.encode(bytes))
    }
}

#[derive(Serialize)]
struct FinalizeRequest {
    upload_id: String,
    total_chunks: u64,
}

#[derive(Deserialize)]
struct FinalizeResponseBody {
    checksum: String,
    size_bytes: u64,
}

#[derive(Serialize)]
struct ConfirmRequest<'a> {
    session_id: &'a SessionId,
    node_id: &'a str,
    manifest: serde_json::Value,
}

#[derive(Deserialize)]
struct ConfirmResponseBody {
    checksum: String,
}

#[async_trait]
impl IngestClient for HyperIngestClient {
    async fn init(
        &self,
        node_id: &str,
        session_id: &SessionId,
        recording_id: &str,
        file_size: u64,
        chunk_size: u64,
        checksum: &Checksum,
    ) -> Result<InitResponse, base::Error> {
        let r: InitResponseBody = request_json(
            &self.client,
            Method::POST,
            &format!("{}/upload/init", self.base_url),
            Some(&InitRequest {
                node_id,
                session_id,
                recording_id,
                file_size,
                chunk_size,
                checksum: checksum.to_hex(),
            }),
            self.timeout,
        )
        .await?;
        Ok(InitResponse {
            upload_id: r.upload_id,
            received_chunks: r.received_chunks.into_iter().collect(),
        })
    }

    async fn chunk(&self, upload_id: &str, chunk_index: u64, bytes: Vec<u8>) -> Result<(), base::Error> {
        request_json::<_, serde_json::Value>(
            &self.client,
            Method::POST,
            &format!("{}/upload/chunk", self.base_url),
            Some(&ChunkRequest {
                upload_id: upload_id.to_string(),
                chunk_index,
                data: bytes,
            }),
            self.timeout,
        )
        .await?;
        Ok(())
    }

    async fn finalize(&self, upload_id: &str, total_chunks: u64) -> Result<FinalizeResponse, base::Error> {
        let r: FinalizeResponseBody = request_json(
            &self.client,
            Method::POST,
            &format!("{}/upload/finalize", self.base_url),
            Some(&FinalizeRequest {
                upload_id: upload_id.to_string(),
                total_chunks,
            }),
            self.timeout,
        )
        .await?;
        Ok(FinalizeResponse {
            checksum: Checksum::from_hex(&r.checksum)?,
            size_bytes: r.size_bytes,
        })
    }

    async fn confirm(&self, session_id: &SessionId, node_id: &str) -> Result<Checksum, base::Error> {
        let recording_id = core::model::recording_id(session_id, node_id);
        let manifest_path = self.manifest_path(session_id, node_id, &recording_id);
        let manifest_bytes = std::fs::read(&manifest_path).map_err(|e| {
            base::format_err_t!(
                FailedPrecondition,
                "reading manifest {}: {e}",
                manifest_path.display()
            )
        })?;
        let manifest: serde_json::Value = serde_json::from_slice(&manifest_bytes)
            .map_err(|e| base::format_err_t!(Internal, "manifest {} is not valid json: {e}", manifest_path.display()))?;

        let r: ConfirmResponseBody = request_json(
            &self.client,
            Method::POST,
            &format!("{}/upload/confirm", self.base_url),
            Some(&ConfirmRequest {
                session_id,
                node_id,
                manifest,
            }),
            self.timeout,
        )
        .await?;
        Checksum::from_hex(&r.checksum)
    }
}
