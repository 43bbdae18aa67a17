// This file is part of a security camera network recording coordinator.
// Copyright (C) 2018 The Moonfire NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Ingest server storage engine: a content-addressed,
//! filesystem-backed store fronted by a small SQLite bookkeeping database
//! that tracks in-flight uploads (so a restart doesn't lose resumability).

use base::{bail_t, format_err_t};
use core::manifest::Manifest;
use core::model::{Checksum, NodeId, SessionId};
use jiff::Timestamp;
use parking_lot::Mutex;
use rusqlite::{params, OptionalExtension};
use std::collections::BTreeSet;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::info;

/// Pragmas for full database integrity, as recommended for any SQLite
/// database holding data that must survive a crash.
static INTEGRITY_PRAGMAS: [&str; 2] = ["pragma foreign_keys = on", "pragma synchronous = 2"];

pub struct InitResponse {
    pub upload_id: String,
    pub received_chunks: BTreeSet<u64>,
}

pub struct FinalizeResponse {
    pub checksum: Checksum,
    pub size_bytes: u64,
}

#[derive(Clone, Debug, serde::Serialize)]
pub struct CameraStatus {
    pub node_id: NodeId,
    pub confirmed: bool,
}

#[derive(Clone, Debug, serde::Serialize)]
pub struct SessionStatusReport {
    pub session_id: SessionId,
    pub status: String,
    pub cameras: Vec<CameraStatus>,
}

pub struct Store {
    root: PathBuf,
    db: Mutex<rusqlite::Connection>,
}

fn staging_dir(root: &Path, session_id: &SessionId) -> PathBuf {
    root.join("staging").join(session_id.as_str())
}

fn published_dir(root: &Path, session_id: &SessionId) -> PathBuf {
    root.join("sessions").join(session_id.as_str())
}

fn recording_staging_path(root: &Path, session_id: &SessionId, node_id: &str) -> PathBuf {
    staging_dir(root, session_id).join(node_id).join("recording.upload")
}

impl Store {
    /// Opens (creating if absent) the storage root and its bookkeeping
    /// database.
    pub fn open(root: PathBuf) -> Result<Self, base::Error> {
        std::fs::create_dir_all(root.join("staging"))?;
        std::fs::create_dir_all(root.join("sessions"))?;
        let db_path = root.join("ingest.db");
        let mut conn = rusqlite::Connection::open(&db_path)
            .map_err(|e| format_err_t!(Internal, "opening ingest database: {e}"))?;
        for pragma in INTEGRITY_PRAGMAS {
            conn.execute(pragma, params![])
                .map_err(|e| format_err_t!(Internal, "{pragma}: {e}"))?;
        }
        let tx = conn
            .transaction()
            .map_err(|e| format_err_t!(Internal, "starting schema transaction: {e}"))?;
        // `create table` with no `if not exists`; tolerate re-opening an
        // existing database by ignoring "already exists" failures.
        if let Err(e) = tx.execute_batch(include_str!("schema.sql")) {
            if !e.to_string().contains("already exists") {
                return Err(format_err_t!(Internal, "creating ingest schema: {e}"));
            }
        }
        tx.commit()
            .map_err(|e| format_err_t!(Internal, "committing schema transaction: {e}"))?;
        Ok(Store {
            root,
            db: Mutex::new(conn),
        })
    }

    /// `POST /upload/init`: idempotent. A
    /// fresh `init` for a recording that already has an open upload returns
    /// the same `upload_id` and the chunks already received.
    pub fn init(
        &self,
        node_id: &str,
        session_id: &SessionId,
        recording_id: &str,
        file_size: u64,
        chunk_size: u64,
        checksum: &Checksum,
    ) -> Result<InitResponse, base::Error> {
        let db = self.db.lock();
        let existing: Option<String> = db
            .query_row(
                "select upload_id from uploads where recording_id = ?1",
                params![recording_id],
                |r| r.get(0),
            )
            .optional()
            .map_err(|e| format_err_t!(Internal, "{e}"))?;

        let upload_id = if let Some(upload_id) = existing {
            upload_id
        } else {
            let upload_id = uuid::Uuid::new_v4().to_string();
            db.execute(
                "insert into uploads (upload_id, recording_id, session_id, node_id, file_size, \
                 chunk_size, checksum_hex, status) values (?1, ?2, ?3, ?4, ?5, ?6, ?7, 'open')",
                params![
                    upload_id,
                    recording_id,
                    session_id.as_str(),
                    node_id,
                    file_size as i64,
                    chunk_size as i64,
                    checksum.to_hex(),
                ],
            )
            .map_err(|e| format_err_t!(Internal, "{e}"))?;

            let path = recording_staging_path(&self.root, session_id, node_id);
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let f = std::fs::File::create(&path)?;
            f.set_len(file_size)?;

            self.note_session_seen(&db, session_id)?;
            upload_id
        };

        let mut stmt = db
            .prepare("select chunk_index from chunks where upload_id = ?1 order by chunk_index")
            .map_err(|e| format_err_t!(Internal, "{e}"))?;
        let received = stmt
            .query_map(params![upload_id], |r| r.get::<_, i64>(0))
            .map_err(|e| format_err_t!(Internal, "{e}"))?
            .map(|r| r.map(|v| v as u64))
            .collect::<Result<BTreeSet<u64>, _>>()
            .map_err(|e| format_err_t!(Internal, "{e}"))?;

        Ok(InitResponse {
            upload_id,
            received_chunks: received,
        })
    }

    fn note_session_seen(&self, db: &rusqlite::Connection, session_id: &SessionId) -> Result<(), base::Error> {
        let exists: bool = db
            .query_row(
                "select 1 from sessions where session_id = ?1",
                params![session_id.as_str()],
                |_| Ok(()),
            )
            .optional()
            .map_err(|e| format_err_t!(Internal, "{e}"))?
            .is_some();
        if !exists {
            db.execute(
                "insert into sessions (session_id, expected_cameras_json, first_upload_at, status) \
                 values (?1, '[]', ?2, 'open')",
                params![session_id.as_str(), Timestamp::now().to_string()],
            )
            .map_err(|e| format_err_t!(Internal, "{e}"))?;
        }
        Ok(())
    }

    /// `POST /upload/chunk`: a chunk with an already-
    /// persisted index is accepted as a no-op if its size matches.
    pub fn chunk(&self, upload_id: &str, chunk_index: u64, bytes: &[u8]) -> Result<(), base::Error> {
        let db = self.db.lock();
        let (session_id, node_id, chunk_size, file_size): (String, String, i64, i64) = db
            .query_row(
                "select session_id, node_id, chunk_size, file_size from uploads where upload_id = ?1",
                params![upload_id],
                |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?)),
            )
            .optional()
            .map_err(|e| format_err_t!(Internal, "{e}"))?
            .ok_or_else(|| format_err_t!(NotFound, "unknown upload_id {upload_id}"))?;

        let existing_size: Option<i64> = db
            .query_row(
                "select size from chunks where upload_id = ?1 and chunk_index = ?2",
                params![upload_id, chunk_index as i64],
                |r| r.get(0),
            )
            .optional()
            .map_err(|e| format_err_t!(Internal, "{e}"))?;
        if let Some(existing_size) = existing_size {
            if existing_size as usize == bytes.len() {
                return Ok(());
            }
            bail_t!(
                DataLoss,
                "chunk {chunk_index} resent with different size ({} vs {})",
                bytes.len(),
                existing_size
            );
        }

        let offset = chunk_index as i64 * chunk_size;
        if offset >= file_size {
            bail_t!(InvalidArgument, "chunk_index {chunk_index} is beyond file_size");
        }

        let session_id = SessionId::parse(session_id)?;
        let path = recording_staging_path(&self.root, &session_id, &node_id);
        let mut f = std::fs::OpenOptions::new().write(true).open(&path)?;
        f.seek(SeekFrom::Start(offset as u64))?;
        f.write_all(bytes)?;

        db.execute(
            "insert into chunks (upload_id, chunk_index, size) values (?1, ?2, ?3)",
            params![upload_id, chunk_index as i64, bytes.len() as i64],
        )
        .map_err(|e| format_err_t!(Internal, "{e}"))?;
        Ok(())
    }

    /// `POST /upload/finalize`: verifies every chunk has
    /// arrived, then hashes the full reassembled file.
    pub fn finalize(&self, upload_id: &str, total_chunks: u64) -> Result<FinalizeResponse, base::Error> {
        let (session_id, node_id, file_size): (String, String, i64) = {
            let db = self.db.lock();
            let present: i64 = db
                .query_row(
                    "select count(*) from chunks where upload_id = ?1",
                    params![upload_id],
                    |r| r.get(0),
                )
                .map_err(|e| format_err_t!(Internal, "{e}"))?;
            if present as u64 != total_chunks {
                bail_t!(
                    FailedPrecondition,
                    "only {present} of {total_chunks} chunks received"
                );
            }
            let row = db
                .query_row(
                    "select session_id, node_id, file_size from uploads where upload_id = ?1",
                    params![upload_id],
                    |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
                )
                .optional()
                .map_err(|e| format_err_t!(Internal, "{e}"))?
                .ok_or_else(|| format_err_t!(NotFound, "unknown upload_id {upload_id}"))?;
            db.execute(
                "update uploads set status = 'finalized' where upload_id = ?1",
                params![upload_id],
            )
            .map_err(|e| format_err_t!(Internal, "{e}"))?;
            row
        };

        let session_id = SessionId::parse(session_id)?;
        let path = recording_staging_path(&self.root, &session_id, &node_id);
        let mut f = std::fs::File::open(&path)?;
        let mut ctx = ring::digest::Context::new(&ring::digest::SHA256);
        let mut buf = vec![0u8; 256 * 1024];
        loop {
            let n = f.read(&mut buf)?;
            if n == 0 {
                break;
            }
            ctx.update(&buf[..n]);
        }
        let digest = ctx.finish();
        let mut arr = [0u8; 32];
        arr.copy_from_slice(digest.as_ref());
        info!(upload_id, %session_id, node_id, "upload finalized");
        Ok(FinalizeResponse {
            checksum: Checksum(arr),
            size_bytes: file_size as u64,
        })
    }

    /// `POST /upload/confirm`: idempotent. Persists the
    /// manifest, publishes the recording under the session's staging
    /// directory with its final on-disk name, and checks whether the
    /// session as a whole is now complete.
    ///
    /// The wire protocol does not separately specify how the manifest
    /// reaches the server; this implementation has the client attach it to
    /// `confirm`, the first point at which the client knows the upload
    /// verified end to end.
    pub fn confirm(
        &self,
        session_id: &SessionId,
        node_id: &str,
        manifest: &Manifest,
    ) -> Result<Checksum, base::Error> {
        let db = self.db.lock();
        if let Some(hex) = db
            .query_row(
                "select checksum_hex from confirmed where session_id = ?1 and node_id = ?2",
                params![session_id.as_str(), node_id],
                |r| r.get::<_, String>(0),
            )
            .optional()
            .map_err(|e| format_err_t!(Internal, "{e}"))?
        {
            return Checksum::from_hex(&hex);
        }

        let (checksum_hex, status): (String, String) = db
            .query_row(
                "select checksum_hex, status from uploads where session_id = ?1 and node_id = ?2",
                params![session_id.as_str(), node_id],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .optional()
            .map_err(|e| format_err_t!(Internal, "{e}"))?
            .ok_or_else(|| format_err_t!(NotFound, "no upload for {session_id}/{node_id}"))?;
        if status != "finalized" {
            bail_t!(FailedPrecondition, "upload for {session_id}/{node_id} not finalized yet");
        }
        if checksum_hex != manifest.checksum.value.to_hex() {
            bail_t!(DataLoss, "manifest checksum does not match uploaded bytes");
        }

        let dest_dir = staging_dir(&self.root, session_id).join(node_id);
        std::fs::create_dir_all(&dest_dir)?;
        let final_name = format!("recording.{}", manifest.file.container);
        std::fs::rename(
            recording_staging_path(&self.root, session_id, node_id),
            dest_dir.join(&final_name),
        )?;
        std::fs::write(dest_dir.join("manifest.json"), manifest.to_json_vec())?;

        db.execute(
            "insert into confirmed (session_id, node_id, checksum_hex, manifest_json, confirmed_at) \
             values (?1, ?2, ?3, ?4, ?5)",
            params![
                session_id.as_str(),
                node_id,
                checksum_hex,
                String::from_utf8_lossy(&manifest.to_json_vec()).to_string(),
                Timestamp::now().to_string(),
            ],
        )
        .map_err(|e| format_err_t!(Internal, "{e}"))?;
        db.execute(
            "update sessions set expected_cameras_json = ?2 where session_id = ?1 and expected_cameras_json = '[]'",
            params![
                session_id.as_str(),
                serde_json::to_string(&manifest.expected_cameras).unwrap(),
            ],
        )
        .map_err(|e| format_err_t!(Internal, "{e}"))?;

        drop(db);
        self.try_publish(session_id)?;
        Checksum::from_hex(&checksum_hex)
    }

    /// Publishes the session (atomic directory rename from `staging/` to
    /// `sessions/`) once every expected camera has a confirmed recording.
    fn try_publish(&self, session_id: &SessionId) -> Result<(), base::Error> {
        let db = self.db.lock();
        let expected_json: String = db
            .query_row(
                "select expected_cameras_json from sessions where session_id = ?1",
                params![session_id.as_str()],
                |r| r.get(0),
            )
            .map_err(|e| format_err_t!(Internal, "{e}"))?;
        let expected: Vec<NodeId> = serde_json::from_str(&expected_json).unwrap_or_default();
        if expected.is_empty() {
            return Ok(());
        }

        let mut stmt = db
            .prepare("select node_id from confirmed where session_id = ?1")
            .map_err(|e| format_err_t!(Internal, "{e}"))?;
        let confirmed: BTreeSet<String> = stmt
            .query_map(params![session_id.as_str()], |r| r.get(0))
            .map_err(|e| format_err_t!(Internal, "{e}"))?
            .collect::<Result<_, _>>()
            .map_err(|e| format_err_t!(Internal, "{e}"))?;

        if !expected.iter().all(|n| confirmed.contains(n)) {
            return Ok(());
        }

        let from = staging_dir(&self.root, session_id);
        let to = published_dir(&self.root, session_id);
        if let Some(parent) = to.parent() {
            std::fs::create_dir_all(parent)?;
        }
        if !to.exists() {
            std::fs::rename(&from, &to)?;
        }
        db.execute(
            "update sessions set status = 'published' where session_id = ?1",
            params![session_id.as_str()],
        )
        .map_err(|e| format_err_t!(Internal, "{e}"))?;
        info!(%session_id, "session published");
        Ok(())
    }

    /// Marks a session PARTIAL if `SESSION_COMPLETE_TIMEOUT` has elapsed
    /// since its first upload without every camera confirming.
    pub fn expire_incomplete_sessions(&self, timeout: std::time::Duration) -> Result<(), base::Error> {
        let db = self.db.lock();
        let mut stmt = db
            .prepare("select session_id, first_upload_at from sessions where status = 'open'")
            .map_err(|e| format_err_t!(Internal, "{e}"))?;
        let rows: Vec<(String, String)> = stmt
            .query_map(params![], |r| Ok((r.get(0)?, r.get(1)?)))
            .map_err(|e| format_err_t!(Internal, "{e}"))?
            .collect::<Result<_, _>>()
            .map_err(|e| format_err_t!(Internal, "{e}"))?;
        let now = Timestamp::now();
        for (session_id, first_upload_at) in rows {
            let Ok(first) = first_upload_at.parse::<Timestamp>() else { continue };
            let age = now.since(first).ok().and_then(|s| s.total(jiff::Unit::Second).ok());
            if age.is_some_and(|secs| secs >= timeout.as_secs_f64()) {
                db.execute(
                    "update sessions set status = 'partial' where session_id = ?1",
                    params![session_id],
                )
                .map_err(|e| format_err_t!(Internal, "{e}"))?;
                info!(session_id, "session marked PARTIAL: completion timeout elapsed");
            }
        }
        Ok(())
    }

    /// `GET /sessions/{id}`.
    pub fn session_status(&self, session_id: &SessionId) -> Result<SessionStatusReport, base::Error> {
        let db = self.db.lock();
        let (expected_json, status): (String, String) = db
            .query_row(
                "select expected_cameras_json, status from sessions where session_id = ?1",
                params![session_id.as_str()],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .optional()
            .map_err(|e| format_err_t!(Internal, "{e}"))?
            .ok_or_else(|| format_err_t!(NotFound, "no such session {session_id}"))?;
        let expected: Vec<NodeId> = serde_json::from_str(&expected_json).unwrap_or_default();

        let mut stmt = db
            .prepare("select node_id from confirmed where session_id = ?1")
            .map_err(|e| format_err_t!(Internal, "{e}"))?;
        let confirmed: BTreeSet<String> = stmt
            .query_map(params![session_id.as_str()], |r| r.get(0))
            .map_err(|e| format_err_t!(Internal, "{e}"))?
            .collect::<Result<_, _>>()
            .map_err(|e| format_err_t!(Internal, "{e}"))?;

        let cameras = expected
            .into_iter()
            .map(|node_id| {
                let confirmed = confirmed.contains(&node_id);
                CameraStatus { node_id, confirmed }
            })
            .collect();
        Ok(SessionStatusReport {
            session_id: session_id.clone(),
            status,
            cameras,
        })
    }

    /// `GET /health`.
    pub fn health(&self) -> Result<(i64, u64), base::Error> {
        let db = self.db.lock();
        let active_uploads: i64 = db
            .query_row("select count(*) from uploads where status = 'open'", params![], |r| r.get(0))
            .map_err(|e| format_err_t!(Internal, "{e}"))?;
        let free = storage_free_bytes(&self.root)?;
        Ok((free, active_uploads as u64))
    }
}

fn storage_free_bytes(path: &Path) -> Result<i64, base::Error> {
    let stat = nix::sys::statvfs::statvfs(path)
        .map_err(|e| format_err_t!(Internal, "statvfs({}): {e}", path.display()))?;
    Ok((stat.blocks_available() as u64).saturating_mul(stat.fragment_size()) as i64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::manifest::{ChecksumInfo, DeviceInfo, FileInfo, QualityInfo, RecordingRef, TimingInfo, VideoInfo};
    use core::model::Position;

    fn store() -> (tempfile::TempDir, Store) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path().to_path_buf()).unwrap();
        (dir, store)
    }

    fn checksum_of(bytes: &[u8]) -> Checksum {
        let mut ctx = ring::digest::Context::new(&ring::digest::SHA256);
        ctx.update(bytes);
        let digest = ctx.finish();
        let mut arr = [0u8; 32];
        arr.copy_from_slice(digest.as_ref());
        Checksum(arr)
    }

    fn manifest_for(session_id: &SessionId, node_id: &str, checksum: Checksum, expected: Vec<NodeId>) -> Manifest {
        Manifest {
            version: core::manifest::MANIFEST_VERSION.to_string(),
            recording: RecordingRef {
                id: format!("{session_id}_{node_id}"),
                session_id: session_id.clone(),
                node_id: node_id.to_string(),
                position: Position::Left,
            },
            file: FileInfo {
                name: "recording.mov".to_string(),
                size_bytes: 0,
                container: "mov".to_string(),
                codec: "h264".to_string(),
            },
            video: VideoInfo {
                width: 1,
                height: 1,
                fps: 1.0,
                bitrate_mbps: 1.0,
                duration_sec: 1.0,
            },
            timing: TimingInfo {
                start_time: Timestamp::now(),
                end_time: Timestamp::now(),
                sync_ok: true,
                sync_offset_ms: 0.0,
            },
            checksum: ChecksumInfo {
                algorithm: "sha256".to_string(),
                value: checksum,
            },
            device: DeviceInfo {
                hostname: node_id.to_string(),
                endpoint: "x".to_string(),
                software_version: "0.1.0".to_string(),
            },
            quality: QualityInfo {
                dropped_frames: 0,
                temperature_avg_c: 0.0,
                temperature_max_c: 0.0,
            },
            expected_cameras: expected,
        }
    }

    #[test]
    fn init_is_idempotent_for_same_recording() {
        let (_dir, store) = store();
        let session_id = SessionId::parse("TEST_D").unwrap();
        let checksum = checksum_of(b"hello");
        let a = store.init("CAM_L", &session_id, "TEST_D_CAM_L", 5, 100, &checksum).unwrap();
        let b = store.init("CAM_L", &session_id, "TEST_D_CAM_L", 5, 100, &checksum).unwrap();
        assert_eq!(a.upload_id, b.upload_id);
    }

    #[test]
    fn resume_reports_exactly_the_received_chunks() {
        let (_dir, store) = store();
        let session_id = SessionId::parse("TEST_D").unwrap();
        let checksum = checksum_of(&vec![0u8; 250]);
        let init = store.init("CAM_L", &session_id, "TEST_D_CAM_L", 250, 100, &checksum).unwrap();
        store.chunk(&init.upload_id, 0, &vec![0u8; 100]).unwrap();
        store.chunk(&init.upload_id, 1, &vec![0u8; 100]).unwrap();

        let resumed = store.init("CAM_L", &session_id, "TEST_D_CAM_L", 250, 100, &checksum).unwrap();
        assert_eq!(resumed.upload_id, init.upload_id);
        assert_eq!(resumed.received_chunks, BTreeSet::from([0, 1]));
    }

    #[test]
    fn full_upload_confirm_and_publish() {
        let (_dir, store) = store();
        let session_id = SessionId::parse("GAME_20240315_140000").unwrap();
        let bytes = vec![42u8; 300];
        let checksum = checksum_of(&bytes);
        let init = store
            .init("CAM_L", &session_id, "GAME_20240315_140000_CAM_L", 300, 100, &checksum)
            .unwrap();
        for (i, chunk) in bytes.chunks(100).enumerate() {
            store.chunk(&init.upload_id, i as u64, chunk).unwrap();
        }
        let finalize = store.finalize(&init.upload_id, 3).unwrap();
        assert_eq!(finalize.checksum, checksum);

        let manifest = manifest_for(&session_id, "CAM_L", checksum.clone(), vec!["CAM_L".to_string()]);
        let confirmed = store.confirm(&session_id, "CAM_L", &manifest).unwrap();
        assert_eq!(confirmed, checksum);

        let status = store.session_status(&session_id).unwrap();
        assert_eq!(status.status, "published");
        assert!(status.cameras[0].confirmed);
    }

    #[test]
    fn confirm_is_idempotent() {
        let (_dir, store) = store();
        let session_id = SessionId::parse("TEST_IDEMP").unwrap();
        let bytes = vec![1u8; 10];
        let checksum = checksum_of(&bytes);
        let init = store.init("CAM_L", &session_id, "TEST_IDEMP_CAM_L", 10, 100, &checksum).unwrap();
        store.chunk(&init.upload_id, 0, &bytes).unwrap();
        store.finalize(&init.upload_id, 1).unwrap();
        let manifest = manifest_for(&session_id, "CAM_L", checksum.clone(), vec!["CAM_L".to_string()]);
        let c1 = store.confirm(&session_id, "CAM_L", &manifest).unwrap();
        let c2 = store.confirm(&session_id, "CAM_L", &manifest).unwrap();
        assert_eq!(c1, c2);
    }

    #[test]
    fn partial_session_stays_open_until_all_confirm() {
        let (_dir, store) = store();
        let session_id = SessionId::parse("TEST_PARTIAL").unwrap();
        let bytes = vec![2u8; 10];
        let checksum = checksum_of(&bytes);
        let init = store.init("CAM_L", &session_id, "TEST_PARTIAL_CAM_L", 10, 100, &checksum).unwrap();
        store.chunk(&init.upload_id, 0, &bytes).unwrap();
        store.finalize(&init.upload_id, 1).unwrap();
        let manifest = manifest_for(
            &session_id,
            "CAM_L",
            checksum.clone(),
            vec!["CAM_L".to_string(), "CAM_C".to_string()],
        );
        store.confirm(&session_id, "CAM_L", &manifest).unwrap();
        let status = store.session_status(&session_id).unwrap();
        assert_eq!(status.status, "open");
    }
}
