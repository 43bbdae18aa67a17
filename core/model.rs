// This file is part of a security camera network recording coordinator.
// Copyright (C) 2018 The Moonfire NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! The shared data model: node identity, node state, sessions and
//! recordings.

use base::{bail_t, format_err_t};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// Opaque, cluster-unique node identifier (e.g. `CAM_L`).
pub type NodeId = String;

#[derive(Copy, Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Position {
    Left,
    Center,
    Right,
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            Position::Left => "left",
            Position::Center => "center",
            Position::Right => "right",
        };
        f.write_str(s)
    }
}

/// A node's identity, as established by static configuration. Stable
/// across restarts.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NodeIdentity {
    pub node_id: NodeId,
    pub position: Position,
    pub is_master: bool,
    pub endpoint: String,
}

/// Bounded states of the per-node recording state machine.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RecordingState {
    Idle,
    Armed,
    Recording,
    Finalizing,
    Error,
}

impl fmt::Display for RecordingState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            RecordingState::Idle => "IDLE",
            RecordingState::Armed => "ARMED",
            RecordingState::Recording => "RECORDING",
            RecordingState::Finalizing => "FINALIZING",
            RecordingState::Error => "ERROR",
        };
        f.write_str(s)
    }
}

/// A node's authoritative, locally-owned state.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NodeState {
    pub node_id: NodeId,
    pub position: Position,
    pub is_master: bool,
    pub camera_detected: bool,
    pub recording_state: RecordingState,
    pub current_session_id: Option<SessionId>,
    pub storage_free_bytes: i64,
    pub storage_total_bytes: i64,
    /// Signed offset from the master's clock, in milliseconds. `NaN` if unknown.
    pub sync_offset_ms: f64,
    pub temperature_c: f64,
    pub last_heartbeat_at: jiff::Timestamp,
}

impl NodeState {
    pub fn sync_offset_known(&self) -> bool {
        !self.sync_offset_ms.is_nan()
    }
}

/// A session identifier: `^[A-Za-z0-9_]{3,64}$`.
#[derive(Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    pub fn parse(s: impl Into<String>) -> Result<Self, base::Error> {
        let s = s.into();
        if s.len() < 3 || s.len() > 64 {
            bail_t!(
                InvalidArgument,
                "session_id must be 3-64 characters, got {}",
                s.len()
            );
        }
        if !s
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_')
        {
            bail_t!(
                InvalidArgument,
                "session_id {:?} doesn't match ^[A-Za-z0-9_]{{3,64}}$",
                s
            );
        }
        Ok(SessionId(s))
    }

    /// Generates the auto-form `GAME_YYYYMMDD_HHMMSS` from the master clock
    /// at start time.
    pub fn generate(now: jiff::Timestamp) -> Result<Self, base::Error> {
        let zoned = now.to_zoned(jiff::tz::TimeZone::UTC);
        let s = format!(
            "GAME_{:04}{:02}{:02}_{:02}{:02}{:02}",
            zoned.year(),
            zoned.month(),
            zoned.day(),
            zoned.hour(),
            zoned.minute(),
            zoned.second(),
        );
        SessionId::parse(s)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for SessionId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Status of a Session as tracked by the coordinator / ingest server.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SessionStatus {
    Open,
    Closed,
    Published,
    Partial,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Session {
    pub session_id: SessionId,
    pub started_at: jiff::Timestamp,
    pub ended_at: Option<jiff::Timestamp>,
    pub participants: BTreeSet<NodeId>,
    pub status: SessionStatus,
}

impl Session {
    pub fn new(session_id: SessionId, started_at: jiff::Timestamp) -> Self {
        Session {
            session_id,
            started_at,
            ended_at: None,
            participants: BTreeSet::new(),
            status: SessionStatus::Open,
        }
    }

    pub fn recording_id(&self, node_id: &str) -> String {
        recording_id(&self.session_id, node_id)
    }
}

pub fn recording_id(session_id: &SessionId, node_id: &str) -> String {
    format!("{session_id}_{node_id}")
}

/// Offload lifecycle of a per-node recording artifact.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OffloadState {
    Local,
    Uploading,
    Uploaded,
    Confirmed,
    Failed,
}

/// A SHA-256 checksum, rendered as lowercase hex in the wire format.
#[derive(Clone, Eq, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Checksum(#[serde(with = "hex_checksum")] pub [u8; 32]);

impl fmt::Debug for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Checksum({})", self.to_hex())
    }
}

impl Checksum {
    pub fn to_hex(&self) -> String {
        data_encoding::HEXLOWER.encode(&self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, base::Error> {
        let bytes = data_encoding::HEXLOWER_PERMISSIVE
            .decode(s.as_bytes())
            .map_err(|e| format_err_t!(InvalidArgument, "invalid checksum hex: {e}"))?;
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|_| format_err_t!(InvalidArgument, "checksum must be 32 bytes"))?;
        Ok(Checksum(arr))
    }
}

mod hex_checksum {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8; 32], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&data_encoding::HEXLOWER.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<[u8; 32], D::Error> {
        let s = String::deserialize(d)?;
        let v = data_encoding::HEXLOWER_PERMISSIVE
            .decode(s.as_bytes())
            .map_err(serde::de::Error::custom)?;
        v.try_into()
            .map_err(|_| serde::de::Error::custom("checksum must be 32 bytes"))
    }
}

/// A per-node, per-session recording artifact.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Recording {
    pub recording_id: String,
    pub session_id: SessionId,
    pub node_id: NodeId,
    pub file_path: std::path::PathBuf,
    pub size_bytes: u64,
    pub duration_seconds: f64,
    pub checksum: Option<Checksum>,
    pub offload_state: OffloadState,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_id_validates_charset_and_length() {
        assert!(SessionId::parse("ab").is_err());
        assert!(SessionId::parse("has a space").is_err());
        assert!(SessionId::parse(&"x".repeat(65)).is_err());
        assert!(SessionId::parse("GAME_20240315_140000").is_ok());
        assert!(SessionId::parse("abc").is_ok());
    }

    #[test]
    fn session_id_auto_form() {
        let ts: jiff::Timestamp = "2024-03-15T14:00:00Z".parse().unwrap();
        let id = SessionId::generate(ts).unwrap();
        assert_eq!(id.as_str(), "GAME_20240315_140000");
    }

    #[test]
    fn checksum_hex_round_trips() {
        let bytes = [7u8; 32];
        let c = Checksum(bytes);
        let hex = c.to_hex();
        let c2 = Checksum::from_hex(&hex).unwrap();
        assert_eq!(c.0, c2.0);
    }
}
