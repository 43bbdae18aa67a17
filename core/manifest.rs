// This file is part of a security camera network recording coordinator.
// Copyright (C) 2018 The Moonfire NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! The manifest JSON document that accompanies every recording. Readers must tolerate unknown fields and reject unknown major
//! versions.

use crate::model::{Checksum, NodeId, Position, SessionId};
use serde::{Deserialize, Serialize};

pub const MANIFEST_VERSION: &str = "1";

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RecordingRef {
    pub id: String,
    pub session_id: SessionId,
    pub node_id: NodeId,
    pub position: Position,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FileInfo {
    pub name: String,
    pub size_bytes: u64,
    pub container: String,
    pub codec: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct VideoInfo {
    pub width: u32,
    pub height: u32,
    pub fps: f64,
    pub bitrate_mbps: f64,
    pub duration_sec: f64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TimingInfo {
    pub start_time: jiff::Timestamp,
    pub end_time: jiff::Timestamp,
    pub sync_ok: bool,
    pub sync_offset_ms: f64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChecksumInfo {
    pub algorithm: String,
    pub value: Checksum,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub hostname: String,
    pub endpoint: String,
    pub software_version: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct QualityInfo {
    pub dropped_frames: u64,
    pub temperature_avg_c: f64,
    pub temperature_max_c: f64,
}

/// Tolerates and ignores fields this version doesn't know about
/// (`#[serde(deny_unknown_fields)]` is deliberately absent).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Manifest {
    pub version: String,
    pub recording: RecordingRef,
    pub file: FileInfo,
    pub video: VideoInfo,
    pub timing: TimingInfo,
    pub checksum: ChecksumInfo,
    pub device: DeviceInfo,
    pub quality: QualityInfo,
    pub expected_cameras: Vec<NodeId>,
}

impl Manifest {
    /// Parses a manifest, rejecting unknown major versions but tolerating
    /// unknown fields within a known major version.
    pub fn parse(bytes: &[u8]) -> Result<Manifest, base::Error> {
        let value: serde_json::Value = serde_json::from_slice(bytes)
            .map_err(|e| base::format_err_t!(InvalidArgument, "malformed manifest json: {e}"))?;
        let version = value
            .get("version")
            .and_then(|v| v.as_str())
            .ok_or_else(|| base::format_err_t!(InvalidArgument, "manifest missing version"))?;
        let major = version.split('.').next().unwrap_or(version);
        if major != MANIFEST_VERSION {
            base::bail_t!(
                InvalidArgument,
                "unsupported manifest major version {:?}, expected {:?}",
                major,
                MANIFEST_VERSION
            );
        }
        serde_json::from_value(value)
            .map_err(|e| base::format_err_t!(InvalidArgument, "malformed manifest json: {e}"))
    }

    pub fn to_json_vec(&self) -> Vec<u8> {
        // Every field here is plain-old-data that serializes infallibly.
        serde_json::to_vec_pretty(self).expect("manifest always serializes")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    fn sample() -> Manifest {
        let _ = BTreeSet::<NodeId>::new();
        Manifest {
            version: MANIFEST_VERSION.to_string(),
            recording: RecordingRef {
                id: "GAME_20240315_140000_CAM_L".into(),
                session_id: SessionId::parse("GAME_20240315_140000").unwrap(),
                node_id: "CAM_L".into(),
                position: Position::Left,
            },
            file: FileInfo {
                name: "GAME_20240315_140000_CAM_L.mov".into(),
                size_bytes: 123,
                container: "mov".into(),
                codec: "h264".into(),
            },
            video: VideoInfo {
                width: 3840,
                height: 2160,
                fps: 30.0,
                bitrate_mbps: 50.0,
                duration_sec: 5400.0,
            },
            timing: TimingInfo {
                start_time: "2024-03-15T14:00:00Z".parse().unwrap(),
                end_time: "2024-03-15T15:30:00Z".parse().unwrap(),
                sync_ok: true,
                sync_offset_ms: 1.2,
            },
            checksum: ChecksumInfo {
                algorithm: "sha256".into(),
                value: Checksum([1u8; 32]),
            },
            device: DeviceInfo {
                hostname: "cam-l.local".into(),
                endpoint: "10.0.0.1:8080".into(),
                software_version: "0.1.0".into(),
            },
            quality: QualityInfo {
                dropped_frames: 0,
                temperature_avg_c: 41.0,
                temperature_max_c: 46.0,
            },
            expected_cameras: vec!["CAM_L".into(), "CAM_C".into(), "CAM_R".into()],
        }
    }

    #[test]
    fn round_trips_through_json() {
        let m = sample();
        let bytes = m.to_json_vec();
        let parsed = Manifest::parse(&bytes).unwrap();
        assert_eq!(parsed.recording.id, m.recording.id);
        assert_eq!(parsed.checksum.value.0, m.checksum.value.0);
    }

    #[test]
    fn tolerates_unknown_fields() {
        let mut value: serde_json::Value = serde_json::from_slice(&sample().to_json_vec()).unwrap();
        value["a_field_from_the_future"] = serde_json::json!("ignore me");
        let bytes = serde_json::to_vec(&value).unwrap();
        Manifest::parse(&bytes).unwrap();
    }

    #[test]
    fn rejects_unknown_major_version() {
        let mut value: serde_json::Value = serde_json::from_slice(&sample().to_json_vec()).unwrap();
        value["version"] = serde_json::json!("2");
        let bytes = serde_json::to_vec(&value).unwrap();
        assert!(Manifest::parse(&bytes).is_err());
    }
}
