// This file is part of a security camera network recording coordinator.
// Copyright (C) 2018 The Moonfire NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Global, immutable configuration.
//! Reload is out of scope; a restart is the supported way to apply changes.

use crate::model::{NodeId, NodeIdentity};
use serde::{Deserialize, Serialize};
use std::time::Duration;

fn duration_secs(secs: u64) -> Duration {
    Duration::from_secs(secs)
}

fn duration_millis(ms: u64) -> Duration {
    Duration::from_millis(ms)
}

/// A statically-configured peer endpoint.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StaticPeer {
    pub node_id: NodeId,
    pub endpoint: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
    pub identity: NodeIdentity,
    pub static_peers: Vec<StaticPeer>,

    /// Endpoint of the master's sync-query API, used by a non-master node's
    /// `/sync/trigger` handler. `None` on the master itself, or
    /// on a slave that hasn't been told where the master is yet.
    #[serde(default)]
    pub master_endpoint: Option<String>,

    /// Minimum free storage required to arm (default 10 GiB).
    #[serde(default = "Config::default_min_free_bytes")]
    pub min_free_bytes: i64,

    /// Maximum tolerated `|sync_offset_ms|` for arming a non-master node,
    /// and for `ok` classification (default 5 ms).
    #[serde(default = "Config::default_sync_tolerance_ms")]
    pub sync_tolerance_ms: f64,

    /// Maximum tolerated round-trip time for `ok` classification (default 50 ms).
    #[serde(default = "Config::default_sync_rtt_max_ms")]
    pub sync_rtt_max_ms: f64,

    /// How long the master may go unreachable before sync is `fail` (default 60s).
    #[serde(default = "Config::default_sync_stale", with = "duration_secs_serde")]
    pub sync_stale: Duration,

    /// Sync query interval (default 10s).
    #[serde(default = "Config::default_sync_interval", with = "duration_secs_serde")]
    pub sync_interval: Duration,

    /// How long the driver may flush before being forced closed (default 10s).
    #[serde(default = "Config::default_stop_grace", with = "duration_secs_serde")]
    pub stop_grace: Duration,

    /// How long `POST /coordinator/stop` waits for all peers (default 20s).
    #[serde(default = "Config::default_stop_timeout", with = "duration_secs_serde")]
    pub stop_timeout: Duration,

    /// Per-peer RPC timeout for `arm`/`start` fan-out (default 3s).
    #[serde(default = "Config::default_arm_timeout", with = "duration_secs_serde")]
    pub arm_timeout: Duration,

    /// Per-peer RPC timeout for `GET /coordinator/status` (default 1s).
    #[serde(default = "Config::default_status_timeout", with = "duration_millis_serde")]
    pub status_timeout: Duration,

    /// Minimum participants for a `start` to be considered a success
    /// (default 2 of 3).
    #[serde(default = "Config::default_min_participants")]
    pub min_participants: usize,

    /// A peer is `online` if it answered within this long (default 5s).
    #[serde(default = "Config::default_peer_timeout", with = "duration_secs_serde")]
    pub peer_timeout: Duration,

    /// How long the node blocks on shutdown to finalize an in-progress
    /// recording (default 30s).
    #[serde(default = "Config::default_shutdown_grace", with = "duration_secs_serde")]
    pub shutdown_grace: Duration,

    /// Duration of a `POST /coordinator/test` self-check recording (default 10s).
    #[serde(default = "Config::default_test_duration", with = "duration_secs_serde")]
    pub test_duration: Duration,

    /// Whether a `LOCAL` recording file is deleted once `CONFIRMED`.
    #[serde(default)]
    pub delete_after_confirm: bool,

    /// Root directory under which `{session_id}/{node_id}/` recordings live.
    pub recordings_root: std::path::PathBuf,
}

impl Config {
    pub fn default_min_free_bytes() -> i64 {
        10 << 30 // 10 GiB
    }
    pub fn default_sync_tolerance_ms() -> f64 {
        5.0
    }
    pub fn default_sync_rtt_max_ms() -> f64 {
        50.0
    }
    pub fn default_sync_stale() -> Duration {
        duration_secs(60)
    }
    pub fn default_sync_interval() -> Duration {
        duration_secs(10)
    }
    pub fn default_stop_grace() -> Duration {
        duration_secs(10)
    }
    pub fn default_stop_timeout() -> Duration {
        duration_secs(20)
    }
    pub fn default_arm_timeout() -> Duration {
        duration_secs(3)
    }
    pub fn default_status_timeout() -> Duration {
        duration_millis(1000)
    }
    pub fn default_min_participants() -> usize {
        2
    }
    pub fn default_peer_timeout() -> Duration {
        duration_secs(5)
    }
    pub fn default_shutdown_grace() -> Duration {
        duration_secs(30)
    }
    pub fn default_test_duration() -> Duration {
        duration_secs(10)
    }

    pub fn warn_sync_tolerance_ms(&self) -> f64 {
        2.0 * self.sync_tolerance_ms
    }
}

mod duration_secs_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(d)?))
    }
}

mod duration_millis_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}
