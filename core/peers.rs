// This file is part of a security camera network recording coordinator.
// Copyright (C) 2018 The Moonfire NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Peer Registry & Discovery. Protected by a reader-writer lock
//! since reads dominate.

use crate::model::NodeId;
use base::clock::Clocks;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// How a peer entry was learned, in precedence order. Static
/// entries are never evicted by discovery or reverse-learning.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Source {
    Static,
    Discovered,
    ReverseLearned,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PeerEntry {
    pub node_id: NodeId,
    pub endpoint: String,
    pub source: Source,
    pub last_seen: Option<jiff::Timestamp>,
}

#[derive(Copy, Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerStatus {
    Online,
    Offline,
}

pub struct PeerRegistry<C: Clocks> {
    clocks: C,
    peer_timeout: Duration,
    entries: RwLock<BTreeMap<NodeId, PeerEntry>>,
}

impl<C: Clocks> PeerRegistry<C> {
    pub fn new(clocks: C, peer_timeout: Duration) -> Self {
        PeerRegistry {
            clocks,
            peer_timeout,
            entries: RwLock::new(BTreeMap::new()),
        }
    }

    /// Installs the admin-configured peers. Static
    /// entries are authoritative and are never overwritten by discovery.
    pub fn add_static(&self, node_id: NodeId, endpoint: String) {
        let mut entries = self.entries.write();
        entries.insert(
            node_id.clone(),
            PeerEntry {
                node_id,
                endpoint,
                source: Source::Static,
                last_seen: None,
            },
        );
    }

    /// Records a discovery announcement. Never
    /// overrides a statically-configured endpoint for the same `node_id`.
    pub fn note_discovered(&self, node_id: NodeId, endpoint: String) {
        let mut entries = self.entries.write();
        let now = self.clocks.utc_now();
        match entries.get_mut(&node_id) {
            Some(e) if e.source == Source::Static => {
                e.last_seen = Some(now);
            }
            Some(e) => {
                e.endpoint = endpoint;
                e.source = Source::Discovered;
                e.last_seen = Some(now);
            }
            None => {
                entries.insert(
                    node_id.clone(),
                    PeerEntry {
                        node_id,
                        endpoint,
                        source: Source::Discovered,
                        last_seen: Some(now),
                    },
                );
            }
        }
    }

    /// Records that `node_id` just called in.
    pub fn note_seen(&self, node_id: &str) {
        let mut entries = self.entries.write();
        let now = self.clocks.utc_now();
        if let Some(e) = entries.get_mut(node_id) {
            e.last_seen = Some(now);
        }
    }

    /// Administrative add/remove.
    pub fn admin_add(&self, node_id: NodeId, endpoint: String) {
        self.add_static(node_id, endpoint);
    }

    pub fn admin_remove(&self, node_id: &str) -> bool {
        self.entries.write().remove(node_id).is_some()
    }

    pub fn get(&self, node_id: &str) -> Option<PeerEntry> {
        self.entries.read().get(node_id).cloned()
    }

    pub fn all(&self) -> Vec<PeerEntry> {
        self.entries.read().values().cloned().collect()
    }

    /// A peer is `online` if it has answered within `PEER_TIMEOUT`.
    pub fn status(&self, node_id: &str) -> PeerStatus {
        match self.entries.read().get(node_id).and_then(|e| e.last_seen) {
            Some(last_seen) => {
                let age = self.clocks.utc_now().since(last_seen).ok();
                match age.and_then(|s| s.total(jiff::Unit::Second).ok()) {
                    Some(secs) if secs <= self.peer_timeout.as_secs_f64() => PeerStatus::Online,
                    _ => PeerStatus::Offline,
                }
            }
            None => PeerStatus::Offline,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use base::clock::SimulatedClocks;

    fn registry() -> PeerRegistry<SimulatedClocks> {
        PeerRegistry::new(SimulatedClocks::new(jiff::Timestamp::now()), Duration::from_secs(5))
    }

    #[test]
    fn static_entries_take_precedence_over_discovery() {
        let r = registry();
        r.add_static("CAM_C".to_string(), "10.0.0.2:8080".to_string());
        r.note_discovered("CAM_C".to_string(), "10.0.0.99:9999".to_string());
        assert_eq!(r.get("CAM_C").unwrap().endpoint, "10.0.0.2:8080");
        assert_eq!(r.get("CAM_C").unwrap().source, Source::Static);
    }

    #[test]
    fn unseen_peer_is_offline() {
        let r = registry();
        r.add_static("CAM_R".to_string(), "10.0.0.3:8080".to_string());
        assert_eq!(r.status("CAM_R"), PeerStatus::Offline);
    }

    #[test]
    fn recently_seen_peer_is_online() {
        let r = registry();
        r.add_static("CAM_R".to_string(), "10.0.0.3:8080".to_string());
        r.note_seen("CAM_R");
        assert_eq!(r.status("CAM_R"), PeerStatus::Online);
    }

    #[test]
    fn admin_remove_drops_entry() {
        let r = registry();
        r.admin_add("CAM_R".to_string(), "10.0.0.3:8080".to_string());
        assert!(r.admin_remove("CAM_R"));
        assert!(r.get("CAM_R").is_none());
    }
}
