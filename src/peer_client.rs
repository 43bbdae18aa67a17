// This file is part of a security camera network recording coordinator.
// Copyright (C) 2018 The Moonfire NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! [`PeerClient`] over hyper: the coordinator fans out to every peer's Node
//! control API through this implementation.

use async_trait::async_trait;
use camrig_node::http_client::{request_json, HttpClient};
use core::coordinator::{PeerClient, PreflightReport, StopOutcome};
use core::model::{NodeState, SessionId};
use hyper::Method;
use serde::Deserialize;
use std::time::Duration;

pub struct HyperPeerClient {
    client: HttpClient,
    timeout: Duration,
}

impl HyperPeerClient {
    pub fn new(timeout: Duration) -> Self {
        HyperPeerClient {
            client: camrig_node::http_client::new_client(),
            timeout,
        }
    }
}

#[derive(Deserialize)]
struct StartedAt {
    started_at: jiff::Timestamp,
}

#[async_trait]
impl PeerClient for HyperPeerClient {
    async fn status(&self, _node_id: &str, endpoint: &str) -> Result<NodeState, base::Error> {
        request_json(
            &self.client,
            Method::GET,
            &format!("http://{endpoint}/status"),
            None::<&()>,
            self.timeout,
        )
        .await
    }

    async fn preflight(&self, _node_id: &str, endpoint: &str) -> Result<PreflightReport, base::Error> {
        request_json(
            &self.client,
            Method::POST,
            &format!("http://{endpoint}/preflight"),
            None::<&()>,
            self.timeout,
        )
        .await
    }

    async fn arm(&self, _node_id: &str, endpoint: &str, session_id: &SessionId) -> Result<(), base::Error> {
        #[derive(serde::Serialize)]
        struct Body<'a> {
            session_id: &'a SessionId,
        }
        request_json::<_, serde_json::Value>(
            &self.client,
            Method::POST,
            &format!("http://{endpoint}/arm"),
            Some(&Body { session_id }),
            self.timeout,
        )
        .await?;
        Ok(())
    }

    async fn start(&self, _node_id: &str, endpoint: &str) -> Result<jiff::Timestamp, base::Error> {
        let r: StartedAt = request_json(
            &self.client,
            Method::POST,
            &format!("http://{endpoint}/start"),
            None::<&()>,
            self.timeout,
        )
        .await?;
        Ok(r.started_at)
    }

    async fn abort(&self, _node_id: &str, endpoint: &str) -> Result<(), base::Error> {
        request_json::<_, serde_json::Value>(
            &self.client,
            Method::POST,
            &format!("http://{endpoint}/abort"),
            None::<&()>,
            self.timeout,
        )
        .await?;
        Ok(())
    }

    async fn stop(&self, _node_id: &str, endpoint: &str) -> Result<StopOutcome, base::Error> {
        request_json(
            &self.client,
            Method::POST,
            &format!("http://{endpoint}/stop"),
            None::<&()>,
            self.timeout,
        )
        .await
    }

    async fn sync_trigger(&self, _node_id: &str, endpoint: &str) -> Result<(), base::Error> {
        request_json::<_, serde_json::Value>(
            &self.client,
            Method::POST,
            &format!("http://{endpoint}/sync/trigger"),
            None::<&()>,
            self.timeout,
        )
        .await?;
        Ok(())
    }
}
