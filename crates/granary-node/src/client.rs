//! HTTP client for the coordinator's control channel.
//!
//! Registration happens once per node lifetime; heartbeats run for as long
//! as the daemon does. The credential travels only in headers against the
//! operator-configured coordinator URL.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{NodeError, Result};

/// A registration result; the credential is only ever returned here.
#[derive(Clone, Debug, Deserialize)]
pub struct RegisterReply {
    pub peer_id: String,
    pub credential: String,
}

/// A heartbeat acknowledgement.
#[derive(Clone, Debug, Deserialize)]
pub struct HeartbeatReply {
    pub status: String,
    pub earned_credits: i64,
}

#[derive(Serialize)]
struct RegisterBody<'a> {
    peer_id: &'a str,
    pubkey: String,
    transport_address: &'a str,
    declared_capacity_bytes: u64,
}

#[derive(Serialize)]
struct HeartbeatBody<'a> {
    used_bytes: u64,
    reachable_addresses: &'a [String],
}

/// Client for the coordinator control surface.
#[derive(Clone)]
pub struct CoordinatorClient {
    base_url: String,
    http: reqwest::Client,
}

impl CoordinatorClient {
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| NodeError::Coordinator(e.to_string()))?;
        Ok(Self {
            base_url: base_url.into(),
            http,
        })
    }

    /// Register this node; the reply carries the once-only credential.
    pub async fn register(
        &self,
        peer_id: &str,
        pubkey: &[u8],
        transport_address: &str,
        declared_capacity_bytes: u64,
    ) -> Result<RegisterReply> {
        let url = format!("{}/api/v1/peers/register", self.base_url);
        let response = self
            .http
            .post(&url)
            .json(&RegisterBody {
                peer_id,
                pubkey: hex::encode(pubkey),
                transport_address,
                declared_capacity_bytes,
            })
            .send()
            .await
            .map_err(|e| NodeError::Coordinator(e.to_string()))?;

        if !response.status().is_success() {
            return Err(NodeError::Coordinator(format!(
                "registration failed with status {}",
                response.status()
            )));
        }
        response
            .json()
            .await
            .map_err(|e| NodeError::Coordinator(e.to_string()))
    }

    /// Report liveness and used bytes; the ack carries the credit balance
    /// and the coordinator's view of our status.
    pub async fn heartbeat(
        &self,
        peer_id: &str,
        credential: &str,
        used_bytes: u64,
        reachable_addresses: &[String],
    ) -> Result<HeartbeatReply> {
        let url = format!("{}/api/v1/peers/heartbeat", self.base_url);
        let response = self
            .http
            .post(&url)
            .header("X-Peer-Id", peer_id)
            .header("X-Credential", credential)
            .json(&HeartbeatBody {
                used_bytes,
                reachable_addresses,
            })
            .send()
            .await
            .map_err(|e| NodeError::Coordinator(e.to_string()))?;

        if !response.status().is_success() {
            return Err(NodeError::Coordinator(format!(
                "heartbeat failed with status {}",
                response.status()
            )));
        }
        response
            .json()
            .await
            .map_err(|e| NodeError::Coordinator(e.to_string()))
    }

    /// Ask the coordinator to stop assigning new chunks to this node.
    pub async fn drain(&self, peer_id: &str) -> Result<()> {
        self.post_empty(&format!("{}/api/v1/peers/{peer_id}/drain", self.base_url))
            .await
    }

    /// Return a draining node to service.
    pub async fn resume(&self, peer_id: &str) -> Result<()> {
        self.post_empty(&format!("{}/api/v1/peers/{peer_id}/resume", self.base_url))
            .await
    }

    async fn post_empty(&self, url: &str) -> Result<()> {
        let response = self
            .http
            .post(url)
            .send()
            .await
            .map_err(|e| NodeError::Coordinator(e.to_string()))?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(NodeError::Coordinator(format!(
                "request failed with status {}",
                response.status()
            )))
        }
    }
}
