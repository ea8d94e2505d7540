//! HTTP peer client.
//!
//! Carries replica sub-operations, liveness probes and membership
//! announcements to other nodes' internal endpoints.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::PeerError;
use crate::models::{MembershipChangeResponse, PingResponse};
use crate::replication::{ReplicaClient, ReplicaReply, ReplicaRequest};
use crate::ring::{MembershipEvent, NodeId};
use crate::tasks::Prober;

pub const REPLICA_PATH: &str = "/internal/v1/replica";
pub const PING_PATH: &str = "/internal/v1/ping";
pub const MEMBERSHIP_PATH: &str = "/internal/v1/membership";

#[derive(Debug, Clone)]
pub struct HttpPeerClient {
    client: Client,
}

impl HttpPeerClient {
    /// `request_timeout` bounds a whole exchange; callers usually apply a
    /// tighter per-call deadline on top.
    pub fn new(request_timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = Client::builder()
            .connect_timeout(request_timeout)
            .timeout(request_timeout)
            .build()?;
        Ok(Self { client })
    }

    fn url(node: &NodeId, path: &str) -> String {
        format!("http://{}{}", node, path)
    }

    pub async fn ping(&self, node: &NodeId) -> Result<PingResponse, PeerError> {
        let response = self
            .client
            .get(Self::url(node, PING_PATH))
            .send()
            .await
            .map_err(|e| classify(node, e))?;
        decode(node, response).await
    }

    /// Tells `node` about a membership change (our own join or leave).
    pub async fn announce(
        &self,
        node: &NodeId,
        event: &MembershipEvent,
    ) -> Result<MembershipChangeResponse, PeerError> {
        self.post(node, MEMBERSHIP_PATH, event).await
    }

    async fn post<B: Serialize + ?Sized, T: DeserializeOwned>(
        &self,
        node: &NodeId,
        path: &str,
        body: &B,
    ) -> Result<T, PeerError> {
        let response = self
            .client
            .post(Self::url(node, path))
            .json(body)
            .send()
            .await
            .map_err(|e| classify(node, e))?;
        decode(node, response).await
    }
}

fn classify(node: &NodeId, error: reqwest::Error) -> PeerError {
    if error.is_timeout() {
        PeerError::Timeout(node.clone())
    } else {
        PeerError::Unreachable(node.clone(), error.to_string())
    }
}

async fn decode<T: DeserializeOwned>(
    node: &NodeId,
    response: reqwest::Response,
) -> Result<T, PeerError> {
    let status = response.status();
    if !status.is_success() {
        return Err(PeerError::Unreachable(
            node.clone(),
            format!("status {}", status),
        ));
    }
    response
        .json::<T>()
        .await
        .map_err(|e| PeerError::Protocol(node.clone(), e.to_string()))
}

#[async_trait]
impl ReplicaClient for HttpPeerClient {
    async fn send(&self, node: &NodeId, request: ReplicaRequest) -> Result<ReplicaReply, PeerError> {
        self.post(node, REPLICA_PATH, &request).await
    }
}

#[async_trait]
impl Prober for HttpPeerClient {
    async fn probe(&self, node: &NodeId) -> Result<(), PeerError> {
        self.ping(node).await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peer_urls() {
        let node = NodeId::from("10.0.0.7:11311");
        assert_eq!(
            HttpPeerClient::url(&node, REPLICA_PATH),
            "http://10.0.0.7:11311/internal/v1/replica"
        );
    }

    #[tokio::test]
    async fn test_unreachable_peer_is_reported() {
        let client = HttpPeerClient::new(Duration::from_millis(200)).unwrap();
        // Port 9 on localhost is the discard service, almost never listening
        let node = NodeId::from("127.0.0.1:9");

        let error = client.probe(&node).await.unwrap_err();
        assert_eq!(error.node(), &node);
    }
}
