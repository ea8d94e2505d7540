//! Replica sub-operations and the transport that carries them.
//!
//! Every replica operation is an explicit request/reply message, even when
//! the target is the local node, so a coordinator never reaches into a
//! peer's state directly.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::cache::{DeleteOutcome, Precondition, SharedStore, VersionedWrite};
use crate::error::{PeerError, StoreError};
use crate::ring::NodeId;

/// Sub-operation sent by a coordinator to one replica.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ReplicaRequest {
    Read {
        key: Bytes,
    },
    Write(VersionedWrite),
    /// Versioned delete; leaves a tombstone on the replica
    Delete {
        key: Bytes,
        version: u64,
        precondition: Precondition,
    },
    /// Withdraws the write carrying `version` if it is still live
    Retract {
        key: Bytes,
        version: u64,
    },
}

/// A replica's answer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reply", rename_all = "snake_case")]
pub enum ReplicaReply {
    Found {
        value: Bytes,
        version: u64,
        expires_at: Option<u64>,
    },
    Missing {
        /// Version of the delete that removed the key, when known
        #[serde(default, skip_serializing_if = "Option::is_none")]
        deleted: Option<u64>,
    },
    Stored {
        version: u64,
    },
    Rejected {
        error: StoreError,
    },
    Deleted,
    NotFound,
}

/// Sends replica sub-operations to a node.
#[async_trait]
pub trait ReplicaClient: Send + Sync {
    async fn send(&self, node: &NodeId, request: ReplicaRequest) -> Result<ReplicaReply, PeerError>;
}

/// Executes replica sub-operations against this node's store. Used both by
/// the local coordinator and by the internal HTTP endpoint peers call.
#[derive(Debug, Clone)]
pub struct LocalReplica {
    store: SharedStore,
}

impl LocalReplica {
    pub fn new(store: SharedStore) -> Self {
        Self { store }
    }

    pub async fn handle(&self, request: ReplicaRequest) -> ReplicaReply {
        let mut store = self.store.write().await;
        match request {
            ReplicaRequest::Read { key } => match store.get(&key) {
                Some(entry) => ReplicaReply::Found {
                    value: entry.value,
                    version: entry.version,
                    expires_at: entry.expires_at,
                },
                None => ReplicaReply::Missing {
                    deleted: store.tombstone(&key),
                },
            },
            ReplicaRequest::Write(write) => match store.apply(write) {
                Ok(version) => ReplicaReply::Stored { version },
                Err(error) => ReplicaReply::Rejected { error },
            },
            ReplicaRequest::Delete {
                key,
                version,
                precondition,
            } => match store.apply_delete(key, version, precondition) {
                Ok(DeleteOutcome::Deleted) => ReplicaReply::Deleted,
                Ok(DeleteOutcome::NotFound) => ReplicaReply::NotFound,
                Err(error) => ReplicaReply::Rejected { error },
            },
            ReplicaRequest::Retract { key, version } => {
                if store.retract(&key, version) {
                    ReplicaReply::Deleted
                } else {
                    ReplicaReply::NotFound
                }
            }
        }
    }
}

/// Routes requests for the local node to its store and everything else to
/// a remote client.
#[derive(Clone)]
pub struct ClusterClient {
    local_id: NodeId,
    local: LocalReplica,
    remote: Arc<dyn ReplicaClient>,
}

impl ClusterClient {
    pub fn new(local_id: NodeId, local: LocalReplica, remote: Arc<dyn ReplicaClient>) -> Self {
        Self {
            local_id,
            local,
            remote,
        }
    }
}

#[async_trait]
impl ReplicaClient for ClusterClient {
    async fn send(&self, node: &NodeId, request: ReplicaRequest) -> Result<ReplicaReply, PeerError> {
        if *node == self.local_id {
            Ok(self.local.handle(request).await)
        } else {
            self.remote.send(node, request).await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{CacheStore, StoreCapacity};
    use std::sync::Mutex;
    use tokio::sync::RwLock;

    fn local() -> LocalReplica {
        LocalReplica::new(Arc::new(RwLock::new(CacheStore::new(StoreCapacity::entries(10)))))
    }

    fn write(version: u64, precondition: Precondition) -> ReplicaRequest {
        ReplicaRequest::Write(VersionedWrite {
            key: Bytes::from_static(b"k"),
            value: Bytes::from_static(b"v"),
            expires_at: None,
            version,
            precondition,
        })
    }

    #[tokio::test]
    async fn test_local_replica_round_trip() {
        let replica = local();

        let reply = replica.handle(write(9, Precondition::None)).await;
        assert_eq!(reply, ReplicaReply::Stored { version: 9 });

        let reply = replica
            .handle(ReplicaRequest::Read {
                key: Bytes::from_static(b"k"),
            })
            .await;
        assert!(matches!(reply, ReplicaReply::Found { version: 9, .. }));

        let reply = replica.handle(write(5, Precondition::None)).await;
        assert_eq!(
            reply,
            ReplicaReply::Rejected {
                error: StoreError::Superseded { current: 9 }
            }
        );

        let reply = replica
            .handle(ReplicaRequest::Delete {
                key: Bytes::from_static(b"k"),
                version: 12,
                precondition: Precondition::None,
            })
            .await;
        assert_eq!(reply, ReplicaReply::Deleted);

        let reply = replica
            .handle(ReplicaRequest::Read {
                key: Bytes::from_static(b"k"),
            })
            .await;
        assert_eq!(reply, ReplicaReply::Missing { deleted: Some(12) });
    }

    #[tokio::test]
    async fn test_retract_withdraws_only_its_own_write() {
        let replica = local();
        replica.handle(write(9, Precondition::None)).await;

        let retract = |version| ReplicaRequest::Retract {
            key: Bytes::from_static(b"k"),
            version,
        };
        assert_eq!(replica.handle(retract(8)).await, ReplicaReply::NotFound);
        assert_eq!(replica.handle(retract(9)).await, ReplicaReply::Deleted);

        let reply = replica
            .handle(ReplicaRequest::Read {
                key: Bytes::from_static(b"k"),
            })
            .await;
        assert_eq!(reply, ReplicaReply::Missing { deleted: None });
    }

    #[test]
    fn test_request_wire_format() {
        let request = write(3, Precondition::Version(2));
        let json = serde_json::to_string(&request).unwrap();
        assert!(json.contains(r#""op":"write""#));

        let back: ReplicaRequest = serde_json::from_str(&json).unwrap();
        assert_eq!(back, request);

        // Replies from a replica without tombstones omit the field
        let missing: ReplicaReply = serde_json::from_str(r#"{"reply":"missing"}"#).unwrap();
        assert_eq!(missing, ReplicaReply::Missing { deleted: None });
    }

    struct Recording(Mutex<Vec<NodeId>>);

    #[async_trait]
    impl ReplicaClient for Recording {
        async fn send(&self, node: &NodeId, _: ReplicaRequest) -> Result<ReplicaReply, PeerError> {
            self.0.lock().unwrap().push(node.clone());
            Ok(ReplicaReply::Missing { deleted: None })
        }
    }

    #[tokio::test]
    async fn test_cluster_client_routes_by_node() {
        let remote = Arc::new(Recording(Mutex::new(Vec::new())));
        let client = ClusterClient::new(NodeId::from("me:1"), local(), remote.clone());

        client
            .send(&NodeId::from("me:1"), write(1, Precondition::None))
            .await
            .unwrap();
        client
            .send(&NodeId::from("peer:1"), write(1, Precondition::None))
            .await
            .unwrap();

        assert_eq!(*remote.0.lock().unwrap(), vec![NodeId::from("peer:1")]);
    }
}
