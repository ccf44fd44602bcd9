use crate::types::{NodeInfo, PartitionId};
use async_trait::async_trait;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, RwLock as StdRwLock};
use tokio::sync::RwLock;

/// Notified, on the caller's own actor, whenever a partition's leader
/// changes (§6: "TopologyManager contract").
#[async_trait]
pub trait TopologyPartitionListener: Send + Sync {
    async fn on_partition_leader_updated(&self, partition: PartitionId, leader: NodeInfo);

    /// Fired when the system partition (partition 1, by Zeebe-style
    /// convention) gets a new leader — the address `fetch_created_topics`
    /// bootstraps against.
    async fn on_system_partition_leader_updated(&self, leader: SocketAddr);
}

/// External collaborator contract: register to be told about topology
/// changes. The cluster membership protocol that drives these callbacks is
/// explicitly out of scope (§1 non-goals) — this core only consumes its
/// output.
pub trait TopologyManager: Send + Sync {
    fn add_topology_partition_listener(&self, listener: Arc<dyn TopologyPartitionListener>);
}

/// Snapshot of partitions → current leader address (§2). Read-mostly;
/// mutated only by topology callbacks, all of which are dispatched onto the
/// same single-threaded actor that owns the router (§5) — so a plain
/// `RwLock` is enough, no lock-free structure is warranted.
#[derive(Default)]
pub struct TopologyView {
    leaders: RwLock<HashMap<PartitionId, NodeInfo>>,
    /// A plain `std::sync::RwLock`, not `tokio::sync::RwLock`: the bootstrap
    /// `LeaderResolver` (§6) is a synchronous closure re-invoked on every
    /// retry attempt, so this field must be readable without an `.await`.
    /// Writes only ever come from a topology callback and hold the lock for
    /// a single pointer-sized copy, so there is no risk of blocking the
    /// single-threaded actor (§5).
    system_partition_leader: StdRwLock<Option<SocketAddr>>,
    partition_ids: RwLock<Option<Vec<PartitionId>>>,
}

impl TopologyView {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn leader_of(&self, partition: PartitionId) -> Option<NodeInfo> {
        self.leaders.read().await.get(&partition).copied()
    }

    pub async fn update_leader(&self, partition: PartitionId, leader: NodeInfo) {
        self.leaders.write().await.insert(partition, leader);
    }

    pub fn system_partition_leader(&self) -> Option<SocketAddr> {
        *self.system_partition_leader.read().unwrap()
    }

    pub fn update_system_partition_leader(&self, leader: SocketAddr) {
        *self.system_partition_leader.write().unwrap() = Some(leader);
    }

    /// Installed once `fetchCreatedTopics` completes (§4.1).
    pub async fn set_partition_ids(&self, ids: Vec<PartitionId>) {
        *self.partition_ids.write().await = Some(ids);
    }

    pub async fn partition_ids(&self) -> Option<Vec<PartitionId>> {
        self.partition_ids.read().await.clone()
    }

    pub async fn has_partition_ids(&self) -> bool {
        self.partition_ids.read().await.is_some()
    }
}

#[async_trait]
impl TopologyPartitionListener for TopologyView {
    async fn on_partition_leader_updated(&self, partition: PartitionId, leader: NodeInfo) {
        self.update_leader(partition, leader).await;
    }

    async fn on_system_partition_leader_updated(&self, leader: SocketAddr) {
        self.update_system_partition_leader(leader);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        format!("127.0.0.1:{port}").parse().unwrap()
    }

    #[tokio::test]
    async fn leader_lookup_reflects_latest_update() {
        let view = TopologyView::new();
        assert!(view.leader_of(PartitionId(2)).await.is_none());

        let info = NodeInfo {
            subscription_api: addr(26501),
            management_api: addr(26502),
        };
        view.on_partition_leader_updated(PartitionId(2), info).await;
        assert_eq!(view.leader_of(PartitionId(2)).await, Some(info));
    }

    #[tokio::test]
    async fn has_partition_ids_flips_once_set() {
        let view = TopologyView::new();
        assert!(!view.has_partition_ids().await);
        view.set_partition_ids(vec![PartitionId(1), PartitionId(2)]).await;
        assert!(view.has_partition_ids().await);
    }
}
