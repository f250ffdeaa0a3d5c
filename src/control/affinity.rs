//! Key-to-partition and partition-to-owner mapping.
//!
//! Keys are routed to partitions with a seeded hash:
//! `partition = xxhash64(key, seed) % partitions`
//!
//! Owners of a partition at a topology version are ordered by highest random
//! weight over the node set recorded for that version: the first node is the
//! primary, the next `backups` nodes are the backups.

use crate::control::topology::TopologyTracker;
use crate::core::types::{NodeId, TopologyVersion};
use std::hash::Hasher;
use std::sync::Arc;
use twox_hash::XxHash64;

/// Seed used for key routing.
const KEY_HASH_SEED: u64 = 0x5eed_cafe;

/// Resolves key ownership for a topology version.
pub trait AffinityResolver: Send + Sync {
    /// Partition owning `key`.
    fn partition(&self, key: &[u8]) -> u32;

    /// Owners of `partition` at `version`: primary first, then backups.
    fn nodes(&self, partition: u32, version: TopologyVersion) -> Vec<NodeId>;

    /// Primary owner of `key` at `version`.
    fn primary(&self, key: &[u8], version: TopologyVersion) -> Option<NodeId> {
        self.nodes(self.partition(key), version).first().copied()
    }

    /// Backup owners of `partition` at `version`.
    fn backups(&self, partition: u32, version: TopologyVersion) -> Vec<NodeId> {
        self.nodes(partition, version).into_iter().skip(1).collect()
    }
}

/// Rendezvous (highest random weight) affinity over the tracker's node history.
pub struct RendezvousAffinity {
    topology: Arc<TopologyTracker>,
    partitions: u32,
    backups: u32,
}

impl RendezvousAffinity {
    pub fn new(topology: Arc<TopologyTracker>, partitions: u32, backups: u32) -> Self {
        Self {
            topology,
            partitions: partitions.max(1),
            backups,
        }
    }

    pub fn partitions(&self) -> u32 {
        self.partitions
    }
}

impl AffinityResolver for RendezvousAffinity {
    fn partition(&self, key: &[u8]) -> u32 {
        compute_partition(key, self.partitions)
    }

    fn nodes(&self, partition: u32, version: TopologyVersion) -> Vec<NodeId> {
        let Some(nodes) = self.topology.nodes_at(version) else {
            return Vec::new();
        };

        let mut weighted: Vec<(u64, NodeId)> = nodes
            .iter()
            .map(|node| (node_weight(partition, *node), *node))
            .collect();
        // Highest weight first; node id breaks ties deterministically.
        weighted.sort_by(|a, b| b.cmp(a));

        weighted
            .into_iter()
            .take(1 + self.backups as usize)
            .map(|(_, node)| node)
            .collect()
    }
}

/// Compute the partition for a key.
pub fn compute_partition(key: &[u8], partitions: u32) -> u32 {
    let mut hasher = XxHash64::with_seed(KEY_HASH_SEED);
    hasher.write(key);
    (hasher.finish() % u64::from(partitions.max(1))) as u32
}

fn node_weight(partition: u32, node: NodeId) -> u64 {
    let mut hasher = XxHash64::with_seed(u64::from(partition));
    hasher.write_u64(node.0);
    hasher.finish()
}
