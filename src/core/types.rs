//! Identifiers and value types shared by the write path.
//!
//! - [`NodeId`] - cluster node identity
//! - [`TopologyVersion`] - totally ordered `(major, minor)` topology epoch
//! - [`WriteVersion`] - per-update version used for ordering and duplicate detection
//! - [`SyncMode`] - write synchronization contract
//! - [`Operation`] - kind of update carried by a request

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Cache key bytes.
pub type Key = Bytes;

/// Cache value bytes.
pub type Value = Bytes;

/// Identifier of an in-flight coordinator, unique within one node's registry.
pub type FutureId = u64;

/// TTL sentinel: keep the entry's current TTL.
pub const TTL_NOT_CHANGED: i64 = -1;

/// TTL sentinel: entry never expires.
pub const TTL_ETERNAL: i64 = 0;

/// Expire-time sentinel: the receiver computes the expire time from the TTL.
pub const EXPIRE_TIME_CALCULATE: i64 = -1;

/// Cluster node identifier.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct NodeId(pub u64);

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "node-{}", self.0)
    }
}

impl From<u64> for NodeId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

/// Topology version: `major` increments on every membership change, `minor` on
/// assignment-only changes within the same membership.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct TopologyVersion {
    pub major: u64,
    pub minor: u32,
}

impl TopologyVersion {
    /// Version before any topology has been observed.
    pub const ZERO: TopologyVersion = TopologyVersion { major: 0, minor: 0 };

    pub const fn new(major: u64, minor: u32) -> Self {
        Self { major, minor }
    }

    /// First version of the next membership epoch.
    pub fn next_major(&self) -> Self {
        Self {
            major: self.major + 1,
            minor: 0,
        }
    }

    /// Next assignment change within the same membership epoch.
    pub fn next_minor(&self) -> Self {
        Self {
            major: self.major,
            minor: self.minor + 1,
        }
    }

    pub fn is_zero(&self) -> bool {
        *self == Self::ZERO
    }
}

impl std::fmt::Display for TopologyVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// Version assigned once per logical update.
///
/// Ordering compares the topology epoch first, then the per-node counter, then the
/// node order, so versions from different writers are totally ordered.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct WriteVersion {
    pub topology_order: u32,
    pub order: u64,
    pub node_order: u32,
}

impl WriteVersion {
    pub const fn new(topology_order: u32, order: u64, node_order: u32) -> Self {
        Self {
            topology_order,
            order,
            node_order,
        }
    }
}

impl std::fmt::Display for WriteVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}:{}:{}",
            self.topology_order, self.order, self.node_order
        )
    }
}

/// Generates monotonically increasing write versions for one node.
#[derive(Debug)]
pub struct WriteVersionGenerator {
    node_order: u32,
    counter: AtomicU64,
}

impl WriteVersionGenerator {
    pub fn new(node_order: u32) -> Self {
        Self {
            node_order,
            counter: AtomicU64::new(0),
        }
    }

    /// Assign the next version under the given topology.
    pub fn next(&self, topology: TopologyVersion) -> WriteVersion {
        let order = self.counter.fetch_add(1, Ordering::AcqRel) + 1;
        WriteVersion::new(topology.major as u32, order, self.node_order)
    }
}

/// Write synchronization contract.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    /// Client waits for the primary and all backups.
    #[default]
    FullSync,
    /// Client waits for the primary only.
    PrimarySync,
    /// Client does not wait at all.
    FullAsync,
}

impl SyncMode {
    pub fn as_u8(self) -> u8 {
        match self {
            Self::FullSync => 0,
            Self::PrimarySync => 1,
            Self::FullAsync => 2,
        }
    }

    pub fn from_u8(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(Self::FullSync),
            1 => Some(Self::PrimarySync),
            2 => Some(Self::FullAsync),
            _ => None,
        }
    }
}

impl std::fmt::Display for SyncMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::FullSync => write!(f, "full_sync"),
            Self::PrimarySync => write!(f, "primary_sync"),
            Self::FullAsync => write!(f, "full_async"),
        }
    }
}

/// Which node reports backup completion to the near node under `FULL_SYNC`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NearRelay {
    /// The primary answers the near node once every backup has acknowledged.
    #[default]
    Primary,
    /// Backups notify the near node directly; the primary does not block.
    Backups,
}

/// Kind of update carried by a request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Operation {
    #[default]
    Update,
    Delete,
    Transform,
}

impl Operation {
    pub fn as_u8(self) -> u8 {
        match self {
            Self::Update => 0,
            Self::Delete => 1,
            Self::Transform => 2,
        }
    }

    pub fn from_u8(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(Self::Update),
            1 => Some(Self::Delete),
            2 => Some(Self::Transform),
            _ => None,
        }
    }
}

/// Reference to a named entry processor registered with the storage engine.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProcessorRef {
    pub name: String,
}

impl ProcessorRef {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

/// Entry predicate evaluated by the primary before applying an update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryFilter {
    /// Entry must currently have a value.
    HasValue,
    /// Entry must currently be absent.
    NoValue,
    /// Entry value must equal the given bytes.
    ValueEquals(Value),
}

impl EntryFilter {
    /// Evaluate the filter against the current value.
    pub fn matches(&self, current: Option<&Value>) -> bool {
        match self {
            Self::HasValue => current.is_some(),
            Self::NoValue => current.is_none(),
            Self::ValueEquals(expected) => current == Some(expected),
        }
    }
}

/// Explicit expiry policy for an operation, in milliseconds.
///
/// `None` keeps the cache default for that event.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExpiryPolicy {
    pub create_ms: Option<u64>,
    pub update_ms: Option<u64>,
    pub access_ms: Option<u64>,
}

impl ExpiryPolicy {
    /// TTL to use for a write, given whether the entry existed before.
    pub fn ttl_for_write(&self, existed: bool) -> i64 {
        let ttl = if existed { self.update_ms } else { self.create_ms };
        match ttl {
            Some(ms) => ms as i64,
            None => TTL_NOT_CHANGED,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topology_version_ordering() {
        let a = TopologyVersion::new(3, 0);
        let b = TopologyVersion::new(3, 1);
        let c = TopologyVersion::new(4, 0);
        assert!(a < b);
        assert!(b < c);
        assert_eq!(a.next_major(), c);
        assert_eq!(a.next_minor(), b);
        assert!(TopologyVersion::ZERO.is_zero());
    }

    #[test]
    fn write_versions_are_monotonic() {
        let gen = WriteVersionGenerator::new(7);
        let v1 = gen.next(TopologyVersion::new(1, 0));
        let v2 = gen.next(TopologyVersion::new(1, 0));
        assert!(v2 > v1);
        assert_eq!(v1.node_order, 7);
    }

    #[test]
    fn sync_mode_wire_values() {
        for mode in [SyncMode::FullSync, SyncMode::PrimarySync, SyncMode::FullAsync] {
            assert_eq!(SyncMode::from_u8(mode.as_u8()), Some(mode));
        }
        assert_eq!(SyncMode::from_u8(9), None);
    }

    #[test]
    fn entry_filter_matches() {
        let v = Bytes::from_static(b"v");
        assert!(EntryFilter::HasValue.matches(Some(&v)));
        assert!(!EntryFilter::HasValue.matches(None));
        assert!(EntryFilter::NoValue.matches(None));
        assert!(EntryFilter::ValueEquals(v.clone()).matches(Some(&v)));
        assert!(!EntryFilter::ValueEquals(v).matches(Some(&Bytes::from_static(b"w"))));
    }

    #[test]
    fn expiry_policy_ttl() {
        let policy = ExpiryPolicy {
            create_ms: Some(1_000),
            update_ms: None,
            access_ms: None,
        };
        assert_eq!(policy.ttl_for_write(false), 1_000);
        assert_eq!(policy.ttl_for_write(true), TTL_NOT_CHANGED);
    }
}
