//! Error types for the atomic write path.
//!
//! [`CacheError`] is what a client future completes with. Per-key failures travel
//! over the wire as [`FailureCause`] and accumulate in a [`PartialUpdateError`] on
//! the near node, across remap attempts.

use crate::core::types::{Key, NodeId, TopologyVersion};
use std::collections::BTreeMap;
use thiserror::Error;

/// Errors surfaced to the caller of an atomic update.
#[derive(Debug, Clone, Error)]
pub enum CacheError {
    /// Null key, or missing value on a non-delete operation.
    #[error("invalid argument: {message}")]
    InvalidArgument { message: String },

    /// Affinity resolution yielded no owner for the key's partition.
    #[error(
        "failed to map keys for cache (all partition nodes left the grid) \
         [partition={partition}, topology={topology_version}]"
    )]
    NoPrimaryAvailable {
        partition: u32,
        topology_version: TopologyVersion,
    },

    /// One or more keys failed to update.
    #[error("{0}")]
    PartialUpdateFailure(PartialUpdateError),

    /// A remap was required but the caller forbade waiting for the topology.
    #[error("topology changed concurrently with the update [topology={topology_version}]")]
    ConcurrentTopologyChange {
        topology_version: TopologyVersion,
        key: Option<Key>,
    },

    /// Retry budget reached zero while retryable errors kept occurring.
    #[error("update failed after {remaps} remap attempts: {failure}")]
    RemapBudgetExhausted {
        remaps: u32,
        failure: PartialUpdateError,
    },

    /// The cache is stopping and accepts no further updates.
    #[error("failed to perform cache operation (cache is stopped): {cache}")]
    CacheStopped { cache: String },

    /// The primary reported an error that is not attributable to specific keys.
    #[error("primary failed to process update: {message}")]
    Remote { message: String },

    /// Internal error.
    #[error("internal error: {message}")]
    Internal { message: String },
}

impl CacheError {
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// The per-key failure set carried by this error, if any.
    pub fn partial_failure(&self) -> Option<&PartialUpdateError> {
        match self {
            Self::PartialUpdateFailure(failure) => Some(failure),
            Self::RemapBudgetExhausted { failure, .. } => Some(failure),
            _ => None,
        }
    }

    /// Whether a caller could reasonably retry the whole operation.
    pub fn is_retriable(&self) -> bool {
        match self {
            Self::ConcurrentTopologyChange { .. } | Self::RemapBudgetExhausted { .. } => true,
            Self::PartialUpdateFailure(failure) => failure.is_retryable(),
            _ => false,
        }
    }
}

/// Result type using CacheError.
pub type CacheResult<T> = Result<T, CacheError>;

/// Cause of a single key's failure, as carried in update responses.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FailureCause {
    /// The node handling the key left the cluster before answering.
    #[error("node left grid before response is received: {node}")]
    NodeDeparted { node: NodeId },

    /// The topology changed while the update was in flight.
    #[error("topology changed: {message}")]
    TopologyChanged { message: String },

    /// No server node owns the key's partition.
    #[error("no server node found for partition")]
    ServerNotFound,

    /// The storage engine or entry processor rejected the update.
    #[error("update rejected: {message}")]
    Rejected { message: String },
}

impl FailureCause {
    pub fn topology_changed(message: impl Into<String>) -> Self {
        Self::TopologyChanged {
            message: message.into(),
        }
    }

    pub fn rejected(message: impl Into<String>) -> Self {
        Self::Rejected {
            message: message.into(),
        }
    }

    /// Topology-related causes (retryable or not).
    pub fn is_topology(&self) -> bool {
        matches!(
            self,
            Self::NodeDeparted { .. } | Self::TopologyChanged { .. } | Self::ServerNotFound
        )
    }

    /// Causes that a remap onto a newer topology can fix.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::NodeDeparted { .. } | Self::TopologyChanged { .. })
    }
}

/// Failure record for one key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyFailure {
    pub cause: FailureCause,
    pub topology_version: TopologyVersion,
}

/// Per-key failures of an update, accumulated across attempts.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PartialUpdateError {
    failed: BTreeMap<Key, KeyFailure>,
}

impl PartialUpdateError {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `cause` for every key in `keys`, observed at `topology_version`.
    ///
    /// A key that already failed keeps the record from the newest topology.
    pub fn add<I>(&mut self, keys: I, cause: FailureCause, topology_version: TopologyVersion)
    where
        I: IntoIterator<Item = Key>,
    {
        for key in keys {
            self.insert(
                key,
                KeyFailure {
                    cause: cause.clone(),
                    topology_version,
                },
            );
        }
    }

    /// Fold another failure set into this one.
    pub fn merge(&mut self, other: PartialUpdateError) {
        for (key, failure) in other.failed {
            self.insert(key, failure);
        }
    }

    fn insert(&mut self, key: Key, failure: KeyFailure) {
        match self.failed.get(&key) {
            Some(existing) if existing.topology_version > failure.topology_version => {}
            _ => {
                self.failed.insert(key, failure);
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.failed.is_empty()
    }

    pub fn len(&self) -> usize {
        self.failed.len()
    }

    pub fn get(&self, key: &[u8]) -> Option<&KeyFailure> {
        self.failed.get(key)
    }

    pub fn failed_keys(&self) -> impl Iterator<Item = &Key> {
        self.failed.keys()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Key, &KeyFailure)> {
        self.failed.iter()
    }

    /// Newest topology version at which any key failed.
    pub fn topology_version(&self) -> Option<TopologyVersion> {
        self.failed.values().map(|f| f.topology_version).max()
    }

    /// Retryable when some key failed for a remappable topology reason and no key
    /// failed because the partition has no server at all.
    pub fn is_retryable(&self) -> bool {
        let any_retryable = self.failed.values().any(|f| f.cause.is_retryable());
        let server_missing = self
            .failed
            .values()
            .any(|f| f.cause == FailureCause::ServerNotFound);
        any_retryable && !server_missing
    }
}

impl std::fmt::Display for PartialUpdateError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "failed to update keys (retry update if possible) [failed={}",
            self.failed.len()
        )?;
        if let Some((_, first)) = self.failed.iter().next() {
            write!(f, ", cause={}", first.cause)?;
        }
        write!(f, "]")
    }
}

impl std::error::Error for PartialUpdateError {}

/// Failure to hand a message to the transport.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SendError {
    /// The destination node is no longer part of the cluster.
    #[error("failed to send message, node left: {0}")]
    NodeLeft(NodeId),

    /// Any other transport failure.
    #[error("failed to send message to {node}: {message}")]
    Failed { node: NodeId, message: String },
}

impl SendError {
    pub fn node(&self) -> NodeId {
        match self {
            Self::NodeLeft(node) => *node,
            Self::Failed { node, .. } => *node,
        }
    }
}

/// Errors raised while decoding wire messages.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WireError {
    #[error("unknown message kind: {0}")]
    UnknownKind(u8),

    #[error("malformed field {field}: {reason}")]
    Malformed { field: &'static str, reason: String },

    #[error("message header declares {declared} fields, expected {expected}")]
    FieldCount { declared: u8, expected: u8 },
}

impl WireError {
    pub fn malformed(field: &'static str, reason: impl Into<String>) -> Self {
        Self::Malformed {
            field,
            reason: reason.into(),
        }
    }
}
