//! Cluster topology and key ownership.
//!
//! - [`topology`] - Topology versions, exchange readiness and alive nodes
//! - [`affinity`] - Key routing and partition owner resolution
//!
//! # Versions
//!
//! Every request is stamped with the topology version it was mapped at. A request is
//! valid only while the affinity computed for that exact version still holds; the
//! primary answers stale requests with a remap signal and the near node retries on
//! the newer version.

pub mod affinity;
pub mod topology;
