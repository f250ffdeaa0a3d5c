//! Ripple - write-path coordination for a partitioned, replicated in-memory cache.
//!
//! Ripple implements the atomic (lock-free, non-transactional) single-key write path
//! of a cache whose keys are hashed into partitions, each owned by one primary node
//! and a configurable number of backups. A write travels from the node that
//! accepted it (the near node) to the primary, which applies it and fans it out to
//! the backups before the caller's future completes.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                         AtomicCache                             │
//! │          put │ get_and_put │ remove │ invoke │ on_message       │
//! └─────────────────────────────────────────────────────────────────┘
//!                                  │
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        Coordinators                             │
//! │   NearUpdateFuture (near)  │  BackupUpdateFuture (primary)      │
//! │                 FutureRegistry (by future id)                   │
//! └─────────────────────────────────────────────────────────────────┘
//!                                  │
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                    Topology and Affinity                        │
//! │     TopologyTracker (versions, exchanges) │ AffinityResolver    │
//! └─────────────────────────────────────────────────────────────────┘
//!                                  │
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                          Wire                                   │
//! │  6 message kinds │ resumable field-by-field encoder and decoder │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Module Organization
//!
//! ## Core
//! - [`core::config`] - Configuration parsing and validation
//! - [`core::error`] - Error types
//! - [`core::types`] - Node ids, topology and write versions, operation kinds
//!
//! ## Control
//! - [`control::topology`] - Topology versions and exchange readiness
//! - [`control::affinity`] - Key to partition to owner mapping
//!
//! ## Wire
//! - [`wire::stream`] - Resumable field writer and reader
//! - [`wire::encoding`] - Composite field encoding
//! - [`wire::messages`] - Message definitions
//!
//! ## Atomic
//! - [`atomic::near`] - Near-side update coordinator
//! - [`atomic::fanout`] - Primary-side backup fan-out
//! - [`atomic::registry`] - In-flight future registry
//!
//! ## Simulation
//! - [`sim`] - In-process cluster over a loopback transport
//!
//! ## CLI
//! - [`cli::commands`] - CLI command implementations
//!
//! # Key Invariants
//!
//! - Every coordinator completes exactly once; later messages are ignored
//! - A backup acknowledgment, real or implied by departure, is counted once
//! - A response whose future id is not the current attempt's changes nothing
//! - A remap starts a fresh attempt: new future id, topology version and request

// Core infrastructure
pub mod core;

// Topology and affinity
pub mod control;

// Wire protocol
pub mod wire;

// Atomic write path
pub mod atomic;

// In-process cluster
pub mod sim;

// CLI
pub mod cli;

// Re-exports for convenience
pub use self::core::{config, error, types};
pub use atomic::{AtomicCache, CacheContext, UpdateHandle, UpdateOp, UpdateOutcome};
pub use control::{affinity, topology};
