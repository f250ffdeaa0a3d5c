//! Core infrastructure.
//!
//! - [`config`] - Configuration parsing and validation
//! - [`error`] - Error types
//! - [`types`] - Identifiers, versions and write-path enums

pub mod config;
pub mod error;
pub mod types;
