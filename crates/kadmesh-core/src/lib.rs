//! Kadmesh Core - Shared types and identifiers
//!
//! This crate provides the identifier space and peer metadata used by the
//! Kadmesh node-discovery overlay.

pub mod error;
pub mod types;

pub use error::{Error, Result};
pub use types::*;

use std::time::Duration;

/// Length in bytes of every key in the XOR space
pub const KEY_LEN: usize = 32;

/// Default number of peers per k-bucket
pub const K: usize = 20;

/// Default number of concurrent peer queries per lookup
pub const ALPHA: usize = 3;

/// Upper bound on how long a single lookup may run
pub const DEFAULT_QUERY_TIMEOUT: Duration = Duration::from_secs(30);
