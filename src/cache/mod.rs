//! Versioned bucket storage for request/response pairs.
//!
//! This module provides:
//! - A storage trait with SQLite and in-memory backends
//! - All-or-nothing bulk insertion for seeding a bucket
//! - A cache-first layer that stores cacheable network responses in the background
//! - Wholesale removal of buckets that are no longer current

mod layer;
mod memory;
mod storage;
mod traits;

pub use layer::{CacheLayer, Resolved};
pub use memory::MemoryStorage;
pub use storage::{CacheStorage, SqliteStorage};
pub use traits::{CacheResult, CacheSource};
#[cfg(test)]
pub use traits::{CachedResponse, RequestKey};
