//! `rusty-dbuf`: a transactional block-buffer cache.
//!
//! Mediates between foreground readers/writers of an open transaction
//! group (TXG), a syncer draining a closed TXG to stable storage, and any
//! number of in-flight per-TXG snapshots of a block in between: the hash
//! index, the Buffer state machine, the dirty-record chain and range-merge
//! resolver, the read/dirty/free-range/writeback paths, and hold/eviction.
//! The adaptive block cache, object layer, transaction manager, and storage
//! I/O pipeline are abstract collaborators ([`collab`]) this crate is built
//! and tested against, not subsystems it owns.

pub mod buffer;
pub mod cache;
pub mod collab;
pub mod common;
pub mod config;
pub mod dirty;
pub mod dirty_path;
pub mod error;
pub mod free_range;
pub mod hash_index;
pub mod read_path;
pub mod resolve;
pub mod sync_path;

#[cfg(any(test, feature = "test-util"))]
pub mod testutil;

pub use cache::DbufCache;
pub use collab::{AdaptiveCache, ObjectLayer, StorageIo, TransactionManager};
pub use config::{DbufCacheConfig, DbufCacheConfigBuilder};
pub use error::{DbufError, Result};
