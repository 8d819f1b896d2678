//! Persistent key-value cache stored in a single memory-mapped file.
//!
//! The store is a fixed-capacity, off-heap cache that several independent
//! processes can map at the same time. All state lives in the backing file:
//!
//! - **Header**: running payload total, eviction limit, and the two ends of
//!   the global LRU list
//! - **Segments**: equal-size shards selected by hashing the key, each
//!   holding a live count, a sorted array of 2-byte refs, and a fixed array
//!   of slots
//! - **Slots**: 8-byte key, LRU links, metadata block, and payload
//!
//! Lookups binary-search the ref array of the key's segment. Slot data never
//! moves; only refs are shifted to keep the index sorted, and only link
//! fields change to track recency.
//!
//! # Locking
//!
//! Every operation holds an exclusive advisory lock on the backing file, so
//! all processes sharing a store serialize on it. The lock is released by
//! the kernel if its holder dies.
//!
//! # Example
//!
//! ```rust,no_run
//! use shmcache::{CacheConfig, CacheValue, SharedCache};
//!
//! # fn example() -> shmcache::Result<()> {
//! let config = CacheConfig::new("/dev/shm/cache-test")
//!     .with_capacity(16 * 1024 * 1024)
//!     .with_value_size(32);
//! let cache = SharedCache::open(config)?;
//!
//! let key = 42u64.to_le_bytes();
//! cache.put(&key, CacheValue::new(vec![7u8; 32]))?;
//! assert!(cache.get(&key)?.is_some());
//! cache.close()?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![allow(clippy::must_use_candidate)]

use thiserror::Error;

// Backing file mapping
pub mod region;

// Value metadata codec
pub mod meta;

// Store header view
pub mod header;

// Sorted index shards
pub mod segment;

// Global LRU linkage
pub mod lru;

// Configuration
pub mod config;

// Cache engine
mod cache;

// Statistics snapshot
pub mod stats;

pub use cache::{Recovery, SharedCache};
pub use config::{CacheConfig, StoreGeometry};
pub use meta::{CacheValue, ValueMeta};
pub use stats::CacheStats;

/// Result type for cache operations.
pub type Result<T> = std::result::Result<T, CacheError>;

/// Errors that can occur during cache operations.
#[derive(Debug, Error)]
pub enum CacheError {
    /// I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Key or value does not match the store's fixed sizes.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// A `put` could not be applied.
    #[error("Put rejected: {0}")]
    Rejected(RejectReason),

    /// Verification failed when the store was opened.
    #[error("Corrupt store: {0}")]
    CorruptStore(String),

    /// Access outside the mapped region.
    #[error("Out of range: {len} bytes at offset {offset} exceed region of {size} bytes")]
    OutOfRange {
        /// Requested offset.
        offset: usize,
        /// Requested length.
        len: usize,
        /// Size of the mapped region.
        size: usize,
    },

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// The store-wide file lock could not be taken or released.
    #[error("Lock error: {0}")]
    Lock(String),
}

/// Why a `put` was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    /// The target segment already holds `max_keys` entries.
    SegmentFull,
    /// Eviction cannot bring the store under its byte limit.
    OverLimit,
    /// The store failed verification after the write.
    VerificationFailed,
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SegmentFull => f.write_str("segment is full"),
            Self::OverLimit => f.write_str("eviction limit cannot be met"),
            Self::VerificationFailed => f.write_str("store failed verification after write"),
        }
    }
}

/// Version information for the cache.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Fixed key width in bytes.
pub const KEY_SIZE: usize = 8;

/// Page size the backing file length is rounded up to.
pub const PAGE_SIZE: usize = 4096;

/// Segment sizes are rounded up to this boundary.
pub const SEGMENT_ALIGNMENT: usize = 32;
