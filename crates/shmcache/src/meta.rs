//! Value metadata codec.
//!
//! Each slot stores a fixed-width block: a 17-byte metadata header followed
//! by the payload bytes, padded to the store's value size.
//!
//! | Offset | Size | Field |
//! |--------|------|-------|
//! | 0x00   | 1    | Activated flag (non-zero = pinned) |
//! | 0x01   | 8    | Payload size (u64, LE) |
//! | 0x09   | 8    | Last-touch timestamp (u64, LE, microseconds) |
//! | 0x11   | N    | Payload |

use crate::{CacheError, Result};

/// Metadata header size in bytes.
pub const META_SIZE: usize = 0x11;

/// Offset of the activation flag.
pub const ACTIVATED_OFFSET: usize = 0x00;

/// Offset of the payload size.
pub const SIZE_OFFSET: usize = 0x01;

/// Offset of the timestamp.
pub const TIMESTAMP_OFFSET: usize = 0x09;

/// Metadata stored in front of every value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ValueMeta {
    /// Pinned entries are never evicted.
    pub activated: bool,
    /// Payload size accounted against the eviction limit.
    pub size: u64,
    /// Last-touch timestamp in microseconds since the Unix epoch.
    pub timestamp: u64,
}

impl ValueMeta {
    /// Serialize the metadata to bytes.
    pub fn encode(&self) -> [u8; META_SIZE] {
        let mut buf = [0u8; META_SIZE];
        buf[ACTIVATED_OFFSET] = u8::from(self.activated);
        buf[SIZE_OFFSET..TIMESTAMP_OFFSET].copy_from_slice(&self.size.to_le_bytes());
        buf[TIMESTAMP_OFFSET..META_SIZE].copy_from_slice(&self.timestamp.to_le_bytes());
        buf
    }

    /// Parse metadata from bytes.
    pub fn decode(data: &[u8; META_SIZE]) -> Self {
        let mut size = [0u8; 8];
        size.copy_from_slice(&data[SIZE_OFFSET..TIMESTAMP_OFFSET]);
        let mut timestamp = [0u8; 8];
        timestamp.copy_from_slice(&data[TIMESTAMP_OFFSET..META_SIZE]);

        Self {
            activated: data[ACTIVATED_OFFSET] != 0,
            size: u64::from_le_bytes(size),
            timestamp: u64::from_le_bytes(timestamp),
        }
    }
}

/// A cached value: metadata plus a fixed-width payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheValue {
    /// Metadata header.
    pub meta: ValueMeta,
    /// Payload bytes; must match the store's value size on `put`.
    pub payload: Vec<u8>,
}

impl CacheValue {
    /// Create an activated value whose size is the payload length.
    pub fn new(payload: Vec<u8>) -> Self {
        Self {
            meta: ValueMeta {
                activated: true,
                size: payload.len() as u64,
                timestamp: 0,
            },
            payload,
        }
    }

    /// Set the size accounted against the eviction limit.
    #[must_use]
    pub const fn with_size(mut self, size: u64) -> Self {
        self.meta.size = size;
        self
    }

    /// Set the activation flag.
    #[must_use]
    pub const fn with_activated(mut self, activated: bool) -> Self {
        self.meta.activated = activated;
        self
    }

    /// Mark the value as evictable.
    #[must_use]
    pub const fn deactivated(self) -> Self {
        self.with_activated(false)
    }

    /// Whether the value is pinned.
    pub const fn activated(&self) -> bool {
        self.meta.activated
    }

    /// Accounted payload size.
    pub const fn size(&self) -> u64 {
        self.meta.size
    }

    /// Last-touch timestamp.
    pub const fn timestamp(&self) -> u64 {
        self.meta.timestamp
    }

    /// Serialize into a block of `META_SIZE + value_size` bytes.
    pub fn encode_block(&self, value_size: usize) -> Result<Vec<u8>> {
        if self.payload.len() != value_size {
            return Err(CacheError::InvalidArgument(format!(
                "payload is {} bytes, store value size is {value_size}",
                self.payload.len()
            )));
        }

        let mut block = Vec::with_capacity(META_SIZE + value_size);
        block.extend_from_slice(&self.meta.encode());
        block.extend_from_slice(&self.payload);
        Ok(block)
    }

    /// Parse a block produced by [`Self::encode_block`].
    pub fn decode_block(block: &[u8]) -> Result<Self> {
        let header: &[u8; META_SIZE] = block
            .get(..META_SIZE)
            .and_then(|h| h.try_into().ok())
            .ok_or_else(|| {
                CacheError::InvalidArgument(format!(
                    "value block of {} bytes is shorter than metadata",
                    block.len()
                ))
            })?;

        Ok(Self {
            meta: ValueMeta::decode(header),
            payload: block[META_SIZE..].to_vec(),
        })
    }
}
