//! Store header at the start of the backing file.
//!
//! | Offset | Size | Field |
//! |--------|------|-------|
//! | 0x00   | 8    | Total live payload bytes |
//! | 0x08   | 8    | Eviction limit in bytes |
//! | 0x10   | 4    | LRU head slot offset (most recently used) |
//! | 0x14   | 4    | LRU tail slot offset (least recently used) |
//!
//! Slot offsets are absolute file offsets. Offset 0 falls inside the header,
//! so it doubles as the empty-list sentinel and a zero-filled file reads as
//! an empty store.

use crate::Result;
use crate::region::MappedRegion;

/// Header size in bytes.
pub const HEADER_SIZE: usize = 0x18;

/// Offset of the running payload total.
pub const TOTAL_OFFSET: usize = 0x00;

/// Offset of the eviction limit.
pub const LIMIT_OFFSET: usize = 0x08;

/// Offset of the LRU head pointer.
pub const HEAD_OFFSET: usize = 0x10;

/// Offset of the LRU tail pointer.
pub const TAIL_OFFSET: usize = 0x14;

/// Sentinel slot offset meaning "no slot".
pub const NIL: u32 = 0;

/// Typed accessors for the store header.
#[derive(Debug, Clone, Copy, Default)]
pub struct StoreHeader;

impl StoreHeader {
    /// Running sum of live value sizes.
    pub fn total(self, region: &MappedRegion) -> Result<u64> {
        region.read_u64(TOTAL_OFFSET)
    }

    /// Overwrite the running total.
    pub fn set_total(self, region: &mut MappedRegion, total: u64) -> Result<()> {
        region.write_u64(TOTAL_OFFSET, total)
    }

    /// Configured eviction limit, or 0 if never initialized.
    pub fn limit(self, region: &MappedRegion) -> Result<u64> {
        region.read_u64(LIMIT_OFFSET)
    }

    /// Store the eviction limit.
    pub fn set_limit(self, region: &mut MappedRegion, limit: u64) -> Result<()> {
        region.write_u64(LIMIT_OFFSET, limit)
    }

    /// Most recently used slot.
    pub fn head(self, region: &MappedRegion) -> Result<u32> {
        region.read_u32(HEAD_OFFSET)
    }

    /// Set the most recently used slot.
    pub fn set_head(self, region: &mut MappedRegion, slot: u32) -> Result<()> {
        region.write_u32(HEAD_OFFSET, slot)
    }

    /// Least recently used slot.
    pub fn tail(self, region: &MappedRegion) -> Result<u32> {
        region.read_u32(TAIL_OFFSET)
    }

    /// Set the least recently used slot.
    pub fn set_tail(self, region: &mut MappedRegion, slot: u32) -> Result<()> {
        region.write_u32(TAIL_OFFSET, slot)
    }

    /// Reset total, head and tail. The limit is kept.
    pub fn clear(self, region: &mut MappedRegion) -> Result<()> {
        self.set_total(region, 0)?;
        self.set_head(region, NIL)?;
        self.set_tail(region, NIL)
    }
}
