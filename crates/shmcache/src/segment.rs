//! Segments: fixed byte ranges holding one shard of the index.
//!
//! Segment layout:
//! - 2-byte live count
//! - `max_keys` × 2-byte refs, sorted by the key of the slot each designates
//! - `max_keys` × slots: key(8) + prev(4) + next(4) + value block
//!
//! Slots never move once written. Inserting or removing a key shifts the
//! ref array only, so the physical slot order records insertion order while
//! the refs give key order.

use std::cmp::Ordering;

use tracing::warn;

use crate::config::StoreGeometry;
use crate::meta::{ACTIVATED_OFFSET, CacheValue, META_SIZE, ValueMeta};
use crate::region::MappedRegion;
use crate::{CacheError, KEY_SIZE, Result};

/// Size of the live count field.
pub const COUNT_SIZE: usize = 2;

/// Size of one ref.
pub const REF_SIZE: usize = 2;

/// Size of one LRU link.
pub const LINK_SIZE: usize = 4;

/// Offset of the backward (toward tail) link within a slot.
pub const PREV_LINK_OFFSET: usize = KEY_SIZE;

/// Offset of the forward (toward head) link within a slot.
pub const NEXT_LINK_OFFSET: usize = PREV_LINK_OFFSET + LINK_SIZE;

/// Offset of the value block within a slot.
pub const DATA_OFFSET: usize = NEXT_LINK_OFFSET + LINK_SIZE;

/// Slot bytes preceding the payload.
pub const SLOT_HEADER_SIZE: usize = DATA_OFFSET + META_SIZE;

/// Route a key to a hash value.
///
/// 31-based polynomial over the signed key bytes, seeded with 1. The
/// segment is `hash & (segment_count - 1)`.
#[allow(clippy::cast_possible_wrap)]
pub fn hash_key(key: &[u8]) -> u32 {
    key.iter().fold(1i32, |h, &b| {
        h.wrapping_mul(31).wrapping_add(i32::from(b as i8))
    }) as u32
}

/// A typed view over one segment of the mapped region.
///
/// The view carries only geometry; all state lives in the region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment {
    base: usize,
    size: usize,
    slot_size: usize,
    max_keys: usize,
}

impl Segment {
    /// Create the view of segment `index`.
    pub const fn new(index: usize, geometry: &StoreGeometry) -> Self {
        Self {
            base: geometry.segment_base(index),
            size: geometry.segment_size,
            slot_size: geometry.slot_size,
            max_keys: geometry.max_keys,
        }
    }

    /// Byte offset of the segment.
    pub const fn base(&self) -> usize {
        self.base
    }

    /// Maximum number of live entries.
    pub const fn max_keys(&self) -> usize {
        self.max_keys
    }

    /// Whether `offset` lies inside this segment.
    pub const fn contains(&self, offset: usize) -> bool {
        offset >= self.base && offset < self.base + self.size
    }

    /// Live entry count.
    pub fn count(&self, region: &MappedRegion) -> Result<usize> {
        region.read_u16(self.base).map(usize::from)
    }

    fn set_count(&self, region: &mut MappedRegion, count: usize) -> Result<()> {
        let count = u16::try_from(count)
            .map_err(|_| CacheError::CorruptStore(format!("segment count {count} overflows")))?;
        region.write_u16(self.base, count)
    }

    /// Offset of the ref at position `pos`.
    pub const fn ref_offset(&self, pos: usize) -> usize {
        self.base + COUNT_SIZE + pos * REF_SIZE
    }

    const fn slots_start(&self) -> usize {
        self.ref_offset(self.max_keys)
    }

    /// Offset of physical slot `slot`; also the offset of its key.
    pub const fn slot_offset(&self, slot: u16) -> usize {
        self.slots_start() + slot as usize * self.slot_size
    }

    /// Offset of the slot's backward link.
    pub const fn prev_offset(&self, slot: u16) -> usize {
        self.slot_offset(slot) + PREV_LINK_OFFSET
    }

    /// Offset of the slot's forward link.
    pub const fn next_offset(&self, slot: u16) -> usize {
        self.slot_offset(slot) + NEXT_LINK_OFFSET
    }

    /// Offset of the slot's value block.
    pub const fn data_offset(&self, slot: u16) -> usize {
        self.slot_offset(slot) + DATA_OFFSET
    }

    /// Physical slot index starting exactly at `offset`, if any.
    pub fn slot_for_offset(&self, offset: usize) -> Option<u16> {
        let rel = offset.checked_sub(self.slots_start())?;
        if rel % self.slot_size != 0 {
            return None;
        }
        let slot = rel / self.slot_size;
        if slot >= self.max_keys {
            return None;
        }
        u16::try_from(slot).ok()
    }

    /// Slot designated by the ref at position `pos`.
    pub fn slot_ref(&self, region: &MappedRegion, pos: usize) -> Result<u16> {
        let slot = region.read_u16(self.ref_offset(pos))?;
        if usize::from(slot) >= self.max_keys {
            return Err(CacheError::CorruptStore(format!(
                "ref {slot} at position {pos} of segment {:#x} exceeds {} slots",
                self.base, self.max_keys
            )));
        }
        Ok(slot)
    }

    /// Refs in index order.
    pub fn refs(&self, region: &MappedRegion) -> Result<Vec<u16>> {
        (0..self.count(region)?)
            .map(|pos| self.slot_ref(region, pos))
            .collect()
    }

    /// Search the sorted refs for `key`.
    ///
    /// `Ok(Ok(pos))` is the ref position holding `key`; `Ok(Err(pos))` is
    /// where a ref for `key` must be inserted to keep the array sorted.
    pub fn binary_search(
        &self,
        region: &MappedRegion,
        key: &[u8],
    ) -> Result<std::result::Result<usize, usize>> {
        let mut low = 0;
        let mut high = self.count(region)?;

        while low < high {
            let mid = low + (high - low) / 2;
            let slot = self.slot_ref(region, mid)?;
            match region.compare(self.slot_offset(slot), key)? {
                Ordering::Less => low = mid + 1,
                Ordering::Greater => high = mid,
                Ordering::Equal => return Ok(Ok(mid)),
            }
        }

        Ok(Err(low))
    }

    /// Open a gap at `pos`, store `slot` there and bump the count.
    pub fn insert_ref(&self, region: &mut MappedRegion, pos: usize, slot: u16) -> Result<()> {
        let count = self.count(region)?;
        if count >= self.max_keys || pos > count {
            return Err(CacheError::CorruptStore(format!(
                "cannot insert ref at {pos} into segment {:#x} holding {count}",
                self.base
            )));
        }

        let src = self.ref_offset(pos);
        region.copy(src, src + REF_SIZE, (count - pos) * REF_SIZE)?;
        region.write_u16(src, slot)?;
        self.set_count(region, count + 1)
    }

    /// Remove the ref at `pos`, close the gap and drop the count.
    ///
    /// Returns the slot the removed ref designated.
    pub fn remove_ref(&self, region: &mut MappedRegion, pos: usize) -> Result<u16> {
        let count = self.count(region)?;
        if pos >= count {
            return Err(CacheError::CorruptStore(format!(
                "cannot remove ref {pos} from segment {:#x} holding {count}",
                self.base
            )));
        }

        let slot = self.slot_ref(region, pos)?;
        let dst = self.ref_offset(pos);
        region.copy(dst + REF_SIZE, dst, (count - pos - 1) * REF_SIZE)?;
        region.write_u16(self.ref_offset(count - 1), 0)?;
        self.set_count(region, count - 1)?;
        Ok(slot)
    }

    /// Lowest physical slot no live ref designates.
    pub fn free_slot(&self, region: &MappedRegion) -> Result<Option<u16>> {
        let mut used = vec![false; self.max_keys];
        for pos in 0..self.count(region)? {
            used[usize::from(self.slot_ref(region, pos)?)] = true;
        }
        Ok(used
            .iter()
            .position(|u| !u)
            .and_then(|slot| u16::try_from(slot).ok()))
    }

    /// Read a slot's key.
    pub fn read_key(&self, region: &MappedRegion, slot: u16) -> Result<[u8; KEY_SIZE]> {
        let mut key = [0u8; KEY_SIZE];
        region.read_bytes(self.slot_offset(slot), &mut key)?;
        Ok(key)
    }

    /// Write a key into a slot with both links cleared.
    pub fn write_key(&self, region: &mut MappedRegion, slot: u16, key: &[u8]) -> Result<()> {
        region.write_bytes(self.slot_offset(slot), key)?;
        region.write_u32(self.prev_offset(slot), 0)?;
        region.write_u32(self.next_offset(slot), 0)
    }

    /// Read a slot's metadata header.
    pub fn read_meta(&self, region: &MappedRegion, slot: u16) -> Result<ValueMeta> {
        let mut meta = [0u8; META_SIZE];
        region.read_bytes(self.data_offset(slot), &mut meta)?;
        Ok(ValueMeta::decode(&meta))
    }

    /// Read and decode a slot's value block.
    pub fn read_value(&self, region: &MappedRegion, slot: u16) -> Result<CacheValue> {
        let block = region.slice(self.data_offset(slot), self.slot_size - DATA_OFFSET)?;
        CacheValue::decode_block(block)
    }

    /// Overwrite a slot's value block.
    pub fn write_value(&self, region: &mut MappedRegion, slot: u16, block: &[u8]) -> Result<()> {
        if block.len() != self.slot_size - DATA_OFFSET {
            return Err(CacheError::InvalidArgument(format!(
                "value block is {} bytes, slot holds {}",
                block.len(),
                self.slot_size - DATA_OFFSET
            )));
        }
        region.write_bytes(self.data_offset(slot), block)
    }

    /// Set or clear a slot's activation flag.
    pub fn set_activated(
        &self,
        region: &mut MappedRegion,
        slot: u16,
        activated: bool,
    ) -> Result<()> {
        region.write_u8(
            self.data_offset(slot) + ACTIVATED_OFFSET,
            u8::from(activated),
        )
    }

    /// Zero every byte of a slot.
    pub fn zero_slot(&self, region: &mut MappedRegion, slot: u16) -> Result<()> {
        region.fill(self.slot_offset(slot), self.slot_size, 0)
    }

    /// Forget all entries.
    pub fn clear(&self, region: &mut MappedRegion) -> Result<()> {
        self.set_count(region, 0)
    }

    /// Check the count bound and strict key order of the refs.
    pub fn verify(&self, region: &MappedRegion) -> Result<bool> {
        let count = self.count(region)?;
        if count > self.max_keys {
            warn!(
                "Segment {:#x} count {} exceeds maximum {}",
                self.base, count, self.max_keys
            );
            return Ok(false);
        }

        let mut prev: Option<[u8; KEY_SIZE]> = None;
        for pos in 0..count {
            let slot = region.read_u16(self.ref_offset(pos))?;
            if usize::from(slot) >= self.max_keys {
                warn!(
                    "Segment {:#x} ref {} is out of range: {}",
                    self.base, pos, slot
                );
                return Ok(false);
            }

            if let Some(prev) = prev
                && region.compare(self.slot_offset(slot), &prev)? != Ordering::Greater
            {
                warn!(
                    "Segment {:#x} refs out of order at position {}",
                    self.base, pos
                );
                return Ok(false);
            }
            prev = Some(self.read_key(region, slot)?);
        }

        Ok(true)
    }
}
