//! Global LRU list threaded through the slots.
//!
//! The list spans every segment. Each slot stores two absolute slot offsets:
//! `prev` toward the tail (older) and `next` toward the head (newer). The
//! header holds both ends. Recency changes only rewrite these links; slot
//! data stays where it is.
//!
//! All operations are O(1).

use crate::Result;
use crate::header::{NIL, StoreHeader};
use crate::region::MappedRegion;
use crate::segment::{NEXT_LINK_OFFSET, PREV_LINK_OFFSET};

/// Neighbor toward the tail.
pub fn prev(region: &MappedRegion, slot: u32) -> Result<u32> {
    region.read_u32(slot as usize + PREV_LINK_OFFSET)
}

/// Neighbor toward the head.
pub fn next(region: &MappedRegion, slot: u32) -> Result<u32> {
    region.read_u32(slot as usize + NEXT_LINK_OFFSET)
}

fn set_prev(region: &mut MappedRegion, slot: u32, target: u32) -> Result<()> {
    region.write_u32(slot as usize + PREV_LINK_OFFSET, target)
}

fn set_next(region: &mut MappedRegion, slot: u32, target: u32) -> Result<()> {
    region.write_u32(slot as usize + NEXT_LINK_OFFSET, target)
}

/// Link an unlinked slot as the new head.
///
/// If the list was empty the slot also becomes the tail.
pub fn push_head(region: &mut MappedRegion, slot: u32) -> Result<()> {
    let header = StoreHeader;
    let old_head = header.head(region)?;

    set_prev(region, slot, old_head)?;
    set_next(region, slot, NIL)?;
    if old_head == NIL {
        header.set_tail(region, slot)?;
    } else {
        set_next(region, old_head, slot)?;
    }
    header.set_head(region, slot)
}

/// Detach a linked slot, patching its neighbors and the list ends.
pub fn unlink(region: &mut MappedRegion, slot: u32) -> Result<()> {
    let header = StoreHeader;
    let older = prev(region, slot)?;
    let newer = next(region, slot)?;

    if older == NIL {
        header.set_tail(region, newer)?;
    } else {
        set_next(region, older, newer)?;
    }

    if newer == NIL {
        header.set_head(region, older)?;
    } else {
        set_prev(region, newer, older)?;
    }

    set_prev(region, slot, NIL)?;
    set_next(region, slot, NIL)
}

/// Mark a linked slot as most recently used.
pub fn move_to_head(region: &mut MappedRegion, slot: u32) -> Result<()> {
    if StoreHeader.head(region)? == slot {
        return Ok(());
    }
    unlink(region, slot)?;
    push_head(region, slot)
}
