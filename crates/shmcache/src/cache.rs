//! Cache engine: routing, insertion, eviction, and verification.
//!
//! Every public operation takes the handle's mutex, then the store-wide
//! file lock, and releases both on every exit path.

use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use tracing::{Level, debug, enabled, info, trace, warn};

use crate::config::{CacheConfig, StoreGeometry};
use crate::header::{HEADER_SIZE, NIL, StoreHeader};
use crate::lru;
use crate::meta::CacheValue;
use crate::region::MappedRegion;
use crate::segment::{Segment, hash_key};
use crate::stats::CacheStats;
use crate::{CacheError, KEY_SIZE, RejectReason, Result};

/// Outcome of opening a store with recovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recovery {
    /// The store verified and was opened as is.
    Clean,
    /// The store failed verification and was cleared.
    Cleared,
}

/// A handle to a store shared through a memory-mapped file.
///
/// The handle is `Send + Sync`; share it between threads with `Arc`.
/// Other processes open their own handle on the same file.
#[derive(Debug)]
pub struct SharedCache {
    engine: Mutex<Engine>,
    geometry: StoreGeometry,
    path: PathBuf,
}

impl SharedCache {
    /// Open or create the store described by `config`.
    ///
    /// Fails with [`CacheError::CorruptStore`] if the existing file does not
    /// verify. Use [`Self::open_with_recovery`] to clear it instead.
    pub fn open(config: CacheConfig) -> Result<Self> {
        let mut engine = Engine::map(&config)?;

        let lock = engine.region.lock()?;
        let verified = engine
            .init_limit(config.eviction_limit)
            .and_then(|()| engine.check());
        lock.release()?;

        if !verified? {
            return Err(CacheError::CorruptStore(format!(
                "{} failed verification",
                config.path.display()
            )));
        }

        Ok(Self::from_engine(engine))
    }

    /// Open the store, clearing it if it does not verify.
    pub fn open_with_recovery(config: CacheConfig) -> Result<(Self, Recovery)> {
        let mut engine = Engine::map(&config)?;

        let lock = engine.region.lock()?;
        let cleared = engine
            .init_limit(config.eviction_limit)
            .and_then(|()| engine.verify_or_clear());
        lock.release()?;

        let recovery = if cleared? {
            Recovery::Cleared
        } else {
            Recovery::Clean
        };
        Ok((Self::from_engine(engine), recovery))
    }

    fn from_engine(engine: Engine) -> Self {
        let geometry = engine.geometry;
        let path = engine.region.path().to_path_buf();
        info!(
            "Opened shared cache at {} ({} segments of {} bytes, {} keys each)",
            path.display(),
            geometry.segment_count,
            geometry.segment_size,
            geometry.max_keys
        );
        Self {
            engine: Mutex::new(engine),
            geometry,
            path,
        }
    }

    // The mutex is held until the file lock is released
    #[allow(clippy::significant_drop_tightening)]
    fn locked<T>(&self, op: impl FnOnce(&mut Engine) -> Result<T>) -> Result<T> {
        let mut engine = self.engine.lock();
        let lock = engine.region.lock()?;
        let result = op(&mut *engine);
        let released = lock.release();
        let value = result?;
        released?;
        Ok(value)
    }

    /// Look up `key`. A miss is `Ok(None)`.
    ///
    /// Reads do not change recency.
    pub fn get(&self, key: &[u8]) -> Result<Option<CacheValue>> {
        check_key(key)?;
        self.locked(|engine| engine.get(key))
    }

    /// Insert or overwrite `key`.
    ///
    /// The stored value is stamped with the current time and becomes the
    /// most recently used entry. Returns the value as stored.
    pub fn put(&self, key: &[u8], value: CacheValue) -> Result<CacheValue> {
        check_key(key)?;
        if value.payload.len() != self.geometry.value_size {
            return Err(CacheError::InvalidArgument(format!(
                "value payload is {} bytes, store value size is {}",
                value.payload.len(),
                self.geometry.value_size
            )));
        }
        if value.size() > self.geometry.value_size as u64 {
            return Err(CacheError::InvalidArgument(format!(
                "value size {} exceeds payload width {}",
                value.size(),
                self.geometry.value_size
            )));
        }

        self.locked(|engine| engine.put(key, value))
    }

    /// Clear the activation flag of `key`, making it evictable.
    ///
    /// Returns `false` if the key is absent. The entry stays readable.
    pub fn deactivate(&self, key: &[u8]) -> Result<bool> {
        check_key(key)?;
        self.locked(|engine| engine.deactivate(key))
    }

    /// Remove every entry. The file keeps its size and eviction limit.
    pub fn clear(&self) -> Result<()> {
        self.locked(Engine::clear)?;
        info!("Cleared shared cache at {}", self.path.display());
        Ok(())
    }

    /// Number of live entries.
    pub fn count(&self) -> Result<usize> {
        self.locked(|engine| engine.count())
    }

    /// Check every store invariant.
    pub fn verify(&self) -> Result<bool> {
        self.locked(|engine| engine.check())
    }

    /// Verify the store and clear it if verification fails.
    ///
    /// Returns `true` if the store was cleared.
    pub fn verify_or_clear(&self) -> Result<bool> {
        self.locked(Engine::verify_or_clear)
    }

    /// Eviction limit in bytes.
    pub fn limit(&self) -> Result<u64> {
        self.locked(|engine| StoreHeader.limit(&engine.region))
    }

    /// Snapshot of occupancy and layout.
    pub fn stats(&self) -> Result<CacheStats> {
        self.locked(|engine| engine.stats())
    }

    /// Layout of the store.
    pub const fn geometry(&self) -> &StoreGeometry {
        &self.geometry
    }

    /// Backing file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Flush and unmap the store.
    pub fn close(self) -> Result<()> {
        let engine = self.engine.into_inner();
        engine.region.close()?;
        debug!("Closed shared cache at {}", self.path.display());
        Ok(())
    }
}

fn check_key(key: &[u8]) -> Result<()> {
    if key.len() == KEY_SIZE {
        Ok(())
    } else {
        Err(CacheError::InvalidArgument(format!(
            "key is {} bytes, expected {KEY_SIZE}",
            key.len()
        )))
    }
}

fn now_micros() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_micros() as u64
}

/// Store state behind the handle's mutex. Callers hold the file lock.
#[derive(Debug)]
struct Engine {
    region: MappedRegion,
    geometry: StoreGeometry,
    segments: Vec<Segment>,
}

impl Engine {
    fn map(config: &CacheConfig) -> Result<Self> {
        let geometry = config.validate()?;
        let region = MappedRegion::open(&config.path, geometry.region_len)?;
        let segments = (0..geometry.segment_count)
            .map(|index| Segment::new(index, &geometry))
            .collect();

        Ok(Self {
            region,
            geometry,
            segments,
        })
    }

    fn init_limit(&mut self, limit: u64) -> Result<()> {
        if StoreHeader.limit(&self.region)? == 0 {
            debug!("Initializing eviction limit to {limit} bytes");
            StoreHeader.set_limit(&mut self.region, limit)?;
        }
        Ok(())
    }

    fn segment_index(&self, key: &[u8]) -> usize {
        hash_key(key) as usize & (self.geometry.segment_count - 1)
    }

    /// Resolve an absolute slot offset to its segment and slot index.
    fn locate(&self, offset: u32) -> Option<(usize, u16)> {
        let offset = offset as usize;
        let index = offset.checked_sub(HEADER_SIZE)? / self.geometry.segment_size;
        let segment = self.segments.get(index)?;
        if !segment.contains(offset) {
            return None;
        }
        Some((index, segment.slot_for_offset(offset)?))
    }

    fn locate_linked(&self, offset: u32) -> Result<(usize, u16)> {
        self.locate(offset)
            .ok_or_else(|| CacheError::CorruptStore(format!("LRU link {offset:#x} is not a slot")))
    }

    fn address(&self, index: usize, slot: u16) -> u32 {
        // Geometry guarantees the whole region fits u32 offsets
        self.segments[index].slot_offset(slot) as u32
    }

    fn get(&self, key: &[u8]) -> Result<Option<CacheValue>> {
        let segment = &self.segments[self.segment_index(key)];
        match segment.binary_search(&self.region, key)? {
            Ok(pos) => {
                let slot = segment.slot_ref(&self.region, pos)?;
                segment.read_value(&self.region, slot).map(Some)
            }
            Err(_) => Ok(None),
        }
    }

    fn stamp(&self) -> Result<u64> {
        let head = StoreHeader.head(&self.region)?;
        let newest = if head == NIL {
            0
        } else {
            let (index, slot) = self.locate_linked(head)?;
            self.segments[index]
                .read_meta(&self.region, slot)?
                .timestamp
        };
        Ok(now_micros().max(newest))
    }

    fn put(&mut self, key: &[u8], mut value: CacheValue) -> Result<CacheValue> {
        value.meta.timestamp = self.stamp()?;
        let block = value.encode_block(self.geometry.value_size)?;

        let index = self.segment_index(key);
        let segment = self.segments[index];
        let total = StoreHeader.total(&self.region)?;
        let limit = StoreHeader.limit(&self.region)?;

        match segment.binary_search(&self.region, key)? {
            Ok(pos) => {
                let slot = segment.slot_ref(&self.region, pos)?;
                let address = self.address(index, slot);
                let old = segment.read_meta(&self.region, slot)?;

                let over = (total - old.size.min(total) + value.size()).saturating_sub(limit);
                if over > 0 && !self.evict(over, Some(address))? {
                    debug!("Rejecting overwrite of {}: over limit", hex::encode(key));
                    return Err(CacheError::Rejected(RejectReason::OverLimit));
                }

                let total = StoreHeader.total(&self.region)?;
                segment.write_value(&mut self.region, slot, &block)?;
                let total = total - old.size.min(total) + value.size();
                StoreHeader.set_total(&mut self.region, total)?;
                lru::move_to_head(&mut self.region, address)?;
            }
            Err(_) => {
                if segment.count(&self.region)? >= segment.max_keys() {
                    debug!("Rejecting {}: segment {index} is full", hex::encode(key));
                    return Err(CacheError::Rejected(RejectReason::SegmentFull));
                }

                let over = (total + value.size()).saturating_sub(limit);
                if value.size() > limit || (over > 0 && !self.evict(over, None)?) {
                    debug!("Rejecting {}: over limit", hex::encode(key));
                    return Err(CacheError::Rejected(RejectReason::OverLimit));
                }

                // Eviction may have shifted refs in this segment
                let pos = match segment.binary_search(&self.region, key)? {
                    Err(pos) => pos,
                    Ok(_) => {
                        return Err(CacheError::CorruptStore(format!(
                            "key {} appeared during insertion",
                            hex::encode(key)
                        )));
                    }
                };
                let slot = segment.free_slot(&self.region)?.ok_or_else(|| {
                    CacheError::CorruptStore(format!("segment {index} has no free slot"))
                })?;

                segment.write_key(&mut self.region, slot, key)?;
                segment.write_value(&mut self.region, slot, &block)?;
                segment.insert_ref(&mut self.region, pos, slot)?;

                let total = StoreHeader.total(&self.region)?;
                StoreHeader.set_total(&mut self.region, total + value.size())?;
                let address = self.address(index, slot);
                lru::push_head(&mut self.region, address)?;
            }
        }

        if enabled!(Level::TRACE) {
            trace!(
                "Segment {index} after put:\n{}",
                self.region.hex_dump(segment.base(), 64)?
            );
        }

        if !self.check()? {
            warn!(
                "Store failed verification after put of {}",
                hex::encode(key)
            );
            return Err(CacheError::Rejected(RejectReason::VerificationFailed));
        }

        Ok(value)
    }

    fn deactivate(&mut self, key: &[u8]) -> Result<bool> {
        let segment = self.segments[self.segment_index(key)];
        match segment.binary_search(&self.region, key)? {
            Ok(pos) => {
                let slot = segment.slot_ref(&self.region, pos)?;
                segment.set_activated(&mut self.region, slot, false)?;
                Ok(true)
            }
            Err(_) => Ok(false),
        }
    }

    /// Free at least `needed` bytes by deleting deactivated entries, oldest
    /// first.
    ///
    /// The victims are chosen before anything is deleted: if the whole list
    /// cannot cover `needed`, nothing is removed and `false` is returned.
    fn evict(&mut self, needed: u64, exclude: Option<u32>) -> Result<bool> {
        let mut victims = Vec::new();
        let mut freed = 0u64;
        let mut cursor = StoreHeader.tail(&self.region)?;
        let mut steps = 0usize;

        while cursor != NIL && freed < needed {
            steps += 1;
            if steps > self.geometry.total_slots() {
                return Err(CacheError::CorruptStore("LRU list has a cycle".to_string()));
            }

            let (index, slot) = self.locate_linked(cursor)?;
            let meta = self.segments[index].read_meta(&self.region, slot)?;
            if !meta.activated && exclude != Some(cursor) {
                victims.push(cursor);
                freed += meta.size;
            }
            cursor = lru::next(&self.region, cursor)?;
        }

        if freed < needed {
            debug!("Eviction can free {freed} of {needed} bytes, nothing evicted");
            return Ok(false);
        }

        debug!("Evicting {} entries to free {freed} bytes", victims.len());
        for victim in victims {
            self.delete(victim)?;
        }
        Ok(true)
    }

    /// Reclaim a live slot: unlink, unaccount, unindex, and zero it.
    fn delete(&mut self, address: u32) -> Result<()> {
        let (index, slot) = self.locate_linked(address)?;
        let segment = self.segments[index];
        let key = segment.read_key(&self.region, slot)?;
        let meta = segment.read_meta(&self.region, slot)?;

        lru::unlink(&mut self.region, address)?;

        let total = StoreHeader.total(&self.region)?;
        let total = total.checked_sub(meta.size).ok_or_else(|| {
            CacheError::CorruptStore(format!("total {total} is below entry size {}", meta.size))
        })?;
        StoreHeader.set_total(&mut self.region, total)?;

        match segment.binary_search(&self.region, &key)? {
            Ok(pos) if segment.slot_ref(&self.region, pos)? == slot => {
                segment.remove_ref(&mut self.region, pos)?;
            }
            _ => {
                return Err(CacheError::CorruptStore(format!(
                    "slot {address:#x} is linked but not indexed"
                )));
            }
        }

        segment.zero_slot(&mut self.region, slot)
    }

    fn count(&self) -> Result<usize> {
        self.segments
            .iter()
            .map(|segment| segment.count(&self.region))
            .sum()
    }

    fn clear(&mut self) -> Result<()> {
        StoreHeader.clear(&mut self.region)?;
        for segment in &self.segments {
            segment.clear(&mut self.region)?;
        }
        Ok(())
    }

    /// Verify, reporting structural damage as `false` rather than an error.
    fn check(&self) -> Result<bool> {
        match self.verify() {
            Err(CacheError::CorruptStore(reason)) => {
                warn!("Verification failed: {reason}");
                Ok(false)
            }
            Err(CacheError::OutOfRange { offset, len, .. }) => {
                warn!("Verification failed: access of {len} bytes at {offset:#x}");
                Ok(false)
            }
            other => other,
        }
    }

    fn verify(&self) -> Result<bool> {
        for segment in &self.segments {
            if !segment.verify(&self.region)? {
                return Ok(false);
            }
        }

        let live = self.count()?;
        let total = StoreHeader.total(&self.region)?;
        let limit = StoreHeader.limit(&self.region)?;
        let head = StoreHeader.head(&self.region)?;
        let tail = StoreHeader.tail(&self.region)?;

        if (head == NIL) != (tail == NIL) {
            warn!("LRU ends disagree: head {head:#x}, tail {tail:#x}");
            return Ok(false);
        }

        let mut cursor = tail;
        let mut previous = NIL;
        let mut visited = 0usize;
        let mut bytes = 0u64;
        let mut last_timestamp = 0u64;

        while cursor != NIL {
            visited += 1;
            if visited > live {
                warn!("LRU list is longer than the {live} live entries");
                return Ok(false);
            }

            let Some((index, slot)) = self.locate(cursor) else {
                warn!("LRU link {cursor:#x} is not a slot");
                return Ok(false);
            };

            if lru::prev(&self.region, cursor)? != previous {
                warn!("LRU back link of {cursor:#x} is broken");
                return Ok(false);
            }

            let segment = &self.segments[index];
            let key = segment.read_key(&self.region, slot)?;
            if self.segment_index(&key) != index {
                warn!("Key {} is stored in the wrong segment", hex::encode(key));
                return Ok(false);
            }
            match segment.binary_search(&self.region, &key)? {
                Ok(pos) if segment.slot_ref(&self.region, pos)? == slot => {}
                _ => {
                    warn!("LRU entry {cursor:#x} is not indexed");
                    return Ok(false);
                }
            }

            let meta = segment.read_meta(&self.region, slot)?;
            if meta.timestamp < last_timestamp {
                warn!("LRU timestamps decrease at {cursor:#x}");
                return Ok(false);
            }
            last_timestamp = meta.timestamp;
            bytes = bytes.saturating_add(meta.size);

            previous = cursor;
            cursor = lru::next(&self.region, cursor)?;
        }

        if previous != head {
            warn!("LRU head {head:#x} does not match list end {previous:#x}");
            return Ok(false);
        }
        if visited != live {
            warn!("LRU list holds {visited} of {live} live entries");
            return Ok(false);
        }
        if bytes != total {
            warn!("Live entries hold {bytes} bytes, header records {total}");
            return Ok(false);
        }
        if total > limit {
            warn!("Total of {total} bytes exceeds the eviction limit of {limit}");
            return Ok(false);
        }

        Ok(true)
    }

    fn verify_or_clear(&mut self) -> Result<bool> {
        if self.check()? {
            return Ok(false);
        }
        warn!(
            "Clearing store at {} after failed verification",
            self.region.path().display()
        );
        self.clear()?;
        Ok(true)
    }

    fn stats(&self) -> Result<CacheStats> {
        let mut entries = 0;
        let mut fullest_segment = 0;
        for segment in &self.segments {
            let count = segment.count(&self.region)?;
            entries += count;
            fullest_segment = fullest_segment.max(count);
        }

        Ok(CacheStats {
            entries,
            total_bytes: StoreHeader.total(&self.region)?,
            limit_bytes: StoreHeader.limit(&self.region)?,
            segment_count: self.geometry.segment_count,
            segment_size: self.geometry.segment_size,
            max_keys_per_segment: self.geometry.max_keys,
            fullest_segment,
            file_len: self.region.len(),
        })
    }
}
