//! Configuration for the shared cache

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::header::HEADER_SIZE;
use crate::region::page_align;
use crate::segment::{COUNT_SIZE, REF_SIZE, SLOT_HEADER_SIZE};
use crate::{CacheError, Result, SEGMENT_ALIGNMENT};

/// Configuration for a shared cache store
///
/// Missing fields take their default when deserialized.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Backing file path
    pub path: PathBuf,

    /// Total store capacity in bytes, header included
    pub capacity: usize,

    /// Desired size of one segment in bytes
    pub segment_size: usize,

    /// Limit on the summed size of live values (in bytes)
    pub eviction_limit: u64,

    /// Fixed payload width of every value (in bytes)
    pub value_size: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./shmcache.dat"),
            capacity: 64 * 1024 * 1024, // 64 MB
            segment_size: 200 * 1024, // 200 KB
            eviction_limit: 64 * 1024 * 1024, // 64 MB
            value_size: 64,
        }
    }
}

impl CacheConfig {
    /// Create a new configuration with the specified backing file
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            ..Default::default()
        }
    }

    /// Set the backing file path
    #[must_use]
    pub fn with_path<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.path = path.as_ref().to_path_buf();
        self
    }

    /// Set the total capacity
    #[must_use]
    pub const fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    /// Set the desired segment size
    #[must_use]
    pub const fn with_segment_size(mut self, size: usize) -> Self {
        self.segment_size = size;
        self
    }

    /// Set the eviction limit
    #[must_use]
    pub const fn with_eviction_limit(mut self, limit: u64) -> Self {
        self.eviction_limit = limit;
        self
    }

    /// Set the fixed payload width
    #[must_use]
    pub const fn with_value_size(mut self, size: usize) -> Self {
        self.value_size = size;
        self
    }

    /// Validate the configuration and derive the store layout
    pub fn validate(&self) -> Result<StoreGeometry> {
        if self.capacity <= HEADER_SIZE {
            return Err(CacheError::Config(format!(
                "capacity must be greater than the {HEADER_SIZE}-byte header"
            )));
        }

        if self.segment_size == 0 {
            return Err(CacheError::Config(
                "segment_size must be greater than 0".to_string(),
            ));
        }

        if self.value_size == 0 {
            return Err(CacheError::Config(
                "value_size must be greater than 0".to_string(),
            ));
        }

        if self.eviction_limit == 0 {
            return Err(CacheError::Config(
                "eviction_limit must be greater than 0".to_string(),
            ));
        }

        StoreGeometry::compute(self.capacity, self.segment_size, self.value_size)
    }
}

/// Layout of a store derived once from its configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreGeometry {
    /// Number of segments (a power of two).
    pub segment_count: usize,
    /// Size of each segment in bytes (a multiple of 32).
    pub segment_size: usize,
    /// Size of one slot in bytes.
    pub slot_size: usize,
    /// Maximum live entries per segment.
    pub max_keys: usize,
    /// Payload width of every value.
    pub value_size: usize,
    /// Mapped length of the backing file (page aligned).
    pub region_len: usize,
}

impl StoreGeometry {
    /// Compute the layout for a capacity, desired segment size and value width.
    ///
    /// The segment count is the smallest power of two such that
    /// `segment_size * count >= capacity - HEADER_SIZE`.
    pub fn compute(capacity: usize, segment_size: usize, value_size: usize) -> Result<Self> {
        let requested = capacity.saturating_sub(HEADER_SIZE);

        let mut segment_count: usize = 1;
        while segment_size.saturating_mul(segment_count) < requested {
            segment_count = segment_count
                .checked_shl(1)
                .filter(|c| *c != 0)
                .ok_or_else(|| CacheError::Config("too many segments".to_string()))?;
        }

        let segment_size =
            (requested / segment_count + SEGMENT_ALIGNMENT - 1) & !(SEGMENT_ALIGNMENT - 1);
        let slot_size = SLOT_HEADER_SIZE + value_size;
        let max_keys = (segment_size.saturating_sub(COUNT_SIZE) / (slot_size + REF_SIZE))
            .min(usize::from(u16::MAX));

        if max_keys == 0 {
            return Err(CacheError::Config(format!(
                "segment of {segment_size} bytes cannot hold a {slot_size}-byte slot"
            )));
        }

        let region_len = segment_size
            .checked_mul(segment_count)
            .and_then(|s| s.checked_add(HEADER_SIZE))
            .map(page_align)
            .filter(|len| u32::try_from(*len).is_ok())
            .ok_or_else(|| {
                CacheError::Config("store does not fit 32-bit slot offsets".to_string())
            })?;

        Ok(Self {
            segment_count,
            segment_size,
            slot_size,
            max_keys,
            value_size,
            region_len,
        })
    }

    /// Byte offset of segment `index`.
    pub const fn segment_base(&self, index: usize) -> usize {
        HEADER_SIZE + self.segment_size * index
    }

    /// Total number of slots in the store.
    pub const fn total_slots(&self) -> usize {
        self.max_keys * self.segment_count
    }
}

#[cfg(test)]
#[allow(clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let geometry = CacheConfig::default().validate().expect("valid");
        assert!(geometry.segment_count.is_power_of_two());
        assert_eq!(geometry.segment_size % SEGMENT_ALIGNMENT, 0);
        assert_eq!(geometry.region_len % crate::PAGE_SIZE, 0);
        assert!(geometry.segment_size * geometry.segment_count >= 64 * 1024 * 1024 - HEADER_SIZE);
    }

    #[test]
    fn test_segment_count_power_of_two() {
        // 4 segments of 1000 cover 3000 requested bytes, 2 do not
        let geometry = StoreGeometry::compute(3000 + HEADER_SIZE, 1000, 8).expect("geometry");
        assert_eq!(geometry.segment_count, 4);
        assert_eq!(geometry.segment_size, 768); // 3000 / 4 = 750, rounded to 32

        let geometry = StoreGeometry::compute(1000 + HEADER_SIZE, 1000, 8).expect("geometry");
        assert_eq!(geometry.segment_count, 1);
        assert_eq!(geometry.segment_size, 1024);
    }

    #[test]
    fn test_max_keys() {
        let geometry = StoreGeometry::compute(1000 + HEADER_SIZE, 1000, 8).expect("geometry");
        assert_eq!(geometry.slot_size, SLOT_HEADER_SIZE + 8);
        assert_eq!(
            geometry.max_keys,
            (1024 - COUNT_SIZE) / (SLOT_HEADER_SIZE + 8 + REF_SIZE)
        );
    }

    #[test]
    fn test_max_keys_capped_at_ref_width() {
        let geometry =
            StoreGeometry::compute(128 * 1024 * 1024, 128 * 1024 * 1024, 1).expect("geometry");
        assert_eq!(geometry.segment_count, 1);
        assert_eq!(geometry.max_keys, usize::from(u16::MAX));
    }

    #[test]
    fn test_rejects_invalid_config() {
        let base = CacheConfig::new("/tmp/x");
        assert!(base.clone().with_capacity(HEADER_SIZE).validate().is_err());
        assert!(base.clone().with_segment_size(0).validate().is_err());
        assert!(base.clone().with_value_size(0).validate().is_err());
        assert!(base.clone().with_eviction_limit(0).validate().is_err());

        // A segment too small for a single slot
        assert!(matches!(
            base.with_capacity(64).with_segment_size(8).validate(),
            Err(CacheError::Config(_))
        ));
    }

    #[test]
    fn test_rejects_oversized_store() {
        let config = CacheConfig::new("/tmp/x").with_capacity(8 * 1024 * 1024 * 1024);
        assert!(matches!(config.validate(), Err(CacheError::Config(_))));
    }

    #[test]
    fn test_config_from_json() {
        let json = r#"{
            "path": "/dev/shm/cache",
            "capacity": 1048576,
            "segment_size": 4096,
            "eviction_limit": 1000,
            "value_size": 16
        }"#;
        let config: CacheConfig = serde_json::from_str(json).expect("parse");
        assert_eq!(config.path, PathBuf::from("/dev/shm/cache"));
        assert_eq!(config.eviction_limit, 1000);
        assert!(config.validate().is_ok());

        let partial: CacheConfig =
            serde_json::from_str(r#"{ "value_size": 128 }"#).expect("parse partial");
        assert_eq!(partial.value_size, 128);
        assert_eq!(partial.capacity, CacheConfig::default().capacity);
    }
}
