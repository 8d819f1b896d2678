//! Point-in-time statistics for a store.

use serde::Serialize;

/// Snapshot of a store's occupancy and layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    /// Live entries across all segments.
    pub entries: usize,
    /// Summed size of live values.
    pub total_bytes: u64,
    /// Eviction limit stored in the header.
    pub limit_bytes: u64,
    /// Number of segments.
    pub segment_count: usize,
    /// Bytes per segment.
    pub segment_size: usize,
    /// Maximum live entries per segment.
    pub max_keys_per_segment: usize,
    /// Live entries in the fullest segment.
    pub fullest_segment: usize,
    /// Mapped length of the backing file.
    pub file_len: usize,
}

impl CacheStats {
    /// Fraction of the eviction limit in use.
    pub fn limit_utilization(&self) -> f64 {
        if self.limit_bytes == 0 {
            0.0
        } else {
            self.total_bytes as f64 / self.limit_bytes as f64
        }
    }

    /// Fraction of all slots holding live entries.
    pub fn slot_utilization(&self) -> f64 {
        let slots = self.segment_count * self.max_keys_per_segment;
        if slots == 0 {
            0.0
        } else {
            self.entries as f64 / slots as f64
        }
    }
}
