//! End-to-end scenarios against a real backing file.

#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

use proptest::prelude::*;
use shmcache::header::HEADER_SIZE;
use shmcache::region::MappedRegion;
use shmcache::segment::{Segment, hash_key};
use shmcache::{CacheConfig, CacheError, CacheValue, RejectReason, SharedCache};
use tempfile::TempDir;

const VALUE_SIZE: usize = 32;

fn config(dir: &TempDir, limit: u64) -> CacheConfig {
    CacheConfig::new(dir.path().join("store.dat"))
        .with_capacity(HEADER_SIZE + 4 * 1024)
        .with_segment_size(1024)
        .with_eviction_limit(limit)
        .with_value_size(VALUE_SIZE)
}

fn value(size: u64) -> CacheValue {
    CacheValue::new(vec![0x5A; VALUE_SIZE]).with_size(size)
}

/// Keys routed to `index`, in ascending byte order.
fn colliding_keys(segments: usize, index: usize, n: usize) -> Vec<[u8; 8]> {
    (0u64..)
        .map(u64::to_be_bytes)
        .filter(|key| hash_key(key) as usize & (segments - 1) == index)
        .take(n)
        .collect()
}

#[test]
fn test_refs_sorted_while_slots_keep_insertion_order() {
    let dir = TempDir::new().expect("tempdir");
    let cache = SharedCache::open(config(&dir, 1 << 20)).expect("open");
    let geometry = *cache.geometry();
    assert_eq!(geometry.segment_count, 4);

    let keys = colliding_keys(4, 3, 3);
    // Insert largest, smallest, middle
    for key in [keys[2], keys[0], keys[1]] {
        cache.put(&key, value(1)).expect("put");
    }
    cache.close().expect("close");

    let region =
        MappedRegion::open(&dir.path().join("store.dat"), geometry.region_len).expect("raw open");
    let segment = Segment::new(3, &geometry);
    assert_eq!(segment.count(&region).expect("count"), 3);
    // Physical slots 0, 1, 2 hold keys[2], keys[0], keys[1]
    assert_eq!(segment.refs(&region).expect("refs"), vec![1, 2, 0]);
    assert_eq!(segment.read_key(&region, 0).expect("key"), keys[2]);
    assert!(segment.verify(&region).expect("verify"));
}

#[test]
fn test_eviction_frees_just_enough() {
    let dir = TempDir::new().expect("tempdir");
    let cache = SharedCache::open(config(&dir, 100)).expect("open");
    let keys: Vec<_> = (1u64..=4).map(u64::to_le_bytes).collect();

    for key in &keys[..3] {
        cache.put(key, value(30).deactivated()).expect("put");
    }
    assert_eq!(cache.stats().expect("stats").total_bytes, 90);

    cache.put(&keys[3], value(30)).expect("put over limit");

    assert_eq!(cache.get(&keys[0]).expect("get"), None);
    assert!(cache.get(&keys[1]).expect("get").is_some());
    assert!(cache.get(&keys[2]).expect("get").is_some());
    let stats = cache.stats().expect("stats");
    assert_eq!(stats.entries, 3);
    assert_eq!(stats.total_bytes, 90);
    assert!(cache.verify().expect("verify"));
}

#[test]
fn test_rejected_put_leaves_store_unchanged() {
    let dir = TempDir::new().expect("tempdir");
    let cache = SharedCache::open(config(&dir, 60)).expect("open");

    cache.put(&1u64.to_le_bytes(), value(30)).expect("put");
    cache.put(&2u64.to_le_bytes(), value(30)).expect("put");
    let before = cache.stats().expect("stats");

    let err = cache
        .put(&3u64.to_le_bytes(), value(1))
        .expect_err("over limit");
    assert!(matches!(err, CacheError::Rejected(RejectReason::OverLimit)));
    assert_eq!(
        err.to_string(),
        "Put rejected: eviction limit cannot be met"
    );
    assert_eq!(cache.stats().expect("stats"), before);

    // Releasing one entry makes room
    assert!(cache.deactivate(&1u64.to_le_bytes()).expect("deactivate"));
    cache
        .put(&3u64.to_le_bytes(), value(1))
        .expect("put after deactivate");
    assert_eq!(cache.get(&1u64.to_le_bytes()).expect("get"), None);
}

#[test]
fn test_two_handles_share_one_file() {
    let dir = TempDir::new().expect("tempdir");
    let writer = SharedCache::open(config(&dir, 1 << 20)).expect("open writer");
    let reader = SharedCache::open(config(&dir, 1 << 20)).expect("open reader");

    let stored = writer.put(&77u64.to_le_bytes(), value(8)).expect("put");
    assert_eq!(reader.get(&77u64.to_le_bytes()).expect("get"), Some(stored));

    assert!(reader.deactivate(&77u64.to_le_bytes()).expect("deactivate"));
    let seen = writer
        .get(&77u64.to_le_bytes())
        .expect("get")
        .expect("present");
    assert!(!seen.activated());
}

#[test]
fn test_stats_serialize_to_json() {
    let dir = TempDir::new().expect("tempdir");
    let cache = SharedCache::open(config(&dir, 1000)).expect("open");
    cache.put(&5u64.to_le_bytes(), value(10)).expect("put");

    let json = serde_json::to_value(cache.stats().expect("stats")).expect("json");
    assert_eq!(json["entries"], 1);
    assert_eq!(json["total_bytes"], 10);
    assert_eq!(json["limit_bytes"], 1000);
    assert_eq!(json["segment_count"], 4);
}

#[test]
fn test_routing_is_stable() {
    let key = [1u8, 2, 3, 4, 5, 6, 7, 8];
    assert_eq!(hash_key(&key), hash_key(&key));
    assert_eq!(hash_key(&[1, 2]), 994);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn test_random_puts_keep_store_consistent(
        ops in prop::collection::vec((0u64..200, 0u64..=32, any::<bool>()), 1..120)
    ) {
        let dir = TempDir::new().expect("tempdir");
        let cache = SharedCache::open(config(&dir, 400)).expect("open");

        for (key, size, activated) in ops {
            let result = cache.put(
                &key.to_le_bytes(),
                value(size).with_activated(activated),
            );
            match result {
                Ok(stored) => {
                    let read = cache.get(&key.to_le_bytes()).expect("get");
                    prop_assert_eq!(read, Some(stored));
                }
                Err(CacheError::Rejected(
                    RejectReason::SegmentFull | RejectReason::OverLimit,
                )) => {}
                Err(e) => prop_assert!(false, "unexpected error: {}", e),
            }

            let stats = cache.stats().expect("stats");
            prop_assert!(stats.total_bytes <= stats.limit_bytes);
            prop_assert!(stats.fullest_segment <= stats.max_keys_per_segment);
        }

        prop_assert!(cache.verify().expect("verify"));
    }
}
