//! Open a store, verify it, and print its statistics.
//!
//! Usage:
//!   cargo run --example inspect_store -p shmcache -- [config.json]
//!
//! The optional argument is a JSON file holding a `CacheConfig`. Without
//! it the default layout is used, at `SHMCACHE_PATH` if set. Pass
//! `--repair` to clear a store that fails verification.

#![allow(clippy::expect_used)]

use shmcache::{CacheConfig, Recovery, SharedCache};

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let repair = args.iter().any(|a| a == "--repair");

    let config = match args.iter().find(|a| !a.starts_with("--")) {
        Some(file) => {
            let json = std::fs::read_to_string(file).expect("failed to read config file");
            serde_json::from_str::<CacheConfig>(&json).expect("invalid config file")
        }
        None => {
            let config = CacheConfig::default();
            match std::env::var("SHMCACHE_PATH") {
                Ok(path) => config.with_path(path),
                Err(_) => config,
            }
        }
    };

    println!("Store: {}", config.path.display());

    let cache = if repair {
        let (cache, recovery) =
            SharedCache::open_with_recovery(config).expect("failed to open store");
        if recovery == Recovery::Cleared {
            println!("  Store failed verification and was cleared");
        }
        cache
    } else {
        SharedCache::open(config).expect("failed to open store (try --repair)")
    };

    let stats = cache.stats().expect("failed to read stats");
    println!("  Entries:      {}", stats.entries);
    println!(
        "  Bytes:        {} of {} ({:.1}%)",
        stats.total_bytes,
        stats.limit_bytes,
        stats.limit_utilization() * 100.0
    );
    println!(
        "  Segments:     {} x {} bytes, {} keys each",
        stats.segment_count, stats.segment_size, stats.max_keys_per_segment
    );
    println!(
        "  Slots used:   {:.1}% (fullest segment {})",
        stats.slot_utilization() * 100.0,
        stats.fullest_segment
    );
    println!("  File length:  {}", stats.file_len);
    println!(
        "  Verified:     {}",
        cache.verify().expect("verification error")
    );
    println!();
    println!(
        "{}",
        serde_json::to_string_pretty(&stats).expect("failed to serialize stats")
    );

    cache.close().expect("failed to close store");
}
