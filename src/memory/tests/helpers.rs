use crate::api::BlobRangeApi;
use crate::keys::KeyRange;
use crate::memory::{MemoryBlobStore, MemoryStoreConfig};
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;

/// Initialize tracing subscriber controlled by `RUST_LOG` env var.
/// Safe to call multiple times; only the first call takes effect.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Short background delays so tests finish quickly.
pub fn fast_config() -> MemoryStoreConfig {
    init_tracing();
    MemoryStoreConfig {
        provision_delay: Duration::from_millis(2),
        purge_delay: Duration::from_millis(1),
        transient_error_rate: 0.0,
        retry_backoff: Duration::from_micros(100),
        thread_pool_size: 2,
        seed: 7,
    }
}

pub fn open_store() -> MemoryBlobStore {
    MemoryBlobStore::open(fast_config()).expect("open")
}

pub fn range(begin: &[u8], end: &[u8]) -> KeyRange {
    KeyRange::new(begin.to_vec(), end.to_vec()).expect("range")
}

pub fn single(key: &[u8]) -> KeyRange {
    KeyRange::single_key(key.to_vec()).expect("single key range")
}

/// Polls `verify_blob_range` until the range is readable.
pub fn wait_active(store: &MemoryBlobStore, r: &KeyRange) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while store.verify_blob_range(r, None).expect("verify").is_none() {
        assert!(Instant::now() < deadline, "{r} never became active");
        std::thread::sleep(Duration::from_millis(1));
    }
}

/// Force-purges `r` and waits for completion.
pub fn force_purge(store: &MemoryBlobStore, r: &KeyRange) {
    let key = store
        .purge_blob_granules(r, 1, None, true)
        .expect("purge");
    store.wait_purge_complete(&key).expect("wait purge");
}
