//! Configuration parsing, validation and lifecycle misuse through the
//! public API.

use blob_granule_ranges::memory::{MemoryBlobStore, MemoryStoreConfig};
use blob_granule_ranges::{BlobGranuleRangesWorkload, WorkloadConfig, WorkloadContext, WorkloadError};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

fn options(pairs: &[(&str, &str)]) -> HashMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

fn store() -> Arc<MemoryBlobStore> {
    Arc::new(MemoryBlobStore::open(MemoryStoreConfig::default()).expect("open"))
}

// ================================================================================================
// Options
// ================================================================================================

#[test]
fn empty_options_give_defaults() {
    let config = WorkloadConfig::from_options(&HashMap::new()).unwrap();
    assert_eq!(config.test_duration, Duration::from_secs(30));
    assert_eq!(config.ops_per_second, None);
    assert!(!config.enable_known_buggy_scenarios);
    assert_eq!(config.check_poll_interval, Duration::from_secs(1));
    assert_eq!(config.unit_delay, Duration::from_secs(1));
    assert_eq!(config.check_timeout, None);
}

#[test]
fn all_options_parsed() {
    let config = WorkloadConfig::from_options(&options(&[
        ("testDuration", "12.5"),
        ("opsPerSecond", "40"),
        ("enableKnownBuggyScenarios", "true"),
        ("checkPollInterval", "0.25"),
        ("unitDelay", "0"),
        ("checkTimeout", "60"),
    ]))
    .unwrap();
    assert_eq!(config.test_duration, Duration::from_millis(12_500));
    assert_eq!(config.ops_per_second, Some(40));
    assert!(config.enable_known_buggy_scenarios);
    assert_eq!(config.check_poll_interval, Duration::from_millis(250));
    assert_eq!(config.unit_delay, Duration::ZERO);
    assert_eq!(config.check_timeout, Some(Duration::from_secs(60)));
}

/// # Scenario
/// Parse option sets that are malformed or out of range.
///
/// # Expected behavior
/// Every one is rejected with `InvalidConfig`.
#[test]
fn bad_options_rejected() {
    let cases: [&[(&str, &str)]; 6] = [
        &[("noSuchOption", "1")],
        &[("opsPerSecond", "0")],
        &[("opsPerSecond", "many")],
        &[("testDuration", "-1")],
        &[("checkPollInterval", "0")],
        &[("enableKnownBuggyScenarios", "yes")],
    ];
    for case in cases {
        let err = WorkloadConfig::from_options(&options(case)).unwrap_err();
        assert!(matches!(err, WorkloadError::InvalidConfig(_)), "{case:?}: {err}");
    }
}

// ================================================================================================
// Construction and lifecycle
// ================================================================================================

#[test]
fn client_id_out_of_range_rejected() {
    let ctx = WorkloadContext {
        client_id: 2,
        client_count: 2,
        shared_random_number: 0,
        seed: 0,
    };
    let err = BlobGranuleRangesWorkload::new(store(), ctx, WorkloadConfig::default()).unwrap_err();
    assert!(matches!(err, WorkloadError::InvalidConfig(_)), "{err}");
}

#[test]
fn invalid_config_rejected_by_new() {
    let config = WorkloadConfig {
        check_poll_interval: Duration::ZERO,
        ..WorkloadConfig::default()
    };
    let err = BlobGranuleRangesWorkload::new(store(), WorkloadContext::single_client(1), config)
        .unwrap_err();
    assert!(matches!(err, WorkloadError::InvalidConfig(_)), "{err}");
}

/// # Scenario
/// Call `check` before `start`, then `start` twice.
///
/// # Expected behavior
/// Both misuses return `InvalidState`; the workload can still be checked
/// after the first `start`.
#[test]
fn lifecycle_misuse() {
    let config = WorkloadConfig {
        test_duration: Duration::from_millis(50),
        ops_per_second: Some(10),
        check_poll_interval: Duration::from_millis(2),
        unit_delay: Duration::from_millis(2),
        check_timeout: Some(Duration::from_secs(10)),
        ..WorkloadConfig::default()
    };
    let workload =
        BlobGranuleRangesWorkload::new(store(), WorkloadContext::single_client(5), config).unwrap();

    assert!(matches!(workload.check(), Err(WorkloadError::InvalidState(_))));

    workload.setup().unwrap();
    workload.start().unwrap();
    assert!(matches!(workload.start(), Err(WorkloadError::InvalidState(_))));
    assert!(workload.check().unwrap());
    assert!(matches!(workload.check(), Err(WorkloadError::InvalidState(_))));
}

#[test]
fn same_seed_same_params() {
    let ctx = WorkloadContext {
        client_id: 1,
        client_count: 3,
        shared_random_number: 777,
        seed: 31,
    };
    let a = BlobGranuleRangesWorkload::new(store(), ctx, WorkloadConfig::default()).unwrap();
    let b = BlobGranuleRangesWorkload::new(store(), ctx, WorkloadConfig::default()).unwrap();
    assert_eq!(a.params(), b.params());
    assert!(a.params().ops_per_second >= 1);
    assert!(a.params().target_ranges >= 1);
}
