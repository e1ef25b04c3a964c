//! Range checks: poll `verify_blob_range` until the range reaches the
//! expected state, then cross-check the blob range listing and the granule
//! mapping.

use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::WorkloadError;
use crate::api::{BlobRangeApi, LARGE_LIMIT, read_granules};
use crate::keys::KeyRange;

/// Upper bound on concurrently running checks in [`check_ranges`].
const MAX_PARALLEL_CHECKS: usize = 64;

/// Polling behavior of [`check_range`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckSettings {
    /// Delay between `verify_blob_range` polls.
    pub poll_interval: Duration,
    /// Give up after this long. `None` polls forever.
    pub timeout: Option<Duration>,
}

impl Default for CheckSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            timeout: None,
        }
    }
}

/// Whether `range` is readable from blob storage at the latest version.
pub fn is_range_active<A: BlobRangeApi + ?Sized>(
    api: &A,
    range: &KeyRange,
) -> Result<bool, WorkloadError> {
    Ok(api.verify_blob_range(range, None)?.is_some())
}

fn state_name(active: bool) -> &'static str {
    if active { "active" } else { "inactive" }
}

/// Waits until `range` verifies as `expect_active`, then validates the
/// listing and the granules.
///
/// An active range must be covered by exactly one blob range and by a
/// contiguous run of granules; an inactive range must have neither.
pub fn check_range<A: BlobRangeApi + ?Sized>(
    api: &A,
    range: &KeyRange,
    expect_active: bool,
    settings: &CheckSettings,
) -> Result<(), WorkloadError> {
    let expected = state_name(expect_active);
    let started = Instant::now();
    while is_range_active(api, range)? != expect_active {
        debug!(range = %range, expected, "range check not yet satisfied");
        if settings.timeout.is_some_and(|timeout| started.elapsed() >= timeout) {
            return Err(WorkloadError::CheckTimeout {
                range: range.to_string(),
                expected,
            });
        }
        thread::sleep(settings.poll_interval);
    }

    let blob_ranges = api.list_blobbified(range, LARGE_LIMIT)?;
    if expect_active {
        ensure!(
            blob_ranges.len() == 1,
            "{range}: expected one enclosing blob range, found {blob_ranges:?}"
        );
        ensure!(
            blob_ranges[0].encloses(range),
            "{range}: blob range {} does not enclose it",
            blob_ranges[0]
        );
    } else {
        ensure!(
            blob_ranges.is_empty(),
            "{range}: expected no blob ranges, found {blob_ranges:?}"
        );
    }

    let granules = read_granules(api, range, LARGE_LIMIT)?;
    if expect_active {
        validate_granule_cover(range, &granules)?;
    } else if !granules.is_empty() {
        warn!(range = %range, granules = granules.len(), "granules left on inactive range");
        for g in &granules {
            debug!(granule = %g, "leftover granule");
        }
        return Err(WorkloadError::Contract(format!(
            "{range}: expected no granules, found {granules:?}"
        )));
    }
    Ok(())
}

/// Granules must reach from at or before `range.begin` to at or after
/// `range.end` with every neighbor pair sharing a boundary.
pub fn validate_granule_cover(range: &KeyRange, granules: &[KeyRange]) -> Result<(), WorkloadError> {
    let (Some(first), Some(last)) = (granules.first(), granules.last()) else {
        return Err(WorkloadError::Contract(format!("{range}: no granules")));
    };
    ensure!(
        first.begin() <= range.begin(),
        "{range}: first granule {first} starts after the range"
    );
    ensure!(
        last.end() >= range.end(),
        "{range}: last granule {last} ends before the range"
    );
    for pair in granules.windows(2) {
        ensure!(
            pair[0].end() == pair[1].begin(),
            "{range}: granules {} and {} are not adjacent",
            pair[0],
            pair[1]
        );
    }
    Ok(())
}

/// Checks every range as active, in parallel, and reports all failures
/// together.
pub fn check_ranges<A: BlobRangeApi + ?Sized>(
    api: &A,
    ranges: &[KeyRange],
    settings: &CheckSettings,
) -> Result<(), WorkloadError> {
    let mut failures = Vec::new();
    for chunk in ranges.chunks(MAX_PARALLEL_CHECKS) {
        thread::scope(|s| {
            let handles: Vec<_> = chunk
                .iter()
                .map(|range| (range, s.spawn(move || check_range(api, range, true, settings))))
                .collect();
            for (range, handle) in handles {
                match handle.join() {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => failures.push(e.to_string()),
                    Err(_) => failures.push(format!("{range}: check panicked")),
                }
            }
        });
    }

    if failures.is_empty() {
        Ok(())
    } else {
        Err(WorkloadError::CheckFailed { failures })
    }
}
