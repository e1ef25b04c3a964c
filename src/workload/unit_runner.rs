//! Runs one unit scenario at a time until stopped.

use std::collections::HashSet;
use std::sync::atomic::Ordering;
use std::time::Duration;

use rand::Rng;
use rand::rngs::StdRng;
use tracing::{debug, info};

use super::checker::CheckSettings;
use super::scenarios::UnitScenario;
use super::{ClientState, StopSignal};
use crate::WorkloadError;
use crate::api::BlobRangeApi;
use crate::keys::UNIT_PREFIX;

/// Picks before giving up on finding an enabled scenario.
pub const MAX_PICK_ATTEMPTS: usize = 1000;

/// Picks a scenario uniformly, re-drawing excluded ones.
pub fn pick_scenario(
    rng: &mut impl Rng,
    excluded: &HashSet<UnitScenario>,
) -> Result<UnitScenario, WorkloadError> {
    for _ in 0..MAX_PICK_ATTEMPTS {
        let scenario = UnitScenario::ALL[rng.random_range(0..UnitScenario::ALL.len())];
        if !excluded.contains(&scenario) {
            return Ok(scenario);
        }
    }
    Err(WorkloadError::Internal(format!(
        "no enabled unit scenario after {MAX_PICK_ATTEMPTS} picks"
    )))
}

/// Unit runner loop. A scenario in progress always runs to completion;
/// `stop` is observed between scenarios.
pub fn run<A: BlobRangeApi + ?Sized>(
    api: &A,
    client: &ClientState,
    excluded: &HashSet<UnitScenario>,
    settings: &CheckSettings,
    delay: Duration,
    stop: &StopSignal,
    mut rng: StdRng,
) -> Result<(), WorkloadError> {
    while !stop.is_stopped() {
        let range = client.new_range(UNIT_PREFIX, &mut rng)?;
        let scenario = pick_scenario(&mut rng, excluded)?;
        debug!(range = %range, scenario = scenario.name(), "selected range for unit");

        scenario.run(api, &range, settings, &mut rng)?;
        client.counters.scenarios.fetch_add(1, Ordering::Relaxed);
        info!(scenario = scenario.name(), "unit scenario passed");

        if stop.wait(delay) {
            break;
        }
    }
    Ok(())
}
