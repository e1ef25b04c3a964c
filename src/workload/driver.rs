//! Poisson-paced register / unregister loop over `R_` ranges.

use std::sync::atomic::Ordering;
use std::time::Duration;

use rand::Rng;
use rand::rngs::StdRng;
use tracing::{debug, trace};

use super::{ClientState, PoissonPacer, StopSignal, purge_and_wait, set_range};
use crate::WorkloadError;
use crate::api::BlobRangeApi;
use crate::keys::DRIVER_PREFIX;

/// Blobbifies a fresh range and records it as active.
pub fn register_new_range<A: BlobRangeApi + ?Sized>(
    api: &A,
    client: &ClientState,
    rng: &mut impl Rng,
) -> Result<(), WorkloadError> {
    let range = client.new_range(DRIVER_PREFIX, rng)?;
    debug!(range = %range, "registering new range");

    let ok = set_range(api, &range, true)?;
    ensure!(ok, "blobbify of fresh range {range} returned false");

    debug!(range = %range, "registered new range");
    client.oracle()?.record_registered(range);
    client.counters.registered.fetch_add(1, Ordering::Relaxed);
    Ok(())
}

/// Removes a random active range, optionally force-purging it first.
///
/// Returns `false` when there was nothing to remove.
pub fn unregister_random_range<A: BlobRangeApi + ?Sized>(
    api: &A,
    client: &ClientState,
    rng: &mut impl Rng,
) -> Result<bool, WorkloadError> {
    let Some(range) = client.oracle()?.take_random(rng) else {
        return Ok(false);
    };
    debug!(range = %range, "unregistering range");

    if rng.random_bool(0.5) {
        debug!(range = %range, "force purging range before unregistering");
        purge_and_wait(api, &range, true)?;
        client.counters.force_purges.fetch_add(1, Ordering::Relaxed);
    }

    let ok = set_range(api, &range, false)?;
    ensure!(ok, "unblobbify of {range} returned false");

    debug!(range = %range, "unregistered range");
    client.oracle()?.record_unregistered(range);
    client.counters.unregistered.fetch_add(1, Ordering::Relaxed);
    Ok(true)
}

/// Driver loop. Runs until `stop` fires or an operation fails.
pub fn run<A: BlobRangeApi + ?Sized>(
    api: &A,
    client: &ClientState,
    mean_interval: Duration,
    stop: &StopSignal,
    mut rng: StdRng,
) -> Result<(), WorkloadError> {
    let mut pacer = PoissonPacer::new(mean_interval);
    let mut ops = 0u64;
    while !stop.is_stopped() {
        let deadline = pacer.next_deadline(&mut rng);

        let register = client.oracle()?.active().is_empty() || rng.random_bool(0.5);
        if register || !unregister_random_range(api, client, &mut rng)? {
            register_new_range(api, client, &mut rng)?;
        }
        ops += 1;

        if stop.wait_until(deadline) {
            break;
        }
    }
    trace!(ops, "driver stopped");
    Ok(())
}
