//! # Workload Internals
//!
//! Per-client state and the building blocks shared by the driver, the unit
//! runner and the checker.
//!
//! ## Threads
//!
//! Each client runs a driver thread and, on client 0, a unit-runner thread.
//! Both observe a [`StopSignal`]: the sending half lives in the workload
//! handle and dropping it wakes every pending wait at once.
//!
//! ## Ordering
//!
//! The oracle sits behind a `Mutex` that is held only for the mutation
//! itself, never across a database call. A range enters `active` only after
//! `blobbify` returned `true`, and leaves it before `unblobbify` is issued,
//! so the checker never inspects a range in transition.

macro_rules! ensure {
    ($cond:expr, $($arg:tt)+) => {
        if !$cond {
            return Err($crate::WorkloadError::Contract(format!($($arg)+)));
        }
    };
}

pub mod checker;
pub(crate) mod driver;
pub mod oracle;
pub mod params;
pub mod scenarios;
pub(crate) mod unit_runner;

#[cfg(test)]
mod tests;

use std::sync::atomic::AtomicU64;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crossbeam::channel::{Receiver, RecvTimeoutError, Sender, TryRecvError};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::api::{BlobRangeApi, Version};
use crate::keys::{KeyGenerator, KeyRange};
use crate::{WorkloadContext, WorkloadError};

pub use oracle::Oracle;
pub use params::WorkloadParams;

/// Version below which every purge issued by the workload drops history.
pub const PURGE_VERSION: Version = 1;

// ------------------------------------------------------------------------------------------------
// Stop signal
// ------------------------------------------------------------------------------------------------

/// Sending half of the stop broadcast. Stopping drops the sender.
#[derive(Debug)]
pub struct StopHandle {
    sender: Option<Sender<()>>,
}

impl StopHandle {
    /// Wakes every [`StopSignal`] cloned from this channel.
    pub fn stop(&mut self) {
        self.sender.take();
    }
}

/// Receiving half of the stop broadcast. Nothing is ever sent; the channel
/// disconnecting is the signal.
#[derive(Debug, Clone)]
pub struct StopSignal {
    receiver: Receiver<()>,
}

impl StopSignal {
    /// Creates a connected handle / signal pair.
    pub fn channel() -> (StopHandle, StopSignal) {
        let (sender, receiver) = crossbeam::channel::bounded(0);
        (
            StopHandle {
                sender: Some(sender),
            },
            StopSignal { receiver },
        )
    }

    /// Whether stop has been requested.
    pub fn is_stopped(&self) -> bool {
        matches!(self.receiver.try_recv(), Err(TryRecvError::Disconnected))
    }

    /// Sleeps for `timeout` or until stop is requested.
    ///
    /// Returns `true` if the wait ended because of the stop request.
    pub fn wait(&self, timeout: Duration) -> bool {
        matches!(
            self.receiver.recv_timeout(timeout),
            Err(RecvTimeoutError::Disconnected)
        )
    }

    /// Sleeps until `deadline` or until stop is requested.
    pub fn wait_until(&self, deadline: Instant) -> bool {
        match deadline.checked_duration_since(Instant::now()) {
            Some(timeout) => self.wait(timeout),
            None => self.is_stopped(),
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Poisson pacing
// ------------------------------------------------------------------------------------------------

/// Schedules operations as a Poisson process with the given mean interval.
///
/// Deadlines accumulate from the previous deadline, not from "now", so an
/// operation that runs long eats into the next interval instead of
/// shifting the whole schedule.
#[derive(Debug)]
pub struct PoissonPacer {
    last: Instant,
    mean: Duration,
}

impl PoissonPacer {
    pub fn new(mean: Duration) -> Self {
        Self {
            last: Instant::now(),
            mean,
        }
    }

    /// Advances the schedule by one exponentially distributed interval and
    /// returns the new deadline.
    pub fn next_deadline(&mut self, rng: &mut impl Rng) -> Instant {
        let u: f64 = rng.random();
        let interval = -(1.0 - u).ln() * self.mean.as_secs_f64();
        self.last += Duration::from_secs_f64(interval);
        self.last
    }
}

/// `trunc(exp(uniform(ln min, ln max)))`: log-uniform integer in `[min, max)`.
///
/// Returns `min` when the interval is empty.
pub fn random_exp(rng: &mut impl Rng, min: u64, max: u64) -> u64 {
    let min = min.max(1);
    if max <= min {
        return min;
    }
    let lo = (min as f64).ln();
    let hi = (max as f64).ln();
    let value = rng.random_range(lo..hi).exp() as u64;
    value.clamp(min, max - 1)
}

// ------------------------------------------------------------------------------------------------
// Database helpers
// ------------------------------------------------------------------------------------------------

/// `blobbify` when `active`, `unblobbify` otherwise.
pub fn set_range<A: BlobRangeApi + ?Sized>(
    api: &A,
    range: &KeyRange,
    active: bool,
) -> Result<bool, WorkloadError> {
    let ok = if active {
        api.blobbify(range)?
    } else {
        api.unblobbify(range)?
    };
    Ok(ok)
}

/// Purges `range` at [`PURGE_VERSION`] and blocks until the purge is done.
pub fn purge_and_wait<A: BlobRangeApi + ?Sized>(
    api: &A,
    range: &KeyRange,
    force: bool,
) -> Result<(), WorkloadError> {
    let key = api.purge_blob_granules(range, PURGE_VERSION, None, force)?;
    api.wait_purge_complete(&key)?;
    Ok(())
}

// ------------------------------------------------------------------------------------------------
// Client state
// ------------------------------------------------------------------------------------------------

/// Operation counters reported through `metrics()`.
#[derive(Debug, Default)]
pub(crate) struct Counters {
    pub registered: AtomicU64,
    pub unregistered: AtomicU64,
    pub force_purges: AtomicU64,
    pub scenarios: AtomicU64,
}

/// Everything one client's threads share.
pub(crate) struct ClientState {
    oracle: Mutex<Oracle>,
    keygen: Mutex<KeyGenerator>,
    /// Root of the client's random stream; each thread forks its own.
    rng: Mutex<StdRng>,
    pub counters: Counters,
}

impl ClientState {
    pub fn new(ctx: &WorkloadContext, params: &WorkloadParams, rng: StdRng) -> Self {
        let keygen = KeyGenerator::new(
            ctx.client_id as i32,
            params.sequential,
            params.sequential_gap,
        );
        Self {
            oracle: Mutex::new(Oracle::new()),
            keygen: Mutex::new(keygen),
            rng: Mutex::new(rng),
            counters: Counters::default(),
        }
    }

    pub fn oracle(&self) -> Result<MutexGuard<'_, Oracle>, WorkloadError> {
        self.oracle
            .lock()
            .map_err(|_| WorkloadError::Internal("Mutex poisoned".into()))
    }

    /// Fresh single-key range under `prefix`.
    pub fn new_range(&self, prefix: &str, rng: &mut impl Rng) -> Result<KeyRange, WorkloadError> {
        let mut keygen = self
            .keygen
            .lock()
            .map_err(|_| WorkloadError::Internal("Mutex poisoned".into()))?;
        Ok(keygen.new_range(prefix, rng)?)
    }

    /// Independent random stream derived from the client's root stream.
    pub fn fork_rng(&self) -> Result<StdRng, WorkloadError> {
        let mut root = self
            .rng
            .lock()
            .map_err(|_| WorkloadError::Internal("Mutex poisoned".into()))?;
        Ok(StdRng::seed_from_u64(root.random()))
    }
}
