//! # Blob Granule Ranges
//!
//! A randomized, property-based **workload** that stresses the blob range
//! management API of an ordered key-value store and continuously checks the
//! store against an in-memory oracle.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use blob_granule_ranges::{
//!     BlobGranuleRangesWorkload, WorkloadConfig, WorkloadContext,
//!     memory::{MemoryBlobStore, MemoryStoreConfig},
//! };
//!
//! let store = Arc::new(MemoryBlobStore::open(MemoryStoreConfig::default()).unwrap());
//! let workload = BlobGranuleRangesWorkload::new(
//!     store,
//!     WorkloadContext::single_client(42),
//!     WorkloadConfig::default(),
//! )
//! .unwrap();
//!
//! // setup → start → (timed run) → check
//! assert!(workload.run().unwrap());
//! ```
//!
//! ## Components
//!
//! - **Key generator** ([`keys`]) — fresh single-key ranges per client.
//! - **Range API** ([`api`]) — the contract consumed from the database.
//! - **Oracle + driver** — Poisson-paced register / unregister of ranges,
//!   mirrored in an active / inactive oracle.
//! - **Unit runner** — one scenario at a time from [`UnitScenario`].
//! - **Checker** — verifies every range the oracle believes active.
//! - **In-memory store** ([`memory`]) — a reference [`api::BlobRangeApi`]
//!   implementation used by the tests and the simulation binary.

pub mod api;
pub mod keys;
pub mod memory;
pub mod workload;

use std::collections::{HashMap, HashSet};
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use rand::SeedableRng;
use rand::rngs::StdRng;
use thiserror::Error;
use tracing::{debug, error, info};

use api::{ApiError, BlobRangeApi};
use keys::{KeyError, KeyRange};
use workload::checker::{self, CheckSettings};
use workload::{ClientState, StopHandle, StopSignal, WorkloadParams};

pub use workload::scenarios::UnitScenario;

// ------------------------------------------------------------------------------------------------
// Configuration
// ------------------------------------------------------------------------------------------------

/// Configuration for a [`BlobGranuleRangesWorkload`].
///
/// All fields have defaults via [`WorkloadConfig::default()`]. Harness
/// options can be parsed with [`WorkloadConfig::from_options`]. The
/// configuration is validated when passed to
/// [`BlobGranuleRangesWorkload::new`].
///
/// # Example
///
/// ```rust
/// use std::time::Duration;
/// use blob_granule_ranges::WorkloadConfig;
///
/// let config = WorkloadConfig {
///     test_duration: Duration::from_secs(5),
///     ops_per_second: Some(20),
///     ..WorkloadConfig::default()
/// };
/// ```
#[derive(Debug, Clone)]
pub struct WorkloadConfig {
    /// Length of the timed run.
    ///
    /// Option key: `testDuration` (seconds). Default: 30 s.
    pub test_duration: Duration,

    /// Mean operation rate before division by the client count.
    ///
    /// Option key: `opsPerSecond`. Default: `None`, meaning uniform in
    /// [1, 100). Must be ≥ 1 when set.
    pub ops_per_second: Option<u32>,

    /// Runs the scenarios that are excluded by default because the system
    /// under test mishandles them ([`UnitScenario::is_known_buggy`]).
    ///
    /// Option key: `enableKnownBuggyScenarios`. Default: false.
    pub enable_known_buggy_scenarios: bool,

    /// Delay between `verify_blob_range` polls while waiting for a range to
    /// reach the expected state.
    ///
    /// Option key: `checkPollInterval` (seconds). Default: 1 s. Must be > 0.
    pub check_poll_interval: Duration,

    /// Pause between unit scenarios.
    ///
    /// Option key: `unitDelay` (seconds). Default: 1 s.
    pub unit_delay: Duration,

    /// Upper bound on how long a single range check may poll.
    ///
    /// Option key: `checkTimeout` (seconds). Default: `None` (poll forever).
    pub check_timeout: Option<Duration>,
}

impl Default for WorkloadConfig {
    fn default() -> Self {
        Self {
            test_duration: Duration::from_secs(30),
            ops_per_second: None,
            enable_known_buggy_scenarios: false,
            check_poll_interval: Duration::from_secs(1),
            unit_delay: Duration::from_secs(1),
            check_timeout: None,
        }
    }
}

impl WorkloadConfig {
    /// Builds a configuration from harness-style `key → value` options.
    ///
    /// Missing keys keep their defaults; unknown keys are rejected.
    pub fn from_options(options: &HashMap<String, String>) -> Result<Self, WorkloadError> {
        let mut config = Self::default();
        for (key, value) in options {
            match key.as_str() {
                "testDuration" => config.test_duration = parse_seconds(key, value)?,
                "opsPerSecond" => config.ops_per_second = Some(parse_value(key, value)?),
                "enableKnownBuggyScenarios" => {
                    config.enable_known_buggy_scenarios = parse_value(key, value)?
                }
                "checkPollInterval" => config.check_poll_interval = parse_seconds(key, value)?,
                "unitDelay" => config.unit_delay = parse_seconds(key, value)?,
                "checkTimeout" => config.check_timeout = Some(parse_seconds(key, value)?),
                _ => {
                    return Err(WorkloadError::InvalidConfig(format!(
                        "unknown option {key}"
                    )));
                }
            }
        }
        config.validate()?;
        Ok(config)
    }

    /// Validates all configuration parameters.
    fn validate(&self) -> Result<(), WorkloadError> {
        if self.ops_per_second == Some(0) {
            return Err(WorkloadError::InvalidConfig(
                "opsPerSecond must be >= 1".into(),
            ));
        }
        if self.check_poll_interval.is_zero() {
            return Err(WorkloadError::InvalidConfig(
                "checkPollInterval must be > 0".into(),
            ));
        }
        Ok(())
    }

    /// Scenarios the unit runner must never pick.
    fn excluded_scenarios(&self) -> HashSet<UnitScenario> {
        if self.enable_known_buggy_scenarios {
            return HashSet::new();
        }
        UnitScenario::ALL
            .into_iter()
            .filter(UnitScenario::is_known_buggy)
            .collect()
    }

    fn check_settings(&self) -> CheckSettings {
        CheckSettings {
            poll_interval: self.check_poll_interval,
            timeout: self.check_timeout,
        }
    }
}

fn parse_value<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, WorkloadError> {
    value
        .trim()
        .parse()
        .map_err(|_| WorkloadError::InvalidConfig(format!("{key}: cannot parse {value:?}")))
}

fn parse_seconds(key: &str, value: &str) -> Result<Duration, WorkloadError> {
    let secs: f64 = parse_value(key, value)?;
    Duration::try_from_secs_f64(secs)
        .map_err(|_| WorkloadError::InvalidConfig(format!("{key}: {secs} is not a valid duration")))
}

// ------------------------------------------------------------------------------------------------
// Harness context
// ------------------------------------------------------------------------------------------------

/// What the harness tells each client about its place in the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkloadContext {
    /// Index of this client, in `0..client_count`.
    pub client_id: u32,
    /// Number of clients running the workload.
    pub client_count: u32,
    /// Random number shared by every client of the run.
    pub shared_random_number: u64,
    /// Seed for this client's private random stream.
    pub seed: u64,
}

impl WorkloadContext {
    /// Context for a run with a single client.
    pub fn single_client(seed: u64) -> Self {
        Self {
            client_id: 0,
            client_count: 1,
            shared_random_number: seed,
            seed,
        }
    }

    fn validate(&self) -> Result<(), WorkloadError> {
        if self.client_count == 0 || self.client_id >= self.client_count {
            return Err(WorkloadError::InvalidConfig(format!(
                "client_id {} out of range for client_count {}",
                self.client_id, self.client_count
            )));
        }
        Ok(())
    }
}

// ------------------------------------------------------------------------------------------------
// Error type
// ------------------------------------------------------------------------------------------------

/// Errors returned by the workload.
#[derive(Debug, Error)]
pub enum WorkloadError {
    /// The store answered in a way that contradicts the oracle or the API
    /// contract.
    #[error("contract violation: {0}")]
    Contract(String),

    /// A non-retryable error from the database.
    #[error("api error: {0}")]
    Api(#[from] ApiError),

    /// A range could not be constructed.
    #[error("key error: {0}")]
    Key(#[from] KeyError),

    /// One or more parallel range checks failed.
    #[error("{} range check(s) failed: {}", failures.len(), failures.join("; "))]
    CheckFailed {
        /// One message per failed range.
        failures: Vec<String>,
    },

    /// A range never reached the expected state within `check_timeout`.
    #[error("range {range} did not become {expected} in time")]
    CheckTimeout {
        /// Printable range.
        range: String,
        /// `"active"` or `"inactive"`.
        expected: &'static str,
    },

    /// Invalid configuration parameter.
    #[error("invalid config: {0}")]
    InvalidConfig(String),

    /// Lifecycle method called out of order.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// A workload thread panicked.
    #[error("worker panicked: {0}")]
    WorkerPanicked(String),

    /// Internal invariant violation (poisoned lock, etc.).
    #[error("internal error: {0}")]
    Internal(String),
}

// ------------------------------------------------------------------------------------------------
// Metrics
// ------------------------------------------------------------------------------------------------

/// A single named value reported by [`BlobGranuleRangesWorkload::metrics`].
#[derive(Debug, Clone, PartialEq)]
pub struct PerfMetric {
    /// Metric name.
    pub name: &'static str,
    /// Metric value.
    pub value: f64,
}

// ------------------------------------------------------------------------------------------------
// Running tasks
// ------------------------------------------------------------------------------------------------

type TaskHandle = thread::JoinHandle<Result<(), WorkloadError>>;

/// Threads started by [`BlobGranuleRangesWorkload::start`].
/// Taken (`Option::take`) by `check` so they are joined exactly once.
struct RunningTasks {
    stop: StopHandle,
    driver: TaskHandle,
    unit: Option<TaskHandle>,
}

fn join_task(name: &str, handle: TaskHandle) -> Result<(), WorkloadError> {
    handle
        .join()
        .map_err(|_| WorkloadError::WorkerPanicked(name.to_string()))?
}

// ------------------------------------------------------------------------------------------------
// Workload handle
// ------------------------------------------------------------------------------------------------

/// One client's instance of the blob granule ranges workload.
///
/// # Lifecycle
///
/// 1. [`setup`](Self::setup) registers the initial target ranges.
/// 2. [`start`](Self::start) launches the driver thread, and on client 0
///    the unit-scenario thread, then returns the test duration.
/// 3. After the duration elapses, [`check`](Self::check) stops the driver,
///    verifies every active range in parallel, and waits for the unit
///    runner to finish its current scenario.
///
/// [`run`](Self::run) performs all three steps.
///
/// Each client owns its oracle; clients only share the database.
pub struct BlobGranuleRangesWorkload<A: BlobRangeApi + 'static> {
    api: Arc<A>,
    ctx: WorkloadContext,
    config: WorkloadConfig,
    params: WorkloadParams,
    client: Arc<ClientState>,
    running: Mutex<Option<RunningTasks>>,
}

impl<A: BlobRangeApi + 'static> std::fmt::Debug for BlobGranuleRangesWorkload<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlobGranuleRangesWorkload")
            .field("ctx", &self.ctx)
            .field("params", &self.params)
            .finish_non_exhaustive()
    }
}

impl<A: BlobRangeApi + 'static> BlobGranuleRangesWorkload<A> {
    /// Creates the workload for one client and derives its parameters.
    ///
    /// # Errors
    ///
    /// Returns [`WorkloadError::InvalidConfig`] if the configuration or the
    /// context is out of range.
    pub fn new(api: Arc<A>, ctx: WorkloadContext, config: WorkloadConfig) -> Result<Self, WorkloadError> {
        config.validate()?;
        ctx.validate()?;

        let mut rng = StdRng::seed_from_u64(ctx.seed);
        let params = WorkloadParams::derive(&ctx, &config, &mut rng);
        let client = Arc::new(ClientState::new(&ctx, &params, rng));

        info!(
            client_id = ctx.client_id,
            target_ranges = params.target_ranges,
            ops_per_second = params.ops_per_second,
            sequential = params.sequential,
            sequential_gap = params.sequential_gap,
            "BlobGranuleRangesWorkloadInit"
        );

        Ok(Self {
            api,
            ctx,
            config,
            params,
            client,
            running: Mutex::new(None),
        })
    }

    /// Workload name as registered with the harness.
    pub fn description(&self) -> &'static str {
        "BlobGranuleRangesWorkload"
    }

    /// Parameters derived at construction.
    pub fn params(&self) -> &WorkloadParams {
        &self.params
    }

    /// Registers the initial `target_ranges` ranges one after another.
    pub fn setup(&self) -> Result<(), WorkloadError> {
        info!(initial_ranges = self.params.target_ranges, "BlobGranuleRangesSetup");
        let mut rng = self.client.fork_rng()?;
        for _ in 0..self.params.target_ranges {
            workload::driver::register_new_range(self.api.as_ref(), &self.client, &mut rng)?;
        }
        info!("BlobGranuleRangesSetupComplete");
        Ok(())
    }

    /// Launches the driver (and, on client 0, the unit runner).
    ///
    /// Returns how long the harness should let the workload run before
    /// calling [`check`](Self::check).
    pub fn start(&self) -> Result<Duration, WorkloadError> {
        let mut running = self
            .running
            .lock()
            .map_err(|_| WorkloadError::Internal("Mutex poisoned".into()))?;
        if running.is_some() {
            return Err(WorkloadError::InvalidState("workload already started".into()));
        }

        let (stop, signal) = StopSignal::channel();
        let driver = self.spawn_driver(signal.clone())?;
        let unit = if self.ctx.client_id == 0 {
            Some(self.spawn_unit_runner(signal)?)
        } else {
            None
        };

        *running = Some(RunningTasks { stop, driver, unit });
        debug!(client_id = self.ctx.client_id, "workload started");
        Ok(self.config.test_duration)
    }

    /// Stops the driver and verifies the store against the oracle.
    ///
    /// Returns `Ok(true)` when every check passed.
    ///
    /// # Errors
    ///
    /// Any contract violation observed by the driver, the checker, or the
    /// unit runner.
    pub fn check(&self) -> Result<bool, WorkloadError> {
        let tasks = self
            .running
            .lock()
            .map_err(|_| WorkloadError::Internal("Mutex poisoned".into()))?
            .take()
            .ok_or_else(|| WorkloadError::InvalidState("check called before start".into()))?;
        let RunningTasks {
            mut stop,
            driver,
            unit,
        } = tasks;

        stop.stop();
        let driver_result = join_task("driver", driver);

        let (active, inactive) = {
            let oracle = self.client.oracle()?;
            (oracle.active().to_vec(), oracle.inactive().len())
        };
        info!(
            active_ranges = active.len(),
            inactive_ranges = inactive,
            "BlobGranuleRangesCheck"
        );

        // Inactive ranges are not checked: without a force purge, granules
        // can linger after unregistration.
        let check_result = checker::check_ranges(self.api.as_ref(), &active, &self.config.check_settings());
        let unit_result = match unit {
            Some(handle) => join_task("unit runner", handle),
            None => Ok(()),
        };

        for result in [driver_result, check_result, unit_result] {
            if let Err(e) = result {
                error!(client_id = self.ctx.client_id, "check failed: {e}");
                return Err(e);
            }
        }

        info!("BlobGranuleRangesCheckComplete");
        Ok(true)
    }

    /// `setup`, `start`, wait for the test duration, then `check`.
    pub fn run(&self) -> Result<bool, WorkloadError> {
        self.setup()?;
        let duration = self.start()?;
        thread::sleep(duration);
        self.check()
    }

    /// Operation counters for this client.
    pub fn metrics(&self) -> Vec<PerfMetric> {
        let c = &self.client.counters;
        vec![
            PerfMetric {
                name: "RangesRegistered",
                value: c.registered.load(Ordering::Relaxed) as f64,
            },
            PerfMetric {
                name: "RangesUnregistered",
                value: c.unregistered.load(Ordering::Relaxed) as f64,
            },
            PerfMetric {
                name: "ForcePurges",
                value: c.force_purges.load(Ordering::Relaxed) as f64,
            },
            PerfMetric {
                name: "UnitScenarios",
                value: c.scenarios.load(Ordering::Relaxed) as f64,
            },
        ]
    }

    /// Ranges the oracle currently believes blobbified.
    pub fn active_ranges(&self) -> Result<Vec<KeyRange>, WorkloadError> {
        Ok(self.client.oracle()?.active().to_vec())
    }

    /// Ranges the oracle believes were blobbified and then removed.
    pub fn inactive_ranges(&self) -> Result<Vec<KeyRange>, WorkloadError> {
        Ok(self.client.oracle()?.inactive().to_vec())
    }

    // --------------------------------------------------------------------------------------------
    // Internal helpers
    // --------------------------------------------------------------------------------------------

    fn spawn_driver(&self, signal: StopSignal) -> Result<TaskHandle, WorkloadError> {
        let api = Arc::clone(&self.api);
        let client = Arc::clone(&self.client);
        let mean = Duration::from_secs_f64(1.0 / f64::from(self.params.ops_per_second));
        let rng = client.fork_rng()?;
        thread::Builder::new()
            .name(format!("bgr-driver-{}", self.ctx.client_id))
            .spawn(move || workload::driver::run(api.as_ref(), &client, mean, &signal, rng))
            .map_err(|e| WorkloadError::Internal(format!("failed to spawn driver: {e}")))
    }

    fn spawn_unit_runner(&self, signal: StopSignal) -> Result<TaskHandle, WorkloadError> {
        let api = Arc::clone(&self.api);
        let client = Arc::clone(&self.client);
        let excluded = self.config.excluded_scenarios();
        let settings = self.config.check_settings();
        let delay = self.config.unit_delay;
        let rng = client.fork_rng()?;
        thread::Builder::new()
            .name(format!("bgr-unit-{}", self.ctx.client_id))
            .spawn(move || {
                workload::unit_runner::run(
                    api.as_ref(),
                    &client,
                    &excluded,
                    &settings,
                    delay,
                    &signal,
                    rng,
                )
            })
            .map_err(|e| WorkloadError::Internal(format!("failed to spawn unit runner: {e}")))
    }
}

impl<A: BlobRangeApi + 'static> Drop for BlobGranuleRangesWorkload<A> {
    fn drop(&mut self) {
        let tasks = match self.running.get_mut() {
            Ok(tasks) => tasks.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(mut tasks) = tasks {
            tasks.stop.stop();
            let _ = tasks.driver.join();
            if let Some(unit) = tasks.unit {
                let _ = unit.join();
            }
        }
    }
}
