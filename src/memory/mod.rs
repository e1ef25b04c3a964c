//! # In-Memory Blob Store
//!
//! A thread-safe, in-process implementation of [`BlobRangeApi`] that models
//! the blob manager closely enough to exercise every workload invariant.
//!
//! ## Metadata model
//!
//! - **Blob ranges** — a map of disjoint `[begin, end)` registrations, each
//!   in one of three states:
//!   - `Provisioning` — registered but not yet assigned a granule;
//!   - `Active` — granules assigned, readable;
//!   - `ForcePurged` — boundaries still registered, but listed nowhere and
//!     with no granules. Only `unblobbify` clears it.
//! - **Granules** — a map of disjoint ranges covering every `Active` blob
//!   range without gaps. A freshly provisioned range has exactly one granule
//!   equal to itself; [`MemoryBlobStore::split_granule`] splits one in two.
//! - **Purges** — each purge gets a [`PurgeKey`] and completes
//!   asynchronously. A key is forgotten once a wait has observed its
//!   completion, so each key supports a single wait.
//!
//! `unblobbify` accepts any request whose intersecting registrations tile
//! it exactly, so one call may remove several adjacent regions at once.
//!
//! ## Background work
//!
//! Provisioning and purges run on a small worker pool fed through a
//! crossbeam channel. Each task carries the instant it becomes due, so a
//! queue of tasks does not accumulate delay. [`MemoryBlobStore::close`]
//! drops the sender and joins the workers after they drain the queue.
//!
//! ## Fault injection
//!
//! With [`MemoryStoreConfig::transient_error_rate`] > 0, granule reads fail
//! with [`ApiError::TransactionTooOld`] at that rate, to drive the retry
//! loop.

// ------------------------------------------------------------------------------------------------
// Unit tests
// ------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests;

// ------------------------------------------------------------------------------------------------
// Includes
// ------------------------------------------------------------------------------------------------

use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, info, trace, warn};

use crate::api::{
    ApiError, BlobRangeApi, GranuleTransaction, PurgeKey, Version, validate_blob_range,
};
use crate::keys::KeyRange;

// ------------------------------------------------------------------------------------------------
// Constants
// ------------------------------------------------------------------------------------------------

/// System-keyspace prefix under which purge intents are recorded.
const PURGE_KEY_PREFIX: &[u8] = b"\xff\x02/bgp/";

/// Upper bound on the retry backoff exponent.
const MAX_BACKOFF_SHIFT: u32 = 5;

// ------------------------------------------------------------------------------------------------
// Configuration
// ------------------------------------------------------------------------------------------------

/// Configuration for a [`MemoryBlobStore`].
#[derive(Debug, Clone)]
pub struct MemoryStoreConfig {
    /// Time between `blobbify` and the range becoming readable.
    ///
    /// Default: 20 ms.
    pub provision_delay: Duration,

    /// Time between `purge_blob_granules` and the purge completing.
    ///
    /// Default: 10 ms.
    pub purge_delay: Duration,

    /// Probability that a granule read fails with a retryable error.
    ///
    /// Default: 0.0. Must be in [0.0, 1.0).
    pub transient_error_rate: f64,

    /// Base backoff applied by `on_error` before a retry.
    ///
    /// Default: 1 ms.
    pub retry_backoff: Duration,

    /// Number of background worker threads.
    ///
    /// Default: 2. Must be ≥ 1.
    pub thread_pool_size: usize,

    /// Seed for the fault-injection RNG.
    pub seed: u64,
}

impl Default for MemoryStoreConfig {
    fn default() -> Self {
        Self {
            provision_delay: Duration::from_millis(20),
            purge_delay: Duration::from_millis(10),
            transient_error_rate: 0.0,
            retry_backoff: Duration::from_millis(1),
            thread_pool_size: 2,
            seed: 0,
        }
    }
}

impl MemoryStoreConfig {
    fn validate(&self) -> Result<(), ApiError> {
        if !(0.0..1.0).contains(&self.transient_error_rate) {
            return Err(ApiError::Internal(
                "transient_error_rate must be in [0.0, 1.0)".into(),
            ));
        }
        if self.thread_pool_size < 1 {
            return Err(ApiError::Internal("thread_pool_size must be >= 1".into()));
        }
        Ok(())
    }
}

// ------------------------------------------------------------------------------------------------
// Metadata
// ------------------------------------------------------------------------------------------------

/// Lifecycle of a registered blob range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlobRangeState {
    /// Registered, waiting for the initial granule assignment.
    Provisioning,
    /// Granules assigned and readable.
    Active,
    /// Force-purged: boundaries kept, everything else gone.
    ForcePurged,
}

#[derive(Debug, Clone)]
struct BlobRangeEntry {
    end: Vec<u8>,
    state: BlobRangeState,
    /// Distinguishes re-registrations of the same boundaries so a stale
    /// provisioning task never activates a newer registration.
    generation: u64,
    /// History below this version has been purged.
    purge_floor: Version,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PurgeState {
    Pending,
    Complete,
}

/// Snapshot of store statistics returned by [`MemoryBlobStore::stats`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryStoreStats {
    /// Registered blob ranges in any state.
    pub blob_ranges: usize,
    /// Blob ranges still waiting for provisioning.
    pub provisioning: usize,
    /// Blob ranges in the force-purged state.
    pub force_purged: usize,
    /// Granules currently assigned.
    pub granules: usize,
    /// Purges not yet complete.
    pub pending_purges: usize,
    /// Purges issued and not yet waited on, pending or complete.
    pub tracked_purges: usize,
    /// Current committed version.
    pub version: Version,
}

struct StoreState {
    version: Version,
    blob_ranges: BTreeMap<Vec<u8>, BlobRangeEntry>,
    granules: BTreeMap<Vec<u8>, Vec<u8>>,
    purges: HashMap<PurgeKey, PurgeState>,
    next_purge_id: u64,
    next_generation: u64,
    rng: StdRng,
}

impl StoreState {
    fn commit(&mut self) -> Version {
        self.version += 1;
        self.version
    }

    /// Blob range registrations intersecting `range`, in key order.
    fn intersecting_ranges(&self, range: &KeyRange) -> Vec<(KeyRange, BlobRangeState)> {
        collect_intersecting(&self.blob_ranges, range, |entry| &entry.end)
            .into_iter()
            .map(|(r, entry)| (r, entry.state))
            .collect()
    }

    /// Granules intersecting `range`, in key order.
    fn intersecting_granules(&self, range: &KeyRange) -> Vec<KeyRange> {
        collect_intersecting(&self.granules, range, |end| end)
            .into_iter()
            .map(|(r, _)| r)
            .collect()
    }

    fn remove_granules_within(&mut self, range: &KeyRange) -> usize {
        let doomed: Vec<Vec<u8>> = self
            .granules
            .range(range.begin().to_vec()..range.end().to_vec())
            .map(|(begin, _)| begin.clone())
            .collect();
        for begin in &doomed {
            self.granules.remove(begin);
        }
        doomed.len()
    }

    /// Blob range entry holding `key`, if any.
    fn entry_containing(&self, key: &[u8]) -> Option<&BlobRangeEntry> {
        self.blob_ranges
            .range::<[u8], _>((Bound::Unbounded, Bound::Included(key)))
            .next_back()
            .filter(|(_, entry)| entry.end.as_slice() > key)
            .map(|(_, entry)| entry)
    }

    /// Granule holding `key`, if any.
    fn granule_containing(&self, key: &[u8]) -> Option<(Vec<u8>, Vec<u8>)> {
        self.granules
            .range::<[u8], _>((Bound::Unbounded, Bound::Included(key)))
            .next_back()
            .filter(|(_, end)| end.as_slice() > key)
            .map(|(begin, end)| (begin.clone(), end.clone()))
    }
}

/// Walks a map of disjoint `[begin, end)` intervals keyed by begin and
/// returns those intersecting `range`.
fn collect_intersecting<'a, V>(
    map: &'a BTreeMap<Vec<u8>, V>,
    range: &KeyRange,
    end_of: impl Fn(&V) -> &Vec<u8>,
) -> Vec<(KeyRange, &'a V)> {
    let mut out = Vec::new();

    // The interval starting before `range` may still reach into it.
    if let Some((begin, value)) = map
        .range::<[u8], _>((Bound::Unbounded, Bound::Excluded(range.begin())))
        .next_back()
    {
        if end_of(value).as_slice() > range.begin() {
            if let Ok(r) = KeyRange::new(begin.clone(), end_of(value).clone()) {
                out.push((r, value));
            }
        }
    }

    for (begin, value) in map.range::<[u8], _>((
        Bound::Included(range.begin()),
        Bound::Excluded(range.end()),
    )) {
        if let Ok(r) = KeyRange::new(begin.clone(), end_of(value).clone()) {
            out.push((r, value));
        }
    }
    out
}

/// Whether the sorted, disjoint `hits` cover `range` exactly: aligned at
/// both ends with no gap in between.
fn tiles_exactly(range: &KeyRange, hits: &[(KeyRange, BlobRangeState)]) -> bool {
    let (Some((first, _)), Some((last, _))) = (hits.first(), hits.last()) else {
        return false;
    };
    first.begin() == range.begin()
        && last.end() == range.end()
        && hits.windows(2).all(|pair| pair[0].0.end() == pair[1].0.begin())
}

struct Shared {
    state: Mutex<StoreState>,
    purge_done: Condvar,
}

impl Shared {
    fn lock(&self) -> Result<MutexGuard<'_, StoreState>, ApiError> {
        self.state
            .lock()
            .map_err(|_| ApiError::Internal("Mutex poisoned".into()))
    }
}

// ------------------------------------------------------------------------------------------------
// Background worker state
// ------------------------------------------------------------------------------------------------

type Task = Box<dyn FnOnce() + Send>;

/// Holds the task sender and worker handles.
/// Taken (`Option::take`) on shutdown to ensure single cleanup.
struct BackgroundPool {
    sender: crossbeam::channel::Sender<Task>,
    workers: Vec<thread::JoinHandle<()>>,
}

// ------------------------------------------------------------------------------------------------
// MemoryBlobStore
// ------------------------------------------------------------------------------------------------

/// In-process blob range store.
///
/// `MemoryBlobStore` is `Send + Sync`; clients share it via `Arc`.
pub struct MemoryBlobStore {
    shared: Arc<Shared>,
    bg: Mutex<Option<BackgroundPool>>,
    closed: AtomicBool,
    config: MemoryStoreConfig,
}

impl std::fmt::Debug for MemoryBlobStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryBlobStore")
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl MemoryBlobStore {
    /// Creates an empty store and starts its worker pool.
    pub fn open(config: MemoryStoreConfig) -> Result<Self, ApiError> {
        config.validate()?;

        let shared = Arc::new(Shared {
            state: Mutex::new(StoreState {
                version: 1,
                blob_ranges: BTreeMap::new(),
                granules: BTreeMap::new(),
                purges: HashMap::new(),
                next_purge_id: 0,
                next_generation: 0,
                rng: StdRng::seed_from_u64(config.seed),
            }),
            purge_done: Condvar::new(),
        });

        let (sender, receiver) = crossbeam::channel::unbounded::<Task>();
        let mut workers = Vec::with_capacity(config.thread_pool_size);
        for id in 0..config.thread_pool_size {
            let rx = receiver.clone();
            let handle = thread::Builder::new()
                .name(format!("blob-store-bg-{id}"))
                .spawn(move || {
                    while let Ok(task) = rx.recv() {
                        task();
                    }
                })
                .map_err(|e| ApiError::Internal(format!("failed to spawn worker: {e}")))?;
            workers.push(handle);
        }
        drop(receiver);

        info!(pool_size = config.thread_pool_size, "memory blob store opened");

        Ok(Self {
            shared,
            bg: Mutex::new(Some(BackgroundPool { sender, workers })),
            closed: AtomicBool::new(false),
            config,
        })
    }

    /// Drains background work and shuts the store down.
    ///
    /// Subsequent operations return [`ApiError::Closed`]. Calling `close`
    /// more than once is harmless.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.shutdown_pool();
        info!("memory blob store closed");
    }

    /// Splits the granule containing `key` at `key`.
    ///
    /// Returns `Ok(false)` when no granule holds `key` or `key` already is
    /// a granule boundary.
    pub fn split_granule(&self, key: &[u8]) -> Result<bool, ApiError> {
        self.check_open()?;
        let mut state = self.shared.lock()?;
        let Some((begin, end)) = state.granule_containing(key) else {
            return Ok(false);
        };
        if begin.as_slice() == key {
            return Ok(false);
        }
        state.granules.insert(begin, key.to_vec());
        state.granules.insert(key.to_vec(), end);
        let version = state.commit();
        debug!(version, "granule split");
        Ok(true)
    }

    /// Current state of a registered blob range, looked up by exact boundaries.
    pub fn range_state(&self, range: &KeyRange) -> Result<Option<BlobRangeState>, ApiError> {
        let state = self.shared.lock()?;
        Ok(state
            .blob_ranges
            .get(range.begin())
            .filter(|entry| entry.end.as_slice() == range.end())
            .map(|entry| entry.state))
    }

    /// Returns a snapshot of store statistics.
    pub fn stats(&self) -> Result<MemoryStoreStats, ApiError> {
        let state = self.shared.lock()?;
        let count = |s: BlobRangeState| {
            state
                .blob_ranges
                .values()
                .filter(|entry| entry.state == s)
                .count()
        };
        Ok(MemoryStoreStats {
            blob_ranges: state.blob_ranges.len(),
            provisioning: count(BlobRangeState::Provisioning),
            force_purged: count(BlobRangeState::ForcePurged),
            granules: state.granules.len(),
            pending_purges: state
                .purges
                .values()
                .filter(|p| **p == PurgeState::Pending)
                .count(),
            tracked_purges: state.purges.len(),
            version: state.version,
        })
    }

    // --------------------------------------------------------------------------------------------
    // Internal helpers
    // --------------------------------------------------------------------------------------------

    fn check_open(&self) -> Result<(), ApiError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ApiError::Closed);
        }
        Ok(())
    }

    /// Queues `task` to run no earlier than `delay` from now.
    fn schedule(&self, delay: Duration, task: impl FnOnce() + Send + 'static) -> Result<(), ApiError> {
        let due = Instant::now() + delay;
        let guard = self
            .bg
            .lock()
            .map_err(|_| ApiError::Internal("Mutex poisoned".into()))?;
        let bg = guard.as_ref().ok_or(ApiError::Closed)?;
        bg.sender
            .send(Box::new(move || {
                let now = Instant::now();
                if due > now {
                    thread::sleep(due - now);
                }
                task();
            }))
            .map_err(|_| ApiError::Closed)
    }

    fn schedule_provision(&self, begin: Vec<u8>, generation: u64) -> Result<(), ApiError> {
        let shared = Arc::clone(&self.shared);
        self.schedule(self.config.provision_delay, move || {
            let Ok(mut state) = shared.lock() else {
                warn!("provisioning skipped: store lock poisoned");
                return;
            };
            let Some(entry) = state.blob_ranges.get_mut(&begin) else {
                return;
            };
            if entry.generation != generation || entry.state != BlobRangeState::Provisioning {
                return;
            }
            entry.state = BlobRangeState::Active;
            let end = entry.end.clone();
            state.granules.insert(begin, end);
            let version = state.commit();
            trace!(version, "blob range provisioned");
        })
    }

    fn schedule_purge(
        &self,
        key: PurgeKey,
        range: KeyRange,
        version: Version,
        force: bool,
    ) -> Result<(), ApiError> {
        let shared = Arc::clone(&self.shared);
        self.schedule(self.config.purge_delay, move || {
            let Ok(mut state) = shared.lock() else {
                warn!("purge skipped: store lock poisoned");
                return;
            };
            let hits = state.intersecting_ranges(&range);
            let mut removed_granules = 0;
            for (hit, _) in &hits {
                if force {
                    removed_granules += state.remove_granules_within(hit);
                }
                if let Some(entry) = state.blob_ranges.get_mut(hit.begin()) {
                    if force {
                        entry.state = BlobRangeState::ForcePurged;
                    }
                    entry.purge_floor = entry.purge_floor.max(version);
                }
            }
            state.purges.insert(key, PurgeState::Complete);
            let committed = state.commit();
            debug!(
                range = %range,
                force,
                blob_ranges = hits.len(),
                removed_granules,
                version = committed,
                "purge complete"
            );
            drop(state);
            shared.purge_done.notify_all();
        })
    }

    fn shutdown_pool(&self) {
        let pool = match self.bg.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(bg) = pool {
            drop(bg.sender);
            for worker in bg.workers {
                let _ = worker.join();
            }
        }
    }
}

impl Drop for MemoryBlobStore {
    fn drop(&mut self) {
        if !self.closed.load(Ordering::Acquire) {
            self.shutdown_pool();
        }
    }
}

// ------------------------------------------------------------------------------------------------
// BlobRangeApi
// ------------------------------------------------------------------------------------------------

impl BlobRangeApi for MemoryBlobStore {
    type Transaction = MemoryTransaction;

    fn blobbify(&self, range: &KeyRange) -> Result<bool, ApiError> {
        self.check_open()?;
        validate_blob_range(range)?;

        let mut state = self.shared.lock()?;
        let hits = state.intersecting_ranges(range);
        match hits.as_slice() {
            [] => {
                let generation = state.next_generation;
                state.next_generation += 1;
                state.blob_ranges.insert(
                    range.begin().to_vec(),
                    BlobRangeEntry {
                        end: range.end().to_vec(),
                        state: BlobRangeState::Provisioning,
                        generation,
                        purge_floor: 0,
                    },
                );
                let version = state.commit();
                drop(state);
                debug!(range = %range, version, "blobbified");
                self.schedule_provision(range.begin().to_vec(), generation)?;
                Ok(true)
            }
            [(existing, _)] if existing == range => Ok(true),
            _ => {
                debug!(range = %range, overlaps = hits.len(), "blobbify refused: misaligned");
                Ok(false)
            }
        }
    }

    fn unblobbify(&self, range: &KeyRange) -> Result<bool, ApiError> {
        self.check_open()?;
        validate_blob_range(range)?;

        let mut state = self.shared.lock()?;
        let hits = state.intersecting_ranges(range);
        if hits.is_empty() {
            return Ok(true);
        }
        if !tiles_exactly(range, &hits) {
            debug!(range = %range, overlaps = hits.len(), "unblobbify refused: misaligned");
            return Ok(false);
        }
        for (hit, _) in &hits {
            state.blob_ranges.remove(hit.begin());
        }
        state.remove_granules_within(range);
        let version = state.commit();
        debug!(range = %range, regions = hits.len(), version, "unblobbified");
        Ok(true)
    }

    fn list_blobbified(&self, range: &KeyRange, limit: usize) -> Result<Vec<KeyRange>, ApiError> {
        self.check_open()?;
        let state = self.shared.lock()?;
        Ok(state
            .intersecting_ranges(range)
            .into_iter()
            .filter(|(_, s)| *s != BlobRangeState::ForcePurged)
            .map(|(r, _)| r)
            .take(limit)
            .collect())
    }

    fn verify_blob_range(
        &self,
        range: &KeyRange,
        version: Option<Version>,
    ) -> Result<Option<Version>, ApiError> {
        self.check_open()?;
        let state = self.shared.lock()?;

        let read_version = match version {
            Some(v) if v > state.version => return Err(ApiError::FutureVersion),
            Some(v) => v,
            None => state.version,
        };

        let mut cursor = range.begin().to_vec();
        while cursor.as_slice() < range.end() {
            let Some((_, granule_end)) = state.granule_containing(&cursor) else {
                return Ok(None);
            };
            let readable = state
                .entry_containing(&cursor)
                .is_some_and(|entry| entry.purge_floor <= read_version);
            if !readable {
                return Ok(None);
            }
            cursor = granule_end;
        }
        Ok(Some(read_version))
    }

    fn purge_blob_granules(
        &self,
        range: &KeyRange,
        version: Version,
        tenant: Option<&str>,
        force: bool,
    ) -> Result<PurgeKey, ApiError> {
        self.check_open()?;
        if let Some(tenant) = tenant {
            return Err(ApiError::TenantNotFound(tenant.to_string()));
        }
        validate_blob_range(range)?;

        let key = {
            let mut state = self.shared.lock()?;
            let id = state.next_purge_id;
            state.next_purge_id += 1;
            let mut raw = PURGE_KEY_PREFIX.to_vec();
            raw.extend_from_slice(format!("{id:016x}").as_bytes());
            let key = PurgeKey(raw);
            state.purges.insert(key.clone(), PurgeState::Pending);
            key
        };
        debug!(range = %range, version, force, purge_key = %key, "purge registered");
        self.schedule_purge(key.clone(), range.clone(), version, force)?;
        Ok(key)
    }

    fn wait_purge_complete(&self, key: &PurgeKey) -> Result<(), ApiError> {
        let mut state = self.shared.lock()?;
        loop {
            let status = state.purges.get(key).copied();
            match status {
                None => return Err(ApiError::UnknownPurgeKey(key.to_string())),
                Some(PurgeState::Complete) => {
                    state.purges.remove(key);
                    return Ok(());
                }
                Some(PurgeState::Pending) => {
                    state = self
                        .shared
                        .purge_done
                        .wait(state)
                        .map_err(|_| ApiError::Internal("Mutex poisoned".into()))?;
                }
            }
        }
    }

    fn create_transaction(&self) -> MemoryTransaction {
        MemoryTransaction {
            shared: Arc::clone(&self.shared),
            error_rate: self.config.transient_error_rate,
            backoff: self.config.retry_backoff,
            retries: 0,
        }
    }
}

// ------------------------------------------------------------------------------------------------
// MemoryTransaction
// ------------------------------------------------------------------------------------------------

/// Granule-read transaction over a [`MemoryBlobStore`].
pub struct MemoryTransaction {
    shared: Arc<Shared>,
    error_rate: f64,
    backoff: Duration,
    retries: u32,
}

impl GranuleTransaction for MemoryTransaction {
    fn get_blob_granule_ranges(
        &mut self,
        range: &KeyRange,
        limit: usize,
    ) -> Result<Vec<KeyRange>, ApiError> {
        let mut state = self.shared.lock()?;
        if self.error_rate > 0.0 && state.rng.random_bool(self.error_rate) {
            return Err(ApiError::TransactionTooOld);
        }
        Ok(state
            .intersecting_granules(range)
            .into_iter()
            .take(limit)
            .collect())
    }

    fn on_error(&mut self, err: ApiError) -> Result<(), ApiError> {
        if !err.is_retryable() {
            return Err(err);
        }
        let backoff = self.backoff * (1u32 << self.retries.min(MAX_BACKOFF_SHIFT));
        self.retries += 1;
        trace!(retries = self.retries, ?backoff, error = %err, "retrying granule read");
        thread::sleep(backoff);
        Ok(())
    }

    fn reset(&mut self) {
        self.retries = 0;
    }
}
