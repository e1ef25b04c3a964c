use crate::api::{ApiError, BlobRangeApi, PurgeKey, Version};
use crate::keys::KeyRange;
use crate::memory::{MemoryBlobStore, MemoryStoreConfig, MemoryTransaction};
use crate::workload::checker::CheckSettings;
use crate::workload::{ClientState, WorkloadParams};
use crate::WorkloadContext;
use rand::SeedableRng;
use rand::rngs::StdRng;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing_subscriber::EnvFilter;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn open_store() -> MemoryBlobStore {
    init_tracing();
    MemoryBlobStore::open(MemoryStoreConfig {
        provision_delay: Duration::from_millis(2),
        purge_delay: Duration::from_millis(1),
        transient_error_rate: 0.0,
        retry_backoff: Duration::from_micros(100),
        thread_pool_size: 2,
        seed: 11,
    })
    .expect("open")
}

/// Polls fast and gives up after ten seconds instead of hanging the test.
pub fn fast_settings() -> CheckSettings {
    CheckSettings {
        poll_interval: Duration::from_millis(2),
        timeout: Some(Duration::from_secs(10)),
    }
}

pub fn range(begin: &[u8], end: &[u8]) -> KeyRange {
    KeyRange::new(begin.to_vec(), end.to_vec()).expect("range")
}

pub fn single(key: &[u8]) -> KeyRange {
    KeyRange::single_key(key.to_vec()).expect("single key range")
}

pub fn client_state(client_id: u32, sequential: bool) -> ClientState {
    let ctx = WorkloadContext {
        client_id,
        client_count: 2,
        shared_random_number: 0,
        seed: u64::from(client_id),
    };
    let params = WorkloadParams {
        ops_per_second: 100,
        target_ranges: 1,
        sequential,
        sequential_gap: 1,
    };
    ClientState::new(&ctx, &params, StdRng::seed_from_u64(u64::from(client_id) + 1))
}

/// A misbehavior injected by [`FaultyStore`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// `blobbify` and `unblobbify` report success even when refused.
    AcceptEverything,
    /// `list_blobbified` always returns nothing.
    HideListing,
    /// `blobbify` always reports failure.
    RefuseBlobbify,
    /// `unblobbify` always reports failure.
    RefuseUnblobbify,
}

/// Memory store with one deliberate contract violation.
pub struct FaultyStore {
    pub inner: MemoryBlobStore,
    pub fault: Fault,
}

impl FaultyStore {
    pub fn new(fault: Fault) -> Self {
        Self {
            inner: open_store(),
            fault,
        }
    }
}

impl BlobRangeApi for FaultyStore {
    type Transaction = MemoryTransaction;

    fn blobbify(&self, range: &KeyRange) -> Result<bool, ApiError> {
        match self.fault {
            Fault::RefuseBlobbify => Ok(false),
            Fault::AcceptEverything => self.inner.blobbify(range).map(|_| true),
            Fault::HideListing | Fault::RefuseUnblobbify => self.inner.blobbify(range),
        }
    }

    fn unblobbify(&self, range: &KeyRange) -> Result<bool, ApiError> {
        match self.fault {
            Fault::AcceptEverything => self.inner.unblobbify(range).map(|_| true),
            Fault::RefuseUnblobbify => Ok(false),
            _ => self.inner.unblobbify(range),
        }
    }

    fn list_blobbified(&self, range: &KeyRange, limit: usize) -> Result<Vec<KeyRange>, ApiError> {
        match self.fault {
            Fault::HideListing => Ok(Vec::new()),
            _ => self.inner.list_blobbified(range, limit),
        }
    }

    fn verify_blob_range(
        &self,
        range: &KeyRange,
        version: Option<Version>,
    ) -> Result<Option<Version>, ApiError> {
        self.inner.verify_blob_range(range, version)
    }

    fn purge_blob_granules(
        &self,
        range: &KeyRange,
        version: Version,
        tenant: Option<&str>,
        force: bool,
    ) -> Result<PurgeKey, ApiError> {
        self.inner.purge_blob_granules(range, version, tenant, force)
    }

    fn wait_purge_complete(&self, key: &PurgeKey) -> Result<(), ApiError> {
        self.inner.wait_purge_complete(key)
    }

    fn create_transaction(&self) -> MemoryTransaction {
        self.inner.create_transaction()
    }
}

/// Where the oracle placed a range while the store was handling a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OracleView {
    pub in_active: bool,
    pub in_inactive: bool,
}

/// Memory store that snapshots the client's oracle from inside
/// `blobbify` and `unblobbify`.
pub struct ObservingStore {
    pub inner: MemoryBlobStore,
    pub client: Arc<ClientState>,
    pub on_blobbify: Mutex<Vec<OracleView>>,
    pub on_unblobbify: Mutex<Vec<OracleView>>,
}

impl ObservingStore {
    pub fn new(client: Arc<ClientState>) -> Self {
        Self {
            inner: open_store(),
            client,
            on_blobbify: Mutex::new(Vec::new()),
            on_unblobbify: Mutex::new(Vec::new()),
        }
    }

    fn view(&self, range: &KeyRange) -> OracleView {
        let oracle = self.client.oracle().expect("oracle");
        OracleView {
            in_active: oracle.active().contains(range),
            in_inactive: oracle.inactive().contains(range),
        }
    }
}

impl BlobRangeApi for ObservingStore {
    type Transaction = MemoryTransaction;

    fn blobbify(&self, range: &KeyRange) -> Result<bool, ApiError> {
        self.on_blobbify.lock().unwrap().push(self.view(range));
        self.inner.blobbify(range)
    }

    fn unblobbify(&self, range: &KeyRange) -> Result<bool, ApiError> {
        self.on_unblobbify.lock().unwrap().push(self.view(range));
        self.inner.unblobbify(range)
    }

    fn list_blobbified(&self, range: &KeyRange, limit: usize) -> Result<Vec<KeyRange>, ApiError> {
        self.inner.list_blobbified(range, limit)
    }

    fn verify_blob_range(
        &self,
        range: &KeyRange,
        version: Option<Version>,
    ) -> Result<Option<Version>, ApiError> {
        self.inner.verify_blob_range(range, version)
    }

    fn purge_blob_granules(
        &self,
        range: &KeyRange,
        version: Version,
        tenant: Option<&str>,
        force: bool,
    ) -> Result<PurgeKey, ApiError> {
        self.inner.purge_blob_granules(range, version, tenant, force)
    }

    fn wait_purge_complete(&self, key: &PurgeKey) -> Result<(), ApiError> {
        self.inner.wait_purge_complete(key)
    }

    fn create_transaction(&self) -> MemoryTransaction {
        self.inner.create_transaction()
    }
}
