//! # Blob Range API
//!
//! The contract the workload consumes from the database. It mirrors the
//! blob range management surface of the client library:
//!
//! | operation | result |
//! |---|---|
//! | [`BlobRangeApi::blobbify`] | `true` on success or exact-match re-registration |
//! | [`BlobRangeApi::unblobbify`] | `true` when registrations tile the range exactly, or nothing intersects |
//! | [`BlobRangeApi::list_blobbified`] | intersecting blob ranges, unclipped |
//! | [`GranuleTransaction::get_blob_granule_ranges`] | intersecting granules, unclipped |
//! | [`BlobRangeApi::verify_blob_range`] | a readable version, or `None` |
//! | [`BlobRangeApi::purge_blob_granules`] | an opaque [`PurgeKey`] |
//! | [`BlobRangeApi::wait_purge_complete`] | blocks until the purge is done |
//!
//! `blobbify` and `unblobbify` are **alignment-strict**: a request that
//! overlaps an existing blob range without matching its boundaries exactly
//! is refused with `Ok(false)`.
//!
//! Granule reads are transactional and can fail with retryable errors; use
//! [`read_granules`] to run them under the standard `on_error` retry loop.

use thiserror::Error;
use tracing::debug;

use crate::keys::{KeyRange, SYSTEM_KEYSPACE_BEGIN, printable};

// ------------------------------------------------------------------------------------------------
// Versions and purge keys
// ------------------------------------------------------------------------------------------------

/// A commit version of the database.
pub type Version = i64;

/// Raw sentinel meaning "not readable at any version".
pub const INVALID_VERSION: Version = -1;

/// Row limit large enough to return every range a test ever creates.
pub const LARGE_LIMIT: usize = 1_000_000;

/// Converts a raw version that may carry the [`INVALID_VERSION`] sentinel.
pub fn version_from_raw(raw: Version) -> Option<Version> {
    (raw != INVALID_VERSION).then_some(raw)
}

/// Opaque handle returned by [`BlobRangeApi::purge_blob_granules`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PurgeKey(pub Vec<u8>);

impl std::fmt::Display for PurgeKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&printable(&self.0))
    }
}

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors surfaced by a [`BlobRangeApi`] implementation.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ApiError {
    /// The transaction's read version is too old; retry with a new one.
    #[error("transaction too old")]
    TransactionTooOld,

    /// The requested version is not yet readable.
    #[error("future version")]
    FutureVersion,

    /// A storage process is lagging; retry later.
    #[error("process behind")]
    ProcessBehind,

    /// The range is empty or inverted.
    #[error("invalid range: {0}")]
    InvalidRange(String),

    /// The range reaches into the system keyspace.
    #[error("cannot blobbify system keyspace: {0}")]
    SystemKeyspace(String),

    /// Unknown tenant name.
    #[error("tenant not found: {0}")]
    TenantNotFound(String),

    /// The purge key was never issued by this database.
    #[error("unknown purge key: {0}")]
    UnknownPurgeKey(String),

    /// The database handle has been shut down.
    #[error("database is closed")]
    Closed,

    /// Internal invariant violation (poisoned lock, etc.).
    #[error("internal error: {0}")]
    Internal(String),
}

impl ApiError {
    /// Whether the standard retry loop should try the operation again.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ApiError::TransactionTooOld | ApiError::FutureVersion | ApiError::ProcessBehind
        )
    }
}

/// Rejects ranges a blob range command may not touch.
pub fn validate_blob_range(range: &KeyRange) -> Result<(), ApiError> {
    if range.end() > SYSTEM_KEYSPACE_BEGIN {
        return Err(ApiError::SystemKeyspace(range.to_string()));
    }
    Ok(())
}

// ------------------------------------------------------------------------------------------------
// Traits
// ------------------------------------------------------------------------------------------------

/// A transaction that can read the granule mapping.
pub trait GranuleTransaction {
    /// Granules intersecting `range`, ordered by begin key, unclipped, at
    /// most `limit` of them.
    fn get_blob_granule_ranges(
        &mut self,
        range: &KeyRange,
        limit: usize,
    ) -> Result<Vec<KeyRange>, ApiError>;

    /// Decides what to do with an error from a previous attempt.
    ///
    /// Returns `Ok(())` after resetting (and possibly backing off) when the
    /// error is retryable, or hands the error back otherwise.
    fn on_error(&mut self, err: ApiError) -> Result<(), ApiError>;

    /// Discards any state and starts over with a fresh read version.
    fn reset(&mut self);
}

/// Blob range management surface of a database handle.
///
/// Implementations must be thread-safe: the driver, the unit runner and
/// the checker call in concurrently through a shared handle.
pub trait BlobRangeApi: Send + Sync {
    /// Transaction type used for granule reads.
    type Transaction: GranuleTransaction;

    /// Registers `range` for blob materialization.
    fn blobbify(&self, range: &KeyRange) -> Result<bool, ApiError>;

    /// Unregisters every region inside `range`.
    ///
    /// Succeeds when the intersecting registrations cover `range` exactly
    /// (one region or several adjacent ones), or when none intersect.
    fn unblobbify(&self, range: &KeyRange) -> Result<bool, ApiError>;

    /// Blob ranges intersecting `range`, ordered, unclipped.
    fn list_blobbified(&self, range: &KeyRange, limit: usize) -> Result<Vec<KeyRange>, ApiError>;

    /// Version at which `range` is fully readable from blob storage, or
    /// `None` if it is not.
    fn verify_blob_range(
        &self,
        range: &KeyRange,
        version: Option<Version>,
    ) -> Result<Option<Version>, ApiError>;

    /// Registers a purge of granule history below `version`.
    ///
    /// With `force`, the range's blob metadata is removed entirely.
    fn purge_blob_granules(
        &self,
        range: &KeyRange,
        version: Version,
        tenant: Option<&str>,
        force: bool,
    ) -> Result<PurgeKey, ApiError>;

    /// Blocks until the purge identified by `key` has been applied.
    fn wait_purge_complete(&self, key: &PurgeKey) -> Result<(), ApiError>;

    /// Opens a transaction for granule reads.
    fn create_transaction(&self) -> Self::Transaction;
}

// ------------------------------------------------------------------------------------------------
// Retry loop
// ------------------------------------------------------------------------------------------------

/// Reads the granule mapping for `range`, retrying through `on_error`.
///
/// The loop ends on the first successful read or the first error that
/// `on_error` refuses to retry.
pub fn read_granules<A: BlobRangeApi + ?Sized>(
    api: &A,
    range: &KeyRange,
    limit: usize,
) -> Result<Vec<KeyRange>, ApiError> {
    read_granules_with(&mut api.create_transaction(), range, limit)
}

/// Like [`read_granules`], but reuses `tr`, resetting it first.
pub fn read_granules_with<T: GranuleTransaction + ?Sized>(
    tr: &mut T,
    range: &KeyRange,
    limit: usize,
) -> Result<Vec<KeyRange>, ApiError> {
    tr.reset();
    let mut attempts = 0u32;
    loop {
        match tr.get_blob_granule_ranges(range, limit) {
            Ok(granules) => return Ok(granules),
            Err(e) => {
                attempts += 1;
                debug!(range = %range, attempts, error = %e, "granule read failed");
                tr.on_error(e)?;
            }
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Unit tests
// ------------------------------------------------------------------------------------------------
