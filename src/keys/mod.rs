//! # Keys and Ranges
//!
//! Half-open key ranges over lexicographically ordered byte strings, plus
//! the generator that hands out fresh, client-unique range boundaries.
//!
//! ## Range shape
//!
//! Every range registered by the workload starts out **single-key wide**:
//! `[k, strinc(k))`. Scenarios carve sub-ranges out of that interval by
//! appending suffixes to `k` (`k·"A"`, `k·"AF"`, `k·"0000"`, …), all of which
//! sort strictly between `k` and `strinc(k)`.
//!
//! ## Key generation
//!
//! [`KeyGenerator`] works in one of two modes:
//!
//! - **Sequential** — an `i32` counter seeded at `10_000_000 × client_id`,
//!   stepped by `sequential_gap` and rendered as eight hex digits.
//! - **Random** — a 128-bit identifier rendered as 32 hex digits. The top
//!   32 bits carry the client id and the remaining 96 are random, so two
//!   clients never produce the same key even from identical seeds.
//!
//! Callers prefix the generated key with [`DRIVER_PREFIX`] or
//! [`UNIT_PREFIX`] so driver ranges and scenario ranges never collide.

// ------------------------------------------------------------------------------------------------
// Unit tests
// ------------------------------------------------------------------------------------------------


// ------------------------------------------------------------------------------------------------
// Includes
// ------------------------------------------------------------------------------------------------

use std::fmt;

use rand::Rng;
use thiserror::Error;

// ------------------------------------------------------------------------------------------------
// Constants
// ------------------------------------------------------------------------------------------------

/// Prefix for ranges registered by the Poisson driver.
pub const DRIVER_PREFIX: &str = "R_";

/// Prefix for ranges used by the unit scenarios.
pub const UNIT_PREFIX: &str = "U_";

/// Spacing between the sequential keyspaces of consecutive clients.
pub const CLIENT_KEYSPACE_STRIDE: i32 = 10_000_000;

/// Random bits below the client id in a random-mode key.
pub const RANDOM_KEY_BITS: u32 = 96;

/// First key of the system keyspace. Blob ranges must end at or before it.
pub const SYSTEM_KEYSPACE_BEGIN: &[u8] = b"\xff";

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors produced while constructing ranges.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum KeyError {
    /// `begin >= end`.
    #[error("invalid range [{begin} - {end})")]
    InvalidRange {
        /// Printable begin key.
        begin: String,
        /// Printable end key.
        end: String,
    },

    /// The key consists only of `0xff` bytes and has no successor prefix.
    #[error("key {0} has no strict successor prefix")]
    NoSuccessor(String),
}

// ------------------------------------------------------------------------------------------------
// KeyRange
// ------------------------------------------------------------------------------------------------

/// A half-open interval `[begin, end)` with `begin < end`.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct KeyRange {
    begin: Vec<u8>,
    end: Vec<u8>,
}

impl KeyRange {
    /// Builds a range, rejecting empty or inverted intervals.
    pub fn new(begin: impl Into<Vec<u8>>, end: impl Into<Vec<u8>>) -> Result<Self, KeyError> {
        let begin = begin.into();
        let end = end.into();
        if begin >= end {
            return Err(KeyError::InvalidRange {
                begin: printable(&begin),
                end: printable(&end),
            });
        }
        Ok(Self { begin, end })
    }

    /// The range holding every key that starts with `key`: `[key, strinc(key))`.
    pub fn single_key(key: impl Into<Vec<u8>>) -> Result<Self, KeyError> {
        let begin = key.into();
        let end = strinc(&begin)?;
        Ok(Self { begin, end })
    }

    /// Inclusive lower bound.
    pub fn begin(&self) -> &[u8] {
        &self.begin
    }

    /// Exclusive upper bound.
    pub fn end(&self) -> &[u8] {
        &self.end
    }

    /// Returns `true` if the two ranges share at least one key.
    pub fn intersects(&self, other: &KeyRange) -> bool {
        self.begin < other.end && other.begin < self.end
    }

    /// Returns `true` if `other` lies entirely within `self`.
    pub fn encloses(&self, other: &KeyRange) -> bool {
        self.begin <= other.begin && self.end >= other.end
    }

    /// `[begin·suffix, end)` style helper: the key `begin` followed by `suffix`.
    pub fn begin_with_suffix(&self, suffix: &[u8]) -> Vec<u8> {
        let mut key = Vec::with_capacity(self.begin.len() + suffix.len());
        key.extend_from_slice(&self.begin);
        key.extend_from_slice(suffix);
        key
    }
}

impl fmt::Debug for KeyRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{} - {})", printable(&self.begin), printable(&self.end))
    }
}

impl fmt::Display for KeyRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

// ------------------------------------------------------------------------------------------------
// Byte-string helpers
// ------------------------------------------------------------------------------------------------

/// Smallest key greater than every key prefixed by `key`.
///
/// Trailing `0xff` bytes are stripped and the last remaining byte is
/// incremented.
pub fn strinc(key: &[u8]) -> Result<Vec<u8>, KeyError> {
    let keep = key
        .iter()
        .rposition(|&b| b != 0xff)
        .ok_or_else(|| KeyError::NoSuccessor(printable(key)))?;
    let mut out = key[..=keep].to_vec();
    out[keep] += 1;
    Ok(out)
}

/// Renders a key with printable ASCII kept as-is and everything else as `\xNN`.
pub fn printable(key: &[u8]) -> String {
    let mut out = String::with_capacity(key.len());
    for &b in key {
        if (0x20..0x7f).contains(&b) && b != b'\\' {
            out.push(b as char);
        } else {
            out.push_str(&format!("\\x{b:02x}"));
        }
    }
    out
}

// ------------------------------------------------------------------------------------------------
// KeyGenerator
// ------------------------------------------------------------------------------------------------

/// Hands out fresh keys that are unique within (and across) clients.
#[derive(Debug, Clone)]
pub struct KeyGenerator {
    client_id: u32,
    sequential: bool,
    sequential_gap: i32,
    next_key: i32,
}

impl KeyGenerator {
    /// Creates a generator for `client_id`.
    ///
    /// `sequential_gap` must be 1 or 2; anything else is clamped into that
    /// interval.
    pub fn new(client_id: i32, sequential: bool, sequential_gap: i32) -> Self {
        Self {
            client_id: client_id as u32,
            sequential,
            sequential_gap: sequential_gap.clamp(1, 2),
            next_key: CLIENT_KEYSPACE_STRIDE.wrapping_mul(client_id),
        }
    }

    /// Whether keys are produced from the counter.
    pub fn is_sequential(&self) -> bool {
        self.sequential
    }

    /// Stride between consecutive sequential keys.
    pub fn sequential_gap(&self) -> i32 {
        self.sequential_gap
    }

    /// Current counter value (the last key handed out in sequential mode).
    pub fn next_key(&self) -> i32 {
        self.next_key
    }

    /// Produces a new key without any namespace prefix.
    pub fn new_key(&mut self, rng: &mut impl Rng) -> String {
        if self.sequential {
            self.next_key = self.next_key.wrapping_add(self.sequential_gap);
            format!("{:08x}", self.next_key)
        } else {
            let id = (u128::from(self.client_id) << RANDOM_KEY_BITS)
                | (rng.random::<u128>() >> (128 - RANDOM_KEY_BITS));
            format!("{id:032x}")
        }
    }

    /// Produces a fresh single-key range whose key starts with `prefix`.
    pub fn new_range(&mut self, prefix: &str, rng: &mut impl Rng) -> Result<KeyRange, KeyError> {
        KeyRange::single_key(format!("{prefix}{}", self.new_key(rng)))
    }
}
