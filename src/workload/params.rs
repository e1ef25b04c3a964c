//! Parameters derived once per client from the configuration, the harness
//! context and the client's random stream.

use rand::Rng;

use super::random_exp;
use crate::{WorkloadConfig, WorkloadContext};

/// Default `ops_per_second` draw is uniform in `[1, OPS_DRAW_END)`.
const OPS_DRAW_END: u32 = 100;

/// Derived per-client settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkloadParams {
    /// Mean driver operations per second for this client, at least 1.
    pub ops_per_second: u32,
    /// Ranges registered during setup, at least 1.
    pub target_ranges: usize,
    /// Key generation mode.
    pub sequential: bool,
    /// Stride of the sequential counter: 1 or 2.
    pub sequential_gap: i32,
}

impl WorkloadParams {
    /// Derives the parameters.
    ///
    /// Draws from `rng` in a fixed order (ops rate if unset, then the
    /// range-count exponent, then the jitter factor) so equal seeds give
    /// equal parameters. `sequential` and `sequential_gap` come from the
    /// shared random number, so every client agrees on them.
    pub fn derive(ctx: &WorkloadContext, config: &WorkloadConfig, rng: &mut impl Rng) -> Self {
        let client_count = ctx.client_count.max(1);

        let ops = config
            .ops_per_second
            .unwrap_or_else(|| rng.random_range(1..OPS_DRAW_END));
        let ops_per_second = (ops / client_count).max(1);

        let mut shared = ctx.shared_random_number;
        let base = random_exp(rng, 1, 1 + shared % 10) as f64;
        let jitter = rng.random_range(0.8..1.2);
        let target_ranges = ((base * jitter / f64::from(client_count)).round() as usize).max(1);

        shared /= 10;
        let sequential = shared % 2 != 0;
        shared /= 2;
        let sequential_gap = 1 + (shared % 2) as i32;

        Self {
            ops_per_second,
            target_ranges,
            sequential,
            sequential_gap,
        }
    }
}
