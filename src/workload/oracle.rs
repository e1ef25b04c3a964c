//! The client's belief about which ranges are blobbified.

use rand::Rng;

use crate::keys::KeyRange;

/// Active and inactive range sets of one client.
///
/// `active` holds ranges whose `blobbify` returned `true` and that have not
/// been picked for removal; `inactive` holds ranges whose `unblobbify`
/// returned `true`. A range being removed is in neither.
#[derive(Debug, Default, Clone)]
pub struct Oracle {
    active: Vec<KeyRange>,
    inactive: Vec<KeyRange>,
}

impl Oracle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn active(&self) -> &[KeyRange] {
        &self.active
    }

    pub fn inactive(&self) -> &[KeyRange] {
        &self.inactive
    }

    /// Records a range after its `blobbify` succeeded.
    pub fn record_registered(&mut self, range: KeyRange) {
        self.active.push(range);
    }

    /// Removes a uniformly chosen active range, before it is unregistered.
    ///
    /// Swap-and-pop: the order of `active` is not preserved.
    pub fn take_random(&mut self, rng: &mut impl Rng) -> Option<KeyRange> {
        if self.active.is_empty() {
            return None;
        }
        let idx = rng.random_range(0..self.active.len());
        Some(self.active.swap_remove(idx))
    }

    /// Records a range after its `unblobbify` succeeded.
    pub fn record_unregistered(&mut self, range: KeyRange) {
        self.inactive.push(range);
    }

    /// Whether all ranges the oracle knows about are pairwise disjoint.
    pub fn is_disjoint(&self) -> bool {
        let mut all: Vec<&KeyRange> = self.active.iter().chain(self.inactive.iter()).collect();
        all.sort();
        all.windows(2).all(|pair| !pair[0].intersects(pair[1]))
    }
}
