//! Oracle bookkeeping: swap-and-pop removal and disjointness.

#[cfg(test)]
mod tests {
    use crate::workload::Oracle;
    use crate::workload::tests::helpers::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    #[test]
    fn test_take_random_on_empty_returns_none() {
        let mut oracle = Oracle::new();
        let mut rng = StdRng::seed_from_u64(1);
        assert_eq!(oracle.take_random(&mut rng), None);
    }

    /// # Scenario
    /// Register three ranges, take one, unregister it.
    ///
    /// # Expected behavior
    /// The taken range is in neither set until recorded as unregistered,
    /// then only in `inactive`.
    #[test]
    fn test_take_then_record_unregistered() {
        let mut oracle = Oracle::new();
        let mut rng = StdRng::seed_from_u64(2);
        for key in [b"R_1".as_slice(), b"R_2", b"R_3"] {
            oracle.record_registered(single(key));
        }

        let taken = oracle.take_random(&mut rng).unwrap();
        assert_eq!(oracle.active().len(), 2);
        assert!(!oracle.active().contains(&taken));
        assert!(oracle.inactive().is_empty());

        oracle.record_unregistered(taken.clone());
        assert_eq!(oracle.inactive(), &[taken][..]);
        assert!(oracle.is_disjoint());
    }

    #[test]
    fn test_take_random_drains_every_range_once() {
        let mut oracle = Oracle::new();
        let mut rng = StdRng::seed_from_u64(3);
        let keys: Vec<_> = (0..20).map(|i| single(format!("R_{i:08x}").as_bytes())).collect();
        for r in &keys {
            oracle.record_registered(r.clone());
        }

        let mut taken = Vec::new();
        while let Some(r) = oracle.take_random(&mut rng) {
            taken.push(r);
        }
        taken.sort();
        let mut expected = keys.clone();
        expected.sort();
        assert_eq!(taken, expected);
    }

    #[test]
    fn test_is_disjoint_detects_overlap() {
        let mut oracle = Oracle::new();
        oracle.record_registered(single(b"U_X"));
        oracle.record_unregistered(range(b"U_XA", b"U_XB"));
        assert!(!oracle.is_disjoint());
    }
}
