//! Driver operations and the paced driver loop.

#[cfg(test)]
mod tests {
    use crate::WorkloadError;
    use crate::api::{BlobRangeApi, LARGE_LIMIT};
    use crate::workload::StopSignal;
    use crate::workload::checker::check_ranges;
    use crate::workload::driver::{register_new_range, run, unregister_random_range};
    use crate::workload::tests::helpers::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;
    use std::sync::Arc;
    use std::sync::atomic::Ordering;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_register_records_after_blobbify() {
        let store = open_store();
        let client = client_state(0, true);
        let mut rng = StdRng::seed_from_u64(1);

        register_new_range(&store, &client, &mut rng).unwrap();

        let active = client.oracle().unwrap().active().to_vec();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].begin(), b"R_00000001");
        assert_eq!(store.list_blobbified(&active[0], LARGE_LIMIT).unwrap(), active);
        assert_eq!(client.counters.registered.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_unregister_on_empty_oracle() {
        let store = open_store();
        let client = client_state(0, false);
        let mut rng = StdRng::seed_from_u64(2);
        assert!(!unregister_random_range(&store, &client, &mut rng).unwrap());
    }

    /// # Scenario
    /// Register five ranges and unregister all of them, some with a force
    /// purge first.
    ///
    /// # Expected behavior
    /// The oracle moves every range to `inactive` and the store lists none
    /// of them.
    #[test]
    fn test_unregister_moves_ranges_to_inactive() {
        let store = open_store();
        let client = client_state(1, false);
        let mut rng = StdRng::seed_from_u64(3);

        for _ in 0..5 {
            register_new_range(&store, &client, &mut rng).unwrap();
        }
        check_ranges(&store, client.oracle().unwrap().active(), &fast_settings()).unwrap();

        while unregister_random_range(&store, &client, &mut rng).unwrap() {}

        let oracle = client.oracle().unwrap();
        assert!(oracle.active().is_empty());
        assert_eq!(oracle.inactive().len(), 5);
        for r in oracle.inactive() {
            assert!(store.list_blobbified(r, LARGE_LIMIT).unwrap().is_empty());
        }
        assert!(oracle.is_disjoint());
        assert_eq!(client.counters.unregistered.load(Ordering::Relaxed), 5);
    }

    #[test]
    fn test_refused_blobbify_is_contract_violation() {
        let store = FaultyStore::new(Fault::RefuseBlobbify);
        let client = client_state(0, true);
        let mut rng = StdRng::seed_from_u64(4);

        let err = register_new_range(&store, &client, &mut rng).unwrap_err();
        assert!(matches!(err, WorkloadError::Contract(_)), "{err}");
        assert!(client.oracle().unwrap().active().is_empty());
    }

    /// # Scenario
    /// Register one range, then unregister it against a store that refuses
    /// every `unblobbify`.
    ///
    /// # Expected behavior
    /// A contract violation; the range has already left `active` and never
    /// reached `inactive`.
    #[test]
    fn test_refused_unblobbify_leaves_range_untracked() {
        let store = FaultyStore::new(Fault::RefuseUnblobbify);
        let client = client_state(0, true);
        let mut rng = StdRng::seed_from_u64(6);

        register_new_range(&store, &client, &mut rng).unwrap();
        let range = client.oracle().unwrap().active()[0].clone();

        let err = unregister_random_range(&store, &client, &mut rng).unwrap_err();
        assert!(matches!(err, WorkloadError::Contract(_)), "{err}");

        let oracle = client.oracle().unwrap();
        assert!(!oracle.active().contains(&range));
        assert!(!oracle.inactive().contains(&range));
        assert_eq!(client.counters.unregistered.load(Ordering::Relaxed), 0);
    }

    /// # Scenario
    /// Register and unregister ranges through a store that inspects the
    /// oracle while each call is in flight.
    ///
    /// # Expected behavior
    /// During `blobbify` the range is in neither set; during `unblobbify`
    /// it has left `active` and is not yet in `inactive`.
    #[test]
    fn test_oracle_is_updated_around_store_calls() {
        let client = Arc::new(client_state(0, false));
        let store = ObservingStore::new(Arc::clone(&client));
        let mut rng = StdRng::seed_from_u64(8);

        for _ in 0..4 {
            register_new_range(&store, &client, &mut rng).unwrap();
        }
        while unregister_random_range(&store, &client, &mut rng).unwrap() {}

        let untracked = OracleView {
            in_active: false,
            in_inactive: false,
        };
        let on_blobbify = store.on_blobbify.lock().unwrap();
        let on_unblobbify = store.on_unblobbify.lock().unwrap();
        assert_eq!(on_blobbify.len(), 4);
        assert_eq!(on_unblobbify.len(), 4);
        assert!(on_blobbify.iter().all(|v| *v == untracked), "{on_blobbify:?}");
        assert!(on_unblobbify.iter().all(|v| *v == untracked), "{on_unblobbify:?}");
        assert_eq!(client.oracle().unwrap().inactive().len(), 4);
    }

    /// # Scenario
    /// Run the driver loop at a high rate for a short while, then stop it.
    ///
    /// # Expected behavior
    /// The loop exits cleanly, the oracle stays disjoint, and every range
    /// it believes active passes the checker.
    #[test]
    fn test_driver_loop_until_stopped() {
        let store = open_store();
        let client = client_state(0, false);
        let (mut handle, signal) = StopSignal::channel();

        thread::scope(|s| {
            let driver = s.spawn(|| {
                run(
                    &store,
                    &client,
                    Duration::from_millis(2),
                    &signal,
                    StdRng::seed_from_u64(5),
                )
            });
            thread::sleep(Duration::from_millis(200));
            handle.stop();
            driver.join().unwrap().unwrap();
        });

        let oracle = client.oracle().unwrap();
        let ops = client.counters.registered.load(Ordering::Relaxed)
            + client.counters.unregistered.load(Ordering::Relaxed);
        assert!(ops > 0);
        assert!(oracle.is_disjoint());
        check_ranges(&store, oracle.active(), &fast_settings()).unwrap();
    }
}
