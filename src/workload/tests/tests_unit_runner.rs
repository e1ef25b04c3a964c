//! Scenario selection and the unit runner loop.

#[cfg(test)]
mod tests {
    use crate::WorkloadError;
    use crate::workload::StopSignal;
    use crate::workload::scenarios::UnitScenario;
    use crate::workload::tests::helpers::*;
    use crate::workload::unit_runner::{pick_scenario, run};
    use rand::SeedableRng;
    use rand::rngs::StdRng;
    use std::collections::HashSet;
    use std::sync::atomic::Ordering;
    use std::thread;
    use std::time::Duration;

    fn default_exclusions() -> HashSet<UnitScenario> {
        UnitScenario::ALL
            .into_iter()
            .filter(UnitScenario::is_known_buggy)
            .collect()
    }

    #[test]
    fn test_pick_never_returns_excluded() {
        let excluded = default_exclusions();
        let mut rng = StdRng::seed_from_u64(1);
        let mut seen = HashSet::new();
        for _ in 0..500 {
            let s = pick_scenario(&mut rng, &excluded).unwrap();
            assert!(!excluded.contains(&s));
            seen.insert(s);
        }
        assert_eq!(seen.len(), 3);
    }

    #[test]
    fn test_pick_with_everything_excluded() {
        let excluded: HashSet<_> = UnitScenario::ALL.into_iter().collect();
        let mut rng = StdRng::seed_from_u64(2);
        let err = pick_scenario(&mut rng, &excluded).unwrap_err();
        assert!(matches!(err, WorkloadError::Internal(_)), "{err}");
    }

    /// # Scenario
    /// Run the unit runner with every scenario enabled, then stop it.
    ///
    /// # Expected behavior
    /// At least one scenario completes, the current one finishes, and the
    /// loop returns `Ok`.
    #[test]
    fn test_runner_loop_until_stopped() {
        let store = open_store();
        let client = client_state(0, true);
        let excluded = HashSet::new();
        let settings = fast_settings();
        let (mut handle, signal) = StopSignal::channel();

        thread::scope(|s| {
            let runner = s.spawn(|| {
                run(
                    &store,
                    &client,
                    &excluded,
                    &settings,
                    Duration::from_millis(1),
                    &signal,
                    StdRng::seed_from_u64(3),
                )
            });
            thread::sleep(Duration::from_millis(300));
            handle.stop();
            runner.join().unwrap().unwrap();
        });

        assert!(client.counters.scenarios.load(Ordering::Relaxed) >= 1);
        assert!(client.oracle().unwrap().active().is_empty());
    }
}
