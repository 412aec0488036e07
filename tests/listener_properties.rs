//! Property tests over listener registration, disposal, and op sequences.

#[macro_use]
mod common;

use common::*;
use jobtree::{Cause, Job};
use proptest::prelude::*;

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Every registered handler fires on cancellation iff it was not
    /// disposed first, regardless of the dispose pattern.
    #[test]
    fn disposed_handlers_never_fire(mask in proptest::collection::vec(any::<bool>(), 1..40)) {
        init_test_logging();
        let job = Job::new(None);
        let probes: Vec<_> = mask.iter().map(|_| HandlerProbe::new()).collect();
        let registrations: Vec<_> = probes
            .iter()
            .map(|probe| job.invoke_on_completion(probe.handler()))
            .collect();

        for (registration, disposed) in registrations.iter().zip(&mask) {
            if *disposed {
                registration.dispose();
            }
        }
        job.cancel(None);

        for (probe, disposed) in probes.iter().zip(&mask) {
            prop_assert_eq!(probe.hits(), usize::from(!*disposed));
        }
    }

    /// Surviving handlers observe their original registration order.
    #[test]
    fn surviving_handlers_keep_registration_order(
        mask in proptest::collection::vec(any::<bool>(), 1..40)
    ) {
        init_test_logging();
        let job = Job::new(None);
        let order = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
        let registrations: Vec<_> = (0..mask.len())
            .map(|i| {
                let order = std::sync::Arc::clone(&order);
                job.invoke_on_completion(move |_| order.lock().unwrap().push(i))
            })
            .collect();

        for (registration, disposed) in registrations.iter().zip(&mask) {
            if *disposed {
                registration.dispose();
            }
        }
        job.complete();

        let expected: Vec<usize> = mask
            .iter()
            .enumerate()
            .filter(|(_, disposed)| !**disposed)
            .map(|(i, _)| i)
            .collect();
        prop_assert_eq!(order.lock().unwrap().clone(), expected);
    }

    /// Any sequence of start/cancel/complete calls leaves the job in a
    /// consistent state, and the first terminal state is final.
    #[test]
    fn op_sequences_preserve_state_invariants(ops in proptest::collection::vec(0..3u8, 1..12)) {
        init_test_logging();
        let job = Job::with_hooks(None, RecordingHooks::completing_on_cancel(), false);
        let mut first_terminal: Option<Option<Cause>> = None;

        for op in ops {
            match op {
                0 => {
                    job.start();
                }
                1 => job.cancel(None),
                _ => {
                    job.complete();
                }
            }

            // Status predicates always agree with each other.
            if job.is_completed() {
                let terminal = job.terminal().expect("completed implies terminal");
                prop_assert!(!job.is_active());
                prop_assert_eq!(job.is_cancelled(), terminal.is_exceptional());
                let cause = terminal.cause().cloned();
                match &first_terminal {
                    None => first_terminal = Some(cause),
                    Some(original) => {
                        // Terminal state never changes again.
                        match (original, &cause) {
                            (None, None) => {}
                            (Some(a), Some(b)) => prop_assert!(a.same(b)),
                            _ => prop_assert!(false, "terminal state changed"),
                        }
                    }
                }
            } else {
                prop_assert!(job.terminal().is_none());
            }
        }
    }
}
