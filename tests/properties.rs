//! Property tests for settlement and single-flight gating.
//!
//! ## Properties Verified
//!
//! - A store publishes exactly when the most recent distinct value has been
//!   stable for the quiet period and differs from the settled value
//! - Consecutive publications always differ
//! - Pushing the settled value again never notifies
//! - A burst of requests issued while a call runs costs at most two calls,
//!   the first and the last
//! - Drop-while-busy runs only the first request of a burst

use proptest::collection::vec;
use proptest::prelude::*;
use settle::clock::MockClock;
use settle::debounce::DebouncedStore;
use settle::flight::{FlightOptions, MockOperation, OverlapPolicy, SingleFlight, StageResult};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// (gap since previous push in ms, value)
type Timeline = Vec<(u64, u8)>;

fn arb_timeline() -> impl Strategy<Value = Timeline> {
    vec((0u64..80, 0u8..3), 1..60)
}

/// Publications a store with `quiet_ms` should make for `timeline`, as
/// (push index, value), derived straight from the settlement rule.
fn expected_publications(timeline: &Timeline, quiet_ms: u64) -> Vec<(usize, u8)> {
    let times: Vec<u64> = timeline
        .iter()
        .scan(0u64, |at, (gap, _)| {
            *at += gap;
            Some(*at)
        })
        .collect();

    let mut settled: Option<u8> = None;
    let mut published = Vec::new();
    for (i, (_, value)) in timeline.iter().enumerate() {
        // Start of the run of identical values this push belongs to.
        let mut start = i;
        while start > 0 && timeline[start - 1].1 == *value {
            start -= 1;
        }
        if start < i && times[i] - times[start] >= quiet_ms && settled != Some(*value) {
            settled = Some(*value);
            published.push((i, *value));
        }
    }
    published
}

fn run_store(
    timeline: &Timeline,
    quiet_ms: u64,
) -> (Vec<(usize, u8)>, DebouncedStore<u8>, MockClock) {
    let clock = MockClock::new();
    let mut store = DebouncedStore::new(Duration::from_millis(quiet_ms))
        .unwrap()
        .with_clock(Arc::new(clock.clone()));
    let mut published = Vec::new();
    for (i, (gap, value)) in timeline.iter().enumerate() {
        clock.advance(Duration::from_millis(*gap));
        if let Some(settled) = store.push(*value) {
            published.push((i, settled));
        }
    }
    (published, store, clock)
}

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
}

/// Issues every input before the first call can finish, then lets calls
/// through and returns (inputs the operation saw, results delivered).
fn run_burst(inputs: &[u32], policy: OverlapPolicy) -> (Vec<u32>, Vec<StageResult<u32, String>>) {
    runtime().block_on(async {
        let (op, gate) = MockOperation::<u32, u32, String>::new(|n| Ok(*n)).gated();
        let calls = op.calls();
        let stage =
            SingleFlight::with_options("burst", op, FlightOptions::default().with_policy(policy))
                .unwrap();
        let results = Arc::new(Mutex::new(Vec::new()));
        let sink = results.clone();
        stage.subscribe(move |result: &StageResult<u32, String>| {
            sink.lock().unwrap().push(result.clone())
        });

        for input in inputs {
            let _ = stage.request(*input);
        }
        gate.open(inputs.len());
        stage.wait_idle().await;

        let delivered = results.lock().unwrap().clone();
        (calls.inputs(), delivered)
    })
}

proptest! {
    /// Property: the store publishes exactly what the settlement rule says
    #[test]
    fn prop_store_matches_settlement_rule(timeline in arb_timeline(), quiet_ms in 0u64..100) {
        let (published, _, _) = run_store(&timeline, quiet_ms);
        prop_assert_eq!(published, expected_publications(&timeline, quiet_ms));
    }

    /// Property: two publications in a row are never the same value
    #[test]
    fn prop_consecutive_publications_differ(timeline in arb_timeline(), quiet_ms in 0u64..100) {
        let (published, _, _) = run_store(&timeline, quiet_ms);
        for pair in published.windows(2) {
            prop_assert_ne!(pair[0].1, pair[1].1);
        }
    }

    /// Property: re-pushing the settled value is a no-op for observers
    #[test]
    fn prop_settled_value_is_idempotent(
        timeline in arb_timeline(),
        quiet_ms in 0u64..100,
        repeats in 1usize..10,
    ) {
        let (_, mut store, clock) = run_store(&timeline, quiet_ms);
        if let Some(settled) = store.current() {
            for _ in 0..repeats {
                clock.advance(Duration::from_millis(quiet_ms + 1));
                prop_assert_eq!(store.push(settled), None);
            }
            prop_assert_eq!(store.current(), Some(settled));
        }
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Property: N overlapping requests cost at most two calls, first and last
    #[test]
    fn prop_burst_coalesces_to_first_and_last(inputs in vec(0u32..1000, 1..20)) {
        let (calls, results) = run_burst(&inputs, OverlapPolicy::Coalesce);

        prop_assert_eq!(calls.len(), inputs.len().min(2));
        prop_assert_eq!(calls[0], inputs[0]);
        prop_assert_eq!(calls.last(), inputs.last());
        // One result per call, each carrying the value of its own input.
        let expected: Vec<StageResult<u32, String>> = calls.iter().map(|n| Ok(*n)).collect();
        prop_assert_eq!(results, expected);
    }

    /// Property: drop-while-busy runs only the first request of a burst
    #[test]
    fn prop_drop_while_busy_runs_first_only(inputs in vec(0u32..1000, 1..20)) {
        let (calls, results) = run_burst(&inputs, OverlapPolicy::DropWhileBusy);

        prop_assert_eq!(calls, vec![inputs[0]]);
        prop_assert_eq!(results, vec![Ok(inputs[0])]);
    }
}
