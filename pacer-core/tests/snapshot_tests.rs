//! State snapshot capture, restore, and serialization

use std::sync::Arc;
use std::time::Duration;

use pacer_core::{
    Clock, Debouncer, DebouncerOptions, MockClock, MockTimerBackend, Queuer, QueuerOptions,
    RateLimiter, RateLimiterOptions, TimerBackend,
};

fn timing() -> (Arc<MockClock>, Arc<MockTimerBackend>) {
    let clock = Arc::new(MockClock::new());
    let backend = Arc::new(MockTimerBackend::new(Arc::clone(&clock)));
    (clock, backend)
}

#[test]
fn test_debouncer_snapshot_round_trip() {
    let (clock, backend) = timing();
    let debouncer: Debouncer<u32> = Debouncer::with_timing(
        |_| Ok(()),
        DebouncerOptions::new(Duration::from_millis(50)),
        Arc::clone(&clock) as Arc<dyn Clock>,
        Arc::clone(&backend) as Arc<dyn TimerBackend>,
    );
    debouncer.maybe_execute(7).unwrap();
    backend.advance(Duration::from_millis(50));
    debouncer.maybe_execute(9).unwrap();
    backend.advance(Duration::from_millis(50));

    let snapshot = debouncer.state();
    assert_eq!(snapshot.execution_count, 2);

    let restored: Debouncer<u32> = Debouncer::with_timing(
        |_| Ok(()),
        DebouncerOptions::new(Duration::from_millis(50)).initial_state(snapshot.clone()),
        Arc::clone(&clock) as Arc<dyn Clock>,
        Arc::clone(&backend) as Arc<dyn TimerBackend>,
    );
    let state = restored.state();
    assert_eq!(state.execution_count, snapshot.execution_count);
    assert_eq!(state.last_args, snapshot.last_args);
    // timers are never restored
    assert!(!state.is_pending);
    assert_eq!(state.next_execution_time, None);
}

#[test]
fn test_rate_limiter_snapshot_keeps_counters_not_window() {
    let clock = Arc::new(MockClock::new());
    let limiter: RateLimiter<u32> = RateLimiter::with_clock(
        |_| Ok(()),
        RateLimiterOptions::new(1, Duration::from_millis(1000)),
        Arc::clone(&clock) as Arc<dyn Clock>,
    );
    assert!(limiter.maybe_execute(1).unwrap());
    assert!(!limiter.maybe_execute(2).unwrap());
    let snapshot = limiter.state();

    let restored: RateLimiter<u32> = RateLimiter::with_clock(
        |_| Ok(()),
        RateLimiterOptions::new(1, Duration::from_millis(1000)).initial_state(snapshot),
        Arc::clone(&clock) as Arc<dyn Clock>,
    );
    assert_eq!(restored.execution_count(), 1);
    assert_eq!(restored.rejection_count(), 1);
    // the window itself restarts from the current instant
    assert!(restored.maybe_execute(3).unwrap());
}

#[test]
fn test_queuer_snapshot_restores_items() {
    let (clock, backend) = timing();
    let queuer: Queuer<u32> = Queuer::with_timing(
        |_| Ok(()),
        QueuerOptions::new().started(false),
        Arc::clone(&clock) as Arc<dyn Clock>,
        Arc::clone(&backend) as Arc<dyn TimerBackend>,
    );
    for n in [1, 2, 3] {
        queuer.add_item(n);
    }
    let snapshot = queuer.state();

    let (clock2, backend2) = timing();
    let processed = Arc::new(std::sync::Mutex::new(Vec::new()));
    let sink = Arc::clone(&processed);
    let restored: Queuer<u32> = Queuer::with_timing(
        move |n: u32| {
            sink.lock().unwrap().push(n);
            Ok(())
        },
        QueuerOptions::new().initial_state(snapshot),
        Arc::clone(&clock2) as Arc<dyn Clock>,
        Arc::clone(&backend2) as Arc<dyn TimerBackend>,
    );
    assert_eq!(restored.peek_all_items(), vec![1, 2, 3]);
    // the restored queue starts processing from the current instant
    backend2.advance(Duration::ZERO);
    assert_eq!(*processed.lock().unwrap(), vec![1, 2, 3]);
}

#[test]
fn test_queuer_state_serializes() {
    let (clock, backend) = timing();
    let queuer: Queuer<String> = Queuer::with_timing(
        |_| Ok(()),
        QueuerOptions::new().started(false),
        clock as Arc<dyn Clock>,
        backend as Arc<dyn TimerBackend>,
    );
    queuer.add_item("alpha".to_string());
    queuer.add_item("beta".to_string());

    let json = serde_json::to_string(&queuer.state()).unwrap();
    let parsed: pacer_core::QueuerState<String> = serde_json::from_str(&json).unwrap();
    assert_eq!(parsed.size, 2);
    let values: Vec<&str> = parsed.items.iter().map(|i| i.value.as_str()).collect();
    assert_eq!(values, vec!["alpha", "beta"]);
    // wall-clock provenance survives the round trip
    assert_eq!(parsed.items[0].added_at, queuer.state().items[0].added_at);
}
