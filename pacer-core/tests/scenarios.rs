//! End-to-end pacing scenarios with literal timings
//!
//! Synchronous primitives run against the mock clock and timer backend;
//! async ones run under paused tokio time.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use pacer_core::{
    Batcher, BatcherOptions, Clock, Debouncer, DebouncerOptions, MockClock, MockTimerBackend,
    Queuer, QueuerOptions, RateLimiter, RateLimiterOptions, Throttler, ThrottlerOptions,
    TimerBackend, WindowType,
};

fn timing() -> (Arc<MockClock>, Arc<MockTimerBackend>) {
    let clock = Arc::new(MockClock::new());
    let backend = Arc::new(MockTimerBackend::new(Arc::clone(&clock)));
    (clock, backend)
}

#[test]
fn debouncer_collapses_burst_to_one_trailing_run() {
    let (clock, backend) = timing();
    let start = clock.now();
    let runs = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&runs);
    let probe = Arc::clone(&clock);
    let debouncer = Debouncer::with_timing(
        move |arg: u32| {
            sink.lock()
                .unwrap()
                .push((probe.now().duration_since(start).as_millis() as u64, arg));
            Ok(())
        },
        DebouncerOptions::new(Duration::from_millis(100)),
        Arc::clone(&clock) as Arc<dyn Clock>,
        Arc::clone(&backend) as Arc<dyn TimerBackend>,
    );

    // calls at t = 0, 50, 80
    debouncer.maybe_execute(0).unwrap();
    backend.advance(Duration::from_millis(50));
    debouncer.maybe_execute(1).unwrap();
    backend.advance(Duration::from_millis(30));
    debouncer.maybe_execute(2).unwrap();
    backend.advance(Duration::from_millis(200));

    // one dispatch at t = 180 with the last call's args
    assert_eq!(*runs.lock().unwrap(), vec![(180, 2)]);
    assert_eq!(debouncer.execution_count(), 1);
}

#[test]
fn throttler_spaces_runs_by_wait() {
    let (clock, backend) = timing();
    let start = clock.now();
    let runs = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&runs);
    let probe = Arc::clone(&clock);
    let throttler = Throttler::with_timing(
        move |arg: u32| {
            sink.lock()
                .unwrap()
                .push((probe.now().duration_since(start).as_millis() as u64, arg));
            Ok(())
        },
        ThrottlerOptions::new(Duration::from_millis(100)),
        Arc::clone(&clock) as Arc<dyn Clock>,
        Arc::clone(&backend) as Arc<dyn TimerBackend>,
    );

    // calls at t = 0, 30, 60, 90, 120 with args 0..=4
    for arg in 0..5u32 {
        throttler.maybe_execute(arg).unwrap();
        backend.advance(Duration::from_millis(30));
    }
    backend.advance(Duration::from_millis(200));

    assert_eq!(
        *runs.lock().unwrap(),
        vec![(0, 0), (100, 3), (200, 4)]
    );
    assert_eq!(throttler.execution_count(), 3);
}

#[test]
fn sliding_rate_limiter_admits_within_window_budget() {
    let clock = Arc::new(MockClock::new());
    let admitted = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&admitted);
    let limiter = RateLimiter::with_clock(
        move |arg: u32| {
            sink.lock().unwrap().push(arg);
            Ok(())
        },
        RateLimiterOptions::new(2, Duration::from_millis(1000)).window_type(WindowType::Sliding),
        Arc::clone(&clock) as Arc<dyn Clock>,
    );

    // calls at t = 0, 100, 200, 900, 1100
    assert!(limiter.maybe_execute(0).unwrap());
    clock.advance(Duration::from_millis(100));
    assert!(limiter.maybe_execute(1).unwrap());
    clock.advance(Duration::from_millis(100));
    assert!(!limiter.maybe_execute(2).unwrap());
    clock.advance(Duration::from_millis(700));
    assert!(!limiter.maybe_execute(3).unwrap());
    clock.advance(Duration::from_millis(200));
    assert!(limiter.maybe_execute(4).unwrap());

    assert_eq!(*admitted.lock().unwrap(), vec![0, 1, 4]);
    assert_eq!(limiter.execution_count(), 3);
    assert_eq!(limiter.rejection_count(), 2);
}

#[test]
fn queuer_paces_fifo_and_rejects_past_capacity() {
    let (clock, backend) = timing();
    let start = clock.now();
    let runs = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&runs);
    let probe = Arc::clone(&clock);
    let queuer = Queuer::with_timing(
        move |item: u32| {
            sink.lock()
                .unwrap()
                .push((probe.now().duration_since(start).as_millis() as u64, item));
            Ok(())
        },
        QueuerOptions::new()
            .wait(Duration::from_millis(100))
            .max_size(3),
        Arc::clone(&clock) as Arc<dyn Clock>,
        Arc::clone(&backend) as Arc<dyn TimerBackend>,
    );

    assert!(queuer.add_item(1));
    assert!(queuer.add_item(2));
    assert!(queuer.add_item(3));
    assert!(!queuer.add_item(4));
    backend.advance(Duration::from_millis(300));

    assert_eq!(
        *runs.lock().unwrap(),
        vec![(0, 1), (100, 2), (200, 3)]
    );
    let state = queuer.state();
    assert!(state.items.is_empty());
    assert_eq!(state.execution_count, 3);
    assert_eq!(state.rejection_count, 1);
    assert!(state.is_idle);
}

#[cfg(feature = "async")]
#[tokio::test(start_paused = true)]
async fn async_queuer_bounds_concurrency_at_two() {
    use pacer_core::{AsyncQueuer, AsyncQueuerOptions};
    use std::sync::atomic::{AtomicUsize, Ordering};

    let active = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let started_at = Arc::new(Mutex::new(Vec::new()));
    let test_start = tokio::time::Instant::now();

    let active_probe = Arc::clone(&active);
    let peak_probe = Arc::clone(&peak);
    let starts = Arc::clone(&started_at);
    let queuer: AsyncQueuer<u32, u32> = AsyncQueuer::new(
        move |task: u32, _token| {
            let active = Arc::clone(&active_probe);
            let peak = Arc::clone(&peak_probe);
            let starts = Arc::clone(&starts);
            async move {
                starts
                    .lock()
                    .unwrap()
                    .push((task, test_start.elapsed().as_millis() as u64));
                let running = active.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(running, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(100)).await;
                active.fetch_sub(1, Ordering::SeqCst);
                Ok(task)
            }
        },
        AsyncQueuerOptions::new().concurrency(2),
    );

    for task in [1, 2, 3] {
        assert!(queuer.add_item(task));
    }
    tokio::time::sleep(Duration::from_millis(500)).await;

    assert_eq!(peak.load(Ordering::SeqCst), 2);
    let state = queuer.state();
    assert_eq!(state.settle_count, 3);
    assert_eq!(state.success_count, 3);
    assert!(state.active_items.is_empty());

    let starts = started_at.lock().unwrap();
    assert_eq!(starts.len(), 3);
    // tasks 1 and 2 fill both slots at t=0; task 3 waits for a settle
    assert_eq!(starts[0].1, 0);
    assert_eq!(starts[1].1, 0);
    assert!(starts[2].1 >= 100);
}

#[test]
fn batcher_dispatches_on_predicate_trigger() {
    let (_clock, backend) = timing();
    let batches = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&batches);
    let batcher: Batcher<u32, usize> = Batcher::with_timing(
        move |items: Vec<u32>| {
            let len = items.len();
            sink.lock().unwrap().push(items);
            Ok(len)
        },
        BatcherOptions::new(Duration::from_millis(3000))
            .max_size(5)
            .get_should_execute(|items: &[u32]| items.contains(&42)),
        Arc::clone(&backend) as Arc<dyn TimerBackend>,
    );

    for item in [1, 2, 3] {
        batcher.add_item(item);
    }
    backend.advance(Duration::from_millis(500));
    assert!(batches.lock().unwrap().is_empty());

    batcher.add_item(42);
    assert_eq!(*batches.lock().unwrap(), vec![vec![1, 2, 3, 42]]);
    let state = batcher.state();
    assert_eq!(state.execution_count, 1);
    assert_eq!(state.total_items_processed, 4);
}
