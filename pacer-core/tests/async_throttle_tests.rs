//! AsyncThrottler tests

#![cfg(feature = "async")]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use pacer_core::{AsyncThrottler, AsyncThrottlerOptions};

#[tokio::test(start_paused = true)]
async fn test_leading_call_resolves_immediately() {
    let throttler: AsyncThrottler<u32, u32> = AsyncThrottler::new(
        |arg: u32, _token| async move { Ok(arg + 1) },
        AsyncThrottlerOptions::new(Duration::from_millis(100)),
    );
    let started = tokio::time::Instant::now();
    assert_eq!(throttler.maybe_execute(1).await.unwrap(), Some(2));
    assert!(started.elapsed() < Duration::from_millis(100));
    assert_eq!(throttler.execution_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_window_calls_collapse_to_trailing() {
    let runs = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&runs);
    let test_start = tokio::time::Instant::now();
    let throttler: AsyncThrottler<u32, u32> = AsyncThrottler::new(
        move |arg: u32, _token| {
            let sink = Arc::clone(&sink);
            async move {
                sink.lock()
                    .unwrap()
                    .push((test_start.elapsed().as_millis() as u64, arg));
                Ok(arg)
            }
        },
        AsyncThrottlerOptions::new(Duration::from_millis(100)),
    );

    let t = &throttler;
    let (first, second, third) = tokio::join!(t.maybe_execute(1), async {
        tokio::time::sleep(Duration::from_millis(30)).await;
        t.maybe_execute(2).await
    }, async {
        tokio::time::sleep(Duration::from_millis(60)).await;
        t.maybe_execute(3).await
    });

    assert_eq!(first.unwrap(), Some(1));
    // the t=30 caller was superseded by the t=60 caller
    assert_eq!(second.unwrap(), None);
    assert_eq!(third.unwrap(), Some(3));
    assert_eq!(*runs.lock().unwrap(), vec![(0, 1), (100, 3)]);
}

#[tokio::test(start_paused = true)]
async fn test_single_flight_delays_next_schedule() {
    let in_flight = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let active = Arc::clone(&in_flight);
    let peak_probe = Arc::clone(&peak);
    let throttler: AsyncThrottler<u32, u32> = AsyncThrottler::new(
        move |arg: u32, _token| {
            let active = Arc::clone(&active);
            let peak = Arc::clone(&peak_probe);
            async move {
                let running = active.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(running, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(250)).await;
                active.fetch_sub(1, Ordering::SeqCst);
                Ok(arg)
            }
        },
        AsyncThrottlerOptions::new(Duration::from_millis(100)),
    );

    let t = &throttler;
    let (first, second) = tokio::join!(t.maybe_execute(1), async {
        // arrives while the leading execution is still running
        tokio::time::sleep(Duration::from_millis(50)).await;
        t.maybe_execute(2).await
    });
    assert_eq!(first.unwrap(), Some(1));
    assert_eq!(second.unwrap(), Some(2));
    assert_eq!(peak.load(Ordering::SeqCst), 1);
    assert_eq!(throttler.state().settle_count, 2);
}

#[tokio::test(start_paused = true)]
async fn test_trailing_only_defers_first_call() {
    let throttler: AsyncThrottler<u32, u32> = AsyncThrottler::new(
        |arg: u32, _token| async move { Ok(arg) },
        AsyncThrottlerOptions::new(Duration::from_millis(100)).leading(false),
    );
    let started = tokio::time::Instant::now();
    assert_eq!(throttler.maybe_execute(9).await.unwrap(), Some(9));
    assert_eq!(started.elapsed(), Duration::from_millis(100));
}

#[tokio::test(start_paused = true)]
async fn test_leading_only_drops_window_calls() {
    let throttler: AsyncThrottler<u32, u32> = AsyncThrottler::new(
        |arg: u32, _token| async move { Ok(arg) },
        AsyncThrottlerOptions::new(Duration::from_millis(100)).trailing(false),
    );
    assert_eq!(throttler.maybe_execute(1).await.unwrap(), Some(1));
    assert_eq!(throttler.maybe_execute(2).await.unwrap(), None);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(throttler.maybe_execute(3).await.unwrap(), Some(3));
    assert_eq!(throttler.execution_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_cancel_drops_trailing() {
    let throttler: AsyncThrottler<u32, u32> = AsyncThrottler::new(
        |arg: u32, _token| async move { Ok(arg) },
        AsyncThrottlerOptions::new(Duration::from_millis(100)),
    );
    let t = &throttler;
    let (_, pending, _) = tokio::join!(t.maybe_execute(1), async {
        tokio::time::sleep(Duration::from_millis(20)).await;
        t.maybe_execute(2).await
    }, async {
        tokio::time::sleep(Duration::from_millis(40)).await;
        t.cancel();
    });
    assert_eq!(pending.unwrap(), None);
    assert_eq!(throttler.execution_count(), 1);
    assert_eq!(throttler.state().last_args, None);
}

#[tokio::test(start_paused = true)]
async fn test_error_routing_matches_policy() {
    let throttler: AsyncThrottler<u32, u32> = AsyncThrottler::new(
        |_arg: u32, _token| async move { Err("flaky".into()) },
        AsyncThrottlerOptions::new(Duration::from_millis(100)).throw_on_error(false),
    );
    assert_eq!(throttler.maybe_execute(1).await.unwrap(), None);
    let state = throttler.state();
    assert_eq!(state.error_count, 1);
    assert_eq!(state.execution_count, 0);
}
