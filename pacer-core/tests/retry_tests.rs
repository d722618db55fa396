//! AsyncRetrier tests

#![cfg(feature = "async")]

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use pacer_core::{AsyncQueuer, AsyncQueuerOptions, AsyncRetrier, Backoff, PacerError, RetryOptions};

fn flaky(fail_first: u32) -> impl Fn(u32, tokio_util::sync::CancellationToken) -> futures::future::BoxFuture<'static, Result<u32, pacer_core::TargetError>>
       + Send
       + Sync
       + 'static {
    let failures = Arc::new(AtomicU32::new(0));
    move |arg, _token| {
        let failures = Arc::clone(&failures);
        Box::pin(async move {
            if failures.fetch_add(1, Ordering::SeqCst) < fail_first {
                Err("transient".into())
            } else {
                Ok(arg)
            }
        })
    }
}

#[tokio::test(start_paused = true)]
async fn test_succeeds_after_transient_failures() {
    let retrier = AsyncRetrier::new(
        flaky(2),
        RetryOptions::new().max_attempts(3).base_wait(Duration::from_millis(100)),
    );
    let started = tokio::time::Instant::now();
    assert_eq!(retrier.execute(7).await.unwrap(), 7);
    // exponential backoff: 100ms after attempt 1, 200ms after attempt 2
    assert_eq!(started.elapsed(), Duration::from_millis(300));
}

#[tokio::test(start_paused = true)]
async fn test_linear_backoff_timing() {
    let retrier = AsyncRetrier::new(
        flaky(2),
        RetryOptions::new()
            .max_attempts(3)
            .backoff(Backoff::Linear)
            .base_wait(Duration::from_millis(100)),
    );
    let started = tokio::time::Instant::now();
    assert_eq!(retrier.execute(7).await.unwrap(), 7);
    // linear backoff: 100ms, then 200ms
    assert_eq!(started.elapsed(), Duration::from_millis(300));
}

#[tokio::test(start_paused = true)]
async fn test_exhaustion_reports_last_error() {
    let last_errors = Arc::new(Mutex::new(Vec::new()));
    let retries = Arc::new(Mutex::new(Vec::new()));
    let last_sink = Arc::clone(&last_errors);
    let retry_sink = Arc::clone(&retries);
    let retrier: AsyncRetrier<u32, u32> = AsyncRetrier::new(
        |_arg: u32, _token| async move { Err("permanent".into()) },
        RetryOptions::new()
            .max_attempts(3)
            .base_wait(Duration::from_millis(10))
            .on_retry(move |attempt, _err| retry_sink.lock().unwrap().push(attempt))
            .on_last_error(move |err| last_sink.lock().unwrap().push(err.to_string())),
    );

    let err = retrier.execute(1).await.unwrap_err();
    match err {
        PacerError::RetryExhausted { attempts, .. } => assert_eq!(attempts, 3),
        other => panic!("expected RetryExhausted, got {other:?}"),
    }
    assert_eq!(*retries.lock().unwrap(), vec![1, 2]);
    assert_eq!(*last_errors.lock().unwrap(), vec!["permanent".to_string()]);
}

#[tokio::test(start_paused = true)]
async fn test_attempt_timeout_is_retryable() {
    let calls = Arc::new(AtomicU32::new(0));
    let probe = Arc::clone(&calls);
    let retrier: AsyncRetrier<u32, u32> = AsyncRetrier::new(
        move |arg: u32, _token| {
            let calls = Arc::clone(&probe);
            async move {
                if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    // first attempt hangs past its budget
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                }
                Ok(arg)
            }
        },
        RetryOptions::new()
            .max_attempts(2)
            .base_wait(Duration::from_millis(10))
            .max_execution_time(Duration::from_millis(100)),
    );
    assert_eq!(retrier.execute(5).await.unwrap(), 5);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn test_total_time_budget_stops_retries() {
    let retrier: AsyncRetrier<u32, u32> = AsyncRetrier::new(
        |_arg: u32, _token| async move {
            tokio::time::sleep(Duration::from_millis(80)).await;
            Err("slow failure".into())
        },
        RetryOptions::new()
            .max_attempts(10)
            .base_wait(Duration::from_millis(50))
            .max_total_execution_time(Duration::from_millis(100)),
    );
    let err = retrier.execute(1).await.unwrap_err();
    match err {
        // the second failure lands past the total budget
        PacerError::RetryExhausted { attempts, .. } => assert!(attempts <= 2),
        other => panic!("expected RetryExhausted, got {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn test_abort_suppresses_retries() {
    let calls = Arc::new(AtomicU32::new(0));
    let probe = Arc::clone(&calls);
    let retrier: Arc<AsyncRetrier<u32, u32>> = Arc::new(AsyncRetrier::new(
        move |_arg: u32, _token| {
            probe.fetch_add(1, Ordering::SeqCst);
            async move { Err("transient".into()) }
        },
        RetryOptions::new()
            .max_attempts(10)
            .base_wait(Duration::from_millis(100)),
    ));

    let aborter = Arc::clone(&retrier);
    let (outcome, _) = tokio::join!(retrier.execute(1), async move {
        tokio::time::sleep(Duration::from_millis(150)).await;
        aborter.abort();
    });
    assert!(matches!(outcome.unwrap_err(), PacerError::Aborted));
    // attempt 1 fails at t=0, attempt 2 at t=100; the abort lands during
    // the second backoff wait and no third attempt starts
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn test_retrier_composes_as_queue_target() {
    let retrier = Arc::new(AsyncRetrier::new(
        flaky(1),
        RetryOptions::new().max_attempts(2).base_wait(Duration::from_millis(10)),
    ));
    let target = retrier.target();
    let queuer: AsyncQueuer<u32, u32> = AsyncQueuer::new(
        move |item, token| (target)(item, token),
        AsyncQueuerOptions::new(),
    );
    queuer.add_item(9);
    tokio::time::sleep(Duration::from_millis(100)).await;
    let state = queuer.state();
    // the transient failure was retried inside the target
    assert_eq!(state.success_count, 1);
    assert_eq!(state.error_count, 0);
    assert_eq!(state.last_result, Some(9));
}
