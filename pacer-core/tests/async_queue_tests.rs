//! AsyncQueuer tests

#![cfg(feature = "async")]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use pacer_core::{AsyncQueuer, AsyncQueuerOptions, Position};

fn echo_queuer(options: AsyncQueuerOptions<u32, u32>) -> (AsyncQueuer<u32, u32>, Arc<Mutex<Vec<u32>>>) {
    let processed = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&processed);
    let queuer = AsyncQueuer::new(
        move |item: u32, _token| {
            let sink = Arc::clone(&sink);
            async move {
                sink.lock().unwrap().push(item);
                Ok(item)
            }
        },
        options,
    );
    (queuer, processed)
}

#[tokio::test(start_paused = true)]
async fn test_fifo_processing() {
    let (queuer, processed) = echo_queuer(AsyncQueuerOptions::new());
    for n in [1, 2, 3] {
        assert!(queuer.add_item(n));
    }
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(*processed.lock().unwrap(), vec![1, 2, 3]);
    let state = queuer.state();
    assert!(state.is_idle);
    assert_eq!(state.success_count, 3);
    assert_eq!(state.last_result, Some(3));
}

#[tokio::test(start_paused = true)]
async fn test_wait_paces_dispatch_starts() {
    let starts = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&starts);
    let test_start = tokio::time::Instant::now();
    let queuer: AsyncQueuer<u32, u32> = AsyncQueuer::new(
        move |item: u32, _token| {
            let sink = Arc::clone(&sink);
            async move {
                sink.lock()
                    .unwrap()
                    .push((test_start.elapsed().as_millis() as u64, item));
                Ok(item)
            }
        },
        AsyncQueuerOptions::new().wait(Duration::from_millis(100)),
    );
    for n in [1, 2, 3] {
        queuer.add_item(n);
    }
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(
        *starts.lock().unwrap(),
        vec![(0, 1), (100, 2), (200, 3)]
    );
}

#[tokio::test(start_paused = true)]
async fn test_concurrency_shrink_gates_new_dispatches() {
    let active = Arc::new(AtomicUsize::new(0));
    let peak_after_shrink = Arc::new(AtomicUsize::new(0));
    let shrunk = Arc::new(AtomicUsize::new(0));

    let active_probe = Arc::clone(&active);
    let peak_probe = Arc::clone(&peak_after_shrink);
    let shrunk_probe = Arc::clone(&shrunk);
    let queuer: AsyncQueuer<u32, u32> = AsyncQueuer::new(
        move |item: u32, _token| {
            let active = Arc::clone(&active_probe);
            let peak = Arc::clone(&peak_probe);
            let shrunk = Arc::clone(&shrunk_probe);
            async move {
                let running = active.fetch_add(1, Ordering::SeqCst) + 1;
                if shrunk.load(Ordering::SeqCst) == 1 {
                    peak.fetch_max(running, Ordering::SeqCst);
                }
                tokio::time::sleep(Duration::from_millis(100)).await;
                active.fetch_sub(1, Ordering::SeqCst);
                Ok(item)
            }
        },
        AsyncQueuerOptions::new().concurrency(3),
    );

    for n in 1..=6u32 {
        queuer.add_item(n);
    }
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(queuer.active_count(), 3);

    shrunk.store(1, Ordering::SeqCst);
    queuer.set_options(|o| *o = std::mem::replace(o, AsyncQueuerOptions::new()).concurrency(1));
    tokio::time::sleep(Duration::from_millis(600)).await;

    // already-active work settled; new dispatches never exceeded one
    assert_eq!(peak_after_shrink.load(Ordering::SeqCst), 1);
    assert_eq!(queuer.state().success_count, 6);
}

#[tokio::test(start_paused = true)]
async fn test_abort_frees_slots_without_error_counts() {
    let queuer: AsyncQueuer<u32, u32> = AsyncQueuer::new(
        |item: u32, token| async move {
            tokio::select! {
                _ = token.cancelled() => Err("cancelled".into()),
                _ = tokio::time::sleep(Duration::from_secs(3600)) => Ok(item),
            }
        },
        AsyncQueuerOptions::new().concurrency(2),
    );
    queuer.add_item(1);
    queuer.add_item(2);
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(queuer.active_count(), 2);

    queuer.abort();
    tokio::time::sleep(Duration::from_millis(10)).await;
    let state = queuer.state();
    assert!(state.active_items.is_empty());
    assert_eq!(state.error_count, 0);
    assert_eq!(state.settle_count, 0);
}

#[tokio::test(start_paused = true)]
async fn test_flush_bypasses_wait_and_concurrency() {
    let (queuer, processed) = echo_queuer(
        AsyncQueuerOptions::new()
            .wait(Duration::from_secs(60))
            .started(false),
    );
    for n in [1, 2, 3, 4] {
        queuer.add_item(n);
    }
    let flushed = queuer.flush(Some(3), None).await.unwrap();
    assert_eq!(flushed, 3);
    assert_eq!(processed.lock().unwrap().len(), 3);
    assert_eq!(queuer.size(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_flush_as_batch_runs_once() {
    let (queuer, _processed) = echo_queuer(AsyncQueuerOptions::new().started(false));
    for n in [1, 2, 3] {
        queuer.add_item(n);
    }
    let batches = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&batches);
    let count = queuer
        .flush_as_batch(move |values| {
            let sink = Arc::clone(&sink);
            async move {
                sink.lock().unwrap().push(values);
                Ok(())
            }
        })
        .await
        .unwrap();
    assert_eq!(count, 3);
    assert_eq!(*batches.lock().unwrap(), vec![vec![1, 2, 3]]);
    assert_eq!(queuer.state().total_items_processed, 3);
}

#[tokio::test(start_paused = true)]
async fn test_expired_items_are_dropped() {
    let expired = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&expired);
    let queuer: AsyncQueuer<u32, u32> = AsyncQueuer::new(
        |item: u32, _token| async move { Ok(item) },
        AsyncQueuerOptions::new()
            .started(false)
            .expiration_duration(Duration::from_millis(50))
            .on_expire(move |item: &u32| sink.lock().unwrap().push(*item)),
    );
    queuer.add_item(1);
    tokio::time::sleep(Duration::from_millis(100)).await;
    queuer.start();
    tokio::time::sleep(Duration::from_millis(10)).await;

    assert_eq!(*expired.lock().unwrap(), vec![1]);
    let state = queuer.state();
    assert_eq!(state.expiration_count, 1);
    assert_eq!(state.success_count, 0);
}

#[tokio::test(start_paused = true)]
async fn test_priority_and_direction_override() {
    let (queuer, _processed) = echo_queuer(
        AsyncQueuerOptions::new()
            .started(false)
            .get_priority(|n: &u32| *n as i64),
    );
    for n in [3, 9, 5] {
        queuer.add_item(n);
    }
    assert_eq!(queuer.peek_all_items(), vec![9, 5, 3]);
    assert_eq!(queuer.peek_next_item(), Some(9));

    let (fifo, _) = echo_queuer(AsyncQueuerOptions::new().started(false));
    for n in [1, 2, 3] {
        fifo.add_item(n);
    }
    assert_eq!(fifo.get_next_item(Some(Position::Back)), Some(3));
    assert_eq!(fifo.get_next_item(None), Some(1));
}

#[tokio::test(start_paused = true)]
async fn test_initial_items_dispatch_from_construction() {
    let (queuer, processed) = echo_queuer(AsyncQueuerOptions::new().initial_items(vec![4, 5]));
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(*processed.lock().unwrap(), vec![4, 5]);
    let state = queuer.state();
    assert_eq!(state.success_count, 2);
    assert!(state.is_idle);
}

#[tokio::test(start_paused = true)]
async fn test_snapshot_restores_and_dispatches_items() {
    let (stopped, _) = echo_queuer(AsyncQueuerOptions::new().started(false));
    for n in [1, 2, 3] {
        stopped.add_item(n);
    }
    let snapshot = stopped.state();

    // the restored queue starts processing from the current instant
    let (restored, processed) = {
        let processed = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&processed);
        let queuer: AsyncQueuer<u32, u32> = AsyncQueuer::new(
            move |item: u32, _token| {
                let sink = Arc::clone(&sink);
                async move {
                    sink.lock().unwrap().push(item);
                    Ok(item)
                }
            },
            AsyncQueuerOptions::new().initial_state(snapshot),
        );
        (queuer, processed)
    };
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(*processed.lock().unwrap(), vec![1, 2, 3]);
    assert!(restored.state().is_idle);
}

#[tokio::test(start_paused = true)]
async fn test_capacity_rejection() {
    let (queuer, _processed) = echo_queuer(
        AsyncQueuerOptions::new().started(false).max_size(2),
    );
    assert!(queuer.add_item(1));
    assert!(queuer.add_item(2));
    assert!(!queuer.add_item(3));
    assert_eq!(queuer.rejection_count(), 1);
    assert!(queuer.state().is_full);
}
