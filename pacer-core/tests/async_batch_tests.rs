//! AsyncBatcher tests

#![cfg(feature = "async")]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use pacer_core::{AsyncBatcher, AsyncBatcherOptions};

type Batches = Arc<Mutex<Vec<Vec<u32>>>>;

fn collector(options: AsyncBatcherOptions<u32, usize>) -> (AsyncBatcher<u32, usize>, Batches) {
    let batches: Batches = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&batches);
    let batcher = AsyncBatcher::new(
        move |items: Vec<u32>, _token| {
            let sink = Arc::clone(&sink);
            async move {
                let len = items.len();
                sink.lock().unwrap().push(items);
                Ok(len)
            }
        },
        options,
    );
    (batcher, batches)
}

#[tokio::test(start_paused = true)]
async fn test_wait_trigger_from_first_item() {
    let (batcher, batches) = collector(AsyncBatcherOptions::new(Duration::from_millis(100)));
    batcher.add_item(1);
    tokio::time::sleep(Duration::from_millis(60)).await;
    batcher.add_item(2);
    tokio::time::sleep(Duration::from_millis(40)).await;

    assert_eq!(*batches.lock().unwrap(), vec![vec![1, 2]]);
    let state = batcher.state();
    assert_eq!(state.execution_count, 1);
    assert_eq!(state.total_items_processed, 2);
    assert_eq!(state.last_result, Some(2));
}

#[tokio::test(start_paused = true)]
async fn test_max_size_trigger() {
    let (batcher, batches) =
        collector(AsyncBatcherOptions::new(Duration::from_secs(60)).max_size(2));
    batcher.add_item(1);
    batcher.add_item(2);
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(*batches.lock().unwrap(), vec![vec![1, 2]]);
}

#[tokio::test(start_paused = true)]
async fn test_single_flight_batches() {
    let batches: Batches = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&batches);
    let batcher: AsyncBatcher<u32, usize> = AsyncBatcher::new(
        move |items: Vec<u32>, _token| {
            let sink = Arc::clone(&sink);
            async move {
                let len = items.len();
                sink.lock().unwrap().push(items);
                tokio::time::sleep(Duration::from_millis(100)).await;
                Ok(len)
            }
        },
        AsyncBatcherOptions::new(Duration::from_secs(60)).max_size(2),
    );

    batcher.add_item(1);
    batcher.add_item(2); // first batch dispatches, takes 100ms
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(batcher.is_executing());

    // trigger while in flight: collected for the next batch
    batcher.add_item(3);
    batcher.add_item(4);
    tokio::time::sleep(Duration::from_millis(5)).await;
    assert_eq!(batches.lock().unwrap().len(), 1);

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(
        *batches.lock().unwrap(),
        vec![vec![1, 2], vec![3, 4]]
    );
    assert_eq!(batcher.state().execution_count, 2);
    assert_eq!(batcher.state().total_items_processed, 4);
}

#[tokio::test(start_paused = true)]
async fn test_flush_waits_for_in_flight_batch() {
    let batches: Batches = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&batches);
    let batcher: AsyncBatcher<u32, usize> = AsyncBatcher::new(
        move |items: Vec<u32>, _token| {
            let sink = Arc::clone(&sink);
            async move {
                let len = items.len();
                sink.lock().unwrap().push(items);
                tokio::time::sleep(Duration::from_millis(100)).await;
                Ok(len)
            }
        },
        AsyncBatcherOptions::new(Duration::from_secs(60)).max_size(2),
    );

    batcher.add_item(1);
    batcher.add_item(2);
    tokio::time::sleep(Duration::from_millis(10)).await;
    batcher.add_item(3);

    let flushed = batcher.flush().await.unwrap();
    assert_eq!(flushed, Some(1));
    assert_eq!(
        *batches.lock().unwrap(),
        vec![vec![1, 2], vec![3]]
    );
}

#[tokio::test(start_paused = true)]
async fn test_flush_empty_counts_execution() {
    let (batcher, batches) = collector(AsyncBatcherOptions::new(Duration::from_secs(60)));
    let result = batcher.flush().await.unwrap();
    assert_eq!(result, Some(0));
    assert_eq!(*batches.lock().unwrap(), vec![Vec::<u32>::new()]);
    assert_eq!(batcher.execution_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_error_routing() {
    let errors = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&errors);
    let batcher: AsyncBatcher<u32, usize> = AsyncBatcher::new(
        |_items: Vec<u32>, _token| async move { Err("sink unavailable".into()) },
        AsyncBatcherOptions::new(Duration::from_secs(60))
            .on_error(move |err| sink.lock().unwrap().push(err.to_string())),
    );
    batcher.add_item(1);
    let result = batcher.flush().await.unwrap();
    assert_eq!(result, None);
    assert_eq!(errors.lock().unwrap().len(), 1);
    let state = batcher.state();
    assert_eq!(state.error_count, 1);
    assert_eq!(state.execution_count, 0);
    // the failed batch was still consumed
    assert!(state.items.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_restored_buffer_rearms_wait() {
    let (stopped, _) = collector(
        AsyncBatcherOptions::new(Duration::from_millis(100)).started(false),
    );
    stopped.add_item(1);
    stopped.add_item(2);
    let snapshot = stopped.state();

    // the restored buffer's wait runs from construction, not from the
    // original additions
    let (restored, batches) = collector(
        AsyncBatcherOptions::new(Duration::from_millis(100)).initial_state(snapshot),
    );
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(batches.lock().unwrap().is_empty());
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(*batches.lock().unwrap(), vec![vec![1, 2]]);
    assert_eq!(restored.state().total_items_processed, 2);
}

#[tokio::test(start_paused = true)]
async fn test_restored_full_buffer_dispatches_immediately() {
    let (stopped, _) = collector(
        AsyncBatcherOptions::new(Duration::from_secs(60)).started(false),
    );
    for n in [1, 2, 3] {
        stopped.add_item(n);
    }
    let snapshot = stopped.state();

    let (restored, batches) = collector(
        AsyncBatcherOptions::new(Duration::from_secs(60))
            .max_size(3)
            .initial_state(snapshot),
    );
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(*batches.lock().unwrap(), vec![vec![1, 2, 3]]);
    assert_eq!(restored.execution_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_stopped_batcher_accumulates() {
    let (batcher, batches) = collector(
        AsyncBatcherOptions::new(Duration::from_millis(50)).started(false),
    );
    batcher.add_item(1);
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(batches.lock().unwrap().is_empty());

    batcher.start();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(*batches.lock().unwrap(), vec![vec![1]]);
}
