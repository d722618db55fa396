//! Asynchronous batcher
//!
//! Accumulates items like the synchronous [`Batcher`] but dispatches to a
//! promise-returning target with at most one batch in flight. Items added
//! while a batch executes collect for the next one; a trigger observed
//! mid-flight dispatches it immediately after the current batch settles.
//!
//! [`Batcher`]: super::Batcher

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::{PacerError, Result, TargetError};
use crate::options::{Adaptive, AsyncTargetFn};
use crate::store::Store;
use crate::Status;

/// Observable state of an [`AsyncBatcher`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AsyncBatcherState<T, R> {
    pub status: Status,
    pub items: Vec<T>,
    pub size: usize,
    pub is_pending: bool,
    pub is_running: bool,
    pub is_executing: bool,
    /// Dispatched batches that settled successfully
    pub execution_count: u64,
    pub error_count: u64,
    pub settle_count: u64,
    pub total_items_processed: u64,
    pub last_result: Option<R>,
}

impl<T, R> Default for AsyncBatcherState<T, R> {
    fn default() -> Self {
        Self {
            status: Status::Idle,
            items: Vec::new(),
            size: 0,
            is_pending: false,
            is_running: true,
            is_executing: false,
            execution_count: 0,
            error_count: 0,
            settle_count: 0,
            total_items_processed: 0,
            last_result: None,
        }
    }
}

/// Configuration for an [`AsyncBatcher`]
pub struct AsyncBatcherOptions<T, R> {
    pub(crate) wait: Adaptive<Duration, AsyncBatcherState<T, R>>,
    pub(crate) max_size: Adaptive<usize, AsyncBatcherState<T, R>>,
    pub(crate) started: bool,
    pub(crate) get_should_execute: Option<Arc<dyn Fn(&[T]) -> bool + Send + Sync>>,
    pub(crate) throw_on_error: Option<bool>,
    pub(crate) initial_state: Option<AsyncBatcherState<T, R>>,
    pub(crate) on_success: Option<Arc<dyn Fn(&R) + Send + Sync>>,
    pub(crate) on_error: Option<Arc<dyn Fn(&TargetError) + Send + Sync>>,
    pub(crate) on_settled: Option<Arc<dyn Fn(&AsyncBatcherState<T, R>) + Send + Sync>>,
    pub(crate) on_items_change: Option<Arc<dyn Fn(&[T]) + Send + Sync>>,
}

impl<T: Clone, R: Clone> AsyncBatcherOptions<T, R> {
    pub fn new(wait: Duration) -> Self {
        Self {
            wait: Adaptive::fixed(wait),
            max_size: Adaptive::fixed(usize::MAX),
            started: true,
            get_should_execute: None,
            throw_on_error: None,
            initial_state: None,
            on_success: None,
            on_error: None,
            on_settled: None,
            on_items_change: None,
        }
    }

    pub fn wait(mut self, wait: Duration) -> Self {
        self.wait = Adaptive::fixed(wait);
        self
    }

    pub fn wait_with<F>(mut self, f: F) -> Self
    where
        F: Fn(&AsyncBatcherState<T, R>) -> Duration + Send + Sync + 'static,
    {
        self.wait = Adaptive::computed(f);
        self
    }

    pub fn max_size(mut self, max_size: usize) -> Self {
        self.max_size = Adaptive::fixed(max_size);
        self
    }

    pub fn started(mut self, started: bool) -> Self {
        self.started = started;
        self
    }

    pub fn get_should_execute<F>(mut self, f: F) -> Self
    where
        F: Fn(&[T]) -> bool + Send + Sync + 'static,
    {
        self.get_should_execute = Some(Arc::new(f));
        self
    }

    pub fn throw_on_error(mut self, throw: bool) -> Self {
        self.throw_on_error = Some(throw);
        self
    }

    pub fn initial_state(mut self, state: AsyncBatcherState<T, R>) -> Self {
        self.initial_state = Some(state);
        self
    }

    pub fn on_success<F>(mut self, f: F) -> Self
    where
        F: Fn(&R) + Send + Sync + 'static,
    {
        self.on_success = Some(Arc::new(f));
        self
    }

    pub fn on_error<F>(mut self, f: F) -> Self
    where
        F: Fn(&TargetError) + Send + Sync + 'static,
    {
        self.on_error = Some(Arc::new(f));
        self
    }

    pub fn on_settled<F>(mut self, f: F) -> Self
    where
        F: Fn(&AsyncBatcherState<T, R>) + Send + Sync + 'static,
    {
        self.on_settled = Some(Arc::new(f));
        self
    }

    pub fn on_items_change<F>(mut self, f: F) -> Self
    where
        F: Fn(&[T]) + Send + Sync + 'static,
    {
        self.on_items_change = Some(Arc::new(f));
        self
    }
}

struct AsyncBatchCore<T, R> {
    id: String,
    store: Store<AsyncBatcherState<T, R>>,
    options: RwLock<AsyncBatcherOptions<T, R>>,
    target: AsyncTargetFn<Vec<T>, R>,
    timer_task: Mutex<Option<JoinHandle<()>>>,
    timer_gen: AtomicU64,
    /// A trigger fired while a batch was in flight
    dispatch_owed: AtomicBool,
    abort_root: Mutex<CancellationToken>,
    settled: Notify,
}

/// Batcher for promise-returning targets with at most one batch in flight
pub struct AsyncBatcher<T, R>
where
    T: Clone + Send + Sync + 'static,
    R: Clone + Send + Sync + 'static,
{
    core: Arc<AsyncBatchCore<T, R>>,
}

impl<T, R> AsyncBatcher<T, R>
where
    T: Clone + Send + Sync + 'static,
    R: Clone + Send + Sync + 'static,
{
    pub fn new<F, Fut>(target: F, options: AsyncBatcherOptions<T, R>) -> Self
    where
        F: Fn(Vec<T>, CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<R, TargetError>> + Send + 'static,
    {
        let target: AsyncTargetFn<Vec<T>, R> =
            Arc::new(move |args, token| Box::pin(target(args, token)));
        let mut initial = options.initial_state.clone().unwrap_or_default();
        initial.is_pending = false;
        initial.is_executing = false;
        initial.is_running = options.started;
        initial.size = initial.items.len();
        initial.status = Status::Idle;

        let core = Arc::new(AsyncBatchCore {
            id: format!("async-batcher-{}", Uuid::new_v4()),
            store: Store::new(initial),
            options: RwLock::new(options),
            target,
            timer_task: Mutex::new(None),
            timer_gen: AtomicU64::new(0),
            dispatch_owed: AtomicBool::new(false),
            abort_root: Mutex::new(CancellationToken::new()),
            settled: Notify::new(),
        });
        // a restored non-empty buffer restarts its wait from now
        if core.store.with(|s| s.is_running && !s.items.is_empty()) {
            core.evaluate_triggers(true);
        }
        Self { core }
    }

    /// Buffer an item and evaluate the dispatch triggers
    pub fn add_item(&self, value: T) -> bool {
        let core = &self.core;
        let on_items_change = core.options.read().unwrap().on_items_change.clone();
        let was_empty = core.store.with(|s| s.items.is_empty());
        core.store.update(|s| {
            s.items.push(value);
            s.size = s.items.len();
        });
        if let Some(hook) = on_items_change {
            hook(&core.store.with(|s| s.items.clone()));
        }
        if core.store.with(|s| s.is_running) {
            core.evaluate_triggers(was_empty);
        }
        true
    }

    /// Dispatch whatever is buffered now, including an empty batch
    ///
    /// Waits for an in-flight batch to settle first, then returns this
    /// dispatch's outcome.
    pub async fn flush(&self) -> Result<Option<R>> {
        let core = &self.core;
        loop {
            let mut notified = std::pin::pin!(core.settled.notified());
            notified.as_mut().enable();
            if !core.store.with(|s| s.is_executing) {
                break;
            }
            notified.await;
        }
        core.disarm();
        Arc::clone(core).dispatch().await
    }

    /// Resume trigger evaluation
    pub fn start(&self) {
        let core = &self.core;
        core.store.update(|s| s.is_running = true);
        if core.store.with(|s| !s.items.is_empty()) {
            core.evaluate_triggers(true);
        }
    }

    /// Pause triggers; the buffer keeps accumulating
    pub fn stop(&self) {
        let core = &self.core;
        core.disarm();
        core.dispatch_owed.store(false, Ordering::SeqCst);
        core.store.update(|s| {
            s.is_running = false;
            s.is_pending = false;
        });
    }

    /// Drop the buffer without dispatching; counters remain
    pub fn clear(&self) {
        let core = &self.core;
        core.disarm();
        core.dispatch_owed.store(false, Ordering::SeqCst);
        core.store.update(|s| {
            s.items.clear();
            s.size = 0;
            s.is_pending = false;
        });
        let on_items_change = core.options.read().unwrap().on_items_change.clone();
        if let Some(hook) = on_items_change {
            hook(&[]);
        }
    }

    /// Restore the construction-time state: empty buffer, zeroed counters
    pub fn reset(&self) {
        let core = &self.core;
        core.disarm();
        core.dispatch_owed.store(false, Ordering::SeqCst);
        let started = core.options.read().unwrap().started;
        core.store.update(|s| {
            let executing = s.is_executing;
            *s = AsyncBatcherState::default();
            s.is_executing = executing;
            s.is_running = started;
        });
    }

    /// Abort the in-flight batch through its cancellation token
    pub fn abort(&self) {
        let mut root = self.core.abort_root.lock().unwrap();
        root.cancel();
        *root = CancellationToken::new();
    }

    /// Token that fires when [`abort`](Self::abort) is called
    pub fn abort_signal(&self) -> CancellationToken {
        self.core.abort_root.lock().unwrap().child_token()
    }

    pub fn peek_all_items(&self) -> Vec<T> {
        self.core.store.with(|s| s.items.clone())
    }

    pub fn set_options(&self, patch: impl FnOnce(&mut AsyncBatcherOptions<T, R>)) {
        patch(&mut self.core.options.write().unwrap());
    }

    pub fn store(&self) -> &Store<AsyncBatcherState<T, R>> {
        &self.core.store
    }

    pub fn state(&self) -> AsyncBatcherState<T, R> {
        self.core.store.state()
    }

    pub fn size(&self) -> usize {
        self.core.store.with(|s| s.items.len())
    }

    pub fn execution_count(&self) -> u64 {
        self.core.store.with(|s| s.execution_count)
    }

    pub fn is_executing(&self) -> bool {
        self.core.store.with(|s| s.is_executing)
    }
}

impl<T, R> fmt::Debug for AsyncBatcher<T, R>
where
    T: Clone + Send + Sync + 'static,
    R: Clone + Send + Sync + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncBatcher")
            .field("id", &self.core.id)
            .field("size", &self.size())
            .field("executing", &self.is_executing())
            .finish()
    }
}

impl<T, R> Drop for AsyncBatcher<T, R>
where
    T: Clone + Send + Sync + 'static,
    R: Clone + Send + Sync + 'static,
{
    fn drop(&mut self) {
        self.core.disarm();
        self.core.abort_root.lock().unwrap().cancel();
    }
}

impl<T, R> AsyncBatchCore<T, R>
where
    T: Clone + Send + Sync + 'static,
    R: Clone + Send + Sync + 'static,
{
    fn evaluate_triggers(self: &Arc<Self>, was_empty: bool) {
        let state = self.store.state();
        let (max_size, wait, should_execute) = {
            let opts = self.options.read().unwrap();
            (
                opts.max_size.resolve(&state),
                opts.wait.resolve(&state),
                opts.get_should_execute
                    .as_ref()
                    .map(|f| f(&state.items))
                    .unwrap_or(false),
            )
        };
        let triggered = state.items.len() >= max_size || should_execute;
        if triggered {
            if state.is_executing {
                // dispatch right after the in-flight batch settles
                self.dispatch_owed.store(true, Ordering::SeqCst);
            } else {
                self.spawn_dispatch();
            }
            return;
        }
        if was_empty {
            self.arm(wait);
        }
    }

    fn arm(self: &Arc<Self>, wait: Duration) {
        let generation = self.timer_gen.fetch_add(1, Ordering::SeqCst) + 1;
        let weak = Arc::downgrade(self);
        let task = tokio::spawn(async move {
            tokio::time::sleep(wait).await;
            if let Some(core) = weak.upgrade() {
                core.on_wait_fire(generation);
            }
        });
        if let Some(old) = self.timer_task.lock().unwrap().replace(task) {
            old.abort();
        }
        self.store.update(|s| {
            s.is_pending = true;
            if !s.is_executing {
                s.status = Status::Pending;
            }
        });
    }

    fn disarm(&self) {
        self.timer_gen.fetch_add(1, Ordering::SeqCst);
        if let Some(task) = self.timer_task.lock().unwrap().take() {
            task.abort();
        }
    }

    fn on_wait_fire(self: &Arc<Self>, generation: u64) {
        if self.timer_gen.load(Ordering::SeqCst) != generation {
            return;
        }
        if !self.store.with(|s| s.is_running) {
            return;
        }
        if self.store.with(|s| s.is_executing) {
            self.dispatch_owed.store(true, Ordering::SeqCst);
        } else {
            self.spawn_dispatch();
        }
    }

    fn spawn_dispatch(self: &Arc<Self>) {
        let core = Arc::clone(self);
        tokio::spawn(async move {
            let _ = core.dispatch().await;
        });
    }

    /// Run one batch; at most one of these is in flight
    async fn dispatch(self: Arc<Self>) -> Result<Option<R>> {
        let mut already_executing = false;
        self.store.update(|s| {
            if s.is_executing {
                already_executing = true;
            } else {
                s.is_executing = true;
                s.status = Status::Executing;
            }
        });
        if already_executing {
            self.dispatch_owed.store(true, Ordering::SeqCst);
            return Ok(None);
        }
        self.disarm();

        let mut batch = Vec::new();
        self.store.update(|s| {
            batch = std::mem::take(&mut s.items);
            s.size = 0;
            s.is_pending = false;
        });
        let on_items_change = self.options.read().unwrap().on_items_change.clone();
        if let Some(hook) = on_items_change {
            hook(&[]);
        }

        let count = batch.len();
        tracing::debug!(primitive = %self.id, count, "dispatching async batch");
        let token = self.abort_root.lock().unwrap().child_token();
        let fut = (self.target)(batch, token.clone());
        let outcome = tokio::select! {
            biased;
            _ = token.cancelled() => None,
            result = fut => Some(result),
        };

        let (throw, on_success, on_error, on_settled) = {
            let opts = self.options.read().unwrap();
            (
                opts.throw_on_error.unwrap_or(opts.on_error.is_none()),
                opts.on_success.clone(),
                opts.on_error.clone(),
                opts.on_settled.clone(),
            )
        };

        let resolution = match outcome {
            Some(Ok(result)) => {
                self.store.update(|s| {
                    s.execution_count += 1;
                    s.settle_count += 1;
                    s.total_items_processed += count as u64;
                    s.last_result = Some(result.clone());
                });
                if let Some(hook) = on_success {
                    hook(&result);
                }
                Ok(Some(result))
            }
            Some(Err(source)) => {
                self.store.update(|s| {
                    s.error_count += 1;
                    s.settle_count += 1;
                    s.total_items_processed += count as u64;
                });
                if let Some(hook) = &on_error {
                    hook(&source);
                } else if !throw {
                    tracing::warn!(primitive = %self.id, error = %source, "batch target failed; error swallowed");
                }
                if throw {
                    Err(PacerError::TargetFailed { source })
                } else {
                    Ok(None)
                }
            }
            None => Err(PacerError::Aborted),
        };

        self.store.update(|s| {
            s.is_executing = false;
            s.status = Status::Settled;
        });
        if let Some(hook) = on_settled {
            hook(&self.store.state());
        }
        self.settled.notify_waiters();

        if self.dispatch_owed.swap(false, Ordering::SeqCst)
            && self.store.with(|s| s.is_running)
        {
            self.spawn_dispatch();
        }
        resolution
    }
}
