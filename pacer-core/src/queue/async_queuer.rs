//! Asynchronous queuer
//!
//! Dispatches buffered items to a promise-returning target with a bounded
//! number of in-flight executions. The concurrency bound may be computed
//! from the current state and is re-evaluated whenever a slot frees or an
//! item is added; shrinking it mid-run only gates new dispatches, work
//! already in flight settles normally. Aborting cancels the token handed
//! to every in-flight execution without retracting side effects already
//! issued.
//!
//! All methods that dispatch (`add_item`, `start`, `flush`) must run
//! inside a tokio runtime, as must construction with a non-empty buffer
//! (`initial_items`, or a restored snapshot with items) on a started
//! queue.

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use chrono::Utc;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::{PacerError, Result, TargetError};
use crate::options::{Adaptive, AsyncTargetFn};
use crate::queue::{insert_item, peek_item, take_item, Position, QueueItem};
use crate::store::Store;
use crate::timing::{Clock, TokioClock};
use crate::Status;

/// Observable state of an [`AsyncQueuer`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AsyncQueuerState<T, R> {
    pub status: Status,
    pub items: Vec<QueueItem<T>>,
    /// Items currently executing
    pub active_items: Vec<QueueItem<T>>,
    pub size: usize,
    pub is_empty: bool,
    pub is_full: bool,
    pub is_running: bool,
    pub is_idle: bool,
    /// Dispatched items whose target settled successfully
    pub execution_count: u64,
    pub success_count: u64,
    pub error_count: u64,
    pub settle_count: u64,
    pub rejection_count: u64,
    pub expiration_count: u64,
    pub total_items_processed: u64,
    pub last_result: Option<R>,
}

impl<T, R> Default for AsyncQueuerState<T, R> {
    fn default() -> Self {
        Self {
            status: Status::Idle,
            items: Vec::new(),
            active_items: Vec::new(),
            size: 0,
            is_empty: true,
            is_full: false,
            is_running: true,
            is_idle: true,
            execution_count: 0,
            success_count: 0,
            error_count: 0,
            settle_count: 0,
            rejection_count: 0,
            expiration_count: 0,
            total_items_processed: 0,
            last_result: None,
        }
    }
}

impl<T, R> AsyncQueuerState<T, R> {
    fn refresh(&mut self, max_size: usize) {
        self.size = self.items.len();
        self.is_empty = self.items.is_empty();
        self.is_full = self.size >= max_size;
        self.is_idle = self.is_running && self.is_empty && self.active_items.is_empty();
        self.status = if !self.active_items.is_empty() {
            Status::Executing
        } else if !self.is_running {
            Status::Idle
        } else if self.is_empty {
            Status::Idle
        } else {
            Status::Pending
        };
    }
}

/// Configuration for an [`AsyncQueuer`]
pub struct AsyncQueuerOptions<T, R> {
    pub(crate) wait: Adaptive<Duration, AsyncQueuerState<T, R>>,
    pub(crate) max_size: Adaptive<usize, AsyncQueuerState<T, R>>,
    pub(crate) concurrency: Adaptive<usize, AsyncQueuerState<T, R>>,
    pub(crate) started: bool,
    pub(crate) initial_items: Vec<T>,
    pub(crate) add_items_to: Position,
    pub(crate) get_items_from: Position,
    pub(crate) get_priority: Option<Arc<dyn Fn(&T) -> i64 + Send + Sync>>,
    pub(crate) get_is_expired: Option<Arc<dyn Fn(&QueueItem<T>) -> bool + Send + Sync>>,
    pub(crate) expiration_duration: Option<Duration>,
    pub(crate) throw_on_error: Option<bool>,
    pub(crate) initial_state: Option<AsyncQueuerState<T, R>>,
    pub(crate) on_success: Option<Arc<dyn Fn(&R) + Send + Sync>>,
    pub(crate) on_error: Option<Arc<dyn Fn(&TargetError) + Send + Sync>>,
    pub(crate) on_settled: Option<Arc<dyn Fn(&AsyncQueuerState<T, R>) + Send + Sync>>,
    pub(crate) on_items_change: Option<Arc<dyn Fn(&[QueueItem<T>]) + Send + Sync>>,
    pub(crate) on_reject: Option<Arc<dyn Fn(&T) + Send + Sync>>,
    pub(crate) on_expire: Option<Arc<dyn Fn(&T) + Send + Sync>>,
}

impl<T: Clone, R: Clone> Default for AsyncQueuerOptions<T, R> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone, R: Clone> AsyncQueuerOptions<T, R> {
    /// FIFO queue, started, single-flight, no pacing delay, unbounded
    pub fn new() -> Self {
        Self {
            wait: Adaptive::fixed(Duration::ZERO),
            max_size: Adaptive::fixed(usize::MAX),
            concurrency: Adaptive::fixed(1),
            started: true,
            initial_items: Vec::new(),
            add_items_to: Position::Back,
            get_items_from: Position::Front,
            get_priority: None,
            get_is_expired: None,
            expiration_duration: None,
            throw_on_error: None,
            initial_state: None,
            on_success: None,
            on_error: None,
            on_settled: None,
            on_items_change: None,
            on_reject: None,
            on_expire: None,
        }
    }

    pub fn wait(mut self, wait: Duration) -> Self {
        self.wait = Adaptive::fixed(wait);
        self
    }

    pub fn wait_with<F>(mut self, f: F) -> Self
    where
        F: Fn(&AsyncQueuerState<T, R>) -> Duration + Send + Sync + 'static,
    {
        self.wait = Adaptive::computed(f);
        self
    }

    pub fn max_size(mut self, max_size: usize) -> Self {
        self.max_size = Adaptive::fixed(max_size);
        self
    }

    /// Maximum in-flight executions; re-evaluated when slots move
    pub fn concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = Adaptive::fixed(concurrency);
        self
    }

    pub fn concurrency_with<F>(mut self, f: F) -> Self
    where
        F: Fn(&AsyncQueuerState<T, R>) -> usize + Send + Sync + 'static,
    {
        self.concurrency = Adaptive::computed(f);
        self
    }

    pub fn started(mut self, started: bool) -> Self {
        self.started = started;
        self
    }

    pub fn initial_items(mut self, items: Vec<T>) -> Self {
        self.initial_items = items;
        self
    }

    pub fn add_items_to(mut self, position: Position) -> Self {
        self.add_items_to = position;
        self
    }

    pub fn get_items_from(mut self, position: Position) -> Self {
        self.get_items_from = position;
        self
    }

    pub fn get_priority<F>(mut self, f: F) -> Self
    where
        F: Fn(&T) -> i64 + Send + Sync + 'static,
    {
        self.get_priority = Some(Arc::new(f));
        self
    }

    pub fn get_is_expired<F>(mut self, f: F) -> Self
    where
        F: Fn(&QueueItem<T>) -> bool + Send + Sync + 'static,
    {
        self.get_is_expired = Some(Arc::new(f));
        self
    }

    pub fn expiration_duration(mut self, duration: Duration) -> Self {
        self.expiration_duration = Some(duration);
        self
    }

    pub fn throw_on_error(mut self, throw: bool) -> Self {
        self.throw_on_error = Some(throw);
        self
    }

    pub fn initial_state(mut self, state: AsyncQueuerState<T, R>) -> Self {
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
        F: Fn(&AsyncQueuerState<T, R>) + Send + Sync + 'static,
    {
        self.on_settled = Some(Arc::new(f));
        self
    }

    pub fn on_items_change<F>(mut self, f: F) -> Self
    where
        F: Fn(&[QueueItem<T>]) + Send + Sync + 'static,
    {
        self.on_items_change = Some(Arc::new(f));
        self
    }

    pub fn on_reject<F>(mut self, f: F) -> Self
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        self.on_reject = Some(Arc::new(f));
        self
    }

    pub fn on_expire<F>(mut self, f: F) -> Self
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        self.on_expire = Some(Arc::new(f));
        self
    }
}

struct AsyncQueueCore<T, R> {
    id: String,
    store: Store<AsyncQueuerState<T, R>>,
    options: RwLock<AsyncQueuerOptions<T, R>>,
    target: AsyncTargetFn<T, R>,
    clock: Arc<dyn Clock>,
    next_seq: AtomicU64,
    last_dispatch: Mutex<Option<Instant>>,
    pump_task: Mutex<Option<JoinHandle<()>>>,
    pump_gen: AtomicU64,
    abort_root: Mutex<CancellationToken>,
}

/// Concurrency-bounded queue over a promise-returning target
pub struct AsyncQueuer<T, R>
where
    T: Clone + Send + Sync + 'static,
    R: Clone + Send + Sync + 'static,
{
    core: Arc<AsyncQueueCore<T, R>>,
}

impl<T, R> AsyncQueuer<T, R>
where
    T: Clone + Send + Sync + 'static,
    R: Clone + Send + Sync + 'static,
{
    /// Create a queuer reading time through the tokio clock
    pub fn new<F, Fut>(target: F, options: AsyncQueuerOptions<T, R>) -> Self
    where
        F: Fn(T, CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<R, TargetError>> + Send + 'static,
    {
        Self::with_clock(target, options, Arc::new(TokioClock))
    }

    /// Create a queuer with an injected clock
    pub fn with_clock<F, Fut>(
        target: F,
        options: AsyncQueuerOptions<T, R>,
        clock: Arc<dyn Clock>,
    ) -> Self
    where
        F: Fn(T, CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<R, TargetError>> + Send + 'static,
    {
        let target: AsyncTargetFn<T, R> =
            Arc::new(move |args, token| Box::pin(target(args, token)));
        let mut initial = options.initial_state.clone().unwrap_or_default();
        initial.is_running = options.started;
        initial.active_items = Vec::new();
        let now = clock.now();
        for item in initial.items.iter_mut() {
            item.inserted = Some(now);
        }

        let core = Arc::new(AsyncQueueCore {
            id: format!("async-queuer-{}", Uuid::new_v4()),
            store: Store::new(initial),
            options: RwLock::new(options),
            target,
            clock,
            next_seq: AtomicU64::new(0),
            last_dispatch: Mutex::new(None),
            pump_task: Mutex::new(None),
            pump_gen: AtomicU64::new(0),
            abort_root: Mutex::new(CancellationToken::new()),
        });

        let (initial_items, max_size, add_to, get_priority) = {
            let opts = core.options.read().unwrap();
            let state = core.store.state();
            (
                opts.initial_items.clone(),
                opts.max_size.resolve(&state),
                opts.add_items_to,
                opts.get_priority.clone(),
            )
        };
        if !initial_items.is_empty() {
            let prioritized = get_priority.is_some();
            core.store.update(|s| {
                for value in initial_items {
                    if s.items.len() >= max_size {
                        s.rejection_count += 1;
                        continue;
                    }
                    let item = QueueItem {
                        priority: get_priority.as_ref().map(|f| f(&value)),
                        value,
                        added_at: Utc::now(),
                        seq: core.next_seq.fetch_add(1, Ordering::SeqCst),
                        inserted: Some(core.clock.now()),
                    };
                    insert_item(&mut s.items, item, add_to, prioritized);
                }
                s.refresh(max_size);
            });
            // seeding notifies once, not per item
            let on_items_change = core.options.read().unwrap().on_items_change.clone();
            if let Some(hook) = on_items_change {
                hook(&core.store.with(|s| s.items.clone()));
            }
        }
        // a restored or seeded buffer starts dispatching from now
        if core.store.with(|s| s.is_running && !s.items.is_empty()) {
            core.pump();
        }
        Self { core }
    }

    /// Buffer an item; returns false when capacity rejected it
    pub fn add_item(&self, value: T) -> bool {
        self.add_item_to(value, None)
    }

    /// Buffer an item at an explicit end, overriding `add_items_to`
    pub fn add_item_at(&self, value: T, position: Position) -> bool {
        self.add_item_to(value, Some(position))
    }

    fn add_item_to(&self, value: T, position: Option<Position>) -> bool {
        let core = &self.core;
        let state = core.store.state();
        let (max_size, add_to, get_priority, on_reject, on_items_change) = {
            let opts = core.options.read().unwrap();
            (
                opts.max_size.resolve(&state),
                position.unwrap_or(opts.add_items_to),
                opts.get_priority.clone(),
                opts.on_reject.clone(),
                opts.on_items_change.clone(),
            )
        };

        if state.items.len() >= max_size {
            core.store.update(|s| s.rejection_count += 1);
            tracing::debug!(primitive = %core.id, "item rejected: queue full");
            if let Some(hook) = on_reject {
                hook(&value);
            }
            return false;
        }

        let item = QueueItem {
            priority: get_priority.as_ref().map(|f| f(&value)),
            value,
            added_at: Utc::now(),
            seq: core.next_seq.fetch_add(1, Ordering::SeqCst),
            inserted: Some(core.clock.now()),
        };
        let prioritized = get_priority.is_some();
        core.store.update(|s| {
            insert_item(&mut s.items, item, add_to, prioritized);
            s.refresh(max_size);
        });
        if let Some(hook) = on_items_change {
            hook(&core.store.with(|s| s.items.clone()));
        }
        core.pump();
        true
    }

    /// Resume dispatching
    pub fn start(&self) {
        let core = &self.core;
        let max_size = core.resolved_max_size();
        core.store.update(|s| {
            s.is_running = true;
            s.refresh(max_size);
        });
        core.pump();
    }

    /// Pause new dispatches; in-flight work settles normally
    pub fn stop(&self) {
        let core = &self.core;
        core.cancel_pump();
        let max_size = core.resolved_max_size();
        core.store.update(|s| {
            s.is_running = false;
            s.refresh(max_size);
        });
    }

    /// Drop all buffered items, keeping counters
    pub fn clear(&self) {
        let core = &self.core;
        let max_size = core.resolved_max_size();
        core.store.update(|s| {
            s.items.clear();
            s.refresh(max_size);
        });
        let on_items_change = core.options.read().unwrap().on_items_change.clone();
        if let Some(hook) = on_items_change {
            hook(&[]);
        }
    }

    /// Restore the construction-time state: no items, zeroed counters
    pub fn reset(&self) {
        let core = &self.core;
        core.cancel_pump();
        *core.last_dispatch.lock().unwrap() = None;
        let started = core.options.read().unwrap().started;
        core.store.update(|s| {
            let active = std::mem::take(&mut s.active_items);
            *s = AsyncQueuerState::default();
            // in-flight executions keep settling; they are not forgotten
            s.active_items = active;
            s.is_running = started;
        });
    }

    /// Abort in-flight executions through their cancellation token
    pub fn abort(&self) {
        let mut root = self.core.abort_root.lock().unwrap();
        root.cancel();
        *root = CancellationToken::new();
    }

    /// Token that fires when [`abort`](Self::abort) is called
    pub fn abort_signal(&self) -> CancellationToken {
        self.core.abort_root.lock().unwrap().child_token()
    }

    /// Dispatch up to `count` items now, bypassing wait and concurrency,
    /// and await their settlement
    ///
    /// Returns the number of successful settlements; with
    /// `throw_on_error` resolved true the first failure surfaces after
    /// the batch settles.
    pub async fn flush(&self, count: Option<usize>, direction: Option<Position>) -> Result<usize> {
        let core = &self.core;
        core.drain_expired();
        let throw = {
            let opts = core.options.read().unwrap();
            opts.throw_on_error.unwrap_or(opts.on_error.is_none())
        };
        let limit = count
            .unwrap_or(usize::MAX)
            .min(core.store.with(|s| s.items.len()));

        let mut runs = Vec::new();
        for _ in 0..limit {
            match core.take_next(direction) {
                Some(item) => runs.push(core.run_one(item)),
                None => break,
            }
        }
        *core.last_dispatch.lock().unwrap() = Some(core.clock.now());

        let mut succeeded = 0;
        let mut first_error = None;
        for settled in join_all(runs).await {
            match settled {
                Ok(Some(_)) => succeeded += 1,
                Ok(None) => {}
                Err(err) => {
                    if first_error.is_none() {
                        first_error = Some(err);
                    }
                }
            }
        }
        match first_error {
            Some(err) if throw => Err(err),
            _ => Ok(succeeded),
        }
    }

    /// Hand the entire buffer to `batch_fn` in one call, bypassing pacing
    pub async fn flush_as_batch<F, Fut>(&self, batch_fn: F) -> Result<usize>
    where
        F: FnOnce(Vec<T>) -> Fut,
        Fut: Future<Output = std::result::Result<(), TargetError>>,
    {
        let core = &self.core;
        core.drain_expired();
        let max_size = core.resolved_max_size();
        let mut drained = Vec::new();
        core.store.update(|s| {
            drained = std::mem::take(&mut s.items);
            s.refresh(max_size);
        });
        let values: Vec<T> = drained.into_iter().map(|i| i.value).collect();
        let count = values.len();
        let on_items_change = core.options.read().unwrap().on_items_change.clone();
        if let Some(hook) = on_items_change {
            hook(&[]);
        }
        match batch_fn(values).await {
            Ok(()) => {
                core.store.update(|s| {
                    s.execution_count += 1;
                    s.success_count += 1;
                    s.settle_count += 1;
                    s.total_items_processed += count as u64;
                });
                Ok(count)
            }
            Err(source) => {
                core.store.update(|s| {
                    s.error_count += 1;
                    s.settle_count += 1;
                    s.total_items_processed += count as u64;
                });
                Err(PacerError::TargetFailed { source })
            }
        }
    }

    /// Next item that would dispatch, without removing it
    pub fn peek_next_item(&self) -> Option<T> {
        let core = &self.core;
        let (from, prioritized) = {
            let opts = core.options.read().unwrap();
            (opts.get_items_from, opts.get_priority.is_some())
        };
        core.store
            .with(|s| peek_item(&s.items, from, prioritized).map(|i| i.value.clone()))
    }

    /// All buffered values in extraction order
    pub fn peek_all_items(&self) -> Vec<T> {
        self.core
            .store
            .with(|s| s.items.iter().map(|i| i.value.clone()).collect())
    }

    /// Remove and return the next item without dispatching it
    pub fn get_next_item(&self, direction: Option<Position>) -> Option<T> {
        let core = &self.core;
        core.drain_expired();
        let item = core.take_next(direction)?;
        // taking without dispatching frees no slot and runs nothing
        let max_size = core.resolved_max_size();
        core.store.update(|s| {
            s.active_items.retain(|i| i.seq != item.seq);
            s.refresh(max_size);
        });
        Some(item.value)
    }

    pub fn set_options(&self, patch: impl FnOnce(&mut AsyncQueuerOptions<T, R>)) {
        patch(&mut self.core.options.write().unwrap());
        self.core.pump();
    }

    pub fn store(&self) -> &Store<AsyncQueuerState<T, R>> {
        &self.core.store
    }

    pub fn state(&self) -> AsyncQueuerState<T, R> {
        self.core.store.state()
    }

    pub fn size(&self) -> usize {
        self.core.store.with(|s| s.items.len())
    }

    pub fn active_count(&self) -> usize {
        self.core.store.with(|s| s.active_items.len())
    }

    pub fn is_running(&self) -> bool {
        self.core.store.with(|s| s.is_running)
    }

    pub fn execution_count(&self) -> u64 {
        self.core.store.with(|s| s.execution_count)
    }

    pub fn rejection_count(&self) -> u64 {
        self.core.store.with(|s| s.rejection_count)
    }

    pub fn expiration_count(&self) -> u64 {
        self.core.store.with(|s| s.expiration_count)
    }
}

impl<T, R> fmt::Debug for AsyncQueuer<T, R>
where
    T: Clone + Send + Sync + 'static,
    R: Clone + Send + Sync + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncQueuer")
            .field("id", &self.core.id)
            .field("size", &self.size())
            .field("active", &self.active_count())
            .finish()
    }
}

impl<T, R> Drop for AsyncQueuer<T, R>
where
    T: Clone + Send + Sync + 'static,
    R: Clone + Send + Sync + 'static,
{
    fn drop(&mut self) {
        self.core.cancel_pump();
        self.core.abort_root.lock().unwrap().cancel();
    }
}

impl<T, R> AsyncQueueCore<T, R>
where
    T: Clone + Send + Sync + 'static,
    R: Clone + Send + Sync + 'static,
{
    fn resolved_max_size(&self) -> usize {
        let state = self.store.state();
        self.options.read().unwrap().max_size.resolve(&state)
    }

    /// Fill free concurrency slots with due items
    fn pump(self: &Arc<Self>) {
        loop {
            if !self.store.with(|s| s.is_running) {
                return;
            }
            self.drain_expired();
            let state = self.store.state();
            if state.items.is_empty() {
                return;
            }
            let (concurrency, wait) = {
                let opts = self.options.read().unwrap();
                (
                    opts.concurrency.resolve(&state),
                    opts.wait.resolve(&state),
                )
            };
            if state.active_items.len() >= concurrency {
                return; // a settling slot pumps again
            }
            let now = self.clock.now();
            if let Some(last) = *self.last_dispatch.lock().unwrap() {
                let due = last + wait;
                if now < due {
                    self.schedule_pump(due.saturating_duration_since(now));
                    return;
                }
            }

            let Some(item) = self.take_next(None) else {
                return;
            };
            *self.last_dispatch.lock().unwrap() = Some(now);
            tracing::debug!(primitive = %self.id, "dispatching queued async item");
            let core = Arc::clone(self);
            tokio::spawn(async move {
                let _ = core.run_one(item).await;
            });
        }
    }

    fn schedule_pump(self: &Arc<Self>, delay: Duration) {
        let generation = self.pump_gen.fetch_add(1, Ordering::SeqCst) + 1;
        let weak = Arc::downgrade(self);
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(core) = weak.upgrade() {
                if core.pump_gen.load(Ordering::SeqCst) == generation {
                    core.pump();
                }
            }
        });
        if let Some(old) = self.pump_task.lock().unwrap().replace(task) {
            old.abort();
        }
    }

    fn cancel_pump(&self) {
        self.pump_gen.fetch_add(1, Ordering::SeqCst);
        if let Some(task) = self.pump_task.lock().unwrap().take() {
            task.abort();
        }
    }

    /// Take the next item and mark it active
    fn take_next(&self, direction: Option<Position>) -> Option<QueueItem<T>> {
        let state = self.store.state();
        let (from, prioritized, max_size, on_items_change) = {
            let opts = self.options.read().unwrap();
            (
                direction.unwrap_or(opts.get_items_from),
                opts.get_priority.is_some(),
                opts.max_size.resolve(&state),
                opts.on_items_change.clone(),
            )
        };
        let mut taken = None;
        self.store.update(|s| {
            taken = take_item(&mut s.items, from, prioritized);
            if let Some(item) = &taken {
                s.active_items.push(item.clone());
            }
            s.refresh(max_size);
        });
        let item = taken?;
        if let Some(hook) = on_items_change {
            hook(&self.store.with(|s| s.items.clone()));
        }
        Some(item)
    }

    /// Execute one active item, route the outcome, refill slots
    async fn run_one(self: &Arc<Self>, item: QueueItem<T>) -> Result<Option<R>> {
        let token = self.abort_root.lock().unwrap().child_token();
        let fut = (self.target)(item.value.clone(), token.clone());
        let outcome = tokio::select! {
            biased;
            _ = token.cancelled() => None,
            result = fut => Some(result),
        };

        let (on_success, on_error, on_settled, throw) = {
            let opts = self.options.read().unwrap();
            (
                opts.on_success.clone(),
                opts.on_error.clone(),
                opts.on_settled.clone(),
                opts.throw_on_error.unwrap_or(opts.on_error.is_none()),
            )
        };
        let max_size = self.resolved_max_size();

        let resolution = match outcome {
            Some(Ok(result)) => {
                self.store.update(|s| {
                    s.active_items.retain(|i| i.seq != item.seq);
                    s.execution_count += 1;
                    s.success_count += 1;
                    s.settle_count += 1;
                    s.total_items_processed += 1;
                    s.last_result = Some(result.clone());
                    s.refresh(max_size);
                });
                if let Some(hook) = on_success {
                    hook(&result);
                }
                Ok(Some(result))
            }
            Some(Err(source)) => {
                self.store.update(|s| {
                    s.active_items.retain(|i| i.seq != item.seq);
                    s.error_count += 1;
                    s.settle_count += 1;
                    s.total_items_processed += 1;
                    s.refresh(max_size);
                });
                // background dispatches have no awaiter to reject, so an
                // unhooked failure is at least logged
                if let Some(hook) = &on_error {
                    hook(&source);
                } else {
                    tracing::warn!(primitive = %self.id, error = %source, "queued target failed");
                }
                if throw {
                    Err(PacerError::TargetFailed { source })
                } else {
                    Ok(None)
                }
            }
            None => {
                // aborted: the slot frees but nothing is counted as an error
                self.store.update(|s| {
                    s.active_items.retain(|i| i.seq != item.seq);
                    s.refresh(max_size);
                });
                Err(PacerError::Aborted)
            }
        };
        if let Some(hook) = on_settled {
            hook(&self.store.state());
        }
        self.pump();
        resolution
    }

    fn drain_expired(&self) {
        let (get_is_expired, expiration, on_expire, on_items_change) = {
            let opts = self.options.read().unwrap();
            (
                opts.get_is_expired.clone(),
                opts.expiration_duration,
                opts.on_expire.clone(),
                opts.on_items_change.clone(),
            )
        };
        if get_is_expired.is_none() && expiration.is_none() {
            return;
        }
        let max_size = self.resolved_max_size();
        let now = self.clock.now();
        let mut expired = Vec::new();
        self.store.update(|s| {
            s.items.retain(|item| {
                let by_predicate = get_is_expired.as_ref().map(|f| f(item)).unwrap_or(false);
                let by_age = match (expiration, item.inserted) {
                    (Some(ttl), Some(at)) => now.duration_since(at) >= ttl,
                    _ => false,
                };
                if by_predicate || by_age {
                    expired.push(item.value.clone());
                    false
                } else {
                    true
                }
            });
            s.expiration_count += expired.len() as u64;
            s.refresh(max_size);
        });
        if expired.is_empty() {
            return;
        }
        tracing::debug!(primitive = %self.id, count = expired.len(), "expired items dropped");
        if let Some(hook) = on_expire {
            for value in &expired {
                hook(value);
            }
        }
        if let Some(hook) = on_items_change {
            hook(&self.store.with(|s| s.items.clone()));
        }
    }
}
