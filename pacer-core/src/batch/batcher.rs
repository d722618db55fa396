//! Synchronous batcher

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{PacerError, Result, TargetError};
use crate::options::{Adaptive, ValueTargetFn};
use crate::store::Store;
use crate::timing::{StdTimerBackend, TimerBackend};
use crate::Status;

/// Observable state of a [`Batcher`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatcherState<T, R> {
    pub status: Status,
    /// The accumulating batch
    pub items: Vec<T>,
    pub size: usize,
    /// True while the wait timer is armed
    pub is_pending: bool,
    pub is_running: bool,
    /// Dispatched batches that settled successfully
    pub execution_count: u64,
    pub total_items_processed: u64,
    pub last_result: Option<R>,
}

impl<T, R> Default for BatcherState<T, R> {
    fn default() -> Self {
        Self {
            status: Status::Idle,
            items: Vec::new(),
            size: 0,
            is_pending: false,
            is_running: true,
            execution_count: 0,
            total_items_processed: 0,
            last_result: None,
        }
    }
}

/// Configuration for a [`Batcher`]
pub struct BatcherOptions<T, R> {
    pub(crate) wait: Adaptive<Duration, BatcherState<T, R>>,
    pub(crate) max_size: Adaptive<usize, BatcherState<T, R>>,
    pub(crate) started: bool,
    pub(crate) get_should_execute: Option<Arc<dyn Fn(&[T]) -> bool + Send + Sync>>,
    pub(crate) initial_state: Option<BatcherState<T, R>>,
    pub(crate) on_execute: Option<Arc<dyn Fn(&BatcherState<T, R>) + Send + Sync>>,
    pub(crate) on_items_change: Option<Arc<dyn Fn(&[T]) + Send + Sync>>,
}

impl<T: Clone, R: Clone> BatcherOptions<T, R> {
    /// Dispatch when `wait` elapses from the first buffered item
    pub fn new(wait: Duration) -> Self {
        Self {
            wait: Adaptive::fixed(wait),
            max_size: Adaptive::fixed(usize::MAX),
            started: true,
            get_should_execute: None,
            initial_state: None,
            on_execute: None,
            on_items_change: None,
        }
    }

    pub fn wait(mut self, wait: Duration) -> Self {
        self.wait = Adaptive::fixed(wait);
        self
    }

    pub fn wait_with<F>(mut self, f: F) -> Self
    where
        F: Fn(&BatcherState<T, R>) -> Duration + Send + Sync + 'static,
    {
        self.wait = Adaptive::computed(f);
        self
    }

    /// Dispatch as soon as the buffer reaches this size
    pub fn max_size(mut self, max_size: usize) -> Self {
        self.max_size = Adaptive::fixed(max_size);
        self
    }

    pub fn max_size_with<F>(mut self, f: F) -> Self
    where
        F: Fn(&BatcherState<T, R>) -> usize + Send + Sync + 'static,
    {
        self.max_size = Adaptive::computed(f);
        self
    }

    pub fn started(mut self, started: bool) -> Self {
        self.started = started;
        self
    }

    /// Predicate over the buffer, evaluated at each addition
    pub fn get_should_execute<F>(mut self, f: F) -> Self
    where
        F: Fn(&[T]) -> bool + Send + Sync + 'static,
    {
        self.get_should_execute = Some(Arc::new(f));
        self
    }

    pub fn initial_state(mut self, state: BatcherState<T, R>) -> Self {
        self.initial_state = Some(state);
        self
    }

    pub fn on_execute<F>(mut self, f: F) -> Self
    where
        F: Fn(&BatcherState<T, R>) + Send + Sync + 'static,
    {
        self.on_execute = Some(Arc::new(f));
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

struct BatchCore<T, R> {
    id: String,
    store: Store<BatcherState<T, R>>,
    options: RwLock<BatcherOptions<T, R>>,
    target: ValueTargetFn<Vec<T>, R>,
    timers: Arc<dyn TimerBackend>,
    timer_gen: AtomicU64,
}

/// Accumulates items and dispatches them together when a trigger fires
pub struct Batcher<T, R>
where
    T: Clone + Send + Sync + 'static,
    R: Clone + Send + Sync + 'static,
{
    core: Arc<BatchCore<T, R>>,
}

impl<T, R> Batcher<T, R>
where
    T: Clone + Send + Sync + 'static,
    R: Clone + Send + Sync + 'static,
{
    /// Create a batcher with a thread timer backend
    pub fn new<F>(target: F, options: BatcherOptions<T, R>) -> Self
    where
        F: Fn(Vec<T>) -> std::result::Result<R, TargetError> + Send + Sync + 'static,
    {
        Self::with_timing(target, options, Arc::new(StdTimerBackend::new()))
    }

    /// Create a batcher with an injected timer backend
    ///
    /// The batcher's triggers are size, predicate, and a single wait
    /// timer, so it takes no clock.
    pub fn with_timing<F>(
        target: F,
        options: BatcherOptions<T, R>,
        timers: Arc<dyn TimerBackend>,
    ) -> Self
    where
        F: Fn(Vec<T>) -> std::result::Result<R, TargetError> + Send + Sync + 'static,
    {
        let mut initial = options.initial_state.clone().unwrap_or_default();
        initial.is_pending = false;
        initial.is_running = options.started;
        initial.size = initial.items.len();
        initial.status = Status::Idle;

        let core = Arc::new(BatchCore {
            id: format!("batcher-{}", Uuid::new_v4()),
            store: Store::new(initial),
            options: RwLock::new(options),
            target: Arc::new(target),
            timers,
            timer_gen: AtomicU64::new(0),
        });
        // a restored non-empty buffer restarts its wait from now
        if core.store.with(|s| s.is_running && !s.items.is_empty()) {
            core.evaluate_triggers();
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
            core.evaluate_triggers_after_add(was_empty);
        }
        true
    }

    /// Dispatch whatever is buffered now, including an empty batch
    pub fn flush(&self) -> Result<R> {
        self.core.dispatch()
    }

    /// Resume trigger evaluation
    pub fn start(&self) {
        let core = &self.core;
        core.store.update(|s| s.is_running = true);
        if core.store.with(|s| !s.items.is_empty()) {
            core.evaluate_triggers();
        }
    }

    /// Pause triggers; the buffer keeps accumulating
    pub fn stop(&self) {
        let core = &self.core;
        core.disarm();
        core.store.update(|s| {
            s.is_running = false;
            s.is_pending = false;
        });
    }

    /// Drop the buffer without dispatching; counters remain
    pub fn clear(&self) {
        let core = &self.core;
        core.disarm();
        core.store.update(|s| {
            s.items.clear();
            s.size = 0;
            s.is_pending = false;
            s.status = Status::Idle;
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
        let started = core.options.read().unwrap().started;
        core.store.update(|s| {
            *s = BatcherState::default();
            s.is_running = started;
        });
    }

    pub fn peek_all_items(&self) -> Vec<T> {
        self.core.store.with(|s| s.items.clone())
    }

    pub fn set_options(&self, patch: impl FnOnce(&mut BatcherOptions<T, R>)) {
        patch(&mut self.core.options.write().unwrap());
    }

    pub fn store(&self) -> &Store<BatcherState<T, R>> {
        &self.core.store
    }

    pub fn state(&self) -> BatcherState<T, R> {
        self.core.store.state()
    }

    pub fn size(&self) -> usize {
        self.core.store.with(|s| s.items.len())
    }

    pub fn execution_count(&self) -> u64 {
        self.core.store.with(|s| s.execution_count)
    }
}

impl<T, R> fmt::Debug for Batcher<T, R>
where
    T: Clone + Send + Sync + 'static,
    R: Clone + Send + Sync + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Batcher")
            .field("id", &self.core.id)
            .field("size", &self.size())
            .field("executions", &self.execution_count())
            .finish()
    }
}

impl<T, R> BatchCore<T, R>
where
    T: Clone + Send + Sync + 'static,
    R: Clone + Send + Sync + 'static,
{
    fn timer_id(&self) -> String {
        format!("{}:wait", self.id)
    }

    fn evaluate_triggers_after_add(self: &Arc<Self>, was_empty: bool) {
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
        if state.items.len() >= max_size || should_execute {
            if let Err(err) = self.dispatch() {
                tracing::error!(primitive = %self.id, error = %err, "batch target failed");
            }
            return;
        }
        if was_empty {
            // the wait runs from the first buffered item; later additions
            // do not push it back
            self.arm(wait);
        }
    }

    /// Re-check triggers without an addition (start, rehydration)
    fn evaluate_triggers(self: &Arc<Self>) {
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
        if state.items.len() >= max_size || should_execute {
            if let Err(err) = self.dispatch() {
                tracing::error!(primitive = %self.id, error = %err, "batch target failed");
            }
        } else {
            self.arm(wait);
        }
    }

    fn arm(self: &Arc<Self>, wait: Duration) {
        let generation = self.timer_gen.fetch_add(1, Ordering::SeqCst) + 1;
        let weak = Arc::downgrade(self);
        let armed = self.timers.schedule_once(
            &self.timer_id(),
            wait,
            Box::new(move || {
                if let Some(core) = weak.upgrade() {
                    core.on_wait_fire(generation);
                }
            }),
        );
        match armed {
            Ok(()) => {
                self.store.update(|s| {
                    s.is_pending = true;
                    s.status = Status::Pending;
                });
            }
            Err(err) => {
                tracing::error!(primitive = %self.id, error = %err, "failed to arm batch timer");
            }
        }
    }

    fn disarm(&self) {
        self.timer_gen.fetch_add(1, Ordering::SeqCst);
        let _ = self.timers.cancel(&self.timer_id());
    }

    fn on_wait_fire(self: &Arc<Self>, generation: u64) {
        if self.timer_gen.load(Ordering::SeqCst) != generation {
            return;
        }
        if !self.store.with(|s| s.is_running) {
            return;
        }
        if let Err(err) = self.dispatch() {
            tracing::error!(primitive = %self.id, error = %err, "batch target failed");
        }
    }

    fn dispatch(self: &Arc<Self>) -> Result<R> {
        self.disarm();
        let mut batch = Vec::new();
        self.store.update(|s| {
            batch = std::mem::take(&mut s.items);
            s.size = 0;
            s.is_pending = false;
            s.status = Status::Executing;
        });
        let on_items_change = self.options.read().unwrap().on_items_change.clone();
        if let Some(hook) = on_items_change {
            hook(&[]);
        }
        let count = batch.len();
        tracing::debug!(primitive = %self.id, count, "dispatching batch");
        match (self.target)(batch) {
            Ok(result) => {
                self.store.update(|s| {
                    s.execution_count += 1;
                    s.total_items_processed += count as u64;
                    s.last_result = Some(result.clone());
                    s.status = Status::Idle;
                });
                let on_execute = self.options.read().unwrap().on_execute.clone();
                if let Some(hook) = on_execute {
                    hook(&self.store.state());
                }
                Ok(result)
            }
            Err(source) => {
                self.store.update(|s| s.status = Status::Idle);
                Err(PacerError::TargetFailed { source })
            }
        }
    }
}

impl<T, R> Drop for BatchCore<T, R> {
    fn drop(&mut self) {
        let _ = self.timers.cancel(&format!("{}:wait", self.id));
    }
}
