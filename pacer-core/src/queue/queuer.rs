//! Synchronous queuer

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{PacerError, Result, TargetError};
use crate::options::{Adaptive, TargetFn};
use crate::queue::{insert_item, peek_item, take_item, Position, QueueItem};
use crate::store::Store;
use crate::timing::{Clock, StdTimerBackend, SystemClock, TimerBackend};
use crate::Status;

/// Observable state of a [`Queuer`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuerState<T> {
    pub status: Status,
    pub items: Vec<QueueItem<T>>,
    pub size: usize,
    pub is_empty: bool,
    pub is_full: bool,
    pub is_running: bool,
    pub is_idle: bool,
    /// Dispatched items whose target returned `Ok`
    pub execution_count: u64,
    pub success_count: u64,
    pub error_count: u64,
    pub settle_count: u64,
    pub rejection_count: u64,
    pub expiration_count: u64,
    pub total_items_processed: u64,
}

impl<T> Default for QueuerState<T> {
    fn default() -> Self {
        Self {
            status: Status::Idle,
            items: Vec::new(),
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
        }
    }
}

impl<T> QueuerState<T> {
    fn refresh(&mut self, max_size: usize) {
        self.size = self.items.len();
        self.is_empty = self.items.is_empty();
        self.is_full = self.size >= max_size;
        self.is_idle = self.is_running && self.is_empty;
    }
}

/// Configuration for a [`Queuer`]
pub struct QueuerOptions<T> {
    pub(crate) wait: Adaptive<Duration, QueuerState<T>>,
    pub(crate) max_size: Adaptive<usize, QueuerState<T>>,
    pub(crate) started: bool,
    pub(crate) initial_items: Vec<T>,
    pub(crate) add_items_to: Position,
    pub(crate) get_items_from: Position,
    pub(crate) get_priority: Option<Arc<dyn Fn(&T) -> i64 + Send + Sync>>,
    pub(crate) get_is_expired: Option<Arc<dyn Fn(&QueueItem<T>) -> bool + Send + Sync>>,
    pub(crate) expiration_duration: Option<Duration>,
    pub(crate) throw_on_error: Option<bool>,
    pub(crate) initial_state: Option<QueuerState<T>>,
    pub(crate) on_execute: Option<Arc<dyn Fn(&T) + Send + Sync>>,
    pub(crate) on_items_change: Option<Arc<dyn Fn(&[QueueItem<T>]) + Send + Sync>>,
    pub(crate) on_reject: Option<Arc<dyn Fn(&T) + Send + Sync>>,
    pub(crate) on_expire: Option<Arc<dyn Fn(&T) + Send + Sync>>,
    pub(crate) on_error: Option<Arc<dyn Fn(&TargetError) + Send + Sync>>,
}

impl<T: Clone> Default for QueuerOptions<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone> QueuerOptions<T> {
    /// FIFO queue, started, no pacing delay, unbounded
    pub fn new() -> Self {
        Self {
            wait: Adaptive::fixed(Duration::ZERO),
            max_size: Adaptive::fixed(usize::MAX),
            started: true,
            initial_items: Vec::new(),
            add_items_to: Position::Back,
            get_items_from: Position::Front,
            get_priority: None,
            get_is_expired: None,
            expiration_duration: None,
            throw_on_error: None,
            initial_state: None,
            on_execute: None,
            on_items_change: None,
            on_reject: None,
            on_expire: None,
            on_error: None,
        }
    }

    /// Delay between dispatches
    pub fn wait(mut self, wait: Duration) -> Self {
        self.wait = Adaptive::fixed(wait);
        self
    }

    pub fn wait_with<F>(mut self, f: F) -> Self
    where
        F: Fn(&QueuerState<T>) -> Duration + Send + Sync + 'static,
    {
        self.wait = Adaptive::computed(f);
        self
    }

    /// Capacity; additions past it are rejected
    pub fn max_size(mut self, max_size: usize) -> Self {
        self.max_size = Adaptive::fixed(max_size);
        self
    }

    pub fn max_size_with<F>(mut self, f: F) -> Self
    where
        F: Fn(&QueuerState<T>) -> usize + Send + Sync + 'static,
    {
        self.max_size = Adaptive::computed(f);
        self
    }

    /// Whether the dispatch loop runs at construction
    pub fn started(mut self, started: bool) -> Self {
        self.started = started;
        self
    }

    /// Items inserted at construction through the normal insert path
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

    /// Order extraction by priority (descending, stable); overrides direction
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

    /// Age after which a buffered item is dropped instead of dispatched
    pub fn expiration_duration(mut self, duration: Duration) -> Self {
        self.expiration_duration = Some(duration);
        self
    }

    pub fn throw_on_error(mut self, throw: bool) -> Self {
        self.throw_on_error = Some(throw);
        self
    }

    pub fn initial_state(mut self, state: QueuerState<T>) -> Self {
        self.initial_state = Some(state);
        self
    }

    pub fn on_execute<F>(mut self, f: F) -> Self
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        self.on_execute = Some(Arc::new(f));
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

    pub fn on_error<F>(mut self, f: F) -> Self
    where
        F: Fn(&TargetError) + Send + Sync + 'static,
    {
        self.on_error = Some(Arc::new(f));
        self
    }
}

struct QueueCore<T> {
    id: String,
    store: Store<QueuerState<T>>,
    options: RwLock<QueuerOptions<T>>,
    target: TargetFn<T>,
    clock: Arc<dyn Clock>,
    timers: Arc<dyn TimerBackend>,
    timer_gen: AtomicU64,
    next_seq: AtomicU64,
    last_dispatch: Mutex<Option<Instant>>,
}

/// Ordered buffer dispatching items to a synchronous target at a cadence
///
/// Dispatches always go through the timer backend, never inline from
/// `add_item`, so a burst of additions settles into the buffer before the
/// first take.
pub struct Queuer<T: Clone + Send + Sync + 'static> {
    core: Arc<QueueCore<T>>,
}

impl<T: Clone + Send + Sync + 'static> Queuer<T> {
    /// Create a queuer with the system clock and a thread timer backend
    pub fn new<F>(target: F, options: QueuerOptions<T>) -> Self
    where
        F: Fn(T) -> std::result::Result<(), TargetError> + Send + Sync + 'static,
    {
        Self::with_timing(
            target,
            options,
            Arc::new(SystemClock),
            Arc::new(StdTimerBackend::new()),
        )
    }

    /// Create a queuer with an injected clock and timer backend
    pub fn with_timing<F>(
        target: F,
        options: QueuerOptions<T>,
        clock: Arc<dyn Clock>,
        timers: Arc<dyn TimerBackend>,
    ) -> Self
    where
        F: Fn(T) -> std::result::Result<(), TargetError> + Send + Sync + 'static,
    {
        let mut initial = options.initial_state.clone().unwrap_or_default();
        initial.is_running = options.started;
        initial.status = Status::Idle;
        // buffered items keep their wall-clock provenance; expiration
        // re-anchors at the current instant
        let now = clock.now();
        for item in initial.items.iter_mut() {
            item.inserted = Some(now);
        }

        let core = Arc::new(QueueCore {
            id: format!("queuer-{}", Uuid::new_v4()),
            store: Store::new(initial),
            options: RwLock::new(options),
            target: Arc::new(target),
            clock,
            timers,
            timer_gen: AtomicU64::new(0),
            next_seq: AtomicU64::new(0),
            last_dispatch: Mutex::new(None),
        });

        // seed initial items through the normal insert path, one
        // notification at the end
        let (initial_items, max_size, add_to, get_priority, prioritized) = {
            let opts = core.options.read().unwrap();
            let state = core.store.state();
            (
                opts.initial_items.clone(),
                opts.max_size.resolve(&state),
                opts.add_items_to,
                opts.get_priority.clone(),
                opts.get_priority.is_some(),
            )
        };
        if !initial_items.is_empty() {
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
        core.schedule_next();
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
            if s.is_running {
                s.status = Status::Pending;
            }
        });
        if let Some(hook) = on_items_change {
            hook(&core.store.with(|s| s.items.clone()));
        }
        core.schedule_next();
        true
    }

    /// Resume dispatching
    pub fn start(&self) {
        let core = &self.core;
        core.store.update(|s| {
            s.is_running = true;
            s.is_idle = s.is_empty;
        });
        core.schedule_next();
    }

    /// Pause dispatching; buffered items stay
    pub fn stop(&self) {
        let core = &self.core;
        core.disarm();
        core.store.update(|s| {
            s.is_running = false;
            s.is_idle = false;
            s.status = Status::Idle;
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
        core.disarm();
        *core.last_dispatch.lock().unwrap() = None;
        let started = core.options.read().unwrap().started;
        core.store.update(|s| {
            *s = QueuerState::default();
            s.is_running = started;
        });
    }

    /// Synchronously drain up to `count` items, bypassing the wait
    ///
    /// Returns the number of items dispatched. With `throw_on_error`
    /// resolved true, the first target failure surfaces after the drain
    /// stops.
    pub fn flush(&self, count: Option<usize>, direction: Option<Position>) -> Result<usize> {
        let core = &self.core;
        core.drain_expired();
        let throw = {
            let opts = core.options.read().unwrap();
            opts.throw_on_error.unwrap_or(opts.on_error.is_none())
        };
        let limit = count.unwrap_or(core.store.with(|s| s.items.len()));
        let mut dispatched = 0;
        for _ in 0..limit {
            match core.dispatch_next(direction) {
                None => break,
                Some(Ok(_)) => dispatched += 1,
                Some(Err(err)) => {
                    dispatched += 1;
                    if throw {
                        return Err(err);
                    }
                }
            }
        }
        Ok(dispatched)
    }

    /// Hand the entire buffer to `batch_fn` in one call, bypassing pacing
    pub fn flush_as_batch<F>(&self, batch_fn: F) -> Result<usize>
    where
        F: FnOnce(Vec<T>) -> std::result::Result<(), TargetError>,
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
        match batch_fn(values) {
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
        let (from, prioritized, max_size, on_items_change) = {
            let opts = core.options.read().unwrap();
            let state = core.store.state();
            (
                direction.unwrap_or(opts.get_items_from),
                opts.get_priority.is_some(),
                opts.max_size.resolve(&state),
                opts.on_items_change.clone(),
            )
        };
        let mut taken = None;
        core.store.update(|s| {
            taken = take_item(&mut s.items, from, prioritized);
            s.refresh(max_size);
        });
        let taken = taken?;
        if let Some(hook) = on_items_change {
            hook(&core.store.with(|s| s.items.clone()));
        }
        Some(taken.value)
    }

    pub fn set_options(&self, patch: impl FnOnce(&mut QueuerOptions<T>)) {
        patch(&mut self.core.options.write().unwrap());
        self.core.schedule_next();
    }

    pub fn store(&self) -> &Store<QueuerState<T>> {
        &self.core.store
    }

    pub fn state(&self) -> QueuerState<T> {
        self.core.store.state()
    }

    pub fn size(&self) -> usize {
        self.core.store.with(|s| s.items.len())
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

impl<T: Clone + Send + Sync + 'static> fmt::Debug for Queuer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Queuer")
            .field("id", &self.core.id)
            .field("size", &self.size())
            .field("running", &self.is_running())
            .finish()
    }
}

impl<T: Clone + Send + Sync + 'static> QueueCore<T> {
    fn timer_id(&self) -> String {
        format!("{}:tick", self.id)
    }

    fn resolved_max_size(&self) -> usize {
        let state = self.store.state();
        self.options.read().unwrap().max_size.resolve(&state)
    }

    /// Arm the dispatch tick for when the next item is due
    fn schedule_next(self: &Arc<Self>) {
        if !self.store.with(|s| s.is_running) {
            return;
        }
        if self.store.with(|s| s.items.is_empty()) {
            self.store.update(|s| {
                s.is_idle = s.is_running;
                if s.status == Status::Pending {
                    s.status = Status::Idle;
                }
            });
            return;
        }
        let state = self.store.state();
        let wait = self.options.read().unwrap().wait.resolve(&state);
        let now = self.clock.now();
        let delay = self
            .last_dispatch
            .lock()
            .unwrap()
            .map(|last| (last + wait).saturating_duration_since(now))
            .unwrap_or(Duration::ZERO);

        let generation = self.timer_gen.fetch_add(1, Ordering::SeqCst) + 1;
        let weak = Arc::downgrade(self);
        let armed = self.timers.schedule_once(
            &self.timer_id(),
            delay,
            Box::new(move || {
                if let Some(core) = weak.upgrade() {
                    core.tick(generation);
                }
            }),
        );
        if let Err(err) = armed {
            tracing::error!(primitive = %self.id, error = %err, "failed to arm dispatch tick");
        }
    }

    fn disarm(&self) {
        self.timer_gen.fetch_add(1, Ordering::SeqCst);
        let _ = self.timers.cancel(&self.timer_id());
    }

    fn tick(self: &Arc<Self>, generation: u64) {
        if self.timer_gen.load(Ordering::SeqCst) != generation {
            return;
        }
        if !self.store.with(|s| s.is_running) {
            return;
        }
        self.drain_expired();
        // a flush may have dispatched since this tick was armed; re-check
        // the spacing before taking an item
        let state = self.store.state();
        let wait = self.options.read().unwrap().wait.resolve(&state);
        let now = self.clock.now();
        if let Some(last) = *self.last_dispatch.lock().unwrap() {
            if now < last + wait {
                self.schedule_next();
                return;
            }
        }
        if let Some(Err(err)) = self.dispatch_next(None) {
            // the loop keeps going; the error was routed to on_error
            tracing::warn!(primitive = %self.id, error = %err, "queued target failed");
        }
        self.schedule_next();
    }

    /// Take and execute one item; `None` when the buffer is empty
    fn dispatch_next(&self, direction: Option<Position>) -> Option<Result<T>> {
        let state = self.store.state();
        let (from, prioritized, max_size, on_execute, on_items_change, on_error) = {
            let opts = self.options.read().unwrap();
            (
                direction.unwrap_or(opts.get_items_from),
                opts.get_priority.is_some(),
                opts.max_size.resolve(&state),
                opts.on_execute.clone(),
                opts.on_items_change.clone(),
                opts.on_error.clone(),
            )
        };

        let mut taken = None;
        self.store.update(|s| {
            taken = take_item(&mut s.items, from, prioritized);
            s.refresh(max_size);
            if taken.is_some() {
                s.status = Status::Executing;
            }
        });
        let item = taken?;
        *self.last_dispatch.lock().unwrap() = Some(self.clock.now());
        if let Some(hook) = &on_items_change {
            hook(&self.store.with(|s| s.items.clone()));
        }

        tracing::debug!(primitive = %self.id, "dispatching queued item");
        let outcome = (self.target)(item.value.clone());
        let result = match outcome {
            Ok(()) => {
                self.store.update(|s| {
                    s.execution_count += 1;
                    s.success_count += 1;
                    s.settle_count += 1;
                    s.total_items_processed += 1;
                    s.status = if s.items.is_empty() {
                        Status::Idle
                    } else {
                        Status::Pending
                    };
                });
                if let Some(hook) = on_execute {
                    hook(&item.value);
                }
                Ok(item.value)
            }
            Err(source) => {
                self.store.update(|s| {
                    s.error_count += 1;
                    s.settle_count += 1;
                    s.total_items_processed += 1;
                    s.status = if s.items.is_empty() {
                        Status::Idle
                    } else {
                        Status::Pending
                    };
                });
                if let Some(hook) = &on_error {
                    hook(&source);
                }
                Err(PacerError::TargetFailed { source })
            }
        };
        Some(result)
    }

    /// Drop aged-out items before a take
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

impl<T> Drop for QueueCore<T> {
    fn drop(&mut self) {
        let _ = self.timers.cancel(&format!("{}:tick", self.id));
    }
}
