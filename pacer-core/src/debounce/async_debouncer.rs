//! Asynchronous debouncer
//!
//! Same edge policy as the synchronous [`Debouncer`], plus promise
//! semantics: `maybe_execute` resolves with the result of the execution
//! its scheduling produced, superseded callers resolve with `None`, and at
//! most one target invocation is in flight at any time. A call arriving
//! while one is in flight re-arms the quiescence timer after the in-flight
//! call settles.
//!
//! [`Debouncer`]: super::Debouncer

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::{oneshot, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::{PacerError, Result, TargetError};
use crate::options::{Adaptive, AsyncTargetFn};
use crate::store::Store;
use crate::timing::{Clock, TokioClock};
use crate::Status;

/// Observable state of an [`AsyncDebouncer`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AsyncDebouncerState<A, R> {
    pub status: Status,
    /// Successful completions of the target
    pub execution_count: u64,
    pub success_count: u64,
    pub error_count: u64,
    /// Settlements of either outcome (aborts excluded)
    pub settle_count: u64,
    pub is_pending: bool,
    pub is_executing: bool,
    pub can_leading_execute: bool,
    pub last_args: Option<A>,
    pub last_result: Option<R>,
    #[serde(skip)]
    pub last_execution_time: Option<Instant>,
    #[serde(skip)]
    pub next_execution_time: Option<Instant>,
}

impl<A, R> Default for AsyncDebouncerState<A, R> {
    fn default() -> Self {
        Self {
            status: Status::Idle,
            execution_count: 0,
            success_count: 0,
            error_count: 0,
            settle_count: 0,
            is_pending: false,
            is_executing: false,
            can_leading_execute: true,
            last_args: None,
            last_result: None,
            last_execution_time: None,
            next_execution_time: None,
        }
    }
}

/// Configuration for an [`AsyncDebouncer`]
pub struct AsyncDebouncerOptions<A, R> {
    pub(crate) enabled: Adaptive<bool, AsyncDebouncerState<A, R>>,
    pub(crate) wait: Adaptive<Duration, AsyncDebouncerState<A, R>>,
    pub(crate) leading: bool,
    pub(crate) trailing: bool,
    /// None resolves to "throw iff no `on_error` hook is registered"
    pub(crate) throw_on_error: Option<bool>,
    pub(crate) initial_state: Option<AsyncDebouncerState<A, R>>,
    pub(crate) on_success: Option<Arc<dyn Fn(&R) + Send + Sync>>,
    pub(crate) on_error: Option<Arc<dyn Fn(&TargetError) + Send + Sync>>,
    pub(crate) on_settled: Option<Arc<dyn Fn(&AsyncDebouncerState<A, R>) + Send + Sync>>,
}

impl<A: Clone, R: Clone> AsyncDebouncerOptions<A, R> {
    pub fn new(wait: Duration) -> Self {
        Self {
            enabled: Adaptive::fixed(true),
            wait: Adaptive::fixed(wait),
            leading: false,
            trailing: true,
            throw_on_error: None,
            initial_state: None,
            on_success: None,
            on_error: None,
            on_settled: None,
        }
    }

    pub fn wait(mut self, wait: Duration) -> Self {
        self.wait = Adaptive::fixed(wait);
        self
    }

    pub fn wait_with<F>(mut self, f: F) -> Self
    where
        F: Fn(&AsyncDebouncerState<A, R>) -> Duration + Send + Sync + 'static,
    {
        self.wait = Adaptive::computed(f);
        self
    }

    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = Adaptive::fixed(enabled);
        self
    }

    pub fn enabled_with<F>(mut self, f: F) -> Self
    where
        F: Fn(&AsyncDebouncerState<A, R>) -> bool + Send + Sync + 'static,
    {
        self.enabled = Adaptive::computed(f);
        self
    }

    pub fn leading(mut self, leading: bool) -> Self {
        self.leading = leading;
        self
    }

    pub fn trailing(mut self, trailing: bool) -> Self {
        self.trailing = trailing;
        self
    }

    /// Whether target failures reject the awaited call
    pub fn throw_on_error(mut self, throw: bool) -> Self {
        self.throw_on_error = Some(throw);
        self
    }

    pub fn initial_state(mut self, state: AsyncDebouncerState<A, R>) -> Self {
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
        F: Fn(&AsyncDebouncerState<A, R>) + Send + Sync + 'static,
    {
        self.on_settled = Some(Arc::new(f));
        self
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct Burst {
    calls: u32,
    leading_fired: bool,
}

/// Single-flight bookkeeping
enum Flight<A> {
    Idle,
    /// Quiescence timer armed, nothing executing
    Scheduled,
    Running,
    /// Running, with a call recorded during the flight that re-arms after settle
    RunningWithPending(A),
}

impl<A> Flight<A> {
    fn in_flight(&self) -> bool {
        matches!(self, Flight::Running | Flight::RunningWithPending(_))
    }
}

struct AsyncDebounceCore<A, R> {
    id: String,
    store: Store<AsyncDebouncerState<A, R>>,
    options: RwLock<AsyncDebouncerOptions<A, R>>,
    target: AsyncTargetFn<A, R>,
    clock: Arc<dyn Clock>,
    flight: Mutex<Flight<A>>,
    /// The awaiting caller whose scheduling is current; superseded senders
    /// are resolved with `None` on replacement
    waiter: Mutex<Option<oneshot::Sender<Result<Option<R>>>>>,
    timer_task: Mutex<Option<JoinHandle<()>>>,
    timer_gen: AtomicU64,
    burst: Mutex<Burst>,
    abort_root: Mutex<CancellationToken>,
    settled: Notify,
}

/// Debouncer for promise-returning targets with single-flight semantics
pub struct AsyncDebouncer<A, R>
where
    A: Clone + Send + Sync + 'static,
    R: Clone + Send + Sync + 'static,
{
    core: Arc<AsyncDebounceCore<A, R>>,
}

impl<A, R> AsyncDebouncer<A, R>
where
    A: Clone + Send + Sync + 'static,
    R: Clone + Send + Sync + 'static,
{
    /// Create a debouncer reading time through the tokio clock
    pub fn new<F, Fut>(target: F, options: AsyncDebouncerOptions<A, R>) -> Self
    where
        F: Fn(A, CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<R, TargetError>> + Send + 'static,
    {
        Self::with_clock(target, options, Arc::new(TokioClock))
    }

    /// Create a debouncer with an injected clock
    pub fn with_clock<F, Fut>(
        target: F,
        options: AsyncDebouncerOptions<A, R>,
        clock: Arc<dyn Clock>,
    ) -> Self
    where
        F: Fn(A, CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<R, TargetError>> + Send + 'static,
    {
        let target: AsyncTargetFn<A, R> =
            Arc::new(move |args, token| Box::pin(target(args, token)));
        let mut initial = options.initial_state.clone().unwrap_or_default();
        initial.is_pending = false;
        initial.is_executing = false;
        initial.next_execution_time = None;
        initial.can_leading_execute = true;
        initial.status = Status::Idle;

        Self {
            core: Arc::new(AsyncDebounceCore {
                id: format!("async-debouncer-{}", Uuid::new_v4()),
                store: Store::new(initial),
                options: RwLock::new(options),
                target,
                clock,
                flight: Mutex::new(Flight::Idle),
                waiter: Mutex::new(None),
                timer_task: Mutex::new(None),
                timer_gen: AtomicU64::new(0),
                burst: Mutex::new(Burst::default()),
                abort_root: Mutex::new(CancellationToken::new()),
                settled: Notify::new(),
            }),
        }
    }

    /// Record a call; resolves with the result of the execution this call's
    /// scheduling produced
    ///
    /// Superseded callers resolve `Ok(None)` immediately. Rejections of the
    /// target surface as `Err` only when the error policy says so; an
    /// aborted execution rejects with [`PacerError::Aborted`].
    pub async fn maybe_execute(&self, args: A) -> Result<Option<R>> {
        let core = &self.core;
        let state = core.store.state();
        let (enabled, wait, leading, trailing) = {
            let opts = core.options.read().unwrap();
            (
                opts.enabled.resolve(&state),
                opts.wait.resolve(&state),
                opts.leading,
                opts.trailing,
            )
        };
        if !enabled {
            core.store.update(|s| s.status = Status::Disabled);
            return Ok(None);
        }
        if !leading && !trailing {
            return Ok(None);
        }

        let (tx, rx) = oneshot::channel();
        if let Some(superseded) = core.waiter.lock().unwrap().replace(tx) {
            let _ = superseded.send(Ok(None));
        }

        let now = core.clock.now();
        let in_flight = core.flight.lock().unwrap().in_flight();
        let fire_leading =
            leading && !in_flight && core.store.with(|s| s.can_leading_execute);
        {
            let mut burst = core.burst.lock().unwrap();
            burst.calls += 1;
            if fire_leading {
                burst.leading_fired = true;
            }
        }
        core.store.update(|s| {
            s.last_args = Some(args.clone());
            s.is_pending = true;
            if !s.is_executing {
                s.status = Status::Pending;
            }
            s.next_execution_time = Some(now + wait);
            if fire_leading {
                s.can_leading_execute = false;
            }
        });

        if in_flight {
            let mut flight = core.flight.lock().unwrap();
            if flight.in_flight() {
                // timer re-arms once the in-flight call settles
                *flight = Flight::RunningWithPending(args);
            } else {
                drop(flight);
                core.arm(wait);
            }
        } else if fire_leading {
            core.arm(wait);
            let waiter = core.waiter.lock().unwrap().take();
            core.spawn_execute(args, waiter);
        } else {
            core.arm(wait);
        }

        match rx.await {
            Ok(result) => result,
            Err(_) => Ok(None),
        }
    }

    /// Dispatch the pending call now, bypassing the timer
    ///
    /// Waits for an in-flight execution to settle first, then runs the
    /// pending arguments and returns that execution's outcome.
    pub async fn flush(&self) -> Result<Option<R>> {
        let core = &self.core;
        loop {
            let mut notified = std::pin::pin!(core.settled.notified());
            notified.as_mut().enable();
            if !core.store.with(|s| s.is_pending) {
                return Ok(None);
            }
            if !core.flight.lock().unwrap().in_flight() {
                break;
            }
            notified.await;
        }

        core.disarm();
        *core.burst.lock().unwrap() = Burst::default();
        let args = core.store.with(|s| s.last_args.clone());
        match args {
            Some(args) => {
                core.store.update(|s| {
                    s.is_pending = false;
                    s.can_leading_execute = true;
                    s.next_execution_time = None;
                });
                core.flight_running();
                let waiter = core.waiter.lock().unwrap().take();
                Arc::clone(core).execute(args, waiter).await
            }
            None => Ok(None),
        }
    }

    /// Drop the pending call and timer; the superseded awaiter resolves `None`
    pub fn cancel(&self) {
        let core = &self.core;
        core.disarm();
        *core.burst.lock().unwrap() = Burst::default();
        {
            let mut flight = core.flight.lock().unwrap();
            match std::mem::replace(&mut *flight, Flight::Idle) {
                Flight::Running | Flight::RunningWithPending(_) => *flight = Flight::Running,
                _ => {}
            }
        }
        if let Some(tx) = core.waiter.lock().unwrap().take() {
            let _ = tx.send(Ok(None));
        }
        core.store.update(|s| {
            s.is_pending = false;
            s.last_args = None;
            s.next_execution_time = None;
            s.can_leading_execute = true;
            if !s.is_executing {
                s.status = Status::Idle;
            }
        });
    }

    /// [`cancel`](Self::cancel), plus abort the in-flight execution's token
    pub fn abort(&self) {
        self.cancel();
        let mut root = self.core.abort_root.lock().unwrap();
        root.cancel();
        *root = CancellationToken::new();
    }

    /// Token that fires when [`abort`](Self::abort) is called
    pub fn abort_signal(&self) -> CancellationToken {
        self.core.abort_root.lock().unwrap().child_token()
    }

    pub fn set_options(&self, patch: impl FnOnce(&mut AsyncDebouncerOptions<A, R>)) {
        patch(&mut self.core.options.write().unwrap());
    }

    pub fn store(&self) -> &Store<AsyncDebouncerState<A, R>> {
        &self.core.store
    }

    pub fn state(&self) -> AsyncDebouncerState<A, R> {
        self.core.store.state()
    }

    pub fn execution_count(&self) -> u64 {
        self.core.store.with(|s| s.execution_count)
    }

    pub fn is_pending(&self) -> bool {
        self.core.store.with(|s| s.is_pending)
    }

    pub fn is_executing(&self) -> bool {
        self.core.store.with(|s| s.is_executing)
    }
}

impl<A, R> fmt::Debug for AsyncDebouncer<A, R>
where
    A: Clone + Send + Sync + 'static,
    R: Clone + Send + Sync + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncDebouncer")
            .field("id", &self.core.id)
            .field("pending", &self.is_pending())
            .field("executing", &self.is_executing())
            .finish()
    }
}

impl<A, R> Drop for AsyncDebouncer<A, R>
where
    A: Clone + Send + Sync + 'static,
    R: Clone + Send + Sync + 'static,
{
    fn drop(&mut self) {
        self.core.disarm();
        self.core.abort_root.lock().unwrap().cancel();
    }
}

impl<A, R> AsyncDebounceCore<A, R>
where
    A: Clone + Send + Sync + 'static,
    R: Clone + Send + Sync + 'static,
{
    fn arm(self: &Arc<Self>, wait: Duration) {
        {
            let mut flight = self.flight.lock().unwrap();
            if flight.in_flight() {
                return; // settle path re-arms
            }
            *flight = Flight::Scheduled;
        }
        let generation = self.timer_gen.fetch_add(1, Ordering::SeqCst) + 1;
        let weak = Arc::downgrade(self);
        let task = tokio::spawn(async move {
            tokio::time::sleep(wait).await;
            if let Some(core) = weak.upgrade() {
                core.on_trailing_fire(generation);
            }
        });
        if let Some(old) = self.timer_task.lock().unwrap().replace(task) {
            old.abort();
        }
    }

    fn disarm(&self) {
        self.timer_gen.fetch_add(1, Ordering::SeqCst);
        if let Some(task) = self.timer_task.lock().unwrap().take() {
            task.abort();
        }
    }

    fn flight_running(&self) {
        *self.flight.lock().unwrap() = Flight::Running;
    }

    fn on_trailing_fire(self: &Arc<Self>, generation: u64) {
        if self.timer_gen.load(Ordering::SeqCst) != generation {
            return;
        }
        let state = self.store.state();
        let (enabled, trailing) = {
            let opts = self.options.read().unwrap();
            (opts.enabled.resolve(&state), opts.trailing)
        };
        let burst = std::mem::take(&mut *self.burst.lock().unwrap());
        let run = enabled
            && trailing
            && state.is_pending
            && (!burst.leading_fired || burst.calls >= 2);

        {
            let mut flight = self.flight.lock().unwrap();
            if flight.in_flight() {
                if run {
                    if let Some(args) = state.last_args {
                        *flight = Flight::RunningWithPending(args);
                        return;
                    }
                }
                drop(flight);
                self.store.update(|s| s.is_pending = false);
                return;
            }
            if run && state.last_args.is_some() {
                *flight = Flight::Running;
            } else {
                *flight = Flight::Idle;
            }
        }

        if run {
            if let Some(args) = state.last_args {
                self.store.update(|s| {
                    s.is_pending = false;
                    s.can_leading_execute = true;
                    s.next_execution_time = None;
                });
                // this execution answers the caller whose scheduling it is
                let waiter = self.waiter.lock().unwrap().take();
                let core = Arc::clone(self);
                tokio::spawn(async move {
                    let _ = core.execute(args, waiter).await;
                });
                return;
            }
        }

        // window closed with nothing owed
        let waiter = self.waiter.lock().unwrap().take();
        self.store.update(|s| {
            s.is_pending = false;
            s.can_leading_execute = true;
            s.next_execution_time = None;
            s.status = Status::Idle;
        });
        if let Some(tx) = waiter {
            let _ = tx.send(Ok(None));
        }
    }

    fn spawn_execute(
        self: &Arc<Self>,
        args: A,
        waiter: Option<oneshot::Sender<Result<Option<R>>>>,
    ) {
        self.flight_running();
        let core = Arc::clone(self);
        tokio::spawn(async move {
            let _ = core.execute(args, waiter).await;
        });
    }

    /// Run the target once, route the outcome to the waiter captured when
    /// this flight started, then re-enter if a call arrived mid-flight
    async fn execute(
        self: Arc<Self>,
        args: A,
        waiter: Option<oneshot::Sender<Result<Option<R>>>>,
    ) -> Result<Option<R>> {
        self.store.update(|s| {
            s.is_executing = true;
            s.status = Status::Executing;
        });
        let token = self.abort_root.lock().unwrap().child_token();
        let started = self.clock.now();
        tracing::debug!(primitive = %self.id, "dispatching debounced async call");

        let fut = (self.target)(args, token.clone());
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
                    s.success_count += 1;
                    s.settle_count += 1;
                    s.last_result = Some(result.clone());
                    s.last_execution_time = Some(started);
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
                    s.last_execution_time = Some(started);
                });
                if let Some(hook) = &on_error {
                    hook(&source);
                } else if !throw {
                    tracing::warn!(primitive = %self.id, error = %source, "debounced target failed; error swallowed");
                }
                if throw {
                    Err(PacerError::TargetFailed { source })
                } else {
                    Ok(None)
                }
            }
            None => Err(PacerError::Aborted),
        };

        let echo = match &resolution {
            Ok(value) => Ok(value.clone()),
            Err(PacerError::Aborted) => Err(PacerError::Aborted),
            Err(_) => Ok(None), // the owned error goes to the waiter below
        };
        if let Some(tx) = waiter {
            let _ = tx.send(resolution);
            self.after_settle(on_settled);
            echo
        } else {
            self.after_settle(on_settled);
            resolution
        }
    }

    fn after_settle(self: &Arc<Self>, on_settled: Option<Arc<dyn Fn(&AsyncDebouncerState<A, R>) + Send + Sync>>) {
        let pending = {
            let mut flight = self.flight.lock().unwrap();
            match std::mem::replace(&mut *flight, Flight::Idle) {
                Flight::RunningWithPending(args) => Some(args),
                _ => None,
            }
        };
        self.store.update(|s| {
            s.is_executing = false;
            s.status = if s.is_pending { Status::Pending } else { Status::Settled };
        });
        if let Some(hook) = on_settled {
            hook(&self.store.state());
        }
        self.settled.notify_waiters();
        if pending.is_some() {
            let wait = {
                let state = self.store.state();
                self.options.read().unwrap().wait.resolve(&state)
            };
            self.arm(wait);
        }
    }
}
