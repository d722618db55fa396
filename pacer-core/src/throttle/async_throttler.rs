//! Asynchronous throttler
//!
//! Same spacing policy as the synchronous [`Throttler`], plus promise
//! semantics: at most one target invocation in flight, callers await the
//! execution their scheduling produced, superseded callers resolve with
//! `None`, and the next trailing schedule is delayed until the in-flight
//! call settles.
//!
//! [`Throttler`]: super::Throttler

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::{PacerError, Result, TargetError};
use crate::options::{Adaptive, AsyncTargetFn};
use crate::store::Store;
use crate::timing::{Clock, TokioClock};
use crate::Status;

/// Observable state of an [`AsyncThrottler`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AsyncThrottlerState<A, R> {
    pub status: Status,
    /// Successful completions of the target
    pub execution_count: u64,
    pub success_count: u64,
    pub error_count: u64,
    pub settle_count: u64,
    pub is_pending: bool,
    pub is_executing: bool,
    pub can_leading_execute: bool,
    pub can_trailing_execute: bool,
    pub last_args: Option<A>,
    pub last_result: Option<R>,
    #[serde(skip)]
    pub last_execution_time: Option<Instant>,
    #[serde(skip)]
    pub next_execution_time: Option<Instant>,
}

impl<A, R> Default for AsyncThrottlerState<A, R> {
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
            can_trailing_execute: true,
            last_args: None,
            last_result: None,
            last_execution_time: None,
            next_execution_time: None,
        }
    }
}

/// Configuration for an [`AsyncThrottler`]; both edges default to on
pub struct AsyncThrottlerOptions<A, R> {
    pub(crate) enabled: Adaptive<bool, AsyncThrottlerState<A, R>>,
    pub(crate) wait: Adaptive<Duration, AsyncThrottlerState<A, R>>,
    pub(crate) leading: bool,
    pub(crate) trailing: bool,
    pub(crate) throw_on_error: Option<bool>,
    pub(crate) initial_state: Option<AsyncThrottlerState<A, R>>,
    pub(crate) on_success: Option<Arc<dyn Fn(&R) + Send + Sync>>,
    pub(crate) on_error: Option<Arc<dyn Fn(&TargetError) + Send + Sync>>,
    pub(crate) on_settled: Option<Arc<dyn Fn(&AsyncThrottlerState<A, R>) + Send + Sync>>,
}

impl<A: Clone, R: Clone> AsyncThrottlerOptions<A, R> {
    pub fn new(wait: Duration) -> Self {
        Self {
            enabled: Adaptive::fixed(true),
            wait: Adaptive::fixed(wait),
            leading: true,
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
        F: Fn(&AsyncThrottlerState<A, R>) -> Duration + Send + Sync + 'static,
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
        F: Fn(&AsyncThrottlerState<A, R>) -> bool + Send + Sync + 'static,
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

    pub fn throw_on_error(mut self, throw: bool) -> Self {
        self.throw_on_error = Some(throw);
        self
    }

    pub fn initial_state(mut self, state: AsyncThrottlerState<A, R>) -> Self {
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
        F: Fn(&AsyncThrottlerState<A, R>) + Send + Sync + 'static,
    {
        self.on_settled = Some(Arc::new(f));
        self
    }
}

/// Single-flight bookkeeping
enum Flight<A> {
    Idle,
    Scheduled,
    Running,
    RunningWithPending(A),
}

impl<A> Flight<A> {
    fn in_flight(&self) -> bool {
        matches!(self, Flight::Running | Flight::RunningWithPending(_))
    }
}

type Waiter<R> = oneshot::Sender<Result<Option<R>>>;

struct AsyncThrottleCore<A, R> {
    id: String,
    store: Store<AsyncThrottlerState<A, R>>,
    options: RwLock<AsyncThrottlerOptions<A, R>>,
    target: AsyncTargetFn<A, R>,
    clock: Arc<dyn Clock>,
    flight: Mutex<Flight<A>>,
    waiter: Mutex<Option<Waiter<R>>>,
    timer_task: Mutex<Option<JoinHandle<()>>>,
    timer_gen: AtomicU64,
    abort_root: Mutex<CancellationToken>,
}

/// Minimum-spacing pacing for promise-returning targets
pub struct AsyncThrottler<A, R>
where
    A: Clone + Send + Sync + 'static,
    R: Clone + Send + Sync + 'static,
{
    core: Arc<AsyncThrottleCore<A, R>>,
}

impl<A, R> AsyncThrottler<A, R>
where
    A: Clone + Send + Sync + 'static,
    R: Clone + Send + Sync + 'static,
{
    /// Create a throttler reading time through the tokio clock
    pub fn new<F, Fut>(target: F, options: AsyncThrottlerOptions<A, R>) -> Self
    where
        F: Fn(A, CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<R, TargetError>> + Send + 'static,
    {
        Self::with_clock(target, options, Arc::new(TokioClock))
    }

    /// Create a throttler with an injected clock
    pub fn with_clock<F, Fut>(
        target: F,
        options: AsyncThrottlerOptions<A, R>,
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
        initial.can_trailing_execute = true;
        initial.status = Status::Idle;

        Self {
            core: Arc::new(AsyncThrottleCore {
                id: format!("async-throttler-{}", Uuid::new_v4()),
                store: Store::new(initial),
                options: RwLock::new(options),
                target,
                clock,
                flight: Mutex::new(Flight::Idle),
                waiter: Mutex::new(None),
                timer_task: Mutex::new(None),
                timer_gen: AtomicU64::new(0),
                abort_root: Mutex::new(CancellationToken::new()),
            }),
        }
    }

    /// Run now if the spacing window is open, else await the trailing fire
    ///
    /// Resolves with the result of the execution this call's scheduling
    /// produced; superseded callers resolve `Ok(None)`.
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

        let now = core.clock.now();
        let window_open = match state.last_execution_time {
            None => true,
            Some(last) => now.duration_since(last) >= wait,
        };
        let in_flight = core.flight.lock().unwrap().in_flight();

        if window_open && leading && !in_flight {
            let (tx, rx) = oneshot::channel();
            if let Some(superseded) = core.waiter.lock().unwrap().replace(tx) {
                let _ = superseded.send(Ok(None));
            }
            core.store.update(|s| {
                s.last_args = Some(args.clone());
                s.can_leading_execute = false;
            });
            let waiter = core.waiter.lock().unwrap().take();
            core.spawn_execute(args, waiter);
            return match rx.await {
                Ok(result) => result,
                Err(_) => Ok(None),
            };
        }

        if !trailing {
            // inside the window with no trailing edge: the call is dropped
            return Ok(None);
        }

        let (tx, rx) = oneshot::channel();
        if let Some(superseded) = core.waiter.lock().unwrap().replace(tx) {
            let _ = superseded.send(Ok(None));
        }

        let deadline = if state.is_pending {
            state.next_execution_time
        } else {
            match state.last_execution_time {
                Some(last) if now.duration_since(last) < wait => Some(last + wait),
                _ => Some(now + wait),
            }
        };
        core.store.update(|s| {
            s.last_args = Some(args.clone());
            s.is_pending = true;
            s.can_leading_execute = false;
            s.can_trailing_execute = false;
            if !s.is_executing {
                s.status = Status::Pending;
            }
            s.next_execution_time = deadline;
        });

        if in_flight {
            let mut flight = core.flight.lock().unwrap();
            if flight.in_flight() {
                // re-schedule after the in-flight call settles
                *flight = Flight::RunningWithPending(args);
            } else {
                drop(flight);
                if !state.is_pending {
                    core.arm(deadline.map(|d| d.saturating_duration_since(now)).unwrap_or(wait));
                }
            }
        } else if !state.is_pending {
            core.arm(deadline.map(|d| d.saturating_duration_since(now)).unwrap_or(wait));
        }

        match rx.await {
            Ok(result) => result,
            Err(_) => Ok(None),
        }
    }

    /// Fire the armed trailing call now and await its outcome
    pub async fn flush(&self) -> Result<Option<R>> {
        let core = &self.core;
        if !core.store.with(|s| s.is_pending) {
            return Ok(None);
        }
        if core.flight.lock().unwrap().in_flight() {
            // the settle path re-schedules; flushing mid-flight is a no-op
            return Ok(None);
        }
        core.disarm();
        let args = core.store.with(|s| s.last_args.clone());
        match args {
            Some(args) => {
                core.store.update(|s| {
                    s.is_pending = false;
                    s.next_execution_time = None;
                });
                core.flight_running();
                let waiter = core.waiter.lock().unwrap().take();
                Arc::clone(core).execute(args, waiter).await
            }
            None => Ok(None),
        }
    }

    /// Drop the trailing timer and pending arguments; idempotent
    pub fn cancel(&self) {
        let core = &self.core;
        core.disarm();
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
            s.can_trailing_execute = true;
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

    pub fn set_options(&self, patch: impl FnOnce(&mut AsyncThrottlerOptions<A, R>)) {
        patch(&mut self.core.options.write().unwrap());
    }

    pub fn store(&self) -> &Store<AsyncThrottlerState<A, R>> {
        &self.core.store
    }

    pub fn state(&self) -> AsyncThrottlerState<A, R> {
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

impl<A, R> fmt::Debug for AsyncThrottler<A, R>
where
    A: Clone + Send + Sync + 'static,
    R: Clone + Send + Sync + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncThrottler")
            .field("id", &self.core.id)
            .field("pending", &self.is_pending())
            .field("executing", &self.is_executing())
            .finish()
    }
}

impl<A, R> Drop for AsyncThrottler<A, R>
where
    A: Clone + Send + Sync + 'static,
    R: Clone + Send + Sync + 'static,
{
    fn drop(&mut self) {
        self.core.disarm();
        self.core.abort_root.lock().unwrap().cancel();
    }
}

impl<A, R> AsyncThrottleCore<A, R>
where
    A: Clone + Send + Sync + 'static,
    R: Clone + Send + Sync + 'static,
{
    fn arm(self: &Arc<Self>, delay: Duration) {
        {
            let mut flight = self.flight.lock().unwrap();
            if flight.in_flight() {
                return;
            }
            *flight = Flight::Scheduled;
        }
        let generation = self.timer_gen.fetch_add(1, Ordering::SeqCst) + 1;
        let weak = Arc::downgrade(self);
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
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
        let run = enabled && trailing && state.is_pending;

        {
            let mut flight = self.flight.lock().unwrap();
            if flight.in_flight() {
                if run {
                    if let Some(args) = state.last_args {
                        *flight = Flight::RunningWithPending(args);
                        return;
                    }
                }
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
                    s.next_execution_time = None;
                });
                let waiter = self.waiter.lock().unwrap().take();
                let core = Arc::clone(self);
                tokio::spawn(async move {
                    let _ = core.execute(args, waiter).await;
                });
                return;
            }
        }

        let waiter = self.waiter.lock().unwrap().take();
        self.store.update(|s| {
            s.is_pending = false;
            s.can_leading_execute = true;
            s.can_trailing_execute = true;
            s.next_execution_time = None;
            s.status = Status::Idle;
        });
        if let Some(tx) = waiter {
            let _ = tx.send(Ok(None));
        }
    }

    fn spawn_execute(self: &Arc<Self>, args: A, waiter: Option<Waiter<R>>) {
        self.flight_running();
        let core = Arc::clone(self);
        tokio::spawn(async move {
            let _ = core.execute(args, waiter).await;
        });
    }

    /// Run the target once; spacing is measured from execution start
    async fn execute(self: Arc<Self>, args: A, waiter: Option<Waiter<R>>) -> Result<Option<R>> {
        let started = self.clock.now();
        self.store.update(|s| {
            s.is_executing = true;
            s.status = Status::Executing;
            s.last_execution_time = Some(started);
        });
        let token = self.abort_root.lock().unwrap().child_token();
        tracing::debug!(primitive = %self.id, "dispatching throttled async call");

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
                });
                if let Some(hook) = &on_error {
                    hook(&source);
                } else if !throw {
                    tracing::warn!(primitive = %self.id, error = %source, "throttled target failed; error swallowed");
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
            Err(_) => Ok(None),
        };
        let outcome = if let Some(tx) = waiter {
            let _ = tx.send(resolution);
            echo
        } else {
            resolution
        };
        self.after_settle(on_settled);
        outcome
    }

    fn after_settle(
        self: &Arc<Self>,
        on_settled: Option<Arc<dyn Fn(&AsyncThrottlerState<A, R>) + Send + Sync>>,
    ) {
        let pending = {
            let mut flight = self.flight.lock().unwrap();
            match std::mem::replace(&mut *flight, Flight::Idle) {
                Flight::RunningWithPending(args) => Some(args),
                _ => None,
            }
        };
        self.store.update(|s| {
            s.is_executing = false;
            if pending.is_none() {
                s.can_leading_execute = true;
            }
            s.status = if s.is_pending { Status::Pending } else { Status::Settled };
        });
        if let Some(hook) = on_settled {
            hook(&self.store.state());
        }
        if pending.is_some() {
            // the next schedule was delayed until this flight settled
            let state = self.store.state();
            let wait = self.options.read().unwrap().wait.resolve(&state);
            let now = self.clock.now();
            let delay = state
                .last_execution_time
                .map(|last| (last + wait).saturating_duration_since(now))
                .unwrap_or(wait);
            self.store.update(|s| {
                s.is_pending = true;
                s.next_execution_time = Some(now + delay);
            });
            self.arm(delay);
        }
    }
}
