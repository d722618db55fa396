//! Asynchronous rate limiter
//!
//! Same admission algorithm as the synchronous [`RateLimiter`]; admitted
//! calls await their own target execution, so callers get back the value
//! their call produced. Admission does not serialize executions: several
//! admitted calls may be in flight at once, bounded only by the window.
//!
//! [`RateLimiter`]: super::RateLimiter

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::{PacerError, Result, TargetError};
use crate::options::{Adaptive, AsyncTargetFn};
use crate::rate_limit::{admit, next_slot, WindowType};
use crate::store::Store;
use crate::timing::{Clock, TokioClock};
use crate::Status;

/// Observable state of an [`AsyncRateLimiter`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AsyncRateLimiterState<R> {
    pub status: Status,
    /// Admitted calls whose target settled successfully
    pub execution_count: u64,
    pub success_count: u64,
    pub error_count: u64,
    pub settle_count: u64,
    pub rejection_count: u64,
    /// True while at least one admitted call is executing
    pub is_executing: bool,
    pub last_result: Option<R>,
    #[serde(skip)]
    pub execution_times: Vec<Instant>,
    #[serde(skip)]
    pub window_start: Option<Instant>,
}

impl<R> Default for AsyncRateLimiterState<R> {
    fn default() -> Self {
        Self {
            status: Status::Idle,
            execution_count: 0,
            success_count: 0,
            error_count: 0,
            settle_count: 0,
            rejection_count: 0,
            is_executing: false,
            last_result: None,
            execution_times: Vec::new(),
            window_start: None,
        }
    }
}

/// Configuration for an [`AsyncRateLimiter`]
pub struct AsyncRateLimiterOptions<R> {
    pub(crate) enabled: Adaptive<bool, AsyncRateLimiterState<R>>,
    pub(crate) limit: Adaptive<u64, AsyncRateLimiterState<R>>,
    pub(crate) window: Adaptive<Duration, AsyncRateLimiterState<R>>,
    pub(crate) window_type: WindowType,
    pub(crate) throw_on_error: Option<bool>,
    pub(crate) initial_state: Option<AsyncRateLimiterState<R>>,
    pub(crate) on_success: Option<Arc<dyn Fn(&R) + Send + Sync>>,
    pub(crate) on_error: Option<Arc<dyn Fn(&TargetError) + Send + Sync>>,
    pub(crate) on_settled: Option<Arc<dyn Fn(&AsyncRateLimiterState<R>) + Send + Sync>>,
    pub(crate) on_reject: Option<Arc<dyn Fn(&AsyncRateLimiterState<R>) + Send + Sync>>,
}

impl<R: Clone> AsyncRateLimiterOptions<R> {
    pub fn new(limit: u64, window: Duration) -> Self {
        Self {
            enabled: Adaptive::fixed(true),
            limit: Adaptive::fixed(limit),
            window: Adaptive::fixed(window),
            window_type: WindowType::default(),
            throw_on_error: None,
            initial_state: None,
            on_success: None,
            on_error: None,
            on_settled: None,
            on_reject: None,
        }
    }

    pub fn limit(mut self, limit: u64) -> Self {
        self.limit = Adaptive::fixed(limit);
        self
    }

    pub fn limit_with<F>(mut self, f: F) -> Self
    where
        F: Fn(&AsyncRateLimiterState<R>) -> u64 + Send + Sync + 'static,
    {
        self.limit = Adaptive::computed(f);
        self
    }

    pub fn window(mut self, window: Duration) -> Self {
        self.window = Adaptive::fixed(window);
        self
    }

    pub fn window_type(mut self, window_type: WindowType) -> Self {
        self.window_type = window_type;
        self
    }

    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = Adaptive::fixed(enabled);
        self
    }

    pub fn enabled_with<F>(mut self, f: F) -> Self
    where
        F: Fn(&AsyncRateLimiterState<R>) -> bool + Send + Sync + 'static,
    {
        self.enabled = Adaptive::computed(f);
        self
    }

    pub fn throw_on_error(mut self, throw: bool) -> Self {
        self.throw_on_error = Some(throw);
        self
    }

    pub fn initial_state(mut self, state: AsyncRateLimiterState<R>) -> Self {
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
        F: Fn(&AsyncRateLimiterState<R>) + Send + Sync + 'static,
    {
        self.on_settled = Some(Arc::new(f));
        self
    }

    pub fn on_reject<F>(mut self, f: F) -> Self
    where
        F: Fn(&AsyncRateLimiterState<R>) + Send + Sync + 'static,
    {
        self.on_reject = Some(Arc::new(f));
        self
    }
}

struct AsyncRateLimitCore<A, R> {
    id: String,
    store: Store<AsyncRateLimiterState<R>>,
    options: RwLock<AsyncRateLimiterOptions<R>>,
    target: AsyncTargetFn<A, R>,
    clock: Arc<dyn Clock>,
    /// Number of admitted calls currently executing
    active: AtomicU64,
    abort_root: Mutex<CancellationToken>,
}

/// Admission-controlled pacing for promise-returning targets
pub struct AsyncRateLimiter<A, R>
where
    A: Clone + Send + Sync + 'static,
    R: Clone + Send + Sync + 'static,
{
    core: Arc<AsyncRateLimitCore<A, R>>,
}

impl<A, R> AsyncRateLimiter<A, R>
where
    A: Clone + Send + Sync + 'static,
    R: Clone + Send + Sync + 'static,
{
    /// Create a rate limiter reading time through the tokio clock
    pub fn new<F, Fut>(target: F, options: AsyncRateLimiterOptions<R>) -> Self
    where
        F: Fn(A, CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<R, TargetError>> + Send + 'static,
    {
        Self::with_clock(target, options, Arc::new(TokioClock))
    }

    /// Create a rate limiter with an injected clock
    pub fn with_clock<F, Fut>(
        target: F,
        options: AsyncRateLimiterOptions<R>,
        clock: Arc<dyn Clock>,
    ) -> Self
    where
        F: Fn(A, CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<R, TargetError>> + Send + 'static,
    {
        let target: AsyncTargetFn<A, R> =
            Arc::new(move |args, token| Box::pin(target(args, token)));
        let mut initial = options.initial_state.clone().unwrap_or_default();
        initial.execution_times = Vec::new();
        initial.window_start = None;
        initial.is_executing = false;
        initial.status = Status::Idle;

        Self {
            core: Arc::new(AsyncRateLimitCore {
                id: format!("async-rate-limiter-{}", Uuid::new_v4()),
                store: Store::new(initial),
                options: RwLock::new(options),
                target,
                clock,
                active: AtomicU64::new(0),
                abort_root: Mutex::new(CancellationToken::new()),
            }),
        }
    }

    /// Run the target iff a slot is free; the caller awaits its own result
    ///
    /// `Ok(Some(r))` when admitted and settled successfully, `Ok(None)`
    /// when rejected (or disabled, or the error policy swallowed a
    /// failure), `Err` on surfaced failures and aborts.
    pub async fn maybe_execute(&self, args: A) -> Result<Option<R>> {
        let core = &self.core;
        let state = core.store.state();
        let (enabled, limit, window, window_type) = {
            let opts = core.options.read().unwrap();
            (
                opts.enabled.resolve(&state),
                opts.limit.resolve(&state),
                opts.window.resolve(&state),
                opts.window_type,
            )
        };
        if !enabled {
            core.store.update(|s| s.status = Status::Disabled);
            return Ok(None);
        }

        let now = core.clock.now();
        let mut admitted = false;
        core.store.update(|s| {
            admitted = admit(
                &mut s.execution_times,
                &mut s.window_start,
                now,
                limit,
                window,
                window_type,
            );
            if !admitted {
                s.rejection_count += 1;
            }
        });

        if !admitted {
            tracing::debug!(primitive = %core.id, "call rejected by rate limit");
            let on_reject = core.options.read().unwrap().on_reject.clone();
            if let Some(hook) = on_reject {
                hook(&core.store.state());
            }
            return Ok(None);
        }

        core.active.fetch_add(1, Ordering::SeqCst);
        core.store.update(|s| {
            s.is_executing = true;
            s.status = Status::Executing;
        });

        let token = core.abort_root.lock().unwrap().child_token();
        let fut = (core.target)(args, token.clone());
        let outcome = tokio::select! {
            biased;
            _ = token.cancelled() => None,
            result = fut => Some(result),
        };

        let (throw, on_success, on_error, on_settled) = {
            let opts = core.options.read().unwrap();
            (
                opts.throw_on_error.unwrap_or(opts.on_error.is_none()),
                opts.on_success.clone(),
                opts.on_error.clone(),
                opts.on_settled.clone(),
            )
        };

        let resolution = match outcome {
            Some(Ok(result)) => {
                core.store.update(|s| {
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
                core.store.update(|s| {
                    s.error_count += 1;
                    s.settle_count += 1;
                });
                if let Some(hook) = &on_error {
                    hook(&source);
                } else if !throw {
                    tracing::warn!(primitive = %core.id, error = %source, "rate-limited target failed; error swallowed");
                }
                if throw {
                    Err(PacerError::TargetFailed { source })
                } else {
                    Ok(None)
                }
            }
            None => Err(PacerError::Aborted),
        };

        let remaining = core.active.fetch_sub(1, Ordering::SeqCst) - 1;
        core.store.update(|s| {
            s.is_executing = remaining > 0;
            s.status = if remaining > 0 {
                Status::Executing
            } else {
                Status::Settled
            };
        });
        if let Some(hook) = on_settled {
            hook(&core.store.state());
        }
        resolution
    }

    /// Delay until at least one execution slot frees
    pub fn until_next_window(&self) -> Duration {
        let core = &self.core;
        let state = core.store.state();
        let (window, window_type) = {
            let opts = core.options.read().unwrap();
            (opts.window.resolve(&state), opts.window_type)
        };
        next_slot(
            &state.execution_times,
            state.window_start,
            core.clock.now(),
            window,
            window_type,
        )
    }

    /// Abort in-flight executions; their awaiters reject with an abort error
    pub fn abort(&self) {
        let mut root = self.core.abort_root.lock().unwrap();
        root.cancel();
        *root = CancellationToken::new();
    }

    /// Token that fires when [`abort`](Self::abort) is called
    pub fn abort_signal(&self) -> CancellationToken {
        self.core.abort_root.lock().unwrap().child_token()
    }

    /// Forget the window occupancy; counters remain
    pub fn reset(&self) {
        self.core.store.update(|s| {
            s.execution_times.clear();
            s.window_start = None;
        });
    }

    pub fn set_options(&self, patch: impl FnOnce(&mut AsyncRateLimiterOptions<R>)) {
        patch(&mut self.core.options.write().unwrap());
    }

    pub fn store(&self) -> &Store<AsyncRateLimiterState<R>> {
        &self.core.store
    }

    pub fn state(&self) -> AsyncRateLimiterState<R> {
        self.core.store.state()
    }

    pub fn execution_count(&self) -> u64 {
        self.core.store.with(|s| s.execution_count)
    }

    pub fn rejection_count(&self) -> u64 {
        self.core.store.with(|s| s.rejection_count)
    }
}

impl<A, R> fmt::Debug for AsyncRateLimiter<A, R>
where
    A: Clone + Send + Sync + 'static,
    R: Clone + Send + Sync + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncRateLimiter")
            .field("id", &self.core.id)
            .field("executions", &self.execution_count())
            .field("rejections", &self.rejection_count())
            .finish()
    }
}

impl<A, R> Drop for AsyncRateLimiter<A, R>
where
    A: Clone + Send + Sync + 'static,
    R: Clone + Send + Sync + 'static,
{
    fn drop(&mut self) {
        self.core.abort_root.lock().unwrap().cancel();
    }
}
