//! Synchronous rate limiter

use std::fmt;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{PacerError, Result, TargetError};
use crate::options::{Adaptive, TargetFn};
use crate::rate_limit::{admit, next_slot, WindowType};
use crate::store::Store;
use crate::timing::{Clock, SystemClock};
use crate::Status;

/// Observable state of a [`RateLimiter`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct RateLimiterState {
    pub status: Status,
    /// Admitted calls that completed successfully
    pub execution_count: u64,
    /// Calls discarded by admission control
    pub rejection_count: u64,
    /// Execution timestamps inside the active window
    #[serde(skip)]
    pub execution_times: Vec<Instant>,
    /// Fixed-bucket anchor; `None` until the first fixed-window call
    #[serde(skip)]
    pub window_start: Option<Instant>,
}

/// Configuration for a [`RateLimiter`]
pub struct RateLimiterOptions {
    pub(crate) enabled: Adaptive<bool, RateLimiterState>,
    pub(crate) limit: Adaptive<u64, RateLimiterState>,
    pub(crate) window: Adaptive<Duration, RateLimiterState>,
    pub(crate) window_type: WindowType,
    pub(crate) initial_state: Option<RateLimiterState>,
    pub(crate) on_execute: Option<Arc<dyn Fn(&RateLimiterState) + Send + Sync>>,
    pub(crate) on_reject: Option<Arc<dyn Fn(&RateLimiterState) + Send + Sync>>,
}

impl RateLimiterOptions {
    /// Create options admitting `limit` executions per `window`
    pub fn new(limit: u64, window: Duration) -> Self {
        Self {
            enabled: Adaptive::fixed(true),
            limit: Adaptive::fixed(limit),
            window: Adaptive::fixed(window),
            window_type: WindowType::default(),
            initial_state: None,
            on_execute: None,
            on_reject: None,
        }
    }

    pub fn limit(mut self, limit: u64) -> Self {
        self.limit = Adaptive::fixed(limit);
        self
    }

    pub fn limit_with<F>(mut self, f: F) -> Self
    where
        F: Fn(&RateLimiterState) -> u64 + Send + Sync + 'static,
    {
        self.limit = Adaptive::computed(f);
        self
    }

    pub fn window(mut self, window: Duration) -> Self {
        self.window = Adaptive::fixed(window);
        self
    }

    pub fn window_with<F>(mut self, f: F) -> Self
    where
        F: Fn(&RateLimiterState) -> Duration + Send + Sync + 'static,
    {
        self.window = Adaptive::computed(f);
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
        F: Fn(&RateLimiterState) -> bool + Send + Sync + 'static,
    {
        self.enabled = Adaptive::computed(f);
        self
    }

    pub fn initial_state(mut self, state: RateLimiterState) -> Self {
        self.initial_state = Some(state);
        self
    }

    pub fn on_execute<F>(mut self, f: F) -> Self
    where
        F: Fn(&RateLimiterState) + Send + Sync + 'static,
    {
        self.on_execute = Some(Arc::new(f));
        self
    }

    /// Hook invoked for each call discarded by admission control
    pub fn on_reject<F>(mut self, f: F) -> Self
    where
        F: Fn(&RateLimiterState) + Send + Sync + 'static,
    {
        self.on_reject = Some(Arc::new(f));
        self
    }
}

impl Clone for RateLimiterOptions {
    fn clone(&self) -> Self {
        Self {
            enabled: self.enabled.clone(),
            limit: self.limit.clone(),
            window: self.window.clone(),
            window_type: self.window_type,
            initial_state: self.initial_state.clone(),
            on_execute: self.on_execute.clone(),
            on_reject: self.on_reject.clone(),
        }
    }
}

struct RateLimitCore<A> {
    id: String,
    store: Store<RateLimiterState>,
    options: RwLock<RateLimiterOptions>,
    target: TargetFn<A>,
    clock: Arc<dyn Clock>,
}

/// Admits a call iff the window still has an execution slot
pub struct RateLimiter<A: Clone + Send + Sync + 'static> {
    core: Arc<RateLimitCore<A>>,
}

impl<A: Clone + Send + Sync + 'static> RateLimiter<A> {
    /// Create a rate limiter with the system clock
    pub fn new<F>(target: F, options: RateLimiterOptions) -> Self
    where
        F: Fn(A) -> std::result::Result<(), TargetError> + Send + Sync + 'static,
    {
        Self::with_clock(target, options, Arc::new(SystemClock))
    }

    /// Create a rate limiter with an injected clock
    pub fn with_clock<F>(
        target: F,
        options: RateLimiterOptions,
        clock: Arc<dyn Clock>,
    ) -> Self
    where
        F: Fn(A) -> std::result::Result<(), TargetError> + Send + Sync + 'static,
    {
        let mut initial = options.initial_state.clone().unwrap_or_default();
        // monotonic fields do not survive a snapshot; the window restarts
        initial.execution_times = Vec::new();
        initial.window_start = None;
        initial.status = Status::Idle;

        Self {
            core: Arc::new(RateLimitCore {
                id: format!("rate-limiter-{}", Uuid::new_v4()),
                store: Store::new(initial),
                options: RwLock::new(options),
                target: Arc::new(target),
                clock,
            }),
        }
    }

    /// Run the target iff a slot is free in the active window
    ///
    /// `Ok(true)` means the call was admitted and dispatched; `Ok(false)`
    /// means it was rejected (or dropped while disabled). Rejections are
    /// discarded, never queued.
    pub fn maybe_execute(&self, args: A) -> Result<bool> {
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
            tracing::trace!(primitive = %core.id, "call dropped while disabled");
            return Ok(false);
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
            if admitted {
                s.status = Status::Executing;
            } else {
                s.rejection_count += 1;
            }
        });

        if !admitted {
            tracing::debug!(primitive = %core.id, "call rejected by rate limit");
            let on_reject = core.options.read().unwrap().on_reject.clone();
            if let Some(hook) = on_reject {
                hook(&core.store.state());
            }
            return Ok(false);
        }

        let result = match (core.target)(args) {
            Ok(()) => {
                core.store.update(|s| s.execution_count += 1);
                let on_execute = core.options.read().unwrap().on_execute.clone();
                if let Some(hook) = on_execute {
                    hook(&core.store.state());
                }
                Ok(true)
            }
            Err(source) => Err(PacerError::TargetFailed { source }),
        };
        core.store.update(|s| s.status = Status::Idle);
        result
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

    /// Forget the window occupancy; counters are observational and remain
    pub fn reset(&self) {
        self.core.store.update(|s| {
            s.execution_times.clear();
            s.window_start = None;
            s.status = Status::Idle;
        });
    }

    pub fn set_options(&self, patch: impl FnOnce(&mut RateLimiterOptions)) {
        patch(&mut self.core.options.write().unwrap());
    }

    pub fn store(&self) -> &Store<RateLimiterState> {
        &self.core.store
    }

    pub fn state(&self) -> RateLimiterState {
        self.core.store.state()
    }

    pub fn execution_count(&self) -> u64 {
        self.core.store.with(|s| s.execution_count)
    }

    pub fn rejection_count(&self) -> u64 {
        self.core.store.with(|s| s.rejection_count)
    }
}

impl<A: Clone + Send + Sync + 'static> fmt::Debug for RateLimiter<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RateLimiter")
            .field("id", &self.core.id)
            .field("executions", &self.execution_count())
            .field("rejections", &self.rejection_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use crate::timing::MockClock;

    fn harness(
        options: RateLimiterOptions,
    ) -> (RateLimiter<u32>, Arc<MockClock>, Arc<Mutex<Vec<u32>>>) {
        let clock = Arc::new(MockClock::new());
        let calls = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&calls);
        let limiter = RateLimiter::with_clock(
            move |arg: u32| {
                sink.lock().unwrap().push(arg);
                Ok(())
            },
            options,
            Arc::clone(&clock) as Arc<dyn Clock>,
        );
        (limiter, clock, calls)
    }

    #[test]
    fn test_sliding_window_admission() {
        let options =
            RateLimiterOptions::new(2, Duration::from_millis(1000)).window_type(WindowType::Sliding);
        let (limiter, clock, calls) = harness(options);

        assert!(limiter.maybe_execute(0).unwrap());
        clock.advance(Duration::from_millis(100));
        assert!(limiter.maybe_execute(1).unwrap());
        clock.advance(Duration::from_millis(100));
        assert!(!limiter.maybe_execute(2).unwrap());
        clock.advance(Duration::from_millis(700));
        assert!(!limiter.maybe_execute(3).unwrap());
        clock.advance(Duration::from_millis(200));
        // the execution at t=0 aged out at t=1000; t=1100 has one slot
        assert!(limiter.maybe_execute(4).unwrap());

        assert_eq!(*calls.lock().unwrap(), vec![0, 1, 4]);
        assert_eq!(limiter.execution_count(), 3);
        assert_eq!(limiter.rejection_count(), 2);
    }

    #[test]
    fn test_fixed_window_resets_at_boundary() {
        let options = RateLimiterOptions::new(2, Duration::from_millis(100));
        let (limiter, clock, _calls) = harness(options);

        assert!(limiter.maybe_execute(0).unwrap());
        assert!(limiter.maybe_execute(1).unwrap());
        assert!(!limiter.maybe_execute(2).unwrap());
        clock.advance(Duration::from_millis(100));
        assert!(limiter.maybe_execute(3).unwrap());
        assert_eq!(limiter.execution_count(), 3);
    }

    #[test]
    fn test_rejection_invokes_hook() {
        let rejections = Arc::new(Mutex::new(0u32));
        let sink = Arc::clone(&rejections);
        let options = RateLimiterOptions::new(0, Duration::from_millis(100))
            .on_reject(move |_| *sink.lock().unwrap() += 1);
        let (limiter, _clock, calls) = harness(options);

        assert!(!limiter.maybe_execute(1).unwrap());
        assert!(!limiter.maybe_execute(2).unwrap());
        assert!(calls.lock().unwrap().is_empty());
        assert_eq!(*rejections.lock().unwrap(), 2);
        assert_eq!(limiter.rejection_count(), 2);
    }

    #[test]
    fn test_until_next_window_sliding() {
        let options =
            RateLimiterOptions::new(1, Duration::from_millis(1000)).window_type(WindowType::Sliding);
        let (limiter, clock, _calls) = harness(options);
        limiter.maybe_execute(0).unwrap();
        clock.advance(Duration::from_millis(400));
        assert_eq!(limiter.until_next_window(), Duration::from_millis(600));
    }

    #[test]
    fn test_reset_clears_window_but_not_counters() {
        let options = RateLimiterOptions::new(1, Duration::from_millis(1000));
        let (limiter, _clock, _calls) = harness(options);
        limiter.maybe_execute(0).unwrap();
        assert!(!limiter.maybe_execute(1).unwrap());

        limiter.reset();
        assert!(limiter.maybe_execute(2).unwrap());
        assert_eq!(limiter.execution_count(), 2);
        assert_eq!(limiter.rejection_count(), 1);
    }

    #[test]
    fn test_target_error_consumes_slot_but_not_counter() {
        let clock = Arc::new(MockClock::new());
        let limiter: RateLimiter<u32> = RateLimiter::with_clock(
            |_| Err("downstream unavailable".into()),
            RateLimiterOptions::new(1, Duration::from_millis(1000)),
            clock,
        );
        assert!(limiter.maybe_execute(1).is_err());
        assert_eq!(limiter.execution_count(), 0);
        // the failed dispatch still consumed the window slot
        assert!(!limiter.maybe_execute(2).unwrap());
    }
}
