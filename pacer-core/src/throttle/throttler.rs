//! Synchronous throttler

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{PacerError, Result, TargetError};
use crate::options::{Adaptive, TargetFn};
use crate::store::Store;
use crate::timing::{Clock, StdTimerBackend, SystemClock, TimerBackend};
use crate::Status;

/// Observable state of a [`Throttler`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThrottlerState<A> {
    pub status: Status,
    /// Dispatched calls that completed successfully
    pub execution_count: u64,
    /// True while a trailing fire is armed
    pub is_pending: bool,
    /// True when a call right now would run on the leading edge
    pub can_leading_execute: bool,
    /// True when a call right now could arm a trailing fire
    pub can_trailing_execute: bool,
    pub last_args: Option<A>,
    #[serde(skip)]
    pub last_execution_time: Option<Instant>,
    #[serde(skip)]
    pub next_execution_time: Option<Instant>,
}

impl<A> Default for ThrottlerState<A> {
    fn default() -> Self {
        Self {
            status: Status::Idle,
            execution_count: 0,
            is_pending: false,
            can_leading_execute: true,
            can_trailing_execute: true,
            last_args: None,
            last_execution_time: None,
            next_execution_time: None,
        }
    }
}

/// Configuration for a [`Throttler`]; both edges default to on
pub struct ThrottlerOptions<A> {
    pub(crate) enabled: Adaptive<bool, ThrottlerState<A>>,
    pub(crate) wait: Adaptive<Duration, ThrottlerState<A>>,
    pub(crate) leading: bool,
    pub(crate) trailing: bool,
    pub(crate) initial_state: Option<ThrottlerState<A>>,
    pub(crate) on_execute: Option<Arc<dyn Fn(&ThrottlerState<A>) + Send + Sync>>,
}

impl<A: Clone> ThrottlerOptions<A> {
    /// Create options with the given minimum spacing
    pub fn new(wait: Duration) -> Self {
        Self {
            enabled: Adaptive::fixed(true),
            wait: Adaptive::fixed(wait),
            leading: true,
            trailing: true,
            initial_state: None,
            on_execute: None,
        }
    }

    pub fn wait(mut self, wait: Duration) -> Self {
        self.wait = Adaptive::fixed(wait);
        self
    }

    pub fn wait_with<F>(mut self, f: F) -> Self
    where
        F: Fn(&ThrottlerState<A>) -> Duration + Send + Sync + 'static,
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
        F: Fn(&ThrottlerState<A>) -> bool + Send + Sync + 'static,
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

    pub fn initial_state(mut self, state: ThrottlerState<A>) -> Self {
        self.initial_state = Some(state);
        self
    }

    pub fn on_execute<F>(mut self, f: F) -> Self
    where
        F: Fn(&ThrottlerState<A>) + Send + Sync + 'static,
    {
        self.on_execute = Some(Arc::new(f));
        self
    }
}

impl<A: Clone> Clone for ThrottlerOptions<A> {
    fn clone(&self) -> Self {
        Self {
            enabled: self.enabled.clone(),
            wait: self.wait.clone(),
            leading: self.leading,
            trailing: self.trailing,
            initial_state: self.initial_state.clone(),
            on_execute: self.on_execute.clone(),
        }
    }
}

struct ThrottleCore<A> {
    id: String,
    store: Store<ThrottlerState<A>>,
    options: RwLock<ThrottlerOptions<A>>,
    target: TargetFn<A>,
    clock: Arc<dyn Clock>,
    timers: Arc<dyn TimerBackend>,
    timer_gen: AtomicU64,
}

/// Enforces a minimum spacing of `wait` between target runs
pub struct Throttler<A: Clone + Send + Sync + 'static> {
    core: Arc<ThrottleCore<A>>,
}

impl<A: Clone + Send + Sync + 'static> Throttler<A> {
    /// Create a throttler with the system clock and a thread timer backend
    pub fn new<F>(target: F, options: ThrottlerOptions<A>) -> Self
    where
        F: Fn(A) -> std::result::Result<(), TargetError> + Send + Sync + 'static,
    {
        Self::with_timing(
            target,
            options,
            Arc::new(SystemClock),
            Arc::new(StdTimerBackend::new()),
        )
    }

    /// Create a throttler with an injected clock and timer backend
    pub fn with_timing<F>(
        target: F,
        options: ThrottlerOptions<A>,
        clock: Arc<dyn Clock>,
        timers: Arc<dyn TimerBackend>,
    ) -> Self
    where
        F: Fn(A) -> std::result::Result<(), TargetError> + Send + Sync + 'static,
    {
        let mut initial = options.initial_state.clone().unwrap_or_default();
        initial.is_pending = false;
        initial.next_execution_time = None;
        initial.can_leading_execute = true;
        initial.can_trailing_execute = true;
        initial.status = Status::Idle;

        Self {
            core: Arc::new(ThrottleCore {
                id: format!("throttler-{}", Uuid::new_v4()),
                store: Store::new(initial),
                options: RwLock::new(options),
                target: Arc::new(target),
                clock,
                timers,
                timer_gen: AtomicU64::new(0),
            }),
        }
    }

    /// Run now if the spacing window is open, else defer to the trailing fire
    ///
    /// Returns `Ok(true)` when the call ran or was deferred, `Ok(false)`
    /// when it was dropped (disabled, or inside the window with trailing
    /// off). A leading-edge target failure surfaces as `Err`.
    pub fn maybe_execute(&self, args: A) -> Result<bool> {
        self.core.maybe_execute(args)
    }

    /// Fire the armed trailing call now
    pub fn flush(&self) -> Result<()> {
        let core = &self.core;
        let state = core.store.state();
        if !state.is_pending {
            return Ok(());
        }
        core.disarm();
        let result = match state.last_args {
            Some(args) => {
                core.store.update(|s| s.status = Status::Executing);
                core.dispatch(args)
            }
            None => Ok(()),
        };
        core.settle();
        result
    }

    /// Drop the trailing timer and pending arguments; idempotent
    pub fn cancel(&self) {
        let core = &self.core;
        core.disarm();
        core.store.update(|s| {
            s.is_pending = false;
            s.last_args = None;
            s.next_execution_time = None;
            s.can_leading_execute = true;
            s.can_trailing_execute = true;
            s.status = Status::Idle;
        });
    }

    pub fn set_options(&self, patch: impl FnOnce(&mut ThrottlerOptions<A>)) {
        patch(&mut self.core.options.write().unwrap());
    }

    pub fn store(&self) -> &Store<ThrottlerState<A>> {
        &self.core.store
    }

    pub fn state(&self) -> ThrottlerState<A> {
        self.core.store.state()
    }

    pub fn execution_count(&self) -> u64 {
        self.core.store.with(|s| s.execution_count)
    }

    pub fn is_pending(&self) -> bool {
        self.core.store.with(|s| s.is_pending)
    }
}

impl<A: Clone + Send + Sync + 'static> fmt::Debug for Throttler<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Throttler")
            .field("id", &self.core.id)
            .field("pending", &self.is_pending())
            .field("executions", &self.execution_count())
            .finish()
    }
}

impl<A: Clone + Send + Sync + 'static> ThrottleCore<A> {
    fn timer_id(&self) -> String {
        format!("{}:trailing", self.id)
    }

    fn maybe_execute(self: &Arc<Self>, args: A) -> Result<bool> {
        let state = self.store.state();
        let (enabled, wait, leading, trailing) = {
            let opts = self.options.read().unwrap();
            (
                opts.enabled.resolve(&state),
                opts.wait.resolve(&state),
                opts.leading,
                opts.trailing,
            )
        };
        if !enabled {
            self.store.update(|s| s.status = Status::Disabled);
            tracing::trace!(primitive = %self.id, "call dropped while disabled");
            return Ok(false);
        }

        let now = self.clock.now();
        let window_open = match state.last_execution_time {
            None => true,
            Some(last) => now.duration_since(last) >= wait,
        };

        if window_open && leading {
            self.store.update(|s| {
                s.last_args = Some(args.clone());
                s.can_leading_execute = false;
                s.status = Status::Executing;
            });
            // the window-close fire reopens the leading edge
            self.arm(wait)?;
            let result = self.dispatch(args);
            self.store.update(|s| {
                if !s.is_pending {
                    s.status = Status::Idle;
                }
            });
            result?;
            return Ok(true);
        }

        if !trailing {
            // inside the window with no trailing edge: the call is dropped
            return Ok(false);
        }

        let deadline = if state.is_pending {
            state.next_execution_time.unwrap_or(now + wait)
        } else {
            match state.last_execution_time {
                Some(last) if now.duration_since(last) < wait => last + wait,
                _ => now + wait,
            }
        };
        if !state.is_pending {
            self.arm(deadline.saturating_duration_since(now))?;
        }
        self.store.update(|s| {
            s.last_args = Some(args.clone());
            s.is_pending = true;
            s.can_leading_execute = false;
            s.can_trailing_execute = false;
            s.status = Status::Pending;
            s.next_execution_time = Some(deadline);
        });
        Ok(true)
    }

    fn arm(self: &Arc<Self>, delay: Duration) -> Result<()> {
        let generation = self.timer_gen.fetch_add(1, Ordering::SeqCst) + 1;
        let weak = Arc::downgrade(self);
        self.timers.schedule_once(
            &self.timer_id(),
            delay,
            Box::new(move || {
                if let Some(core) = weak.upgrade() {
                    core.on_trailing_fire(generation);
                }
            }),
        )
    }

    fn disarm(&self) {
        self.timer_gen.fetch_add(1, Ordering::SeqCst);
        let _ = self.timers.cancel(&self.timer_id());
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
        if enabled && trailing && state.is_pending {
            if let Some(args) = state.last_args {
                self.store.update(|s| s.status = Status::Executing);
                if let Err(err) = self.dispatch(args) {
                    tracing::error!(
                        primitive = %self.id,
                        error = %err,
                        "throttled target failed on trailing edge"
                    );
                }
            }
        }
        self.settle();
    }

    fn settle(&self) {
        self.store.update(|s| {
            s.is_pending = false;
            s.can_leading_execute = true;
            s.can_trailing_execute = true;
            s.next_execution_time = None;
            s.status = Status::Idle;
        });
    }

    fn dispatch(&self, args: A) -> Result<()> {
        let now = self.clock.now();
        tracing::debug!(primitive = %self.id, "dispatching throttled call");
        match (self.target)(args) {
            Ok(()) => {
                self.store.update(|s| {
                    s.execution_count += 1;
                    s.last_execution_time = Some(now);
                });
                let on_execute = self.options.read().unwrap().on_execute.clone();
                if let Some(hook) = on_execute {
                    hook(&self.store.state());
                }
                Ok(())
            }
            Err(source) => Err(PacerError::TargetFailed { source }),
        }
    }
}

impl<A> Drop for ThrottleCore<A> {
    fn drop(&mut self) {
        let _ = self.timers.cancel(&format!("{}:trailing", self.id));
    }
}
