//! Synchronous debouncer

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{PacerError, Result, TargetError};
use crate::options::{Adaptive, TargetFn};
use crate::store::Store;
use crate::timing::{Clock, StdTimerBackend, SystemClock, TimerBackend};
use crate::Status;

/// Observable state of a [`Debouncer`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DebouncerState<A> {
    pub status: Status,
    /// Dispatched calls that completed successfully
    pub execution_count: u64,
    /// True while the quiescence window is open
    pub is_pending: bool,
    /// True when the next call may run on the leading edge
    pub can_leading_execute: bool,
    /// Arguments of the most recent call
    pub last_args: Option<A>,
    #[serde(skip)]
    pub last_execution_time: Option<Instant>,
    #[serde(skip)]
    pub next_execution_time: Option<Instant>,
}

impl<A> Default for DebouncerState<A> {
    fn default() -> Self {
        Self {
            status: Status::Idle,
            execution_count: 0,
            is_pending: false,
            can_leading_execute: true,
            last_args: None,
            last_execution_time: None,
            next_execution_time: None,
        }
    }
}

/// Configuration for a [`Debouncer`]
///
/// `wait` and `enabled` may be computed from the current state; they are
/// re-resolved at every arming and firing decision.
pub struct DebouncerOptions<A> {
    pub(crate) enabled: Adaptive<bool, DebouncerState<A>>,
    pub(crate) wait: Adaptive<Duration, DebouncerState<A>>,
    pub(crate) leading: bool,
    pub(crate) trailing: bool,
    pub(crate) initial_state: Option<DebouncerState<A>>,
    pub(crate) on_execute: Option<Arc<dyn Fn(&DebouncerState<A>) + Send + Sync>>,
}

impl<A: Clone> DebouncerOptions<A> {
    /// Create options with the given quiescence window
    pub fn new(wait: Duration) -> Self {
        Self {
            enabled: Adaptive::fixed(true),
            wait: Adaptive::fixed(wait),
            leading: false,
            trailing: true,
            initial_state: None,
            on_execute: None,
        }
    }

    pub fn wait(mut self, wait: Duration) -> Self {
        self.wait = Adaptive::fixed(wait);
        self
    }

    /// Compute the wait per decision from the current state
    pub fn wait_with<F>(mut self, f: F) -> Self
    where
        F: Fn(&DebouncerState<A>) -> Duration + Send + Sync + 'static,
    {
        self.wait = Adaptive::computed(f);
        self
    }

    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = Adaptive::fixed(enabled);
        self
    }

    /// Compute enablement per call from the current state
    pub fn enabled_with<F>(mut self, f: F) -> Self
    where
        F: Fn(&DebouncerState<A>) -> bool + Send + Sync + 'static,
    {
        self.enabled = Adaptive::computed(f);
        self
    }

    /// Run the target on the first call of a burst
    pub fn leading(mut self, leading: bool) -> Self {
        self.leading = leading;
        self
    }

    /// Run the target after the burst goes quiet (default)
    pub fn trailing(mut self, trailing: bool) -> Self {
        self.trailing = trailing;
        self
    }

    /// Restore a previously captured state snapshot
    pub fn initial_state(mut self, state: DebouncerState<A>) -> Self {
        self.initial_state = Some(state);
        self
    }

    /// Hook invoked after each successful dispatch
    pub fn on_execute<F>(mut self, f: F) -> Self
    where
        F: Fn(&DebouncerState<A>) + Send + Sync + 'static,
    {
        self.on_execute = Some(Arc::new(f));
        self
    }
}

impl<A: Clone> Clone for DebouncerOptions<A> {
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

/// Calls recorded since the current burst began
#[derive(Debug, Default, Clone, Copy)]
struct Burst {
    calls: u32,
    leading_fired: bool,
}

struct DebounceCore<A> {
    id: String,
    store: Store<DebouncerState<A>>,
    options: RwLock<DebouncerOptions<A>>,
    target: TargetFn<A>,
    clock: Arc<dyn Clock>,
    timers: Arc<dyn TimerBackend>,
    /// Generation of the armed trailing timer; stale fires are dropped
    timer_gen: AtomicU64,
    burst: Mutex<Burst>,
}

/// Collapses a burst of calls into at most one (or two) target runs
pub struct Debouncer<A: Clone + Send + Sync + 'static> {
    core: Arc<DebounceCore<A>>,
}

impl<A: Clone + Send + Sync + 'static> Debouncer<A> {
    /// Create a debouncer with the system clock and a thread timer backend
    pub fn new<F>(target: F, options: DebouncerOptions<A>) -> Self
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

    /// Create a debouncer with an injected clock and timer backend
    pub fn with_timing<F>(
        target: F,
        options: DebouncerOptions<A>,
        clock: Arc<dyn Clock>,
        timers: Arc<dyn TimerBackend>,
    ) -> Self
    where
        F: Fn(A) -> std::result::Result<(), TargetError> + Send + Sync + 'static,
    {
        let mut initial = options.initial_state.clone().unwrap_or_default();
        // armed timers are not restorable; timing restarts from now
        initial.is_pending = false;
        initial.next_execution_time = None;
        initial.can_leading_execute = true;
        initial.status = Status::Idle;

        Self {
            core: Arc::new(DebounceCore {
                id: format!("debouncer-{}", Uuid::new_v4()),
                store: Store::new(initial),
                options: RwLock::new(options),
                target: Arc::new(target),
                clock,
                timers,
                timer_gen: AtomicU64::new(0),
                burst: Mutex::new(Burst::default()),
            }),
        }
    }

    /// Record a call and arm (or reset) the quiescence timer
    ///
    /// Returns `Ok(true)` when the call was accepted, `Ok(false)` when it
    /// was dropped (disabled, or both edges off). A leading-edge target
    /// failure surfaces as `Err` on this call.
    pub fn maybe_execute(&self, args: A) -> Result<bool> {
        self.core.maybe_execute(args)
    }

    /// Dispatch the pending trailing call now, bypassing the timer
    pub fn flush(&self) -> Result<()> {
        let core = &self.core;
        let state = core.store.state();
        if !state.is_pending {
            return Ok(());
        }
        core.disarm();
        *core.burst.lock().unwrap() = Burst::default();
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

    /// Drop the pending call and timer; idempotent
    pub fn cancel(&self) {
        let core = &self.core;
        core.disarm();
        *core.burst.lock().unwrap() = Burst::default();
        core.store.update(|s| {
            s.is_pending = false;
            s.last_args = None;
            s.next_execution_time = None;
            s.can_leading_execute = true;
            s.status = Status::Idle;
        });
    }

    /// Merge new options; computed options take effect at the next decision
    pub fn set_options(&self, patch: impl FnOnce(&mut DebouncerOptions<A>)) {
        patch(&mut self.core.options.write().unwrap());
    }

    /// The authoritative state store
    pub fn store(&self) -> &Store<DebouncerState<A>> {
        &self.core.store
    }

    /// Snapshot of the current state
    pub fn state(&self) -> DebouncerState<A> {
        self.core.store.state()
    }

    pub fn execution_count(&self) -> u64 {
        self.core.store.with(|s| s.execution_count)
    }

    pub fn is_pending(&self) -> bool {
        self.core.store.with(|s| s.is_pending)
    }
}

impl<A: Clone + Send + Sync + 'static> fmt::Debug for Debouncer<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Debouncer")
            .field("id", &self.core.id)
            .field("pending", &self.is_pending())
            .field("executions", &self.execution_count())
            .finish()
    }
}

impl<A: Clone + Send + Sync + 'static> DebounceCore<A> {
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
        if !leading && !trailing {
            return Ok(false);
        }

        let now = self.clock.now();
        let fire_leading = leading && self.store.with(|s| s.can_leading_execute);
        {
            let mut burst = self.burst.lock().unwrap();
            burst.calls += 1;
            if fire_leading {
                burst.leading_fired = true;
            }
        }
        self.store.update(|s| {
            s.last_args = Some(args.clone());
            s.is_pending = true;
            s.status = Status::Pending;
            s.next_execution_time = Some(now + wait);
            if fire_leading {
                s.can_leading_execute = false;
            }
        });
        self.arm(wait)?;
        if fire_leading {
            self.dispatch(args)?;
        }
        Ok(true)
    }

    fn arm(self: &Arc<Self>, wait: Duration) -> Result<()> {
        let generation = self.timer_gen.fetch_add(1, Ordering::SeqCst) + 1;
        let weak = Arc::downgrade(self);
        self.timers.schedule_once(
            &self.timer_id(),
            wait,
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
        let burst = std::mem::take(&mut *self.burst.lock().unwrap());
        // with both edges on, the trailing run needs a second call in the burst
        let run = enabled
            && trailing
            && state.is_pending
            && (!burst.leading_fired || burst.calls >= 2);

        if run {
            if let Some(args) = state.last_args {
                self.store.update(|s| s.status = Status::Executing);
                if let Err(err) = self.dispatch(args) {
                    tracing::error!(
                        primitive = %self.id,
                        error = %err,
                        "debounced target failed on trailing edge"
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
            s.next_execution_time = None;
            s.status = Status::Idle;
        });
    }

    fn dispatch(&self, args: A) -> Result<()> {
        let now = self.clock.now();
        tracing::debug!(primitive = %self.id, "dispatching debounced call");
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

impl<A> Drop for DebounceCore<A> {
    fn drop(&mut self) {
        let _ = self.timers.cancel(&format!("{}:trailing", self.id));
    }
}
