//! Time injection for the pacing primitives
//!
//! Every timing decision in this crate reads the current instant through a
//! [`Clock`] and schedules deferred work through a [`TimerBackend`], so a
//! test can drive discrete time instead of sleeping. The synchronous
//! primitives chain one-shot timers for periodic work; the async variants
//! sleep with `tokio::time` directly and only use the [`Clock`].
//!
//! ## Backends
//!
//! | Backend | Mechanism | Use |
//! |---|---|---|
//! | [`StdTimerBackend`] | one thread per timer | sync apps without a runtime |
//! | [`TokioTimerBackend`] | spawned tokio tasks | sync primitives inside an async app |
//! | [`MockTimerBackend`] | fired by `advance()` | deterministic tests |
//!
//! A timer id is scoped to the owning primitive instance (each instance
//! keys its timers with its own uuid), so backends can be shared.

pub mod backends;

use std::time::{Duration, Instant};

use crate::error::Result;

pub use backends::{MockClock, MockTimerBackend, StdTimerBackend};
#[cfg(feature = "async")]
pub use backends::TokioTimerBackend;

/// Closure invoked when a timer fires
pub type TimerFire = Box<dyn FnOnce() + Send>;

/// A monotonic time source
pub trait Clock: Send + Sync {
    /// The current instant
    fn now(&self) -> Instant;
}

/// Production clock backed by [`Instant::now`]
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Clock that reads tokio's time source, so paused test time flows through
///
/// Under `tokio::time::pause` the instants returned here advance with the
/// virtual clock, keeping window math consistent with `tokio::time::sleep`.
#[cfg(feature = "async")]
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioClock;

#[cfg(feature = "async")]
impl Clock for TokioClock {
    fn now(&self) -> Instant {
        tokio::time::Instant::now().into_std()
    }
}

/// Abstract one-shot timer scheduler
///
/// Scheduling with an id that is already armed replaces the earlier timer.
/// A cancelled or replaced timer never fires its closure.
pub trait TimerBackend: Send + Sync {
    /// Schedule `fire` to run once after `delay`
    fn schedule_once(&self, id: &str, delay: Duration, fire: TimerFire) -> Result<()>;

    /// Cancel a scheduled timer; returns true if one was armed under `id`
    fn cancel(&self, id: &str) -> Result<bool>;

    /// Backend name (for logging)
    fn name(&self) -> &'static str;
}
