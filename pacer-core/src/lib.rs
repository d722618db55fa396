//! # Pacer Core - request-pacing primitives
//!
//! Pacer sits between a high-frequency caller and a slower or rate-limited
//! target function and decides *when* and *whether* the target runs. The
//! crate is framework-agnostic: UI and service adapters observe a
//! primitive's [`Store`], subscribe to the fields they render, and wire
//! lifecycle cleanup; all pacing logic lives here.
//!
//! ## Primitives
//!
//! | Primitive | Collapses a burst to | Rejected calls |
//! |---|---|---|
//! | [`Debouncer`] | one run after the burst goes quiet | never (deferred) |
//! | [`Throttler`] | runs spaced at least `wait` apart | dropped inside window without trailing |
//! | [`RateLimiter`] | at most `limit` runs per window | discarded, counted |
//! | [`Queuer`] | every item, paced and ordered | past capacity |
//! | [`Batcher`] | grouped runs over item arrays | never |
//!
//! Each primitive has an async counterpart ([`AsyncDebouncer`],
//! [`AsyncThrottler`], [`AsyncRateLimiter`], [`AsyncQueuer`],
//! [`AsyncBatcher`]) adding promise semantics: in-flight tracking, abort
//! propagation through a cancellation token, error routing through hooks,
//! and at-most-one-pending guarantees. [`AsyncRetrier`] composes retry
//! and timeout discipline over any async target.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────┐
//! │                       Primitive                            │
//! │   maybe_execute / add_item          flush / cancel / ...   │
//! │        │                                   │               │
//! │        ▼                                   ▼               │
//! │   options (Adaptive: fixed or computed per decision)       │
//! │        │                                                   │
//! │        ▼                                                   │
//! │   timing decision ──► Clock + TimerBackend (injectable)    │
//! │        │                                                   │
//! │        ▼                                                   │
//! │   Store<State> ──► subscribers (selector + equality gate)  │
//! └────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::time::Duration;
//! use pacer_core::{Debouncer, DebouncerOptions};
//!
//! let debouncer = Debouncer::new(
//!     |query: String| {
//!         println!("searching for {query}");
//!         Ok(())
//!     },
//!     DebouncerOptions::new(Duration::from_millis(300)),
//! );
//!
//! // a typing burst collapses into one search
//! debouncer.maybe_execute("p".to_string())?;
//! debouncer.maybe_execute("pa".to_string())?;
//! debouncer.maybe_execute("pace".to_string())?;
//! ```

pub mod batch;
pub mod debounce;
pub mod error;
pub mod options;
pub mod queue;
pub mod rate_limit;
pub mod store;
pub mod throttle;
pub mod timing;

#[cfg(feature = "async")]
pub mod retry;

use serde::{Deserialize, Serialize};

// Re-export main types
pub use batch::{Batcher, BatcherOptions, BatcherState};
pub use debounce::{Debouncer, DebouncerOptions, DebouncerState};
pub use error::{PacerError, Result, TargetError};
pub use options::{Adaptive, TargetFn, ValueTargetFn};
pub use queue::{Position, QueueItem, Queuer, QueuerOptions, QueuerState};
pub use rate_limit::{RateLimiter, RateLimiterOptions, RateLimiterState, WindowType};
pub use store::{Store, SubscriptionId};
pub use throttle::{Throttler, ThrottlerOptions, ThrottlerState};
pub use timing::{Clock, MockClock, MockTimerBackend, StdTimerBackend, SystemClock, TimerBackend};

#[cfg(feature = "async")]
pub use batch::{AsyncBatcher, AsyncBatcherOptions, AsyncBatcherState};
#[cfg(feature = "async")]
pub use debounce::{AsyncDebouncer, AsyncDebouncerOptions, AsyncDebouncerState};
#[cfg(feature = "async")]
pub use options::AsyncTargetFn;
#[cfg(feature = "async")]
pub use queue::{AsyncQueuer, AsyncQueuerOptions, AsyncQueuerState};
#[cfg(feature = "async")]
pub use rate_limit::{AsyncRateLimiter, AsyncRateLimiterOptions, AsyncRateLimiterState};
#[cfg(feature = "async")]
pub use retry::{AsyncRetrier, Backoff, RetryOptions};
#[cfg(feature = "async")]
pub use throttle::{AsyncThrottler, AsyncThrottlerOptions, AsyncThrottlerState};
#[cfg(feature = "async")]
pub use timing::{TokioClock, TokioTimerBackend};

/// Lifecycle status of a primitive
///
/// A pure function of enablement, armed timers, in-flight work, and
/// buffered items. Synchronous primitives move between `Idle`, `Pending`,
/// and momentarily `Executing`; async variants settle into `Settled`
/// after each flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    /// Calls are currently dropped because `enabled` resolved false
    Disabled,
    /// Nothing armed, nothing in flight
    #[default]
    Idle,
    /// A deferred execution is armed or buffered
    Pending,
    /// The target is running
    Executing,
    /// The last flight settled; nothing new is armed yet
    Settled,
}

impl Status {
    /// True when a deferred execution is armed or running
    pub fn is_busy(&self) -> bool {
        matches!(self, Status::Pending | Status::Executing)
    }
}
