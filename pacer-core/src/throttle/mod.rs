//! Throttling: enforce a minimum spacing between target runs
//!
//! A throttler lets a call through immediately when at least `wait` has
//! passed since the previous run (the leading edge), and otherwise defers
//! the latest arguments to a trailing fire scheduled `wait` after that
//! previous run. Unlike a debouncer, a steady stream of calls keeps
//! producing output at a fixed cadence instead of being pushed back.
//!
//! Both edges are on by default.

pub mod throttler;

#[cfg(feature = "async")]
pub mod async_throttler;

pub use throttler::{Throttler, ThrottlerOptions, ThrottlerState};

#[cfg(feature = "async")]
pub use async_throttler::{AsyncThrottler, AsyncThrottlerOptions, AsyncThrottlerState};
