//! Debouncing: collapse a burst of calls into at most one (or two) runs
//!
//! A debouncer holds the latest arguments and keeps pushing a quiescence
//! timer forward while calls keep arriving. Once the caller goes quiet for
//! `wait`, the target runs with the arguments of the last call. Leading
//! execution (run on the first call of a burst) and trailing execution
//! (run after the burst ends) can be combined freely.
//!
//! [`Debouncer`] paces a synchronous target; [`AsyncDebouncer`] paces a
//! promise-returning target with single-flight and abort semantics.

pub mod debouncer;

#[cfg(feature = "async")]
pub mod async_debouncer;

pub use debouncer::{Debouncer, DebouncerOptions, DebouncerState};

#[cfg(feature = "async")]
pub use async_debouncer::{AsyncDebouncer, AsyncDebouncerOptions, AsyncDebouncerState};
