//! Shared option machinery for the pacing primitives
//!
//! Several options (`wait`, `enabled`, `limit`, `concurrency`, ...) accept
//! either a plain value or a function of the primitive's current state. The
//! [`Adaptive`] wrapper models that choice; primitives call
//! [`Adaptive::resolve`] at each decision point (arming a timer, firing,
//! admitting a call, refilling a concurrency slot) so a computed option is
//! always evaluated against fresh state, never cached at construction.

use std::fmt;
use std::sync::Arc;

use crate::error::TargetError;

/// A synchronous target function paced by a primitive
pub type TargetFn<A> = Arc<dyn Fn(A) -> std::result::Result<(), TargetError> + Send + Sync>;

/// A synchronous target function that produces a value (batch dispatch)
pub type ValueTargetFn<A, R> =
    Arc<dyn Fn(A) -> std::result::Result<R, TargetError> + Send + Sync>;

/// An asynchronous target function paced by a primitive
///
/// The primitive hands the target a [`CancellationToken`] that fires when
/// the caller aborts; long-running targets should observe it.
///
/// [`CancellationToken`]: tokio_util::sync::CancellationToken
#[cfg(feature = "async")]
pub type AsyncTargetFn<A, R> = Arc<
    dyn Fn(
            A,
            tokio_util::sync::CancellationToken,
        ) -> futures::future::BoxFuture<'static, std::result::Result<R, TargetError>>
        + Send
        + Sync,
>;

/// An option that is either a fixed value or computed from the current state
pub enum Adaptive<T, S> {
    /// A plain value, the same at every decision point
    Fixed(T),
    /// Re-evaluated against the state snapshot at every decision point
    Computed(Arc<dyn Fn(&S) -> T + Send + Sync>),
}

impl<T: Clone, S> Adaptive<T, S> {
    /// Wrap a fixed value
    pub fn fixed(value: T) -> Self {
        Adaptive::Fixed(value)
    }

    /// Wrap a function of the primitive's state
    pub fn computed<F>(f: F) -> Self
    where
        F: Fn(&S) -> T + Send + Sync + 'static,
    {
        Adaptive::Computed(Arc::new(f))
    }

    /// Resolve the option against a state snapshot
    pub fn resolve(&self, state: &S) -> T {
        match self {
            Adaptive::Fixed(value) => value.clone(),
            Adaptive::Computed(f) => f(state),
        }
    }

    /// Returns true if this option is computed per decision
    pub fn is_computed(&self) -> bool {
        matches!(self, Adaptive::Computed(_))
    }
}

impl<T: Clone, S> Clone for Adaptive<T, S> {
    fn clone(&self) -> Self {
        match self {
            Adaptive::Fixed(value) => Adaptive::Fixed(value.clone()),
            Adaptive::Computed(f) => Adaptive::Computed(Arc::clone(f)),
        }
    }
}

impl<T: fmt::Debug, S> fmt::Debug for Adaptive<T, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Adaptive::Fixed(value) => f.debug_tuple("Fixed").field(value).finish(),
            Adaptive::Computed(_) => f.write_str("Computed(..)"),
        }
    }
}
