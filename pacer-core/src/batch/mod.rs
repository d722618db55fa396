//! Batching: accumulate items and dispatch them together
//!
//! A batcher buffers added items and hands the whole accumulated array to
//! the target when any trigger fires:
//!
//! - the buffer reached `max_size`, or
//! - `wait` elapsed since the **first** buffered item (not the last), or
//! - `get_should_execute` returned true at the moment of an addition.
//!
//! After a dispatch settles the buffer is empty and the next batch starts
//! accumulating. [`AsyncBatcher`] additionally guarantees at most one
//! batch in flight: items added during execution collect for the next
//! batch, and a trigger observed mid-flight dispatches it right after the
//! current one settles.

pub mod batcher;

#[cfg(feature = "async")]
pub mod async_batcher;

pub use batcher::{Batcher, BatcherOptions, BatcherState};

#[cfg(feature = "async")]
pub use async_batcher::{AsyncBatcher, AsyncBatcherOptions, AsyncBatcherState};
