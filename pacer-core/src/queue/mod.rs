//! Queuing: an ordered buffer with a paced dispatch loop
//!
//! Items are buffered and handed to a per-item target function at a
//! controlled cadence. The buffer is double-ended (`add_items_to` and
//! `get_items_from` combine to express FIFO, the default, LIFO, or mixed
//! access) and optionally priority-ordered, capacity-capped, and
//! expiring:
//!
//! - **priority** overrides direction during extraction; equal priorities
//!   preserve insertion order;
//! - **capacity** rejects additions past `max_size` (they are not buffered);
//! - **expiration** drops items that aged out before each take.
//!
//! [`Queuer`] dispatches to a synchronous target through the timer
//! backend; [`AsyncQueuer`] adds a concurrency-bounded pool of in-flight
//! executions with abort propagation.

pub mod queuer;

#[cfg(feature = "async")]
pub mod async_queuer;

pub use queuer::{Queuer, QueuerOptions, QueuerState};

#[cfg(feature = "async")]
pub use async_queuer::{AsyncQueuer, AsyncQueuerOptions, AsyncQueuerState};

use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// End of the buffer an operation applies to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Position {
    Front,
    Back,
}

/// A buffered item with its provenance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueItem<T> {
    pub value: T,
    /// Wall-clock insertion time; survives snapshot serialization
    pub added_at: DateTime<Utc>,
    /// Priority captured at insert, when the queue is prioritized
    pub priority: Option<i64>,
    /// Insertion sequence; identifies the item while it is in flight
    pub(crate) seq: u64,
    /// Monotonic insertion instant driving expiration; re-anchored on
    /// rehydration
    #[serde(skip)]
    pub(crate) inserted: Option<Instant>,
}

/// Insert respecting priority order (descending, stable) or direction
pub(crate) fn insert_item<T>(
    items: &mut Vec<QueueItem<T>>,
    item: QueueItem<T>,
    position: Position,
    prioritized: bool,
) {
    if prioritized {
        let priority = item.priority.unwrap_or(0);
        let idx = items.partition_point(|existing| existing.priority.unwrap_or(0) >= priority);
        items.insert(idx, item);
    } else {
        match position {
            Position::Front => items.insert(0, item),
            Position::Back => items.push(item),
        }
    }
}

/// Take the next item; priority overrides direction
pub(crate) fn take_item<T>(
    items: &mut Vec<QueueItem<T>>,
    position: Position,
    prioritized: bool,
) -> Option<QueueItem<T>> {
    if items.is_empty() {
        return None;
    }
    if prioritized {
        // the vector is kept in descending priority order
        Some(items.remove(0))
    } else {
        match position {
            Position::Front => Some(items.remove(0)),
            Position::Back => items.pop(),
        }
    }
}

/// Peek at the next item without removing it
pub(crate) fn peek_item<T>(
    items: &[QueueItem<T>],
    position: Position,
    prioritized: bool,
) -> Option<&QueueItem<T>> {
    if prioritized {
        items.first()
    } else {
        match position {
            Position::Front => items.first(),
            Position::Back => items.last(),
        }
    }
}
