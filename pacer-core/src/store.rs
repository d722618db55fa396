//! Reactive store backing every primitive's observable state
//!
//! A [`Store`] holds one immutable state record behind a lock. Mutations go
//! through [`Store::update`], which produces a fresh snapshot and notifies
//! subscribers in registration order. Subscriptions are selector-based: a
//! listener only fires when the value its selector extracts actually changed
//! (`PartialEq`), so adapters can subscribe to a single field without being
//! woken by unrelated updates.
//!
//! Notification discipline:
//! - listeners receive the snapshot, never a live reference into the store;
//! - a panicking listener is caught, reported through `tracing`, and does
//!   not stop later listeners;
//! - subscribing, unsubscribing, or updating from inside a listener is
//!   allowed; nested updates are queued and delivered in order after the
//!   current notification pass.

use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, RwLock};

/// Handle returned by [`Store::subscribe`], used to unsubscribe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

struct SubEntry<S> {
    id: u64,
    notify: Box<dyn FnMut(&S) + Send>,
}

enum PendingOp<S> {
    Add(SubEntry<S>),
    Remove(u64),
}

struct SubscriberSet<S> {
    entries: Vec<SubEntry<S>>,
    /// True while a notification pass has the entries checked out
    detached: bool,
    /// Subscribe/unsubscribe requests that arrived mid-notification
    pending: Vec<PendingOp<S>>,
    /// Snapshots from nested updates, delivered after the current pass
    queued: VecDeque<S>,
}

/// A single-writer holder for a primitive's state record
pub struct Store<S> {
    state: RwLock<S>,
    subs: Mutex<SubscriberSet<S>>,
    next_id: AtomicU64,
}

impl<S: Clone + Send + Sync + 'static> Store<S> {
    /// Create a store with an initial state record
    pub fn new(initial: S) -> Self {
        Self {
            state: RwLock::new(initial),
            subs: Mutex::new(SubscriberSet {
                entries: Vec::new(),
                detached: false,
                pending: Vec::new(),
                queued: VecDeque::new(),
            }),
            next_id: AtomicU64::new(1),
        }
    }

    /// Return a snapshot of the current state
    pub fn state(&self) -> S {
        self.state.read().unwrap().clone()
    }

    /// Read a projection of the current state without cloning the record
    pub fn with<T>(&self, f: impl FnOnce(&S) -> T) -> T {
        f(&self.state.read().unwrap())
    }

    /// Mutate the state and notify subscribers with the new snapshot
    ///
    /// Subscribers run after the write lock is released, in registration
    /// order, against a clone of the record; they never observe a
    /// half-applied mutation.
    pub fn update(&self, mutate: impl FnOnce(&mut S)) {
        let snapshot = {
            let mut state = self.state.write().unwrap();
            mutate(&mut state);
            state.clone()
        };
        self.notify(snapshot);
    }

    /// Subscribe to changes of a selected slice of the state
    ///
    /// `selector` extracts the watched value; `listener` fires only when
    /// that value differs (`PartialEq`) from the last one this subscription
    /// saw. The value current at subscribe time is the baseline and is not
    /// delivered; read [`Store::state`] for it.
    pub fn subscribe<T, Sel, L>(&self, selector: Sel, mut listener: L) -> SubscriptionId
    where
        T: PartialEq + Clone + Send + Sync + 'static,
        Sel: Fn(&S) -> T + Send + 'static,
        L: FnMut(&T, &S) + Send + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let mut prev = self.with(&selector);
        let notify = Box::new(move |state: &S| {
            let next = selector(state);
            if next != prev {
                prev = next.clone();
                listener(&next, state);
            }
        });
        let entry = SubEntry { id, notify };

        let mut subs = self.subs.lock().unwrap();
        if subs.detached {
            subs.pending.push(PendingOp::Add(entry));
        } else {
            subs.entries.push(entry);
        }
        SubscriptionId(id)
    }

    /// Remove a subscription; safe to call more than once
    pub fn unsubscribe(&self, id: SubscriptionId) {
        let mut subs = self.subs.lock().unwrap();
        if subs.detached {
            subs.pending.push(PendingOp::Remove(id.0));
        } else {
            subs.entries.retain(|e| e.id != id.0);
        }
    }

    /// Number of live subscriptions
    pub fn subscriber_count(&self) -> usize {
        let subs = self.subs.lock().unwrap();
        let mut count = subs.entries.len();
        for op in &subs.pending {
            match op {
                PendingOp::Add(_) => count += 1,
                PendingOp::Remove(_) => count = count.saturating_sub(1),
            }
        }
        count
    }

    fn notify(&self, mut snapshot: S) {
        let mut entries = {
            let mut subs = self.subs.lock().unwrap();
            if subs.detached {
                // nested update from inside a listener: queue for the
                // active pass to deliver in order
                subs.queued.push_back(snapshot);
                return;
            }
            subs.detached = true;
            std::mem::take(&mut subs.entries)
        };

        loop {
            for entry in entries.iter_mut() {
                let delivered = catch_unwind(AssertUnwindSafe(|| (entry.notify)(&snapshot)));
                if delivered.is_err() {
                    tracing::error!(
                        subscription = entry.id,
                        "store listener panicked; remaining listeners still run"
                    );
                }
            }

            let mut subs = self.subs.lock().unwrap();
            for op in subs.pending.drain(..).collect::<Vec<_>>() {
                match op {
                    PendingOp::Add(entry) => entries.push(entry),
                    PendingOp::Remove(id) => entries.retain(|e| e.id != id),
                }
            }
            match subs.queued.pop_front() {
                Some(next) => snapshot = next,
                None => {
                    subs.entries = entries;
                    subs.detached = false;
                    return;
                }
            }
        }
    }
}
