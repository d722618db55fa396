//! Standard library timer backend
//!
//! Spawns a thread per one-shot timer. Simple and runtime-free; fine for
//! the handful of timers a primitive keeps armed at once. Use the tokio
//! backend when many primitives share a process with an async runtime.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use crate::error::Result;
use crate::timing::{TimerBackend, TimerFire};

/// Thread-per-timer backend
///
/// Cancellation is cooperative: the timer thread checks a flag after its
/// sleep and drops the fire closure if the timer was cancelled or replaced
/// in the meantime.
pub struct StdTimerBackend {
    /// Cancellation flag of the currently armed timer, by id
    timers: Mutex<HashMap<String, Arc<AtomicBool>>>,
}

impl StdTimerBackend {
    /// Create a new std timer backend
    pub fn new() -> Self {
        Self {
            timers: Mutex::new(HashMap::new()),
        }
    }

    /// Number of ids with an armed (not yet cancelled) timer
    pub fn armed_count(&self) -> usize {
        self.timers
            .lock()
            .unwrap()
            .values()
            .filter(|cancelled| !cancelled.load(Ordering::Relaxed))
            .count()
    }
}

impl Default for StdTimerBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl TimerBackend for StdTimerBackend {
    fn schedule_once(&self, id: &str, delay: Duration, fire: TimerFire) -> Result<()> {
        let cancelled = Arc::new(AtomicBool::new(false));
        if let Some(previous) = self
            .timers
            .lock()
            .unwrap()
            .insert(id.to_string(), Arc::clone(&cancelled))
        {
            previous.store(true, Ordering::Relaxed);
        }

        thread::spawn(move || {
            thread::sleep(delay);
            if !cancelled.load(Ordering::Relaxed) {
                cancelled.store(true, Ordering::Relaxed);
                fire();
            }
        });

        Ok(())
    }

    fn cancel(&self, id: &str) -> Result<bool> {
        if let Some(cancelled) = self.timers.lock().unwrap().remove(id) {
            let was_armed = !cancelled.swap(true, Ordering::Relaxed);
            Ok(was_armed)
        } else {
            Ok(false)
        }
    }

    fn name(&self) -> &'static str {
        "std"
    }
}
