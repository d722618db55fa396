//! Mock clock and timer backend for deterministic tests
//!
//! [`MockClock::advance`] moves virtual time; [`MockTimerBackend::advance`]
//! does the same while firing every timer whose deadline falls inside the
//! advanced span, in deadline order, stepping the clock to each deadline
//! first. A fire closure may schedule follow-up timers (the queue and
//! batch primitives chain one-shots); those fire too if they land inside
//! the span.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::error::Result;
use crate::timing::{Clock, TimerBackend, TimerFire};

/// Virtual clock: a fixed base instant plus a manually advanced offset
pub struct MockClock {
    base: Instant,
    offset: Mutex<Duration>,
}

impl MockClock {
    /// Create a clock anchored at the current real instant
    pub fn new() -> Self {
        Self {
            base: Instant::now(),
            offset: Mutex::new(Duration::ZERO),
        }
    }

    /// Move virtual time forward
    pub fn advance(&self, delta: Duration) {
        *self.offset.lock().unwrap() += delta;
    }

    /// Jump to `at` if it is in the future; the clock never moves backward
    pub(crate) fn set_at(&self, at: Instant) {
        let mut offset = self.offset.lock().unwrap();
        let target = at.saturating_duration_since(self.base);
        if target > *offset {
            *offset = target;
        }
    }
}

impl Default for MockClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MockClock {
    fn now(&self) -> Instant {
        self.base + *self.offset.lock().unwrap()
    }
}

struct PendingTimer {
    id: String,
    seq: u64,
    deadline: Instant,
    fire: Option<TimerFire>,
}

/// Timer backend driven by a [`MockClock`]
pub struct MockTimerBackend {
    clock: Arc<MockClock>,
    timers: Mutex<Vec<PendingTimer>>,
    seq: AtomicU64,
}

impl MockTimerBackend {
    /// Create a backend sharing the given clock
    pub fn new(clock: Arc<MockClock>) -> Self {
        Self {
            clock,
            timers: Mutex::new(Vec::new()),
            seq: AtomicU64::new(0),
        }
    }

    /// The clock this backend advances
    pub fn clock(&self) -> Arc<MockClock> {
        Arc::clone(&self.clock)
    }

    /// Advance virtual time, firing due timers in deadline order
    ///
    /// Equal deadlines fire in scheduling order. The timer list is not
    /// locked while a closure runs, so fire paths may schedule or cancel
    /// timers freely.
    pub fn advance(&self, delta: Duration) {
        let target = self.clock.now() + delta;
        loop {
            let next = {
                let mut timers = self.timers.lock().unwrap();
                let due = timers
                    .iter()
                    .enumerate()
                    .filter(|(_, t)| t.deadline <= target)
                    .min_by_key(|(_, t)| (t.deadline, t.seq))
                    .map(|(i, _)| i);
                due.map(|i| timers.remove(i))
            };
            match next {
                Some(mut timer) => {
                    self.clock.set_at(timer.deadline);
                    if let Some(fire) = timer.fire.take() {
                        fire();
                    }
                }
                None => break,
            }
        }
        self.clock.set_at(target);
    }

    /// Number of armed timers
    pub fn pending_count(&self) -> usize {
        self.timers.lock().unwrap().len()
    }

    /// Deadline of the next armed timer, if any
    pub fn next_deadline(&self) -> Option<Instant> {
        self.timers
            .lock()
            .unwrap()
            .iter()
            .map(|t| t.deadline)
            .min()
    }
}

impl TimerBackend for MockTimerBackend {
    fn schedule_once(&self, id: &str, delay: Duration, fire: TimerFire) -> Result<()> {
        let mut timers = self.timers.lock().unwrap();
        timers.retain(|t| t.id != id);
        timers.push(PendingTimer {
            id: id.to_string(),
            seq: self.seq.fetch_add(1, Ordering::SeqCst),
            deadline: self.clock.now() + delay,
            fire: Some(fire),
        });
        Ok(())
    }

    fn cancel(&self, id: &str) -> Result<bool> {
        let mut timers = self.timers.lock().unwrap();
        let before = timers.len();
        timers.retain(|t| t.id != id);
        Ok(timers.len() != before)
    }

    fn name(&self) -> &'static str {
        "mock"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn harness() -> (Arc<MockClock>, MockTimerBackend) {
        let clock = Arc::new(MockClock::new());
        let backend = MockTimerBackend::new(Arc::clone(&clock));
        (clock, backend)
    }

    #[test]
    fn test_advance_fires_due_timers_in_order() {
        let (_, backend) = harness();
        let fired = Arc::new(Mutex::new(Vec::new()));
        for (id, delay) in [("b", 20u64), ("a", 10), ("c", 30)] {
            let sink = Arc::clone(&fired);
            backend
                .schedule_once(
                    id,
                    Duration::from_millis(delay),
                    Box::new(move || sink.lock().unwrap().push(id)),
                )
                .unwrap();
        }

        backend.advance(Duration::from_millis(25));
        assert_eq!(*fired.lock().unwrap(), vec!["a", "b"]);
        assert_eq!(backend.pending_count(), 1);

        backend.advance(Duration::from_millis(5));
        assert_eq!(*fired.lock().unwrap(), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_clock_steps_to_each_deadline() {
        let (clock, backend) = harness();
        let start = clock.now();
        let seen = Arc::new(Mutex::new(None));
        let sink = Arc::clone(&seen);
        let probe = backend.clock();
        backend
            .schedule_once(
                "probe",
                Duration::from_millis(40),
                Box::new(move || *sink.lock().unwrap() = Some(probe.now())),
            )
            .unwrap();

        backend.advance(Duration::from_millis(100));
        assert_eq!(
            seen.lock().unwrap().unwrap().duration_since(start),
            Duration::from_millis(40)
        );
        assert_eq!(clock.now().duration_since(start), Duration::from_millis(100));
    }

    #[test]
    fn test_chained_timers_fire_within_one_advance() {
        let clock = Arc::new(MockClock::new());
        let backend = Arc::new(MockTimerBackend::new(Arc::clone(&clock)));
        let fired = Arc::new(Mutex::new(Vec::new()));

        let chain = Arc::clone(&backend);
        let sink = Arc::clone(&fired);
        backend
            .schedule_once(
                "tick",
                Duration::from_millis(10),
                Box::new(move || {
                    sink.lock().unwrap().push("first");
                    let sink = Arc::clone(&sink);
                    chain
                        .schedule_once(
                            "tick",
                            Duration::from_millis(10),
                            Box::new(move || sink.lock().unwrap().push("second")),
                        )
                        .unwrap();
                }),
            )
            .unwrap();

        backend.advance(Duration::from_millis(25));
        assert_eq!(*fired.lock().unwrap(), vec!["first", "second"]);
    }

    #[test]
    fn test_cancel_drops_timer() {
        let (_, backend) = harness();
        backend
            .schedule_once("gone", Duration::from_millis(10), Box::new(|| panic!("fired")))
            .unwrap();
        assert!(backend.cancel("gone").unwrap());
        assert!(!backend.cancel("gone").unwrap());
        backend.advance(Duration::from_millis(50));
    }
}
