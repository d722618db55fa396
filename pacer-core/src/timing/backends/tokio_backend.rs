//! Tokio timer backend
//!
//! Schedules each one-shot as a spawned task sleeping on `tokio::time`.
//! Construct it from inside a runtime; the captured handle is used for
//! later scheduling calls regardless of the calling context.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::task::JoinHandle;

use crate::error::{PacerError, Result};
use crate::timing::{TimerBackend, TimerFire};

/// Task-per-timer backend on a tokio runtime
pub struct TokioTimerBackend {
    handle: Handle,
    tasks: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl TokioTimerBackend {
    /// Create a backend on the current runtime
    ///
    /// Fails when called outside a tokio runtime.
    pub fn new() -> Result<Self> {
        let handle = Handle::try_current().map_err(|e| PacerError::TimerBackend {
            reason: format!("no tokio runtime: {e}"),
        })?;
        Ok(Self::with_handle(handle))
    }

    /// Create a backend on an explicit runtime handle
    pub fn with_handle(handle: Handle) -> Self {
        Self {
            handle,
            tasks: Mutex::new(HashMap::new()),
        }
    }
}

impl TimerBackend for TokioTimerBackend {
    fn schedule_once(&self, id: &str, delay: Duration, fire: TimerFire) -> Result<()> {
        let task = self.handle.spawn(async move {
            tokio::time::sleep(delay).await;
            fire();
        });
        if let Some(previous) = self.tasks.lock().unwrap().insert(id.to_string(), task) {
            previous.abort();
        }
        Ok(())
    }

    fn cancel(&self, id: &str) -> Result<bool> {
        if let Some(task) = self.tasks.lock().unwrap().remove(id) {
            let was_armed = !task.is_finished();
            task.abort();
            Ok(was_armed)
        } else {
            Ok(false)
        }
    }

    fn name(&self) -> &'static str {
        "tokio"
    }
}

impl Drop for TokioTimerBackend {
    fn drop(&mut self) {
        for (_, task) in self.tasks.lock().unwrap().drain() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[tokio::test]
    async fn test_timer_fires() {
        let backend = TokioTimerBackend::new().unwrap();
        let (tx, rx) = mpsc::channel();
        backend
            .schedule_once(
                "fires",
                Duration::from_millis(5),
                Box::new(move || tx.send(()).unwrap()),
            )
            .unwrap();

        tokio::task::spawn_blocking(move || rx.recv_timeout(Duration::from_secs(2)).unwrap())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_cancel_aborts_task() {
        let backend = TokioTimerBackend::new().unwrap();
        let (tx, rx) = mpsc::channel();
        backend
            .schedule_once(
                "cancelled",
                Duration::from_millis(200),
                Box::new(move || tx.send(()).unwrap()),
            )
            .unwrap();

        assert!(backend.cancel("cancelled").unwrap());
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_requires_runtime() {
        assert!(TokioTimerBackend::new().is_err());
    }
}
