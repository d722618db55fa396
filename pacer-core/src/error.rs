//! Error types for pacing operations

use thiserror::Error;

/// Result type alias for pacing operations
pub type Result<T> = std::result::Result<T, PacerError>;

/// Opaque error returned by a user-supplied target function
pub type TargetError = Box<dyn std::error::Error + Send + Sync>;

/// Errors that can occur while pacing a target function
#[derive(Error, Debug)]
pub enum PacerError {
    /// The target function itself failed. Only surfaced when the
    /// primitive's error policy says so; otherwise the failure is routed
    /// to the `on_error` hook and swallowed.
    #[error("target function failed: {source}")]
    TargetFailed {
        #[source]
        source: TargetError,
    },

    /// An in-flight execution was aborted through the cancellation token.
    #[error("execution aborted")]
    Aborted,

    /// A single attempt exceeded its execution-time budget.
    #[error("attempt exceeded {limit_ms}ms execution time")]
    AttemptTimeout { limit_ms: u64 },

    /// The whole retried invocation exceeded its total-time budget.
    #[error("total execution time exceeded {limit_ms}ms")]
    TotalTimeout { limit_ms: u64 },

    /// All retry attempts were consumed without a successful settle.
    #[error("retries exhausted after {attempts} attempts: {source}")]
    RetryExhausted {
        attempts: u32,
        #[source]
        source: TargetError,
    },

    /// The timer backend could not schedule or cancel a timer.
    #[error("timer backend error: {reason}")]
    TimerBackend { reason: String },
}

impl PacerError {
    /// Returns true if this error came from a cancellation rather than a
    /// failure of the target
    pub fn is_abort(&self) -> bool {
        matches!(self, PacerError::Aborted)
    }

    /// Returns true if this error is a per-attempt or total timeout
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            PacerError::AttemptTimeout { .. } | PacerError::TotalTimeout { .. }
        )
    }

    /// Returns the error code for serialization
    pub fn error_code(&self) -> &'static str {
        match self {
            PacerError::TargetFailed { .. } => "TARGET_FAILED",
            PacerError::Aborted => "ABORTED",
            PacerError::AttemptTimeout { .. } => "ATTEMPT_TIMEOUT",
            PacerError::TotalTimeout { .. } => "TOTAL_TIMEOUT",
            PacerError::RetryExhausted { .. } => "RETRY_EXHAUSTED",
            PacerError::TimerBackend { .. } => "TIMER_BACKEND",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn boxed(msg: &str) -> TargetError {
        Box::new(std::io::Error::new(std::io::ErrorKind::Other, msg.to_string()))
    }

    #[test]
    fn test_error_classification() {
        assert!(PacerError::Aborted.is_abort());
        assert!(!PacerError::Aborted.is_timeout());
        assert!(PacerError::AttemptTimeout { limit_ms: 50 }.is_timeout());
        assert!(PacerError::TotalTimeout { limit_ms: 500 }.is_timeout());
        assert!(!PacerError::TargetFailed { source: boxed("boom") }.is_abort());
    }

    #[test]
    fn test_error_codes() {
        assert_eq!(
            PacerError::RetryExhausted {
                attempts: 3,
                source: boxed("boom"),
            }
            .error_code(),
            "RETRY_EXHAUSTED"
        );
        assert_eq!(
            PacerError::TimerBackend {
                reason: "shut down".to_string()
            }
            .error_code(),
            "TIMER_BACKEND"
        );
    }

    #[test]
    fn test_source_is_preserved() {
        let err = PacerError::TargetFailed { source: boxed("boom") };
        let source = std::error::Error::source(&err).expect("source");
        assert!(source.to_string().contains("boom"));
    }
}
