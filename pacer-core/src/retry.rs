//! Retry discipline for async targets
//!
//! [`AsyncRetrier`] composes over any async target: each invocation runs
//! the target up to `max_attempts` times, waiting between attempts per a
//! linear or exponential backoff with optional jitter, bounded by a
//! per-attempt and a total execution-time budget. It is a functional
//! wrapper, not a state machine; pair it with the other primitives by
//! handing [`AsyncRetrier::target`] to them as their target function.

use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::{PacerError, Result, TargetError};
use crate::options::AsyncTargetFn;

/// Backoff growth between attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    /// `base_wait * attempt`
    Linear,
    /// `base_wait * 2^(attempt - 1)`
    Exponential,
}

/// Configuration for an [`AsyncRetrier`]
pub struct RetryOptions {
    pub(crate) max_attempts: u32,
    pub(crate) backoff: Backoff,
    pub(crate) base_wait: Duration,
    /// Jitter fraction in `[0, 1)`; the computed delay is multiplied by a
    /// factor drawn uniformly from `[1 - jitter, 1 + jitter]`
    pub(crate) jitter: f64,
    pub(crate) max_execution_time: Option<Duration>,
    pub(crate) max_total_execution_time: Option<Duration>,
    pub(crate) on_retry: Option<Arc<dyn Fn(u32, &TargetError) + Send + Sync>>,
    pub(crate) on_last_error: Option<Arc<dyn Fn(&TargetError) + Send + Sync>>,
    pub(crate) on_settled: Option<Arc<dyn Fn() + Send + Sync>>,
}

impl Default for RetryOptions {
    fn default() -> Self {
        Self::new()
    }
}

impl RetryOptions {
    /// Three attempts, exponential backoff from 100ms, no jitter
    pub fn new() -> Self {
        Self {
            max_attempts: 3,
            backoff: Backoff::Exponential,
            base_wait: Duration::from_millis(100),
            jitter: 0.0,
            max_execution_time: None,
            max_total_execution_time: None,
            on_retry: None,
            on_last_error: None,
            on_settled: None,
        }
    }

    pub fn max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn base_wait(mut self, base_wait: Duration) -> Self {
        self.base_wait = base_wait;
        self
    }

    /// Jitter fraction in `[0, 1)`
    pub fn jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 0.999_999);
        self
    }

    /// Budget for a single attempt; expiry aborts the attempt's token and
    /// counts as a retryable failure
    pub fn max_execution_time(mut self, limit: Duration) -> Self {
        self.max_execution_time = Some(limit);
        self
    }

    /// Budget for the whole invocation including backoff waits
    pub fn max_total_execution_time(mut self, limit: Duration) -> Self {
        self.max_total_execution_time = Some(limit);
        self
    }

    /// Hook fired before each backoff wait with the failed attempt number
    pub fn on_retry<F>(mut self, f: F) -> Self
    where
        F: Fn(u32, &TargetError) + Send + Sync + 'static,
    {
        self.on_retry = Some(Arc::new(f));
        self
    }

    /// Hook fired with the final error once attempts are exhausted
    pub fn on_last_error<F>(mut self, f: F) -> Self
    where
        F: Fn(&TargetError) + Send + Sync + 'static,
    {
        self.on_last_error = Some(Arc::new(f));
        self
    }

    /// Hook fired once per top-level invocation, on any outcome
    pub fn on_settled<F>(mut self, f: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.on_settled = Some(Arc::new(f));
        self
    }
}

impl Clone for RetryOptions {
    fn clone(&self) -> Self {
        Self {
            max_attempts: self.max_attempts,
            backoff: self.backoff,
            base_wait: self.base_wait,
            jitter: self.jitter,
            max_execution_time: self.max_execution_time,
            max_total_execution_time: self.max_total_execution_time,
            on_retry: self.on_retry.clone(),
            on_last_error: self.on_last_error.clone(),
            on_settled: self.on_settled.clone(),
        }
    }
}

/// Raw backoff delay for a 1-based failed-attempt number, before jitter
pub(crate) fn backoff_delay(backoff: Backoff, base_wait: Duration, attempt: u32) -> Duration {
    match backoff {
        Backoff::Linear => base_wait.checked_mul(attempt).unwrap_or(Duration::MAX),
        Backoff::Exponential => {
            let shift = attempt.saturating_sub(1).min(31);
            base_wait.checked_mul(1u32 << shift).unwrap_or(Duration::MAX)
        }
    }
}

fn jittered(delay: Duration, jitter: f64) -> Duration {
    if jitter <= 0.0 || delay.is_zero() {
        return delay;
    }
    let factor = 1.0 + jitter * (2.0 * rand::random::<f64>() - 1.0);
    delay.mul_f64(factor.max(0.0))
}

/// Retries an async target with backoff, timeouts, and abort support
pub struct AsyncRetrier<A, R>
where
    A: Clone + Send + Sync + 'static,
    R: Send + 'static,
{
    id: String,
    target: AsyncTargetFn<A, R>,
    options: RwLock<RetryOptions>,
    abort_root: Mutex<CancellationToken>,
}

impl<A, R> AsyncRetrier<A, R>
where
    A: Clone + Send + Sync + 'static,
    R: Send + 'static,
{
    pub fn new<F, Fut>(target: F, options: RetryOptions) -> Self
    where
        F: Fn(A, CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<R, TargetError>> + Send + 'static,
    {
        let target: AsyncTargetFn<A, R> =
            Arc::new(move |args, token| Box::pin(target(args, token)));
        Self {
            id: format!("retrier-{}", Uuid::new_v4()),
            target,
            options: RwLock::new(options),
            abort_root: Mutex::new(CancellationToken::new()),
        }
    }

    /// Run the target under the retry discipline
    pub async fn execute(&self, args: A) -> Result<R> {
        let token = self.abort_root.lock().unwrap().child_token();
        self.run(args, token).await
    }

    /// Like [`execute`](Self::execute), honoring an external token as well
    pub async fn execute_with_signal(&self, args: A, signal: CancellationToken) -> Result<R> {
        self.run(args, signal).await
    }

    /// Abort the pending attempt and suppress further retries
    pub fn abort(&self) {
        let mut root = self.abort_root.lock().unwrap();
        root.cancel();
        *root = CancellationToken::new();
    }

    /// Token that fires when [`abort`](Self::abort) is called
    pub fn abort_signal(&self) -> CancellationToken {
        self.abort_root.lock().unwrap().child_token()
    }

    pub fn set_options(&self, patch: impl FnOnce(&mut RetryOptions)) {
        patch(&mut self.options.write().unwrap());
    }

    async fn run(&self, args: A, token: CancellationToken) -> Result<R> {
        let opts = self.options.read().unwrap().clone();
        let started = tokio::time::Instant::now();
        let mut attempt: u32 = 1;

        loop {
            if token.is_cancelled() {
                return Err(PacerError::Aborted);
            }

            let attempt_token = token.child_token();
            let fut = (self.target)(args.clone(), attempt_token.clone());
            let bounded = async {
                match opts.max_execution_time {
                    Some(limit) => match tokio::time::timeout(limit, fut).await {
                        Ok(outcome) => outcome,
                        Err(_) => {
                            // the timeout aborts the attempt through its token
                            attempt_token.cancel();
                            Err(Box::new(PacerError::AttemptTimeout {
                                limit_ms: limit.as_millis() as u64,
                            }) as TargetError)
                        }
                    },
                    None => fut.await,
                }
            };
            let outcome = tokio::select! {
                biased;
                _ = token.cancelled() => {
                    attempt_token.cancel();
                    return Err(PacerError::Aborted);
                }
                outcome = bounded => outcome,
            };

            match outcome {
                Ok(result) => {
                    if let Some(hook) = &opts.on_settled {
                        hook();
                    }
                    return Ok(result);
                }
                Err(error) => {
                    tracing::debug!(
                        primitive = %self.id,
                        attempt,
                        error = %error,
                        "attempt failed"
                    );
                    let within_total = opts
                        .max_total_execution_time
                        .map(|limit| started.elapsed() < limit)
                        .unwrap_or(true);
                    if attempt >= opts.max_attempts || !within_total {
                        if let Some(hook) = &opts.on_last_error {
                            hook(&error);
                        }
                        if let Some(hook) = &opts.on_settled {
                            hook();
                        }
                        return Err(PacerError::RetryExhausted {
                            attempts: attempt,
                            source: error,
                        });
                    }

                    let delay = jittered(
                        backoff_delay(opts.backoff, opts.base_wait, attempt),
                        opts.jitter,
                    );
                    if let Some(hook) = &opts.on_retry {
                        hook(attempt, &error);
                    }
                    tokio::select! {
                        biased;
                        _ = token.cancelled() => return Err(PacerError::Aborted),
                        _ = tokio::time::sleep(delay) => {}
                    }
                    attempt += 1;
                }
            }
        }
    }
}

impl<A, R> AsyncRetrier<A, R>
where
    A: Clone + Send + Sync + 'static,
    R: Send + 'static,
{
    /// An async target that runs this retrier's discipline per invocation
    ///
    /// Lets a retrier slot into any other primitive as its target; the
    /// outer primitive's token flows into every attempt.
    pub fn target(self: &Arc<Self>) -> AsyncTargetFn<A, R> {
        let retrier = Arc::clone(self);
        Arc::new(move |args, token| {
            let retrier = Arc::clone(&retrier);
            Box::pin(async move {
                retrier
                    .run(args, token)
                    .await
                    .map_err(|err| Box::new(err) as TargetError)
            })
        })
    }
}

impl<A, R> fmt::Debug for AsyncRetrier<A, R>
where
    A: Clone + Send + Sync + 'static,
    R: Send + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let opts = self.options.read().unwrap();
        f.debug_struct("AsyncRetrier")
            .field("id", &self.id)
            .field("max_attempts", &opts.max_attempts)
            .field("backoff", &opts.backoff)
            .finish()
    }
}
