//! Rate limiting: hard admission control over a time window
//!
//! Unlike debouncing and throttling, a rejected call is discarded, not
//! deferred: the target runs iff doing so keeps the execution count within
//! `limit` for the active window. Two window semantics are supported:
//!
//! - **sliding**: at any instant, executions within the trailing `window`
//!   are counted, endpoints inclusive; a slot frees once the execution
//!   that consumed it ages past `window`;
//! - **fixed**: executions are counted per bucket; the bucket anchor
//!   advances in whole multiples of `window` and the count resets at each
//!   boundary.

pub mod rate_limiter;

#[cfg(feature = "async")]
pub mod async_rate_limiter;

pub use rate_limiter::{RateLimiter, RateLimiterOptions, RateLimiterState};

#[cfg(feature = "async")]
pub use async_rate_limiter::{AsyncRateLimiter, AsyncRateLimiterOptions, AsyncRateLimiterState};

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

/// Window semantics for a rate limiter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WindowType {
    /// Bucketed counting; the count resets at each window boundary
    Fixed,
    /// Continuous rolling window over the trailing `window`
    Sliding,
}

impl Default for WindowType {
    fn default() -> Self {
        WindowType::Fixed
    }
}

/// Admission check shared by the sync and async limiters
///
/// Mutates the recorded execution times (purging or bucket-resetting as
/// the window type demands) and, on admission, records `now`.
pub(crate) fn admit(
    times: &mut Vec<Instant>,
    anchor: &mut Option<Instant>,
    now: Instant,
    limit: u64,
    window: Duration,
    window_type: WindowType,
) -> bool {
    match window_type {
        WindowType::Sliding => {
            // endpoints are inclusive: an execution exactly `window` old
            // still occupies its slot
            times.retain(|&t| now.duration_since(t) <= window);
        }
        WindowType::Fixed => {
            match *anchor {
                Some(start) if !window.is_zero() && now.duration_since(start) >= window => {
                    // advance the bucket in whole multiples of the window
                    let elapsed = now.duration_since(start);
                    let rem = elapsed.as_nanos() % window.as_nanos();
                    *anchor = Some(now - Duration::from_nanos(rem as u64));
                    times.clear();
                }
                Some(start) if window.is_zero() && now > start => {
                    *anchor = Some(now);
                    times.clear();
                }
                Some(_) => {}
                None => *anchor = Some(now),
            }
        }
    }

    if (times.len() as u64) < limit {
        times.push(now);
        true
    } else {
        false
    }
}

/// Delay until at least one slot frees, given the current occupancy
pub(crate) fn next_slot(
    times: &[Instant],
    anchor: Option<Instant>,
    now: Instant,
    window: Duration,
    window_type: WindowType,
) -> Duration {
    match window_type {
        WindowType::Sliding => times
            .iter()
            .min()
            .map(|&oldest| (oldest + window).saturating_duration_since(now))
            .unwrap_or(Duration::ZERO),
        WindowType::Fixed => anchor
            .map(|start| (start + window).saturating_duration_since(now))
            .unwrap_or(Duration::ZERO),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sliding_purges_old_executions() {
        let base = Instant::now();
        let mut times = vec![base, base + Duration::from_millis(100)];
        let mut anchor = None;
        let admitted = admit(
            &mut times,
            &mut anchor,
            base + Duration::from_millis(1100),
            2,
            Duration::from_millis(1000),
            WindowType::Sliding,
        );
        assert!(admitted);
        // the execution at base aged out; 100ms and 1100ms remain
        assert_eq!(times.len(), 2);
    }

    #[test]
    fn test_fixed_bucket_advances_in_window_multiples() {
        let base = Instant::now();
        let mut times = Vec::new();
        let mut anchor = None;

        assert!(admit(&mut times, &mut anchor, base, 1, Duration::from_millis(100), WindowType::Fixed));
        assert_eq!(anchor, Some(base));
        assert!(!admit(
            &mut times,
            &mut anchor,
            base + Duration::from_millis(50),
            1,
            Duration::from_millis(100),
            WindowType::Fixed,
        ));

        // 250ms later the anchor lands on the 200ms boundary, not at `now`
        assert!(admit(
            &mut times,
            &mut anchor,
            base + Duration::from_millis(250),
            1,
            Duration::from_millis(100),
            WindowType::Fixed,
        ));
        assert_eq!(anchor, Some(base + Duration::from_millis(200)));
    }

    #[test]
    fn test_limit_zero_rejects_everything() {
        let base = Instant::now();
        let mut times = Vec::new();
        let mut anchor = None;
        for window_type in [WindowType::Fixed, WindowType::Sliding] {
            assert!(!admit(
                &mut times,
                &mut anchor,
                base,
                0,
                Duration::from_millis(100),
                window_type,
            ));
        }
    }

    #[test]
    fn test_next_slot_tracks_oldest_execution() {
        let base = Instant::now();
        let times = vec![base, base + Duration::from_millis(40)];
        let wait = next_slot(
            &times,
            None,
            base + Duration::from_millis(60),
            Duration::from_millis(100),
            WindowType::Sliding,
        );
        assert_eq!(wait, Duration::from_millis(40));

        let wait = next_slot(
            &[],
            Some(base),
            base + Duration::from_millis(60),
            Duration::from_millis(100),
            WindowType::Fixed,
        );
        assert_eq!(wait, Duration::from_millis(40));
    }
}
