//! Sliding-window rate limiting per (run id, provider).

use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use thiserror::Error;
use tokio::time::Instant;

use crate::config::RateLimitConfig;

const MINUTE: Duration = Duration::from_secs(60);
const HOUR: Duration = Duration::from_secs(3600);

/// A call was rejected because a window ceiling was met.
#[derive(Debug, Error)]
#[error("rate limit exceeded for provider: {calls} calls in the last {window}, ceiling {ceiling}")]
pub struct RateLimitExceeded {
    pub window: &'static str,
    pub calls: usize,
    pub ceiling: u32,
}

/// Tracks call timestamps per (run id, provider id) pair.
///
/// Counters are best-effort: they cap call frequency from this process and
/// make no cross-process linearizability claim.
#[derive(Default)]
pub struct RateLimiter {
    windows: Mutex<HashMap<(String, String), VecDeque<Instant>>>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Check the minute/hour ceilings and, if the call is admitted, record
    /// its timestamp. Denied calls are not recorded.
    pub fn try_acquire(
        &self,
        run_id: &str,
        provider_id: &str,
        config: &RateLimitConfig,
    ) -> Result<(), RateLimitExceeded> {
        let now = Instant::now();
        let mut windows = self.windows.lock().unwrap_or_else(|e| e.into_inner());
        let timestamps = windows
            .entry((run_id.to_string(), provider_id.to_string()))
            .or_default();

        // Drop anything outside the larger window.
        while let Some(front) = timestamps.front() {
            if now.duration_since(*front) >= HOUR {
                timestamps.pop_front();
            } else {
                break;
            }
        }

        let in_hour = timestamps.len();
        if in_hour >= config.max_calls_per_hour as usize {
            return Err(RateLimitExceeded {
                window: "hour",
                calls: in_hour,
                ceiling: config.max_calls_per_hour,
            });
        }

        let in_minute = timestamps
            .iter()
            .rev()
            .take_while(|t| now.duration_since(**t) < MINUTE)
            .count();
        if in_minute >= config.max_calls_per_minute as usize {
            return Err(RateLimitExceeded {
                window: "minute",
                calls: in_minute,
                ceiling: config.max_calls_per_minute,
            });
        }

        timestamps.push_back(now);
        Ok(())
    }
}
