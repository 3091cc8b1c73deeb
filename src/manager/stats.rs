//! Aggregated call statistics.

use std::sync::Mutex;

use serde::{Deserialize, Serialize};

/// Snapshot of gateway-wide call statistics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatewayStats {
    pub total_calls: u64,
    pub successes: u64,
    pub failures: u64,
    /// Rolling average latency over all recorded calls.
    pub avg_latency_ms: f64,
}

#[derive(Default)]
struct StatsInner {
    total_calls: u64,
    successes: u64,
    failures: u64,
    avg_latency_ms: f64,
}

/// Call counters with a rolling average latency.
#[derive(Default)]
pub struct CallStats {
    inner: Mutex<StatsInner>,
}

impl CallStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one call outcome.
    pub fn record(&self, success: bool, latency_ms: u64) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.total_calls += 1;
        if success {
            inner.successes += 1;
        } else {
            inner.failures += 1;
        }
        // Incremental mean: avg += (x - avg) / n
        let n = inner.total_calls as f64;
        inner.avg_latency_ms += (latency_ms as f64 - inner.avg_latency_ms) / n;
    }

    pub fn snapshot(&self) -> GatewayStats {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        GatewayStats {
            total_calls: inner.total_calls,
            successes: inner.successes,
            failures: inner.failures,
            avg_latency_ms: inner.avg_latency_ms,
        }
    }
}
