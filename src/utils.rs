//! Performance bookkeeping for transactions
//!
//! [`PerformanceMetrics`] accumulates outcome counts and latency of complete
//! transactions; [`OperationTimer`] measures one of them. Timing uses the
//! Tokio clock so it follows paused time in tests.

use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, warn};

/// Performance metrics for Modbus transactions
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PerformanceMetrics {
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    /// Transactions answered with a slave exception (counted as successful)
    pub exception_responses: u64,
    /// Attempts beyond the first, summed over all transactions
    pub retries: u64,
    pub reconnects: u64,
    pub total_duration: Duration,
    pub min_duration: Option<Duration>,
    pub max_duration: Option<Duration>,
    pub avg_duration: Duration,
}

impl PerformanceMetrics {
    /// Create new empty metrics
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a completed transaction
    pub fn record_success(&mut self, duration: Duration) {
        self.successful_requests += 1;
        self.min_duration = Some(self.min_duration.map_or(duration, |min| min.min(duration)));
        self.max_duration = Some(self.max_duration.map_or(duration, |max| max.max(duration)));
        self.record(duration);
    }

    /// Record a transaction that ended in an error
    pub fn record_failure(&mut self, duration: Duration) {
        self.failed_requests += 1;
        self.record(duration);
    }

    fn record(&mut self, duration: Duration) {
        self.total_requests += 1;
        self.total_duration += duration;
        self.avg_duration = self.total_duration / self.total_requests as u32;
    }

    /// Get success rate as percentage
    pub fn success_rate(&self) -> f64 {
        if self.total_requests == 0 {
            return 0.0;
        }
        (self.successful_requests as f64 / self.total_requests as f64) * 100.0
    }

    /// Reset all metrics
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Timer for measuring operation duration
pub struct OperationTimer {
    start: Instant,
    operation_name: String,
}

impl OperationTimer {
    /// Start a new timer
    pub fn start(operation_name: impl Into<String>) -> Self {
        Self {
            start: Instant::now(),
            operation_name: operation_name.into(),
        }
    }

    /// Time since the timer started
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    /// Stop timer and log result
    pub fn stop_and_log(self, success: bool) -> Duration {
        let duration = self.start.elapsed();
        if success {
            debug!("Operation '{}' succeeded in {:?}", self.operation_name, duration);
        } else {
            warn!("Operation '{}' failed after {:?}", self.operation_name, duration);
        }
        duration
    }
}
