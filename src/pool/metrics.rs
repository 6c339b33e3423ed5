//! Per-class worker metrics.
//!
//! Counters are atomics; the rolling outcome window behind a mutex feeds
//! error-rate and latency aggregation for the scaler and the health monitor.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Rolling window length for error-rate and latency aggregation.
const OUTCOME_WINDOW: usize = 200;

#[derive(Debug)]
struct Outcome {
    at: Instant,
    success: bool,
    elapsed_ms: u64,
}

/// Metrics for one worker class.
#[derive(Debug)]
pub struct ClassMetrics {
    active: AtomicUsize,
    peak: AtomicUsize,
    completed: AtomicU64,
    failed: AtomicU64,
    throttled: AtomicU64,
    outcomes: Mutex<VecDeque<Outcome>>,
}

impl ClassMetrics {
    pub fn new() -> Self {
        Self {
            active: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            completed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            throttled: AtomicU64::new(0),
            outcomes: Mutex::new(VecDeque::with_capacity(OUTCOME_WINDOW)),
        }
    }

    /// Currently active jobs.
    pub fn active(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    /// High-water mark of active jobs.
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::Relaxed)
    }

    /// Jobs completed successfully.
    pub fn completed(&self) -> u64 {
        self.completed.load(Ordering::Relaxed)
    }

    /// Jobs that ended in failure.
    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    /// Admissions rejected by the throttle chain.
    pub fn throttled(&self) -> u64 {
        self.throttled.load(Ordering::Relaxed)
    }

    /// CAS admission increment: succeeds only while the counter still equals
    /// `expected`, so a per-class cap check and its increment are one atomic
    /// step. Returns the observed value on contention.
    pub fn try_increment_active(&self, expected: usize) -> std::result::Result<usize, usize> {
        match self.active.compare_exchange(
            expected,
            expected + 1,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(prev) => {
                self.peak.fetch_max(prev + 1, Ordering::Relaxed);
                Ok(prev + 1)
            }
            Err(actual) => Err(actual),
        }
    }

    /// Roll back an admission that failed a later check in the chain.
    pub fn decrement_active(&self) {
        self.active.fetch_sub(1, Ordering::AcqRel);
    }

    pub fn record_throttle(&self) {
        self.throttled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_release(&self, success: bool, elapsed: Duration) {
        self.active.fetch_sub(1, Ordering::AcqRel);
        if success {
            self.completed.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failed.fetch_add(1, Ordering::Relaxed);
        }
        if let Ok(mut outcomes) = self.outcomes.lock() {
            if outcomes.len() == OUTCOME_WINDOW {
                outcomes.pop_front();
            }
            outcomes.push_back(Outcome {
                at: Instant::now(),
                success,
                elapsed_ms: elapsed.as_millis() as u64,
            });
        }
    }

    /// Failure fraction over the recent window. 0 when idle.
    pub fn error_rate(&self, window: Duration) -> f64 {
        let Ok(outcomes) = self.outcomes.lock() else {
            return 0.0;
        };
        let recent: Vec<&Outcome> = outcomes
            .iter()
            .filter(|o| o.at.elapsed() <= window)
            .collect();
        if recent.is_empty() {
            return 0.0;
        }
        let failures = recent.iter().filter(|o| !o.success).count();
        failures as f64 / recent.len() as f64
    }

    /// Mean latency over the recent window, in milliseconds. 0 when idle.
    pub fn avg_response_ms(&self, window: Duration) -> f64 {
        let Ok(outcomes) = self.outcomes.lock() else {
            return 0.0;
        };
        let recent: Vec<&Outcome> = outcomes
            .iter()
            .filter(|o| o.at.elapsed() <= window)
            .collect();
        if recent.is_empty() {
            return 0.0;
        }
        let total: u64 = recent.iter().map(|o| o.elapsed_ms).sum();
        total as f64 / recent.len() as f64
    }
}

impl Default for ClassMetrics {
    fn default() -> Self {
        Self::new()
    }
}
