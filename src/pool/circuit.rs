//! Per-target circuit breaker.
//!
//! CLOSED passes requests and counts failures over a rolling window; at the
//! threshold it trips OPEN and fails fast. After the reset timeout a single
//! HALF_OPEN probe is allowed through: success closes the circuit, failure
//! re-opens it with a doubled timeout.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::config::CircuitBreakerConfig;
use crate::error::{Error, Result};

/// Circuit breaker states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// Emitted on every state transition; consumed by the pool manager and the
/// health monitor.
#[derive(Debug, Clone)]
pub struct CircuitEvent {
    pub target: String,
    pub from: CircuitState,
    pub to: CircuitState,
    pub at: DateTime<Utc>,
}

#[derive(Debug)]
struct Inner {
    state: CircuitState,
    /// Failure timestamps inside the rolling window.
    failures: VecDeque<Instant>,
    opened_at: Option<Instant>,
    current_reset_timeout: Duration,
    probe_in_flight: bool,
}

/// Per-target failure counter with fast-fail and timed recovery.
#[derive(Debug)]
pub struct CircuitBreaker {
    target: String,
    config: CircuitBreakerConfig,
    inner: Mutex<Inner>,
    events: broadcast::Sender<CircuitEvent>,
}

impl CircuitBreaker {
    pub fn new(target: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            target: target.into(),
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                failures: VecDeque::new(),
                opened_at: None,
                current_reset_timeout: Duration::from_millis(config.reset_timeout_ms),
                probe_in_flight: false,
            }),
            config,
            events,
        }
    }

    /// Subscribe to state transition events.
    pub fn subscribe(&self) -> broadcast::Receiver<CircuitEvent> {
        self.events.subscribe()
    }

    /// The breaker's target name.
    pub fn target(&self) -> &str {
        &self.target
    }

    /// Current state, accounting for reset-timeout expiry.
    pub fn state(&self) -> CircuitState {
        self.inner
            .lock()
            .map(|inner| inner.state)
            .unwrap_or(CircuitState::Open)
    }

    /// Admission check. In HALF_OPEN exactly one probe passes until its
    /// outcome is recorded.
    pub fn check(&self) -> Result<()> {
        let mut inner = self
            .inner
            .lock()
            .map_err(|e| Error::Internal(format!("breaker lock poisoned: {e}")))?;

        match inner.state {
            CircuitState::Closed => Ok(()),
            CircuitState::Open => {
                let elapsed = inner
                    .opened_at
                    .map(|at| at.elapsed())
                    .unwrap_or_default();
                if elapsed >= inner.current_reset_timeout {
                    self.transition(&mut inner, CircuitState::HalfOpen);
                    inner.probe_in_flight = true;
                    Ok(())
                } else {
                    Err(Error::circuit_open(&self.target))
                }
            }
            CircuitState::HalfOpen => {
                if inner.probe_in_flight {
                    Err(Error::circuit_open(&self.target))
                } else {
                    inner.probe_in_flight = true;
                    Ok(())
                }
            }
        }
    }

    /// Record a successful call.
    pub fn record_success(&self) {
        let Ok(mut inner) = self.inner.lock() else {
            return;
        };
        match inner.state {
            CircuitState::HalfOpen => {
                inner.probe_in_flight = false;
                inner.failures.clear();
                inner.current_reset_timeout = Duration::from_millis(self.config.reset_timeout_ms);
                self.transition(&mut inner, CircuitState::Closed);
                info!(target = %self.target, "circuit closed after successful probe");
            }
            CircuitState::Closed => {
                self.prune_window(&mut inner);
            }
            CircuitState::Open => {}
        }
    }

    /// Record a failed call.
    pub fn record_failure(&self) {
        let Ok(mut inner) = self.inner.lock() else {
            return;
        };
        match inner.state {
            CircuitState::HalfOpen => {
                inner.probe_in_flight = false;
                inner.opened_at = Some(Instant::now());
                let backed_off = Duration::from_millis(
                    ((inner.current_reset_timeout.as_millis() as f64)
                        * self.config.backoff_multiplier) as u64,
                )
                .min(Duration::from_millis(self.config.max_reset_timeout_ms));
                inner.current_reset_timeout = backed_off;
                self.transition(&mut inner, CircuitState::Open);
                warn!(target = %self.target, reset_timeout_ms = backed_off.as_millis() as u64, "probe failed, circuit re-opened");
            }
            CircuitState::Closed => {
                inner.failures.push_back(Instant::now());
                self.prune_window(&mut inner);
                if inner.failures.len() as u32 >= self.config.failure_threshold {
                    inner.opened_at = Some(Instant::now());
                    self.transition(&mut inner, CircuitState::Open);
                    warn!(target = %self.target, failures = inner.failures.len(), "failure threshold reached, circuit opened");
                }
            }
            CircuitState::Open => {}
        }
    }

    fn prune_window(&self, inner: &mut Inner) {
        let window = Duration::from_millis(self.config.window_ms);
        while let Some(front) = inner.failures.front() {
            if front.elapsed() > window {
                inner.failures.pop_front();
            } else {
                break;
            }
        }
    }

    fn transition(&self, inner: &mut Inner, to: CircuitState) {
        let from = inner.state;
        inner.state = to;
        let _ = self.events.send(CircuitEvent {
            target: self.target.clone(),
            from,
            to,
            at: Utc::now(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(reset_timeout_ms: u64) -> CircuitBreaker {
        CircuitBreaker::new(
            "llm",
            CircuitBreakerConfig {
                failure_threshold: 3,
                reset_timeout_ms,
                window_ms: 60_000,
                backoff_multiplier: 2.0,
                max_reset_timeout_ms: 300_000,
            },
        )
    }

    #[test]
    fn opens_at_failure_threshold() {
        let cb = breaker(10_000);
        for _ in 0..3 {
            assert!(cb.check().is_ok());
            cb.record_failure();
        }
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(matches!(cb.check(), Err(Error::CircuitOpen { .. })));
    }

    #[test]
    fn permits_exactly_one_probe_after_reset_timeout() {
        let cb = breaker(0);
        for _ in 0..3 {
            cb.record_failure();
        }

        // Reset timeout of zero: next check transitions to HALF_OPEN.
        assert!(cb.check().is_ok());
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        // The second caller is rejected while the probe is in flight.
        assert!(cb.check().is_err());
    }

    #[test]
    fn successful_probe_closes_and_resets() {
        let cb = breaker(0);
        for _ in 0..3 {
            cb.record_failure();
        }
        assert!(cb.check().is_ok());
        cb.record_success();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(cb.check().is_ok());
    }

    #[test]
    fn failed_probe_reopens_with_doubled_timeout() {
        let cb = breaker(0);
        for _ in 0..3 {
            cb.record_failure();
        }
        assert!(cb.check().is_ok());
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);

        let inner = cb.inner.lock().unwrap();
        // 0ms doubles to 0; exercise the multiplier with a real timeout.
        drop(inner);
        let cb = breaker(1_000);
        for _ in 0..3 {
            cb.record_failure();
        }
        {
            let mut inner = cb.inner.lock().unwrap();
            inner.opened_at = Some(Instant::now() - Duration::from_secs(2));
        }
        assert!(cb.check().is_ok());
        cb.record_failure();
        let inner = cb.inner.lock().unwrap();
        assert_eq!(inner.current_reset_timeout, Duration::from_millis(2_000));
    }

    #[test]
    fn transitions_are_broadcast() {
        let cb = breaker(10_000);
        let mut rx = cb.subscribe();
        for _ in 0..3 {
            cb.record_failure();
        }
        let event = rx.try_recv().unwrap();
        assert_eq!(event.from, CircuitState::Closed);
        assert_eq!(event.to, CircuitState::Open);
    }
}
