//! In-process queue broker.
//!
//! At-least-once delivery: a reserved job becomes visible again after its
//! visibility timeout, so consumers must be idempotent with respect to their
//! output. Retries back off exponentially with jitter; jobs that exhaust
//! their attempts land on a per-queue dead-letter list.

use std::collections::{HashMap, HashSet, VecDeque};
use std::time::{Duration, Instant};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::config::BackpressureConfig;
use crate::error::{Error, Result};
use crate::queue::job::{Job, JobPayload, QueueName, RetryPolicy};

/// Depth counters for one queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueCounts {
    /// Immediately deliverable.
    pub ready: usize,
    /// Waiting out a retry backoff.
    pub delayed: usize,
    /// Reserved by a consumer, inside the visibility window.
    pub reserved: usize,
    /// Dead-lettered.
    pub dead: usize,
}

impl QueueCounts {
    /// Work that still has to be processed.
    pub fn backlog(&self) -> usize {
        self.ready + self.delayed + self.reserved
    }
}

/// A dead-lettered job with the reason it was parked.
#[derive(Debug, Clone)]
pub struct DeadJob {
    pub job: Job,
    pub reason: String,
}

struct Reservation {
    deadline: Instant,
    job: Job,
}

#[derive(Default)]
struct QueueState {
    ready: VecDeque<Job>,
    delayed: Vec<(Instant, Job)>,
    reserved: HashMap<u64, Reservation>,
    dead: Vec<DeadJob>,
    /// Outbox event ids already materialized into jobs; replay dedup.
    seen_events: HashSet<i64>,
}

impl QueueState {
    /// Promote delayed jobs whose backoff elapsed and reclaim expired
    /// reservations. Called lazily from every public operation.
    fn reap(&mut self, now: Instant, policy: &RetryPolicy) {
        let mut due = Vec::new();
        self.delayed.retain(|(at, job)| {
            if *at <= now {
                due.push(job.clone());
                false
            } else {
                true
            }
        });
        for job in due {
            self.ready.push_back(job);
        }

        let expired: Vec<u64> = self
            .reserved
            .iter()
            .filter(|(_, r)| r.deadline <= now)
            .map(|(id, _)| *id)
            .collect();
        for id in expired {
            if let Some(res) = self.reserved.remove(&id) {
                let mut job = res.job;
                job.attempts += 1;
                if job.attempts >= policy.max_attempts() {
                    warn!(job_id = job.id, queue = %job.queue, "visibility expired past retry budget, dead-lettering");
                    self.dead.push(DeadJob {
                        job,
                        reason: "visibility timeout exhausted attempts".to_string(),
                    });
                } else {
                    debug!(job_id = job.id, queue = %job.queue, "reservation expired, requeueing");
                    self.ready.push_back(job);
                }
            }
        }
    }

    fn counts(&self) -> QueueCounts {
        QueueCounts {
            ready: self.ready.len(),
            delayed: self.delayed.len(),
            reserved: self.reserved.len(),
            dead: self.dead.len(),
        }
    }
}

/// Named FIFO queues with delayed retry and dead-lettering.
pub struct QueueBroker {
    queues: Mutex<HashMap<QueueName, QueueState>>,
    next_id: std::sync::atomic::AtomicU64,
    policy: RetryPolicy,
    backpressure: HashMap<QueueName, BackpressureConfig>,
}

impl QueueBroker {
    pub fn new(
        policy: RetryPolicy,
        backpressure: HashMap<QueueName, BackpressureConfig>,
    ) -> Self {
        let mut queues = HashMap::new();
        for queue in QueueName::ALL {
            queues.insert(queue, QueueState::default());
        }
        Self {
            queues: Mutex::new(queues),
            next_id: std::sync::atomic::AtomicU64::new(1),
            policy,
            backpressure,
        }
    }

    fn next_id(&self) -> u64 {
        self.next_id
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed)
    }

    /// Enqueue one payload. When `origin_event_id` is set, re-delivery of the
    /// same outbox event is a no-op, which makes publisher replay safe.
    pub async fn enqueue(
        &self,
        payload: JobPayload,
        origin_event_id: Option<i64>,
    ) -> Result<Option<u64>> {
        let queue = payload.queue();
        let mut queues = self.queues.lock().await;
        let state = queues
            .get_mut(&queue)
            .ok_or_else(|| Error::Queue(format!("unknown queue {queue}")))?;

        if let Some(event_id) = origin_event_id {
            if !state.seen_events.insert(event_id) {
                debug!(event_id, queue = %queue, "duplicate event delivery ignored");
                return Ok(None);
            }
        }

        let job = Job {
            id: self.next_id(),
            queue,
            payload,
            attempts: 0,
            origin_event_id,
            enqueued_at: Utc::now(),
        };
        let id = job.id;
        state.ready.push_back(job);
        Ok(Some(id))
    }

    /// Enqueue a batch atomically with respect to other broker operations.
    pub async fn enqueue_bulk(
        &self,
        payloads: Vec<JobPayload>,
        origin_event_id: Option<i64>,
    ) -> Result<usize> {
        if payloads.is_empty() {
            return Ok(0);
        }
        let mut queues = self.queues.lock().await;

        if let Some(event_id) = origin_event_id {
            // All payloads of one event target the same queue.
            let queue = payloads[0].queue();
            let state = queues
                .get_mut(&queue)
                .ok_or_else(|| Error::Queue(format!("unknown queue {queue}")))?;
            if !state.seen_events.insert(event_id) {
                debug!(event_id, queue = %queue, "duplicate bulk delivery ignored");
                return Ok(0);
            }
        }

        let mut enqueued = 0;
        for payload in payloads {
            let queue = payload.queue();
            let state = queues
                .get_mut(&queue)
                .ok_or_else(|| Error::Queue(format!("unknown queue {queue}")))?;
            state.ready.push_back(Job {
                id: self.next_id(),
                queue,
                payload,
                attempts: 0,
                origin_event_id,
                enqueued_at: Utc::now(),
            });
            enqueued += 1;
        }
        Ok(enqueued)
    }

    /// Reserve the oldest ready job, stamping a visibility deadline.
    pub async fn reserve(&self, queue: QueueName, visibility: Duration) -> Option<Job> {
        let mut queues = self.queues.lock().await;
        let state = queues.get_mut(&queue)?;
        state.reap(Instant::now(), &self.policy);

        let job = state.ready.pop_front()?;
        state.reserved.insert(
            job.id,
            Reservation {
                deadline: Instant::now() + visibility,
                job: job.clone(),
            },
        );
        Some(job)
    }

    /// Acknowledge a reserved job as done.
    pub async fn ack(&self, job: &Job) -> Result<()> {
        let mut queues = self.queues.lock().await;
        let state = queues
            .get_mut(&job.queue)
            .ok_or_else(|| Error::Queue(format!("unknown queue {}", job.queue)))?;
        if state.reserved.remove(&job.id).is_none() {
            return Err(Error::VisibilityExpired { job_id: job.id });
        }
        Ok(())
    }

    /// Negative-acknowledge a reserved job, scheduling a backed-off retry or
    /// dead-lettering it once the retry budget is spent.
    pub async fn nack(&self, job: &Job, reason: &str) -> Result<()> {
        let mut queues = self.queues.lock().await;
        let state = queues
            .get_mut(&job.queue)
            .ok_or_else(|| Error::Queue(format!("unknown queue {}", job.queue)))?;
        let Some(res) = state.reserved.remove(&job.id) else {
            return Err(Error::VisibilityExpired { job_id: job.id });
        };

        let mut job = res.job;
        job.attempts += 1;
        if job.attempts >= self.policy.max_attempts() {
            warn!(job_id = job.id, queue = %job.queue, reason, "retry budget exhausted, dead-lettering");
            state.dead.push(DeadJob {
                job,
                reason: format!("attempts exhausted: {reason}"),
            });
        } else {
            let delay = self.policy.delay_for_attempt(job.attempts);
            debug!(job_id = job.id, queue = %job.queue, attempts = job.attempts, delay_ms = delay.as_millis() as u64, reason, "retrying");
            state.delayed.push((Instant::now() + delay, job));
        }
        Ok(())
    }

    /// Return a reserved job to the front of its queue without consuming a
    /// retry attempt. Used when admission (not the work itself) rejected
    /// the job.
    pub async fn release(&self, job: &Job) -> Result<()> {
        let mut queues = self.queues.lock().await;
        let state = queues
            .get_mut(&job.queue)
            .ok_or_else(|| Error::Queue(format!("unknown queue {}", job.queue)))?;
        if let Some(res) = state.reserved.remove(&job.id) {
            state.ready.push_front(res.job);
        }
        Ok(())
    }

    /// Park a reserved job on the dead-letter list.
    pub async fn dead_letter(&self, job: &Job, reason: &str) -> Result<()> {
        let mut queues = self.queues.lock().await;
        let state = queues
            .get_mut(&job.queue)
            .ok_or_else(|| Error::Queue(format!("unknown queue {}", job.queue)))?;
        let parked = match state.reserved.remove(&job.id) {
            Some(res) => res.job,
            None => job.clone(),
        };
        warn!(job_id = parked.id, queue = %parked.queue, reason, "dead-lettered");
        state.dead.push(DeadJob {
            job: parked,
            reason: reason.to_string(),
        });
        Ok(())
    }

    /// Depth counters for one queue.
    pub async fn counts(&self, queue: QueueName) -> QueueCounts {
        let mut queues = self.queues.lock().await;
        match queues.get_mut(&queue) {
            Some(state) => {
                state.reap(Instant::now(), &self.policy);
                state.counts()
            }
            None => QueueCounts::default(),
        }
    }

    /// True when the queue's backlog is at or above its high watermark.
    pub async fn is_saturated(&self, queue: QueueName) -> bool {
        let bp = self.backpressure_for(queue);
        self.counts(queue).await.backlog() >= bp.high
    }

    /// True when the queue's backlog has fallen below its low watermark.
    pub async fn below_low_watermark(&self, queue: QueueName) -> bool {
        let bp = self.backpressure_for(queue);
        self.counts(queue).await.backlog() < bp.low
    }

    fn backpressure_for(&self, queue: QueueName) -> BackpressureConfig {
        self.backpressure
            .get(&queue)
            .copied()
            .unwrap_or_default()
    }

    /// True when no queue holds ready, delayed, or reserved work.
    pub async fn drained(&self) -> bool {
        let mut queues = self.queues.lock().await;
        let now = Instant::now();
        for state in queues.values_mut() {
            state.reap(now, &self.policy);
            if !state.ready.is_empty() || !state.delayed.is_empty() || !state.reserved.is_empty()
            {
                return false;
            }
        }
        true
    }

    /// Total dead-lettered jobs across all queues.
    pub async fn dead_letter_total(&self) -> usize {
        let queues = self.queues.lock().await;
        queues.values().map(|s| s.dead.len()).sum()
    }

    /// Snapshot of the dead-letter list for one queue.
    pub async fn dead_jobs(&self, queue: QueueName) -> Vec<DeadJob> {
        let queues = self.queues.lock().await;
        queues
            .get(&queue)
            .map(|s| s.dead.clone())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetryConfig;

    fn broker() -> QueueBroker {
        // Short, jitterless backoff keeps the tests fast and deterministic.
        let policy = RetryPolicy::new(RetryConfig {
            max_attempts: 3,
            base_delay_ms: 10,
            backoff_factor: 2.0,
            jitter: 0.0,
        });
        QueueBroker::new(policy, HashMap::new())
    }

    fn payload(n: i64) -> JobPayload {
        JobPayload::Validation {
            relationship_id: n,
            run_id: "run-1".to_string(),
        }
    }

    #[tokio::test]
    async fn enqueue_reserve_ack_drains_queue() {
        let broker = broker();
        broker.enqueue(payload(1), None).await.unwrap();

        let job = broker
            .reserve(QueueName::Validation, Duration::from_secs(10))
            .await
            .unwrap();
        assert_eq!(job.attempts, 0);
        broker.ack(&job).await.unwrap();
        assert!(broker.drained().await);
    }

    #[tokio::test]
    async fn fifo_order_is_preserved() {
        let broker = broker();
        for n in 1..=3 {
            broker.enqueue(payload(n), None).await.unwrap();
        }
        for expected in 1..=3 {
            let job = broker
                .reserve(QueueName::Validation, Duration::from_secs(10))
                .await
                .unwrap();
            match job.payload {
                JobPayload::Validation {
                    relationship_id, ..
                } => assert_eq!(relationship_id, expected),
                other => panic!("unexpected payload {other:?}"),
            }
            broker.ack(&job).await.unwrap();
        }
    }

    #[tokio::test]
    async fn nack_delays_then_redelivers_with_attempt_count() {
        let broker = broker();
        broker.enqueue(payload(1), None).await.unwrap();

        let job = broker
            .reserve(QueueName::Validation, Duration::from_secs(10))
            .await
            .unwrap();
        broker.nack(&job, "transient").await.unwrap();

        // Still delayed.
        assert!(broker
            .reserve(QueueName::Validation, Duration::from_secs(10))
            .await
            .is_none());

        tokio::time::sleep(Duration::from_millis(50)).await;
        let retried = broker
            .reserve(QueueName::Validation, Duration::from_secs(10))
            .await
            .unwrap();
        assert_eq!(retried.attempts, 1);
    }

    #[tokio::test]
    async fn exhausted_retries_dead_letter_instead_of_dropping() {
        let broker = broker();
        broker.enqueue(payload(1), None).await.unwrap();

        for _ in 0..3 {
            tokio::time::sleep(Duration::from_millis(60)).await;
            let Some(job) = broker
                .reserve(QueueName::Validation, Duration::from_secs(10))
                .await
            else {
                break;
            };
            broker.nack(&job, "still failing").await.unwrap();
        }

        assert_eq!(broker.counts(QueueName::Validation).await.dead, 1);
        assert!(broker.drained().await);
        let dead = broker.dead_jobs(QueueName::Validation).await;
        assert!(dead[0].reason.contains("still failing"));
    }

    #[tokio::test]
    async fn expired_reservation_becomes_visible_again() {
        let broker = broker();
        broker.enqueue(payload(1), None).await.unwrap();

        let job = broker
            .reserve(QueueName::Validation, Duration::from_millis(20))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;

        let redelivered = broker
            .reserve(QueueName::Validation, Duration::from_secs(10))
            .await
            .unwrap();
        assert_eq!(redelivered.id, job.id);
        assert_eq!(redelivered.attempts, 1);
    }

    #[tokio::test]
    async fn release_returns_job_without_consuming_an_attempt() {
        let broker = broker();
        broker.enqueue(payload(1), None).await.unwrap();
        let job = broker
            .reserve(QueueName::Validation, Duration::from_secs(10))
            .await
            .unwrap();
        broker.release(&job).await.unwrap();

        let again = broker
            .reserve(QueueName::Validation, Duration::from_secs(10))
            .await
            .unwrap();
        assert_eq!(again.id, job.id);
        assert_eq!(again.attempts, 0);
    }

    #[tokio::test]
    async fn duplicate_event_delivery_is_deduplicated() {
        let broker = broker();
        let first = broker.enqueue(payload(1), Some(77)).await.unwrap();
        let second = broker.enqueue(payload(1), Some(77)).await.unwrap();
        assert!(first.is_some());
        assert!(second.is_none());
        assert_eq!(broker.counts(QueueName::Validation).await.ready, 1);
    }

    #[tokio::test]
    async fn saturation_tracks_watermarks() {
        let mut bp = HashMap::new();
        bp.insert(
            QueueName::Validation,
            BackpressureConfig { high: 2, low: 1 },
        );
        let broker = QueueBroker::new(RetryPolicy::default(), bp);

        assert!(!broker.is_saturated(QueueName::Validation).await);
        broker.enqueue(payload(1), None).await.unwrap();
        broker.enqueue(payload(2), None).await.unwrap();
        assert!(broker.is_saturated(QueueName::Validation).await);
        assert!(!broker.below_low_watermark(QueueName::Validation).await);
    }
}
