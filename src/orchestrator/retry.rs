//! Retry controller: decides whether a job that lost its worker is re-queued
//! with exponential backoff or failed terminally.
//!
//! The decision itself is a pure function of the job's retry count, so the
//! store can apply it inside the same transaction that releases the worker.
//! The controller then reacts to the committed outcome: logging, events, and
//! waking the scheduler once the backoff has elapsed.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, warn};

use crate::config::OrchestratorConfig;
use crate::orchestrator::events::{EventBus, OrchestratorEvent};
use crate::store::ReleasedJob;

/// Upper bound on any computed delay, so timestamps stay in range.
const MAX_BACKOFF: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// Bounded exponential backoff.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub backoff_base: f64,
}

/// Outcome of applying the policy to a job that lost its worker.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum RetryDecision {
    /// Back to PENDING, invisible to the scheduler until `available_at`.
    Requeue {
        /// Retry count after this decision.
        retry_count: u32,
        #[serde(with = "duration_millis")]
        delay: Duration,
        available_at: DateTime<Utc>,
    },
    /// Retries exhausted; the job is terminally FAILED.
    Exhausted { retry_count: u32 },
}

impl RetryPolicy {
    pub fn from_config(config: &OrchestratorConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            initial_delay: config.initial_delay,
            backoff_base: config.backoff_base,
        }
    }

    /// Delay before retry `attempt` (0-indexed): `initial_delay * backoff_base^attempt`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let secs = self.initial_delay.as_secs_f64() * self.backoff_base.powi(exponent);
        Duration::try_from_secs_f64(secs)
            .unwrap_or(MAX_BACKOFF)
            .min(MAX_BACKOFF)
    }

    /// Decide what happens to a job that has consumed `retry_count` retries.
    pub fn decide(&self, retry_count: u32, now: DateTime<Utc>) -> RetryDecision {
        if retry_count >= self.max_retries {
            return RetryDecision::Exhausted { retry_count };
        }

        let delay = self.delay_for(retry_count);
        let offset = chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::zero());
        RetryDecision::Requeue {
            retry_count: retry_count + 1,
            delay,
            available_at: now + offset,
        }
    }
}

/// Reacts to jobs released by failed, terminated or reporting workers.
pub struct RetryController {
    policy: RetryPolicy,
    events: Arc<EventBus>,
}

impl RetryController {
    pub fn new(policy: RetryPolicy, events: Arc<EventBus>) -> Self {
        Self { policy, events }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// React to a committed release.
    pub fn react(&self, released: &ReleasedJob) {
        match &released.decision {
            RetryDecision::Requeue {
                retry_count,
                delay,
                available_at,
            } => {
                info!(
                    job_id = %released.job.id,
                    worker_id = %released.worker_id,
                    reason = %released.reason,
                    retry_count,
                    delay_ms = delay.as_millis() as u64,
                    "Job re-queued with backoff"
                );
                self.events.publish(OrchestratorEvent::JobRequeued {
                    job_id: released.job.id.clone(),
                    retry_count: *retry_count,
                    available_at: *available_at,
                });
                self.wake_after(*delay);
            }
            RetryDecision::Exhausted { retry_count } => {
                warn!(
                    job_id = %released.job.id,
                    worker_id = %released.worker_id,
                    reason = %released.reason,
                    retry_count,
                    "Retries exhausted, job failed"
                );
                self.events.publish(OrchestratorEvent::JobFailed {
                    job_id: released.job.id.clone(),
                    reason: released
                        .job
                        .last_error
                        .clone()
                        .unwrap_or_else(|| released.reason.to_string()),
                });
            }
        }
    }

    /// Wake the scheduler once a backoff expires.
    fn wake_after(&self, delay: Duration) {
        let events = Arc::clone(&self.events);
        if delay.is_zero() {
            events.wake_scheduler();
            return;
        }
        // Only meaningful inside a runtime; unit tests may drive this synchronously.
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                tokio::time::sleep(delay).await;
                events.wake_scheduler();
            });
        }
    }
}

mod duration_millis {
    use std::time::Duration;

    use serde::Serializer;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            initial_delay: Duration::from_millis(500),
            backoff_base: 2.0,
        }
    }

    #[test]
    fn delay_grows_exponentially() {
        let p = policy(5);
        assert_eq!(p.delay_for(0), Duration::from_millis(500));
        assert_eq!(p.delay_for(1), Duration::from_millis(1000));
        assert_eq!(p.delay_for(2), Duration::from_millis(2000));
        assert_eq!(p.delay_for(3), Duration::from_millis(4000));
    }

    #[test]
    fn base_one_is_constant_delay() {
        let p = RetryPolicy {
            backoff_base: 1.0,
            ..policy(5)
        };
        assert_eq!(p.delay_for(0), p.delay_for(4));
    }

    #[test]
    fn huge_attempts_saturate() {
        let p = policy(u32::MAX);
        assert_eq!(p.delay_for(10_000), MAX_BACKOFF);
    }

    #[test]
    fn requeue_until_exhausted() {
        let p = policy(2);
        let now = Utc::now();

        match p.decide(0, now) {
            RetryDecision::Requeue {
                retry_count,
                delay,
                available_at,
            } => {
                assert_eq!(retry_count, 1);
                assert_eq!(delay, Duration::from_millis(500));
                assert_eq!(available_at, now + chrono::Duration::milliseconds(500));
            }
            other => panic!("expected requeue, got {other:?}"),
        }

        match p.decide(1, now) {
            RetryDecision::Requeue { retry_count, delay, .. } => {
                assert_eq!(retry_count, 2);
                assert_eq!(delay, Duration::from_millis(1000));
            }
            other => panic!("expected requeue, got {other:?}"),
        }

        assert_eq!(p.decide(2, now), RetryDecision::Exhausted { retry_count: 2 });
    }

    #[test]
    fn zero_retries_fail_immediately() {
        let p = policy(0);
        assert_eq!(
            p.decide(0, Utc::now()),
            RetryDecision::Exhausted { retry_count: 0 }
        );
    }

    #[test]
    fn decision_serializes_with_tag() {
        let json = serde_json::to_value(RetryDecision::Exhausted { retry_count: 3 }).unwrap();
        assert_eq!(json["decision"], "exhausted");
        assert_eq!(json["retry_count"], 3);
    }
}
