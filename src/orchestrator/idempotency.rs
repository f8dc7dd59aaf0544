//! Idempotency guard: one logical submission creates at most one job.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use crate::error::OrchestratorError;
use crate::model::Job;
use crate::orchestrator::events::{EventBus, OrchestratorEvent};
use crate::store::{Database, SubmitOutcome};

/// Longest accepted key, in bytes.
pub const MAX_KEY_LEN: usize = 256;

/// What a submission resolved to.
#[derive(Debug, Clone)]
pub struct Submission {
    pub job: Job,
    /// True when the key had been seen before and no new job was created.
    pub duplicate: bool,
}

pub struct IdempotencyGuard {
    db: Arc<dyn Database>,
    events: Arc<EventBus>,
}

impl IdempotencyGuard {
    pub fn new(db: Arc<dyn Database>, events: Arc<EventBus>) -> Self {
        Self { db, events }
    }

    pub async fn submit(
        &self,
        key: &str,
        task: serde_json::Value,
    ) -> Result<Submission, OrchestratorError> {
        self.submit_at(key, task, Utc::now()).await
    }

    pub async fn submit_at(
        &self,
        key: &str,
        task: serde_json::Value,
        now: DateTime<Utc>,
    ) -> Result<Submission, OrchestratorError> {
        validate_key(key)?;

        match self.db.submit_job(key, &Job::new(task, now)).await? {
            SubmitOutcome::Created(job) => {
                info!(job_id = %job.id, idempotency_key = key, "Job submitted");
                self.events.publish(OrchestratorEvent::JobSubmitted {
                    job_id: job.id.clone(),
                    idempotency_key: key.to_string(),
                });
                Ok(Submission {
                    job,
                    duplicate: false,
                })
            }
            SubmitOutcome::Existing(job) => {
                info!(job_id = %job.id, idempotency_key = key, "Duplicate submission, returning original job");
                Ok(Submission {
                    job,
                    duplicate: true,
                })
            }
            SubmitOutcome::Orphaned => {
                warn!(idempotency_key = key, "Key already used but its job is gone");
                Err(OrchestratorError::DuplicateSubmission {
                    key: key.to_string(),
                })
            }
        }
    }
}

fn validate_key(key: &str) -> Result<(), OrchestratorError> {
    if key.trim().is_empty() {
        return Err(OrchestratorError::InvalidRequest(
            "idempotency key must not be empty".into(),
        ));
    }
    if key.len() > MAX_KEY_LEN {
        return Err(OrchestratorError::InvalidRequest(format!(
            "idempotency key exceeds {MAX_KEY_LEN} bytes"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::model::JobStatus;
    use crate::store::LibSqlBackend;

    async fn guard() -> (IdempotencyGuard, Arc<dyn Database>) {
        let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        (
            IdempotencyGuard::new(Arc::clone(&db), Arc::new(EventBus::new())),
            db,
        )
    }

    #[tokio::test]
    async fn resubmission_returns_same_job() {
        let (guard, db) = guard().await;

        let first = guard.submit("k1", json!({"a": 1})).await.unwrap();
        assert!(!first.duplicate);
        assert_eq!(first.job.status, JobStatus::Pending);

        let second = guard.submit("k1", json!({"a": 2})).await.unwrap();
        assert!(second.duplicate);
        assert_eq!(second.job.id, first.job.id);
        assert_eq!(db.list_jobs(None, 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn distinct_keys_create_distinct_jobs() {
        let (guard, _db) = guard().await;
        let a = guard.submit("k1", json!({})).await.unwrap();
        let b = guard.submit("k2", json!({})).await.unwrap();
        assert_ne!(a.job.id, b.job.id);
    }

    #[tokio::test]
    async fn rejects_bad_keys() {
        let (guard, _db) = guard().await;
        assert!(matches!(
            guard.submit("   ", json!({})).await,
            Err(OrchestratorError::InvalidRequest(_))
        ));
        let long = "x".repeat(MAX_KEY_LEN + 1);
        assert!(matches!(
            guard.submit(&long, json!({})).await,
            Err(OrchestratorError::InvalidRequest(_))
        ));
        let max = "x".repeat(MAX_KEY_LEN);
        assert!(guard.submit(&max, json!({})).await.is_ok());
    }

    #[tokio::test]
    async fn orphaned_key_is_duplicate_submission() {
        let (guard, db) = guard().await;
        let first = guard.submit("k1", json!({})).await.unwrap();
        db.cancel_job(&first.job.id, Utc::now()).await.unwrap();
        db.delete_job(&first.job.id).await.unwrap();

        let err = guard.submit("k1", json!({})).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::DuplicateSubmission { .. }));
    }

    #[tokio::test]
    async fn concurrent_submissions_create_one_job() {
        let (guard, db) = guard().await;
        let guard = Arc::new(guard);

        let mut handles = Vec::new();
        for i in 0..8 {
            let guard = Arc::clone(&guard);
            handles.push(tokio::spawn(async move {
                guard.submit("same", json!({"i": i})).await.unwrap()
            }));
        }
        let mut ids = Vec::new();
        for h in handles {
            ids.push(h.await.unwrap().job.id);
        }
        ids.dedup();
        assert_eq!(ids.len(), 1);
        assert_eq!(db.list_jobs(None, 10).await.unwrap().len(), 1);
    }
}
