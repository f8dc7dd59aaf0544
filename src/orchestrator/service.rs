//! Orchestrator façade: the submission and worker-report interfaces.
//!
//! Wires the store, event bus, dispatch channel and the three background
//! components together. HTTP handlers and tests talk to this type only.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::OrchestratorConfig;
use crate::error::{OrchestratorError, SupervisorError};
use crate::model::{Job, JobStatus, ResourceAllocation, Worker, WorkerStatus};
use crate::orchestrator::channel::{Assignment, WorkerChannel};
use crate::orchestrator::events::{EventBus, OrchestratorEvent};
use crate::orchestrator::idempotency::IdempotencyGuard;
use crate::orchestrator::retry::{RetryController, RetryPolicy};
use crate::orchestrator::scheduler::{Scheduler, spawn_scheduler_loop};
use crate::orchestrator::supervisor::{HeartbeatSupervisor, spawn_supervisor};
use crate::store::{
    CancelOutcome, Database, DeleteOutcome, RegisterOutcome, ReportOutcome, WorkerUpdate,
};

/// Default page size for job listings.
pub const DEFAULT_LIST_LIMIT: usize = 100;

/// Answer to a submission.
#[derive(Debug, Clone, Serialize)]
pub struct SubmitReceipt {
    pub job_id: String,
    pub status: JobStatus,
    /// True when the key had already been used.
    pub duplicate: bool,
}

/// Answer to a worker registration.
#[derive(Debug, Clone)]
pub struct WorkerRegistration {
    pub worker: Worker,
    /// False when a live worker with that id already existed.
    pub created: bool,
}

/// Handles of the background loops started by [`Orchestrator::start`].
pub struct BackgroundTasks {
    pub scheduler: JoinHandle<()>,
    /// Resolves only when the heartbeat monitor escalates.
    pub supervisor: JoinHandle<Result<(), SupervisorError>>,
}

impl BackgroundTasks {
    pub fn abort(&self) {
        self.scheduler.abort();
        self.supervisor.abort();
    }
}

pub struct Orchestrator {
    config: OrchestratorConfig,
    db: Arc<dyn Database>,
    events: Arc<EventBus>,
    channel: Arc<dyn WorkerChannel>,
    guard: IdempotencyGuard,
    retry: Arc<RetryController>,
    scheduler: Arc<Scheduler>,
    supervisor: Arc<HeartbeatSupervisor>,
}

impl Orchestrator {
    pub fn new(
        config: OrchestratorConfig,
        db: Arc<dyn Database>,
        channel: Arc<dyn WorkerChannel>,
    ) -> Self {
        let events = Arc::new(EventBus::new());
        let retry = Arc::new(RetryController::new(
            RetryPolicy::from_config(&config),
            Arc::clone(&events),
        ));
        let scheduler = Arc::new(Scheduler::new(
            Arc::clone(&db),
            Arc::clone(&channel),
            Arc::clone(&retry),
            Arc::clone(&events),
        ));
        let supervisor = Arc::new(HeartbeatSupervisor::new(
            &config,
            Arc::clone(&db),
            Arc::clone(&retry),
            Arc::clone(&events),
        ));
        let guard = IdempotencyGuard::new(Arc::clone(&db), Arc::clone(&events));

        Self {
            config,
            db,
            events,
            channel,
            guard,
            retry,
            scheduler,
            supervisor,
        }
    }

    /// Spawn the scheduler loop and the supervised heartbeat monitor.
    pub fn start(&self) -> BackgroundTasks {
        BackgroundTasks {
            scheduler: spawn_scheduler_loop(
                Arc::clone(&self.scheduler),
                self.config.scheduler_interval,
            ),
            supervisor: spawn_supervisor(
                Arc::clone(&self.supervisor),
                self.config.monitor_max_restarts,
            ),
        }
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn supervisor(&self) -> &HeartbeatSupervisor {
        &self.supervisor
    }

    // ── Submission interface ────────────────────────────────────────

    pub async fn submit(
        &self,
        idempotency_key: &str,
        task: serde_json::Value,
    ) -> Result<SubmitReceipt, OrchestratorError> {
        let submission = self.guard.submit(idempotency_key, task).await?;
        Ok(SubmitReceipt {
            job_id: submission.job.id,
            status: submission.job.status,
            duplicate: submission.duplicate,
        })
    }

    /// Cancel a job. A job that already finished keeps (and reports) its status.
    pub async fn cancel(&self, job_id: &str) -> Result<JobStatus, OrchestratorError> {
        match self.db.cancel_job(job_id, Utc::now()).await? {
            CancelOutcome::Cancelled {
                job,
                released_worker,
            } => {
                info!(job_id = %job.id, released_worker = ?released_worker, "Job cancelled");
                self.events.publish(OrchestratorEvent::JobCancelled {
                    job_id: job.id.clone(),
                });
                if let Some(worker_id) = released_worker {
                    self.notify_cancel(&worker_id, &job.id).await;
                }
                Ok(job.status)
            }
            CancelOutcome::AlreadyTerminal(job) => Ok(job.status),
            CancelOutcome::NotFound => Err(OrchestratorError::JobNotFound {
                id: job_id.to_string(),
            }),
        }
    }

    pub async fn get_job(&self, job_id: &str) -> Result<Job, OrchestratorError> {
        self.db
            .get_job(job_id)
            .await?
            .ok_or_else(|| OrchestratorError::JobNotFound {
                id: job_id.to_string(),
            })
    }

    pub async fn list_jobs(
        &self,
        status: Option<JobStatus>,
        limit: Option<usize>,
    ) -> Result<Vec<Job>, OrchestratorError> {
        let limit = limit.unwrap_or(DEFAULT_LIST_LIMIT);
        Ok(self.db.list_jobs(status, limit).await?)
    }

    pub async fn list_allocations(
        &self,
        job_id: &str,
    ) -> Result<Vec<ResourceAllocation>, OrchestratorError> {
        self.get_job(job_id).await?;
        Ok(self.db.list_allocations(job_id).await?)
    }

    /// Purge a terminal job. Its idempotency key stays claimed.
    pub async fn delete_job(&self, job_id: &str) -> Result<(), OrchestratorError> {
        match self.db.delete_job(job_id).await? {
            DeleteOutcome::Deleted => {
                info!(job_id, "Job purged");
                Ok(())
            }
            DeleteOutcome::NotDeletable(status) => Err(OrchestratorError::JobNotTerminal {
                job_id: job_id.to_string(),
                status,
            }),
            DeleteOutcome::NotFound => Err(OrchestratorError::JobNotFound {
                id: job_id.to_string(),
            }),
        }
    }

    // ── Workers ─────────────────────────────────────────────────────

    pub async fn register_worker(
        &self,
        worker_id: &str,
        endpoint: Option<String>,
    ) -> Result<WorkerRegistration, OrchestratorError> {
        if worker_id.trim().is_empty() {
            return Err(OrchestratorError::InvalidRequest(
                "worker id must not be empty".into(),
            ));
        }

        let candidate = Worker::new(worker_id, endpoint, Utc::now());
        match self
            .db
            .register_worker(&candidate, self.config.max_concurrent_workers)
            .await?
        {
            RegisterOutcome::Registered(worker) => {
                info!(worker_id = %worker.id, endpoint = ?worker.endpoint, "Worker registered");
                self.events.publish(OrchestratorEvent::WorkerRegistered {
                    worker_id: worker.id.clone(),
                });
                Ok(WorkerRegistration {
                    worker,
                    created: true,
                })
            }
            RegisterOutcome::Existing(worker) if worker.status.is_terminal() => {
                Err(OrchestratorError::WorkerTerminated { id: worker.id })
            }
            RegisterOutcome::Existing(worker) => Ok(WorkerRegistration {
                worker,
                created: false,
            }),
            RegisterOutcome::LimitReached => Err(OrchestratorError::WorkerLimitReached {
                max: self.config.max_concurrent_workers,
            }),
        }
    }

    pub async fn get_worker(&self, worker_id: &str) -> Result<Worker, OrchestratorError> {
        self.db
            .get_worker(worker_id)
            .await?
            .ok_or_else(|| OrchestratorError::WorkerNotFound {
                id: worker_id.to_string(),
            })
    }

    pub async fn list_workers(
        &self,
        status: Option<WorkerStatus>,
    ) -> Result<Vec<Worker>, OrchestratorError> {
        Ok(self.db.list_workers(status).await?)
    }

    /// FAILED → IDLE by operator action.
    pub async fn reset_worker(&self, worker_id: &str) -> Result<Worker, OrchestratorError> {
        match self.db.reset_worker(worker_id, Utc::now()).await? {
            WorkerUpdate::Applied { worker, .. } => {
                info!(worker_id = %worker.id, "Worker reset to idle");
                self.events.publish(OrchestratorEvent::WorkerRecovered {
                    worker_id: worker.id.clone(),
                });
                Ok(worker)
            }
            WorkerUpdate::Invalid(from) => Err(invalid_transition(worker_id, from, "idle")),
            WorkerUpdate::NotFound => Err(OrchestratorError::WorkerNotFound {
                id: worker_id.to_string(),
            }),
        }
    }

    /// Decommission a worker. A job it was running goes back through the retry policy.
    pub async fn terminate_worker(&self, worker_id: &str) -> Result<Worker, OrchestratorError> {
        match self
            .db
            .terminate_worker(worker_id, self.retry.policy(), Utc::now())
            .await?
        {
            WorkerUpdate::Applied { worker, released } => {
                info!(worker_id = %worker.id, "Worker terminated");
                self.events.publish(OrchestratorEvent::WorkerTerminated {
                    worker_id: worker.id.clone(),
                });
                if let Some(released) = released {
                    self.retry.react(&released);
                    if let Err(e) = self.channel.cancel(&worker, &released.job.id).await {
                        warn!(worker_id = %worker.id, error = %e, "Cancel delivery failed");
                    }
                }
                Ok(worker)
            }
            WorkerUpdate::Invalid(from) => Err(invalid_transition(worker_id, from, "terminated")),
            WorkerUpdate::NotFound => Err(OrchestratorError::WorkerNotFound {
                id: worker_id.to_string(),
            }),
        }
    }

    /// Purge a TERMINATED worker.
    pub async fn delete_worker(&self, worker_id: &str) -> Result<(), OrchestratorError> {
        match self.db.delete_worker(worker_id).await? {
            DeleteOutcome::Deleted => {
                info!(worker_id, "Worker purged");
                Ok(())
            }
            DeleteOutcome::NotDeletable(from) => Err(OrchestratorError::InvalidWorkerTransition {
                id: worker_id.to_string(),
                from,
                to: "deleted".into(),
            }),
            DeleteOutcome::NotFound => Err(OrchestratorError::WorkerNotFound {
                id: worker_id.to_string(),
            }),
        }
    }

    // ── Worker report interface ─────────────────────────────────────

    pub async fn heartbeat(&self, worker_id: &str) -> Result<Worker, OrchestratorError> {
        self.heartbeat_at(worker_id, Utc::now()).await
    }

    pub async fn heartbeat_at(
        &self,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Worker, OrchestratorError> {
        match self.db.record_heartbeat(worker_id, now).await? {
            Some(worker) if worker.status.is_terminal() => {
                Err(OrchestratorError::WorkerTerminated { id: worker.id })
            }
            Some(worker) => Ok(worker),
            None => Err(OrchestratorError::WorkerNotFound {
                id: worker_id.to_string(),
            }),
        }
    }

    /// The job a worker currently holds, for workers that poll instead of
    /// receiving webhooks.
    pub async fn current_assignment(
        &self,
        worker_id: &str,
    ) -> Result<Option<Assignment>, OrchestratorError> {
        let worker = self.get_worker(worker_id).await?;
        let Some(job_id) = worker.current_job_id.as_deref() else {
            return Ok(None);
        };
        let Some(allocation) = self.db.active_allocation(job_id).await? else {
            return Ok(None);
        };
        let job = self.get_job(job_id).await?;
        Ok(Some(Assignment::new(&job, &worker, allocation.attempt)))
    }

    pub async fn report_completion(
        &self,
        worker_id: &str,
        job_id: &str,
        result: serde_json::Value,
    ) -> Result<Job, OrchestratorError> {
        match self
            .db
            .complete_job(worker_id, job_id, &result, Utc::now())
            .await?
        {
            ReportOutcome::Applied(completion) => {
                info!(job_id, worker_id, "Job completed");
                self.events.publish(OrchestratorEvent::JobCompleted {
                    job_id: job_id.to_string(),
                    worker_id: worker_id.to_string(),
                });
                Ok(completion.job)
            }
            ReportOutcome::Stale => Err(self.stale(worker_id, job_id).await),
        }
    }

    /// A failed attempt: the worker is free again and the job goes through
    /// the retry policy.
    pub async fn report_failure(
        &self,
        worker_id: &str,
        job_id: &str,
        error: &str,
    ) -> Result<Job, OrchestratorError> {
        match self
            .db
            .fail_job_attempt(worker_id, job_id, error, self.retry.policy(), Utc::now())
            .await?
        {
            ReportOutcome::Applied(failure) => {
                info!(job_id, worker_id, error, "Job attempt failed");
                self.retry.react(&failure.released);
                // the worker is idle again
                self.events.wake_scheduler();
                Ok(failure.released.job)
            }
            ReportOutcome::Stale => Err(self.stale(worker_id, job_id).await),
        }
    }

    async fn stale(&self, worker_id: &str, job_id: &str) -> OrchestratorError {
        match self.db.get_worker(worker_id).await {
            Ok(None) => OrchestratorError::WorkerNotFound {
                id: worker_id.to_string(),
            },
            Err(e) => e.into(),
            Ok(Some(_)) => {
                warn!(worker_id, job_id, "Stale report rejected");
                OrchestratorError::StaleReport {
                    worker_id: worker_id.to_string(),
                    job_id: job_id.to_string(),
                }
            }
        }
    }

    async fn notify_cancel(&self, worker_id: &str, job_id: &str) {
        let worker = match self.db.get_worker(worker_id).await {
            Ok(Some(worker)) => worker,
            Ok(None) => return,
            Err(e) => {
                warn!(worker_id, error = %e, "Could not load worker for cancel delivery");
                return;
            }
        };
        if let Err(e) = self.channel.cancel(&worker, job_id).await {
            warn!(worker_id, job_id, error = %e, "Cancel delivery failed");
        }
    }
}

fn invalid_transition(id: &str, from: WorkerStatus, to: &str) -> OrchestratorError {
    OrchestratorError::InvalidWorkerTransition {
        id: id.to_string(),
        from: from.to_string(),
        to: to.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::orchestrator::channel::NullChannel;
    use crate::store::LibSqlBackend;

    async fn orchestrator(config: OrchestratorConfig) -> Orchestrator {
        let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        Orchestrator::new(config, db, Arc::new(NullChannel))
    }

    #[tokio::test]
    async fn submit_returns_receipt() {
        let orch = orchestrator(OrchestratorConfig::default()).await;
        let receipt = orch.submit("k1", json!({"cmd": "ls"})).await.unwrap();
        assert_eq!(receipt.status, JobStatus::Pending);
        assert!(!receipt.duplicate);

        let again = orch.submit("k1", json!({"cmd": "rm"})).await.unwrap();
        assert_eq!(again.job_id, receipt.job_id);
        assert!(again.duplicate);
    }

    #[tokio::test]
    async fn register_rules() {
        let config = OrchestratorConfig {
            max_concurrent_workers: 1,
            ..OrchestratorConfig::default()
        };
        let orch = orchestrator(config).await;

        assert!(orch.register_worker("w1", None).await.unwrap().created);
        // idempotent for a live worker
        let again = orch.register_worker("w1", None).await.unwrap();
        assert!(!again.created);
        assert_eq!(again.worker.id, "w1");
        assert!(matches!(
            orch.register_worker("w2", None).await,
            Err(OrchestratorError::WorkerLimitReached { max: 1 })
        ));

        orch.terminate_worker("w1").await.unwrap();
        assert!(matches!(
            orch.register_worker("w1", None).await,
            Err(OrchestratorError::WorkerTerminated { .. })
        ));
        assert!(matches!(
            orch.heartbeat("w1").await,
            Err(OrchestratorError::WorkerTerminated { .. })
        ));
        assert!(matches!(
            orch.register_worker(" ", None).await,
            Err(OrchestratorError::InvalidRequest(_))
        ));
    }

    #[tokio::test]
    async fn pull_assignment_and_complete() {
        let orch = orchestrator(OrchestratorConfig::default()).await;
        orch.register_worker("w1", None).await.unwrap();
        assert!(orch.current_assignment("w1").await.unwrap().is_none());

        let receipt = orch.submit("k1", json!({"n": 7})).await.unwrap();
        orch.scheduler().tick().await.unwrap();

        let assignment = orch.current_assignment("w1").await.unwrap().unwrap();
        assert_eq!(assignment.job_id, receipt.job_id);
        assert_eq!(assignment.task, json!({"n": 7}));

        let job = orch
            .report_completion("w1", &receipt.job_id, json!("done"))
            .await
            .unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert!(orch.current_assignment("w1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn report_failure_requeues_and_frees_worker() {
        let orch = orchestrator(OrchestratorConfig::default()).await;
        orch.register_worker("w1", None).await.unwrap();
        let receipt = orch.submit("k1", json!({})).await.unwrap();
        orch.scheduler().tick().await.unwrap();

        let job = orch
            .report_failure("w1", &receipt.job_id, "segfault")
            .await
            .unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.retry_count, 1);
        assert_eq!(job.last_error.as_deref(), Some("segfault"));
        let worker = orch.get_worker("w1").await.unwrap();
        assert_eq!(worker.status, WorkerStatus::Idle);

        // a second report for the released attempt is stale
        assert!(matches!(
            orch.report_failure("w1", &receipt.job_id, "again").await,
            Err(OrchestratorError::StaleReport { .. })
        ));
        assert!(matches!(
            orch.report_completion("ghost", &receipt.job_id, json!(null)).await,
            Err(OrchestratorError::WorkerNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn reset_requires_failed_worker() {
        let orch = orchestrator(OrchestratorConfig::default()).await;
        orch.register_worker("w1", None).await.unwrap();
        assert!(matches!(
            orch.reset_worker("w1").await,
            Err(OrchestratorError::InvalidWorkerTransition { .. })
        ));
        assert!(matches!(
            orch.reset_worker("ghost").await,
            Err(OrchestratorError::WorkerNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn cancel_terminal_job_reports_status() {
        let orch = orchestrator(OrchestratorConfig::default()).await;
        let receipt = orch.submit("k1", json!({})).await.unwrap();

        assert_eq!(orch.cancel(&receipt.job_id).await.unwrap(), JobStatus::Cancelled);
        assert_eq!(orch.cancel(&receipt.job_id).await.unwrap(), JobStatus::Cancelled);
        assert!(matches!(
            orch.cancel("ghost").await,
            Err(OrchestratorError::JobNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn delete_rules() {
        let orch = orchestrator(OrchestratorConfig::default()).await;
        let receipt = orch.submit("k1", json!({})).await.unwrap();
        assert!(matches!(
            orch.delete_job(&receipt.job_id).await,
            Err(OrchestratorError::JobNotTerminal { .. })
        ));
        orch.cancel(&receipt.job_id).await.unwrap();
        orch.delete_job(&receipt.job_id).await.unwrap();
        assert!(matches!(
            orch.get_job(&receipt.job_id).await,
            Err(OrchestratorError::JobNotFound { .. })
        ));

        orch.register_worker("w1", None).await.unwrap();
        assert!(matches!(
            orch.delete_worker("w1").await,
            Err(OrchestratorError::InvalidWorkerTransition { .. })
        ));
        orch.terminate_worker("w1").await.unwrap();
        orch.delete_worker("w1").await.unwrap();
    }
}
