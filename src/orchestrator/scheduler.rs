//! Scheduler: pairs IDLE workers with eligible PENDING jobs.
//!
//! Each tick takes a snapshot of idle workers (registration order) and
//! assignable jobs (oldest first), then walks both lists greedily. Every pair
//! is committed by `Database::assign_job`, which re-checks both sides inside
//! its transaction, so a snapshot gone stale only costs a skipped pairing.
//! Dispatch to the worker happens after the commit, never inside it. An
//! assignment the worker never accepted is released as a failed attempt.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::error::{DatabaseError, DispatchError};
use crate::model::{Worker, WorkerStatus};
use crate::orchestrator::channel::{Assignment, WorkerChannel};
use crate::orchestrator::events::{EventBus, OrchestratorEvent};
use crate::orchestrator::retry::RetryController;
use crate::store::{AssignOutcome, Database, ReportOutcome};

pub struct Scheduler {
    db: Arc<dyn Database>,
    channel: Arc<dyn WorkerChannel>,
    retry: Arc<RetryController>,
    events: Arc<EventBus>,
}

impl Scheduler {
    pub fn new(
        db: Arc<dyn Database>,
        channel: Arc<dyn WorkerChannel>,
        retry: Arc<RetryController>,
        events: Arc<EventBus>,
    ) -> Self {
        Self {
            db,
            channel,
            retry,
            events,
        }
    }

    /// Run one scheduling pass now.
    pub async fn tick(&self) -> Result<Vec<Assignment>, DatabaseError> {
        self.tick_at(Utc::now()).await
    }

    /// Run one scheduling pass as of `now`. Returns the assignments delivered.
    ///
    /// A store error stops pairing, but pairs already committed are still
    /// dispatched before the error is returned.
    pub async fn tick_at(&self, now: DateTime<Utc>) -> Result<Vec<Assignment>, DatabaseError> {
        let workers = self.db.list_workers(Some(WorkerStatus::Idle)).await?;
        if workers.is_empty() {
            debug!("Scheduler tick: no idle workers");
            return Ok(Vec::new());
        }
        let jobs = self.db.list_assignable_jobs(now, workers.len()).await?;
        if jobs.is_empty() {
            debug!(idle = workers.len(), "Scheduler tick: no assignable jobs");
            return Ok(Vec::new());
        }

        let mut made = Vec::new();
        let mut interrupted = None;
        let (mut wi, mut ji) = (0, 0);
        while wi < workers.len() && ji < jobs.len() {
            let (worker, job) = (&workers[wi], &jobs[ji]);
            let outcome = match self.db.assign_job(&job.id, &worker.id, now).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    error!(
                        job_id = %job.id,
                        worker_id = %worker.id,
                        error = %e,
                        "Assignment failed, stopping this pass"
                    );
                    interrupted = Some(e);
                    break;
                }
            };
            match outcome {
                AssignOutcome::Assigned {
                    job,
                    worker,
                    allocation,
                } => {
                    info!(
                        job_id = %job.id,
                        worker_id = %worker.id,
                        attempt = allocation.attempt,
                        "Job assigned"
                    );
                    self.events.publish(OrchestratorEvent::JobAssigned {
                        job_id: job.id.clone(),
                        worker_id: worker.id.clone(),
                        attempt: allocation.attempt,
                    });
                    let assignment = Assignment::new(&job, &worker, allocation.attempt);
                    made.push((worker, assignment));
                    wi += 1;
                    ji += 1;
                }
                AssignOutcome::JobUnavailable => {
                    debug!(job_id = %job.id, "Job no longer assignable, skipping");
                    ji += 1;
                }
                AssignOutcome::WorkerUnavailable => {
                    debug!(worker_id = %worker.id, "Worker no longer idle, skipping");
                    wi += 1;
                }
            }
        }

        // Outside every transaction.
        let deliveries = made
            .iter()
            .map(|(worker, assignment)| self.channel.dispatch(worker, assignment));
        let results = join_all(deliveries).await;
        let mut delivered = Vec::with_capacity(made.len());
        for ((worker, assignment), result) in made.into_iter().zip(results) {
            let Err(cause) = result else {
                delivered.push(assignment);
                continue;
            };
            if let Err(e) = self.undeliverable(&worker, &assignment, cause, now).await {
                error!(job_id = %assignment.job_id, error = %e, "Failed to release undelivered attempt");
                interrupted.get_or_insert(e);
            }
        }

        match interrupted {
            Some(e) => Err(e),
            None => Ok(delivered),
        }
    }

    /// Release an assignment the worker never received. The worker goes back
    /// to IDLE and the job through the retry policy.
    async fn undeliverable(
        &self,
        worker: &Worker,
        assignment: &Assignment,
        cause: DispatchError,
        now: DateTime<Utc>,
    ) -> Result<(), DatabaseError> {
        warn!(
            job_id = %assignment.job_id,
            worker_id = %worker.id,
            error = %cause,
            "Dispatch failed, releasing attempt"
        );
        let reason = format!("dispatch failed: {cause}");
        match self
            .db
            .fail_job_attempt(
                &worker.id,
                &assignment.job_id,
                &reason,
                self.retry.policy(),
                now,
            )
            .await?
        {
            ReportOutcome::Applied(failure) => self.retry.react(&failure.released),
            // already reported, cancelled or timed out in the meantime
            ReportOutcome::Stale => {
                debug!(job_id = %assignment.job_id, "Undelivered attempt already released")
            }
        }
        Ok(())
    }
}

/// Spawn the scheduler loop: a tick every `interval`, or sooner when woken.
pub fn spawn_scheduler_loop(scheduler: Arc<Scheduler>, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!(
            interval_ms = interval.as_millis() as u64,
            "Scheduler loop started"
        );

        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = scheduler.events.scheduler_woken() => {}
            }
            if let Err(e) = scheduler.tick().await {
                error!(error = %e, "Scheduler tick failed");
            }
        }
    })
}
