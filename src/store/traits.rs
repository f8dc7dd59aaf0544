//! `Database` trait: single async interface for orchestrator state.
//!
//! Every method that changes state is one transaction. Transitions that can be
//! refused (stale report, worker not idle, ...) return an outcome enum rather
//! than an error; errors are reserved for storage failures.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::DatabaseError;
use crate::model::{
    IdempotencyKey, Job, JobStatus, ReleaseReason, ResourceAllocation, Worker, WorkerStatus,
};
use crate::orchestrator::retry::{RetryDecision, RetryPolicy};

/// Result of recording a submission under an idempotency key.
#[derive(Debug, Clone)]
pub enum SubmitOutcome {
    /// New key; the job was created.
    Created(Job),
    /// Key seen before; this is the job created the first time.
    Existing(Job),
    /// Key seen before but its job can no longer be located.
    Orphaned,
}

/// Result of pairing one job with one worker.
#[derive(Debug, Clone)]
pub enum AssignOutcome {
    Assigned {
        job: Job,
        worker: Worker,
        allocation: ResourceAllocation,
    },
    /// The job is no longer PENDING or its backoff has not elapsed.
    JobUnavailable,
    /// The worker is no longer IDLE.
    WorkerUnavailable,
}

/// A worker report either applies to the worker's active allocation or is stale.
#[derive(Debug, Clone)]
pub enum ReportOutcome<T> {
    Applied(T),
    Stale,
}

/// A job released from its worker and run through the retry policy.
#[derive(Debug, Clone)]
pub struct ReleasedJob {
    /// The job after the decision was applied (PENDING or FAILED).
    pub job: Job,
    pub worker_id: String,
    pub reason: ReleaseReason,
    pub decision: RetryDecision,
}

/// A successful completion report.
#[derive(Debug, Clone)]
pub struct Completion {
    pub job: Job,
    pub worker: Worker,
}

/// A failed-attempt report.
#[derive(Debug, Clone)]
pub struct AttemptFailure {
    pub worker: Worker,
    pub released: ReleasedJob,
}

/// Result of a cancellation request.
#[derive(Debug, Clone)]
pub enum CancelOutcome {
    Cancelled {
        job: Job,
        /// The worker returned to IDLE, if the job was running.
        released_worker: Option<String>,
    },
    /// Already COMPLETED, FAILED or CANCELLED; nothing changed.
    AlreadyTerminal(Job),
    NotFound,
}

/// Result of registering a worker.
#[derive(Debug, Clone)]
pub enum RegisterOutcome {
    Registered(Worker),
    /// A worker with that id already exists; returned unchanged.
    Existing(Worker),
    LimitReached,
}

/// Result of a worker state transition.
#[derive(Debug, Clone)]
pub enum WorkerUpdate {
    Applied {
        worker: Worker,
        /// Job the worker was holding, if the transition released one.
        released: Option<ReleasedJob>,
    },
    /// The transition's precondition did not hold; carries the current status.
    Invalid(WorkerStatus),
    NotFound,
}

/// Result of purging a row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeleteOutcome {
    Deleted,
    /// The row exists but is not in a purgeable state; carries its status.
    NotDeletable(String),
    NotFound,
}

/// Backend-agnostic store covering workers, jobs, allocations and idempotency keys.
#[async_trait]
pub trait Database: Send + Sync {
    /// Run all pending schema migrations.
    async fn run_migrations(&self) -> Result<(), DatabaseError>;

    // ── Workers ─────────────────────────────────────────────────────

    /// Register a worker unless `max_workers` non-terminated workers exist.
    async fn register_worker(
        &self,
        worker: &Worker,
        max_workers: usize,
    ) -> Result<RegisterOutcome, DatabaseError>;

    async fn get_worker(&self, id: &str) -> Result<Option<Worker>, DatabaseError>;

    /// Workers in registration order, optionally filtered by status.
    async fn list_workers(
        &self,
        status: Option<WorkerStatus>,
    ) -> Result<Vec<Worker>, DatabaseError>;

    /// Stamp a heartbeat. Terminated workers are left untouched.
    /// Returns the worker as stored afterwards, or `None` if unknown.
    async fn record_heartbeat(
        &self,
        id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Worker>, DatabaseError>;

    /// BUSY workers whose last heartbeat is older than `deadline`.
    async fn list_silent_workers(
        &self,
        deadline: DateTime<Utc>,
    ) -> Result<Vec<Worker>, DatabaseError>;

    /// BUSY → FAILED for a worker still silent since before `deadline`,
    /// releasing its job through `retry`. A worker that is no longer busy or
    /// has beaten since yields `Invalid` with its current status.
    async fn expire_worker(
        &self,
        id: &str,
        deadline: DateTime<Utc>,
        reason: &str,
        retry: &RetryPolicy,
        now: DateTime<Utc>,
    ) -> Result<WorkerUpdate, DatabaseError>;

    /// FAILED → IDLE.
    async fn reset_worker(&self, id: &str, now: DateTime<Utc>)
    -> Result<WorkerUpdate, DatabaseError>;

    /// IDLE|FAILED → TERMINATED. A BUSY worker passes through FAILED in the
    /// same transaction and its job is released through `retry`.
    async fn terminate_worker(
        &self,
        id: &str,
        retry: &RetryPolicy,
        now: DateTime<Utc>,
    ) -> Result<WorkerUpdate, DatabaseError>;

    /// Purge a TERMINATED worker. Cascades its allocations and clears job references.
    async fn delete_worker(&self, id: &str) -> Result<DeleteOutcome, DatabaseError>;

    // ── Jobs ────────────────────────────────────────────────────────

    /// Record `key` and create `job` under it, or return the job already mapped to it.
    async fn submit_job(&self, key: &str, job: &Job) -> Result<SubmitOutcome, DatabaseError>;

    async fn get_job(&self, id: &str) -> Result<Option<Job>, DatabaseError>;

    /// Most recent first, optionally filtered by status.
    async fn list_jobs(
        &self,
        status: Option<JobStatus>,
        limit: usize,
    ) -> Result<Vec<Job>, DatabaseError>;

    /// PENDING jobs whose backoff has elapsed, oldest first (FIFO, ties by insertion).
    async fn list_assignable_jobs(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Job>, DatabaseError>;

    /// Create an allocation and flip Job → RUNNING, Worker → BUSY together.
    /// Both preconditions are re-checked inside the transaction.
    async fn assign_job(
        &self,
        job_id: &str,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> Result<AssignOutcome, DatabaseError>;

    /// Job → COMPLETED, Worker → IDLE, allocation released.
    async fn complete_job(
        &self,
        worker_id: &str,
        job_id: &str,
        result: &serde_json::Value,
        now: DateTime<Utc>,
    ) -> Result<ReportOutcome<Completion>, DatabaseError>;

    /// Worker → IDLE, allocation released, job through `retry`.
    async fn fail_job_attempt(
        &self,
        worker_id: &str,
        job_id: &str,
        error: &str,
        retry: &RetryPolicy,
        now: DateTime<Utc>,
    ) -> Result<ReportOutcome<AttemptFailure>, DatabaseError>;

    /// PENDING|RUNNING → CANCELLED. A running job's worker returns to IDLE.
    async fn cancel_job(&self, id: &str, now: DateTime<Utc>)
    -> Result<CancelOutcome, DatabaseError>;

    /// Purge a terminal job. Cascades its allocations; its idempotency key stays.
    async fn delete_job(&self, id: &str) -> Result<DeleteOutcome, DatabaseError>;

    // ── Allocations & keys ──────────────────────────────────────────

    /// Every attempt for a job, oldest first.
    async fn list_allocations(
        &self,
        job_id: &str,
    ) -> Result<Vec<ResourceAllocation>, DatabaseError>;

    async fn active_allocation(
        &self,
        job_id: &str,
    ) -> Result<Option<ResourceAllocation>, DatabaseError>;

    async fn get_idempotency_key(&self, key: &str)
    -> Result<Option<IdempotencyKey>, DatabaseError>;
}
