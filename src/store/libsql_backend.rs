//! libSQL backend: async `Database` trait implementation.
//!
//! Supports local file and in-memory databases. All access goes through a
//! single connection behind an async mutex: a transaction holds the lock from
//! BEGIN to COMMIT, so no reader ever observes a half-applied transition.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Connection, Database as LibSqlDatabase, Transaction, params};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::DatabaseError;
use crate::model::{
    IdempotencyKey, Job, JobStatus, ReleaseReason, ResourceAllocation, Worker, WorkerStatus,
};
use crate::orchestrator::retry::{RetryDecision, RetryPolicy};
use crate::store::migrations;
use crate::store::traits::{
    AssignOutcome, AttemptFailure, CancelOutcome, Completion, Database, DeleteOutcome,
    RegisterOutcome, ReleasedJob, ReportOutcome, SubmitOutcome, WorkerUpdate,
};

/// libSQL database backend.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Mutex<Connection>,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let backend = Self::from_database(db).await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        Self::from_database(db).await
    }

    async fn from_database(db: LibSqlDatabase) -> Result<Self, DatabaseError> {
        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;
        migrations::configure_connection(&conn).await?;

        let backend = Self {
            db: Arc::new(db),
            conn: Mutex::new(conn),
        };
        backend.run_migrations().await?;
        Ok(backend)
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Canonical write format. Fixed width, so text order is time order.
fn ts(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn parse_optional_datetime(s: Option<String>) -> Option<DateTime<Utc>> {
    s.as_deref().map(parse_datetime)
}

/// Convert `Option<&str>` to libsql Value.
fn opt_text(s: Option<&str>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s.to_string()),
        None => libsql::Value::Null,
    }
}

fn query_err(op: &'static str) -> impl FnOnce(libsql::Error) -> DatabaseError {
    move |e| DatabaseError::Query(format!("{op}: {e}"))
}

fn parse_err(op: &'static str) -> impl FnOnce(String) -> DatabaseError {
    move |e| DatabaseError::Serialization(format!("{op}: {e}"))
}

async fn begin(conn: &Connection, op: &'static str) -> Result<Transaction, DatabaseError> {
    conn.transaction()
        .await
        .map_err(|e| DatabaseError::Transaction(format!("{op} begin: {e}")))
}

/// Commit on success, roll back on error.
async fn finish<T>(
    tx: Transaction,
    outcome: Result<T, DatabaseError>,
    op: &'static str,
) -> Result<T, DatabaseError> {
    match outcome {
        Ok(value) => {
            tx.commit()
                .await
                .map_err(|e| DatabaseError::Transaction(format!("{op} commit: {e}")))?;
            Ok(value)
        }
        Err(e) => {
            if let Err(rollback) = tx.rollback().await {
                warn!(op, error = %rollback, "Rollback failed");
            }
            Err(e)
        }
    }
}

const WORKER_COLUMNS: &str = "id, status, current_job_id, endpoint, failure_reason, last_heartbeat_at, created_at, updated_at";

const JOB_COLUMNS: &str = "id, status, task, assigned_worker_id, retry_count, available_at, result, last_error, created_at, updated_at, completed_at";

const ALLOCATION_COLUMNS: &str =
    "id, job_id, worker_id, attempt, allocated_at, released_at, release_reason";

/// Map a libsql Row to a Worker. Column order matches WORKER_COLUMNS.
fn row_to_worker(row: &libsql::Row) -> Result<Worker, DatabaseError> {
    let op = "worker row";
    let status_str: String = row.get(1).map_err(query_err(op))?;
    let heartbeat_str: String = row.get(5).map_err(query_err(op))?;
    let created_str: String = row.get(6).map_err(query_err(op))?;
    let updated_str: String = row.get(7).map_err(query_err(op))?;

    Ok(Worker {
        id: row.get(0).map_err(query_err(op))?,
        status: status_str.parse().map_err(parse_err(op))?,
        current_job_id: row.get::<String>(2).ok(),
        endpoint: row.get::<String>(3).ok(),
        failure_reason: row.get::<String>(4).ok(),
        last_heartbeat_at: parse_datetime(&heartbeat_str),
        created_at: parse_datetime(&created_str),
        updated_at: parse_datetime(&updated_str),
    })
}

/// Map a libsql Row to a Job. Column order matches JOB_COLUMNS.
fn row_to_job(row: &libsql::Row) -> Result<Job, DatabaseError> {
    let op = "job row";
    let status_str: String = row.get(1).map_err(query_err(op))?;
    let task_str: String = row.get(2).map_err(query_err(op))?;
    let retry_count: i64 = row.get(4).map_err(query_err(op))?;
    let available_str: String = row.get(5).map_err(query_err(op))?;
    let result_str: Option<String> = row.get(6).ok();
    let created_str: String = row.get(8).map_err(query_err(op))?;
    let updated_str: String = row.get(9).map_err(query_err(op))?;

    let task = serde_json::from_str(&task_str)
        .map_err(|e| DatabaseError::Serialization(format!("job task: {e}")))?;
    let result = match result_str {
        Some(s) => Some(
            serde_json::from_str(&s)
                .map_err(|e| DatabaseError::Serialization(format!("job result: {e}")))?,
        ),
        None => None,
    };

    Ok(Job {
        id: row.get(0).map_err(query_err(op))?,
        status: status_str.parse().map_err(parse_err(op))?,
        task,
        assigned_worker_id: row.get::<String>(3).ok(),
        retry_count: u32::try_from(retry_count).unwrap_or(u32::MAX),
        available_at: parse_datetime(&available_str),
        result,
        last_error: row.get::<String>(7).ok(),
        created_at: parse_datetime(&created_str),
        updated_at: parse_datetime(&updated_str),
        completed_at: parse_optional_datetime(row.get::<String>(10).ok()),
    })
}

/// Map a libsql Row to a ResourceAllocation. Column order matches ALLOCATION_COLUMNS.
fn row_to_allocation(row: &libsql::Row) -> Result<ResourceAllocation, DatabaseError> {
    let op = "allocation row";
    let attempt: i64 = row.get(3).map_err(query_err(op))?;
    let allocated_str: String = row.get(4).map_err(query_err(op))?;
    let release_reason = match row.get::<String>(6).ok() {
        Some(s) => Some(s.parse::<ReleaseReason>().map_err(parse_err(op))?),
        None => None,
    };

    Ok(ResourceAllocation {
        id: row.get(0).map_err(query_err(op))?,
        job_id: row.get(1).map_err(query_err(op))?,
        worker_id: row.get(2).map_err(query_err(op))?,
        attempt: u32::try_from(attempt).unwrap_or(u32::MAX),
        allocated_at: parse_datetime(&allocated_str),
        released_at: parse_optional_datetime(row.get::<String>(5).ok()),
        release_reason,
    })
}

// ── Statement helpers (usable inside or outside a transaction) ──────

async fn fetch_worker(conn: &Connection, id: &str) -> Result<Option<Worker>, DatabaseError> {
    let mut rows = conn
        .query(
            &format!("SELECT {WORKER_COLUMNS} FROM workers WHERE id = ?1"),
            params![id],
        )
        .await
        .map_err(query_err("fetch_worker"))?;

    match rows.next().await.map_err(query_err("fetch_worker"))? {
        Some(row) => Ok(Some(row_to_worker(&row)?)),
        None => Ok(None),
    }
}

async fn fetch_job(conn: &Connection, id: &str) -> Result<Option<Job>, DatabaseError> {
    let mut rows = conn
        .query(
            &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?1"),
            params![id],
        )
        .await
        .map_err(query_err("fetch_job"))?;

    match rows.next().await.map_err(query_err("fetch_job"))? {
        Some(row) => Ok(Some(row_to_job(&row)?)),
        None => Ok(None),
    }
}

async fn fetch_active_allocation(
    conn: &Connection,
    job_id: &str,
) -> Result<Option<ResourceAllocation>, DatabaseError> {
    let mut rows = conn
        .query(
            &format!(
                "SELECT {ALLOCATION_COLUMNS} FROM allocations WHERE job_id = ?1 AND released_at IS NULL"
            ),
            params![job_id],
        )
        .await
        .map_err(query_err("fetch_active_allocation"))?;

    match rows
        .next()
        .await
        .map_err(query_err("fetch_active_allocation"))?
    {
        Some(row) => Ok(Some(row_to_allocation(&row)?)),
        None => Ok(None),
    }
}

/// Re-read a row that was just written in the same transaction.
async fn refetch_worker(conn: &Connection, id: &str) -> Result<Worker, DatabaseError> {
    fetch_worker(conn, id)
        .await?
        .ok_or_else(|| DatabaseError::Constraint(format!("worker {id} vanished mid-transaction")))
}

async fn refetch_job(conn: &Connection, id: &str) -> Result<Job, DatabaseError> {
    fetch_job(conn, id)
        .await?
        .ok_or_else(|| DatabaseError::Constraint(format!("job {id} vanished mid-transaction")))
}

async fn release_allocation(
    conn: &Connection,
    allocation_id: &str,
    reason: ReleaseReason,
    now: DateTime<Utc>,
) -> Result<(), DatabaseError> {
    conn.execute(
        "UPDATE allocations SET released_at = ?1, release_reason = ?2 WHERE id = ?3 AND released_at IS NULL",
        params![ts(&now), reason.as_str(), allocation_id],
    )
    .await
    .map_err(query_err("release_allocation"))?;
    Ok(())
}

/// Release `allocation` and apply the retry decision to its job.
async fn release_job(
    conn: &Connection,
    allocation: &ResourceAllocation,
    reason: ReleaseReason,
    error: Option<&str>,
    retry: &RetryPolicy,
    now: DateTime<Utc>,
) -> Result<ReleasedJob, DatabaseError> {
    release_allocation(conn, &allocation.id, reason, now).await?;

    let job = refetch_job(conn, &allocation.job_id).await?;
    let decision = retry.decide(job.retry_count, now);
    let error = error.map(str::to_string).unwrap_or_else(|| reason.to_string());

    match &decision {
        RetryDecision::Requeue {
            retry_count,
            available_at,
            ..
        } => {
            conn.execute(
                "UPDATE jobs SET status = 'pending', assigned_worker_id = NULL, retry_count = ?1, available_at = ?2, last_error = ?3, updated_at = ?4 WHERE id = ?5",
                params![
                    i64::from(*retry_count),
                    ts(available_at),
                    error,
                    ts(&now),
                    job.id.as_str()
                ],
            )
            .await
            .map_err(query_err("release_job requeue"))?;
        }
        RetryDecision::Exhausted { .. } => {
            conn.execute(
                "UPDATE jobs SET status = 'failed', last_error = ?1, completed_at = ?2, updated_at = ?2 WHERE id = ?3",
                params![error, ts(&now), job.id.as_str()],
            )
            .await
            .map_err(query_err("release_job fail"))?;
        }
    }

    Ok(ReleasedJob {
        job: refetch_job(conn, &job.id).await?,
        worker_id: allocation.worker_id.clone(),
        reason,
        decision,
    })
}

/// Release whatever job a busy worker holds.
async fn detach_job(
    conn: &Connection,
    worker: &Worker,
    reason: ReleaseReason,
    retry: &RetryPolicy,
    now: DateTime<Utc>,
) -> Result<Option<ReleasedJob>, DatabaseError> {
    let Some(job_id) = worker.current_job_id.as_deref() else {
        return Ok(None);
    };

    match fetch_active_allocation(conn, job_id).await? {
        Some(allocation) if allocation.worker_id == worker.id => {
            let released = release_job(conn, &allocation, reason, None, retry, now).await?;
            Ok(Some(released))
        }
        _ => {
            warn!(worker_id = %worker.id, job_id, "Busy worker has no matching allocation");
            Ok(None)
        }
    }
}

async fn collect_workers(mut rows: libsql::Rows) -> Result<Vec<Worker>, DatabaseError> {
    let mut workers = Vec::new();
    while let Some(row) = rows.next().await.map_err(query_err("collect_workers"))? {
        workers.push(row_to_worker(&row)?);
    }
    Ok(workers)
}

async fn collect_jobs(mut rows: libsql::Rows) -> Result<Vec<Job>, DatabaseError> {
    let mut jobs = Vec::new();
    while let Some(row) = rows.next().await.map_err(query_err("collect_jobs"))? {
        jobs.push(row_to_job(&row)?);
    }
    Ok(jobs)
}

// ── Transaction bodies ──────────────────────────────────────────────

async fn register_in_tx(
    conn: &Connection,
    worker: &Worker,
    max_workers: usize,
) -> Result<RegisterOutcome, DatabaseError> {
    if let Some(existing) = fetch_worker(conn, &worker.id).await? {
        return Ok(RegisterOutcome::Existing(existing));
    }

    let mut rows = conn
        .query(
            "SELECT COUNT(*) FROM workers WHERE status != 'terminated'",
            (),
        )
        .await
        .map_err(query_err("register_worker count"))?;
    let live: i64 = match rows.next().await.map_err(query_err("register_worker count"))? {
        Some(row) => row.get(0).unwrap_or(0),
        None => 0,
    };
    if usize::try_from(live).unwrap_or(usize::MAX) >= max_workers {
        return Ok(RegisterOutcome::LimitReached);
    }

    conn.execute(
        &format!("INSERT INTO workers ({WORKER_COLUMNS}) VALUES (?1, ?2, NULL, ?3, NULL, ?4, ?5, ?6)"),
        params![
            worker.id.as_str(),
            WorkerStatus::Idle.as_str(),
            opt_text(worker.endpoint.as_deref()),
            ts(&worker.last_heartbeat_at),
            ts(&worker.created_at),
            ts(&worker.updated_at),
        ],
    )
    .await
    .map_err(query_err("register_worker insert"))?;

    Ok(RegisterOutcome::Registered(
        refetch_worker(conn, &worker.id).await?,
    ))
}

async fn expire_in_tx(
    conn: &Connection,
    id: &str,
    deadline: DateTime<Utc>,
    reason: &str,
    retry: &RetryPolicy,
    now: DateTime<Utc>,
) -> Result<WorkerUpdate, DatabaseError> {
    let Some(worker) = fetch_worker(conn, id).await? else {
        return Ok(WorkerUpdate::NotFound);
    };
    if worker.status != WorkerStatus::Busy || worker.last_heartbeat_at >= deadline {
        return Ok(WorkerUpdate::Invalid(worker.status));
    }

    let released = detach_job(conn, &worker, ReleaseReason::WorkerTimeout, retry, now).await?;
    conn.execute(
        "UPDATE workers SET status = 'failed', current_job_id = NULL, failure_reason = ?1, updated_at = ?2 WHERE id = ?3",
        params![reason, ts(&now), id],
    )
    .await
    .map_err(query_err("expire_worker"))?;

    Ok(WorkerUpdate::Applied {
        worker: refetch_worker(conn, id).await?,
        released,
    })
}

async fn reset_in_tx(
    conn: &Connection,
    id: &str,
    now: DateTime<Utc>,
) -> Result<WorkerUpdate, DatabaseError> {
    let Some(worker) = fetch_worker(conn, id).await? else {
        return Ok(WorkerUpdate::NotFound);
    };
    if !(worker.status == WorkerStatus::Failed
        && worker.status.can_transition_to(WorkerStatus::Idle))
    {
        return Ok(WorkerUpdate::Invalid(worker.status));
    }

    // A recovered worker gets a fresh liveness lease.
    conn.execute(
        "UPDATE workers SET status = 'idle', failure_reason = NULL, last_heartbeat_at = ?1, updated_at = ?1 WHERE id = ?2",
        params![ts(&now), id],
    )
    .await
    .map_err(query_err("reset_worker"))?;

    Ok(WorkerUpdate::Applied {
        worker: refetch_worker(conn, id).await?,
        released: None,
    })
}

async fn terminate_in_tx(
    conn: &Connection,
    id: &str,
    retry: &RetryPolicy,
    now: DateTime<Utc>,
) -> Result<WorkerUpdate, DatabaseError> {
    let Some(worker) = fetch_worker(conn, id).await? else {
        return Ok(WorkerUpdate::NotFound);
    };

    let released = match worker.status {
        WorkerStatus::Terminated => return Ok(WorkerUpdate::Invalid(worker.status)),
        // BUSY → FAILED → TERMINATED
        WorkerStatus::Busy => {
            let released =
                detach_job(conn, &worker, ReleaseReason::WorkerTerminated, retry, now).await?;
            conn.execute(
                "UPDATE workers SET status = 'failed', current_job_id = NULL, failure_reason = 'terminated while busy', updated_at = ?1 WHERE id = ?2",
                params![ts(&now), id],
            )
            .await
            .map_err(query_err("terminate_worker fail"))?;
            released
        }
        WorkerStatus::Idle | WorkerStatus::Failed => None,
    };

    conn.execute(
        "UPDATE workers SET status = 'terminated', updated_at = ?1 WHERE id = ?2",
        params![ts(&now), id],
    )
    .await
    .map_err(query_err("terminate_worker"))?;

    Ok(WorkerUpdate::Applied {
        worker: refetch_worker(conn, id).await?,
        released,
    })
}

async fn delete_worker_in_tx(conn: &Connection, id: &str) -> Result<DeleteOutcome, DatabaseError> {
    let Some(worker) = fetch_worker(conn, id).await? else {
        return Ok(DeleteOutcome::NotFound);
    };
    if worker.status != WorkerStatus::Terminated {
        return Ok(DeleteOutcome::NotDeletable(worker.status.to_string()));
    }

    conn.execute("DELETE FROM workers WHERE id = ?1", params![id])
        .await
        .map_err(query_err("delete_worker"))?;
    Ok(DeleteOutcome::Deleted)
}

async fn submit_in_tx(
    conn: &Connection,
    key: &str,
    job: &Job,
) -> Result<SubmitOutcome, DatabaseError> {
    // Claim the key first; a duplicate must never leave a second job behind.
    let claimed = conn
        .execute(
            "INSERT OR IGNORE INTO idempotency_keys (key, job_id, created_at) VALUES (?1, NULL, ?2)",
            params![key, ts(&job.created_at)],
        )
        .await
        .map_err(query_err("submit_job claim"))?;

    if claimed == 0 {
        let mut rows = conn
            .query(
                "SELECT job_id FROM idempotency_keys WHERE key = ?1",
                params![key],
            )
            .await
            .map_err(query_err("submit_job lookup"))?;
        let mapped: Option<String> = match rows.next().await.map_err(query_err("submit_job lookup"))? {
            Some(row) => row.get::<String>(0).ok(),
            None => None,
        };

        return Ok(match mapped {
            Some(job_id) => match fetch_job(conn, &job_id).await? {
                Some(existing) => SubmitOutcome::Existing(existing),
                None => SubmitOutcome::Orphaned,
            },
            None => SubmitOutcome::Orphaned,
        });
    }

    let task = serde_json::to_string(&job.task)
        .map_err(|e| DatabaseError::Serialization(format!("job task: {e}")))?;

    conn.execute(
        "INSERT INTO jobs (id, status, task, retry_count, available_at, created_at, updated_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            job.id.as_str(),
            JobStatus::Pending.as_str(),
            task,
            i64::from(job.retry_count),
            ts(&job.available_at),
            ts(&job.created_at),
            ts(&job.updated_at),
        ],
    )
    .await
    .map_err(query_err("submit_job insert"))?;

    conn.execute(
        "UPDATE idempotency_keys SET job_id = ?1 WHERE key = ?2",
        params![job.id.as_str(), key],
    )
    .await
    .map_err(query_err("submit_job map"))?;

    Ok(SubmitOutcome::Created(refetch_job(conn, &job.id).await?))
}

async fn assign_in_tx(
    conn: &Connection,
    job_id: &str,
    worker_id: &str,
    now: DateTime<Utc>,
) -> Result<AssignOutcome, DatabaseError> {
    // Re-validate both sides; the snapshot the scheduler picked from may be stale.
    let Some(job) = fetch_job(conn, job_id).await? else {
        return Ok(AssignOutcome::JobUnavailable);
    };
    if !job.status.can_transition_to(JobStatus::Running) || job.available_at > now {
        return Ok(AssignOutcome::JobUnavailable);
    }
    let Some(worker) = fetch_worker(conn, worker_id).await? else {
        return Ok(AssignOutcome::WorkerUnavailable);
    };
    if !worker.status.can_transition_to(WorkerStatus::Busy) {
        return Ok(AssignOutcome::WorkerUnavailable);
    }

    let allocation = ResourceAllocation::new(job_id, worker_id, job.retry_count, now);
    conn.execute(
        &format!("INSERT INTO allocations ({ALLOCATION_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, NULL, NULL)"),
        params![
            allocation.id.as_str(),
            job_id,
            worker_id,
            i64::from(allocation.attempt),
            ts(&now),
        ],
    )
    .await
    .map_err(query_err("assign_job allocation"))?;

    conn.execute(
        "UPDATE jobs SET status = 'running', assigned_worker_id = ?1, updated_at = ?2 WHERE id = ?3",
        params![worker_id, ts(&now), job_id],
    )
    .await
    .map_err(query_err("assign_job job"))?;

    // Assignment starts a fresh liveness lease.
    conn.execute(
        "UPDATE workers SET status = 'busy', current_job_id = ?1, last_heartbeat_at = ?2, updated_at = ?2 WHERE id = ?3",
        params![job_id, ts(&now), worker_id],
    )
    .await
    .map_err(query_err("assign_job worker"))?;

    Ok(AssignOutcome::Assigned {
        job: refetch_job(conn, job_id).await?,
        worker: refetch_worker(conn, worker_id).await?,
        allocation,
    })
}

/// The allocation a report refers to, if it is still the live one.
async fn reported_allocation(
    conn: &Connection,
    worker_id: &str,
    job_id: &str,
) -> Result<Option<ResourceAllocation>, DatabaseError> {
    Ok(fetch_active_allocation(conn, job_id)
        .await?
        .filter(|a| a.worker_id == worker_id))
}

async fn complete_in_tx(
    conn: &Connection,
    worker_id: &str,
    job_id: &str,
    result: &serde_json::Value,
    now: DateTime<Utc>,
) -> Result<ReportOutcome<Completion>, DatabaseError> {
    let Some(allocation) = reported_allocation(conn, worker_id, job_id).await? else {
        return Ok(ReportOutcome::Stale);
    };

    let result = serde_json::to_string(result)
        .map_err(|e| DatabaseError::Serialization(format!("job result: {e}")))?;

    release_allocation(conn, &allocation.id, ReleaseReason::Completed, now).await?;
    conn.execute(
        "UPDATE jobs SET status = 'completed', result = ?1, completed_at = ?2, updated_at = ?2 WHERE id = ?3",
        params![result, ts(&now), job_id],
    )
    .await
    .map_err(query_err("complete_job job"))?;
    conn.execute(
        "UPDATE workers SET status = 'idle', current_job_id = NULL, last_heartbeat_at = ?1, updated_at = ?1 WHERE id = ?2",
        params![ts(&now), worker_id],
    )
    .await
    .map_err(query_err("complete_job worker"))?;

    Ok(ReportOutcome::Applied(Completion {
        job: refetch_job(conn, job_id).await?,
        worker: refetch_worker(conn, worker_id).await?,
    }))
}

async fn fail_attempt_in_tx(
    conn: &Connection,
    worker_id: &str,
    job_id: &str,
    error: &str,
    retry: &RetryPolicy,
    now: DateTime<Utc>,
) -> Result<ReportOutcome<AttemptFailure>, DatabaseError> {
    let Some(allocation) = reported_allocation(conn, worker_id, job_id).await? else {
        return Ok(ReportOutcome::Stale);
    };

    let released = release_job(conn, &allocation, ReleaseReason::Failed, Some(error), retry, now).await?;
    conn.execute(
        "UPDATE workers SET status = 'idle', current_job_id = NULL, last_heartbeat_at = ?1, updated_at = ?1 WHERE id = ?2",
        params![ts(&now), worker_id],
    )
    .await
    .map_err(query_err("fail_job_attempt worker"))?;

    Ok(ReportOutcome::Applied(AttemptFailure {
        worker: refetch_worker(conn, worker_id).await?,
        released,
    }))
}

async fn cancel_in_tx(
    conn: &Connection,
    id: &str,
    now: DateTime<Utc>,
) -> Result<CancelOutcome, DatabaseError> {
    let Some(job) = fetch_job(conn, id).await? else {
        return Ok(CancelOutcome::NotFound);
    };
    if !job.status.can_transition_to(JobStatus::Cancelled) {
        return Ok(CancelOutcome::AlreadyTerminal(job));
    }

    let mut released_worker = None;
    if job.status == JobStatus::Running {
        if let Some(allocation) = fetch_active_allocation(conn, id).await? {
            release_allocation(conn, &allocation.id, ReleaseReason::Cancelled, now).await?;
            // Cancellation is not a worker failure: straight back to IDLE.
            conn.execute(
                "UPDATE workers SET status = 'idle', current_job_id = NULL, updated_at = ?1 WHERE id = ?2 AND current_job_id = ?3",
                params![ts(&now), allocation.worker_id.as_str(), id],
            )
            .await
            .map_err(query_err("cancel_job worker"))?;
            released_worker = Some(allocation.worker_id);
        }
    }

    conn.execute(
        "UPDATE jobs SET status = 'cancelled', completed_at = ?1, updated_at = ?1 WHERE id = ?2",
        params![ts(&now), id],
    )
    .await
    .map_err(query_err("cancel_job"))?;

    Ok(CancelOutcome::Cancelled {
        job: refetch_job(conn, id).await?,
        released_worker,
    })
}

async fn delete_job_in_tx(conn: &Connection, id: &str) -> Result<DeleteOutcome, DatabaseError> {
    let Some(job) = fetch_job(conn, id).await? else {
        return Ok(DeleteOutcome::NotFound);
    };
    if !job.status.is_terminal() {
        return Ok(DeleteOutcome::NotDeletable(job.status.to_string()));
    }

    conn.execute("DELETE FROM jobs WHERE id = ?1", params![id])
        .await
        .map_err(query_err("delete_job"))?;
    Ok(DeleteOutcome::Deleted)
}

// ── Trait implementation ────────────────────────────────────────────

#[async_trait]
impl Database for LibSqlBackend {
    async fn run_migrations(&self) -> Result<(), DatabaseError> {
        let conn = self.conn.lock().await;
        migrations::run_migrations(&conn).await
    }

    // ── Workers ─────────────────────────────────────────────────────

    async fn register_worker(
        &self,
        worker: &Worker,
        max_workers: usize,
    ) -> Result<RegisterOutcome, DatabaseError> {
        let conn = self.conn.lock().await;
        let tx = begin(&conn, "register_worker").await?;
        let outcome = register_in_tx(&tx, worker, max_workers).await;
        let outcome = finish(tx, outcome, "register_worker").await?;

        if let RegisterOutcome::Registered(ref w) = outcome {
            debug!(worker_id = %w.id, "Worker inserted into DB");
        }
        Ok(outcome)
    }

    async fn get_worker(&self, id: &str) -> Result<Option<Worker>, DatabaseError> {
        let conn = self.conn.lock().await;
        fetch_worker(&conn, id).await
    }

    async fn list_workers(
        &self,
        status: Option<WorkerStatus>,
    ) -> Result<Vec<Worker>, DatabaseError> {
        let conn = self.conn.lock().await;
        let rows = match status {
            Some(status) => conn
                .query(
                    &format!(
                        "SELECT {WORKER_COLUMNS} FROM workers WHERE status = ?1 ORDER BY created_at ASC, id ASC"
                    ),
                    params![status.as_str()],
                )
                .await,
            None => conn
                .query(
                    &format!("SELECT {WORKER_COLUMNS} FROM workers ORDER BY created_at ASC, id ASC"),
                    (),
                )
                .await,
        }
        .map_err(query_err("list_workers"))?;

        collect_workers(rows).await
    }

    async fn record_heartbeat(
        &self,
        id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Worker>, DatabaseError> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE workers SET last_heartbeat_at = ?1, updated_at = ?1 WHERE id = ?2 AND status != 'terminated'",
            params![ts(&now), id],
        )
        .await
        .map_err(query_err("record_heartbeat"))?;

        fetch_worker(&conn, id).await
    }

    async fn list_silent_workers(
        &self,
        deadline: DateTime<Utc>,
    ) -> Result<Vec<Worker>, DatabaseError> {
        let conn = self.conn.lock().await;
        let rows = conn
            .query(
                &format!(
                    "SELECT {WORKER_COLUMNS} FROM workers WHERE status = 'busy' AND last_heartbeat_at < ?1 ORDER BY last_heartbeat_at ASC"
                ),
                params![ts(&deadline)],
            )
            .await
            .map_err(query_err("list_silent_workers"))?;

        collect_workers(rows).await
    }

    async fn expire_worker(
        &self,
        id: &str,
        deadline: DateTime<Utc>,
        reason: &str,
        retry: &RetryPolicy,
        now: DateTime<Utc>,
    ) -> Result<WorkerUpdate, DatabaseError> {
        let conn = self.conn.lock().await;
        let tx = begin(&conn, "expire_worker").await?;
        let outcome = expire_in_tx(&tx, id, deadline, reason, retry, now).await;
        finish(tx, outcome, "expire_worker").await
    }

    async fn reset_worker(
        &self,
        id: &str,
        now: DateTime<Utc>,
    ) -> Result<WorkerUpdate, DatabaseError> {
        let conn = self.conn.lock().await;
        let tx = begin(&conn, "reset_worker").await?;
        let outcome = reset_in_tx(&tx, id, now).await;
        finish(tx, outcome, "reset_worker").await
    }

    async fn terminate_worker(
        &self,
        id: &str,
        retry: &RetryPolicy,
        now: DateTime<Utc>,
    ) -> Result<WorkerUpdate, DatabaseError> {
        let conn = self.conn.lock().await;
        let tx = begin(&conn, "terminate_worker").await?;
        let outcome = terminate_in_tx(&tx, id, retry, now).await;
        finish(tx, outcome, "terminate_worker").await
    }

    async fn delete_worker(&self, id: &str) -> Result<DeleteOutcome, DatabaseError> {
        let conn = self.conn.lock().await;
        let tx = begin(&conn, "delete_worker").await?;
        let outcome = delete_worker_in_tx(&tx, id).await;
        finish(tx, outcome, "delete_worker").await
    }

    // ── Jobs ────────────────────────────────────────────────────────

    async fn submit_job(&self, key: &str, job: &Job) -> Result<SubmitOutcome, DatabaseError> {
        let conn = self.conn.lock().await;
        let tx = begin(&conn, "submit_job").await?;
        let outcome = submit_in_tx(&tx, key, job).await;
        finish(tx, outcome, "submit_job").await
    }

    async fn get_job(&self, id: &str) -> Result<Option<Job>, DatabaseError> {
        let conn = self.conn.lock().await;
        fetch_job(&conn, id).await
    }

    async fn list_jobs(
        &self,
        status: Option<JobStatus>,
        limit: usize,
    ) -> Result<Vec<Job>, DatabaseError> {
        let conn = self.conn.lock().await;
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = match status {
            Some(status) => conn
                .query(
                    &format!(
                        "SELECT {JOB_COLUMNS} FROM jobs WHERE status = ?1 ORDER BY created_at DESC, seq DESC LIMIT ?2"
                    ),
                    params![status.as_str(), limit],
                )
                .await,
            None => conn
                .query(
                    &format!(
                        "SELECT {JOB_COLUMNS} FROM jobs ORDER BY created_at DESC, seq DESC LIMIT ?1"
                    ),
                    params![limit],
                )
                .await,
        }
        .map_err(query_err("list_jobs"))?;

        collect_jobs(rows).await
    }

    async fn list_assignable_jobs(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Job>, DatabaseError> {
        let conn = self.conn.lock().await;
        let rows = conn
            .query(
                &format!(
                    "SELECT {JOB_COLUMNS} FROM jobs WHERE status = 'pending' AND available_at <= ?1 ORDER BY created_at ASC, seq ASC LIMIT ?2"
                ),
                params![ts(&now), i64::try_from(limit).unwrap_or(i64::MAX)],
            )
            .await
            .map_err(query_err("list_assignable_jobs"))?;

        collect_jobs(rows).await
    }

    async fn assign_job(
        &self,
        job_id: &str,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> Result<AssignOutcome, DatabaseError> {
        let conn = self.conn.lock().await;
        let tx = begin(&conn, "assign_job").await?;
        let outcome = assign_in_tx(&tx, job_id, worker_id, now).await;
        finish(tx, outcome, "assign_job").await
    }

    async fn complete_job(
        &self,
        worker_id: &str,
        job_id: &str,
        result: &serde_json::Value,
        now: DateTime<Utc>,
    ) -> Result<ReportOutcome<Completion>, DatabaseError> {
        let conn = self.conn.lock().await;
        let tx = begin(&conn, "complete_job").await?;
        let outcome = complete_in_tx(&tx, worker_id, job_id, result, now).await;
        finish(tx, outcome, "complete_job").await
    }

    async fn fail_job_attempt(
        &self,
        worker_id: &str,
        job_id: &str,
        error: &str,
        retry: &RetryPolicy,
        now: DateTime<Utc>,
    ) -> Result<ReportOutcome<AttemptFailure>, DatabaseError> {
        let conn = self.conn.lock().await;
        let tx = begin(&conn, "fail_job_attempt").await?;
        let outcome = fail_attempt_in_tx(&tx, worker_id, job_id, error, retry, now).await;
        finish(tx, outcome, "fail_job_attempt").await
    }

    async fn cancel_job(
        &self,
        id: &str,
        now: DateTime<Utc>,
    ) -> Result<CancelOutcome, DatabaseError> {
        let conn = self.conn.lock().await;
        let tx = begin(&conn, "cancel_job").await?;
        let outcome = cancel_in_tx(&tx, id, now).await;
        finish(tx, outcome, "cancel_job").await
    }

    async fn delete_job(&self, id: &str) -> Result<DeleteOutcome, DatabaseError> {
        let conn = self.conn.lock().await;
        let tx = begin(&conn, "delete_job").await?;
        let outcome = delete_job_in_tx(&tx, id).await;
        finish(tx, outcome, "delete_job").await
    }

    // ── Allocations & keys ──────────────────────────────────────────

    async fn list_allocations(
        &self,
        job_id: &str,
    ) -> Result<Vec<ResourceAllocation>, DatabaseError> {
        let conn = self.conn.lock().await;
        let mut rows = conn
            .query(
                &format!(
                    "SELECT {ALLOCATION_COLUMNS} FROM allocations WHERE job_id = ?1 ORDER BY allocated_at ASC, attempt ASC"
                ),
                params![job_id],
            )
            .await
            .map_err(query_err("list_allocations"))?;

        let mut allocations = Vec::new();
        while let Some(row) = rows.next().await.map_err(query_err("list_allocations"))? {
            allocations.push(row_to_allocation(&row)?);
        }
        Ok(allocations)
    }

    async fn active_allocation(
        &self,
        job_id: &str,
    ) -> Result<Option<ResourceAllocation>, DatabaseError> {
        let conn = self.conn.lock().await;
        fetch_active_allocation(&conn, job_id).await
    }

    async fn get_idempotency_key(
        &self,
        key: &str,
    ) -> Result<Option<IdempotencyKey>, DatabaseError> {
        let conn = self.conn.lock().await;
        let mut rows = conn
            .query(
                "SELECT key, job_id, created_at FROM idempotency_keys WHERE key = ?1",
                params![key],
            )
            .await
            .map_err(query_err("get_idempotency_key"))?;

        match rows.next().await.map_err(query_err("get_idempotency_key"))? {
            Some(row) => {
                let created_str: String = row.get(2).map_err(query_err("get_idempotency_key"))?;
                Ok(Some(IdempotencyKey {
                    key: row.get(0).map_err(query_err("get_idempotency_key"))?,
                    job_id: row.get::<String>(1).ok(),
                    created_at: parse_datetime(&created_str),
                }))
            }
            None => Ok(None),
        }
    }
}
