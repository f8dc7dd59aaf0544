//! End-to-end orchestration scenarios driven through the `Orchestrator` façade
//! with an in-memory store and a deterministic clock for the background
//! components.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::json;

use assist_orchestrator::config::OrchestratorConfig;
use assist_orchestrator::error::{DispatchError, OrchestratorError};
use assist_orchestrator::model::{JobStatus, ReleaseReason, Worker, WorkerStatus};
use assist_orchestrator::orchestrator::{
    Assignment, NullChannel, Orchestrator, OrchestratorEvent, WorkerChannel,
};
use assist_orchestrator::store::{Database, LibSqlBackend};

fn config(max_retries: u32) -> OrchestratorConfig {
    OrchestratorConfig {
        heartbeat_interval: Duration::from_secs(10),
        worker_timeout: Duration::from_secs(30),
        max_retries,
        initial_delay: Duration::from_secs(1),
        backoff_base: 2.0,
        ..OrchestratorConfig::default()
    }
}

async fn setup(config: OrchestratorConfig) -> (Orchestrator, Arc<dyn Database>) {
    let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
    let orch = Orchestrator::new(config, Arc::clone(&db), Arc::new(NullChannel));
    (orch, db)
}

fn secs(n: i64) -> chrono::Duration {
    chrono::Duration::seconds(n)
}

/// PENDING/RUNNING jobs hold 0/1 live allocations; BUSY workers point at a RUNNING job.
async fn assert_invariants(db: &Arc<dyn Database>) {
    for job in db.list_jobs(None, 1000).await.unwrap() {
        let live = db
            .list_allocations(&job.id)
            .await
            .unwrap()
            .into_iter()
            .filter(|a| a.is_active())
            .count();
        match job.status {
            JobStatus::Running => assert_eq!(live, 1, "running job {} allocations", job.id),
            _ => assert_eq!(live, 0, "{} job {} allocations", job.status, job.id),
        }
        assert_eq!(job.status.is_terminal(), job.completed_at.is_some());
    }

    for worker in db.list_workers(None).await.unwrap() {
        match (&worker.status, &worker.current_job_id) {
            (WorkerStatus::Busy, Some(job_id)) => {
                let job = db.get_job(job_id).await.unwrap().unwrap();
                assert_eq!(job.status, JobStatus::Running);
                assert_eq!(job.assigned_worker_id.as_deref(), Some(worker.id.as_str()));
            }
            (WorkerStatus::Busy, None) => panic!("busy worker {} without a job", worker.id),
            (_, Some(_)) => panic!("{} worker {} holds a job", worker.status, worker.id),
            (_, None) => {}
        }
    }
}

async fn assign_at(orch: &Orchestrator, now: DateTime<Utc>) -> Vec<(String, String)> {
    orch.scheduler()
        .tick_at(now)
        .await
        .unwrap()
        .into_iter()
        .map(|a| (a.job_id, a.worker_id))
        .collect()
}

#[tokio::test]
async fn scenario_a_timeout_then_reassignment() {
    let (orch, db) = setup(config(3)).await;
    let mut events = orch.events().subscribe();

    orch.register_worker("w1", None).await.unwrap();
    let job_id = orch.submit("k1", json!({"cmd": "build"})).await.unwrap().job_id;

    let t0 = Utc::now();
    assert_eq!(assign_at(&orch, t0).await, vec![(job_id.clone(), "w1".into())]);
    assert_invariants(&db).await;

    // w1 goes silent past the timeout
    let check = t0 + secs(31);
    let failed = orch.supervisor().tick_at(check).await.unwrap();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].id, "w1");

    let w1 = orch.get_worker("w1").await.unwrap();
    assert_eq!(w1.status, WorkerStatus::Failed);
    let job = orch.get_job(&job_id).await.unwrap();
    assert_eq!(job.status, JobStatus::Pending);
    assert_eq!(job.retry_count, 1);
    assert_eq!(job.available_at, check + secs(1));
    let history = orch.list_allocations(&job_id).await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].release_reason, Some(ReleaseReason::WorkerTimeout));
    assert_invariants(&db).await;

    orch.register_worker("w2", None).await.unwrap();
    // still backing off
    assert!(assign_at(&orch, check).await.is_empty());
    assert_eq!(
        assign_at(&orch, check + secs(1)).await,
        vec![(job_id.clone(), "w2".into())]
    );
    assert_invariants(&db).await;

    let job = orch
        .report_completion("w2", &job_id, json!({"artifact": "a.tar"}))
        .await
        .unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(orch.get_worker("w2").await.unwrap().status, WorkerStatus::Idle);
    assert_eq!(orch.get_worker("w1").await.unwrap().status, WorkerStatus::Failed);
    assert_invariants(&db).await;

    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        seen.push(event);
    }
    assert!(seen.contains(&OrchestratorEvent::WorkerFailed {
        worker_id: "w1".into(),
        reason: "heartbeat timeout".into(),
    }));
    assert!(seen.contains(&OrchestratorEvent::JobCompleted {
        job_id: job_id.clone(),
        worker_id: "w2".into(),
    }));
}

#[tokio::test]
async fn scenario_b_no_retries_fails_job() {
    let (orch, db) = setup(config(0)).await;
    orch.register_worker("w1", None).await.unwrap();
    let job_id = orch.submit("k1", json!({})).await.unwrap().job_id;

    let t0 = Utc::now();
    assign_at(&orch, t0).await;
    orch.supervisor().tick_at(t0 + secs(31)).await.unwrap();

    let job = orch.get_job(&job_id).await.unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.retry_count, 0);
    assert!(job.completed_at.is_some());
    assert_invariants(&db).await;

    // nothing left to schedule even after a reset
    orch.reset_worker("w1").await.unwrap();
    assert!(assign_at(&orch, t0 + secs(60)).await.is_empty());
}

#[tokio::test]
async fn scenario_c_cancel_running_job() {
    let (orch, db) = setup(config(3)).await;
    orch.register_worker("w1", None).await.unwrap();
    let job_id = orch.submit("k1", json!({})).await.unwrap().job_id;
    assign_at(&orch, Utc::now()).await;

    assert_eq!(orch.cancel(&job_id).await.unwrap(), JobStatus::Cancelled);

    let worker = orch.get_worker("w1").await.unwrap();
    assert_eq!(worker.status, WorkerStatus::Idle);
    let history = orch.list_allocations(&job_id).await.unwrap();
    assert_eq!(history[0].release_reason, Some(ReleaseReason::Cancelled));
    assert_invariants(&db).await;

    let late = orch.report_completion("w1", &job_id, json!("done")).await;
    assert!(matches!(late, Err(OrchestratorError::StaleReport { .. })));
    assert_eq!(
        orch.get_job(&job_id).await.unwrap().status,
        JobStatus::Cancelled
    );
}

#[tokio::test]
async fn retries_back_off_exponentially_until_exhausted() {
    let (orch, db) = setup(config(2)).await;
    orch.register_worker("w1", None).await.unwrap();
    let job_id = orch.submit("k1", json!({})).await.unwrap().job_id;

    let mut now = Utc::now();
    let mut delays = Vec::new();
    for _ in 0..3 {
        assert_eq!(assign_at(&orch, now).await.len(), 1);
        let failed_at = now + secs(31);
        orch.supervisor().tick_at(failed_at).await.unwrap();
        orch.reset_worker("w1").await.unwrap();

        let job = orch.get_job(&job_id).await.unwrap();
        if job.status == JobStatus::Failed {
            break;
        }
        delays.push((job.available_at - failed_at).num_seconds());
        now = job.available_at;
    }

    assert_eq!(delays, vec![1, 2]);
    let job = orch.get_job(&job_id).await.unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.retry_count, 2);
    assert_eq!(orch.list_allocations(&job_id).await.unwrap().len(), 3);
    assert_invariants(&db).await;
}

#[tokio::test]
async fn heartbeat_within_timeout_keeps_job() {
    let (orch, _db) = setup(config(3)).await;
    orch.register_worker("w1", None).await.unwrap();
    let job_id = orch.submit("k1", json!({})).await.unwrap().job_id;

    let t0 = Utc::now();
    assign_at(&orch, t0).await;
    orch.heartbeat_at("w1", t0 + secs(25)).await.unwrap();
    assert!(orch.supervisor().tick_at(t0 + secs(50)).await.unwrap().is_empty());
    assert_eq!(orch.get_job(&job_id).await.unwrap().status, JobStatus::Running);
}

#[tokio::test]
async fn terminating_busy_worker_requeues_its_job() {
    let (orch, db) = setup(config(3)).await;
    orch.register_worker("w1", None).await.unwrap();
    orch.register_worker("w2", None).await.unwrap();
    let job_id = orch.submit("k1", json!({})).await.unwrap().job_id;
    let t0 = Utc::now();
    assign_at(&orch, t0).await;

    let worker = orch.terminate_worker("w1").await.unwrap();
    assert_eq!(worker.status, WorkerStatus::Terminated);
    let job = orch.get_job(&job_id).await.unwrap();
    assert_eq!(job.status, JobStatus::Pending);
    assert_eq!(job.retry_count, 1);
    assert_invariants(&db).await;

    assert_eq!(
        assign_at(&orch, t0 + secs(60)).await,
        vec![(job_id, "w2".into())]
    );
}

/// A worker that is alive but refuses every assignment.
struct RefusingChannel;

#[async_trait]
impl WorkerChannel for RefusingChannel {
    async fn dispatch(&self, worker: &Worker, _: &Assignment) -> Result<(), DispatchError> {
        Err(DispatchError::Rejected {
            worker_id: worker.id.clone(),
            status: 503,
        })
    }

    async fn cancel(&self, _: &Worker, _: &str) -> Result<(), DispatchError> {
        Ok(())
    }
}

#[tokio::test]
async fn refused_dispatch_does_not_strand_job_on_live_worker() {
    let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
    let orch = Orchestrator::new(config(3), Arc::clone(&db), Arc::new(RefusingChannel));

    orch.register_worker("w1", None).await.unwrap();
    let job_id = orch.submit("k1", json!({})).await.unwrap().job_id;

    // w1 keeps beating every 10s while every delivery to it is refused
    let t0 = Utc::now();
    for step in 0..10 {
        let now = t0 + secs(10 * step);
        orch.heartbeat_at("w1", now).await.unwrap();
        orch.supervisor().tick_at(now).await.unwrap();
        assert!(assign_at(&orch, now).await.is_empty());
        assert_invariants(&db).await;
    }

    let job = orch.get_job(&job_id).await.unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.retry_count, 3);
    let history = orch.list_allocations(&job_id).await.unwrap();
    assert_eq!(history.len(), 4);
    assert!(
        history
            .iter()
            .all(|a| a.release_reason == Some(ReleaseReason::Failed))
    );
    assert_eq!(orch.get_worker("w1").await.unwrap().status, WorkerStatus::Idle);
}

#[tokio::test]
async fn fifo_across_many_jobs() {
    let (orch, db) = setup(config(3)).await;
    let mut ids = Vec::new();
    for i in 0..5 {
        ids.push(orch.submit(&format!("k{i}"), json!({"i": i})).await.unwrap().job_id);
    }
    orch.register_worker("w1", None).await.unwrap();

    let now = Utc::now() + secs(1);
    let mut order = Vec::new();
    for _ in 0..5 {
        let made = assign_at(&orch, now).await;
        assert_eq!(made.len(), 1);
        let (job_id, worker_id) = made.into_iter().next().unwrap();
        orch.report_completion(&worker_id, &job_id, json!(null))
            .await
            .unwrap();
        order.push(job_id);
    }
    assert_eq!(order, ids);
    assert_invariants(&db).await;
}

#[tokio::test]
async fn concurrent_activity_keeps_invariants() {
    let (orch, db) = setup(config(3)).await;
    let orch = Arc::new(orch);
    for i in 0..4 {
        orch.register_worker(&format!("w{i}"), None).await.unwrap();
    }

    let mut handles = Vec::new();
    for i in 0..20 {
        let orch = Arc::clone(&orch);
        handles.push(tokio::spawn(async move {
            let receipt = orch.submit(&format!("k{}", i % 10), json!({})).await.unwrap();
            orch.scheduler().tick().await.unwrap();
            if i % 3 == 0 {
                orch.cancel(&receipt.job_id).await.unwrap();
            }
            orch.scheduler().tick().await.unwrap();
        }));
    }
    for h in handles {
        h.await.unwrap();
    }

    assert_eq!(db.list_jobs(None, 100).await.unwrap().len(), 10);
    assert_invariants(&db).await;
}

#[tokio::test]
async fn background_loops_assign_without_manual_ticks() {
    let config = OrchestratorConfig {
        heartbeat_interval: Duration::from_millis(50),
        worker_timeout: Duration::from_millis(500),
        scheduler_interval: Duration::from_secs(60),
        ..config(3)
    };
    let (orch, _db) = setup(config).await;
    let tasks = orch.start();

    orch.register_worker("w1", None).await.unwrap();
    let job_id = orch.submit("k1", json!({})).await.unwrap().job_id;

    let mut status = JobStatus::Pending;
    for _ in 0..100 {
        status = orch.get_job(&job_id).await.unwrap().status;
        if status == JobStatus::Running {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(status, JobStatus::Running);

    // stop beating: the real monitor fails the worker and requeues the job
    let mut worker_status = WorkerStatus::Busy;
    for _ in 0..200 {
        worker_status = orch.get_worker("w1").await.unwrap().status;
        if worker_status == WorkerStatus::Failed {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    tasks.abort();
    assert_eq!(worker_status, WorkerStatus::Failed);
    assert_eq!(orch.get_job(&job_id).await.unwrap().retry_count, 1);
}
