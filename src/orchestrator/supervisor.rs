//! Heartbeat supervisor: detects silent BUSY workers and releases their jobs.
//!
//! The monitor loop sweeps once per heartbeat interval and stamps its own
//! heartbeat on every pass. A watchdog task watches that stamp: a monitor that
//! panics or stays silent longer than the worker timeout is restarted, up to
//! `monitor_max_restarts` times in total, after which the watchdog gives up
//! with [`SupervisorError::MonitorEscalation`].

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::OrchestratorConfig;
use crate::error::{DatabaseError, SupervisorError};
use crate::model::Worker;
use crate::orchestrator::events::{EventBus, OrchestratorEvent};
use crate::orchestrator::retry::RetryController;
use crate::store::{Database, WorkerUpdate};

/// Reason recorded on workers failed by the sweep.
pub const TIMEOUT_REASON: &str = "heartbeat timeout";

pub struct HeartbeatSupervisor {
    db: Arc<dyn Database>,
    retry: Arc<RetryController>,
    events: Arc<EventBus>,
    heartbeat_interval: Duration,
    worker_timeout: Duration,
    auto_recover: bool,
    /// Unix millis of the monitor's last pass.
    monitor_beat: AtomicI64,
}

impl HeartbeatSupervisor {
    pub fn new(
        config: &OrchestratorConfig,
        db: Arc<dyn Database>,
        retry: Arc<RetryController>,
        events: Arc<EventBus>,
    ) -> Self {
        Self {
            db,
            retry,
            events,
            heartbeat_interval: config.heartbeat_interval,
            worker_timeout: config.worker_timeout,
            auto_recover: config.auto_recover,
            monitor_beat: AtomicI64::new(Utc::now().timestamp_millis()),
        }
    }

    pub async fn tick(&self) -> Result<Vec<Worker>, DatabaseError> {
        self.tick_at(Utc::now()).await
    }

    /// Fail every BUSY worker silent for longer than the timeout as of `now`.
    /// Returns the affected workers in their final state.
    pub async fn tick_at(&self, now: DateTime<Utc>) -> Result<Vec<Worker>, DatabaseError> {
        let timeout = chrono::Duration::from_std(self.worker_timeout)
            .unwrap_or(chrono::Duration::MAX);
        let deadline = now
            .checked_sub_signed(timeout)
            .unwrap_or(DateTime::<Utc>::MIN_UTC);

        let silent: Vec<Worker> = self
            .db
            .list_silent_workers(deadline)
            .await?
            .into_iter()
            .filter(|w| w.is_silent_since(now, self.worker_timeout))
            .collect();
        if silent.is_empty() {
            debug!("Supervisor sweep: all busy workers alive");
            return Ok(Vec::new());
        }

        let mut affected = Vec::with_capacity(silent.len());
        for candidate in silent {
            let update = self
                .db
                .expire_worker(
                    &candidate.id,
                    deadline,
                    TIMEOUT_REASON,
                    self.retry.policy(),
                    now,
                )
                .await?;

            let WorkerUpdate::Applied { worker, released } = update else {
                debug!(worker_id = %candidate.id, "Worker recovered before expiry, skipping");
                continue;
            };

            warn!(
                worker_id = %worker.id,
                last_heartbeat_at = %candidate.last_heartbeat_at,
                "Worker heartbeat timed out"
            );
            self.events.publish(OrchestratorEvent::WorkerFailed {
                worker_id: worker.id.clone(),
                reason: TIMEOUT_REASON.to_string(),
            });
            if let Some(released) = &released {
                self.retry.react(released);
            }

            affected.push(if self.auto_recover {
                self.recover(worker, now).await?
            } else {
                worker
            });
        }

        Ok(affected)
    }

    async fn recover(&self, worker: Worker, now: DateTime<Utc>) -> Result<Worker, DatabaseError> {
        match self.db.reset_worker(&worker.id, now).await? {
            WorkerUpdate::Applied { worker, .. } => {
                info!(worker_id = %worker.id, "Worker auto-recovered");
                self.events.publish(OrchestratorEvent::WorkerRecovered {
                    worker_id: worker.id.clone(),
                });
                Ok(worker)
            }
            _ => Ok(worker),
        }
    }

    /// Stamp the monitor's own heartbeat.
    pub fn record_monitor_beat(&self, now: DateTime<Utc>) {
        self.monitor_beat
            .store(now.timestamp_millis(), Ordering::Release);
    }

    /// True once the monitor has been silent for longer than the worker timeout.
    pub fn monitor_stalled(&self, now: DateTime<Utc>) -> bool {
        let last = self.monitor_beat.load(Ordering::Acquire);
        let silent_ms = now.timestamp_millis().saturating_sub(last);
        u128::try_from(silent_ms).unwrap_or(0) > self.worker_timeout.as_millis()
    }
}

/// Spawn the monitor loop under a watchdog. The returned handle resolves only
/// if the watchdog escalates.
pub fn spawn_supervisor(
    supervisor: Arc<HeartbeatSupervisor>,
    max_restarts: u32,
) -> JoinHandle<Result<(), SupervisorError>> {
    let check_every = supervisor.heartbeat_interval;
    tokio::spawn(async move {
        let monitor = Arc::clone(&supervisor);
        let stalled = Arc::clone(&supervisor);
        let result = watchdog(
            move || spawn_monitor(Arc::clone(&monitor)),
            move || stalled.monitor_stalled(Utc::now()),
            check_every,
            max_restarts,
        )
        .await;
        if let Err(e) = &result {
            error!(error = %e, "Heartbeat monitor escalated");
        }
        result
    })
}

fn spawn_monitor(supervisor: Arc<HeartbeatSupervisor>) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!(
            interval_ms = supervisor.heartbeat_interval.as_millis() as u64,
            timeout_ms = supervisor.worker_timeout.as_millis() as u64,
            "Heartbeat monitor started"
        );

        let mut ticker = tokio::time::interval(supervisor.heartbeat_interval);
        loop {
            ticker.tick().await;
            supervisor.record_monitor_beat(Utc::now());
            if let Err(e) = supervisor.tick().await {
                warn!(error = %e, "Supervisor sweep failed");
            }
        }
    })
}

/// Keep a monitor task alive. `spawn` starts a fresh monitor, `stalled`
/// reports whether the running one has gone quiet. Restarts at most
/// `max_restarts` times over the watchdog's lifetime.
async fn watchdog<S, T>(
    spawn: S,
    stalled: T,
    check_every: Duration,
    max_restarts: u32,
) -> Result<(), SupervisorError>
where
    S: Fn() -> JoinHandle<()>,
    T: Fn() -> bool,
{
    let mut restarts = 0;
    loop {
        let exit = supervise_once(spawn(), &stalled, check_every).await;
        if restarts >= max_restarts {
            return Err(SupervisorError::MonitorEscalation { restarts });
        }
        restarts += 1;
        warn!(reason = %exit, restarts, max_restarts, "Restarting heartbeat monitor");
    }
}

/// Wait until the monitor dies or stalls, aborting it in the latter case.
async fn supervise_once<T>(mut monitor: JoinHandle<()>, stalled: &T, check_every: Duration) -> String
where
    T: Fn() -> bool,
{
    loop {
        tokio::select! {
            joined = &mut monitor => {
                return match joined {
                    Err(e) if e.is_panic() => "panicked".to_string(),
                    Err(e) => format!("aborted: {e}"),
                    Ok(()) => "exited".to_string(),
                };
            }
            _ = tokio::time::sleep(check_every) => {
                if stalled() {
                    monitor.abort();
                    return "stalled".to_string();
                }
            }
        }
    }
}
