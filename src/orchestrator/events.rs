//! State-change events and scheduler wake-ups.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{Notify, broadcast};

/// Default broadcast channel capacity.
const DEFAULT_BROADCAST_CAPACITY: usize = 256;

/// Something observable happened to a job or worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OrchestratorEvent {
    JobSubmitted {
        job_id: String,
        idempotency_key: String,
    },
    JobAssigned {
        job_id: String,
        worker_id: String,
        attempt: u32,
    },
    JobCompleted {
        job_id: String,
        worker_id: String,
    },
    JobRequeued {
        job_id: String,
        retry_count: u32,
        available_at: DateTime<Utc>,
    },
    JobFailed {
        job_id: String,
        reason: String,
    },
    JobCancelled {
        job_id: String,
    },
    WorkerRegistered {
        worker_id: String,
    },
    WorkerFailed {
        worker_id: String,
        reason: String,
    },
    WorkerRecovered {
        worker_id: String,
    },
    WorkerTerminated {
        worker_id: String,
    },
}

/// Fan-out of events to subscribers plus a wake signal for the scheduler loop.
pub struct EventBus {
    tx: broadcast::Sender<OrchestratorEvent>,
    scheduler_wake: Notify,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(DEFAULT_BROADCAST_CAPACITY);
        Self {
            tx,
            scheduler_wake: Notify::new(),
        }
    }

    /// Subscribe to events. Each WebSocket client calls this.
    pub fn subscribe(&self) -> broadcast::Receiver<OrchestratorEvent> {
        self.tx.subscribe()
    }

    /// Publish an event. Wakes the scheduler when new work or capacity appeared.
    pub fn publish(&self, event: OrchestratorEvent) {
        if matches!(
            event,
            OrchestratorEvent::JobSubmitted { .. }
                | OrchestratorEvent::JobCompleted { .. }
                | OrchestratorEvent::JobCancelled { .. }
                | OrchestratorEvent::WorkerRegistered { .. }
                | OrchestratorEvent::WorkerRecovered { .. }
        ) {
            self.wake_scheduler();
        }
        // ok if nobody is listening
        let _ = self.tx.send(event);
    }

    /// Ask the scheduler to run a tick soon.
    pub fn wake_scheduler(&self) {
        self.scheduler_wake.notify_one();
    }

    /// Resolves the next time someone calls [`EventBus::wake_scheduler`].
    pub async fn scheduler_woken(&self) {
        self.scheduler_wake.notified().await;
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
