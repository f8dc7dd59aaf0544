//! Worker channel: how assignments and cancellations reach external workers.
//!
//! Workers registered with an endpoint get pushed JSON over HTTP. Workers
//! without one poll `GET /api/workers/{id}/assignment` instead, so dispatch to
//! them is a no-op here.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::DispatchError;
use crate::model::{Job, Worker};

/// Per-request timeout for webhook deliveries.
const WEBHOOK_TIMEOUT: Duration = Duration::from_secs(10);

/// Payload delivered to a worker when it is handed a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Assignment {
    pub job_id: String,
    pub worker_id: String,
    pub attempt: u32,
    pub task: serde_json::Value,
}

impl Assignment {
    pub fn new(job: &Job, worker: &Worker, attempt: u32) -> Self {
        Self {
            job_id: job.id.clone(),
            worker_id: worker.id.clone(),
            attempt,
            task: job.task.clone(),
        }
    }
}

#[derive(Debug, Serialize)]
struct Cancellation<'a> {
    job_id: &'a str,
}

/// Execution side of the orchestrator. Called outside any store transaction.
#[async_trait]
pub trait WorkerChannel: Send + Sync {
    /// Deliver an assignment to `worker`.
    async fn dispatch(&self, worker: &Worker, assignment: &Assignment)
    -> Result<(), DispatchError>;

    /// Tell `worker` to stop executing `job_id`.
    async fn cancel(&self, worker: &Worker, job_id: &str) -> Result<(), DispatchError>;
}

/// Pushes JSON to `{endpoint}/assignments` and `{endpoint}/cancellations`.
pub struct WebhookChannel {
    client: reqwest::Client,
}

impl WebhookChannel {
    pub fn new() -> Result<Self, DispatchError> {
        Self::with_timeout(WEBHOOK_TIMEOUT)
    }

    /// Every delivery gives up after `timeout`.
    pub fn with_timeout(timeout: Duration) -> Result<Self, DispatchError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| DispatchError::Client(e.to_string()))?;
        Ok(Self { client })
    }

    async fn post<T: Serialize + Sync>(
        &self,
        worker: &Worker,
        endpoint: &str,
        path: &str,
        body: &T,
    ) -> Result<(), DispatchError> {
        let url = format!("{}/{path}", endpoint.trim_end_matches('/'));
        let response = self
            .client
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(|e| DispatchError::Unreachable {
                worker_id: worker.id.clone(),
                reason: e.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(DispatchError::Rejected {
                worker_id: worker.id.clone(),
                status: status.as_u16(),
            });
        }
        debug!(worker_id = %worker.id, %url, "Webhook delivered");
        Ok(())
    }
}

#[async_trait]
impl WorkerChannel for WebhookChannel {
    async fn dispatch(
        &self,
        worker: &Worker,
        assignment: &Assignment,
    ) -> Result<(), DispatchError> {
        match worker.endpoint.as_deref() {
            Some(endpoint) => self.post(worker, endpoint, "assignments", assignment).await,
            None => Ok(()),
        }
    }

    async fn cancel(&self, worker: &Worker, job_id: &str) -> Result<(), DispatchError> {
        match worker.endpoint.as_deref() {
            Some(endpoint) => {
                self.post(worker, endpoint, "cancellations", &Cancellation { job_id })
                    .await
            }
            None => Ok(()),
        }
    }
}

/// Channel that delivers nothing; every worker is pull-only.
pub struct NullChannel;

#[async_trait]
impl WorkerChannel for NullChannel {
    async fn dispatch(&self, _: &Worker, _: &Assignment) -> Result<(), DispatchError> {
        Ok(())
    }

    async fn cancel(&self, _: &Worker, _: &str) -> Result<(), DispatchError> {
        Ok(())
    }
}
