//! Resource allocations and idempotency keys.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Why an allocation was released.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReleaseReason {
    /// The worker reported success.
    Completed,
    /// The worker reported the attempt failed.
    Failed,
    /// The worker stopped heartbeating.
    WorkerTimeout,
    /// The worker was decommissioned mid-job.
    WorkerTerminated,
    /// A caller cancelled the job.
    Cancelled,
}

impl ReleaseReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::WorkerTimeout => "worker_timeout",
            Self::WorkerTerminated => "worker_terminated",
            Self::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for ReleaseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ReleaseReason {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "worker_timeout" => Ok(Self::WorkerTimeout),
            "worker_terminated" => Ok(Self::WorkerTerminated),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(format!("unknown release reason: {other}")),
        }
    }
}

/// One worker's ownership of one job for one execution attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceAllocation {
    pub id: String,
    pub job_id: String,
    pub worker_id: String,
    /// The job's retry count when this attempt started.
    pub attempt: u32,
    pub allocated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub released_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub release_reason: Option<ReleaseReason>,
}

impl ResourceAllocation {
    pub fn new(
        job_id: impl Into<String>,
        worker_id: impl Into<String>,
        attempt: u32,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            job_id: job_id.into(),
            worker_id: worker_id.into(),
            attempt,
            allocated_at: now,
            released_at: None,
            release_reason: None,
        }
    }

    /// Still owned by its worker.
    pub fn is_active(&self) -> bool {
        self.released_at.is_none()
    }
}

/// A caller-supplied submission token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdempotencyKey {
    pub key: String,
    /// The job created under this key. `None` once that job has been purged.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_allocation_is_active() {
        let alloc = ResourceAllocation::new("j1", "w1", 0, Utc::now());
        assert!(alloc.is_active());
        assert!(alloc.release_reason.is_none());
    }

    #[test]
    fn release_reason_strings() {
        assert_eq!(ReleaseReason::WorkerTimeout.to_string(), "worker_timeout");
        assert_eq!(
            "worker_terminated".parse::<ReleaseReason>().unwrap(),
            ReleaseReason::WorkerTerminated
        );
        assert!("exploded".parse::<ReleaseReason>().is_err());
    }
}
