//! Worker record and state machine.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// State of a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    /// Eligible for assignment.
    Idle,
    /// Executing exactly one job.
    Busy,
    /// Timed out or crashed; needs recovery before reuse.
    Failed,
    /// Decommissioned. Terminal.
    Terminated,
}

impl WorkerStatus {
    /// Check if this state allows transitioning to another state.
    pub fn can_transition_to(&self, target: WorkerStatus) -> bool {
        use WorkerStatus::*;

        matches!(
            (self, target),
            (Idle, Busy) | (Idle, Terminated) |
            (Busy, Idle) | (Busy, Failed) |
            (Failed, Idle) | (Failed, Terminated)
        )
    }

    /// Check if this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Terminated)
    }

    /// The string stored in the DB status column.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Busy => "busy",
            Self::Failed => "failed",
            Self::Terminated => "terminated",
        }
    }
}

impl std::fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WorkerStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "idle" => Ok(Self::Idle),
            "busy" => Ok(Self::Busy),
            "failed" => Ok(Self::Failed),
            "terminated" => Ok(Self::Terminated),
            other => Err(format!("unknown worker status: {other}")),
        }
    }
}

/// A registered worker.
///
/// The core never owns the worker's process; it only tracks liveness and the
/// job the worker currently holds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Worker {
    /// Externally assigned, unique.
    pub id: String,
    pub status: WorkerStatus,
    /// Set iff `status` is `Busy`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_job_id: Option<String>,
    /// Base URL for push dispatch. Pull-only workers leave this unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    /// Why the worker was last declared failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    pub last_heartbeat_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Worker {
    /// A freshly registered, idle worker.
    pub fn new(id: impl Into<String>, endpoint: Option<String>, now: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            status: WorkerStatus::Idle,
            current_job_id: None,
            endpoint,
            failure_reason: None,
            last_heartbeat_at: now,
            created_at: now,
            updated_at: now,
        }
    }

    /// Whether the heartbeat is older than `timeout` at `now`.
    pub fn is_silent_since(&self, now: DateTime<Utc>, timeout: std::time::Duration) -> bool {
        let silence = now.signed_duration_since(self.last_heartbeat_at);
        silence.to_std().map(|s| s > timeout).unwrap_or(false)
    }
}
