//! Error types for the orchestrator.

use std::time::Duration;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Orchestrator error: {0}")]
    Orchestrator(#[from] OrchestratorError),

    #[error("Dispatch error: {0}")]
    Dispatch(#[from] DispatchError),

    #[error("Supervisor error: {0}")]
    Supervisor(#[from] SupervisorError),
}

/// Configuration-related errors. Fatal at startup.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error(
        "Worker timeout ({timeout:?}) must be strictly greater than the heartbeat interval ({interval:?})"
    )]
    TimeoutNotAboveInterval { timeout: Duration, interval: Duration },
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Transaction failed: {0}")]
    Transaction(String),

    #[error("Constraint violation: {0}")]
    Constraint(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Errors surfaced by the submission and worker report interfaces.
#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("Idempotency key {key} already used but its job cannot be located")]
    DuplicateSubmission { key: String },

    #[error("Job {id} not found")]
    JobNotFound { id: String },

    #[error("Worker {id} not found")]
    WorkerNotFound { id: String },

    #[error("Worker {id} was terminated and cannot be reused")]
    WorkerTerminated { id: String },

    #[error("Maximum number of workers ({max}) reached")]
    WorkerLimitReached { max: usize },

    #[error("Worker {id} is {from}, cannot transition to {to}")]
    InvalidWorkerTransition { id: String, from: String, to: String },

    #[error("Job {job_id} can only be purged once terminal (currently {status})")]
    JobNotTerminal { job_id: String, status: String },

    #[error("Stale report from worker {worker_id} for job {job_id}")]
    StaleReport { worker_id: String, job_id: String },

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error(transparent)]
    Database(#[from] DatabaseError),
}

/// Failures talking to a worker's execution channel.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("Worker {worker_id} unreachable: {reason}")]
    Unreachable { worker_id: String, reason: String },

    #[error("Worker {worker_id} rejected dispatch with HTTP {status}")]
    Rejected { worker_id: String, status: u16 },

    #[error("Webhook client could not be built: {0}")]
    Client(String),
}

/// Supervisor failures that require operator attention.
#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("Heartbeat monitor failed {restarts} times, giving up")]
    MonitorEscalation { restarts: u32 },
}

/// Result type alias for the orchestrator.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    fn escalate(restarts: u32) -> Result<()> {
        Err(SupervisorError::MonitorEscalation { restarts }.into())
    }

    #[test]
    fn component_errors_lift_into_top_level() {
        let err = escalate(3).unwrap_err();
        assert!(matches!(
            err,
            Error::Supervisor(SupervisorError::MonitorEscalation { restarts: 3 })
        ));
        assert_eq!(
            err.to_string(),
            "Supervisor error: Heartbeat monitor failed 3 times, giving up"
        );

        let err: Error = OrchestratorError::JobNotFound { id: "j1".into() }.into();
        assert!(err.to_string().starts_with("Orchestrator error: "));
    }
}
