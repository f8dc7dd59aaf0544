//! Persistence layer: libSQL-backed state store.

pub mod libsql_backend;
pub mod migrations;
pub mod traits;

pub use libsql_backend::LibSqlBackend;
pub use traits::{
    AssignOutcome, AttemptFailure, CancelOutcome, Completion, Database, DeleteOutcome,
    RegisterOutcome, ReleasedJob, ReportOutcome, SubmitOutcome, WorkerUpdate,
};
