//! Domain records: workers, jobs, allocations and idempotency keys.

pub mod allocation;
pub mod job;
pub mod worker;

pub use allocation::{IdempotencyKey, ReleaseReason, ResourceAllocation};
pub use job::{Job, JobStatus};
pub use worker::{Worker, WorkerStatus};
