//! Orchestration core: submission, scheduling, liveness and retries.

pub mod channel;
pub mod events;
pub mod idempotency;
pub mod retry;
pub mod scheduler;
pub mod service;
pub mod supervisor;

pub use channel::{Assignment, NullChannel, WebhookChannel, WorkerChannel};
pub use events::{EventBus, OrchestratorEvent};
pub use idempotency::IdempotencyGuard;
pub use retry::{RetryController, RetryDecision, RetryPolicy};
pub use scheduler::Scheduler;
pub use service::{BackgroundTasks, Orchestrator, SubmitReceipt, WorkerRegistration};
pub use supervisor::HeartbeatSupervisor;
