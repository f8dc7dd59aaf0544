//! Assist Orchestrator: job/worker orchestration core.

pub mod api;
pub mod config;
pub mod error;
pub mod model;
pub mod orchestrator;
pub mod store;
