//! The worker surface the master dispatches to, and the in-process implementation.
//!
//! [`Worker`] is the seam between the master and its workers: [`VelocityWorker`] computes in
//! this process, [`crate::rpc::RemoteWorker`] forwards each call to a worker across the network.

pub mod velocity_worker;

use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;

use crate::catalog::ArcCatalog;
use crate::error::WorkerResult;
use crate::model::{ProcessingTask, StreamingWindow, VelocityResult};

pub use velocity_worker::VelocityWorker;

#[async_trait]
pub trait Worker: Send + Sync {
    /// Computes one partition of a historical batch.
    async fn process_task(&self, task: ProcessingTask) -> WorkerResult<VelocityResult>;

    /// Computes a whole streaming window against `catalog`.
    async fn process_streaming_window(
        &self,
        window: StreamingWindow,
        catalog: Arc<ArcCatalog>,
    ) -> WorkerResult<VelocityResult>;

    /// Liveness probe used by the health monitor.
    async fn is_alive(&self) -> WorkerResult<bool>;

    /// Human-readable status line.
    async fn system_status(&self) -> WorkerResult<String>;
}

/// Lifecycle of a task at a worker. There are no retries inside the worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Received,
    Computing,
    Succeeded,
    Failed,
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TaskState::Received => "received",
            TaskState::Computing => "computing",
            TaskState::Succeeded => "succeeded",
            TaskState::Failed => "failed",
        };
        f.write_str(name)
    }
}
