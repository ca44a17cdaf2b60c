//! Error types for arc_velocity
//!
//! Covers:
//! - master call failures (no workers, batch timeout, streaming failure, registry capacity)
//! - worker call failures (task failure, transport, remote error replies)
//! - best-effort persistence failures
//! - topology/telemetry loading and configuration errors

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Failures of the master's processing entry points and registry.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum MasterError {
    /// Registry was empty when a call arrived
    #[error("No workers available for processing")]
    NoWorkersAvailable,

    /// Historical batch did not finish within the global timeout; partial results are discarded
    #[error("Processing timeout after {timeout:?}")]
    ProcessingTimeout { timeout: Duration },

    /// The single-worker streaming call failed
    #[error("Streaming processing failed for window '{window_id}': {reason}")]
    StreamingProcessingFailed { window_id: String, reason: String },

    /// Registry is at capacity; the worker should back off and retry
    #[error("Registration rejected for worker '{worker_id}': limit of {max_workers} workers reached")]
    RegistrationRejected { worker_id: String, max_workers: usize },

    /// Failure talking to a remote master
    #[error("Master transport error: {0}")]
    Transport(String),
}

/// Failures of a single call against a worker.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum WorkerError {
    /// The task could not be computed
    #[error("Task '{task_id}' failed: {reason}")]
    TaskFailed { task_id: String, reason: String },

    /// Connection-level failure (refused, reset, closed mid-frame)
    #[error("Transport error: {0}")]
    Transport(String),

    /// Peer answered with an error reply
    #[error("Remote error ({kind}): {message}")]
    Remote { kind: String, message: String },

    /// The call exceeded its RPC timeout
    #[error("Call timed out after {0:?}")]
    Timeout(Duration),

    /// Malformed frame or message
    #[error("Codec error: {0}")]
    Codec(String),
}

impl From<std::io::Error> for WorkerError {
    fn from(err: std::io::Error) -> Self {
        WorkerError::Transport(err.to_string())
    }
}

/// Best-effort persistence failures. Logged by the worker, never propagated.
#[derive(Error, Debug)]
pub enum PersistenceError {
    #[error("Failed to write velocity row '{key}': {reason}")]
    WriteFailed { key: String, reason: String },

    #[error("Failed to serialize velocity row: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Topology and telemetry loading errors
#[derive(Error, Debug)]
pub enum LoadError {
    #[error("Required file not found: '{0}'")]
    MissingFile(PathBuf),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
}

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid value '{value}' for {key}: {reason}")]
    InvalidValue {
        key: String,
        value: String,
        reason: String,
    },

    #[error("Failed to read configuration file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse configuration file: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Result type for master operations
pub type MasterResult<T> = std::result::Result<T, MasterError>;

/// Result type for worker calls
pub type WorkerResult<T> = std::result::Result<T, WorkerError>;
