//! Error types for Orchestral.

use std::path::PathBuf;

/// Main error type for Orchestral.
///
/// All core operations return `Result<T> = std::result::Result<T, OrchestralError>`.
#[derive(thiserror::Error, Debug)]
pub enum OrchestralError {
    /// Caller-supplied input failed validation.
    #[error("Validation error: {0}")]
    Validation(String),

    /// No state document exists for the run.
    #[error("Run state not found")]
    StateNotFound,

    /// The state document could not be loaded.
    #[error("Failed to load run state: {0}")]
    StateLoad(String),

    /// The state document could not be saved.
    #[error("Failed to save run state: {0}")]
    StateSave(String),

    /// A computed path failed validation.
    #[error("Path validation failed: {0}")]
    PathValidation(String),

    /// A computed path escapes the runs root.
    #[error("Path escapes runs root: {0:?}")]
    PathTraversal(PathBuf),

    /// A worker reported an error through its error flag.
    #[error("Worker error from {agent}: {message}")]
    Worker {
        /// Agent slot that produced the flag
        agent: String,
        /// Human-readable message from the flag
        message: String,
    },

    /// The filesystem event source failed.
    #[error("Watch error: {0}")]
    Watch(String),

    /// Merge-Readiness Pack assembly failed.
    #[error("MRP assembly failed: {0}")]
    Assembly(String),

    /// A run is already active in this workspace.
    #[error("A run is already active in this workspace")]
    Busy,

    /// The requested run does not exist.
    #[error("Run not found: {0}")]
    RunNotFound(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Error surfaced by a collaborator (runner, prompt generator,
    /// model selector).
    #[error("Collaborator error: {0}")]
    External(#[from] anyhow::Error),
}

/// Type alias for Result with OrchestralError.
pub type Result<T> = std::result::Result<T, OrchestralError>;
