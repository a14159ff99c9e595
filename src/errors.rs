//! Typed error hierarchy for the deploy controller.
//!
//! Three top-level enums cover the three subsystems:
//! - `StoreError` — datastore failures (row-not-found, unique violations)
//! - `EngineError` — container engine and workspace failures
//! - `DeployError` — orchestrator lifecycle failures

use thiserror::Error;

/// Errors from the datastore.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("record not found")]
    NotFound,

    #[error("email already registered")]
    DuplicateEmail,

    #[error("integrity violation: {0}")]
    Integrity(String),

    #[error("database lock poisoned")]
    LockPoisoned,

    #[error("database task panicked")]
    Join,

    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("database error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors from the container engine adapter.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("git clone failed: {stderr}")]
    Clone { stderr: String },

    #[error("image build failed: {message}")]
    Build { message: String },

    #[error("container engine error: {0}")]
    Engine(String),

    #[error("container engine error: {0}")]
    Docker(#[from] bollard::errors::Error),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors from the deploy orchestrator.
#[derive(Debug, Error)]
pub enum DeployError {
    #[error("pod not found")]
    PodNotFound,

    #[error("pod has no repo URL configured")]
    MissingRepoUrl,

    #[error("another operation is already in progress for this pod")]
    Busy,

    #[error("pod has no running container")]
    NotRunning,

    #[error("failed to load git credentials: {0}")]
    Credential(#[source] StoreError),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error(transparent)]
    Store(StoreError),
}

impl From<StoreError> for DeployError {
    /// A missing pod row is the orchestrator's own not-found; everything
    /// else passes through.
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound => DeployError::PodNotFound,
            other => DeployError::Store(other),
        }
    }
}
