//! Layered error taxonomy for the cron host.

use thiserror::Error;

/// Top-level error type returned from the host's public entry points.
#[derive(Error, Debug)]
pub enum HostError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("catalog error: {0}")]
    Catalog(#[from] CatalogError),

    #[error("supervisor error: {0}")]
    Supervisor(#[from] SupervisorError),

    #[error("scheduler error: {0}")]
    Scheduler(#[from] SchedulerLoopError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Errors from reading and parsing the configuration document.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid configuration value: {0}")]
    InvalidValue(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Errors encountered while validating and building a [`crate::catalog::Catalog`].
#[derive(Error, Debug)]
pub enum CatalogError {
    #[error("duplicate job id: {0}")]
    DuplicateId(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Errors from the process supervisor. Most are recovered into a failed
/// [`crate::supervisor::ExecutionEvent`] rather than propagated.
#[derive(Error, Debug)]
pub enum SupervisorError {
    #[error("failed to spawn command: {0}")]
    SpawnFailure(String),

    #[error("execution timed out")]
    Timeout,

    #[error("execution terminated by shutdown")]
    Shutdown,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Errors surfaced by the scheduler loop's own bookkeeping. Always recovered
/// internally; never returned to a caller.
#[derive(Error, Debug)]
pub enum SchedulerLoopError {
    #[error("unexpected loop failure: {0}")]
    Unexpected(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
