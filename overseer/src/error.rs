//! Typed failure classes for the orchestrator.
//!
//! Functions return `anyhow::Result`; callers that branch on the failure class
//! recover the variant with `err.downcast_ref::<OverseerError>()`.

use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum OverseerError {
    /// Malformed mission or settings. Fatal before any task runs.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// No configured driver for a role resolves to an executable.
    #[error("no driver available for {role} (tried: {tried})")]
    DriverUnavailable { role: String, tried: String },

    /// Driver exited non-zero or timed out after exhausting retries.
    #[error("driver {driver} failed after {attempts} attempt(s): {message}")]
    DriverExecution {
        driver: String,
        attempts: u32,
        message: String,
    },

    /// Agent output carried a rate-limit signature.
    #[error("rate limited, waiting {wait:?}")]
    RateLimited { wait: Duration },

    /// Self-check or critic refused a completion claim too many times.
    #[error("quality gate failed: {0}")]
    QualityGate(String),

    /// The planner signalled an explicit failure or the task hit a loop limit.
    #[error("task {task_id} failed: {reason}")]
    TaskFailure { task_id: String, reason: String },

    /// The user interrupted the run.
    #[error("run interrupted")]
    Interrupted,

    /// The mission lock could not be acquired in time.
    #[error("timed out after {waited:?} waiting for lock {path}")]
    LockTimeout { path: String, waited: Duration },
}

/// True when the error chain carries [`OverseerError::Interrupted`].
pub fn is_interrupted(err: &anyhow::Error) -> bool {
    matches!(
        err.downcast_ref::<OverseerError>(),
        Some(OverseerError::Interrupted)
    )
}
