//! Agent CLI drivers.
//!
//! The [`Driver`] trait decouples the orchestrator from the agent backend.
//! Production drivers spawn CLIs ([`cli::CliDriver`]); tests use scripted
//! drivers that return predetermined outputs without spawning processes.

pub mod cli;
pub mod home;
pub mod registry;
pub mod template;

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;

use crate::core::compression::take_last_chars;
use crate::error::OverseerError;

/// Which seat a driver fills.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Planner,
    Critic,
    Executor,
}

impl Role {
    /// Settings key for the role block.
    pub fn key(self) -> &'static str {
        match self {
            Role::Planner => "brain",
            Role::Critic => "critic",
            Role::Executor => "body",
        }
    }

    /// Timeout used when neither driver nor role sets one (or sets 0).
    pub fn default_timeout(self) -> Duration {
        match self {
            Role::Planner | Role::Critic => Duration::from_secs(300),
            Role::Executor => Duration::from_secs(1800),
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

/// One invocation of an agent CLI.
#[derive(Debug, Clone)]
pub struct DriverRequest {
    pub prompt: String,
    pub workdir: PathBuf,
    pub system_prompt_file: Option<PathBuf>,
    /// Append stderr to the output (executor) instead of keeping it aside.
    pub merge_stderr: bool,
}

impl DriverRequest {
    pub fn new(prompt: impl Into<String>, workdir: impl Into<PathBuf>) -> Self {
        Self {
            prompt: prompt.into(),
            workdir: workdir.into(),
            system_prompt_file: None,
            merge_stderr: false,
        }
    }
}

/// Result of the last attempt of an invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriverResponse {
    pub output: String,
    /// Kept separately when stderr is not merged; used for diagnostics.
    pub stderr: String,
    pub exit_code: i32,
    pub timed_out: bool,
    pub attempts: u32,
}

impl DriverResponse {
    pub fn success(output: impl Into<String>) -> Self {
        Self {
            output: output.into(),
            stderr: String::new(),
            exit_code: 0,
            timed_out: false,
            attempts: 1,
        }
    }

    pub fn is_success(&self) -> bool {
        self.exit_code == 0 && !self.timed_out
    }

    /// Text to inspect for rate-limit signatures.
    pub fn diagnostic_text(&self) -> String {
        if self.stderr.trim().is_empty() {
            return self.output.clone();
        }
        format!("{}\n{}", self.output, self.stderr)
    }

    /// Turn a failed final attempt into [`OverseerError::DriverExecution`].
    pub fn into_result(self, driver: &str) -> Result<DriverResponse> {
        if self.is_success() {
            return Ok(self);
        }
        let detail = if self.stderr.trim().is_empty() {
            self.output.trim().to_string()
        } else {
            self.stderr.trim().to_string()
        };
        let status = if self.timed_out {
            "timed out".to_string()
        } else {
            format!("exit {}", self.exit_code)
        };
        Err(OverseerError::DriverExecution {
            driver: driver.to_string(),
            attempts: self.attempts,
            message: format!("{status}: {}", take_last_chars(&detail, 500)),
        }
        .into())
    }
}

pub trait Driver: Send + Sync {
    /// Configured driver name, used in logs.
    fn name(&self) -> &str;

    /// Run the agent. Non-zero exits are retried internally; the final
    /// attempt is returned as-is. Errors mean the process could not run.
    fn invoke(&self, request: &DriverRequest) -> Result<DriverResponse>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failed_response_becomes_typed_error() {
        let response = DriverResponse {
            output: String::new(),
            stderr: "auth expired\n".to_string(),
            exit_code: 2,
            timed_out: false,
            attempts: 3,
        };
        let err = response.into_result("codex").unwrap_err();
        match err.downcast_ref::<OverseerError>() {
            Some(OverseerError::DriverExecution {
                driver,
                attempts,
                message,
            }) => {
                assert_eq!(driver, "codex");
                assert_eq!(*attempts, 3);
                assert_eq!(message, "exit 2: auth expired");
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn role_defaults() {
        assert_eq!(Role::Planner.key(), "brain");
        assert_eq!(Role::Executor.default_timeout(), Duration::from_secs(1800));
        assert_eq!(Role::Critic.default_timeout(), Duration::from_secs(300));
    }
}
