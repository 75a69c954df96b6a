//! Subprocess-backed driver for agent CLIs (claude, codex, gemini, ...).

use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{debug, info, instrument, warn};

use crate::core::quota::is_rate_limited;
use crate::core::sanitize::redact_args;
use crate::driver::template::{TemplateVars, has_prompt_placeholder, render_args};
use crate::driver::{Driver, DriverRequest, DriverResponse, Role};
use crate::io::clock::Clock;
use crate::io::config::{DriverConfig, RoleSettings};
use crate::io::process::run_command_with_timeout;

pub const DEFAULT_OUTPUT_LIMIT_BYTES: usize = 2_000_000;
pub const DEFAULT_RETRY_BACKOFF: f64 = 1.5;

/// Backend family, derived from the executable name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    Claude,
    Codex,
    Gemini,
    Generic,
}

impl Backend {
    pub fn from_command(command: &str) -> Self {
        let name = Path::new(command)
            .file_name()
            .map(|n| n.to_string_lossy().to_ascii_lowercase())
            .unwrap_or_default();
        if name.contains("claude") {
            Backend::Claude
        } else if name.contains("codex") {
            Backend::Codex
        } else if name.contains("gemini") {
            Backend::Gemini
        } else {
            Backend::Generic
        }
    }

    /// Apply per-family argument policy to rendered arguments.
    pub fn finalize_args(self, mut args: Vec<String>, template: &[String], prompt: &str) -> Vec<String> {
        if self == Backend::Codex
            && let Some(pos) = args.iter().position(|a| a == "exec")
            && !args.iter().any(|a| a == "--skip-git-repo-check")
        {
            args.insert(pos + 1, "--skip-git-repo-check".to_string());
        }
        if !has_prompt_placeholder(template) {
            if self == Backend::Gemini {
                args.push("-p".to_string());
            }
            args.push(prompt.to_string());
        }
        args
    }
}

/// Resolved invocation policy for one driver.
#[derive(Debug, Clone, PartialEq)]
pub struct InvocationPolicy {
    pub timeout: Duration,
    pub retries: u32,
    pub retry_backoff: f64,
}

impl InvocationPolicy {
    /// Driver values win over role values; a zero timeout means the role default.
    pub fn resolve(role: Role, block: &RoleSettings, driver: &DriverConfig) -> Self {
        let timeout = driver
            .timeout
            .or(block.timeout)
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
            .unwrap_or_else(|| role.default_timeout());
        Self {
            timeout,
            retries: driver.retries.or(block.retries).unwrap_or(0),
            retry_backoff: driver
                .retry_backoff
                .or(block.retry_backoff)
                .unwrap_or(DEFAULT_RETRY_BACKOFF),
        }
    }

    /// Delay before retry number `attempt` (1-based).
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let secs = self.retry_backoff.powi(attempt as i32);
        if secs.is_finite() && secs > 0.0 {
            Duration::from_secs_f64(secs.min(3600.0))
        } else {
            Duration::ZERO
        }
    }
}

pub struct CliDriver {
    name: String,
    backend: Backend,
    config: DriverConfig,
    policy: InvocationPolicy,
    home: Option<PathBuf>,
    clock: Arc<dyn Clock>,
}

impl CliDriver {
    pub fn new(
        name: impl Into<String>,
        config: DriverConfig,
        policy: InvocationPolicy,
        home: Option<PathBuf>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            name: name.into(),
            backend: Backend::from_command(&config.command),
            config,
            policy,
            home,
            clock,
        }
    }

    pub fn backend(&self) -> Backend {
        self.backend
    }

    pub fn policy(&self) -> &InvocationPolicy {
        &self.policy
    }

    /// Final argument vector for a request.
    pub fn build_args(&self, request: &DriverRequest) -> Vec<String> {
        let rendered = render_args(
            &self.config.args,
            TemplateVars {
                prompt: &request.prompt,
                system_prompt_file: request.system_prompt_file.as_deref(),
            },
        );
        self.backend
            .finalize_args(rendered, &self.config.args, &request.prompt)
    }

    fn command(&self, args: &[String], request: &DriverRequest) -> Command {
        let mut cmd = Command::new(&self.config.command);
        cmd.args(args)
            .current_dir(&request.workdir)
            .envs(&self.config.env);
        if let Some(home) = &self.home {
            cmd.env("HOME", home);
        }
        cmd
    }
}

impl Driver for CliDriver {
    fn name(&self) -> &str {
        &self.name
    }

    #[instrument(skip_all, fields(driver = %self.name, timeout_secs = self.policy.timeout.as_secs()))]
    fn invoke(&self, request: &DriverRequest) -> Result<DriverResponse> {
        let args = self.build_args(request);
        debug!(
            command = %self.config.command,
            args = ?redact_args(&args),
            workdir = %request.workdir.display(),
            "invoking driver"
        );
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let output = run_command_with_timeout(
                self.command(&args, request),
                None,
                self.policy.timeout,
                DEFAULT_OUTPUT_LIMIT_BYTES,
            )
            .with_context(|| format!("run driver {} ({})", self.name, self.config.command))?;

            let response = DriverResponse {
                output: if request.merge_stderr {
                    output.merged_text()
                } else {
                    output.stdout_text()
                },
                stderr: if request.merge_stderr {
                    String::new()
                } else {
                    output.stderr_text()
                },
                exit_code: output.exit_code(),
                timed_out: output.timed_out,
                attempts: attempt,
            };
            if response.is_success() {
                debug!(attempt, "driver finished");
                return Ok(response);
            }
            if is_rate_limited(&response.diagnostic_text()) {
                info!(attempt, "driver reported a rate limit, not retrying");
                return Ok(response);
            }
            if attempt > self.policy.retries {
                warn!(
                    attempt,
                    exit_code = response.exit_code,
                    timed_out = response.timed_out,
                    "driver failed, retries exhausted"
                );
                return Ok(response);
            }
            let delay = self.policy.backoff_delay(attempt);
            warn!(
                attempt,
                exit_code = response.exit_code,
                delay_ms = delay.as_millis() as u64,
                "driver failed, retrying"
            );
            self.clock.sleep(delay);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::ManualClock;
    use std::fs;

    fn sh_driver(script: &str, retries: u32, clock: Arc<ManualClock>) -> CliDriver {
        CliDriver::new(
            "sh",
            DriverConfig {
                command: "sh".to_string(),
                args: vec!["-c".to_string(), script.to_string(), "{prompt}".to_string()],
                ..DriverConfig::default()
            },
            InvocationPolicy {
                timeout: Duration::from_secs(10),
                retries,
                retry_backoff: 2.0,
            },
            None,
            clock,
        )
    }

    #[test]
    fn backend_from_command_name() {
        assert_eq!(Backend::from_command("/usr/bin/claude"), Backend::Claude);
        assert_eq!(Backend::from_command("codex"), Backend::Codex);
        assert_eq!(Backend::from_command("gemini-cli"), Backend::Gemini);
        assert_eq!(Backend::from_command("aider"), Backend::Generic);
    }

    #[test]
    fn codex_gets_skip_git_repo_check() {
        let template = vec!["exec".to_string(), "{prompt}".to_string()];
        let args = Backend::Codex.finalize_args(
            vec!["exec".to_string(), "hi".to_string()],
            &template,
            "hi",
        );
        assert_eq!(args, vec!["exec", "--skip-git-repo-check", "hi"]);
    }

    #[test]
    fn gemini_without_placeholder_gets_prompt_flag() {
        let template = vec!["--yolo".to_string()];
        let args = Backend::Gemini.finalize_args(vec!["--yolo".to_string()], &template, "hi");
        assert_eq!(args, vec!["--yolo", "-p", "hi"]);
    }

    #[test]
    fn zero_timeout_uses_role_default() {
        let block = RoleSettings {
            timeout: Some(0),
            retries: Some(2),
            ..RoleSettings::default()
        };
        let policy = InvocationPolicy::resolve(Role::Executor, &block, &DriverConfig::default());
        assert_eq!(policy.timeout, Duration::from_secs(1800));
        assert_eq!(policy.retries, 2);
        assert_eq!(policy.retry_backoff, DEFAULT_RETRY_BACKOFF);

        let driver = DriverConfig {
            timeout: Some(20),
            ..DriverConfig::default()
        };
        let policy = InvocationPolicy::resolve(Role::Planner, &block, &driver);
        assert_eq!(policy.timeout, Duration::from_secs(20));
    }

    #[test]
    fn passes_prompt_and_env() {
        let clock = Arc::new(ManualClock::at(2025, 1, 1, 8, 0));
        let mut driver = sh_driver("echo \"$GREETING $0\"", 0, clock);
        driver
            .config
            .env
            .insert("GREETING".to_string(), "hello".to_string());
        let temp = tempfile::tempdir().expect("tempdir");
        let response = driver
            .invoke(&DriverRequest::new("world", temp.path()))
            .expect("invoke");
        assert_eq!(response.output, "hello world\n");
        assert_eq!(response.attempts, 1);
    }

    /// Verifies failures retry with exponential backoff through the clock.
    #[test]
    fn retries_with_backoff_then_returns_last_attempt() {
        let clock = Arc::new(ManualClock::at(2025, 1, 1, 8, 0));
        let driver = sh_driver("echo nope >&2; exit 3", 2, Arc::clone(&clock));
        let temp = tempfile::tempdir().expect("tempdir");
        let response = driver
            .invoke(&DriverRequest::new("x", temp.path()))
            .expect("invoke");
        assert_eq!(response.exit_code, 3);
        assert_eq!(response.attempts, 3);
        assert_eq!(response.stderr, "nope\n");
        assert_eq!(
            clock.sleeps(),
            vec![Duration::from_secs(2), Duration::from_secs(4)]
        );
    }

    #[test]
    fn rate_limited_failure_is_not_retried() {
        let clock = Arc::new(ManualClock::at(2025, 1, 1, 8, 0));
        let driver = sh_driver("echo 'usage limit reached, resets at 9am'; exit 1", 5, Arc::clone(&clock));
        let temp = tempfile::tempdir().expect("tempdir");
        let response = driver
            .invoke(&DriverRequest::new("x", temp.path()))
            .expect("invoke");
        assert_eq!(response.attempts, 1);
        assert!(clock.sleeps().is_empty());
    }

    #[test]
    fn home_override_sets_home() {
        let clock = Arc::new(ManualClock::at(2025, 1, 1, 8, 0));
        let temp = tempfile::tempdir().expect("tempdir");
        let home = temp.path().join("home");
        fs::create_dir(&home).expect("mkdir");
        let driver = CliDriver::new(
            "sh",
            DriverConfig::new("sh", &["-c", "printf %s \"$HOME\"", "{prompt}"]),
            InvocationPolicy {
                timeout: Duration::from_secs(10),
                retries: 0,
                retry_backoff: 1.5,
            },
            Some(home.clone()),
            clock,
        );
        let response = driver
            .invoke(&DriverRequest::new("x", temp.path()))
            .expect("invoke");
        assert_eq!(response.output, home.display().to_string());
    }
}
