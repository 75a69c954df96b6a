//! QA test command adapter.

use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use anyhow::{Result, anyhow};
use tracing::{info, instrument};

use crate::core::sanitize::strip_ansi;
use crate::io::process::run_command_with_timeout;

pub const DEFAULT_OUTPUT_LIMIT_BYTES: usize = 1_000_000;

#[derive(Debug, Clone)]
pub struct TestRequest {
    pub workdir: PathBuf,
    /// Configured command; empty means auto-detect.
    pub command: String,
    pub timeout: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TestOutcome {
    /// Nothing to run.
    Skipped,
    Passed { output: String },
    Failed { exit_code: i32, output: String },
}

impl TestOutcome {
    pub fn is_failure(&self) -> bool {
        matches!(self, TestOutcome::Failed { .. })
    }
}

pub trait TestRunner: Send + Sync {
    fn run(&self, request: &TestRequest) -> Result<TestOutcome>;
}

/// Runs the configured test command as a subprocess.
pub struct CommandTestRunner;

impl TestRunner for CommandTestRunner {
    #[instrument(skip_all, fields(workdir = %request.workdir.display()))]
    fn run(&self, request: &TestRequest) -> Result<TestOutcome> {
        let Some(argv) = resolve_test_command(&request.command, &request.workdir)? else {
            return Ok(TestOutcome::Skipped);
        };
        info!(command = %argv.join(" "), "running tests");
        let mut cmd = Command::new(&argv[0]);
        cmd.args(&argv[1..]).current_dir(&request.workdir);
        let output = match run_command_with_timeout(
            cmd,
            None,
            request.timeout,
            DEFAULT_OUTPUT_LIMIT_BYTES,
        ) {
            Ok(output) => output,
            Err(err) => {
                return Ok(TestOutcome::Failed {
                    exit_code: -1,
                    output: format!("{err:#}"),
                });
            }
        };
        let text = strip_ansi(&output.merged_text());
        if output.success() {
            Ok(TestOutcome::Passed { output: text })
        } else {
            Ok(TestOutcome::Failed {
                exit_code: output.exit_code(),
                output: text,
            })
        }
    }
}

/// Split the configured command, falling back to `pytest` when a `tests/` dir exists.
pub fn resolve_test_command(command: &str, workdir: &Path) -> Result<Option<Vec<String>>> {
    if command.trim().is_empty() {
        if workdir.join("tests").is_dir() {
            return Ok(Some(vec!["pytest".to_string()]));
        }
        return Ok(None);
    }
    let argv = shell_words::split(command)
        .map_err(|err| anyhow!("invalid qa.test_command '{command}': {err}"))?;
    Ok((!argv.is_empty()).then_some(argv))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn request(dir: &Path, command: &str) -> TestRequest {
        TestRequest {
            workdir: dir.to_path_buf(),
            command: command.to_string(),
            timeout: Duration::from_secs(10),
        }
    }

    #[test]
    fn empty_command_detects_tests_dir() {
        let temp = tempfile::tempdir().expect("tempdir");
        assert_eq!(resolve_test_command("", temp.path()).expect("resolve"), None);
        fs::create_dir(temp.path().join("tests")).expect("mkdir");
        assert_eq!(
            resolve_test_command("  ", temp.path()).expect("resolve"),
            Some(vec!["pytest".to_string()])
        );
        assert_eq!(
            resolve_test_command("cargo test --quiet", temp.path()).expect("resolve"),
            Some(vec!["cargo".into(), "test".into(), "--quiet".into()])
        );
    }

    #[test]
    fn reports_pass_and_failure() {
        let temp = tempfile::tempdir().expect("tempdir");
        let passed = CommandTestRunner
            .run(&request(temp.path(), "sh -c 'echo ok'"))
            .expect("run");
        assert_eq!(
            passed,
            TestOutcome::Passed {
                output: "ok\n".to_string()
            }
        );

        let failed = CommandTestRunner
            .run(&request(temp.path(), "sh -c 'echo boom >&2; exit 3'"))
            .expect("run");
        assert_eq!(
            failed,
            TestOutcome::Failed {
                exit_code: 3,
                output: "boom\n".to_string()
            }
        );
        assert!(failed.is_failure());
    }
}
