//! Test-only fakes for drivers, clocks, approvals and git repositories.

use std::collections::{HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{Result, anyhow};
use chrono::{NaiveDate, NaiveDateTime};

use crate::driver::registry::ExecutableResolver;
use crate::driver::{Driver, DriverRequest, DriverResponse};
use crate::io::approval::Approver;
use crate::io::clock::Clock;
use crate::io::qa::{TestOutcome, TestRequest, TestRunner};

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Driver that replays canned responses and records every request.
pub struct ScriptedDriver {
    name: String,
    responses: Mutex<VecDeque<DriverResponse>>,
    requests: Mutex<Vec<DriverRequest>>,
}

impl ScriptedDriver {
    /// Successful replies, one per invocation.
    pub fn new<I>(name: impl Into<String>, replies: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<String>,
    {
        Self::from_responses(
            name,
            replies.into_iter().map(DriverResponse::success).collect(),
        )
    }

    pub fn from_responses(name: impl Into<String>, responses: Vec<DriverResponse>) -> Self {
        Self {
            name: name.into(),
            responses: Mutex::new(responses.into()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn requests(&self) -> Vec<DriverRequest> {
        lock(&self.requests).clone()
    }
}

impl Driver for ScriptedDriver {
    fn name(&self) -> &str {
        &self.name
    }

    /// Errors once the script is exhausted.
    fn invoke(&self, request: &DriverRequest) -> Result<DriverResponse> {
        lock(&self.requests).push(request.clone());
        lock(&self.responses)
            .pop_front()
            .ok_or_else(|| anyhow!("{}: script exhausted", self.name))
    }
}

/// Clock that only moves when slept on.
pub struct ManualClock {
    now: Mutex<NaiveDateTime>,
    sleeps: Mutex<Vec<Duration>>,
}

impl ManualClock {
    pub fn at(year: i32, month: u32, day: u32, hour: u32, minute: u32) -> Self {
        let now = NaiveDate::from_ymd_opt(year, month, day)
            .and_then(|date| date.and_hms_opt(hour, minute, 0))
            .expect("valid test date");
        Self {
            now: Mutex::new(now),
            sleeps: Mutex::new(Vec::new()),
        }
    }

    /// Non-zero sleeps, in order.
    pub fn sleeps(&self) -> Vec<Duration> {
        lock(&self.sleeps).clone()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> NaiveDateTime {
        *lock(&self.now)
    }

    fn sleep(&self, duration: Duration) {
        if duration.is_zero() {
            return;
        }
        lock(&self.sleeps).push(duration);
        let delta = chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::zero());
        *lock(&self.now) += delta;
    }
}

/// Answers approvals from a script; `false` once it runs out.
#[derive(Default)]
pub struct ScriptedApprover {
    answers: Mutex<VecDeque<bool>>,
    prompts: Mutex<Vec<String>>,
}

impl ScriptedApprover {
    pub fn new(answers: &[bool]) -> Self {
        Self {
            answers: Mutex::new(answers.iter().copied().collect()),
            prompts: Mutex::new(Vec::new()),
        }
    }

    pub fn prompts(&self) -> Vec<String> {
        lock(&self.prompts).clone()
    }
}

impl Approver for ScriptedApprover {
    fn confirm(&self, prompt: &str) -> bool {
        lock(&self.prompts).push(prompt.to_string());
        lock(&self.answers).pop_front().unwrap_or(false)
    }
}

/// Test runner replaying outcomes; `Skipped` once it runs out.
pub struct ScriptedTestRunner {
    outcomes: Mutex<VecDeque<TestOutcome>>,
    runs: Mutex<Vec<PathBuf>>,
}

impl ScriptedTestRunner {
    pub fn new(outcomes: Vec<TestOutcome>) -> Self {
        Self {
            outcomes: Mutex::new(outcomes.into()),
            runs: Mutex::new(Vec::new()),
        }
    }

    /// Working directories of every run.
    pub fn runs(&self) -> Vec<PathBuf> {
        lock(&self.runs).clone()
    }
}

impl TestRunner for ScriptedTestRunner {
    fn run(&self, request: &TestRequest) -> Result<TestOutcome> {
        lock(&self.runs).push(request.workdir.clone());
        Ok(lock(&self.outcomes)
            .pop_front()
            .unwrap_or(TestOutcome::Skipped))
    }
}

/// Resolves only the listed commands.
pub struct FixedResolver {
    available: HashSet<String>,
}

impl FixedResolver {
    pub fn new(available: &[&str]) -> Self {
        Self {
            available: available.iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl ExecutableResolver for FixedResolver {
    fn resolve(&self, command: &str) -> Option<PathBuf> {
        self.available
            .contains(command)
            .then(|| PathBuf::from("/usr/bin").join(command))
    }
}

/// Temporary git repository with one initial commit.
pub struct TestRepo {
    dir: tempfile::TempDir,
}

impl TestRepo {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let repo = Self { dir };
        repo.git(&["init", "-q"]);
        repo.git(&["config", "user.email", "overseer@example.com"]);
        repo.git(&["config", "user.name", "Overseer Tests"]);
        repo.git(&["config", "commit.gpgsign", "false"]);
        std::fs::write(repo.path().join("README.md"), "# test repo\n").expect("write readme");
        repo.git(&["add", "-A"]);
        repo.git(&["commit", "-q", "-m", "initial"]);
        repo
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Run git in the repository, panicking on failure.
    pub fn git(&self, args: &[&str]) -> String {
        let output = Command::new("git")
            .args(args)
            .current_dir(self.path())
            .output()
            .expect("run git");
        assert!(
            output.status.success(),
            "git {args:?} failed: {}",
            String::from_utf8_lossy(&output.stderr)
        );
        String::from_utf8_lossy(&output.stdout).into_owned()
    }
}

impl Default for TestRepo {
    fn default() -> Self {
        Self::new()
    }
}
