//! End-to-end mission runs with scripted agents.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use overseer::core::types::TaskStatus;
use overseer::driver::Driver;
use overseer::io::approval::AutoApprover;
use overseer::io::clock::ShutdownFlag;
use overseer::io::lock::LockOptions;
use overseer::io::mission::MissionStore;
use overseer::io::reflexion::{ReflexionLedger, ReflexionStatus};
use overseer::io::run_state::{RunState, write_run_state};
use overseer::mission_run::{RunOptions, run_mission};
use overseer::task_loop::{Agents, Services};
use overseer::test_support::{ManualClock, ScriptedDriver, ScriptedTestRunner, TestRepo};

const START_REPORT: &str = "Read the task and looked around the repository; ready for instructions.";

const SETTINGS: &str = "\
safety:
  create_backup_branch: true
  auto_rollback_on_failure: true
orchestrator:
  turn_pause_ms: 0
critic:
  enabled: false
";

struct Harness {
    repo: TestRepo,
    logs: tempfile::TempDir,
    planner: Arc<ScriptedDriver>,
    executor: Arc<ScriptedDriver>,
    shutdown: ShutdownFlag,
}

impl Harness {
    fn new(mission: &str, planner: &[&str], executor: &[&str]) -> Self {
        let repo = TestRepo::new();
        fs::write(repo.path().join("mission.yaml"), mission).expect("write mission");
        fs::write(repo.path().join("settings.yaml"), SETTINGS).expect("write settings");
        Self {
            repo,
            logs: tempfile::tempdir().expect("tempdir"),
            planner: Arc::new(ScriptedDriver::new("brain", planner.iter().copied())),
            executor: Arc::new(ScriptedDriver::new("body", executor.iter().copied())),
            shutdown: ShutdownFlag::new(),
        }
    }

    fn mission_path(&self) -> PathBuf {
        self.repo.path().join("mission.yaml")
    }

    fn options(&self) -> RunOptions {
        RunOptions {
            mission_path: self.mission_path(),
            settings_path: self.repo.path().join("settings.yaml"),
            log_dir: Some(self.logs.path().to_path_buf()),
            ..RunOptions::default()
        }
    }

    fn run(&self) -> overseer::mission_run::MissionOutcome {
        let agents = Agents {
            planner: self.planner.clone() as Arc<dyn Driver>,
            executor: self.executor.clone() as Arc<dyn Driver>,
            critics: Vec::new(),
        };
        let services = Services {
            clock: Arc::new(ManualClock::at(2025, 1, 1, 8, 0)),
            actions: Arc::new(AutoApprover(false)),
            plans: Arc::new(AutoApprover(true)),
            tests: Arc::new(ScriptedTestRunner::new(Vec::new())),
            shutdown: self.shutdown.clone(),
            global_memory_dir: None,
        };
        run_mission(&self.options(), &agents, services).expect("run mission")
    }

    fn store(&self) -> MissionStore {
        MissionStore::new(self.mission_path(), LockOptions::default())
    }

    fn overseer_file(&self, name: &str) -> PathBuf {
        self.repo.path().join(".overseer").join(name)
    }
}

fn mission(tasks: &str) -> String {
    format!("project:\n  name: demo\n  project_root: .\nmission:\n  name: lifecycle\ntasks:\n{tasks}")
}

fn read(path: &Path) -> String {
    fs::read_to_string(path).unwrap_or_else(|err| panic!("read {}: {err}", path.display()))
}

/// Verifies the two-task scenario: a bare completion claim is re-prompted,
/// a repeated identical `ls` completes the first task, and an explicit
/// planner failure blocks the second without stopping the mission.
#[test]
fn sequential_mission_completes_and_blocks() {
    let harness = Harness::new(
        &mission(
            "  - id: t1\n    title: Summarize the component files\n  - id: t2\n    title: Deploy the service\n",
        ),
        &[
            "MISSION_COMPLETED",
            "ls",
            "ls",
            "MISSION_FAILED: missing access token",
            "- verify with a command before claiming completion",
        ],
        &[START_REPORT, START_REPORT],
    );

    let outcome = harness.run();

    assert_eq!(outcome.exit_code(), 0);
    assert!(!outcome.interrupted);
    let statuses: Vec<(&str, &str)> = outcome
        .summary
        .tasks
        .iter()
        .map(|t| (t.task.as_str(), t.status.as_str()))
        .collect();
    assert_eq!(statuses, vec![("t1", "done"), ("t2", "blocked")]);
    assert_eq!(harness.planner.requests().len(), 5);
    assert_eq!(outcome.summary.totals.self_check_failures, 1);
    assert_eq!(outcome.summary.totals.local_checks, 2);

    let mission = harness.store().load().expect("reload mission");
    let t1 = mission.task("t1").expect("t1");
    assert_eq!(t1.status, TaskStatus::Done);
    assert_eq!(t1.summary_path.as_deref(), Some(".overseer/transcripts/t1.md"));
    assert_eq!(t1.notes, "completed (repeated observation claim verified)");
    let t2 = mission.task("t2").expect("t2");
    assert_eq!(t2.status, TaskStatus::Blocked);
    assert_eq!(t2.notes, "blocked: missing access token");

    let transcript = read(&harness.overseer_file("transcripts/t1.md"));
    assert!(transcript.contains("SELF-CHECK FAILED. Missing: assumptions_verified"));
    assert!(read(&harness.overseer_file("memories.md")).contains("verify with a command"));
    assert!(!harness.overseer_file("state.json").exists());

    let ledger = ReflexionLedger::new(harness.overseer_file("reflexion.jsonl"), 0.7, 10);
    let entries = ledger.entries().expect("ledger");
    assert!(entries
        .iter()
        .any(|e| e.status == ReflexionStatus::Pending && e.root_cause == "missing access token"));

    let branches = harness.repo.git(&["branch", "--list", "overseer-backup-*"]);
    assert!(!branches.trim().is_empty());
    let summary_path = outcome.summary_path.expect("summary path");
    assert!(summary_path.starts_with(harness.logs.path()));
    assert!(read(&summary_path).contains("\"status\": \"blocked\""));
}

/// Verifies resume skips done tasks and ids in the run state, and picks up
/// the interrupted task.
#[test]
fn resume_runs_only_unfinished_tasks() {
    let harness = Harness::new(
        &mission(
            "  - id: t1\n    title: Create hello.txt\n    status: done\n  - id: t2\n    title: Create world.txt\n  - id: t3\n    title: Create notes.txt\n    status: in_progress\n",
        ),
        &["MISSION_FAILED: disk is read-only", "- nothing learned"],
        &[START_REPORT],
    );
    fs::create_dir_all(harness.repo.path().join(".overseer")).expect("mkdir");
    let mut state = RunState::default();
    state.mark_completed("t2");
    state.active_task_id = Some("t3".to_string());
    write_run_state(&harness.overseer_file("state.json"), &state).expect("state");

    let outcome = harness.run();

    let ran: Vec<&str> = outcome.summary.tasks.iter().map(|t| t.task.as_str()).collect();
    assert_eq!(ran, vec!["t3"]);
    let requests = harness.executor.requests();
    assert_eq!(requests.len(), 1);
    assert!(requests[0].prompt.starts_with("Start Task t3: "));
    let mission = harness.store().load().expect("reload");
    assert_eq!(mission.task("t2").map(|t| t.status), Some(TaskStatus::Todo));
    assert_eq!(mission.task("t3").map(|t| t.status), Some(TaskStatus::Blocked));
}

/// Verifies an interrupt before any task leaves the mission resumable.
#[test]
fn interrupted_run_keeps_state() {
    let harness = Harness::new(
        &mission("  - id: t1\n    title: Create hello.txt\n"),
        &[],
        &[],
    );
    harness.shutdown.request();

    let outcome = harness.run();

    assert!(outcome.interrupted);
    assert_eq!(outcome.exit_code(), 130);
    assert!(outcome.summary.tasks.is_empty());
    let mission = harness.store().load().expect("reload");
    assert_eq!(mission.task("t1").map(|t| t.status), Some(TaskStatus::Todo));
    assert!(harness.executor.requests().is_empty());
}

/// Verifies parallel tasks run in isolated copies and are all recorded.
#[test]
fn parallel_tasks_run_in_isolated_copies() {
    let harness = Harness::new(
        &format!(
            "parallel: true\n{}",
            mission("  - id: a\n    title: Create a.txt\n  - id: b\n    title: Create b.txt\n")
        ),
        &["MISSION_FAILED: no network", "MISSION_FAILED: no network", "MISSION_FAILED: no network"],
        &[START_REPORT, START_REPORT],
    );

    let outcome = harness.run();

    let mut ran: Vec<(String, String)> = outcome
        .summary
        .tasks
        .iter()
        .map(|t| (t.task.clone(), t.status.clone()))
        .collect();
    ran.sort();
    assert_eq!(
        ran,
        vec![
            ("a".to_string(), "blocked".to_string()),
            ("b".to_string(), "blocked".to_string())
        ]
    );
    assert!(outcome.summary.parallel);
    for id in ["a", "b"] {
        let copy = harness.overseer_file(&format!("squad/task_{id}"));
        assert!(copy.join("README.md").exists());
        assert!(!copy.join(".git").exists());
    }
    let workdirs: Vec<PathBuf> = harness
        .executor
        .requests()
        .into_iter()
        .map(|r| r.workdir)
        .collect();
    assert!(workdirs.iter().all(|dir| dir.starts_with(harness.overseer_file("squad"))));
    let mission = harness.store().load().expect("reload");
    assert!(mission.tasks.iter().all(|t| t.status == TaskStatus::Blocked));
}
