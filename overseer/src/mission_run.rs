//! Mission-level orchestration: load, plan, run tasks, summarize.
//!
//! A mission run:
//! - loads and validates the mission and settings (fatal on error),
//! - creates a backup branch and optionally breaks tasks into sub-tasks,
//! - runs the pending tasks sequentially or on a scoped worker pool,
//! - persists every status change through the locked [`MissionStore`],
//! - writes `summary_<ts>.json` and clears the run state when nothing was interrupted.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use chrono::{Local, Utc};
use tracing::{error, info, instrument, warn};

use crate::agents::prompt::TaskLine;
use crate::core::persona::{PersonaRule, select_persona};
use crate::core::types::{Task, TaskStatus};
use crate::driver::Role;
use crate::driver::registry::{DriverRegistry, PathResolver};
use crate::error::{OverseerError, is_interrupted};
use crate::exit_codes;
use crate::io::clock::Clock;
use crate::io::config::{Settings, load_settings};
use crate::io::fs_util::write_atomic;
use crate::io::git::Git;
use crate::io::init::OverseerPaths;
use crate::io::isolation::{self, IsolationPolicy, WorkspaceKind};
use crate::io::lock::LockOptions;
use crate::io::metrics::{RunSummary, TaskMetrics, TaskSummary, write_summary};
use crate::io::mission::{Mission, MissionStore};
use crate::io::qa::{TestOutcome, TestRequest};
use crate::io::run_state::{RunState, clear_run_state, load_run_state, write_run_state};
use crate::task_loop::{Agents, MissionView, Services, TaskContext, TaskEnd, run_task};

pub const REVIEW_ONLY: &str = "review_only";
pub const ERROR_STATUS: &str = "error";
const AUTO_COMMIT_INSTRUCTION: &str = "Commit and push all changes now that all tasks are completed.";
const PROJECT_DOCS: [&str; 5] = ["README", "README.md", "docs", "AGENTS.md", "CLAUDE.md"];

/// Builds the role drivers once settings are known.
pub trait AgentFactory: Send + Sync {
    fn build(&self, settings: &Settings, paths: &OverseerPaths) -> Result<Agents>;
}

/// Fixed drivers; the critic list is dropped when the critic is disabled.
impl AgentFactory for Agents {
    fn build(&self, settings: &Settings, _paths: &OverseerPaths) -> Result<Agents> {
        let mut agents = self.clone();
        if !settings.critic.enabled.unwrap_or(true) {
            agents.critics.clear();
        }
        Ok(agents)
    }
}

/// Production drivers resolved from `PATH` through the registry.
pub struct RegistryAgents {
    clock: Arc<dyn Clock>,
}

impl RegistryAgents {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { clock }
    }
}

impl AgentFactory for RegistryAgents {
    fn build(&self, settings: &Settings, paths: &OverseerPaths) -> Result<Agents> {
        let registry = DriverRegistry::new(
            Box::new(PathResolver),
            Arc::clone(&self.clock),
            paths.brain_env_dir.clone(),
        );
        let planner = registry.build(Role::Planner, &settings.brain)?;
        let executor = registry.build(Role::Executor, &settings.body)?;
        let critics = if settings.critic.enabled.unwrap_or(true) {
            registry.build_voters(&settings.critic).unwrap_or_else(|err| {
                warn!(err = %format!("{err:#}"), "critic unavailable, completion claims skip the critic gate");
                Vec::new()
            })
        } else {
            Vec::new()
        };
        info!(
            planner = %planner.name(),
            executor = %executor.name(),
            critics = critics.len(),
            "drivers ready"
        );
        Ok(Agents {
            planner,
            executor,
            critics,
        })
    }
}

/// CLI-level options for one run.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub mission_path: PathBuf,
    pub settings_path: PathBuf,
    /// Where `summary_<ts>.json` goes; no summary file when unset.
    pub log_dir: Option<PathBuf>,
    pub reviewer: bool,
    pub retry_blocked: bool,
    /// `PATTERN=PERSONA` rules, ahead of settings rules.
    pub persona_map: Vec<String>,
}

/// Mission, settings and paths after validation.
#[derive(Debug, Clone)]
pub struct LoadedMission {
    pub store: MissionStore,
    pub mission: Mission,
    pub settings: Settings,
    pub root: PathBuf,
    pub paths: OverseerPaths,
}

/// Load and validate everything a run needs. Errors here are fatal.
pub fn load_mission(options: &RunOptions) -> Result<LoadedMission> {
    let mission = MissionStore::new(&options.mission_path, LockOptions::default()).load()?;
    let settings = load_settings(&options.settings_path, mission.settings_overrides().as_ref())?;
    for spec in &options.persona_map {
        PersonaRule::from_cli(spec).map_err(|err| {
            anyhow::Error::from(OverseerError::Configuration(format!("{err:#}")))
        })?;
    }
    let store = MissionStore::new(&options.mission_path, settings.persistence.lock_options());
    let root = mission.project_root(&options.mission_path);
    let paths = OverseerPaths::new(&root);
    Ok(LoadedMission {
        store,
        mission,
        settings,
        root,
        paths,
    })
}

fn cli_persona_rules(options: &RunOptions) -> Result<Vec<PersonaRule>> {
    options
        .persona_map
        .iter()
        .map(|spec| PersonaRule::from_cli(spec))
        .collect()
}

/// True when the project carries documentation the agents can read.
pub fn has_project_docs(root: &Path) -> bool {
    PROJECT_DOCS.iter().any(|name| root.join(name).exists())
}

/// Tasks to run, in mission order.
pub fn pending_tasks(mission: &Mission, state: &RunState, retry_blocked: bool) -> Vec<Task> {
    mission
        .tasks
        .iter()
        .filter(|task| !state.is_completed(&task.id))
        .filter(|task| match task.status {
            TaskStatus::Todo | TaskStatus::InProgress => true,
            TaskStatus::Blocked => retry_blocked,
            TaskStatus::Done => false,
        })
        .cloned()
        .collect()
}

/// Human-readable plan printed by `--dry-run`.
pub fn render_plan(loaded: &LoadedMission, options: &RunOptions) -> Result<String> {
    let mission = &loaded.mission;
    let settings = &loaded.settings;
    let mut rules = cli_persona_rules(options)?;
    rules.extend(settings.compiled_persona_rules()?);
    let state = if settings.resume {
        load_run_state(&loaded.paths.state_path)?
    } else {
        RunState::default()
    };
    let pending: Vec<String> = pending_tasks(mission, &state, options.retry_blocked)
        .into_iter()
        .map(|task| task.id)
        .collect();

    let mode = if mission.parallel {
        let workers = settings
            .parallel
            .max_workers
            .unwrap_or(pending.len())
            .clamp(1, pending.len().max(1));
        format!("parallel ({workers} workers)")
    } else {
        "sequential".to_string()
    };
    let mut out = format!(
        "Mission: {}\nProject root: {}\nMode: {mode}{}\n",
        mission.mission.name,
        loaded.root.display(),
        if options.reviewer || mission.reviewer_mode {
            ", reviewer"
        } else {
            ""
        }
    );
    if !mission.constraints.is_empty() {
        out.push_str("Constraints:\n");
        for constraint in &mission.constraints {
            out.push_str(&format!("  - {constraint}\n"));
        }
    }
    out.push_str("Tasks:\n");
    for task in &mission.tasks {
        let persona = select_persona(
            task.persona.as_deref(),
            &task.block(),
            &rules,
            mission.persona.as_deref(),
        );
        let action = if pending.contains(&task.id) {
            "run"
        } else {
            "skip"
        };
        out.push_str(&format!(
            "  [{}] {} {} ({action}, persona: {})\n",
            task.status,
            task.id,
            task.title.trim(),
            persona.as_deref().unwrap_or("none")
        ));
        for sub in &task.sub_tasks {
            out.push_str(&format!("      - {sub}\n"));
        }
    }
    Ok(out)
}

/// Result of a whole run.
#[derive(Debug, Clone)]
pub struct MissionOutcome {
    pub summary: RunSummary,
    pub summary_path: Option<PathBuf>,
    pub interrupted: bool,
}

impl MissionOutcome {
    /// Blocked tasks are reported, not fatal.
    pub fn exit_code(&self) -> i32 {
        if self.interrupted {
            exit_codes::INTERRUPTED
        } else {
            exit_codes::OK
        }
    }
}

struct RunEnv {
    ctx: TaskContext,
    store: MissionStore,
    root: PathBuf,
    policy: IsolationPolicy,
    reviewer: bool,
}

struct TaskRun {
    summary: TaskSummary,
    metrics: TaskMetrics,
    interrupted: bool,
}

/// Run a loaded mission to the end or until interrupted.
#[instrument(skip_all, fields(mission = %options.mission_path.display()))]
pub fn run_mission(
    options: &RunOptions,
    factory: &dyn AgentFactory,
    services: Services,
) -> Result<MissionOutcome> {
    let started_at = Utc::now().to_rfc3339();
    let loaded = load_mission(options)?;
    let LoadedMission {
        store,
        mission,
        settings,
        root,
        paths,
    } = loaded;
    paths.ensure()?;
    let reviewer = options.reviewer || mission.reviewer_mode;
    info!(
        name = %mission.mission.name,
        tasks = mission.tasks.len(),
        parallel = mission.parallel,
        reviewer,
        "mission loaded"
    );

    let agents = factory.build(&settings, &paths)?;
    let view = MissionView {
        context: mission.context_summary(),
        constraints: mission.constraints.clone(),
        default_persona: mission.persona.clone(),
        has_project_docs: has_project_docs(&root),
    };
    let rules = cli_persona_rules(options)?;
    let ctx = TaskContext::new(settings.clone(), paths.clone(), view, agents, services, rules)?;
    let env = RunEnv {
        ctx,
        store,
        root: root.clone(),
        policy: IsolationPolicy {
            parallel: mission.parallel,
            use_worktrees: settings.safety.use_worktrees,
            preview_changes: settings.safety.preview_changes,
        },
        reviewer,
    };

    if !reviewer && settings.safety.create_backup_branch {
        create_backup_branch(&root);
    }
    if settings.planner.enabled && !reviewer {
        plan_breakdown(&env, &mission)?;
    }

    if !settings.resume {
        clear_run_state(&paths.state_path)?;
    }
    let state = load_run_state(&paths.state_path)?;
    let mission = env.store.load()?;
    let tasks = pending_tasks(&mission, &state, options.retry_blocked);
    info!(pending = tasks.len(), skipped = mission.tasks.len() - tasks.len(), "resume filter applied");

    let mut runs = if mission.parallel && tasks.len() > 1 {
        let workers = settings
            .parallel
            .max_workers
            .unwrap_or(tasks.len())
            .clamp(1, tasks.len());
        run_parallel(&env, &tasks, workers)?
    } else {
        run_sequential(&env, &tasks)
    };
    runs.sort_by_key(|(idx, _)| *idx);

    let interrupted = env.ctx.services.shutdown.is_requested() || runs.iter().any(|(_, run)| run.interrupted);
    let mut totals = TaskMetrics::default();
    for (_, run) in &runs {
        totals.absorb(&run.metrics);
    }

    if !interrupted && !reviewer {
        finish_mission(&env, mission.parallel, !runs.is_empty())?;
    }

    let summary = RunSummary {
        started_at,
        ended_at: Utc::now().to_rfc3339(),
        tasks: runs.into_iter().map(|(_, run)| run.summary).collect(),
        parallel: mission.parallel,
        reviewer_mode: reviewer,
        interrupted,
        totals,
    };
    info!(
        done = summary.count(TaskStatus::Done.as_str()),
        blocked = summary.count(TaskStatus::Blocked.as_str()),
        interrupted,
        "mission finished"
    );
    let summary_path = match &options.log_dir {
        Some(dir) => {
            let path = dir.join(format!("summary_{}.json", Local::now().format("%Y%m%d_%H%M%S")));
            write_summary(&path, &summary)?;
            Some(path)
        }
        None => None,
    };
    Ok(MissionOutcome {
        summary,
        summary_path,
        interrupted,
    })
}

fn create_backup_branch(root: &Path) {
    let git = Git::new(root);
    let Some(head) = git.head_commit() else {
        warn!("no HEAD commit, skipping backup branch");
        return;
    };
    let branch = format!("overseer-backup-{}", Local::now().format("%Y%m%d-%H%M%S"));
    match git.create_branch(&branch, &head) {
        Ok(()) => info!(branch = %branch, "backup branch created"),
        Err(err) => warn!(err = %format!("{err:#}"), "failed to create backup branch"),
    }
}

/// Ask the planner to split todo tasks that have no sub-tasks yet.
fn plan_breakdown(env: &RunEnv, mission: &Mission) -> Result<()> {
    let ctx = &env.ctx;
    let candidates = mission
        .tasks
        .iter()
        .filter(|task| task.status == TaskStatus::Todo && task.sub_tasks.is_empty());
    for task in candidates {
        ctx.services.shutdown.check()?;
        let sub_tasks = match ctx.planner.breakdown(
            &ctx.mission.context,
            &task.block(),
            &ctx.mission.constraints,
            &env.root,
        ) {
            Ok(Some(sub_tasks)) => sub_tasks,
            Ok(None) => continue,
            Err(err) => {
                warn!(task_id = %task.id, err = %format!("{err:#}"), "task breakdown failed");
                continue;
            }
        };
        if ctx.settings.planner.require_approval {
            let bullets: Vec<String> = sub_tasks.iter().map(|s| format!("  - {s}")).collect();
            let prompt = format!(
                "Proposed plan for task {} ({}):\n{}\nApprove this plan?",
                task.id,
                task.title.trim(),
                bullets.join("\n")
            );
            if !ctx.services.plans.confirm(&prompt) {
                info!(task_id = %task.id, "plan rejected, keeping the task as written");
                continue;
            }
        }
        info!(task_id = %task.id, sub_tasks = sub_tasks.len(), "task broken down");
        env.store
            .update_task(&task.id, |t| t.sub_tasks = sub_tasks)?;
    }
    Ok(())
}

fn run_sequential(env: &RunEnv, tasks: &[Task]) -> Vec<(usize, TaskRun)> {
    let mut runs = Vec::new();
    for (idx, task) in tasks.iter().enumerate() {
        if env.ctx.services.shutdown.is_requested() {
            break;
        }
        let run = run_one(env, task);
        let stop = run.interrupted;
        runs.push((idx, run));
        if stop {
            break;
        }
    }
    runs
}

/// Workers pull task indices from a shared cursor inside a thread scope.
fn run_parallel(env: &RunEnv, tasks: &[Task], workers: usize) -> Result<Vec<(usize, TaskRun)>> {
    info!(workers, tasks = tasks.len(), "running tasks in parallel");
    let cursor = AtomicUsize::new(0);
    thread::scope(|scope| {
        let mut handles = Vec::with_capacity(workers);
        for _ in 0..workers {
            let cursor = &cursor;
            handles.push(scope.spawn(move || {
                let mut runs = Vec::new();
                while !env.ctx.services.shutdown.is_requested() {
                    let idx = cursor.fetch_add(1, Ordering::SeqCst);
                    let Some(task) = tasks.get(idx) else {
                        break;
                    };
                    runs.push((idx, run_one(env, task)));
                }
                runs
            }));
        }
        let mut runs = Vec::new();
        for handle in handles {
            let batch = handle
                .join()
                .map_err(|_| anyhow!("task worker thread panicked"))?;
            runs.extend(batch);
        }
        Ok(runs)
    })
}

fn run_one(env: &RunEnv, task: &Task) -> TaskRun {
    let started = Instant::now();
    match try_run_one(env, task) {
        Ok(run) => run,
        Err(err) => {
            let interrupted = is_interrupted(&err);
            if interrupted {
                info!(task_id = %task.id, "task interrupted before it finished");
            } else {
                error!(task_id = %task.id, err = %format!("{err:#}"), "task run failed");
            }
            TaskRun {
                summary: TaskSummary {
                    task: task.id.clone(),
                    persona: task.persona.clone(),
                    status: if interrupted {
                        TaskStatus::InProgress.as_str().to_string()
                    } else {
                        ERROR_STATUS.to_string()
                    },
                    duration_seconds: started.elapsed().as_secs_f64(),
                },
                metrics: TaskMetrics::default(),
                interrupted,
            }
        }
    }
}

#[instrument(skip_all, fields(task_id = %task.id))]
fn try_run_one(env: &RunEnv, task: &Task) -> Result<TaskRun> {
    let ctx = &env.ctx;
    ctx.services.shutdown.check()?;
    if env.reviewer {
        return review_one(env, task);
    }

    let git = Git::new(&env.root);
    let start_commit = git.head_commit();
    let task = env.store.set_status(&task.id, TaskStatus::InProgress)?;
    update_run_state(env, |state| {
        state.active_task_id = Some(task.id.clone());
    })?;

    let workspace = match isolation::prepare(&env.root, &ctx.paths.overseer_dir, &task.id, env.policy) {
        Ok(workspace) => workspace,
        Err(err) => {
            let reason = format!("workspace preparation failed: {err:#}");
            warn!(reason = %reason, "blocking task");
            env.store.update_task(&task.id, |t| {
                t.status = TaskStatus::Blocked;
                t.notes = format!("blocked: {reason}");
            })?;
            return Ok(TaskRun {
                summary: TaskSummary {
                    task: task.id.clone(),
                    persona: task.persona.clone(),
                    status: TaskStatus::Blocked.as_str().to_string(),
                    duration_seconds: 0.0,
                },
                metrics: TaskMetrics::default(),
                interrupted: false,
            });
        }
    };

    let report = match run_task(ctx, &task, &workspace.root) {
        Ok(report) => report,
        Err(err) => {
            if let Err(cleanup) = isolation::finish(&workspace, false) {
                warn!(err = %format!("{cleanup:#}"), "failed to clean up task workspace");
            }
            return Err(err);
        }
    };

    let status = report.status();
    let note = report.note();
    let summary_path = ctx.paths.display_relative(&report.transcript_path);
    env.store.update_task(&task.id, |t| {
        t.status = status;
        t.notes = note;
        t.summary_path = Some(summary_path);
    })?;

    match &report.end {
        TaskEnd::Completed { .. } => {
            update_run_state(env, |state| {
                state.mark_completed(&task.id);
                state.active_task_id = None;
            })?;
        }
        TaskEnd::Blocked { reason } => {
            let err = OverseerError::TaskFailure {
                task_id: task.id.clone(),
                reason: reason.clone(),
            };
            warn!(err = %err, "task blocked, mission continues");
            if ctx.settings.safety.auto_rollback_on_failure
                && workspace.is_shared()
                && let Some(start) = &start_commit
            {
                match rollback_task(env, &git, start, &task.id) {
                    Ok(()) => info!(commit = %start, "rolled back to task start"),
                    Err(err) => warn!(err = %format!("{err:#}"), "rollback failed"),
                }
            }
        }
        TaskEnd::Interrupted => {}
    }

    let completed = matches!(report.end, TaskEnd::Completed { .. });
    let apply = completed
        && ctx.settings.safety.preview_changes
        && matches!(workspace.kind, WorkspaceKind::Worktree { .. })
        && ctx.services.actions.confirm(&format!(
            "Apply changes from task {} to the main workspace?",
            task.id
        ));
    match isolation::finish(&workspace, apply) {
        Ok(Some(bytes)) => info!(bytes, "task changes applied to the main workspace"),
        Ok(None) => {}
        Err(err) => warn!(err = %format!("{err:#}"), "failed to finish task workspace"),
    }

    Ok(TaskRun {
        summary: TaskSummary {
            task: task.id.clone(),
            persona: report.persona.clone(),
            status: status.as_str().to_string(),
            duration_seconds: report.duration.as_secs_f64(),
        },
        metrics: report.metrics,
        interrupted: report.end == TaskEnd::Interrupted,
    })
}

/// Roll the shared tree back to `start`, keeping the mission file as it is now.
fn rollback_task(env: &RunEnv, git: &Git, start: &str, task_id: &str) -> Result<()> {
    let mission_path = env.store.path();
    let saved = fs::read_to_string(mission_path)
        .with_context(|| format!("read mission {}", mission_path.display()))?;
    git.rollback_to(start, &format!("overseer rollback {task_id}"))?;
    env.store.with_lock(|| write_atomic(mission_path, &saved))
}

/// Reviewer mode: write a review plan, leave the task untouched.
fn review_one(env: &RunEnv, task: &Task) -> Result<TaskRun> {
    let started = Instant::now();
    let ctx = &env.ctx;
    let review = ctx
        .planner
        .review(&task.block(), &ctx.mission.constraints, &env.root)?;
    let path = ctx.paths.transcript_path(&format!("{}_review", task.id));
    write_atomic(&path, &format!("# Review: {}\n\n{review}\n", task.title.trim()))?;
    info!(path = %path.display(), "review written");
    let mut metrics = TaskMetrics {
        planner_calls: 1,
        ..TaskMetrics::default()
    };
    metrics.add_output(&review);
    Ok(TaskRun {
        summary: TaskSummary {
            task: task.id.clone(),
            persona: task.persona.clone(),
            status: REVIEW_ONLY.to_string(),
            duration_seconds: started.elapsed().as_secs_f64(),
        },
        metrics,
        interrupted: false,
    })
}

/// Read-modify-write the run state under the mission lock.
fn update_run_state(env: &RunEnv, f: impl FnOnce(&mut RunState)) -> Result<()> {
    let path = &env.ctx.paths.state_path;
    env.store.with_lock(|| {
        let mut state = load_run_state(path)?;
        f(&mut state);
        state.last_run_at = Some(Utc::now().to_rfc3339());
        write_run_state(path, &state)
    })
}

/// End-of-mission QA, reflection, auto-commit, and run-state cleanup.
fn finish_mission(env: &RunEnv, parallel: bool, ran_tasks: bool) -> Result<()> {
    let ctx = &env.ctx;
    let qa = &ctx.settings.qa;
    if qa.run_tests && !qa.test_on_each_task {
        let outcome = ctx.services.tests.run(&TestRequest {
            workdir: env.root.clone(),
            command: qa.test_command.clone(),
            timeout: Duration::from_secs(qa.timeout_secs),
        });
        match outcome {
            Ok(TestOutcome::Passed { .. }) => info!("mission tests passed"),
            Ok(TestOutcome::Failed { exit_code, .. }) => warn!(exit_code, "mission tests failed"),
            Ok(TestOutcome::Skipped) => info!("no test command found, mission tests skipped"),
            Err(err) => warn!(err = %format!("{err:#}"), "mission tests could not run"),
        }
    }

    if ran_tasks {
        reflect(env);
    }

    if ctx.settings.safety.auto_commit_and_push {
        if parallel {
            info!("auto-commit skipped in parallel mode");
        } else {
            match ctx.worker.run(AUTO_COMMIT_INSTRUCTION, &env.root, None) {
                Ok(turn) if turn.outcome.is_success() => info!("changes committed and pushed"),
                Ok(turn) => warn!(observation = %turn.outcome.observation(), "auto-commit did not succeed"),
                Err(err) => warn!(err = %format!("{err:#}"), "auto-commit failed"),
            }
        }
    }

    clear_run_state(&ctx.paths.state_path).context("clear run state")
}

fn reflect(env: &RunEnv) {
    let ctx = &env.ctx;
    let mission = match env.store.load() {
        Ok(mission) => mission,
        Err(err) => {
            warn!(err = %format!("{err:#}"), "cannot reload mission for reflection");
            return;
        }
    };
    let lines: Vec<TaskLine> = mission
        .tasks
        .iter()
        .map(|task| TaskLine {
            title: task.title.trim().to_string(),
            status: task.status.as_str().to_string(),
        })
        .collect();
    match ctx.planner.reflect(&lines, &env.root) {
        Ok(Some(insight)) => {
            ctx.memory.save(&insight);
            info!("lessons saved to memory");
        }
        Ok(None) => info!("no lessons from reflection"),
        Err(err) => warn!(err = %format!("{err:#}"), "reflection failed"),
    }
}
