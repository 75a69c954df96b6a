//! Shared deterministic types for mission and task state.
//!
//! These types are the persisted contract of a mission file plus the transient
//! per-turn results passed between orchestrator components.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Lifecycle status of a task.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Todo,
    InProgress,
    Blocked,
    Done,
}

impl TaskStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Todo => "todo",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Blocked => "blocked",
            TaskStatus::Done => "done",
        }
    }

    /// Whether moving from `self` to `next` is allowed.
    ///
    /// Forward-only, except that blocked tasks may be picked up again.
    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        if self == next {
            return true;
        }
        matches!(
            (self, next),
            (TaskStatus::Todo, TaskStatus::InProgress)
                | (TaskStatus::Todo, TaskStatus::Blocked)
                | (TaskStatus::InProgress, TaskStatus::Done)
                | (TaskStatus::InProgress, TaskStatus::Blocked)
                | (TaskStatus::Blocked, TaskStatus::InProgress)
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A unit of work in a mission file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    #[serde(alias = "task")]
    pub title: String,
    #[serde(default)]
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub persona: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sub_tasks: Vec<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub notes: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary_path: Option<String>,
    /// Unknown keys are carried through rewrites untouched.
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_yaml::Value>,
}

impl Task {
    pub fn new(id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            status: TaskStatus::Todo,
            persona: None,
            sub_tasks: Vec::new(),
            notes: String::new(),
            summary_path: None,
            extra: BTreeMap::new(),
        }
    }

    /// Render the task as the block handed to agents.
    pub fn block(&self) -> String {
        let mut out = format!("MAIN TASK: {}", self.title.trim());
        if !self.sub_tasks.is_empty() {
            out.push_str("\nSUB-TASKS:");
            for sub in &self.sub_tasks {
                out.push_str("\n- ");
                out.push_str(sub.trim());
            }
        }
        out
    }

    /// Title and sub-tasks without the block labels, for text heuristics.
    pub fn description(&self) -> String {
        std::iter::once(self.title.trim())
            .chain(self.sub_tasks.iter().map(|sub| sub.trim()))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Planner verdict parsed from a raw response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlannerDecision {
    /// Run this instruction next.
    Command(String),
    /// The planner claims the task is complete.
    Completed,
    /// The planner gave up on the task.
    Failed(String),
}

/// Structured result of one execution turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecOutcome {
    Success { output: String },
    Empty { exit_code: i32 },
    Error {
        exit_code: i32,
        output: String,
        timed_out: bool,
    },
}

impl ExecOutcome {
    /// Classify a finished process.
    pub fn from_process(exit_code: i32, timed_out: bool, output: String) -> Self {
        if timed_out || exit_code != 0 {
            return ExecOutcome::Error {
                exit_code,
                output,
                timed_out,
            };
        }
        if output.trim().is_empty() {
            return ExecOutcome::Empty { exit_code };
        }
        ExecOutcome::Success { output }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, ExecOutcome::Success { .. })
    }

    /// Text shown to the planner as the observation of this turn.
    pub fn observation(&self) -> String {
        match self {
            ExecOutcome::Success { output } => output.clone(),
            ExecOutcome::Empty { exit_code } => format!("[no output, exit {exit_code}]"),
            ExecOutcome::Error {
                exit_code,
                output,
                timed_out,
            } => {
                let head = if *timed_out {
                    format!("[timed out, exit {exit_code}]")
                } else {
                    format!("[failed, exit {exit_code}]")
                };
                if output.trim().is_empty() {
                    head
                } else {
                    format!("{head}\n{output}")
                }
            }
        }
    }
}

/// Traffic-light readiness of a task before execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ConfidenceStatus {
    Red,
    Yellow,
    Green,
}

/// Pre-flight confidence score. Computed once per task.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConfidenceResult {
    pub score: f64,
    pub status: ConfidenceStatus,
    pub checks: Vec<String>,
    pub skip_verification: bool,
}

/// Outcome of the self-check gate on a completion claim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SelfCheckResult {
    pub passed: bool,
    pub tests_passed: bool,
    pub requirements_met: bool,
    pub assumptions_verified: bool,
    pub evidence_provided: bool,
    pub missing: Vec<String>,
}
