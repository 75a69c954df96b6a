//! Per-task metrics ledger and the end-of-run summary.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::io::fs_util::{append_line, write_atomic};

/// Rough token estimate used for accounting only.
pub fn estimate_tokens(text: &str) -> u64 {
    (text.chars().count() as u64 + 3) / 4
}

/// Counters accumulated while a task runs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskMetrics {
    pub turns: u32,
    pub planner_calls: u32,
    pub executor_calls: u32,
    pub local_checks: u32,
    pub critic_calls: u32,
    pub self_check_failures: u32,
    pub critic_rejections: u32,
    pub quota_waits: u32,
    pub prompt_tokens: u64,
    pub output_tokens: u64,
}

impl TaskMetrics {
    pub fn add_prompt(&mut self, prompt: &str) {
        self.prompt_tokens += estimate_tokens(prompt);
    }

    pub fn add_output(&mut self, output: &str) {
        self.output_tokens += estimate_tokens(output);
    }

    pub fn absorb(&mut self, other: &TaskMetrics) {
        self.turns += other.turns;
        self.planner_calls += other.planner_calls;
        self.executor_calls += other.executor_calls;
        self.local_checks += other.local_checks;
        self.critic_calls += other.critic_calls;
        self.self_check_failures += other.self_check_failures;
        self.critic_rejections += other.critic_rejections;
        self.quota_waits += other.quota_waits;
        self.prompt_tokens += other.prompt_tokens;
        self.output_tokens += other.output_tokens;
    }
}

/// One line of `.overseer/metrics.jsonl`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsRecord {
    pub timestamp: String,
    pub task_id: String,
    pub persona: Option<String>,
    pub status: String,
    pub duration_seconds: f64,
    pub confidence: Option<f64>,
    #[serde(flatten)]
    pub counters: TaskMetrics,
}

#[derive(Debug, Clone)]
pub struct MetricsLedger {
    path: PathBuf,
    enabled: bool,
}

impl MetricsLedger {
    pub fn new(path: impl Into<PathBuf>, enabled: bool) -> Self {
        Self {
            path: path.into(),
            enabled,
        }
    }

    pub fn record(&self, record: &MetricsRecord) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }
        let line = serde_json::to_string(record).context("serialize metrics record")?;
        append_line(&self.path, &line)
    }
}

/// Per-task row of the run summary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSummary {
    pub task: String,
    pub persona: Option<String>,
    pub status: String,
    pub duration_seconds: f64,
}

/// `summary_<ts>.json` written at the end of a run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub started_at: String,
    pub ended_at: String,
    pub tasks: Vec<TaskSummary>,
    pub parallel: bool,
    pub reviewer_mode: bool,
    pub interrupted: bool,
    pub totals: TaskMetrics,
}

impl RunSummary {
    pub fn count(&self, status: &str) -> usize {
        self.tasks.iter().filter(|t| t.status == status).count()
    }
}

pub fn write_summary(path: &Path, summary: &RunSummary) -> Result<()> {
    let mut buf = serde_json::to_string_pretty(summary)?;
    buf.push('\n');
    write_atomic(path, &buf)?;
    info!(path = %path.display(), tasks = summary.tasks.len(), "run summary written");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn token_estimate_rounds_up() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("a"), 1);
        assert_eq!(estimate_tokens("abcd"), 1);
        assert_eq!(estimate_tokens("abcde"), 2);
    }

    #[test]
    fn disabled_ledger_writes_nothing() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("metrics.jsonl");
        let record = MetricsRecord {
            timestamp: "t".to_string(),
            task_id: "a".to_string(),
            persona: None,
            status: "done".to_string(),
            duration_seconds: 1.5,
            confidence: Some(0.8),
            counters: TaskMetrics {
                turns: 2,
                ..TaskMetrics::default()
            },
        };
        MetricsLedger::new(&path, false).record(&record).expect("record");
        assert!(!path.exists());

        MetricsLedger::new(&path, true).record(&record).expect("record");
        let line = fs::read_to_string(&path).expect("read");
        let value: serde_json::Value = serde_json::from_str(line.trim()).expect("json");
        assert_eq!(value["turns"], 2);
        assert_eq!(value["task_id"], "a");
    }

    #[test]
    fn summary_counts_statuses() {
        let summary = RunSummary {
            tasks: vec![
                TaskSummary {
                    task: "a".to_string(),
                    persona: None,
                    status: "done".to_string(),
                    duration_seconds: 1.0,
                },
                TaskSummary {
                    task: "b".to_string(),
                    persona: Some("qa".to_string()),
                    status: "blocked".to_string(),
                    duration_seconds: 2.0,
                },
            ],
            ..RunSummary::default()
        };
        assert_eq!(summary.count("done"), 1);
        assert_eq!(summary.count("blocked"), 1);
    }
}
