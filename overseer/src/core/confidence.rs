//! Pre-flight confidence scoring.
//!
//! A cheap heuristic computed once before a task starts. High scores let a
//! single successful execution count as verification; low scores prepend an
//! investigation instruction to the task text.

use std::sync::LazyLock;

use regex::Regex;

use crate::core::types::{ConfidenceResult, ConfidenceStatus};

const BASE_SCORE: f64 = 0.5;
const DOCS_BONUS: f64 = 0.2;
const SPECIFIC_BONUS: f64 = 0.1;
const VAGUE_PENALTY: f64 = 0.1;
const DETERMINISTIC_BONUS: f64 = 0.15;
const EXPLORATORY_PENALTY: f64 = 0.2;
const FILE_REF_BONUS: f64 = 0.15;

const SPECIFIC_WORDS: usize = 8;
const VAGUE_WORDS: usize = 4;

pub const INVESTIGATE_PREFIX: &str = "Before making any changes, investigate the codebase to understand the current state and confirm what is needed. Then:";

const DETERMINISTIC_VERBS: [&str; 10] = [
    "create", "write", "list", "add", "rename", "print", "generate", "copy", "move", "update",
];
const EXPLORATORY_VERBS: [&str; 7] = [
    "investigate",
    "debug",
    "research",
    "explore",
    "analyze",
    "diagnose",
    "why",
];

static FILE_REF_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b[\w./\-]+\.(rs|py|js|ts|tsx|jsx|go|java|kt|c|h|cpp|hpp|cs|rb|php|swift|md|txt|toml|yaml|yml|json|html|css|sh|sql)\b",
    )
    .expect("file reference regex")
});

/// Thresholds for the traffic-light status.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConfidenceThresholds {
    pub high: f64,
    pub low: f64,
}

impl Default for ConfidenceThresholds {
    fn default() -> Self {
        Self {
            high: 0.8,
            low: 0.5,
        }
    }
}

/// Signals gathered before scoring.
#[derive(Debug, Clone)]
pub struct ConfidenceInput<'a> {
    pub task_text: &'a str,
    pub has_project_docs: bool,
}

/// Score a task's readiness for execution.
pub fn assess(input: &ConfidenceInput<'_>, thresholds: &ConfidenceThresholds) -> ConfidenceResult {
    let mut score = BASE_SCORE;
    let mut checks = Vec::new();
    let text = input.task_text.to_lowercase();
    let words: Vec<&str> = text
        .split(|c: char| !c.is_alphanumeric() && c != '\'')
        .filter(|w| !w.is_empty())
        .collect();

    if input.has_project_docs {
        score += DOCS_BONUS;
        checks.push("project documentation found".to_string());
    } else {
        checks.push("no project documentation".to_string());
    }

    if words.len() >= SPECIFIC_WORDS {
        score += SPECIFIC_BONUS;
        checks.push(format!("specific description ({} words)", words.len()));
    } else if words.len() < VAGUE_WORDS {
        score -= VAGUE_PENALTY;
        checks.push(format!("vague description ({} words)", words.len()));
    }

    if let Some(verb) = DETERMINISTIC_VERBS.iter().find(|v| words.contains(*v)) {
        score += DETERMINISTIC_BONUS;
        checks.push(format!("deterministic verb '{verb}'"));
    }

    let exploratory = EXPLORATORY_VERBS
        .iter()
        .find(|v| words.contains(*v))
        .map(|v| v.to_string())
        .or_else(|| text.contains("figure out").then(|| "figure out".to_string()));
    if let Some(verb) = exploratory {
        score -= EXPLORATORY_PENALTY;
        checks.push(format!("exploratory verb '{verb}'"));
    }

    if let Some(found) = FILE_REF_RE.find(input.task_text) {
        score += FILE_REF_BONUS;
        checks.push(format!("file reference '{}'", found.as_str()));
    }

    let score = score.clamp(0.0, 1.0);
    let status = if score >= thresholds.high {
        ConfidenceStatus::Green
    } else if score >= thresholds.low {
        ConfidenceStatus::Yellow
    } else {
        ConfidenceStatus::Red
    };
    ConfidenceResult {
        score,
        status,
        checks,
        skip_verification: score >= thresholds.high,
    }
}

/// Result used when scoring is disabled.
pub fn neutral() -> ConfidenceResult {
    ConfidenceResult {
        score: BASE_SCORE,
        status: ConfidenceStatus::Yellow,
        checks: vec!["confidence check disabled".to_string()],
        skip_verification: false,
    }
}

/// Task text to hand to agents, given the confidence result.
pub fn adjust_task_text(task_text: &str, result: &ConfidenceResult) -> String {
    if result.status == ConfidenceStatus::Red {
        format!("{INVESTIGATE_PREFIX}\n{task_text}")
    } else {
        task_text.to_string()
    }
}
