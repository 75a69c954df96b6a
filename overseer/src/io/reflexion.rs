//! Append-only error/fix ledger with fuzzy recall (`.overseer/reflexion.jsonl`).

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::core::similarity::similarity;
use crate::io::fs_util::append_line;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReflexionStatus {
    Adopted,
    Pending,
    Deprecated,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReflexionEntry {
    pub timestamp: String,
    pub error_signature: String,
    pub root_cause: String,
    pub fix: String,
    pub status: ReflexionStatus,
}

impl ReflexionEntry {
    pub fn new(
        error_signature: impl Into<String>,
        root_cause: impl Into<String>,
        fix: impl Into<String>,
        status: ReflexionStatus,
    ) -> Self {
        Self {
            timestamp: Utc::now().to_rfc3339(),
            error_signature: error_signature.into(),
            root_cause: root_cause.into(),
            fix: fix.into(),
            status,
        }
    }

    /// `Error: <sig>\nFix: <fix>` as shown to the planner.
    pub fn render(&self) -> String {
        format!("Error: {}\nFix: {}", self.error_signature.trim(), self.fix.trim())
    }
}

/// A recalled fix and its similarity score.
#[derive(Debug, Clone, PartialEq)]
pub struct SimilarFix {
    pub entry: ReflexionEntry,
    pub score: f64,
}

#[derive(Debug, Clone)]
pub struct ReflexionLedger {
    path: PathBuf,
    threshold: f64,
    max_fixes: usize,
}

impl ReflexionLedger {
    pub fn new(path: impl Into<PathBuf>, threshold: f64, max_fixes: usize) -> Self {
        Self {
            path: path.into(),
            threshold,
            max_fixes,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn record(&self, entry: &ReflexionEntry) -> Result<()> {
        let line = serde_json::to_string(entry).context("serialize reflexion entry")?;
        append_line(&self.path, &line)?;
        debug!(status = ?entry.status, "reflexion entry recorded");
        Ok(())
    }

    /// All parseable entries in file order; malformed lines are skipped.
    pub fn entries(&self) -> Result<Vec<ReflexionEntry>> {
        let contents = match fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => {
                return Err(err).with_context(|| format!("read {}", self.path.display()));
            }
        };
        let mut entries = Vec::new();
        for (idx, line) in contents.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<ReflexionEntry>(line) {
                Ok(entry) => entries.push(entry),
                Err(err) => warn!(line = idx + 1, err = %err, "skipping malformed reflexion line"),
            }
        }
        Ok(entries)
    }

    /// Best adopted entry whose signature scores at or above the threshold.
    pub fn find_similar(&self, error_signature: &str) -> Result<Option<SimilarFix>> {
        let mut best: Option<SimilarFix> = None;
        for entry in self.entries()? {
            if entry.status != ReflexionStatus::Adopted {
                continue;
            }
            let score = similarity(error_signature, &entry.error_signature);
            if best.as_ref().is_none_or(|b| score > b.score) {
                best = Some(SimilarFix { entry, score });
            }
        }
        Ok(best.filter(|b| b.score >= self.threshold))
    }

    /// Newest adopted entries, capped at `max_fixes`, oldest first.
    pub fn adopted_fixes(&self) -> Result<Vec<ReflexionEntry>> {
        let adopted: Vec<ReflexionEntry> = self
            .entries()?
            .into_iter()
            .filter(|e| e.status == ReflexionStatus::Adopted)
            .collect();
        let skip = adopted.len().saturating_sub(self.max_fixes);
        Ok(adopted.into_iter().skip(skip).collect())
    }

    /// Standing "do not repeat these mistakes" list, empty when nothing is adopted.
    pub fn standing_list(&self) -> Result<String> {
        Ok(self
            .adopted_fixes()?
            .iter()
            .map(ReflexionEntry::render)
            .collect::<Vec<_>>()
            .join("\n\n"))
    }
}
