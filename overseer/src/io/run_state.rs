//! Resume bookkeeping (`.overseer/state.json`).

use std::fs;
use std::io::ErrorKind;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::io::fs_util::write_atomic;

/// Persisted progress for the current mission run.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RunState {
    /// Task currently being worked on, if any.
    pub active_task_id: Option<String>,
    /// RFC 3339 timestamp of the last update.
    pub last_run_at: Option<String>,
    /// Ids of tasks completed in this run.
    #[serde(default)]
    pub completed_indices: Vec<String>,
}

impl RunState {
    pub fn is_completed(&self, task_id: &str) -> bool {
        self.completed_indices.iter().any(|id| id == task_id)
    }

    pub fn mark_completed(&mut self, task_id: &str) {
        if !self.is_completed(task_id) {
            self.completed_indices.push(task_id.to_string());
        }
    }
}

/// Load run state; a missing file yields the empty state.
pub fn load_run_state(path: &Path) -> Result<RunState> {
    debug!(path = %path.display(), "loading run state");
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(RunState::default()),
        Err(err) => {
            return Err(err).with_context(|| format!("read run state {}", path.display()));
        }
    };
    let state: RunState = serde_json::from_str(&contents)
        .with_context(|| format!("parse run state {}", path.display()))?;
    debug!(
        active = ?state.active_task_id,
        completed = state.completed_indices.len(),
        "run state loaded"
    );
    Ok(state)
}

/// Atomically write run state to disk (temp file + rename).
pub fn write_run_state(path: &Path, state: &RunState) -> Result<()> {
    debug!(path = %path.display(), active = ?state.active_task_id, "writing run state");
    let mut buf = serde_json::to_string_pretty(state)?;
    buf.push('\n');
    write_atomic(path, &buf)
}

pub fn clear_run_state(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err).with_context(|| format!("remove run state {}", path.display())),
    }
}
