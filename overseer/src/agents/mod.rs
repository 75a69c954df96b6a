//! Role wrappers around drivers: planner, executor and critic.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};

pub mod critic;
pub mod planner;
pub mod prompt;
pub mod worker;

/// Write the executor system prompt for a task.
pub(crate) fn write_system_prompt(path: &Path, contents: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create prompt dir {}", parent.display()))?;
    }
    fs::write(path, contents).with_context(|| format!("write system prompt {}", path.display()))
}
