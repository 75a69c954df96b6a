//! Canonical paths under `<project_root>/.overseer/`.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

/// Keeps the whole scratch directory out of git status, stashes and patches.
const GITIGNORE_CONTENTS: &str = "*\n";

#[derive(Debug, Clone)]
pub struct OverseerPaths {
    pub root: PathBuf,
    pub overseer_dir: PathBuf,
    pub gitignore_path: PathBuf,
    pub state_path: PathBuf,
    pub reflexion_path: PathBuf,
    pub metrics_path: PathBuf,
    pub transcripts_dir: PathBuf,
    pub squad_dir: PathBuf,
    pub prompts_dir: PathBuf,
    pub brain_env_dir: PathBuf,
}

impl OverseerPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let overseer_dir = root.join(".overseer");
        Self {
            root: root.clone(),
            gitignore_path: overseer_dir.join(".gitignore"),
            state_path: overseer_dir.join("state.json"),
            reflexion_path: overseer_dir.join("reflexion.jsonl"),
            metrics_path: overseer_dir.join("metrics.jsonl"),
            transcripts_dir: overseer_dir.join("transcripts"),
            squad_dir: overseer_dir.join("squad"),
            prompts_dir: overseer_dir.join("prompts"),
            brain_env_dir: overseer_dir.join("brain_env"),
            overseer_dir,
        }
    }

    /// Create the scratch layout. Existing files are left alone.
    pub fn ensure(&self) -> Result<()> {
        for dir in [
            &self.overseer_dir,
            &self.transcripts_dir,
            &self.prompts_dir,
        ] {
            fs::create_dir_all(dir).with_context(|| format!("create {}", dir.display()))?;
        }
        if !self.gitignore_path.exists() {
            fs::write(&self.gitignore_path, GITIGNORE_CONTENTS)
                .with_context(|| format!("write {}", self.gitignore_path.display()))?;
        }
        Ok(())
    }

    pub fn transcript_path(&self, task_id: &str) -> PathBuf {
        self.transcripts_dir.join(format!("{}.md", file_stem(task_id)))
    }

    pub fn system_prompt_path(&self, task_id: &str) -> PathBuf {
        self.prompts_dir
            .join(format!("system_{}.md", file_stem(task_id)))
    }

    /// `path` relative to the project root when possible.
    pub fn display_relative(&self, path: &Path) -> String {
        path.strip_prefix(&self.root)
            .unwrap_or(path)
            .display()
            .to_string()
    }
}

fn file_stem(task_id: &str) -> String {
    task_id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ensure_creates_layout_and_gitignore() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = OverseerPaths::new(temp.path());
        paths.ensure().expect("ensure");
        paths.ensure().expect("ensure twice");

        assert!(paths.transcripts_dir.is_dir());
        assert!(paths.prompts_dir.is_dir());
        assert_eq!(
            fs::read_to_string(&paths.gitignore_path).expect("read"),
            GITIGNORE_CONTENTS
        );
        assert_eq!(
            paths.display_relative(&paths.transcript_path("t/1")),
            ".overseer/transcripts/t_1.md"
        );
    }
}
