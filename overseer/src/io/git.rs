//! Git adapter for rollback, backup branches and worktree isolation.
//!
//! Every call shells out to `git` in a fixed working directory. Failures carry
//! the subcommand and git's own stderr.

use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use tracing::{debug, info, instrument, warn};

use crate::io::process::run_command_with_timeout;

const APPLY_TIMEOUT: Duration = Duration::from_secs(120);
const APPLY_OUTPUT_LIMIT: usize = 64 * 1024;

/// Git commands bound to one working directory.
#[derive(Debug, Clone)]
pub struct Git {
    dir: PathBuf,
}

impl Git {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Full HEAD sha, or `None` outside a repository or before the first commit.
    pub fn head_commit(&self) -> Option<String> {
        let output = self.raw(&["rev-parse", "--verify", "HEAD"]).ok()?;
        let sha = String::from_utf8_lossy(&output.stdout).trim().to_string();
        (output.status.success() && !sha.is_empty()).then_some(sha)
    }

    /// Anything modified, staged or untracked (ignored files excluded).
    pub fn is_dirty(&self) -> Result<bool> {
        Ok(!self.text(&["status", "--porcelain", "-uall"])?.trim().is_empty())
    }

    /// Create a branch at `commit` without checking it out.
    #[instrument(skip_all, fields(branch))]
    pub fn create_branch(&self, branch: &str, commit: &str) -> Result<()> {
        self.checked(&["branch", branch, commit])?;
        debug!(commit, "branch created");
        Ok(())
    }

    /// Reset the tree to `commit`; uncommitted work is stashed first so it stays recoverable.
    #[instrument(skip_all, fields(commit))]
    pub fn rollback_to(&self, commit: &str, stash_message: &str) -> Result<()> {
        if self.is_dirty()? {
            info!(stash = stash_message, "stashing uncommitted work before rollback");
            self.checked(&["stash", "push", "-u", "-m", stash_message])?;
        }
        self.checked(&["reset", "--hard", commit])?;
        warn!("tree reset");
        Ok(())
    }

    /// Detached worktree at `commit`; an existing directory is taken over.
    pub fn worktree_add(&self, path: &Path, commit: &str) -> Result<()> {
        self.checked(&["worktree", "add", "--force", "--detach", utf8(path)?, commit])?;
        Ok(())
    }

    pub fn worktree_remove(&self, path: &Path) -> Result<()> {
        self.checked(&["worktree", "remove", "--force", utf8(path)?])?;
        Ok(())
    }

    /// Stage everything in this tree and return its binary diff against `base`.
    pub fn staged_patch_since(&self, base: &str) -> Result<Vec<u8>> {
        self.checked(&["add", "-A"])?;
        Ok(self.checked(&["diff", "--cached", "--binary", base])?.stdout)
    }

    /// Apply a binary patch to this tree through `git apply` on stdin.
    #[instrument(skip_all, fields(patch_bytes = patch.len()))]
    pub fn apply_patch(&self, patch: &[u8]) -> Result<()> {
        if patch.is_empty() {
            debug!("empty patch");
            return Ok(());
        }
        let mut cmd = Command::new("git");
        cmd.args(["apply", "--binary", "-"]).current_dir(&self.dir);
        let output = run_command_with_timeout(cmd, Some(patch), APPLY_TIMEOUT, APPLY_OUTPUT_LIMIT)
            .context("run git apply")?;
        if !output.success() {
            bail!("git apply failed: {}", output.stderr_text().trim());
        }
        Ok(())
    }

    fn text(&self, args: &[&str]) -> Result<String> {
        Ok(String::from_utf8_lossy(&self.checked(args)?.stdout).into_owned())
    }

    fn checked(&self, args: &[&str]) -> Result<Output> {
        let output = self.raw(args)?;
        if !output.status.success() {
            bail!(
                "git {} failed: {}",
                args.first().copied().unwrap_or_default(),
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(output)
    }

    fn raw(&self, args: &[&str]) -> Result<Output> {
        Command::new("git")
            .args(args)
            .current_dir(&self.dir)
            .output()
            .with_context(|| format!("spawn git {} in {}", args.join(" "), self.dir.display()))
    }
}

fn utf8(path: &Path) -> Result<&str> {
    path.to_str()
        .ok_or_else(|| anyhow!("non-utf8 path {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::TestRepo;
    use std::fs;

    #[test]
    fn head_is_none_outside_repo() {
        let temp = tempfile::tempdir().expect("tempdir");
        assert_eq!(Git::new(temp.path()).head_commit(), None);
    }

    /// Verifies rollback stashes dirty work and restores the starting commit.
    #[test]
    fn rollback_restores_start_commit() {
        let repo = TestRepo::new();
        let git = Git::new(repo.path());
        let start = git.head_commit().expect("head");

        fs::write(repo.path().join("new.txt"), "x").expect("write");
        repo.git(&["add", "-A"]);
        repo.git(&["commit", "-q", "-m", "change"]);
        fs::write(repo.path().join("dirty.txt"), "y").expect("write");
        assert!(git.is_dirty().expect("status"));

        git.rollback_to(&start, "overseer rollback").expect("rollback");

        assert_eq!(git.head_commit().as_deref(), Some(start.as_str()));
        assert!(!repo.path().join("new.txt").exists());
        assert!(!repo.path().join("dirty.txt").exists());
        assert!(!git.is_dirty().expect("status"));
        assert!(repo.git(&["stash", "list"]).contains("overseer rollback"));
    }

    /// Verifies a worktree diff applies cleanly back onto the main tree.
    #[test]
    fn worktree_patch_applies_to_main_tree() {
        let repo = TestRepo::new();
        let git = Git::new(repo.path());
        let start = git.head_commit().expect("head");
        let scratch = tempfile::tempdir().expect("tempdir");
        let tree = scratch.path().join("wt");

        git.worktree_add(&tree, &start).expect("worktree add");
        fs::write(tree.join("feature.txt"), "hello\n").expect("write");
        let patch = Git::new(&tree).staged_patch_since(&start).expect("patch");
        assert!(!patch.is_empty());

        git.apply_patch(&patch).expect("apply");
        assert_eq!(
            fs::read_to_string(repo.path().join("feature.txt")).expect("read"),
            "hello\n"
        );
        git.worktree_remove(&tree).expect("remove");
        assert!(!tree.exists());
    }

    #[test]
    fn create_branch_does_not_checkout() {
        let repo = TestRepo::new();
        let git = Git::new(repo.path());
        let head = git.head_commit().expect("head");
        git.create_branch("overseer-backup-test", &head).expect("branch");
        let current = git
            .text(&["rev-parse", "--abbrev-ref", "HEAD"])
            .expect("branch");
        assert_ne!(current.trim(), "overseer-backup-test");
        assert!(!git.is_dirty().expect("status"));
    }
}
