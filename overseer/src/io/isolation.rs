//! Per-task workspaces for parallel and preview runs.
//!
//! A task either works on the shared project tree, in a detached git worktree,
//! or in a filtered copy of the project under `.overseer/squad/task_<id>`.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use glob::Pattern;
use tracing::{debug, info, instrument, warn};
use walkdir::WalkDir;

use crate::io::git::Git;

/// Directory names never copied into an isolated workspace.
pub const COPY_SKIP_DIRS: [&str; 6] = [
    ".git",
    ".overseer",
    "logs",
    "target",
    "__pycache__",
    "node_modules",
];

pub const IGNORE_FILE: &str = ".overseerignore";

/// Which isolation the run asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct IsolationPolicy {
    pub parallel: bool,
    pub use_worktrees: bool,
    pub preview_changes: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkspaceKind {
    /// The project tree itself.
    Shared,
    /// Detached worktree started at `start`.
    Worktree { start: String },
    /// Filtered copy, left for manual reconciliation.
    Copy,
}

#[derive(Debug, Clone)]
pub struct Workspace {
    pub kind: WorkspaceKind,
    /// Directory the agents run in.
    pub root: PathBuf,
    pub project_root: PathBuf,
}

impl Workspace {
    pub fn shared(project_root: &Path) -> Self {
        Self {
            kind: WorkspaceKind::Shared,
            root: project_root.to_path_buf(),
            project_root: project_root.to_path_buf(),
        }
    }

    pub fn is_shared(&self) -> bool {
        self.kind == WorkspaceKind::Shared
    }
}

/// Scratch directory for a task: `<overseer_dir>/squad/task_<id>`.
pub fn scratch_dir(overseer_dir: &Path, task_id: &str) -> PathBuf {
    let safe: String = task_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    overseer_dir.join("squad").join(format!("task_{safe}"))
}

/// Prepare the workspace a task should run in.
#[instrument(skip_all, fields(task_id))]
pub fn prepare(
    project_root: &Path,
    overseer_dir: &Path,
    task_id: &str,
    policy: IsolationPolicy,
) -> Result<Workspace> {
    let wants_worktree = if policy.parallel {
        policy.use_worktrees || policy.preview_changes
    } else {
        policy.preview_changes
    };
    if !policy.parallel && !wants_worktree {
        return Ok(Workspace::shared(project_root));
    }

    let dest = scratch_dir(overseer_dir, task_id);
    remove_dir_if_exists(&dest)?;
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
    }

    let git = Git::new(project_root);
    if wants_worktree && let Some(start) = git.head_commit() {
        match git.worktree_add(&dest, &start) {
            Ok(()) => {
                info!(path = %dest.display(), "task worktree ready");
                return Ok(Workspace {
                    kind: WorkspaceKind::Worktree { start },
                    root: dest,
                    project_root: project_root.to_path_buf(),
                });
            }
            Err(err) => {
                warn!(err = %format!("{err:#}"), "worktree creation failed, falling back to copy");
                remove_dir_if_exists(&dest)?;
            }
        }
    }

    if !policy.parallel {
        // Preview without a usable HEAD: nothing to diff against.
        return Ok(Workspace::shared(project_root));
    }
    let patterns = load_ignore_patterns(project_root)?;
    copy_filtered(project_root, &dest, &patterns)?;
    info!(path = %dest.display(), "task copy ready");
    Ok(Workspace {
        kind: WorkspaceKind::Copy,
        root: dest,
        project_root: project_root.to_path_buf(),
    })
}

/// Tear down a workspace, applying worktree changes back when `apply` is set.
///
/// Returns the size of the applied patch, if one was applied.
#[instrument(skip_all, fields(apply))]
pub fn finish(workspace: &Workspace, apply: bool) -> Result<Option<usize>> {
    match &workspace.kind {
        WorkspaceKind::Shared => Ok(None),
        WorkspaceKind::Copy => {
            info!(path = %workspace.root.display(), "copy workspace kept for manual review");
            Ok(None)
        }
        WorkspaceKind::Worktree { start } => {
            let main = Git::new(&workspace.project_root);
            let applied = if apply {
                let patch = Git::new(&workspace.root).staged_patch_since(start)?;
                main.apply_patch(&patch)?;
                info!(bytes = patch.len(), "worktree changes applied");
                Some(patch.len())
            } else {
                None
            };
            main.worktree_remove(&workspace.root)?;
            Ok(applied)
        }
    }
}

/// Patterns from `.overseerignore`: one glob per line, `#` comments.
pub fn load_ignore_patterns(project_root: &Path) -> Result<Vec<Pattern>> {
    let path = project_root.join(IGNORE_FILE);
    let contents = match fs::read_to_string(&path) {
        Ok(contents) => contents,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err).with_context(|| format!("read {}", path.display())),
    };
    let mut patterns = Vec::new();
    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        match Pattern::new(line) {
            Ok(pattern) => patterns.push(pattern),
            Err(err) => warn!(pattern = line, err = %err, "ignoring invalid ignore pattern"),
        }
    }
    Ok(patterns)
}

fn is_ignored(rel: &Path, patterns: &[Pattern]) -> bool {
    let name = rel
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    if COPY_SKIP_DIRS.contains(&name.as_str()) {
        return true;
    }
    let rel_str = rel.to_string_lossy();
    patterns
        .iter()
        .any(|p| p.matches(&rel_str) || p.matches(&name))
}

/// Copy `src` into `dest`, skipping VCS/scratch dirs and ignored paths.
pub fn copy_filtered(src: &Path, dest: &Path, patterns: &[Pattern]) -> Result<()> {
    fs::create_dir_all(dest).with_context(|| format!("create {}", dest.display()))?;
    let walker = WalkDir::new(src).follow_links(false).into_iter();
    for entry in walker.filter_entry(|e| {
        e.path()
            .strip_prefix(src)
            .map(|rel| rel.as_os_str().is_empty() || !is_ignored(rel, patterns))
            .unwrap_or(false)
    }) {
        let entry = entry.with_context(|| format!("walk {}", src.display()))?;
        let rel = entry
            .path()
            .strip_prefix(src)
            .map_err(|_| anyhow!("path escaped source root: {}", entry.path().display()))?;
        if rel.as_os_str().is_empty() {
            continue;
        }
        let target = dest.join(rel);
        let file_type = entry.file_type();
        if file_type.is_dir() {
            fs::create_dir_all(&target).with_context(|| format!("create {}", target.display()))?;
        } else if file_type.is_symlink() {
            copy_symlink(entry.path(), &target)?;
        } else {
            fs::copy(entry.path(), &target)
                .with_context(|| format!("copy {} -> {}", entry.path().display(), target.display()))?;
        }
    }
    debug!(src = %src.display(), dest = %dest.display(), "filtered copy complete");
    Ok(())
}

#[cfg(unix)]
fn copy_symlink(link: &Path, target: &Path) -> Result<()> {
    let points_to = fs::read_link(link).with_context(|| format!("read link {}", link.display()))?;
    std::os::unix::fs::symlink(&points_to, target)
        .with_context(|| format!("create link {}", target.display()))
}

#[cfg(not(unix))]
fn copy_symlink(link: &Path, target: &Path) -> Result<()> {
    fs::copy(link, target).with_context(|| format!("copy {}", link.display()))?;
    Ok(())
}

fn remove_dir_if_exists(path: &Path) -> Result<()> {
    match fs::remove_dir_all(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err).with_context(|| format!("remove {}", path.display())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::TestRepo;

    #[test]
    fn scratch_dir_sanitizes_ids() {
        assert_eq!(
            scratch_dir(Path::new("/p/.overseer"), "a/b c"),
            PathBuf::from("/p/.overseer/squad/task_a_b_c")
        );
    }

    /// Verifies copies skip scratch/VCS dirs and honor the ignore file.
    #[test]
    fn copy_honors_skip_dirs_and_ignore_file() {
        let src = tempfile::tempdir().expect("tempdir");
        let root = src.path();
        for dir in [".git", ".overseer", "node_modules/pkg", "src", "data"] {
            fs::create_dir_all(root.join(dir)).expect("mkdir");
        }
        fs::write(root.join(".git/HEAD"), "ref").expect("write");
        fs::write(root.join("node_modules/pkg/index.js"), "x").expect("write");
        fs::write(root.join("src/main.rs"), "fn main() {}").expect("write");
        fs::write(root.join("src/debug.log"), "noise").expect("write");
        fs::write(root.join("data/big.bin"), "bytes").expect("write");
        fs::write(root.join(IGNORE_FILE), "# comment\n\n*.log\ndata\n").expect("write");

        let dest = tempfile::tempdir().expect("tempdir");
        let patterns = load_ignore_patterns(root).expect("patterns");
        assert_eq!(patterns.len(), 2);
        copy_filtered(root, dest.path(), &patterns).expect("copy");

        assert!(dest.path().join("src/main.rs").exists());
        assert!(!dest.path().join("src/debug.log").exists());
        assert!(!dest.path().join("data").exists());
        assert!(!dest.path().join(".git").exists());
        assert!(!dest.path().join(".overseer").exists());
        assert!(!dest.path().join("node_modules").exists());
    }

    #[test]
    fn sequential_without_preview_is_shared() {
        let temp = tempfile::tempdir().expect("tempdir");
        let ws = prepare(
            temp.path(),
            &temp.path().join(".overseer"),
            "t1",
            IsolationPolicy::default(),
        )
        .expect("prepare");
        assert!(ws.is_shared());
        assert_eq!(finish(&ws, true).expect("finish"), None);
    }

    #[test]
    fn parallel_without_git_uses_copy() {
        let temp = tempfile::tempdir().expect("tempdir");
        fs::write(temp.path().join("a.txt"), "a").expect("write");
        let overseer = temp.path().join(".overseer");
        let ws = prepare(
            temp.path(),
            &overseer,
            "t1",
            IsolationPolicy {
                parallel: true,
                use_worktrees: true,
                preview_changes: false,
            },
        )
        .expect("prepare");
        assert_eq!(ws.kind, WorkspaceKind::Copy);
        assert!(ws.root.join("a.txt").exists());
        assert!(!ws.root.join(".overseer").exists());
    }

    /// Verifies preview mode runs in a worktree and applies its diff on finish.
    #[test]
    fn preview_worktree_applies_changes() {
        let repo = TestRepo::new();
        let overseer = repo.path().join(".overseer");
        let ws = prepare(
            repo.path(),
            &overseer,
            "t1",
            IsolationPolicy {
                parallel: false,
                use_worktrees: false,
                preview_changes: true,
            },
        )
        .expect("prepare");
        assert!(matches!(ws.kind, WorkspaceKind::Worktree { .. }));
        fs::write(ws.root.join("made.txt"), "made\n").expect("write");

        let applied = finish(&ws, true).expect("finish");
        assert!(applied.is_some_and(|bytes| bytes > 0));
        assert!(repo.path().join("made.txt").exists());
        assert!(!ws.root.exists());
    }
}
