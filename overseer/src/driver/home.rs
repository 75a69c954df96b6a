//! Sandboxed HOME directories for agent CLIs.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use tracing::{debug, warn};

/// Auth folders linked from the real home.
pub const AUTH_DIRS: [&str; 4] = [".claude", ".gemini", ".codex", ".config"];
/// Auth files copied from the real home.
pub const AUTH_FILES: [&str; 3] = [".claude.json", ".gemini.json", ".codex.json"];

/// Create `home` and, with `link_auth`, expose the real home's CLI credentials in it.
pub fn prepare_home(home: &Path, link_auth: bool, real_home: Option<&Path>) -> Result<()> {
    fs::create_dir_all(home).with_context(|| format!("create home {}", home.display()))?;
    let Some(real_home) = real_home.filter(|_| link_auth) else {
        return Ok(());
    };
    if real_home == home {
        return Ok(());
    }
    for name in AUTH_DIRS {
        let src = real_home.join(name);
        let dest = home.join(name);
        if !src.exists() || dest.symlink_metadata().is_ok() {
            continue;
        }
        if let Err(err) = link_dir(&src, &dest) {
            warn!(src = %src.display(), err = %err, "failed to link auth folder");
        } else {
            debug!(dest = %dest.display(), "linked auth folder");
        }
    }
    for name in AUTH_FILES {
        let src = real_home.join(name);
        if !src.is_file() {
            continue;
        }
        let dest = home.join(name);
        if let Err(err) = fs::copy(&src, &dest) {
            warn!(src = %src.display(), err = %err, "failed to copy auth file");
        }
    }
    Ok(())
}

#[cfg(unix)]
fn link_dir(src: &Path, dest: &Path) -> std::io::Result<()> {
    std::os::unix::fs::symlink(src, dest)
}

#[cfg(windows)]
fn link_dir(src: &Path, dest: &Path) -> std::io::Result<()> {
    std::os::windows::fs::symlink_dir(src, dest)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn links_folders_and_copies_files() {
        let real = tempfile::tempdir().expect("tempdir");
        fs::create_dir(real.path().join(".claude")).expect("mkdir");
        fs::write(real.path().join(".claude.json"), "{}").expect("write");
        let sandbox = tempfile::tempdir().expect("tempdir");
        let home = sandbox.path().join("brain_env");

        prepare_home(&home, true, Some(real.path())).expect("prepare");
        prepare_home(&home, true, Some(real.path())).expect("prepare twice");

        assert!(
            home.join(".claude")
                .symlink_metadata()
                .expect("meta")
                .file_type()
                .is_symlink()
        );
        assert!(!home.join(".gemini").exists());
        assert_eq!(
            fs::read_to_string(home.join(".claude.json")).expect("read"),
            "{}"
        );
    }

    #[test]
    fn link_auth_disabled_only_creates_dir() {
        let real = tempfile::tempdir().expect("tempdir");
        fs::create_dir(real.path().join(".codex")).expect("mkdir");
        let sandbox = tempfile::tempdir().expect("tempdir");
        let home = sandbox.path().join("env");
        prepare_home(&home, false, Some(real.path())).expect("prepare");
        assert!(home.is_dir());
        assert!(!home.join(".codex").exists());
    }
}
