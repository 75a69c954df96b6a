//! Exclusive file lock guarding the mission file and run state.
//!
//! The lock is a sibling file created with `create_new`, so acquisition is
//! atomic across threads and processes. It is released when the guard drops.

use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant, SystemTime};

use anyhow::{Context, Result};
use chrono::Utc;
use tracing::{debug, warn};

use crate::error::OverseerError;

/// Timing knobs for lock acquisition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockOptions {
    pub timeout: Duration,
    pub poll: Duration,
    /// Lock files older than this are considered abandoned.
    pub stale_after: Duration,
}

impl Default for LockOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            poll: Duration::from_millis(50),
            stale_after: Duration::from_secs(600),
        }
    }
}

/// `<path>.lock` next to the guarded file.
pub fn lock_path_for(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".lock");
    path.with_file_name(name)
}

/// Held lock; the lock file is removed on drop.
#[derive(Debug)]
pub struct FileLock {
    path: PathBuf,
}

impl FileLock {
    /// Acquire the lock guarding `target`, polling until `options.timeout`.
    pub fn acquire(target: &Path, options: &LockOptions) -> Result<Self> {
        let path = lock_path_for(target);
        let started = Instant::now();
        loop {
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(mut file) => {
                    let stamp = format!("{} {}\n", std::process::id(), Utc::now().to_rfc3339());
                    file.write_all(stamp.as_bytes())
                        .with_context(|| format!("write lock {}", path.display()))?;
                    debug!(path = %path.display(), "lock acquired");
                    return Ok(Self { path });
                }
                Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                    if is_stale(&path, options.stale_after) {
                        warn!(path = %path.display(), "removing stale lock");
                        if let Err(err) = fs::remove_file(&path)
                            && err.kind() != ErrorKind::NotFound
                        {
                            return Err(err)
                                .with_context(|| format!("remove stale lock {}", path.display()));
                        }
                        continue;
                    }
                    let waited = started.elapsed();
                    if waited >= options.timeout {
                        return Err(OverseerError::LockTimeout {
                            path: path.display().to_string(),
                            waited,
                        }
                        .into());
                    }
                    thread::sleep(options.poll);
                }
                Err(err) => {
                    return Err(err).with_context(|| format!("create lock {}", path.display()));
                }
            }
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        if let Err(err) = fs::remove_file(&self.path)
            && err.kind() != ErrorKind::NotFound
        {
            warn!(path = %self.path.display(), err = %err, "failed to release lock");
        }
    }
}

fn is_stale(path: &Path, stale_after: Duration) -> bool {
    let Ok(modified) = fs::metadata(path).and_then(|meta| meta.modified()) else {
        return false;
    };
    SystemTime::now()
        .duration_since(modified)
        .is_ok_and(|age| age > stale_after)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn fast() -> LockOptions {
        LockOptions {
            timeout: Duration::from_millis(200),
            poll: Duration::from_millis(5),
            stale_after: Duration::from_secs(600),
        }
    }

    #[test]
    fn lock_path_appends_suffix() {
        assert_eq!(
            lock_path_for(Path::new("/tmp/mission.yaml")),
            PathBuf::from("/tmp/mission.yaml.lock")
        );
    }

    /// Verifies a held lock makes a second acquisition time out, and drop releases it.
    #[test]
    fn second_acquire_times_out_until_release() {
        let temp = tempfile::tempdir().expect("tempdir");
        let target = temp.path().join("mission.yaml");

        let first = FileLock::acquire(&target, &fast()).expect("first");
        assert!(first.path().exists());

        let err = FileLock::acquire(&target, &fast()).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<OverseerError>(),
            Some(OverseerError::LockTimeout { .. })
        ));

        drop(first);
        assert!(!lock_path_for(&target).exists());
        FileLock::acquire(&target, &fast()).expect("after release");
    }

    #[test]
    fn stale_lock_is_reclaimed() {
        let temp = tempfile::tempdir().expect("tempdir");
        let target = temp.path().join("mission.yaml");
        fs::write(lock_path_for(&target), "999 old\n").expect("write");

        let options = LockOptions {
            stale_after: Duration::ZERO,
            ..fast()
        };
        thread::sleep(Duration::from_millis(20));
        FileLock::acquire(&target, &options).expect("reclaim");
    }

    /// Verifies concurrent holders never overlap.
    #[test]
    fn concurrent_holders_are_exclusive() {
        let temp = tempfile::tempdir().expect("tempdir");
        let target = temp.path().join("mission.yaml");
        let inside = Arc::new(AtomicUsize::new(0));
        let options = LockOptions {
            timeout: Duration::from_secs(10),
            ..fast()
        };

        thread::scope(|scope| {
            for _ in 0..4 {
                let inside = Arc::clone(&inside);
                let target = target.clone();
                scope.spawn(move || {
                    for _ in 0..5 {
                        let _guard = FileLock::acquire(&target, &options).expect("acquire");
                        assert_eq!(inside.fetch_add(1, Ordering::SeqCst), 0);
                        thread::sleep(Duration::from_millis(2));
                        inside.fetch_sub(1, Ordering::SeqCst);
                    }
                });
            }
        });
    }
}
