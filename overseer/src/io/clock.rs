//! Wall clock and sleeping, injectable for tests.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use anyhow::Result;
use chrono::{Local, NaiveDateTime};
use tracing::info;

use crate::core::quota::QuotaWait;
use crate::error::OverseerError;

pub trait Clock: Send + Sync {
    /// Local wall-clock time.
    fn now(&self) -> NaiveDateTime;
    fn sleep(&self, duration: Duration);
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> NaiveDateTime {
        Local::now().naive_local()
    }

    fn sleep(&self, duration: Duration) {
        thread::sleep(duration);
    }
}

/// Cooperative interruption flag shared by every worker.
#[derive(Debug, Clone, Default)]
pub struct ShutdownFlag(Arc<AtomicBool>);

impl ShutdownFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_requested(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Error out with [`OverseerError::Interrupted`] once shutdown is requested.
    pub fn check(&self) -> Result<()> {
        if self.is_requested() {
            return Err(OverseerError::Interrupted.into());
        }
        Ok(())
    }
}

/// Sleep until `wait.target` in chunks of at most `max_chunk`.
///
/// Re-reads the clock between chunks and stops early on shutdown.
pub fn sleep_until(
    clock: &dyn Clock,
    wait: &QuotaWait,
    max_chunk: Duration,
    shutdown: &ShutdownFlag,
) -> Result<()> {
    let max_chunk = max_chunk.max(Duration::from_secs(1));
    loop {
        shutdown.check()?;
        let remaining = wait.remaining(clock.now());
        if remaining.is_zero() {
            return Ok(());
        }
        let chunk = remaining.min(max_chunk);
        info!(
            remaining_secs = remaining.as_secs(),
            resume_at = %wait.target,
            "waiting for quota reset"
        );
        clock.sleep(chunk);
    }
}
