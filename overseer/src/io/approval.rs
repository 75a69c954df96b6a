//! Interactive approvals (plans, destructive commands, patches).

use std::io::{self, BufRead, Write};
use std::sync::Mutex;

use tracing::warn;

pub trait Approver: Send + Sync {
    /// Ask a yes/no question; anything other than yes is a no.
    fn confirm(&self, prompt: &str) -> bool;
}

/// Prompts on stderr and reads one line from stdin.
///
/// Prompts are serialized so parallel workers never interleave questions.
#[derive(Default)]
pub struct StdinApprover {
    gate: Mutex<()>,
}

impl StdinApprover {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Approver for StdinApprover {
    fn confirm(&self, prompt: &str) -> bool {
        let _guard = match self.gate.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let mut stderr = io::stderr().lock();
        if write!(stderr, "{prompt} [y/N] ").and_then(|_| stderr.flush()).is_err() {
            return false;
        }
        let mut line = String::new();
        if let Err(err) = io::stdin().lock().read_line(&mut line) {
            warn!(err = %err, "failed to read approval, treating as no");
            return false;
        }
        is_yes(&line)
    }
}

/// Fixed answer, for `--auto-approve-*` flags.
pub struct AutoApprover(pub bool);

impl Approver for AutoApprover {
    fn confirm(&self, _prompt: &str) -> bool {
        self.0
    }
}

pub fn is_yes(answer: &str) -> bool {
    matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes")
}
