//! Executor role: carries out planner instructions in the workspace.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;
use tracing::{info, instrument};

use crate::core::quota::reply_rate_limited;
use crate::core::sanitize::clean_output;
use crate::core::types::ExecOutcome;
use crate::driver::{Driver, DriverRequest};

/// One executor turn.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerTurn {
    pub outcome: ExecOutcome,
    /// Raw text, kept for the quota scheduler when `rate_limited` is set.
    pub raw: String,
    pub rate_limited: bool,
}

pub struct Worker {
    driver: Arc<dyn Driver>,
}

impl Worker {
    pub fn new(driver: Arc<dyn Driver>) -> Self {
        Self { driver }
    }

    #[instrument(skip_all, fields(driver = %self.driver.name()))]
    pub fn run(
        &self,
        instruction: &str,
        workdir: &Path,
        system_prompt_file: Option<PathBuf>,
    ) -> Result<WorkerTurn> {
        let request = DriverRequest {
            prompt: instruction.to_string(),
            workdir: workdir.to_path_buf(),
            system_prompt_file,
            merge_stderr: true,
        };
        let response = self.driver.invoke(&request)?;
        let rate_limited = reply_rate_limited(&response.output, response.is_success());
        let cleaned = clean_output(&response.output);
        info!(
            exit_code = response.exit_code,
            timed_out = response.timed_out,
            output_chars = cleaned.chars().count(),
            rate_limited,
            "executor finished"
        );
        Ok(WorkerTurn {
            outcome: ExecOutcome::from_process(response.exit_code, response.timed_out, cleaned),
            raw: response.output,
            rate_limited,
        })
    }
}

/// Claims of completion that the executor sometimes volunteers.
pub fn claims_completion(output: &str) -> bool {
    let lower = output.to_lowercase();
    lower.contains("task status: completed") || output.contains('\u{2705}')
}
