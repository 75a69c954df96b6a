//! Ctrl-C handling.
//!
//! The orchestrator is synchronous, so a small current-thread tokio runtime
//! on a dedicated thread waits for the signal. The first Ctrl-C requests a
//! cooperative shutdown; a second one exits immediately.

use std::thread;

use anyhow::{Context, Result};
use tracing::{info, warn};

use crate::exit_codes;
use crate::io::clock::ShutdownFlag;

/// Spawn the signal listener thread.
pub fn install_ctrl_c_handler(shutdown: ShutdownFlag) -> Result<()> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("build signal runtime")?;
    thread::Builder::new()
        .name("overseer-signal".to_string())
        .spawn(move || {
            runtime.block_on(async move {
                loop {
                    if let Err(err) = tokio::signal::ctrl_c().await {
                        warn!(err = %err, "ctrl-c listener failed");
                        return;
                    }
                    if shutdown.is_requested() {
                        eprintln!("second interrupt, exiting now");
                        std::process::exit(exit_codes::INTERRUPTED);
                    }
                    info!("interrupt received, finishing current turn and saving state");
                    shutdown.request();
                }
            });
        })
        .context("spawn signal thread")?;
    Ok(())
}
