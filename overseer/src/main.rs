//! `overseer`: run a mission file with planner, executor and critic agents.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tracing::{error, info};

use overseer::error::is_interrupted;
use overseer::exit_codes;
use overseer::io::approval::{Approver, AutoApprover, StdinApprover};
use overseer::io::clock::{Clock, ShutdownFlag, SystemClock};
use overseer::io::memory::MemoryStore;
use overseer::io::qa::CommandTestRunner;
use overseer::io::signal::install_ctrl_c_handler;
use overseer::logging;
use overseer::mission_run::{RegistryAgents, RunOptions, load_mission, render_plan, run_mission};
use overseer::task_loop::Services;

#[derive(Parser)]
#[command(
    name = "overseer",
    version,
    about = "Supervise CLI coding agents through a mission of tasks"
)]
struct Cli {
    /// Mission file (YAML, or TOML by extension).
    #[arg(default_value = "mission.yaml")]
    mission: PathBuf,

    /// Settings file; a missing file means defaults.
    #[arg(long, default_value = "settings.yaml")]
    settings: PathBuf,

    /// Load and validate, print the plan, run nothing.
    #[arg(long)]
    dry_run: bool,

    #[arg(long, default_value = "logs")]
    log_dir: PathBuf,

    /// Default log level; `RUST_LOG` wins when set.
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Produce review plans instead of executing tasks.
    #[arg(long)]
    reviewer: bool,

    /// Accept planner task breakdowns without asking.
    #[arg(long)]
    auto_approve_plan: bool,

    /// Accept destructive commands and patch application without asking.
    #[arg(long)]
    auto_approve_actions: bool,

    /// `PATTERN=PERSONA` rule, checked before settings rules. Repeatable.
    #[arg(long = "persona-map", value_name = "PATTERN=PERSONA")]
    persona_map: Vec<String>,

    /// Run blocked tasks again.
    #[arg(long)]
    retry_blocked: bool,
}

fn main() {
    let cli = Cli::parse();
    let code = match run(cli) {
        Ok(code) => code,
        Err(err) if is_interrupted(&err) => {
            eprintln!("{:#}", err);
            exit_codes::INTERRUPTED
        }
        Err(err) => {
            error!(err = %format!("{err:#}"), "overseer failed");
            eprintln!("{:#}", err);
            exit_codes::INVALID
        }
    };
    std::process::exit(code);
}

fn run(cli: Cli) -> Result<i32> {
    let options = RunOptions {
        mission_path: cli.mission,
        settings_path: cli.settings,
        log_dir: (!cli.dry_run).then(|| cli.log_dir.clone()),
        reviewer: cli.reviewer,
        retry_blocked: cli.retry_blocked,
        persona_map: cli.persona_map,
    };

    if cli.dry_run {
        logging::init(&cli.log_level, None)?;
        let loaded = load_mission(&options)?;
        print!("{}", render_plan(&loaded, &options)?);
        return Ok(exit_codes::OK);
    }

    if let Some(path) = logging::init(&cli.log_level, Some(&cli.log_dir))? {
        info!(path = %path.display(), "logging to file");
    }

    let shutdown = ShutdownFlag::new();
    install_ctrl_c_handler(shutdown.clone())?;
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let approver = |auto: bool| -> Arc<dyn Approver> {
        if auto {
            Arc::new(AutoApprover(true))
        } else {
            Arc::new(StdinApprover::new())
        }
    };
    let services = Services {
        clock: Arc::clone(&clock),
        actions: approver(cli.auto_approve_actions),
        plans: approver(cli.auto_approve_plan),
        tests: Arc::new(CommandTestRunner),
        shutdown,
        global_memory_dir: MemoryStore::default_global_dir(),
    };

    let outcome = run_mission(&options, &RegistryAgents::new(clock), services)?;
    let summary = &outcome.summary;
    println!(
        "{} task(s): {} done, {} blocked{}",
        summary.tasks.len(),
        summary.count("done"),
        summary.count("blocked"),
        if outcome.interrupted {
            ", interrupted (run again to resume)"
        } else {
            ""
        }
    );
    if let Some(path) = &outcome.summary_path {
        println!("summary: {}", path.display());
    }
    Ok(outcome.exit_code())
}
