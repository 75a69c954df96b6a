//! Side-effecting adapters: files, processes, git, clocks and signals.

pub mod approval;
pub mod clock;
pub mod config;
pub mod fs_util;
pub mod git;
pub mod init;
pub mod isolation;
pub mod lock;
pub mod memory;
pub mod metrics;
pub mod mission;
pub mod process;
pub mod qa;
pub mod reflexion;
pub mod run_state;
pub mod signal;
