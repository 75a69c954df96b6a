//! Supervisor for external CLI coding agents.
//!
//! A mission file lists tasks; for each task the overseer runs an
//! observe-orient-decide-act loop in which a planning agent picks the next
//! instruction and an execution agent carries it out. Completion claims must
//! pass quality gates before a task is marked done. The crate is split the
//! same way throughout:
//!
//! - **[`core`]**: Pure, deterministic logic (parsing, classification, gates,
//!   compression, quota math). No I/O, fully testable in isolation.
//! - **[`io`]**: Side-effecting adapters (files, locks, git, processes,
//!   clocks, signals).
//! - **[`driver`]**: Agent CLI backends behind the [`driver::Driver`] trait.
//! - **[`agents`]**: Planner, executor and critic roles plus prompt templates.
//!
//! Orchestration lives in [`task_loop`] (one task) and [`mission_run`]
//! (the whole mission, sequential or parallel).

pub mod agents;
pub mod core;
pub mod driver;
pub mod error;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod mission_run;
pub mod task_loop;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
