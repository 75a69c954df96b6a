//! Deterministic, pure logic shared by the orchestrator.
//!
//! Core modules are free of I/O side effects. They operate on in-memory data
//! and return deterministic outputs suitable for tests.

pub mod commands;
pub mod compression;
pub mod confidence;
pub mod persona;
pub mod quota;
pub mod response;
pub mod sanitize;
pub mod self_check;
pub mod similarity;
pub mod transcript;
pub mod types;
