//! Side-effecting adapters used by the loop runner.

pub mod agent;
pub mod checkpoint;
pub mod config;
pub mod control;
pub mod git;
pub mod init;
pub mod iteration_log;
pub mod observer;
pub mod process;
pub mod prompt;
pub mod tracker;
