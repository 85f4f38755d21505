//! Side effects: the session store, child processes, sub-agents and servers.

pub mod agent;
pub mod artifacts;
pub mod config;
pub mod interrupt;
pub mod iteration_log;
pub mod process;
pub mod prompt;
pub mod server;
pub mod session_store;
