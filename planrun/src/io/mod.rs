//! Side-effecting operations: filesystem state, process execution,
//! environment sources and metadata tree loading. Isolated from `core`
//! so the pure logic stays testable without I/O.

pub mod config;
pub mod env;
pub mod process;
pub mod run_log;
pub mod state;
pub mod tree_store;
pub mod worktree;
