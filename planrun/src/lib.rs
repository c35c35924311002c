//! Test-management orchestrator over declarative metadata trees.
//!
//! Given a tree of test/plan/story metadata, planrun selects matching
//! items, runs each selected plan through the fixed pipeline of stages
//! (discover, provision, prepare, execute, report, finish) and reconciles
//! heterogeneous test outcomes into a uniform result model with a
//! deterministic process exit code. The architecture enforces a strict
//! separation:
//!
//! - **[`core`]**: Pure, deterministic logic (identity and links, entities,
//!   query engine, result interpretation). No I/O, fully testable in
//!   isolation.
//! - **[`io`]**: Side-effecting operations (state files, processes,
//!   environment sources, tree loading). Isolated to enable faking in
//!   tests.
//!
//! Orchestration modules ([`run`], [`plan`], [`steps`], [`status`])
//! coordinate core logic with I/O; runs are resumable from their workdir
//! at any point.

pub mod core;
pub mod errors;
pub mod exit_codes;
pub mod guest;
pub mod io;
pub mod logging;
pub mod plan;
pub mod run;
pub mod status;
pub mod steps;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
pub mod tree;
