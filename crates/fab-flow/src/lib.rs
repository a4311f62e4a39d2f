//! Flow execution engine: the flowgraph model, built-in combinators,
//! tool adapter registry, per-task runner, and the run orchestrator.

pub mod builtins;
pub mod check;
pub mod graph;
pub mod logscan;
pub mod orchestrator;
pub mod record;
pub mod runner;
pub mod tools;

use thiserror::Error;

/// Errors surfaced by flow setup and execution.
#[derive(Debug, Error)]
pub enum FlowError {
    /// A task stopped before completion; the reason has been logged.
    #[error("halted: {0}")]
    Halt(String),

    #[error("manifest check failed with {0} error(s)")]
    CheckFailed(usize),

    #[error("flowgraph error: {0}")]
    Graph(String),

    #[error("unknown plug-in '{0}'")]
    UnknownPlugin(String),

    #[error("tool error: {0}")]
    Tool(String),

    #[error("run failed: {0}")]
    Run(String),

    #[error(transparent)]
    Schema(#[from] fab_core::SchemaError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// A schedulable unit: one `(step, index)` pair.
pub type Task = (String, String);

/// Key used for a task in the shared status board.
pub fn task_id(step: &str, index: &str) -> String {
    format!("{}{}", step, index)
}
