//! Core types and utilities for flowrun
//!
//! # Modules
//!
//! - `config`: Environment loading and engine configuration
//! - `error`: Error taxonomy and Result alias
//! - `flow`: Flow definitions (nodes, guarded edges, timer config)
//! - `run`: Flow run and per-node state
//! - `waiting`: Snapshot persisted while a node waits for an external event

pub mod config;
pub mod error;
pub mod flow;
pub mod run;
pub mod waiting;

// Re-exports
pub use config::EngineConfig;
pub use error::{Error, Result};
pub use flow::{
    CallbackConfig, Edge, EventConfig, ExecutionMode, FlowDefinition, NodeDefinition, RetryPolicy,
    TimerConfig, TimerKind, MAX_WAIT_SECS,
};
pub use run::{FlowRun, NodeState, NodeStatus, RunStatus, StepRecord, WaitKind};
pub use waiting::{deadline_after, remaining_until, WaitingState};
