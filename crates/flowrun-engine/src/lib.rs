//! Flow execution core
//!
//! - `action`: plugin action contract and registry
//! - `builtin`: `log`, `passthrough` and `http_request` actions
//! - `graph`: flow validation and guarded edge selection
//! - `context`: the services the engine is wired with
//! - `engine`: runs, suspensions and resumptions

pub mod action;
pub mod builtin;
pub mod context;
pub mod engine;
pub mod graph;

pub use action::{ActionContext, ActionError, ActionRegistry, BoxedAction, FnAction, PluginAction};
pub use context::EngineContext;
pub use engine::{event_wait_key, run_key, FlowEngine};
