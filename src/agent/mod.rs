//! Agent module - turn-based loop over a provider and a tool executor.
//!
//! This module provides:
//! - AgentLoop for running a session until the model stops calling tools
//! - RunOptions for per-run model settings and the event observer

mod agent_loop;

pub use agent_loop::{AgentLoop, Observer, RunOptions};
