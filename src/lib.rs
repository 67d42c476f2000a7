//! llm-relay - provider-agnostic streaming client for conversational LLMs
//!
//! Each provider's wire protocol is reduced to one semantic event model,
//! assembled into structured messages, and driven through a turn-based agent
//! loop that interleaves model responses with tool execution.

pub mod agent;
pub mod error;
pub mod id;
pub mod llm;
pub mod tools;

pub use error::{RelayError, Result};
