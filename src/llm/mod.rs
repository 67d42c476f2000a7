//! Provider layer - wire protocols reduced to one semantic event model
//!
//! This module provides:
//! - Conversation types (messages, content blocks, usage, requests)
//! - The `Stream` and `Provider` contracts and the shared block assembly
//! - SSE frame decoding
//! - Anthropic and Gemini adapters
//! - A scripted provider for tests and offline runs

pub mod anthropic;
pub mod event;
pub mod gemini;
pub mod mock;
pub mod sse;
pub mod stream;
pub mod types;

pub use anthropic::{AnthropicConfig, AnthropicProvider, AnthropicStream};
pub use event::Event;
pub use gemini::{GeminiChunk, GeminiConfig, GeminiProvider, GeminiStream};
pub use mock::{MockProvider, MockStream, MockTurn};
pub use sse::{ByteSource, SseDecoder, SseFrame};
pub use stream::{Assembly, Provider, Slot, Stream, StreamState};
pub use types::{
    AssistantMessage, BlockKind, ContentBlock, Message, Request, Role, Session, StopReason, ToolCall,
    ToolDefinition, ToolResult, ToolResultMessage, Usage, UsageUpdate, UserMessage,
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_module_exports() {
        let _role = Role::User;
        let _stop = StopReason::EndTurn;
        let _state = StreamState::New;
    }
}
