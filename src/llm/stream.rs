//! Stream contract shared by every provider adapter.
//!
//! A [`Stream`] is pulled one event at a time. Adapters keep their partial output
//! in an [`Assembly`], which owns the content-block arena and the lifecycle state
//! so that `message()` can hand back a snapshot at any point.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use super::event::Event;
use super::types::{AssistantMessage, BlockKind, ContentBlock, Request, StopReason, ToolCall, Usage};
use crate::error::{RelayError, Result};

/// Lifecycle of a stream. `Complete`, `Error` and `Closed` are terminal and sticky.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamState {
    #[default]
    New,
    Streaming,
    Complete,
    Error,
    Closed,
}

impl StreamState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, StreamState::Complete | StreamState::Error | StreamState::Closed)
    }
}

/// Pull-based stream of semantic events for one assistant turn.
///
/// Single accessor: every method takes `&mut self` or `&self` on one owner.
#[async_trait]
pub trait Stream: Send {
    /// Next semantic event, `Ok(None)` at end of stream, or the terminal error
    async fn next(&mut self) -> Result<Option<Event>>;

    fn state(&self) -> StreamState;

    /// Best-effort snapshot of the assistant message assembled so far
    fn message(&self) -> Result<AssistantMessage>;

    /// Release transport resources; aborts the turn if it has not finished
    async fn close(&mut self) -> Result<()>;
}

/// Entry point each adapter implements
#[async_trait]
pub trait Provider: Send + Sync {
    /// Short provider name for logs
    fn name(&self) -> &str;

    /// Open a stream for one turn. `cancel` is observed by every `next()` call.
    async fn stream(&self, cancel: CancellationToken, request: Request) -> Result<Box<dyn Stream>>;
}

/// Mutable state for one content block while it is being streamed
#[derive(Debug, Clone, Default, PartialEq)]
pub enum Slot {
    /// Placeholder for an index the wire has not started yet
    #[default]
    Empty,
    Text(String),
    Thinking {
        text: String,
        signature: Option<String>,
    },
    ToolCall {
        id: String,
        name: String,
        /// Raw argument fragments, not exposed until finalized
        partial_json: String,
        arguments: Option<String>,
        signature: Option<String>,
        /// Set once the arguments are final and the end event went out
        finished: bool,
    },
}

impl Slot {
    pub fn tool_call(id: impl Into<String>, name: impl Into<String>) -> Self {
        Slot::ToolCall {
            id: id.into(),
            name: name.into(),
            partial_json: String::new(),
            arguments: None,
            signature: None,
            finished: false,
        }
    }

    pub fn kind(&self) -> Option<BlockKind> {
        match self {
            Slot::Empty => None,
            Slot::Text(_) => Some(BlockKind::Text),
            Slot::Thinking { .. } => Some(BlockKind::Thinking),
            Slot::ToolCall { .. } => Some(BlockKind::ToolCall),
        }
    }

    /// Finalized or provisional call for a tool slot
    pub fn to_tool_call(&self) -> Option<ToolCall> {
        match self {
            Slot::ToolCall {
                id,
                name,
                arguments,
                signature,
                ..
            } => Some(ToolCall {
                id: id.clone(),
                name: name.clone(),
                arguments: arguments.clone().unwrap_or_else(|| "{}".to_string()),
                signature: signature.clone(),
            }),
            _ => None,
        }
    }

    fn to_block(&self) -> Option<ContentBlock> {
        match self {
            Slot::Empty => None,
            Slot::Text(text) => Some(ContentBlock::text(text.clone())),
            Slot::Thinking { text, signature } => Some(ContentBlock::thinking(text.clone(), signature.clone())),
            Slot::ToolCall { .. } => self.to_tool_call().map(ContentBlock::ToolCall),
        }
    }
}

/// How far past the current end a wire index may reach
pub const MAX_INDEX_GAP: usize = 1024;

/// Arena of content blocks plus lifecycle bookkeeping, owned by one stream
#[derive(Debug)]
pub struct Assembly {
    state: StreamState,
    received: bool,
    slots: Vec<Slot>,
    stop_reason: StopReason,
    raw_stop_reason: Option<String>,
    usage: Usage,
    timestamp: DateTime<Utc>,
    frozen: Option<AssistantMessage>,
}

impl Default for Assembly {
    fn default() -> Self {
        Self::new()
    }
}

impl Assembly {
    pub fn new() -> Self {
        Self {
            state: StreamState::New,
            received: false,
            slots: Vec::new(),
            stop_reason: StopReason::EndTurn,
            raw_stop_reason: None,
            usage: Usage::default(),
            timestamp: Utc::now(),
            frozen: None,
        }
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Move `New` to `Streaming`
    pub fn begin(&mut self) {
        if self.state == StreamState::New {
            self.state = StreamState::Streaming;
        }
    }

    /// Record that wire data arrived, enabling snapshots
    pub fn mark_received(&mut self) {
        self.received = true;
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Slot at a wire-supplied index, padding with empty slots as needed.
    ///
    /// Indices more than [`MAX_INDEX_GAP`] past the end are rejected.
    pub fn slot_mut(&mut self, index: usize) -> Result<&mut Slot> {
        if index >= self.slots.len() {
            let limit = self.slots.len().saturating_add(MAX_INDEX_GAP);
            let len = index
                .checked_add(1)
                .filter(|_| index < limit)
                .ok_or_else(|| RelayError::Protocol(format!("content block index {} out of range", index)))?;
            self.slots.resize(len, Slot::Empty);
        }
        Ok(&mut self.slots[index])
    }

    pub fn slot(&self, index: usize) -> Option<&Slot> {
        self.slots.get(index)
    }

    /// Append a slot and return its index
    pub fn push(&mut self, slot: Slot) -> usize {
        self.slots.push(slot);
        self.slots.len() - 1
    }

    pub fn last_kind(&self) -> Option<BlockKind> {
        self.slots.last().and_then(Slot::kind)
    }

    pub fn last_mut(&mut self) -> Option<&mut Slot> {
        self.slots.last_mut()
    }

    pub fn has_tool_calls(&self) -> bool {
        self.slots.iter().any(|s| matches!(s, Slot::ToolCall { .. }))
    }

    pub fn stop_reason(&self) -> StopReason {
        self.stop_reason
    }

    pub fn set_stop_reason(&mut self, reason: StopReason, raw: Option<String>) {
        self.stop_reason = reason;
        if raw.is_some() {
            self.raw_stop_reason = raw;
        }
    }

    pub fn usage(&self) -> Usage {
        self.usage
    }

    pub fn usage_mut(&mut self) -> &mut Usage {
        &mut self.usage
    }

    /// Finish normally. No effect once terminal.
    pub fn complete(&mut self) {
        if !self.is_terminal() {
            self.state = StreamState::Complete;
        }
    }

    /// Finish with an error; `reason` distinguishes `Error` from `Aborted`
    pub fn fail(&mut self, reason: StopReason) {
        if !self.is_terminal() {
            self.state = StreamState::Error;
            self.stop_reason = reason;
        }
    }

    /// Record a terminal error, picking `Aborted` when cancellation caused it
    pub fn fail_with(&mut self, err: RelayError, cancel: &CancellationToken) -> RelayError {
        if err.is_cancelled() || cancel.is_cancelled() {
            self.fail(StopReason::Aborted);
            RelayError::Cancelled
        } else {
            self.fail(StopReason::Error);
            err
        }
    }

    /// Force `Closed` unless already terminal, then drop the arena
    pub fn close(&mut self) {
        if !self.is_terminal() {
            self.state = StreamState::Closed;
            self.stop_reason = StopReason::Aborted;
        }
        if self.frozen.is_none() {
            self.frozen = Some(self.build());
            self.slots = Vec::new();
        }
    }

    fn build(&self) -> AssistantMessage {
        AssistantMessage {
            content: self.slots.iter().filter_map(Slot::to_block).collect(),
            stop_reason: self.stop_reason,
            raw_stop_reason: self.raw_stop_reason.clone(),
            usage: self.usage,
            timestamp: self.timestamp,
        }
    }

    /// Snapshot of the message so far
    pub fn snapshot(&self) -> Result<AssistantMessage> {
        if let Some(frozen) = &self.frozen {
            return Ok(frozen.clone());
        }
        if !self.received && !self.is_terminal() {
            return Err(RelayError::NoData);
        }
        Ok(self.build())
    }
}
