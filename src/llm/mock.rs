//! Scripted in-memory provider
//!
//! Each call to `stream` pops the next [`MockTurn`] and replays its content as
//! semantic events. Every request is recorded so tests can inspect what the
//! agent loop sent.

use std::collections::VecDeque;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::error::{RelayError, Result};
use crate::llm::event::Event;
use crate::llm::stream::{Assembly, Provider, Slot, Stream, StreamState};
use crate::llm::types::{AssistantMessage, ContentBlock, Request, StopReason, ToolCall, Usage};

/// One scripted assistant turn
#[derive(Debug, Clone, Default)]
pub struct MockTurn {
    pub content: Vec<ContentBlock>,
    /// Defaults to `ToolUse` when the turn contains calls, `EndTurn` otherwise
    pub stop_reason: Option<StopReason>,
    pub usage: Usage,
    /// Transport failure raised after all content has been replayed
    pub failure: Option<String>,
}

impl MockTurn {
    pub fn new(content: Vec<ContentBlock>) -> Self {
        Self {
            content,
            ..Default::default()
        }
    }

    pub fn text(text: impl Into<String>) -> Self {
        Self::new(vec![ContentBlock::text(text)])
    }

    pub fn tool_call(call: ToolCall) -> Self {
        Self::new(vec![ContentBlock::ToolCall(call)])
    }

    pub fn with_stop_reason(mut self, reason: StopReason) -> Self {
        self.stop_reason = Some(reason);
        self
    }

    pub fn with_usage(mut self, usage: Usage) -> Self {
        self.usage = usage;
        self
    }

    pub fn with_failure(mut self, message: impl Into<String>) -> Self {
        self.failure = Some(message.into());
        self
    }
}

/// Provider that replays scripted turns in order
#[derive(Debug, Default)]
pub struct MockProvider {
    turns: Mutex<VecDeque<MockTurn>>,
    requests: Mutex<Vec<Request>>,
}

impl MockProvider {
    pub fn new(turns: Vec<MockTurn>) -> Self {
        Self {
            turns: Mutex::new(turns.into()),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Requests received so far, in order
    pub async fn requests(&self) -> Vec<Request> {
        self.requests.lock().await.clone()
    }

    pub async fn remaining(&self) -> usize {
        self.turns.lock().await.len()
    }
}

#[async_trait]
impl Provider for MockProvider {
    fn name(&self) -> &str {
        "mock"
    }

    async fn stream(&self, cancel: CancellationToken, request: Request) -> Result<Box<dyn Stream>> {
        request.validate()?;
        self.requests.lock().await.push(request);

        let turn = self.turns.lock().await.pop_front().ok_or_else(|| RelayError::Provider {
            kind: "mock".to_string(),
            message: "no scripted turns left".to_string(),
        })?;

        Ok(Box::new(MockStream::new(turn, cancel)))
    }
}

/// Stream replaying one [`MockTurn`]
pub struct MockStream {
    blocks: VecDeque<ContentBlock>,
    events: VecDeque<Event>,
    stop_reason: Option<StopReason>,
    usage: Usage,
    failure: Option<String>,
    cancel: CancellationToken,
    assembly: Assembly,
}

impl MockStream {
    pub fn new(turn: MockTurn, cancel: CancellationToken) -> Self {
        Self {
            blocks: turn.content.into(),
            events: VecDeque::new(),
            stop_reason: turn.stop_reason,
            usage: turn.usage,
            failure: turn.failure,
            cancel,
            assembly: Assembly::new(),
        }
    }

    fn replay(&mut self, block: ContentBlock) {
        self.assembly.mark_received();
        match block {
            ContentBlock::Text { text } => {
                let index = self.assembly.push(Slot::Text(text.clone()));
                if !text.is_empty() {
                    self.events.push_back(Event::TextDelta { index, delta: text });
                }
            }
            ContentBlock::Thinking { text, signature } => {
                let index = self.assembly.push(Slot::Thinking {
                    text: text.clone(),
                    signature,
                });
                if !text.is_empty() {
                    self.events.push_back(Event::ThinkingDelta { index, delta: text });
                }
            }
            ContentBlock::ToolCall(call) => {
                self.assembly.push(Slot::ToolCall {
                    id: call.id.clone(),
                    name: call.name.clone(),
                    partial_json: call.arguments.clone(),
                    arguments: Some(call.arguments.clone()),
                    signature: call.signature.clone(),
                    finished: true,
                });
                self.events.push_back(Event::ToolCallBegin {
                    id: call.id.clone(),
                    name: call.name.clone(),
                });
                self.events.push_back(Event::ToolCallDelta {
                    id: call.id.clone(),
                    delta: call.arguments.clone(),
                });
                self.events.push_back(Event::ToolCallEnd { call });
            }
            ContentBlock::Image { .. } => {
                log::warn!("mock: assistant turns cannot carry images, skipping");
            }
        }
    }
}

#[async_trait]
impl Stream for MockStream {
    async fn next(&mut self) -> Result<Option<Event>> {
        loop {
            if let Some(event) = self.events.pop_front() {
                return Ok(Some(event));
            }
            if self.assembly.is_terminal() {
                return Ok(None);
            }
            if self.cancel.is_cancelled() {
                return Err(self.assembly.fail_with(RelayError::Cancelled, &self.cancel));
            }
            self.assembly.begin();

            if let Some(block) = self.blocks.pop_front() {
                self.replay(block);
                continue;
            }

            *self.assembly.usage_mut() = self.usage;
            if let Some(message) = self.failure.take() {
                return Err(self.assembly.fail_with(RelayError::Transport(message), &self.cancel));
            }

            let reason = self.stop_reason.unwrap_or(if self.assembly.has_tool_calls() {
                StopReason::ToolUse
            } else {
                StopReason::EndTurn
            });
            self.assembly.set_stop_reason(reason, None);
            self.assembly.complete();
            return Ok(None);
        }
    }

    fn state(&self) -> StreamState {
        self.assembly.state()
    }

    fn message(&self) -> Result<AssistantMessage> {
        self.assembly.snapshot()
    }

    async fn close(&mut self) -> Result<()> {
        self.blocks.clear();
        self.events.clear();
        self.assembly.close();
        Ok(())
    }
}
