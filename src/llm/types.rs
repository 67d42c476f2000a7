//! Conversation types shared by every provider adapter
//!
//! Messages, content blocks, token usage, requests and the caller-owned session.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{RelayError, Result};
use crate::id::generate_session_id;

/// Role in a conversation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
    ToolResult,
}

/// Normalize a raw tool-argument payload.
///
/// Empty or whitespace-only payloads become `{}`; anything else must parse as JSON.
pub fn normalize_arguments(raw: &str) -> Result<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Ok("{}".to_string());
    }
    serde_json::from_str::<Value>(trimmed)
        .map_err(|e| RelayError::Protocol(format!("invalid tool arguments: {}", e)))?;
    Ok(trimmed.to_string())
}

/// A tool call requested by the model
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    /// Raw JSON argument object
    pub arguments: String,
    /// Opaque provider signature bound to this call
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
}

impl ToolCall {
    /// Create a new tool call; an empty argument payload becomes `{}`
    pub fn new(id: impl Into<String>, name: impl Into<String>, arguments: impl Into<String>) -> Self {
        let arguments = arguments.into();
        Self {
            id: id.into(),
            name: name.into(),
            arguments: if arguments.trim().is_empty() {
                "{}".to_string()
            } else {
                arguments
            },
            signature: None,
        }
    }

    pub fn with_signature(mut self, signature: impl Into<String>) -> Self {
        self.signature = Some(signature.into());
        self
    }

    /// Parsed argument object
    pub fn input(&self) -> Result<Value> {
        Ok(serde_json::from_str(&self.arguments)?)
    }
}

/// Discriminant of a [`ContentBlock`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockKind {
    Text,
    Thinking,
    Image,
    ToolCall,
}

/// One addressable unit of message content
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    Thinking {
        text: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        signature: Option<String>,
    },
    Image {
        /// Base64-encoded image bytes
        data: String,
        mime_type: String,
    },
    ToolCall(ToolCall),
}

impl ContentBlock {
    pub fn text(text: impl Into<String>) -> Self {
        ContentBlock::Text { text: text.into() }
    }

    pub fn thinking(text: impl Into<String>, signature: Option<String>) -> Self {
        ContentBlock::Thinking {
            text: text.into(),
            signature,
        }
    }

    pub fn image(data: impl Into<String>, mime_type: impl Into<String>) -> Self {
        ContentBlock::Image {
            data: data.into(),
            mime_type: mime_type.into(),
        }
    }

    pub fn kind(&self) -> BlockKind {
        match self {
            ContentBlock::Text { .. } => BlockKind::Text,
            ContentBlock::Thinking { .. } => BlockKind::Thinking,
            ContentBlock::Image { .. } => BlockKind::Image,
            ContentBlock::ToolCall(_) => BlockKind::ToolCall,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            ContentBlock::Text { text } => Some(text),
            _ => None,
        }
    }

    pub fn as_tool_call(&self) -> Option<&ToolCall> {
        match self {
            ContentBlock::ToolCall(call) => Some(call),
            _ => None,
        }
    }
}

/// Reason why the model stopped generating
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    #[default]
    EndTurn,
    Length,
    ToolUse,
    Error,
    Aborted,
    Unknown,
}

impl StopReason {
    /// Check if the stop reason indicates more work is needed
    pub fn needs_continuation(&self) -> bool {
        matches!(self, StopReason::ToolUse)
    }
}

/// Token usage statistics
///
/// `input_tokens` excludes cached tokens; the full prompt is
/// `input_tokens + cache_read_tokens + cache_write_tokens`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_read_tokens: u64,
    pub cache_write_tokens: u64,
}

/// A usage report where each field may be absent or null
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UsageUpdate {
    pub input_tokens: Option<u64>,
    pub output_tokens: Option<u64>,
    pub cache_read_tokens: Option<u64>,
    pub cache_write_tokens: Option<u64>,
}

impl Usage {
    pub fn new(input_tokens: u64, output_tokens: u64) -> Self {
        Self {
            input_tokens,
            output_tokens,
            ..Default::default()
        }
    }

    /// Build usage from a prompt count that already includes cached tokens
    pub fn from_inclusive_prompt(prompt_tokens: u64, cached_tokens: u64, output_tokens: u64) -> Self {
        Self {
            input_tokens: prompt_tokens.saturating_sub(cached_tokens),
            output_tokens,
            cache_read_tokens: cached_tokens,
            cache_write_tokens: 0,
        }
    }

    /// Total prompt-side consumption
    pub fn total_input(&self) -> u64 {
        self.input_tokens
            .saturating_add(self.cache_read_tokens)
            .saturating_add(self.cache_write_tokens)
    }

    pub fn total(&self) -> u64 {
        self.total_input().saturating_add(self.output_tokens)
    }

    /// Merge a cumulative report. Absent fields keep their value and counts never decrease.
    pub fn merge(&mut self, update: &UsageUpdate) {
        fn apply(field: &mut u64, value: Option<u64>) {
            if let Some(v) = value {
                *field = (*field).max(v);
            }
        }
        apply(&mut self.input_tokens, update.input_tokens);
        apply(&mut self.output_tokens, update.output_tokens);
        apply(&mut self.cache_read_tokens, update.cache_read_tokens);
        apply(&mut self.cache_write_tokens, update.cache_write_tokens);
    }

    /// Accumulate usage from another turn
    pub fn add(&mut self, other: &Usage) {
        self.input_tokens = self.input_tokens.saturating_add(other.input_tokens);
        self.output_tokens = self.output_tokens.saturating_add(other.output_tokens);
        self.cache_read_tokens = self.cache_read_tokens.saturating_add(other.cache_read_tokens);
        self.cache_write_tokens = self.cache_write_tokens.saturating_add(other.cache_write_tokens);
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserMessage {
    pub content: Vec<ContentBlock>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssistantMessage {
    pub content: Vec<ContentBlock>,
    pub stop_reason: StopReason,
    /// Provider's own stop reason string, when one was reported
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_stop_reason: Option<String>,
    pub usage: Usage,
    pub timestamp: DateTime<Utc>,
}

impl AssistantMessage {
    pub fn new(content: Vec<ContentBlock>, stop_reason: StopReason) -> Self {
        Self {
            content,
            stop_reason,
            raw_stop_reason: None,
            usage: Usage::default(),
            timestamp: Utc::now(),
        }
    }

    /// All tool calls in content order
    pub fn tool_calls(&self) -> Vec<&ToolCall> {
        self.content.iter().filter_map(ContentBlock::as_tool_call).collect()
    }

    /// Concatenated text of all text blocks
    pub fn text(&self) -> String {
        self.content.iter().filter_map(ContentBlock::as_text).collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResultMessage {
    pub tool_call_id: String,
    pub tool_name: String,
    pub content: Vec<ContentBlock>,
    pub is_error: bool,
    pub timestamp: DateTime<Utc>,
}

/// A message in the conversation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "snake_case")]
pub enum Message {
    User(UserMessage),
    Assistant(AssistantMessage),
    ToolResult(ToolResultMessage),
}

impl Message {
    /// Create a user message with a single text block
    pub fn user(text: impl Into<String>) -> Self {
        Message::User(UserMessage {
            content: vec![ContentBlock::text(text)],
            timestamp: Utc::now(),
        })
    }

    /// Create an assistant message with a single text block
    pub fn assistant(text: impl Into<String>) -> Self {
        Message::Assistant(AssistantMessage::new(vec![ContentBlock::text(text)], StopReason::EndTurn))
    }

    /// Create a tool result message correlated with a call
    pub fn tool_result(call: &ToolCall, result: ToolResult) -> Self {
        Message::ToolResult(ToolResultMessage {
            tool_call_id: call.id.clone(),
            tool_name: call.name.clone(),
            content: result.content,
            is_error: result.is_error,
            timestamp: Utc::now(),
        })
    }

    pub fn role(&self) -> Role {
        match self {
            Message::User(_) => Role::User,
            Message::Assistant(_) => Role::Assistant,
            Message::ToolResult(_) => Role::ToolResult,
        }
    }

    pub fn content(&self) -> &[ContentBlock] {
        match self {
            Message::User(m) => &m.content,
            Message::Assistant(m) => &m.content,
            Message::ToolResult(m) => &m.content,
        }
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            Message::User(m) => m.timestamp,
            Message::Assistant(m) => m.timestamp,
            Message::ToolResult(m) => m.timestamp,
        }
    }

    /// Check that every block is allowed for this role and tool arguments are JSON
    pub fn validate(&self) -> Result<()> {
        let role = self.role();
        let allowed: &[BlockKind] = match role {
            Role::User | Role::ToolResult => &[BlockKind::Text, BlockKind::Image],
            Role::Assistant => &[BlockKind::Text, BlockKind::Thinking, BlockKind::ToolCall],
        };

        for block in self.content() {
            if !allowed.contains(&block.kind()) {
                return Err(RelayError::Validation(format!(
                    "{:?} block not allowed in {:?} message",
                    block.kind(),
                    role
                )));
            }
            if let ContentBlock::ToolCall(call) = block {
                serde_json::from_str::<Value>(&call.arguments).map_err(|e| {
                    RelayError::Validation(format!("tool call {} has invalid arguments: {}", call.id, e))
                })?;
            }
        }

        if let Message::ToolResult(m) = self
            && m.tool_call_id.is_empty()
        {
            return Err(RelayError::Validation("tool result without a tool call id".to_string()));
        }

        Ok(())
    }
}

/// Tool definition advertised to the model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

impl ToolDefinition {
    /// Create a new tool definition
    pub fn new(name: impl Into<String>, description: impl Into<String>, input_schema: Value) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            input_schema,
        }
    }
}

/// Outcome of one tool execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    pub content: Vec<ContentBlock>,
    pub is_error: bool,
}

impl ToolResult {
    /// Create a successful tool result
    pub fn success(text: impl Into<String>) -> Self {
        Self {
            content: vec![ContentBlock::text(text)],
            is_error: false,
        }
    }

    /// Create an error tool result
    pub fn error(text: impl Into<String>) -> Self {
        Self {
            content: vec![ContentBlock::text(text)],
            is_error: true,
        }
    }
}

/// Request for one streamed model turn
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub model: String,
    pub system_prompt: String,
    pub messages: Vec<Message>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub tools: Vec<ToolDefinition>,
    pub max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub temperature: Option<f32>,
}

impl Request {
    /// Create a new request for a model
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            system_prompt: String::new(),
            messages: Vec::new(),
            tools: Vec::new(),
            max_tokens: 4096,
            temperature: None,
        }
    }

    pub fn with_system_prompt(mut self, system_prompt: impl Into<String>) -> Self {
        self.system_prompt = system_prompt.into();
        self
    }

    /// Add a message to the request
    pub fn with_message(mut self, message: Message) -> Self {
        self.messages.push(message);
        self
    }

    /// Add a user message
    pub fn with_user_message(self, text: impl Into<String>) -> Self {
        self.with_message(Message::user(text))
    }

    /// Add tools to the request
    pub fn with_tools(mut self, tools: Vec<ToolDefinition>) -> Self {
        self.tools = tools;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    /// Reject malformed requests before they reach a provider
    pub fn validate(&self) -> Result<()> {
        if self.model.trim().is_empty() {
            return Err(RelayError::Validation("model must not be empty".to_string()));
        }
        if let Some(t) = self.temperature
            && !(0.0..=2.0).contains(&t)
        {
            return Err(RelayError::Validation(format!(
                "temperature {} outside [0, 2]",
                t
            )));
        }
        for (i, message) in self.messages.iter().enumerate() {
            message
                .validate()
                .map_err(|e| RelayError::Validation(format!("message {}: {}", i, e)))?;
        }
        Ok(())
    }
}

/// Conversation owned by the caller; the agent loop only appends to it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub messages: Vec<Message>,
    pub system_prompt: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Session {
    pub fn new(system_prompt: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: generate_session_id(),
            messages: Vec::new(),
            system_prompt: system_prompt.into(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Append a message and bump `updated_at`
    pub fn push(&mut self, message: Message) {
        self.messages.push(message);
        self.updated_at = Utc::now();
    }

    pub fn last(&self) -> Option<&Message> {
        self.messages.last()
    }

    /// Usage summed over every assistant message
    pub fn total_usage(&self) -> Usage {
        let mut total = Usage::default();
        for message in &self.messages {
            if let Message::Assistant(m) = message {
                total.add(&m.usage);
            }
        }
        total
    }
}
