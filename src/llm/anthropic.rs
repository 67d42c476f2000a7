//! Anthropic Messages API adapter
//!
//! Streams `POST /v1/messages` with `stream: true` and reduces the server-sent
//! event protocol to semantic [`Event`]s. Content blocks are addressed by the
//! wire's `index` field.

use std::time::Duration;

use async_trait::async_trait;
use log::{debug, warn};
use reqwest::Client;
use serde::Deserialize;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;

use crate::error::{RelayError, Result};
use crate::llm::event::Event;
use crate::llm::sse::{ByteSource, SseDecoder, SseFrame, response_source};
use crate::llm::stream::{Assembly, Provider, Slot, Stream, StreamState};
use crate::llm::types::{
    AssistantMessage, ContentBlock, Message, Request, StopReason, UsageUpdate, normalize_arguments,
};

/// Anthropic API base URL
const ANTHROPIC_API_URL: &str = "https://api.anthropic.com/v1/messages";

/// Anthropic API version
const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Used when a request asks for zero output tokens
const DEFAULT_MAX_TOKENS: u32 = 8192;

/// Environment variable holding the API key
pub const ANTHROPIC_API_KEY_ENV: &str = "ANTHROPIC_API_KEY";

/// Configuration for the Anthropic provider
#[derive(Debug, Clone)]
pub struct AnthropicConfig {
    pub api_url: String,
    pub max_tokens: u32,
    pub timeout: Duration,
}

impl Default for AnthropicConfig {
    fn default() -> Self {
        Self {
            api_url: ANTHROPIC_API_URL.to_string(),
            max_tokens: DEFAULT_MAX_TOKENS,
            timeout: Duration::from_secs(300),
        }
    }
}

impl AnthropicConfig {
    /// Point the provider at a different endpoint (proxies, test servers)
    pub fn with_api_url(api_url: impl Into<String>) -> Self {
        Self {
            api_url: api_url.into(),
            ..Default::default()
        }
    }
}

/// Anthropic provider
pub struct AnthropicProvider {
    client: Client,
    api_key: String,
    config: AnthropicConfig,
}

impl AnthropicProvider {
    /// Create a new provider
    ///
    /// Reads ANTHROPIC_API_KEY from environment
    pub fn new(config: AnthropicConfig) -> Result<Self> {
        let api_key = std::env::var(ANTHROPIC_API_KEY_ENV)
            .map_err(|_| RelayError::MissingApiKey(ANTHROPIC_API_KEY_ENV.to_string()))?;

        Self::with_api_key(api_key, config)
    }

    /// Create a provider with an explicit API key
    pub fn with_api_key(api_key: String, config: AnthropicConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| RelayError::Transport(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            api_key,
            config,
        })
    }

    /// Build the request body for the Anthropic API
    fn build_request(&self, request: &Request) -> Value {
        let max_tokens = if request.max_tokens == 0 {
            self.config.max_tokens
        } else {
            request.max_tokens
        };

        let mut body = json!({
            "model": request.model,
            "max_tokens": max_tokens,
            "stream": true,
            "messages": convert_messages(&request.messages),
        });

        if !request.system_prompt.is_empty() {
            body["system"] = json!(request.system_prompt);
        }

        if !request.tools.is_empty() {
            let tools: Vec<Value> = request
                .tools
                .iter()
                .map(|t| {
                    json!({
                        "name": t.name,
                        "description": t.description,
                        "input_schema": t.input_schema,
                    })
                })
                .collect();
            body["tools"] = json!(tools);
        }

        if let Some(temperature) = request.temperature {
            body["temperature"] = json!(temperature);
        }

        body
    }
}

fn convert_media(blocks: &[ContentBlock]) -> Vec<Value> {
    blocks
        .iter()
        .filter_map(|block| match block {
            ContentBlock::Text { text } if !text.is_empty() => Some(json!({"type": "text", "text": text})),
            ContentBlock::Image { data, mime_type } => Some(json!({
                "type": "image",
                "source": {"type": "base64", "media_type": mime_type, "data": data},
            })),
            _ => None,
        })
        .collect()
}

fn convert_assistant(blocks: &[ContentBlock]) -> Vec<Value> {
    blocks
        .iter()
        .filter_map(|block| match block {
            ContentBlock::Text { text } if !text.is_empty() => Some(json!({"type": "text", "text": text})),
            ContentBlock::Thinking { text, signature } => match signature.as_deref() {
                Some(sig) if !sig.is_empty() && text.is_empty() => {
                    Some(json!({"type": "redacted_thinking", "data": sig}))
                }
                Some(sig) if !sig.is_empty() => {
                    Some(json!({"type": "thinking", "thinking": text, "signature": sig}))
                }
                // unsigned reasoning cannot be replayed as thinking
                _ if !text.is_empty() => Some(json!({"type": "text", "text": text})),
                _ => None,
            },
            ContentBlock::ToolCall(call) => Some(json!({
                "type": "tool_use",
                "id": call.id,
                "name": call.name,
                "input": call.input().unwrap_or_else(|_| json!({})),
            })),
            _ => None,
        })
        .collect()
}

/// Convert conversation messages into Anthropic's user/assistant turns.
///
/// Consecutive tool results share one user turn of `tool_result` blocks.
fn convert_messages(messages: &[Message]) -> Vec<Value> {
    let mut out: Vec<Value> = Vec::new();
    let mut open_results = false;

    for message in messages {
        match message {
            Message::User(m) => {
                open_results = false;
                let content = convert_media(&m.content);
                if !content.is_empty() {
                    out.push(json!({"role": "user", "content": content}));
                }
            }
            Message::Assistant(m) => {
                open_results = false;
                let content = convert_assistant(&m.content);
                if !content.is_empty() {
                    out.push(json!({"role": "assistant", "content": content}));
                }
            }
            Message::ToolResult(m) => {
                let block = json!({
                    "type": "tool_result",
                    "tool_use_id": m.tool_call_id,
                    "content": convert_media(&m.content),
                    "is_error": m.is_error,
                });
                match out.last_mut() {
                    Some(last) if open_results => {
                        if let Some(content) = last["content"].as_array_mut() {
                            content.push(block);
                        }
                    }
                    _ => {
                        out.push(json!({"role": "user", "content": [block]}));
                        open_results = true;
                    }
                }
            }
        }
    }

    out
}

#[async_trait]
impl Provider for AnthropicProvider {
    fn name(&self) -> &str {
        "anthropic"
    }

    async fn stream(&self, cancel: CancellationToken, request: Request) -> Result<Box<dyn Stream>> {
        request.validate()?;
        let body = self.build_request(&request);
        debug!("anthropic: streaming {} messages to {}", request.messages.len(), request.model);

        let send = self
            .client
            .post(&self.config.api_url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("content-type", "application/json")
            .json(&body)
            .send();

        let response = tokio::select! {
            _ = cancel.cancelled() => return Err(RelayError::Cancelled),
            response = send => response?,
        };

        let status = response.status();

        // Handle rate limiting
        if status.as_u16() == 429 {
            let retry_after = response
                .headers()
                .get("retry-after")
                .and_then(|h| h.to_str().ok())
                .and_then(|s| s.parse::<u64>().ok())
                .unwrap_or(60);
            return Err(RelayError::Api {
                status: 429,
                message: format!("Rate limited, retry after {} seconds", retry_after),
            });
        }

        // Handle other errors
        if !status.is_success() {
            let error_body = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(RelayError::Api {
                status: status.as_u16(),
                message: error_body,
            });
        }

        Ok(Box::new(AnthropicStream::new(response_source(response), cancel)))
    }
}

// Make AnthropicProvider safe to log
impl std::fmt::Debug for AnthropicProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnthropicProvider")
            .field("api_url", &self.config.api_url)
            .field("max_tokens", &self.config.max_tokens)
            .finish()
    }
}

/// Events on the wire, keyed by the `type` field of each `data:` payload
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WireEvent {
    MessageStart {
        message: WireMessage,
    },
    ContentBlockStart {
        index: usize,
        content_block: WireBlock,
    },
    ContentBlockDelta {
        index: usize,
        delta: WireDelta,
    },
    ContentBlockStop {
        index: usize,
    },
    MessageDelta {
        #[serde(default)]
        delta: WireMessageDelta,
        #[serde(default)]
        usage: Option<WireUsage>,
    },
    MessageStop,
    Ping,
    Error {
        error: WireError,
    },
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Deserialize)]
struct WireMessage {
    #[serde(default)]
    usage: Option<WireUsage>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WireBlock {
    Text {
        #[serde(default)]
        text: String,
    },
    Thinking {
        #[serde(default)]
        thinking: String,
        #[serde(default)]
        signature: Option<String>,
    },
    RedactedThinking {
        #[serde(default)]
        data: String,
    },
    ToolUse {
        id: String,
        name: String,
        #[serde(default)]
        input: Option<Value>,
    },
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WireDelta {
    TextDelta { text: String },
    InputJsonDelta { partial_json: String },
    ThinkingDelta { thinking: String },
    SignatureDelta { signature: String },
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Default, Deserialize)]
struct WireMessageDelta {
    #[serde(default)]
    stop_reason: Option<String>,
}

/// Every field is optional: absent and `null` both deserialize to `None`
#[derive(Debug, Default, Deserialize)]
struct WireUsage {
    #[serde(default)]
    input_tokens: Option<u64>,
    #[serde(default)]
    output_tokens: Option<u64>,
    #[serde(default)]
    cache_read_input_tokens: Option<u64>,
    #[serde(default)]
    cache_creation_input_tokens: Option<u64>,
}

impl From<&WireUsage> for UsageUpdate {
    fn from(usage: &WireUsage) -> Self {
        UsageUpdate {
            input_tokens: usage.input_tokens,
            output_tokens: usage.output_tokens,
            cache_read_tokens: usage.cache_read_input_tokens,
            cache_write_tokens: usage.cache_creation_input_tokens,
        }
    }
}

#[derive(Debug, Deserialize)]
struct WireError {
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(default)]
    message: String,
}

/// Map Anthropic's stop reason string
fn map_stop_reason(reason: &str) -> StopReason {
    match reason {
        "end_turn" | "stop_sequence" | "pause_turn" => StopReason::EndTurn,
        "max_tokens" => StopReason::Length,
        "tool_use" => StopReason::ToolUse,
        "refusal" => StopReason::Error,
        _ => StopReason::Unknown,
    }
}

/// Outcome of handling one frame
enum Step {
    Emit(Event),
    Continue,
    Done,
}

/// Stream over an Anthropic event-stream body
pub struct AnthropicStream {
    decoder: Option<SseDecoder>,
    cancel: CancellationToken,
    assembly: Assembly,
}

impl AnthropicStream {
    /// Wrap a raw event-stream body
    pub fn new(source: ByteSource, cancel: CancellationToken) -> Self {
        Self {
            decoder: Some(SseDecoder::new(source)),
            cancel,
            assembly: Assembly::new(),
        }
    }

    fn handle_frame(&mut self, frame: SseFrame) -> Result<Step> {
        if frame.data.is_empty() {
            return Ok(Step::Continue);
        }

        let event: WireEvent = serde_json::from_str(&frame.data)
            .map_err(|e| RelayError::Protocol(format!("malformed event payload: {}", e)))?;

        match event {
            WireEvent::MessageStart { message } => {
                self.assembly.mark_received();
                if let Some(usage) = &message.usage {
                    self.assembly.usage_mut().merge(&usage.into());
                }
                Ok(Step::Continue)
            }
            WireEvent::ContentBlockStart { index, content_block } => {
                self.assembly.mark_received();
                self.start_block(index, content_block)
            }
            WireEvent::ContentBlockDelta { index, delta } => {
                self.assembly.mark_received();
                self.apply_delta(index, delta)
            }
            WireEvent::ContentBlockStop { index } => self.stop_block(index),
            WireEvent::MessageDelta { delta, usage } => {
                self.assembly.mark_received();
                if let Some(reason) = delta.stop_reason {
                    self.assembly.set_stop_reason(map_stop_reason(&reason), Some(reason));
                }
                if let Some(usage) = &usage {
                    self.assembly.usage_mut().merge(&usage.into());
                }
                Ok(Step::Continue)
            }
            WireEvent::MessageStop => Ok(Step::Done),
            WireEvent::Ping => Ok(Step::Continue),
            WireEvent::Error { error } => Err(RelayError::Provider {
                kind: error.kind,
                message: error.message,
            }),
            WireEvent::Unknown => {
                debug!("anthropic: ignoring unknown event {:?}", frame.event);
                Ok(Step::Continue)
            }
        }
    }

    fn start_block(&mut self, index: usize, block: WireBlock) -> Result<Step> {
        let slot = self.assembly.slot_mut(index)?;
        if *slot != Slot::Empty {
            warn!("anthropic: duplicate start for content block {}", index);
            return Ok(Step::Continue);
        }

        match block {
            WireBlock::Text { text } => {
                *slot = Slot::Text(text.clone());
                if text.is_empty() {
                    Ok(Step::Continue)
                } else {
                    Ok(Step::Emit(Event::TextDelta { index, delta: text }))
                }
            }
            WireBlock::Thinking { thinking, signature } => {
                *slot = Slot::Thinking {
                    text: thinking.clone(),
                    signature,
                };
                if thinking.is_empty() {
                    Ok(Step::Continue)
                } else {
                    Ok(Step::Emit(Event::ThinkingDelta {
                        index,
                        delta: thinking,
                    }))
                }
            }
            WireBlock::RedactedThinking { data } => {
                *slot = Slot::Thinking {
                    text: String::new(),
                    signature: Some(data),
                };
                Ok(Step::Continue)
            }
            WireBlock::ToolUse { id, name, input } => {
                let seeded = input
                    .filter(|v| v.as_object().is_some_and(|o| !o.is_empty()))
                    .map(|v| v.to_string());
                *slot = Slot::ToolCall {
                    id: id.clone(),
                    name: name.clone(),
                    partial_json: String::new(),
                    arguments: seeded,
                    signature: None,
                    finished: false,
                };
                Ok(Step::Emit(Event::ToolCallBegin { id, name }))
            }
            WireBlock::Unknown => {
                debug!("anthropic: ignoring unknown content block type at {}", index);
                Ok(Step::Continue)
            }
        }
    }

    fn apply_delta(&mut self, index: usize, delta: WireDelta) -> Result<Step> {
        let slot = self.assembly.slot_mut(index)?;

        match delta {
            WireDelta::TextDelta { text } => {
                match slot {
                    Slot::Text(buf) => buf.push_str(&text),
                    Slot::Empty => *slot = Slot::Text(text.clone()),
                    _ => return Err(RelayError::Protocol(format!("text delta for non-text block {}", index))),
                }
                Ok(Step::Emit(Event::TextDelta { index, delta: text }))
            }
            WireDelta::ThinkingDelta { thinking } => {
                match slot {
                    Slot::Thinking { text, .. } => text.push_str(&thinking),
                    Slot::Empty => {
                        *slot = Slot::Thinking {
                            text: thinking.clone(),
                            signature: None,
                        }
                    }
                    _ => {
                        return Err(RelayError::Protocol(format!(
                            "thinking delta for non-thinking block {}",
                            index
                        )));
                    }
                }
                Ok(Step::Emit(Event::ThinkingDelta {
                    index,
                    delta: thinking,
                }))
            }
            WireDelta::SignatureDelta { signature: sig } => {
                match slot {
                    Slot::Thinking { signature, .. } => {
                        signature.get_or_insert_with(String::new).push_str(&sig);
                    }
                    Slot::Empty => {
                        *slot = Slot::Thinking {
                            text: String::new(),
                            signature: Some(sig),
                        }
                    }
                    _ => warn!("anthropic: signature delta for non-thinking block {}", index),
                }
                Ok(Step::Continue)
            }
            WireDelta::InputJsonDelta { partial_json: fragment } => match slot {
                Slot::ToolCall { id, partial_json, .. } => {
                    partial_json.push_str(&fragment);
                    Ok(Step::Emit(Event::ToolCallDelta {
                        id: id.clone(),
                        delta: fragment,
                    }))
                }
                _ => Err(RelayError::Protocol(format!(
                    "argument delta for non-tool block {}",
                    index
                ))),
            },
            WireDelta::Unknown => Ok(Step::Continue),
        }
    }

    fn stop_block(&mut self, index: usize) -> Result<Step> {
        let Some(Slot::ToolCall {
            partial_json,
            arguments,
            finished,
            ..
        }) = self.assembly.slot(index)
        else {
            return Ok(Step::Continue);
        };
        if *finished {
            warn!("anthropic: repeated stop for content block {}", index);
            return Ok(Step::Continue);
        }

        let finalized = if partial_json.trim().is_empty() {
            arguments.clone().unwrap_or_else(|| "{}".to_string())
        } else {
            normalize_arguments(partial_json)?
        };

        let slot = self.assembly.slot_mut(index)?;
        if let Slot::ToolCall {
            arguments, finished, ..
        } = slot
        {
            *arguments = Some(finalized);
            *finished = true;
        }
        match slot.to_tool_call() {
            Some(call) => Ok(Step::Emit(Event::ToolCallEnd { call })),
            None => Ok(Step::Continue),
        }
    }
}

#[async_trait]
impl Stream for AnthropicStream {
    async fn next(&mut self) -> Result<Option<Event>> {
        loop {
            if self.assembly.is_terminal() {
                return Ok(None);
            }
            if self.cancel.is_cancelled() {
                return Err(self.assembly.fail_with(RelayError::Cancelled, &self.cancel));
            }
            self.assembly.begin();

            let Some(decoder) = self.decoder.as_mut() else {
                return Ok(None);
            };

            let frame = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => Err(RelayError::Cancelled),
                frame = decoder.next_frame() => frame,
            };

            let frame = match frame {
                Ok(Some(frame)) => frame,
                Ok(None) => {
                    let err = RelayError::UnexpectedEof("event stream ended before message_stop".to_string());
                    return Err(self.assembly.fail_with(err, &self.cancel));
                }
                Err(e) => return Err(self.assembly.fail_with(e, &self.cancel)),
            };

            match self.handle_frame(frame) {
                Ok(Step::Emit(event)) => return Ok(Some(event)),
                Ok(Step::Continue) => continue,
                Ok(Step::Done) => {
                    self.assembly.complete();
                    self.decoder = None;
                    return Ok(None);
                }
                Err(e) => return Err(self.assembly.fail_with(e, &self.cancel)),
            }
        }
    }

    fn state(&self) -> StreamState {
        self.assembly.state()
    }

    fn message(&self) -> Result<AssistantMessage> {
        self.assembly.snapshot()
    }

    async fn close(&mut self) -> Result<()> {
        self.decoder = None;
        self.assembly.close();
        Ok(())
    }
}
