//! Google Gemini adapter
//!
//! `streamGenerateContent` delivers whole response chunks, each holding zero or
//! more parts and a cumulative usage report. Parts carry no block index, so
//! blocks are assembled by appending: a part extends the latest block when the
//! kinds match and starts a new one otherwise.
//!
//! The chunk source is drained by a producer task into a bounded queue; the
//! stream pulls from the queue and processes one part per step.

use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::{self, BoxStream};
use log::{debug, warn};
use reqwest::Client;
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::{RelayError, Result};
use crate::id::generate_call_id;
use crate::llm::event::Event;
use crate::llm::sse::{SseDecoder, response_source};
use crate::llm::stream::{Assembly, Provider, Slot, Stream, StreamState};
use crate::llm::types::{AssistantMessage, BlockKind, ContentBlock, Message, Request, StopReason, ToolCall, Usage};

const GEMINI_API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta/models";

/// Environment variable holding the API key
pub const GEMINI_API_KEY_ENV: &str = "GEMINI_API_KEY";

/// Chunks buffered between the producer task and the stream
const CHUNK_QUEUE_DEPTH: usize = 16;

/// Configuration for the Gemini provider
#[derive(Debug, Clone)]
pub struct GeminiConfig {
    pub api_base: String,
    pub timeout: Duration,
}

impl Default for GeminiConfig {
    fn default() -> Self {
        Self {
            api_base: GEMINI_API_BASE.to_string(),
            timeout: Duration::from_secs(300),
        }
    }
}

/// One `GenerateContentResponse` chunk
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeminiChunk {
    #[serde(default)]
    pub candidates: Vec<GeminiCandidate>,
    #[serde(default)]
    pub usage_metadata: Option<GeminiUsage>,
    #[serde(default)]
    pub prompt_feedback: Option<GeminiPromptFeedback>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeminiCandidate {
    #[serde(default)]
    pub content: Option<GeminiContent>,
    #[serde(default)]
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct GeminiContent {
    #[serde(default)]
    pub parts: Vec<GeminiPart>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeminiPart {
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub thought: Option<bool>,
    #[serde(default)]
    pub thought_signature: Option<String>,
    #[serde(default)]
    pub function_call: Option<GeminiFunctionCall>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct GeminiFunctionCall {
    #[serde(default)]
    pub id: Option<String>,
    pub name: String,
    #[serde(default)]
    pub args: Option<Value>,
}

/// Cumulative token counts; `prompt_token_count` includes cached tokens
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeminiUsage {
    #[serde(default)]
    pub prompt_token_count: Option<u64>,
    #[serde(default)]
    pub candidates_token_count: Option<u64>,
    #[serde(default)]
    pub cached_content_token_count: Option<u64>,
    #[serde(default)]
    pub thoughts_token_count: Option<u64>,
}

impl From<&GeminiUsage> for Usage {
    fn from(usage: &GeminiUsage) -> Self {
        let output = usage
            .candidates_token_count
            .unwrap_or(0)
            .saturating_add(usage.thoughts_token_count.unwrap_or(0));
        Usage::from_inclusive_prompt(
            usage.prompt_token_count.unwrap_or(0),
            usage.cached_content_token_count.unwrap_or(0),
            output,
        )
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeminiPromptFeedback {
    #[serde(default)]
    pub block_reason: Option<String>,
    #[serde(default)]
    pub block_reason_message: Option<String>,
}

/// Chunks in wire order
pub type ChunkSource = BoxStream<'static, Result<GeminiChunk>>;

/// Map a candidate finish reason; `None` leaves the current reason alone
fn map_finish_reason(reason: &str) -> Option<StopReason> {
    match reason {
        "" | "FINISH_REASON_UNSPECIFIED" => None,
        "STOP" => Some(StopReason::EndTurn),
        "MAX_TOKENS" => Some(StopReason::Length),
        _ => Some(StopReason::Error),
    }
}

/// Gemini provider
pub struct GeminiProvider {
    client: Client,
    api_key: String,
    config: GeminiConfig,
}

impl GeminiProvider {
    /// Create a new provider
    ///
    /// Reads GEMINI_API_KEY from environment
    pub fn new(config: GeminiConfig) -> Result<Self> {
        let api_key = std::env::var(GEMINI_API_KEY_ENV)
            .map_err(|_| RelayError::MissingApiKey(GEMINI_API_KEY_ENV.to_string()))?;
        Self::with_api_key(api_key, config)
    }

    pub fn with_api_key(api_key: String, config: GeminiConfig) -> Result<Self> {
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

    fn api_url(&self, model: &str) -> String {
        format!("{}/{}:streamGenerateContent?alt=sse", self.config.api_base, model)
    }

    fn build_request(&self, request: &Request) -> Value {
        let mut body = json!({
            "contents": convert_contents(&request.messages),
        });

        if !request.system_prompt.is_empty() {
            body["systemInstruction"] = json!({"parts": [{"text": request.system_prompt}]});
        }

        if !request.tools.is_empty() {
            let declarations: Vec<Value> = request
                .tools
                .iter()
                .map(|t| {
                    json!({
                        "name": t.name,
                        "description": t.description,
                        "parameters": t.input_schema,
                    })
                })
                .collect();
            body["tools"] = json!([{"functionDeclarations": declarations}]);
        }

        let mut generation = json!({});
        if request.max_tokens > 0 {
            generation["maxOutputTokens"] = json!(request.max_tokens);
        }
        if let Some(temperature) = request.temperature {
            generation["temperature"] = json!(temperature);
        }
        if generation.as_object().is_some_and(|o| !o.is_empty()) {
            body["generationConfig"] = generation;
        }

        body
    }
}

fn convert_media(blocks: &[ContentBlock]) -> Vec<Value> {
    blocks
        .iter()
        .filter_map(|block| match block {
            ContentBlock::Text { text } if !text.is_empty() => Some(json!({"text": text})),
            ContentBlock::Image { data, mime_type } => {
                Some(json!({"inlineData": {"mimeType": mime_type, "data": data}}))
            }
            _ => None,
        })
        .collect()
}

fn convert_model_parts(blocks: &[ContentBlock]) -> Vec<Value> {
    blocks
        .iter()
        .filter_map(|block| match block {
            ContentBlock::Text { text } if !text.is_empty() => Some(json!({"text": text})),
            ContentBlock::Thinking { text, signature } => {
                if text.is_empty() && signature.is_none() {
                    return None;
                }
                let mut part = json!({"text": text, "thought": true});
                if let Some(sig) = signature {
                    part["thoughtSignature"] = json!(sig);
                }
                Some(part)
            }
            ContentBlock::ToolCall(call) => {
                let mut part = json!({
                    "functionCall": {
                        "id": call.id,
                        "name": call.name,
                        "args": call.input().unwrap_or_else(|_| json!({})),
                    }
                });
                if let Some(sig) = &call.signature {
                    part["thoughtSignature"] = json!(sig);
                }
                Some(part)
            }
            _ => None,
        })
        .collect()
}

/// Convert messages to Gemini `contents`. Consecutive tool results share one turn.
fn convert_contents(messages: &[Message]) -> Vec<Value> {
    let mut out: Vec<Value> = Vec::new();
    let mut open_results = false;

    for message in messages {
        match message {
            Message::User(m) => {
                open_results = false;
                let parts = convert_media(&m.content);
                if !parts.is_empty() {
                    out.push(json!({"role": "user", "parts": parts}));
                }
            }
            Message::Assistant(m) => {
                open_results = false;
                let parts = convert_model_parts(&m.content);
                if !parts.is_empty() {
                    out.push(json!({"role": "model", "parts": parts}));
                }
            }
            Message::ToolResult(m) => {
                let text: String = m.content.iter().filter_map(ContentBlock::as_text).collect();
                let key = if m.is_error { "error" } else { "output" };
                let part = json!({
                    "functionResponse": {
                        "id": m.tool_call_id,
                        "name": m.tool_name,
                        "response": {key: text},
                    }
                });
                match out.last_mut() {
                    Some(last) if open_results => {
                        if let Some(parts) = last["parts"].as_array_mut() {
                            parts.push(part);
                        }
                    }
                    _ => {
                        out.push(json!({"role": "user", "parts": [part]}));
                        open_results = true;
                    }
                }
            }
        }
    }

    out
}

/// Turn an SSE body of JSON chunks into a [`ChunkSource`]
fn sse_chunks(decoder: SseDecoder) -> ChunkSource {
    stream::unfold(Some(decoder), |state| async move {
        let mut decoder = state?;
        loop {
            match decoder.next_frame().await {
                Ok(Some(frame)) if frame.data.trim().is_empty() => continue,
                Ok(Some(frame)) => {
                    let chunk = serde_json::from_str::<GeminiChunk>(&frame.data)
                        .map_err(|e| RelayError::Protocol(format!("malformed chunk: {}", e)));
                    return Some((chunk, Some(decoder)));
                }
                Ok(None) => return None,
                Err(e) => return Some((Err(e), None)),
            }
        }
    })
    .boxed()
}

#[async_trait]
impl Provider for GeminiProvider {
    fn name(&self) -> &str {
        "gemini"
    }

    async fn stream(&self, cancel: CancellationToken, request: Request) -> Result<Box<dyn Stream>> {
        request.validate()?;
        let body = self.build_request(&request);
        debug!("gemini: streaming {} messages to {}", request.messages.len(), request.model);

        let send = self
            .client
            .post(self.api_url(&request.model))
            .header("x-goog-api-key", &self.api_key)
            .json(&body)
            .send();

        let response = tokio::select! {
            _ = cancel.cancelled() => return Err(RelayError::Cancelled),
            response = send => response?,
        };

        let status = response.status();
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

        let chunks = sse_chunks(SseDecoder::new(response_source(response)));
        Ok(Box::new(GeminiStream::new(chunks, cancel)))
    }
}

impl std::fmt::Debug for GeminiProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GeminiProvider")
            .field("api_base", &self.config.api_base)
            .finish()
    }
}

/// Drain `source` into `tx` until exhaustion, the first error, or `stop`
async fn produce(mut source: ChunkSource, tx: mpsc::Sender<Result<GeminiChunk>>, stop: CancellationToken) {
    loop {
        let item = tokio::select! {
            biased;
            _ = stop.cancelled() => break,
            item = source.next() => item,
        };
        let Some(item) = item else { break };
        let failed = item.is_err();

        let sent = tokio::select! {
            biased;
            _ = stop.cancelled() => break,
            sent = tx.send(item) => sent,
        };
        if sent.is_err() || failed {
            break;
        }
    }
}

/// Stream over Gemini response chunks.
///
/// Must be created inside a tokio runtime; the producer task is spawned eagerly.
pub struct GeminiStream {
    rx: Option<mpsc::Receiver<Result<GeminiChunk>>>,
    producer: Option<JoinHandle<()>>,
    stop: CancellationToken,
    cancel: CancellationToken,
    assembly: Assembly,
    parts: VecDeque<GeminiPart>,
    pending: Option<Event>,
}

impl GeminiStream {
    pub fn new(source: ChunkSource, cancel: CancellationToken) -> Self {
        let (tx, rx) = mpsc::channel(CHUNK_QUEUE_DEPTH);
        let stop = cancel.child_token();
        let producer = tokio::spawn(produce(source, tx, stop.clone()));

        Self {
            rx: Some(rx),
            producer: Some(producer),
            stop,
            cancel,
            assembly: Assembly::new(),
            parts: VecDeque::new(),
            pending: None,
        }
    }

    /// Build a stream over an in-memory chunk sequence
    pub fn from_chunks(chunks: Vec<GeminiChunk>, cancel: CancellationToken) -> Self {
        let items: Vec<Result<GeminiChunk>> = chunks.into_iter().map(Ok).collect();
        Self::new(stream::iter(items).boxed(), cancel)
    }

    fn apply_chunk(&mut self, chunk: GeminiChunk) -> Result<()> {
        self.assembly.mark_received();

        if let Some(usage) = &chunk.usage_metadata {
            *self.assembly.usage_mut() = usage.into();
        }

        let candidate = chunk.candidates.into_iter().next();
        let has_parts = candidate
            .as_ref()
            .and_then(|c| c.content.as_ref())
            .is_some_and(|c| !c.parts.is_empty());

        if let Some(reason) = chunk.prompt_feedback.as_ref().and_then(|f| f.block_reason.clone())
            && !has_parts
        {
            let detail = chunk
                .prompt_feedback
                .and_then(|f| f.block_reason_message)
                .map(|m| format!("{}: {}", reason, m))
                .unwrap_or_else(|| reason.clone());
            self.assembly.set_stop_reason(StopReason::Error, Some(reason));
            return Err(RelayError::Blocked(detail));
        }

        if let Some(candidate) = candidate {
            if let Some(raw) = candidate.finish_reason
                && let Some(reason) = map_finish_reason(&raw)
            {
                self.assembly.set_stop_reason(reason, Some(raw));
            }
            if let Some(content) = candidate.content {
                self.parts.extend(content.parts);
            }
        }

        Ok(())
    }

    /// Index of the latest block if it has `kind`, otherwise of a freshly pushed one
    fn active_block(&mut self, kind: BlockKind) -> usize {
        if self.assembly.last_kind() == Some(kind) {
            return self.assembly.len() - 1;
        }
        let slot = match kind {
            BlockKind::Thinking => Slot::Thinking {
                text: String::new(),
                signature: None,
            },
            _ => Slot::Text(String::new()),
        };
        self.assembly.push(slot)
    }

    fn apply_part(&mut self, part: GeminiPart) -> Option<Event> {
        if let Some(fc) = part.function_call {
            let id = fc.id.filter(|id| !id.is_empty()).unwrap_or_else(generate_call_id);
            let arguments = match fc.args {
                None | Some(Value::Null) => "{}".to_string(),
                Some(args) => args.to_string(),
            };
            let call = ToolCall {
                id: id.clone(),
                name: fc.name.clone(),
                arguments: arguments.clone(),
                signature: part.thought_signature.clone(),
            };
            self.assembly.push(Slot::ToolCall {
                id: id.clone(),
                name: fc.name.clone(),
                partial_json: String::new(),
                arguments: Some(arguments),
                signature: part.thought_signature,
                finished: true,
            });
            self.pending = Some(Event::ToolCallEnd { call });
            return Some(Event::ToolCallBegin { id, name: fc.name });
        }

        if part.thought == Some(true) {
            let delta = part.text.unwrap_or_default();
            let index = self.active_block(BlockKind::Thinking);
            if let Some(Slot::Thinking { text, signature }) = self.assembly.last_mut() {
                text.push_str(&delta);
                // latest signature wins
                if part.thought_signature.is_some() {
                    *signature = part.thought_signature;
                }
            }
            return (!delta.is_empty()).then_some(Event::ThinkingDelta { index, delta });
        }

        if part.thought_signature.is_some() {
            debug!("gemini: dropping thought signature on non-thought part");
        }
        match part.text {
            Some(delta) if !delta.is_empty() => {
                let index = self.active_block(BlockKind::Text);
                if let Some(Slot::Text(text)) = self.assembly.last_mut() {
                    text.push_str(&delta);
                }
                Some(Event::TextDelta { index, delta })
            }
            Some(_) => None,
            None => {
                debug!("gemini: ignoring unsupported part");
                None
            }
        }
    }

    fn finish(&mut self) {
        if self.assembly.has_tool_calls() && self.assembly.stop_reason() == StopReason::EndTurn {
            self.assembly.set_stop_reason(StopReason::ToolUse, None);
        }
        self.assembly.complete();
        self.rx = None;
        self.producer = None;
    }

    fn fail(&mut self, err: RelayError) -> RelayError {
        self.stop.cancel();
        self.parts.clear();
        self.assembly.fail_with(err, &self.cancel)
    }
}

#[async_trait]
impl Stream for GeminiStream {
    async fn next(&mut self) -> Result<Option<Event>> {
        loop {
            if let Some(event) = self.pending.take() {
                return Ok(Some(event));
            }
            if self.assembly.is_terminal() {
                return Ok(None);
            }
            if self.cancel.is_cancelled() {
                return Err(self.fail(RelayError::Cancelled));
            }
            self.assembly.begin();

            if let Some(part) = self.parts.pop_front() {
                if let Some(event) = self.apply_part(part) {
                    return Ok(Some(event));
                }
                continue;
            }

            let Some(rx) = self.rx.as_mut() else {
                return Ok(None);
            };

            let item = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => Some(Err(RelayError::Cancelled)),
                item = rx.recv() => item,
            };

            match item {
                None => {
                    self.finish();
                    return Ok(None);
                }
                Some(Err(e)) => return Err(self.fail(e)),
                Some(Ok(chunk)) => {
                    if let Err(e) = self.apply_chunk(chunk) {
                        return Err(self.fail(e));
                    }
                }
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
        self.stop.cancel();
        self.rx = None;
        if let Some(producer) = self.producer.take() {
            producer.abort();
            if let Err(e) = producer.await
                && !e.is_cancelled()
            {
                warn!("gemini: chunk producer failed: {}", e);
            }
        }
        self.parts.clear();
        self.pending = None;
        self.assembly.close();
        Ok(())
    }
}

impl Drop for GeminiStream {
    fn drop(&mut self) {
        self.stop.cancel();
        if let Some(producer) = self.producer.take() {
            producer.abort();
        }
    }
}
