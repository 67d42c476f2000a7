//! Agent loop integration tests
//!
//! Drives full sessions through the public API: a provider that replays
//! Anthropic event-stream bodies, the scripted mock provider, and an echoing
//! provider that checks what the loop sends.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;

use llm_relay::agent::{AgentLoop, RunOptions};
use llm_relay::llm::{
    AnthropicStream, ContentBlock, Message, MockProvider, MockTurn, Provider, Request, Role, Session, StopReason,
    Stream, ToolCall, ToolDefinition, ToolResult,
};
use llm_relay::tools::ToolExecutor;
use llm_relay::{RelayError, Result};

fn sse(events: &[Value]) -> String {
    events
        .iter()
        .map(|e| format!("event: {}\ndata: {}\n\n", e["type"].as_str().unwrap(), e))
        .collect()
}

fn text_turn(text: &str) -> Vec<Value> {
    vec![
        json!({"type": "message_start", "message": {"usage": {"input_tokens": 5, "output_tokens": 1}}}),
        json!({"type": "content_block_start", "index": 0, "content_block": {"type": "text", "text": ""}}),
        json!({"type": "content_block_delta", "index": 0, "delta": {"type": "text_delta", "text": text}}),
        json!({"type": "content_block_stop", "index": 0}),
        json!({"type": "message_delta", "delta": {"stop_reason": "end_turn"}, "usage": {"output_tokens": 3}}),
        json!({"type": "message_stop"}),
    ]
}

fn tool_turn(id: &str, name: &str, args: &str) -> Vec<Value> {
    vec![
        json!({"type": "message_start", "message": {"usage": {"input_tokens": 5, "output_tokens": 1}}}),
        json!({"type": "content_block_start", "index": 0, "content_block": {"type": "tool_use", "id": id, "name": name, "input": {}}}),
        json!({"type": "content_block_delta", "index": 0, "delta": {"type": "input_json_delta", "partial_json": args}}),
        json!({"type": "content_block_stop", "index": 0}),
        json!({"type": "message_delta", "delta": {"stop_reason": "tool_use"}, "usage": {"output_tokens": 9}}),
        json!({"type": "message_stop"}),
    ]
}

/// Replays one scripted body per turn; a trailing error simulates a dropped connection
struct SseProvider {
    bodies: Mutex<VecDeque<(String, Option<RelayError>)>>,
}

impl SseProvider {
    fn new(bodies: Vec<(String, Option<RelayError>)>) -> Self {
        Self {
            bodies: Mutex::new(bodies.into()),
        }
    }
}

#[async_trait]
impl Provider for SseProvider {
    fn name(&self) -> &str {
        "sse-script"
    }

    async fn stream(&self, cancel: CancellationToken, request: Request) -> Result<Box<dyn Stream>> {
        request.validate()?;
        let (body, failure) = self
            .bodies
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| RelayError::Validation("script exhausted".to_string()))?;
        let mut items: Vec<Result<Vec<u8>>> = vec![Ok(body.into_bytes())];
        if let Some(err) = failure {
            items.push(Err(err));
        }
        Ok(Box::new(AnthropicStream::new(stream::iter(items).boxed(), cancel)))
    }
}

/// Fails every call with a plain error
struct FailingExecutor;

#[async_trait]
impl ToolExecutor for FailingExecutor {
    async fn execute(&self, _cancel: &CancellationToken, _name: &str, _arguments: &str) -> eyre::Result<ToolResult> {
        Err(eyre::eyre!("boom"))
    }
}

/// Records calls and reports success
#[derive(Default)]
struct RecordingExecutor {
    calls: Mutex<Vec<(String, String)>>,
}

#[async_trait]
impl ToolExecutor for RecordingExecutor {
    async fn execute(&self, _cancel: &CancellationToken, name: &str, arguments: &str) -> eyre::Result<ToolResult> {
        self.calls.lock().unwrap().push((name.to_string(), arguments.to_string()));
        Ok(ToolResult::success(format!("ran {}", name)))
    }
}

fn new_session(prompt: &str) -> Session {
    let mut session = Session::new("system");
    session.push(Message::user(prompt));
    session
}

#[tokio::test]
async fn test_executor_error_is_reported_and_loop_continues() {
    let provider = Arc::new(SseProvider::new(vec![
        (sse(&tool_turn("toolu_1", "read_file", r#"{"path":"x"}"#)), None),
        (sse(&text_turn("Sorry, that failed.")), None),
    ]));
    let agent = AgentLoop::new(provider, Arc::new(FailingExecutor));
    let mut session = new_session("read x");

    agent
        .run(&CancellationToken::new(), &mut session, &[], &RunOptions::new("claude"))
        .await
        .unwrap();

    assert_eq!(session.messages.len(), 4);
    match &session.messages[2] {
        Message::ToolResult(result) => {
            assert!(result.is_error);
            assert_eq!(result.tool_call_id, "toolu_1");
            assert_eq!(result.tool_name, "read_file");
            assert_eq!(result.content, vec![ContentBlock::text("boom")]);
        }
        other => panic!("expected tool result, got {:?}", other),
    }
    match &session.messages[3] {
        Message::Assistant(reply) => assert_eq!(reply.text(), "Sorry, that failed."),
        other => panic!("expected assistant reply, got {:?}", other),
    }
}

#[tokio::test]
async fn test_transport_failure_keeps_partial_text() {
    let partial = sse(&[
        json!({"type": "message_start", "message": {"usage": {"input_tokens": 5}}}),
        json!({"type": "content_block_start", "index": 0, "content_block": {"type": "text", "text": ""}}),
        json!({"type": "content_block_delta", "index": 0, "delta": {"type": "text_delta", "text": "Half an ans"}}),
    ]);
    let provider = Arc::new(SseProvider::new(vec![(
        partial,
        Some(RelayError::Transport("connection reset".to_string())),
    )]));
    let agent = AgentLoop::new(provider, Arc::new(RecordingExecutor::default()));
    let mut session = new_session("question");

    let err = agent
        .run(&CancellationToken::new(), &mut session, &[], &RunOptions::new("claude"))
        .await
        .unwrap_err();

    assert!(matches!(err, RelayError::Transport(_)));
    assert_eq!(session.messages.len(), 2);
    match &session.messages[1] {
        Message::Assistant(partial) => {
            assert_eq!(partial.text(), "Half an ans");
            assert_eq!(partial.stop_reason, StopReason::Error);
            assert_eq!(partial.usage.input_tokens, 5);
        }
        other => panic!("expected partial assistant message, got {:?}", other),
    }
}

#[tokio::test]
async fn test_truncated_stream_is_an_error() {
    let truncated = sse(&text_turn("complete text")[..4]);
    let provider = Arc::new(SseProvider::new(vec![(truncated, None)]));
    let agent = AgentLoop::new(provider, Arc::new(RecordingExecutor::default()));
    let mut session = new_session("question");

    let err = agent
        .run(&CancellationToken::new(), &mut session, &[], &RunOptions::new("claude"))
        .await
        .unwrap_err();

    assert!(err.is_protocol());
    match session.last() {
        Some(Message::Assistant(m)) => assert_eq!(m.text(), "complete text"),
        other => panic!("expected assistant message, got {:?}", other),
    }
}

#[tokio::test]
async fn test_multiple_calls_in_one_turn_run_in_order() {
    let provider = Arc::new(MockProvider::new(vec![
        MockTurn::new(vec![
            ContentBlock::text("Checking both."),
            ContentBlock::ToolCall(ToolCall::new("c1", "first", r#"{"n":1}"#)),
            ContentBlock::ToolCall(ToolCall::new("c2", "second", "")),
        ]),
        MockTurn::text("All done."),
    ]));
    let executor = Arc::new(RecordingExecutor::default());
    let agent = AgentLoop::new(provider.clone(), executor.clone());
    let mut session = new_session("go");
    let tools = vec![
        ToolDefinition::new("first", "First tool", json!({"type": "object"})),
        ToolDefinition::new("second", "Second tool", json!({"type": "object"})),
    ];

    agent
        .run(&CancellationToken::new(), &mut session, &tools, &RunOptions::new("mock"))
        .await
        .unwrap();

    let calls = executor.calls.lock().unwrap().clone();
    assert_eq!(
        calls,
        vec![
            ("first".to_string(), r#"{"n":1}"#.to_string()),
            ("second".to_string(), "{}".to_string()),
        ]
    );

    let roles: Vec<Role> = session.messages.iter().map(Message::role).collect();
    assert_eq!(
        roles,
        vec![Role::User, Role::Assistant, Role::ToolResult, Role::ToolResult, Role::Assistant]
    );

    let requests = provider.requests().await;
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[1].tools.len(), 2);
    assert_eq!(requests[1].messages.len(), 4);
}

/// Echoes the text of the last message back and keeps every request
#[derive(Default)]
struct EchoProvider {
    seen: Mutex<Vec<Request>>,
}

#[async_trait]
impl Provider for EchoProvider {
    fn name(&self) -> &str {
        "echo"
    }

    async fn stream(&self, cancel: CancellationToken, request: Request) -> Result<Box<dyn Stream>> {
        request.validate()?;
        let echoed: String = request
            .messages
            .last()
            .map(|m| m.content().iter().filter_map(ContentBlock::as_text).collect())
            .unwrap_or_default();
        self.seen.lock().unwrap().push(request);
        Ok(Box::new(llm_relay::llm::MockStream::new(MockTurn::text(echoed), cancel)))
    }
}

#[tokio::test]
async fn test_session_round_trip_preserves_order_and_roles() {
    let call = ToolCall::new("c1", "lookup", r#"{"q":"rust"}"#);
    let mut session = Session::new("system");
    session.push(Message::user("first question"));
    session.push(Message::Assistant(llm_relay::llm::AssistantMessage::new(
        vec![
            ContentBlock::thinking("planning", Some("sig".to_string())),
            ContentBlock::ToolCall(call.clone()),
        ],
        StopReason::ToolUse,
    )));
    session.push(Message::tool_result(&call, ToolResult::success("found it")));
    session.push(Message::user("and then?"));
    let before = session.messages.clone();

    let provider = Arc::new(EchoProvider::default());
    let agent = AgentLoop::new(provider.clone(), Arc::new(RecordingExecutor::default()));
    agent
        .run(&CancellationToken::new(), &mut session, &[], &RunOptions::new("echo"))
        .await
        .unwrap();

    let seen = provider.seen.lock().unwrap();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].messages, before);

    // The request survives serialization unchanged
    let wire = serde_json::to_string(&seen[0]).unwrap();
    let restored: Request = serde_json::from_str(&wire).unwrap();
    assert_eq!(restored, seen[0]);
    let roles: Vec<Role> = restored.messages.iter().map(Message::role).collect();
    assert_eq!(roles, vec![Role::User, Role::Assistant, Role::ToolResult, Role::User]);

    match session.last() {
        Some(Message::Assistant(reply)) => assert_eq!(reply.text(), "and then?"),
        other => panic!("expected echoed reply, got {:?}", other),
    }
}

#[tokio::test]
async fn test_cancellation_between_turns() {
    let cancel = CancellationToken::new();

    /// Cancels the run from inside the tool call
    struct CancellingExecutor(CancellationToken);

    #[async_trait]
    impl ToolExecutor for CancellingExecutor {
        async fn execute(&self, _cancel: &CancellationToken, _name: &str, _arguments: &str) -> eyre::Result<ToolResult> {
            self.0.cancel();
            Ok(ToolResult::success("ok"))
        }
    }

    let provider = Arc::new(MockProvider::new(vec![
        MockTurn::tool_call(ToolCall::new("c1", "stop", "{}")),
        MockTurn::text("unreachable"),
    ]));
    let agent = AgentLoop::new(provider.clone(), Arc::new(CancellingExecutor(cancel.clone())));
    let mut session = new_session("go");

    let err = agent
        .run(&cancel, &mut session, &[], &RunOptions::new("mock"))
        .await
        .unwrap_err();

    assert!(err.is_cancelled());
    assert_eq!(session.messages.len(), 3);
    assert_eq!(provider.remaining().await, 1);
}
