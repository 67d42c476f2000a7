//! Agent loop - alternates model turns with tool execution.
//!
//! Each turn streams one assistant message from the provider, appends it to the
//! session even when the stream failed part-way, then runs any requested tools
//! and appends their results. The loop ends when a turn requests no tools.

use std::sync::Arc;

use crate::error::{RelayError, Result};
use crate::llm::{Event, Message, Provider, Request, Session, Stream, ToolCall, ToolDefinition, ToolResult};
use crate::tools::ToolExecutor;
use tokio_util::sync::CancellationToken;

/// Callback receiving every streamed event in source order
pub type Observer = Arc<dyn Fn(&Event) + Send + Sync>;

/// Per-run settings
#[derive(Clone)]
pub struct RunOptions {
    pub model: String,
    /// 0 lets the provider pick its default
    pub max_tokens: u32,
    pub temperature: Option<f32>,
    /// Upper bound on model turns; `None` is unbounded
    pub max_turns: Option<u32>,
    pub observer: Option<Observer>,
}

impl RunOptions {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            max_tokens: 0,
            temperature: None,
            max_turns: None,
            observer: None,
        }
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_max_turns(mut self, max_turns: u32) -> Self {
        self.max_turns = Some(max_turns);
        self
    }

    pub fn with_observer(mut self, observer: Observer) -> Self {
        self.observer = Some(observer);
        self
    }
}

impl std::fmt::Debug for RunOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunOptions")
            .field("model", &self.model)
            .field("max_tokens", &self.max_tokens)
            .field("temperature", &self.temperature)
            .field("max_turns", &self.max_turns)
            .field("observer", &self.observer.is_some())
            .finish()
    }
}

/// Drives a provider and a tool executor over a caller-owned session
pub struct AgentLoop<P, E>
where
    P: Provider + ?Sized,
    E: ToolExecutor + ?Sized,
{
    provider: Arc<P>,
    executor: Arc<E>,
}

impl<P, E> AgentLoop<P, E>
where
    P: Provider + ?Sized,
    E: ToolExecutor + ?Sized,
{
    pub fn new(provider: Arc<P>, executor: Arc<E>) -> Self {
        Self { provider, executor }
    }

    /// Run turns until the model stops requesting tools.
    ///
    /// On a stream failure the partial assistant message is appended before the
    /// error is returned. Executor failures become error tool results.
    pub async fn run(
        &self,
        cancel: &CancellationToken,
        session: &mut Session,
        tools: &[ToolDefinition],
        options: &RunOptions,
    ) -> Result<()> {
        let mut turn: u32 = 0;

        loop {
            if cancel.is_cancelled() {
                return Err(RelayError::Cancelled);
            }
            if let Some(max_turns) = options.max_turns
                && turn >= max_turns
            {
                tracing::warn!(session = %session.id, max_turns, "turn limit reached");
                return Err(RelayError::TurnLimit(max_turns));
            }
            turn += 1;

            let request = build_request(session, tools, options);
            request.validate()?;
            tracing::debug!(
                session = %session.id,
                turn,
                provider = self.provider.name(),
                messages = request.messages.len(),
                "starting turn"
            );

            let mut stream = self.provider.stream(cancel.clone(), request).await?;
            let drained = drain(stream.as_mut(), options.observer.as_ref()).await;
            let snapshot = stream.message();
            if let Err(e) = stream.close().await {
                log::warn!("failed to close stream: {}", e);
            }

            let calls: Vec<ToolCall> = match snapshot {
                Ok(message) => {
                    let calls = message.tool_calls().into_iter().cloned().collect();
                    tracing::debug!(
                        turn,
                        stop_reason = ?message.stop_reason,
                        input_tokens = message.usage.total_input(),
                        output_tokens = message.usage.output_tokens,
                        "turn finished"
                    );
                    session.push(Message::Assistant(message));
                    calls
                }
                // no data ever arrived; the drain error, if any, takes precedence
                Err(e) if drained.is_ok() => return Err(e),
                Err(_) => Vec::new(),
            };

            if let Err(e) = drained {
                tracing::warn!(session = %session.id, turn, error = %e, "turn failed");
                return Err(e);
            }

            if calls.is_empty() {
                tracing::info!(session = %session.id, turns = turn, "run complete");
                return Ok(());
            }

            for call in &calls {
                tracing::info!(turn, tool = %call.name, call_id = %call.id, "executing tool");
                let result = match self.executor.execute(cancel, &call.name, &call.arguments).await {
                    Ok(result) => result,
                    Err(e) => {
                        tracing::warn!(tool = %call.name, call_id = %call.id, error = %e, "tool failed");
                        ToolResult::error(e.to_string())
                    }
                };
                session.push(Message::tool_result(call, result));
            }
        }
    }
}

fn build_request(session: &Session, tools: &[ToolDefinition], options: &RunOptions) -> Request {
    Request {
        model: options.model.clone(),
        system_prompt: session.system_prompt.clone(),
        messages: session.messages.clone(),
        tools: tools.to_vec(),
        max_tokens: options.max_tokens,
        temperature: options.temperature,
    }
}

/// Pull every event, forwarding each to the observer
async fn drain(stream: &mut dyn Stream, observer: Option<&Observer>) -> Result<usize> {
    let mut count = 0;
    while let Some(event) = stream.next().await? {
        if let Some(observer) = observer {
            observer(&event);
        }
        count += 1;
    }
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{ContentBlock, MockProvider, MockTurn, Role, StopReason};
    use async_trait::async_trait;
    use eyre::eyre;
    use std::sync::Mutex;

    /// Executor that records calls and echoes arguments
    #[derive(Default)]
    struct EchoExecutor {
        calls: Mutex<Vec<(String, String)>>,
    }

    #[async_trait]
    impl ToolExecutor for EchoExecutor {
        async fn execute(&self, _cancel: &CancellationToken, name: &str, arguments: &str) -> eyre::Result<ToolResult> {
            self.calls.lock().unwrap().push((name.to_string(), arguments.to_string()));
            if name == "explode" {
                return Err(eyre!("boom"));
            }
            Ok(ToolResult::success(arguments))
        }
    }

    fn session() -> Session {
        let mut session = Session::new("you are terse");
        session.push(Message::user("hello"));
        session
    }

    #[tokio::test]
    async fn test_single_turn_without_tools() {
        let provider = Arc::new(MockProvider::new(vec![MockTurn::text("hi")]));
        let agent = AgentLoop::new(provider.clone(), Arc::new(EchoExecutor::default()));
        let mut session = session();

        agent
            .run(&CancellationToken::new(), &mut session, &[], &RunOptions::new("m"))
            .await
            .unwrap();

        assert_eq!(session.messages.len(), 2);
        assert_eq!(session.messages[1].role(), Role::Assistant);
        let requests = provider.requests().await;
        assert_eq!(requests[0].system_prompt, "you are terse");
        assert_eq!(requests[0].messages.len(), 1);
    }

    #[tokio::test]
    async fn test_tool_round_trip() {
        let call = ToolCall::new("c1", "echo", r#"{"v":1}"#);
        let provider = Arc::new(MockProvider::new(vec![MockTurn::tool_call(call), MockTurn::text("done")]));
        let executor = Arc::new(EchoExecutor::default());
        let agent = AgentLoop::new(provider.clone(), executor.clone());
        let mut session = session();

        agent
            .run(&CancellationToken::new(), &mut session, &[], &RunOptions::new("m"))
            .await
            .unwrap();

        let roles: Vec<Role> = session.messages.iter().map(Message::role).collect();
        assert_eq!(roles, vec![Role::User, Role::Assistant, Role::ToolResult, Role::Assistant]);
        match &session.messages[2] {
            Message::ToolResult(m) => {
                assert_eq!(m.tool_call_id, "c1");
                assert!(!m.is_error);
                assert_eq!(m.content, vec![ContentBlock::text(r#"{"v":1}"#)]);
            }
            other => panic!("expected tool result, got {:?}", other),
        }
        assert_eq!(executor.calls.lock().unwrap().len(), 1);
        assert_eq!(provider.requests().await[1].messages.len(), 3);
    }

    #[tokio::test]
    async fn test_executor_error_becomes_error_result() {
        let provider = Arc::new(MockProvider::new(vec![
            MockTurn::tool_call(ToolCall::new("c1", "explode", "{}")),
            MockTurn::text("recovered"),
        ]));
        let agent = AgentLoop::new(provider, Arc::new(EchoExecutor::default()));
        let mut session = session();

        agent
            .run(&CancellationToken::new(), &mut session, &[], &RunOptions::new("m"))
            .await
            .unwrap();

        match &session.messages[2] {
            Message::ToolResult(m) => {
                assert!(m.is_error);
                assert_eq!(m.content, vec![ContentBlock::text("boom")]);
            }
            other => panic!("expected tool result, got {:?}", other),
        }
        assert_eq!(session.messages.len(), 4);
    }

    #[tokio::test]
    async fn test_stream_failure_keeps_partial_message() {
        let provider = Arc::new(MockProvider::new(vec![MockTurn::text("half").with_failure("reset")]));
        let agent = AgentLoop::new(provider, Arc::new(EchoExecutor::default()));
        let mut session = session();

        let err = agent
            .run(&CancellationToken::new(), &mut session, &[], &RunOptions::new("m"))
            .await
            .unwrap_err();

        assert!(matches!(err, RelayError::Transport(_)));
        match session.last() {
            Some(Message::Assistant(m)) => {
                assert_eq!(m.text(), "half");
                assert_eq!(m.stop_reason, StopReason::Error);
            }
            other => panic!("expected assistant message, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_cancelled_before_first_turn() {
        let provider = Arc::new(MockProvider::new(vec![MockTurn::text("never")]));
        let agent = AgentLoop::new(provider.clone(), Arc::new(EchoExecutor::default()));
        let cancel = CancellationToken::new();
        cancel.cancel();
        let mut session = session();

        let err = agent.run(&cancel, &mut session, &[], &RunOptions::new("m")).await.unwrap_err();
        assert!(err.is_cancelled());
        assert_eq!(session.messages.len(), 1);
        assert!(provider.requests().await.is_empty());
    }

    #[tokio::test]
    async fn test_turn_limit() {
        let provider = Arc::new(MockProvider::new(vec![
            MockTurn::tool_call(ToolCall::new("c1", "echo", "{}")),
            MockTurn::tool_call(ToolCall::new("c2", "echo", "{}")),
        ]));
        let agent = AgentLoop::new(provider, Arc::new(EchoExecutor::default()));
        let mut session = session();

        let err = agent
            .run(
                &CancellationToken::new(),
                &mut session,
                &[],
                &RunOptions::new("m").with_max_turns(1),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::TurnLimit(1)));
        assert_eq!(session.messages.len(), 3);
    }

    #[tokio::test]
    async fn test_observer_sees_events_in_order() {
        let seen: Arc<Mutex<Vec<Event>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let observer: Observer = Arc::new(move |event: &Event| sink.lock().unwrap().push(event.clone()));

        let provider = Arc::new(MockProvider::new(vec![MockTurn::new(vec![
            ContentBlock::thinking("hmm", None),
            ContentBlock::text("answer"),
        ])]));
        let agent = AgentLoop::new(provider, Arc::new(EchoExecutor::default()));
        let mut session = session();

        agent
            .run(
                &CancellationToken::new(),
                &mut session,
                &[],
                &RunOptions::new("m").with_observer(observer),
            )
            .await
            .unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert!(matches!(seen[0], Event::ThinkingDelta { index: 0, .. }));
        assert!(matches!(seen[1], Event::TextDelta { index: 1, .. }));
    }

    #[tokio::test]
    async fn test_invalid_options_rejected() {
        let provider = Arc::new(MockProvider::new(vec![MockTurn::text("x")]));
        let agent = AgentLoop::new(provider, Arc::new(EchoExecutor::default()));
        let mut session = session();

        let err = agent
            .run(
                &CancellationToken::new(),
                &mut session,
                &[],
                &RunOptions::new("m").with_temperature(5.0),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::Validation(_)));
        assert_eq!(session.messages.len(), 1);
    }

    #[test]
    fn test_run_options_debug_hides_observer() {
        let observer: Observer = Arc::new(|_: &Event| {});
        let options = RunOptions::new("m").with_observer(observer);
        let rendered = format!("{:?}", options);
        assert!(rendered.contains("observer: true"));
    }
}
