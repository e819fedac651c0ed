pub mod client;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::backend::events::AgentEvent;
use crate::backend::{Backend, BackendError, BackendKind, EventStream, ExecuteRequest};

use client::{
    AgentSession, ClaudeCliConnector, ClaudeCodeConfig, ContentBlock, SessionConnector,
    SessionMessage, SessionOptions, StreamEvent,
};

/// Name of the synthetic tool the CLI uses to return schema-constrained output.
const STRUCTURED_OUTPUT_TOOL: &str = "StructuredOutput";

/// Backend that drives one Claude Code session per `execute` call.
pub struct ClaudeBackend {
    config: ClaudeCodeConfig,
    connector: Arc<dyn SessionConnector>,
    active: Mutex<Option<(u64, CancellationToken)>>,
    turns: AtomicU64,
}

impl ClaudeBackend {
    pub fn new() -> Self {
        Self::with_config(ClaudeCodeConfig::default())
    }

    pub fn with_config(config: ClaudeCodeConfig) -> Self {
        let connector = Arc::new(ClaudeCliConnector::new(config.clone()));
        Self::with_connector(config, connector)
    }

    pub fn with_connector(config: ClaudeCodeConfig, connector: Arc<dyn SessionConnector>) -> Self {
        Self {
            config,
            connector,
            active: Mutex::new(None),
            turns: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &ClaudeCodeConfig {
        &self.config
    }

    fn begin_turn(&self) -> (TurnGuard<'_>, CancellationToken) {
        let id = self.turns.fetch_add(1, Ordering::Relaxed);
        let token = CancellationToken::new();
        let mut active = self.active.lock().unwrap_or_else(|e| e.into_inner());
        *active = Some((id, token.clone()));
        (TurnGuard { backend: self, id }, token)
    }

    fn end_turn(&self, id: u64) {
        let mut active = self.active.lock().unwrap_or_else(|e| e.into_inner());
        // A newer turn may already own the slot.
        if active.as_ref().is_some_and(|(current, _)| *current == id) {
            *active = None;
        }
    }
}

/// Clears the active turn when dropped, however the turn ends.
struct TurnGuard<'a> {
    backend: &'a ClaudeBackend,
    id: u64,
}

impl Drop for TurnGuard<'_> {
    fn drop(&mut self) {
        self.backend.end_turn(self.id);
    }
}

impl Default for ClaudeBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Backend for ClaudeBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Claude
    }

    fn execute(&self, request: ExecuteRequest) -> EventStream<'_> {
        // The turn is live from here, so a cancel() before the first poll still lands.
        let (turn, token) = self.begin_turn();
        Box::pin(async_stream::try_stream! {
            let _turn = turn;

            if let Some(token) = &request.continuation {
                debug!(
                    "Claude sessions do not resume; ignoring {} continuation token",
                    token.backend
                );
            }

            let options = SessionOptions {
                cwd: request.cwd.clone(),
                model: self.config.model.clone(),
                permission_mode: self.config.permission_mode.clone(),
                include_partial_messages: self.config.include_partial_messages,
                output_schema: request.output_schema.clone(),
            };

            let mut session: Box<dyn AgentSession> = tokio::select! {
                biased;
                _ = token.cancelled() => Err(BackendError::Cancelled),
                session = self.connector.connect(options) => session,
            }?;

            if let Err(e) = session.query(&request.prompt).await {
                session.abort().await;
                Err::<(), BackendError>(e)?;
            }

            let mut translator = SessionTranslator::new(self.config.include_partial_messages);
            loop {
                let next = tokio::select! {
                    biased;
                    _ = token.cancelled() => None,
                    message = session.next_message() => Some(message),
                };

                let message = match next {
                    Some(Ok(Some(message))) => message,
                    Some(Ok(None)) => {
                        Err::<SessionMessage, BackendError>(BackendError::Session(
                            "session ended without a result".to_string(),
                        ))?
                    }
                    Some(Err(e)) => {
                        session.abort().await;
                        Err::<SessionMessage, BackendError>(e)?
                    }
                    None => {
                        info!("Claude turn cancelled");
                        session.abort().await;
                        Err::<SessionMessage, BackendError>(BackendError::Cancelled)?
                    }
                };

                match translator.translate(message) {
                    Ok(Step::Continue(events)) => {
                        for event in events {
                            yield event;
                        }
                    }
                    Ok(Step::Finished(events)) => {
                        session.close().await;
                        for event in events {
                            yield event;
                        }
                        break;
                    }
                    Err(e) => {
                        session.close().await;
                        Err::<(), BackendError>(e)?;
                    }
                }
            }
        })
    }

    async fn cancel(&self) {
        let token = self
            .active
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some((_, token)) = token {
            token.cancel();
        }
    }

    fn format_skill_invocation(&self, skill_key: &str, args: Option<&str>) -> String {
        match args.filter(|a| !a.is_empty()) {
            Some(args) => format!("/{} {}", skill_key, args),
            None => format!("/{}", skill_key),
        }
    }
}

pub(crate) enum Step {
    Continue(Vec<AgentEvent>),
    Finished(Vec<AgentEvent>),
}

/// Turns session messages into [`AgentEvent`]s for one turn.
pub(crate) struct SessionTranslator {
    partial_messages: bool,
}

impl SessionTranslator {
    pub(crate) fn new(partial_messages: bool) -> Self {
        Self { partial_messages }
    }

    pub(crate) fn translate(&mut self, message: SessionMessage) -> Result<Step, BackendError> {
        let mut events = Vec::new();
        match message {
            SessionMessage::System(sys) => {
                debug!(
                    "Claude session initialized: session_id={:?}, model={:?}",
                    sys.session_id, sys.model
                );
            }

            SessionMessage::StreamEvent(wrapper) => {
                if let StreamEvent::ContentBlockDelta { delta, .. } = wrapper.event {
                    if self.partial_messages {
                        if let Some(text) = delta.text.filter(|t| !t.is_empty()) {
                            events.push(AgentEvent::Text { text });
                        }
                        if let Some(thinking) = delta.thinking.filter(|t| !t.is_empty()) {
                            events.push(AgentEvent::Thinking { text: thinking });
                        }
                    }
                    if let Some(partial) = delta.partial_json {
                        debug!("Tool input delta: {}", partial);
                    }
                }
            }

            SessionMessage::Assistant(msg) => {
                for block in msg.message.content {
                    match block {
                        // Streamed deltas already carried this text.
                        ContentBlock::Text { .. } | ContentBlock::Thinking { .. }
                            if self.partial_messages => {}
                        ContentBlock::Text { text } => {
                            if !text.is_empty() {
                                events.push(AgentEvent::Text { text });
                            }
                        }
                        ContentBlock::Thinking { thinking } => {
                            if !thinking.is_empty() {
                                events.push(AgentEvent::Thinking { text: thinking });
                            }
                        }
                        ContentBlock::ToolUse { name, .. } if name == STRUCTURED_OUTPUT_TOOL => {}
                        ContentBlock::ToolUse { id, name, input } => {
                            events.push(AgentEvent::ToolStart { id, name, input });
                        }
                        ContentBlock::ToolResult { .. } | ContentBlock::Other => {}
                    }
                }
            }

            SessionMessage::User(msg) => {
                for block in msg.message.content {
                    if let ContentBlock::ToolResult {
                        tool_use_id,
                        content,
                        is_error,
                    } = block
                    {
                        events.push(AgentEvent::ToolResult {
                            id: tool_use_id,
                            output: content.map(|c| c.to_string_lossy()).unwrap_or_default(),
                            is_error,
                        });
                    }
                }
            }

            SessionMessage::Result(res) => {
                if res.is_error {
                    return Err(BackendError::Session(res.error_message()));
                }
                debug!(
                    "Claude result: subtype={}, cost={:?}",
                    res.subtype, res.total_cost_usd
                );
                let usage = res.usage.unwrap_or_default();
                if res.total_cost_usd.is_some()
                    || usage.input_tokens.is_some()
                    || usage.output_tokens.is_some()
                {
                    events.push(AgentEvent::Cost {
                        cost_usd: res.total_cost_usd,
                        input_tokens: usage.input_tokens,
                        output_tokens: usage.output_tokens,
                    });
                }
                events.push(AgentEvent::Result {
                    structured_output: res.structured_output.filter(|v| !v.is_null()),
                    continuation: None,
                });
                return Ok(Step::Finished(events));
            }

            SessionMessage::Unknown => {
                debug!("Skipping unknown Claude message type");
            }
        }
        Ok(Step::Continue(events))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicUsize;

    use futures::StreamExt;
    use serde_json::{json, Value};

    use crate::backend::events::ContinuationToken;

    fn message(value: Value) -> SessionMessage {
        serde_json::from_value(value).unwrap()
    }

    #[derive(Default)]
    struct Counters {
        connects: AtomicUsize,
        closes: AtomicUsize,
        aborts: AtomicUsize,
        queries: Mutex<Vec<String>>,
        schemas: Mutex<Vec<Option<Value>>>,
    }

    /// Connector whose sessions replay fixed messages, then either end or
    /// hang forever.
    struct FakeConnector {
        script: Vec<SessionMessage>,
        hang_when_empty: bool,
        counters: Arc<Counters>,
    }

    struct FakeSession {
        queue: VecDeque<SessionMessage>,
        hang_when_empty: bool,
        counters: Arc<Counters>,
    }

    #[async_trait]
    impl SessionConnector for FakeConnector {
        async fn connect(
            &self,
            options: SessionOptions,
        ) -> Result<Box<dyn AgentSession>, BackendError> {
            self.counters.connects.fetch_add(1, Ordering::SeqCst);
            self.counters
                .schemas
                .lock()
                .unwrap()
                .push(options.output_schema);
            Ok(Box::new(FakeSession {
                queue: self.script.clone().into(),
                hang_when_empty: self.hang_when_empty,
                counters: Arc::clone(&self.counters),
            }))
        }
    }

    #[async_trait]
    impl AgentSession for FakeSession {
        async fn query(&mut self, prompt: &str) -> Result<(), BackendError> {
            self.counters.queries.lock().unwrap().push(prompt.to_string());
            Ok(())
        }

        async fn next_message(&mut self) -> Result<Option<SessionMessage>, BackendError> {
            match self.queue.pop_front() {
                Some(message) => Ok(Some(message)),
                None if self.hang_when_empty => futures::future::pending().await,
                None => Ok(None),
            }
        }

        async fn close(&mut self) {
            self.counters.closes.fetch_add(1, Ordering::SeqCst);
        }

        async fn abort(&mut self) {
            self.counters.aborts.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn backend(script: Vec<SessionMessage>, hang: bool) -> (ClaudeBackend, Arc<Counters>) {
        backend_with(ClaudeCodeConfig::default(), script, hang)
    }

    fn backend_with(
        config: ClaudeCodeConfig,
        script: Vec<SessionMessage>,
        hang: bool,
    ) -> (ClaudeBackend, Arc<Counters>) {
        let counters = Arc::new(Counters::default());
        let connector = Arc::new(FakeConnector {
            script,
            hang_when_empty: hang,
            counters: Arc::clone(&counters),
        });
        (ClaudeBackend::with_connector(config, connector), counters)
    }

    fn result_message(extra: Value) -> SessionMessage {
        let mut value = json!({"type": "result", "subtype": "success", "is_error": false});
        if let (Some(obj), Some(extra)) = (value.as_object_mut(), extra.as_object()) {
            obj.extend(extra.clone());
        }
        message(value)
    }

    #[tokio::test]
    async fn translates_a_full_turn() {
        let (backend, counters) = backend(
            vec![
                message(json!({"type": "system", "subtype": "init", "session_id": "s"})),
                message(json!({"type": "assistant", "message": {"content": [
                    {"type": "thinking", "thinking": "look at files"},
                    {"type": "text", "text": "Reviewing"},
                    {"type": "tool_use", "id": "tu1", "name": "Read", "input": {"path": "a.py"}}
                ]}})),
                message(json!({"type": "user", "message": {"content": [
                    {"type": "tool_result", "tool_use_id": "tu1", "content": "print(1)"}
                ]}})),
                result_message(json!({"total_cost_usd": 0.25, "usage": {"input_tokens": 7, "output_tokens": 3}})),
            ],
            false,
        );

        let events: Vec<AgentEvent> = backend
            .execute(ExecuteRequest::new("/tmp", "review"))
            .map(Result::unwrap)
            .collect()
            .await;

        assert_eq!(
            events,
            vec![
                AgentEvent::thinking("look at files"),
                AgentEvent::text("Reviewing"),
                AgentEvent::ToolStart {
                    id: "tu1".into(),
                    name: "Read".into(),
                    input: json!({"path": "a.py"}),
                },
                AgentEvent::ToolResult {
                    id: "tu1".into(),
                    output: "print(1)".into(),
                    is_error: false,
                },
                AgentEvent::Cost {
                    cost_usd: Some(0.25),
                    input_tokens: Some(7),
                    output_tokens: Some(3),
                },
                AgentEvent::Result {
                    structured_output: None,
                    continuation: None,
                },
            ]
        );
        assert_eq!(counters.closes.load(Ordering::SeqCst), 1);
        assert_eq!(counters.queries.lock().unwrap().as_slice(), ["review"]);
    }

    #[tokio::test]
    async fn structured_output_tool_is_hidden_and_result_carries_payload() {
        let payload = json!({"issues": [{"id": 1, "description": "d", "file": "a.py", "line": 2}]});
        let (backend, counters) = backend(
            vec![
                message(json!({"type": "assistant", "message": {"content": [
                    {"type": "tool_use", "id": "so", "name": "StructuredOutput", "input": payload.clone()}
                ]}})),
                result_message(json!({"structured_output": payload.clone()})),
            ],
            false,
        );

        let schema = json!({"type": "object"});
        let events: Vec<AgentEvent> = backend
            .execute(ExecuteRequest::new("/tmp", "parse").with_schema(Some(schema.clone())))
            .map(Result::unwrap)
            .collect()
            .await;

        assert_eq!(
            events,
            vec![AgentEvent::Result {
                structured_output: Some(payload),
                continuation: None,
            }]
        );
        assert_eq!(counters.schemas.lock().unwrap().as_slice(), [Some(schema)]);
    }

    #[tokio::test]
    async fn continuation_tokens_are_ignored() {
        let (backend, counters) = backend(vec![result_message(json!({}))], false);
        let token = ContinuationToken::new(BackendKind::Codex, json!({"thread_id": "t"}));
        let events: Vec<_> = backend
            .execute(ExecuteRequest::new("/tmp", "again").with_continuation(Some(token)))
            .collect()
            .await;
        assert!(matches!(
            events.as_slice(),
            [Ok(AgentEvent::Result {
                continuation: None,
                ..
            })]
        ));
        assert_eq!(counters.connects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn error_result_fails_the_stream() {
        let (backend, _) = backend(
            vec![
                message(json!({"type": "assistant", "message": {"content": [{"type": "text", "text": "partial"}]}})),
                message(json!({"type": "result", "subtype": "error_during_execution", "is_error": true, "result": "overloaded"})),
            ],
            false,
        );
        let events: Vec<_> = backend
            .execute(ExecuteRequest::new("/tmp", "x"))
            .collect()
            .await;
        assert_eq!(events.len(), 2);
        match &events[1] {
            Err(BackendError::Session(message)) => assert_eq!(message, "overloaded"),
            other => panic!("Expected Session error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn session_ending_without_result_is_an_error() {
        let (backend, _) = backend(
            vec![message(json!({"type": "system", "subtype": "init"}))],
            false,
        );
        let events: Vec<_> = backend
            .execute(ExecuteRequest::new("/tmp", "x"))
            .collect()
            .await;
        assert!(matches!(events.as_slice(), [Err(BackendError::Session(_))]));
    }

    #[tokio::test]
    async fn cancel_interrupts_a_waiting_turn() {
        let (backend, counters) = backend(
            vec![message(json!({"type": "assistant", "message": {"content": [{"type": "text", "text": "working"}]}}))],
            true,
        );
        let backend = Arc::new(backend);

        let mut stream = backend.execute(ExecuteRequest::new("/tmp", "x"));
        assert_eq!(
            stream.next().await.unwrap().unwrap(),
            AgentEvent::text("working")
        );

        backend.cancel().await;
        backend.cancel().await;

        let next = tokio::time::timeout(std::time::Duration::from_secs(5), stream.next())
            .await
            .unwrap();
        assert!(matches!(next, Some(Err(BackendError::Cancelled))));
        assert!(stream.next().await.is_none());
        assert_eq!(counters.aborts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cancel_when_idle_is_noop() {
        let (backend, counters) = backend(Vec::new(), false);
        backend.cancel().await;
        assert_eq!(counters.connects.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn cancel_before_first_poll_stops_the_turn() {
        let (backend, counters) = backend(vec![result_message(json!({}))], false);

        let stream = backend.execute(ExecuteRequest::new("/tmp", "x"));
        backend.cancel().await;
        let events: Vec<_> = stream.collect().await;

        assert!(matches!(events.as_slice(), [Err(BackendError::Cancelled)]));
        assert_eq!(counters.connects.load(Ordering::SeqCst), 0);
        assert!(backend.active.lock().unwrap().is_none());
    }

    /// Connector that fails to connect, or whose sessions reject the query.
    struct BrokenConnector {
        fail_query: bool,
        counters: Arc<Counters>,
    }

    struct BrokenSession {
        counters: Arc<Counters>,
    }

    #[async_trait]
    impl SessionConnector for BrokenConnector {
        async fn connect(
            &self,
            _options: SessionOptions,
        ) -> Result<Box<dyn AgentSession>, BackendError> {
            self.counters.connects.fetch_add(1, Ordering::SeqCst);
            if self.fail_query {
                Ok(Box::new(BrokenSession {
                    counters: Arc::clone(&self.counters),
                }))
            } else {
                Err(BackendError::Session("claude not found".into()))
            }
        }
    }

    #[async_trait]
    impl AgentSession for BrokenSession {
        async fn query(&mut self, _prompt: &str) -> Result<(), BackendError> {
            Err(BackendError::Session("stdin closed".into()))
        }

        async fn next_message(&mut self) -> Result<Option<SessionMessage>, BackendError> {
            Ok(None)
        }

        async fn close(&mut self) {
            self.counters.closes.fetch_add(1, Ordering::SeqCst);
        }

        async fn abort(&mut self) {
            self.counters.aborts.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn failed_connect_or_query_clears_the_active_turn() {
        for fail_query in [false, true] {
            let counters = Arc::new(Counters::default());
            let backend = ClaudeBackend::with_connector(
                ClaudeCodeConfig::default(),
                Arc::new(BrokenConnector {
                    fail_query,
                    counters: Arc::clone(&counters),
                }),
            );

            let events: Vec<_> = backend
                .execute(ExecuteRequest::new("/tmp", "x"))
                .collect()
                .await;

            assert!(matches!(events.as_slice(), [Err(BackendError::Session(_))]));
            assert!(backend.active.lock().unwrap().is_none());
            let aborts = if fail_query { 1 } else { 0 };
            assert_eq!(counters.aborts.load(Ordering::SeqCst), aborts);
        }
    }

    #[tokio::test]
    async fn dropping_an_unpolled_stream_clears_the_active_turn() {
        let (backend, _) = backend(Vec::new(), false);
        let stream = backend.execute(ExecuteRequest::new("/tmp", "x"));
        assert!(backend.active.lock().unwrap().is_some());
        drop(stream);
        assert!(backend.active.lock().unwrap().is_none());
    }

    #[tokio::test]
    async fn partial_messages_stream_deltas_without_duplicates() {
        let config = ClaudeCodeConfig {
            include_partial_messages: true,
            ..ClaudeCodeConfig::default()
        };
        let (backend, _) = backend_with(
            config,
            vec![
                message(json!({"type": "stream_event", "event": {"type": "content_block_delta", "index": 0, "delta": {"type": "text_delta", "text": "Hel"}}})),
                message(json!({"type": "stream_event", "event": {"type": "content_block_delta", "index": 0, "delta": {"type": "text_delta", "text": "lo"}}})),
                message(json!({"type": "assistant", "message": {"content": [{"type": "text", "text": "Hello"}]}})),
                result_message(json!({})),
            ],
            false,
        );
        let events: Vec<AgentEvent> = backend
            .execute(ExecuteRequest::new("/tmp", "x"))
            .map(Result::unwrap)
            .collect()
            .await;
        assert_eq!(
            events[..2],
            [AgentEvent::text("Hel"), AgentEvent::text("lo")]
        );
        assert_eq!(events.len(), 3);
    }

    #[test]
    fn format_skill_invocation_uses_slash_syntax() {
        let backend = ClaudeBackend::new();
        assert_eq!(
            backend.format_skill_invocation("beagle-python:review-python", None),
            "/beagle-python:review-python"
        );
        assert_eq!(
            backend.format_skill_invocation("beagle-core:commit-push", Some("--all")),
            "/beagle-core:commit-push --all"
        );
    }
}
