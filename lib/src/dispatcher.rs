//! Stream dispatcher
//!
//! Drives one session's provider output through a connection. Content is
//! forwarded as `stream_chunk` frames the moment it arrives; gated tool calls
//! pause the stream on the confirmation broker until the client decides.

use futures::StreamExt;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::confirmation::ConfirmationBroker;
use crate::error::AgentError;
use crate::protocol::ServerFrame;
use crate::provider::{GenerationRequest, PendingToolCall, ProviderEvent};
use crate::session::{MessageRole, SessionStore, StreamLease};
use crate::tools::ToolRegistry;

/// Outbound frame queue of one connection
pub type FrameSender = mpsc::UnboundedSender<ServerFrame>;

/// Lifecycle of a single stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Idle,
    AwaitingProviderEvent,
    AwaitingConfirmation,
    Finished,
    Errored,
}

/// How a stream ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamOutcome {
    /// `stream_end` was sent; the assistant text is what got recorded, if anything
    Finished { assistant_message: Option<String> },
    /// The provider failed and an `error` frame was sent
    Errored(String),
    /// The client stopped listening mid-stream
    Disconnected,
}

/// Connection closed while sending
struct Disconnected;

/// Runs provider output for sessions over a connection's frame queue
pub struct StreamDispatcher {
    sessions: Arc<SessionStore>,
    broker: Arc<ConfirmationBroker>,
    tools: Arc<ToolRegistry>,
}

impl StreamDispatcher {
    pub fn new(
        sessions: Arc<SessionStore>,
        broker: Arc<ConfirmationBroker>,
        tools: Arc<ToolRegistry>,
    ) -> Self {
        Self {
            sessions,
            broker,
            tools,
        }
    }

    /// Stream the reply to `user_message` on the leased session
    ///
    /// The lease is held for the whole call and released on every exit path,
    /// including the task being aborted.
    pub async fn run(
        &self,
        lease: StreamLease,
        user_message: String,
        frames: FrameSender,
    ) -> StreamOutcome {
        let session_id = lease.session_id().to_string();
        let mut run = StreamRun {
            dispatcher: self,
            lease,
            frames,
            state: StreamState::Idle,
            assistant_text: String::new(),
        };

        let outcome = run.drive(user_message).await;
        tracing::info!(%session_id, ?outcome, "Stream completed");
        outcome
    }
}

/// Per-stream state, dropped (with its lease) when the stream ends
struct StreamRun<'a> {
    dispatcher: &'a StreamDispatcher,
    lease: StreamLease,
    frames: FrameSender,
    state: StreamState,
    assistant_text: String,
}

impl StreamRun<'_> {
    fn session_id(&self) -> &str {
        self.lease.session_id()
    }

    fn transition(&mut self, next: StreamState) {
        tracing::trace!(
            session_id = %self.lease.session_id(),
            from = ?self.state,
            to = ?next,
            "Stream state transition"
        );
        self.state = next;
    }

    fn send(&self, frame: ServerFrame) -> std::result::Result<(), Disconnected> {
        tracing::debug!(session_id = %self.session_id(), kind = frame.kind(), "Sending frame");
        self.frames.send(frame).map_err(|_| Disconnected)
    }

    /// Forward a fragment and record it as part of the assistant turn
    fn emit_content(&mut self, content: String) -> std::result::Result<(), Disconnected> {
        self.assistant_text.push_str(&content);
        self.send(ServerFrame::chunk(content))
    }

    fn fail(&mut self, error: AgentError) -> StreamOutcome {
        self.transition(StreamState::Errored);
        let message = error.client_message();
        tracing::error!(session_id = %self.session_id(), "Stream failed: {}", error);
        if self.send(ServerFrame::error(message.clone())).is_err() {
            return StreamOutcome::Disconnected;
        }
        StreamOutcome::Errored(message)
    }

    async fn drive(&mut self, user_message: String) -> StreamOutcome {
        let dispatcher = self.dispatcher;
        let sessions = &dispatcher.sessions;
        let session_id = self.session_id().to_string();

        if let Err(e) = sessions.append_message(&session_id, MessageRole::User, user_message) {
            return self.fail(e);
        }

        let snapshot = match sessions.get(&session_id) {
            Ok(snapshot) => snapshot,
            Err(e) => return self.fail(e),
        };

        if self.send(ServerFrame::StreamStart).is_err() {
            return StreamOutcome::Disconnected;
        }

        let request = GenerationRequest {
            messages: snapshot.messages,
            system_prompt: snapshot.system_prompt,
            tools: snapshot.tools,
        };
        let session_tools: Vec<String> = request.tools.iter().map(|t| t.name.clone()).collect();

        self.transition(StreamState::AwaitingProviderEvent);
        let mut events = match snapshot.provider.stream(request).await {
            Ok(events) => events,
            Err(e) => return self.fail(e),
        };

        loop {
            let step = match events.next().await {
                Some(Ok(ProviderEvent::Content(content))) => self.emit_content(content),
                Some(Ok(ProviderEvent::ToolCall(call))) => {
                    self.handle_tool_call(call, &session_tools).await
                }
                Some(Ok(ProviderEvent::Finish)) => break,
                Some(Err(e)) => return self.fail(e),
                None => {
                    tracing::debug!(session_id = %session_id, "Provider stream ended without a finish marker");
                    break;
                }
            };

            if step.is_err() {
                tracing::info!(session_id = %session_id, "Client disconnected mid-stream");
                return StreamOutcome::Disconnected;
            }
        }

        self.finish()
    }

    async fn handle_tool_call(
        &mut self,
        call: PendingToolCall,
        session_tools: &[String],
    ) -> std::result::Result<(), Disconnected> {
        let dispatcher = self.dispatcher;
        let tools = &dispatcher.tools;
        let args_text = pretty(&call.arguments);
        self.emit_content(format!("\n🔧 calling {}({})\n", call.name, args_text))?;

        let output = if !session_tools.iter().any(|name| name == &call.name) {
            tracing::warn!(session_id = %self.session_id(), tool = %call.name, "Tool not available in session");
            serde_json::json!({ "error": format!("unknown tool: {}", call.name) })
        } else if tools.requires_confirmation(&call.name) {
            self.transition(StreamState::AwaitingConfirmation);
            let message = tools.confirmation_message(&call.name, &call.arguments);
            let frames = self.frames.clone();
            let decision = dispatcher
                .broker
                .request(
                    self.lease.session_id(),
                    &call.name,
                    call.arguments.clone(),
                    message,
                    move |request| frames.send(request.to_frame()).is_ok(),
                )
                .await;
            self.transition(StreamState::AwaitingProviderEvent);

            if decision.confirmed {
                tools.execute(&call.name, call.arguments.clone()).await
            } else {
                tracing::info!(
                    session_id = %self.session_id(),
                    tool = %call.name,
                    reason = ?decision.reason,
                    "Tool call denied"
                );
                tools.cancelled(&call.name, &call.arguments, decision.reason.as_deref())
            }
        } else {
            tools.execute(&call.name, call.arguments.clone()).await
        };

        self.emit_content(format!("✅ result: {}\n\n", pretty(&output)))?;

        if !call.respond(output) {
            tracing::debug!(session_id = %self.session_id(), "Provider dropped before receiving tool output");
        }
        Ok(())
    }

    fn finish(&mut self) -> StreamOutcome {
        self.transition(StreamState::Finished);

        let text = self.assistant_text.trim();
        let assistant_message = if text.is_empty() {
            None
        } else {
            Some(text.to_string())
        };

        if let Some(content) = &assistant_message {
            if let Err(e) = self.dispatcher.sessions.append_message(
                self.lease.session_id(),
                MessageRole::Assistant,
                content.clone(),
            ) {
                // Deleted while streaming; nothing left to record into
                tracing::debug!(session_id = %self.session_id(), "Assistant turn not recorded: {}", e);
            }
        }

        if self.send(ServerFrame::StreamEnd).is_err() {
            return StreamOutcome::Disconnected;
        }
        StreamOutcome::Finished { assistant_message }
    }
}

fn pretty(value: &Value) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ToolsConfig, UnattendedPolicy};
    use crate::provider::Provider;
    use crate::scripted_provider::{ScriptStep, ScriptedProvider};
    use crate::session::Message;
    use serde_json::json;
    use std::time::Duration;
    use ulid::Ulid;

    struct Harness {
        sessions: Arc<SessionStore>,
        broker: Arc<ConfirmationBroker>,
        dispatcher: Arc<StreamDispatcher>,
        provider: Arc<ScriptedProvider>,
        session_id: String,
    }

    fn harness(steps: Vec<ScriptStep>) -> Harness {
        harness_with_broker(
            steps,
            ConfirmationBroker::new(Duration::from_secs(30), UnattendedPolicy::AutoApprove),
        )
    }

    fn harness_with_broker(steps: Vec<ScriptStep>, broker: ConfirmationBroker) -> Harness {
        let sessions = Arc::new(SessionStore::new());
        let broker = Arc::new(broker);
        let tools = Arc::new(ToolRegistry::with_builtins(&ToolsConfig::default()));
        let provider = Arc::new(ScriptedProvider::new(steps));
        let session_id = sessions
            .create(None, tools.definitions(), provider.clone() as Arc<dyn Provider>)
            .unwrap();
        let dispatcher = Arc::new(StreamDispatcher::new(
            Arc::clone(&sessions),
            Arc::clone(&broker),
            tools,
        ));
        Harness {
            sessions,
            broker,
            dispatcher,
            provider,
            session_id,
        }
    }

    impl Harness {
        fn lease(&self) -> StreamLease {
            self.sessions.begin_stream(&self.session_id, Ulid::new()).unwrap()
        }
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<ServerFrame>) -> Vec<ServerFrame> {
        let mut frames = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            frames.push(frame);
        }
        frames
    }

    #[tokio::test]
    async fn test_content_is_forwarded_and_recorded() {
        let h = harness(vec![ScriptStep::text("4"), ScriptStep::text("")]);
        let (tx, mut rx) = mpsc::unbounded_channel();

        let outcome = h
            .dispatcher
            .run(h.lease(), "2+2".to_string(), tx)
            .await;

        assert_eq!(
            outcome,
            StreamOutcome::Finished {
                assistant_message: Some("4".to_string())
            }
        );
        assert_eq!(
            drain(&mut rx),
            vec![
                ServerFrame::StreamStart,
                ServerFrame::chunk("4"),
                ServerFrame::chunk(""),
                ServerFrame::StreamEnd,
            ]
        );
        assert_eq!(
            h.sessions.list_messages(&h.session_id).unwrap(),
            vec![Message::user("2+2"), Message::assistant("4")]
        );
        assert!(!h.sessions.is_streaming(&h.session_id).unwrap());

        // The provider saw the user turn before anything was recorded for it
        assert_eq!(h.provider.requests()[0].messages, vec![Message::user("2+2")]);
    }

    #[tokio::test]
    async fn test_whitespace_reply_is_not_recorded() {
        let h = harness(vec![ScriptStep::text("  \n ")]);
        let (tx, _rx) = mpsc::unbounded_channel();

        let outcome = h
            .dispatcher
            .run(h.lease(), "hello".to_string(), tx)
            .await;

        assert_eq!(
            outcome,
            StreamOutcome::Finished {
                assistant_message: None
            }
        );
        assert_eq!(
            h.sessions.list_messages(&h.session_id).unwrap(),
            vec![Message::user("hello")]
        );
    }

    #[tokio::test]
    async fn test_provider_error_sends_error_frame_and_releases_lease() {
        let h = harness(vec![ScriptStep::text("partial"), ScriptStep::fail("model overloaded")]);
        let (tx, mut rx) = mpsc::unbounded_channel();

        let outcome = h
            .dispatcher
            .run(h.lease(), "hi".to_string(), tx)
            .await;

        assert_eq!(outcome, StreamOutcome::Errored("model overloaded".to_string()));
        let frames = drain(&mut rx);
        assert_eq!(frames.last(), Some(&ServerFrame::error("model overloaded")));
        assert!(!frames.contains(&ServerFrame::StreamEnd));

        // History keeps the user turn only
        assert_eq!(
            h.sessions.list_messages(&h.session_id).unwrap(),
            vec![Message::user("hi")]
        );
        assert!(!h.sessions.is_streaming(&h.session_id).unwrap());
    }

    #[tokio::test]
    async fn test_ungated_tool_runs_without_confirmation() {
        let h = harness(vec![
            ScriptStep::tool("calculate", json!({"operation": "add", "a": 2, "b": 2})),
            ScriptStep::text("The answer is 4."),
        ]);
        let (tx, mut rx) = mpsc::unbounded_channel();

        h.dispatcher
            .run(h.lease(), "2+2?".to_string(), tx)
            .await;

        let frames = drain(&mut rx);
        assert!(!frames
            .iter()
            .any(|f| matches!(f, ServerFrame::ToolConfirmationRequest { .. })));
        assert_eq!(h.provider.tool_outputs()[0]["result"], json!(4.0));
    }

    #[tokio::test]
    async fn test_denied_tool_resumes_with_cancellation_payload() {
        let h = harness(vec![
            ScriptStep::tool("get_weather", json!({"location": "Paris"})),
            ScriptStep::text("Okay, I won't check."),
        ]);
        let (tx, mut rx) = mpsc::unbounded_channel();

        let dispatcher = Arc::clone(&h.dispatcher);
        let lease = h.lease();
        let run = tokio::spawn(async move {
            dispatcher
                .run(lease, "weather in Paris?".to_string(), tx)
                .await
        });

        let confirmation_id = loop {
            match rx.recv().await.unwrap() {
                ServerFrame::ToolConfirmationRequest {
                    confirmation_id,
                    tool_name,
                    message,
                    ..
                } => {
                    assert_eq!(tool_name, "get_weather");
                    assert_eq!(message, "fetch weather data for Paris?");
                    break confirmation_id;
                }
                _ => continue,
            }
        };

        h.broker
            .settle(
                &confirmation_id,
                &h.session_id,
                crate::confirmation::Decision::denied(None),
            )
            .unwrap();

        let outcome = run.await.unwrap();
        match outcome {
            StreamOutcome::Finished {
                assistant_message: Some(text),
            } => assert!(text.ends_with("Okay, I won't check.")),
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert_eq!(
            h.provider.tool_outputs(),
            vec![json!({"error": "weather request cancelled by user", "location": "Paris"})]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_unanswered_confirmation_times_out_as_denial() {
        let h = harness(vec![
            ScriptStep::tool("get_weather", json!({"location": "Oslo"})),
            ScriptStep::text("done"),
        ]);
        let (tx, mut rx) = mpsc::unbounded_channel();

        let outcome = h
            .dispatcher
            .run(h.lease(), "weather?".to_string(), tx)
            .await;

        assert!(matches!(outcome, StreamOutcome::Finished { .. }));
        assert!(drain(&mut rx)
            .iter()
            .any(|f| matches!(f, ServerFrame::ToolConfirmationRequest { .. })));
        assert_eq!(h.provider.tool_outputs()[0]["reason"], json!("timeout"));
        assert_eq!(h.broker.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_closed_connection_ends_stream() {
        let h = harness_with_broker(
            vec![ScriptStep::tool("get_weather", json!({"location": "Oslo"}))],
            ConfirmationBroker::new(Duration::from_secs(30), UnattendedPolicy::AutoDeny),
        );
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);

        let outcome = h
            .dispatcher
            .run(h.lease(), "weather?".to_string(), tx)
            .await;

        assert_eq!(outcome, StreamOutcome::Disconnected);
        assert!(!h.sessions.is_streaming(&h.session_id).unwrap());
    }

    #[tokio::test]
    async fn test_aborted_stream_releases_lease() {
        let h = harness(vec![ScriptStep::text("thinking"), ScriptStep::Stall]);
        let (tx, mut rx) = mpsc::unbounded_channel();

        let dispatcher = Arc::clone(&h.dispatcher);
        let lease = h.lease();
        let run = tokio::spawn(async move {
            dispatcher
                .run(lease, "hi".to_string(), tx)
                .await
        });

        // Wait until the chunk is out so the stream is known to be mid-flight
        while !matches!(rx.recv().await, Some(ServerFrame::StreamChunk { .. })) {}
        assert!(h.sessions.is_streaming(&h.session_id).unwrap());

        run.abort();
        assert!(run.await.unwrap_err().is_cancelled());
        assert!(!h.sessions.is_streaming(&h.session_id).unwrap());
    }
}
