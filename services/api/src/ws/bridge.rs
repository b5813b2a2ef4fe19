//! The session bridge: one client transport, one model-service session.
//!
//! After the startup sequence the bridge runs two loops on the same task.
//! Client frames are translated into audio-turn calls on the realtime client;
//! model envelopes go through a [`Dispatcher`] whose handlers forward audio and
//! transcripts to the client and spawn tool round trips. Whatever ends the
//! session, teardown runs once before the lease is released.

use super::protocol::{ClientFrame, ClientMessage, ServerMessage};
use super::registry::SessionLease;
use super::tools::{CallTicket, ToolTaskSet};
use super::transcript::{TranscriptLog, is_interruption};
use crate::audio::{PcmResampler, decode_base64, encode_base64};
use anyhow::{Context, Result, anyhow};
use futures::{Sink, SinkExt, Stream, StreamExt};
use parley_core::{CapabilityExecutor, ConversationManager, MessageRole, ToolExecutionError};
use parley_realtime::{
    AudioOutputConfig, Dispatcher, EnvelopeStream, EventKind, ProtocolEvent, RealtimeClient,
    RealtimeError, Role, ToolSpec,
};
use serde_json::Value;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

type ClientFrames = Pin<Box<dyn Stream<Item = ClientFrame> + Send>>;

/// Per-session settings derived from the service configuration.
#[derive(Debug, Clone)]
pub struct BridgeSettings {
    /// Persona and instructions sent as the SYSTEM block.
    pub system_prompt: String,
    pub output_audio: AudioOutputConfig,
    pub model_input_sample_rate: u32,
    pub client_sample_rate: u32,
    pub tool_timeout: Duration,
    pub tool_grace: Duration,
    /// How long a new session waits for the one it replaced to finish teardown.
    pub predecessor_wait: Duration,
    /// Directory for the append-only transcript log; `None` keeps it in memory.
    pub transcripts_dir: Option<PathBuf>,
}

/// Channels the handlers and tool tasks write into.
#[derive(Clone)]
struct Outputs {
    client: mpsc::UnboundedSender<ServerMessage>,
    transcript: Arc<TranscriptLog>,
    recorder: Option<mpsc::UnboundedSender<(MessageRole, String)>>,
}

impl Outputs {
    fn notify(&self, message: ServerMessage) {
        if self.client.send(message).is_err() {
            debug!("Client writer has stopped; dropping outbound message.");
        }
    }

    fn record(&self, role: MessageRole, content: &str) {
        if let Some(recorder) = &self.recorder {
            if recorder.send((role, content.to_string())).is_err() {
                warn!(%role, "Conversation recorder has stopped; turn not recorded.");
            }
        }
    }
}

pub struct SessionBridge {
    session_id: String,
    client: Arc<RealtimeClient>,
    executor: Arc<dyn CapabilityExecutor>,
    settings: BridgeSettings,
    conversation: Option<Arc<ConversationManager>>,
    transcript: Option<Arc<TranscriptLog>>,
}

impl SessionBridge {
    pub fn new(
        session_id: impl Into<String>,
        client: Arc<RealtimeClient>,
        executor: Arc<dyn CapabilityExecutor>,
        settings: BridgeSettings,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            client,
            executor,
            settings,
            conversation: None,
            transcript: None,
        }
    }

    /// Records visible user and assistant turns into `manager` and seeds the
    /// system message with its context.
    pub fn with_conversation(mut self, manager: Arc<ConversationManager>) -> Self {
        self.conversation = Some(manager);
        self
    }

    /// Uses `transcript` instead of opening one from the settings.
    pub fn with_transcript(mut self, transcript: Arc<TranscriptLog>) -> Self {
        self.transcript = Some(transcript);
        self
    }

    /// Runs the session to completion. Teardown and lease release happen on
    /// every exit path; a session-ending failure is reported to the client
    /// with an `error` message and returned.
    pub async fn run<S, R>(self, lease: SessionLease, sink: S, stream: R) -> Result<()>
    where
        S: Sink<ServerMessage, Error = anyhow::Error> + Send + 'static,
        R: Stream<Item = ClientFrame> + Send + 'static,
    {
        let (client_tx, mut client_rx) = mpsc::unbounded_channel::<ServerMessage>();
        let writer = tokio::spawn(async move {
            let mut sink = Box::pin(sink);
            while let Some(message) = client_rx.recv().await {
                if let Err(e) = sink.send(message).await {
                    warn!(error = ?e, "Failed to write to client; stopping writer.");
                    break;
                }
            }
            if let Err(e) = sink.close().await {
                debug!(error = ?e, "Error while closing client sink.");
            }
        });

        let transcript = match (&self.transcript, &self.settings.transcripts_dir) {
            (Some(transcript), _) => Arc::clone(transcript),
            (None, Some(dir)) => Arc::new(TranscriptLog::with_file(dir, &self.session_id)),
            (None, None) => Arc::new(TranscriptLog::in_memory()),
        };

        let (recorder_tx, recorder) = match &self.conversation {
            Some(manager) => {
                let (tx, mut rx) = mpsc::unbounded_channel::<(MessageRole, String)>();
                let manager = Arc::clone(manager);
                let task = tokio::spawn(async move {
                    while let Some((role, content)) = rx.recv().await {
                        manager.add_message(role, &content).await;
                    }
                });
                (Some(tx), Some(task))
            }
            None => (None, None),
        };

        let outputs = Outputs {
            client: client_tx,
            transcript: Arc::clone(&transcript),
            recorder: recorder_tx,
        };
        let tools = Arc::new(ToolTaskSet::new());

        let result = self
            .serve(&lease, Box::pin(stream), &outputs, &tools)
            .await;
        self.teardown(&tools, &outputs).await;
        transcript.close().await;

        if let Err(e) = &result {
            error!(error = ?e, "Voice session failed.");
            outputs.notify(ServerMessage::Error {
                message: format!("{e:#}"),
            });
        }
        drop(outputs);

        if let Some(recorder) = recorder {
            if let Err(e) = recorder.await {
                error!(error = %e, "Conversation recorder task failed.");
            }
        }
        let writer_abort = writer.abort_handle();
        if tokio::time::timeout(self.settings.tool_grace, writer)
            .await
            .is_err()
        {
            warn!("Client writer did not finish in time; aborting.");
            writer_abort.abort();
        }

        let released = lease.release();
        info!(released, "Voice session torn down.");
        result
    }

    async fn serve(
        &self,
        lease: &SessionLease,
        frames: ClientFrames,
        outputs: &Outputs,
        tools: &Arc<ToolTaskSet>,
    ) -> Result<()> {
        lease.wait_for_predecessor(self.settings.predecessor_wait).await;

        self.client
            .connect()
            .await
            .context("Failed to connect to the model service")?;

        let capabilities = match self.executor.capabilities().await {
            Ok(capabilities) => capabilities,
            Err(e) => {
                warn!(error = %e, "Could not list capabilities; starting without tools.");
                Vec::new()
            }
        };
        let specs: Vec<ToolSpec> = capabilities
            .into_iter()
            .map(|c| ToolSpec {
                name: c.name,
                description: c.description,
                input_schema: c.input_schema,
            })
            .collect();

        self.client
            .start_session(&specs)
            .await
            .context("Failed to start the model session")?;
        self.client
            .start_prompt(&self.settings.output_audio)
            .await
            .context("Failed to start the prompt")?;
        let system_message = self.system_message().await;
        self.client
            .send_system_message(&system_message)
            .await
            .context("Failed to send the system message")?;

        let dispatcher = self.dispatcher(outputs, tools)?;
        let envelopes = self
            .client
            .receive()
            .context("Model event stream unavailable")?;

        outputs.notify(ServerMessage::Ready {
            session_id: self.session_id.clone(),
            conversation_id: self
                .conversation
                .as_ref()
                .map(|m| m.id().to_string())
                .unwrap_or_default(),
        });
        info!(capabilities = specs.len(), "Voice session ready.");

        tokio::select! {
            result = self.client_loop(frames, outputs) => result,
            result = model_loop(envelopes, &dispatcher) => result,
            _ = lease.cancelled() => {
                info!("Session replaced by a newer connection.");
                Ok(())
            }
        }
    }

    async fn system_message(&self) -> String {
        let prompt = self.settings.system_prompt.clone();
        let Some(manager) = &self.conversation else {
            return prompt;
        };
        let context = manager.get_context().await;
        if context.trim().is_empty() {
            prompt
        } else {
            format!("{prompt}\n\nConversation so far:\n{context}")
        }
    }

    fn dispatcher(&self, outputs: &Outputs, tools: &Arc<ToolTaskSet>) -> Result<Dispatcher> {
        let mut dispatcher = Dispatcher::new();

        let resampler = Arc::new(StdMutex::new(PcmResampler::new(
            self.settings.output_audio.format.sample_rate,
            self.settings.client_sample_rate,
        )?));
        let out = outputs.clone();
        let audio = Arc::clone(&resampler);
        dispatcher.on(EventKind::AudioOutput, move |event| {
            let ProtocolEvent::AudioOutput { bytes } = event else {
                return Ok(());
            };
            let pcm = audio
                .lock()
                .map_err(|_| anyhow!("output resampler lock poisoned"))?
                .process(bytes)?;
            if !pcm.is_empty() {
                out.notify(ServerMessage::Audio {
                    data: encode_base64(&pcm),
                });
            }
            Ok(())
        });

        // The end of a model content block releases audio held for resampling.
        for kind in [EventKind::ContentEnd, EventKind::Completion] {
            let out = outputs.clone();
            let audio = Arc::clone(&resampler);
            dispatcher.on(kind, move |_| {
                let pcm = audio
                    .lock()
                    .map_err(|_| anyhow!("output resampler lock poisoned"))?
                    .flush()?;
                if !pcm.is_empty() {
                    out.notify(ServerMessage::Audio {
                        data: encode_base64(&pcm),
                    });
                }
                Ok(())
            });
        }

        let out = outputs.clone();
        dispatcher.on(EventKind::TextOutput, move |event| {
            let ProtocolEvent::TextOutput { role, text } = event else {
                return Ok(());
            };
            if is_interruption(text) {
                out.notify(ServerMessage::TurnDetected { interrupted: true });
                return Ok(());
            }
            let label = role_label(*role);
            if !out.transcript.record_text(label, text) {
                return Ok(());
            }
            out.notify(ServerMessage::Transcript {
                role: label.to_string(),
                content: text.clone(),
            });
            match role {
                Role::User => out.record(MessageRole::User, text),
                Role::Assistant => out.record(MessageRole::Assistant, text),
                Role::System | Role::Tool => {}
            }
            Ok(())
        });

        let out = outputs.clone();
        dispatcher.on(EventKind::TurnDetected, move |event| {
            if let ProtocolEvent::TurnDetected { interrupted } = event {
                out.notify(ServerMessage::TurnDetected {
                    interrupted: *interrupted,
                });
            }
            Ok(())
        });

        let out = outputs.clone();
        let tools = Arc::clone(tools);
        let client = Arc::clone(&self.client);
        let executor = Arc::clone(&self.executor);
        let timeout = self.settings.tool_timeout;
        dispatcher.on(EventKind::ToolUse, move |event| {
            let ProtocolEvent::ToolUse {
                call_id,
                name,
                input,
            } = event
            else {
                return Ok(());
            };
            let input = Value::Object(input.clone());
            info!(%call_id, tool = %name, "Model requested a tool.");
            out.notify(ServerMessage::ToolUse {
                name: name.clone(),
                call_id: call_id.clone(),
                input: input.clone(),
            });
            out.transcript.record_tool_call(name, call_id, &input);

            let round_trip = |ticket| {
                tool_round_trip(
                    Arc::clone(&client),
                    Arc::clone(&executor),
                    out.clone(),
                    ticket,
                    call_id.clone(),
                    name.clone(),
                    input,
                    timeout,
                )
            };
            if tools.spawn(call_id, name, round_trip) {
                Ok(())
            } else {
                Err(anyhow!("tool call {call_id} arrived after teardown began"))
            }
        });

        dispatcher.on(EventKind::Error, |event| {
            if let ProtocolEvent::Error { code, message } = event {
                warn!(%code, %message, "Model service reported an error.");
            }
            Ok(())
        });

        Ok(dispatcher)
    }

    async fn client_loop(&self, mut frames: ClientFrames, outputs: &Outputs) -> Result<()> {
        let mut input = PcmResampler::new(
            self.settings.client_sample_rate,
            self.settings.model_input_sample_rate,
        )?;

        while let Some(frame) = frames.next().await {
            let message = match frame {
                ClientFrame::Text(text) => match serde_json::from_str::<ClientMessage>(&text) {
                    Ok(message) => message,
                    Err(e) => {
                        warn!(error = %e, "Ignoring unrecognized client message.");
                        continue;
                    }
                },
                ClientFrame::Binary(bytes) => {
                    self.forward_audio(&mut input, &bytes).await?;
                    continue;
                }
                ClientFrame::Close => {
                    info!("Client transport closed.");
                    break;
                }
            };

            match message {
                ClientMessage::AudioStart => {
                    input.reset();
                    tolerate(self.client.begin_audio_turn().await.map(|_| ()))?;
                }
                ClientMessage::Audio { data } => match decode_base64(&data) {
                    Ok(bytes) => self.forward_audio(&mut input, &bytes).await?,
                    Err(e) => warn!(error = %e, "Dropping undecodable audio frame."),
                },
                ClientMessage::AudioEnd => tolerate(self.client.end_audio_turn().await)?,
                ClientMessage::Reset => {
                    outputs.transcript.clear();
                    info!("Transcript cleared by client.");
                }
                ClientMessage::Close => {
                    info!("Client requested close.");
                    break;
                }
            }
        }
        Ok(())
    }

    async fn forward_audio(&self, input: &mut PcmResampler, bytes: &[u8]) -> Result<()> {
        let pcm = input.process(bytes)?;
        if pcm.is_empty() {
            return Ok(());
        }
        tolerate(self.client.send_audio_frame(&pcm).await)
    }

    /// Resolves outstanding tool calls and closes the model session.
    async fn teardown(&self, tools: &ToolTaskSet, outputs: &Outputs) {
        for call in tools.drain(self.settings.tool_grace).await {
            warn!(call_id = %call.call_id, tool = %call.name, "Tool call unresolved at teardown.");
            let message = format!("Tool {} did not complete before the session ended.", call.name);
            if self.client.is_active() {
                if let Err(e) = self
                    .client
                    .send_tool_result(&call.call_id, &Value::String(message.clone()))
                    .await
                {
                    debug!(call_id = %call.call_id, error = %e, "Could not deliver tool error result.");
                }
            }
            outputs
                .transcript
                .record_tool_result(&call.name, &call.call_id, &message, true);
            outputs.notify(ServerMessage::ToolResult {
                name: call.name,
                call_id: call.call_id,
                result: message,
                is_error: true,
            });
        }

        if let Err(e) = self.client.end_prompt().await {
            debug!(error = %e, "Prompt not ended cleanly.");
        }
        self.client.end_session().await;
        self.client.close().await;
    }
}

/// Runs one tool call and sends exactly one result for it. A call still
/// executing when teardown cancels it resolves with an error result.
#[allow(clippy::too_many_arguments)]
async fn tool_round_trip(
    client: Arc<RealtimeClient>,
    executor: Arc<dyn CapabilityExecutor>,
    outputs: Outputs,
    ticket: CallTicket,
    call_id: String,
    name: String,
    input: Value,
    timeout: Duration,
) {
    let outcome = tokio::select! {
        executed = tokio::time::timeout(timeout, executor.execute(&name, input)) => {
            executed.unwrap_or_else(|_| Err(ToolExecutionError::Timeout(timeout)))
        }
        _ = ticket.cancelled() => Err(ToolExecutionError::Failed(format!(
            "{name} did not complete before the session ended"
        ))),
    };
    let (payload, is_error) = match outcome {
        Ok(value) => (value, false),
        Err(e) => {
            warn!(%call_id, tool = %name, error = %e, "Tool execution failed.");
            (Value::String(e.to_string()), true)
        }
    };

    ticket.begin_sending();
    if let Err(e) = client.send_tool_result(&call_id, &payload).await {
        error!(%call_id, error = %e, "Failed to send tool result.");
    }
    let result = match payload {
        Value::String(text) => text,
        other => other.to_string(),
    };
    outputs
        .transcript
        .record_tool_result(&name, &call_id, &result, is_error);
    outputs.notify(ServerMessage::ToolResult {
        name,
        call_id,
        result,
        is_error,
    });
}

async fn model_loop(mut envelopes: EnvelopeStream, dispatcher: &Dispatcher) -> Result<()> {
    while let Some(item) = envelopes.next().await {
        match item {
            Ok(raw) => {
                dispatcher.dispatch_envelope(&raw);
            }
            Err(e) if e.is_fatal() => {
                return Err(anyhow::Error::new(e).context("Model service connection failed"));
            }
            Err(e) => warn!(error = %e, "Dropping unreadable model envelope."),
        }
    }
    info!("Model event stream ended.");
    Ok(())
}

/// Lets the session continue past requests the model session rejects, such as
/// audio outside a turn. A lost connection still ends it.
fn tolerate(result: parley_realtime::Result<()>) -> Result<()> {
    match result {
        Ok(()) => Ok(()),
        Err(e @ (RealtimeError::Connection(_) | RealtimeError::NotConnected)) => {
            Err(anyhow::Error::new(e).context("Model session lost"))
        }
        Err(e) => {
            warn!(error = %e, "Client request rejected by the model session.");
            Ok(())
        }
    }
}

fn role_label(role: Role) -> &'static str {
    match role {
        Role::User => "user",
        Role::Assistant => "assistant",
        Role::System => "system",
        Role::Tool => "tool",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ws::registry::SessionRegistry;
    use async_trait::async_trait;
    use futures::channel::mpsc as fmpsc;
    use parley_core::{CapabilitySpec, ContextConfig, MemoryConversationStore};
    use parley_realtime::transport::OutboundSink;
    use parley_realtime::{
        AudioFormat, ClientConfig, Connector, Duplex, MemoryConnector, MemoryPeer, memory_duplex,
    };
    use serde_json::json;
    use std::task::{Context as TaskContext, Poll};
    use tokio::sync::Notify;
    use tokio::task::JoinHandle;

    fn settings() -> BridgeSettings {
        BridgeSettings {
            system_prompt: "You are a helpful voice assistant.".into(),
            output_audio: AudioOutputConfig {
                format: AudioFormat::pcm16_mono(16_000),
                voice_id: "matthew".into(),
            },
            model_input_sample_rate: 16_000,
            client_sample_rate: 16_000,
            tool_timeout: Duration::from_secs(5),
            tool_grace: Duration::from_millis(100),
            predecessor_wait: Duration::from_secs(1),
            transcripts_dir: None,
        }
    }

    /// Echoes its input, or fails when the tool is named `explode`.
    struct EchoExecutor;

    #[async_trait]
    impl CapabilityExecutor for EchoExecutor {
        async fn capabilities(&self) -> Result<Vec<CapabilitySpec>, ToolExecutionError> {
            Ok(vec![CapabilitySpec {
                name: "echo".into(),
                description: "Echoes its input.".into(),
                input_schema: json!({"type": "object"}),
            }])
        }

        async fn execute(&self, name: &str, params: Value) -> Result<Value, ToolExecutionError> {
            match name {
                "explode" => Err(ToolExecutionError::Failed("boom".into())),
                _ => Ok(params),
            }
        }
    }

    /// Blocks every call until the gate opens.
    struct GatedExecutor {
        gate: Arc<Notify>,
    }

    #[async_trait]
    impl CapabilityExecutor for GatedExecutor {
        async fn capabilities(&self) -> Result<Vec<CapabilitySpec>, ToolExecutionError> {
            Ok(Vec::new())
        }

        async fn execute(&self, _name: &str, _params: Value) -> Result<Value, ToolExecutionError> {
            self.gate.notified().await;
            Ok(json!("late answer"))
        }
    }

    /// Panics inside every call.
    struct PanickingExecutor;

    #[async_trait]
    impl CapabilityExecutor for PanickingExecutor {
        async fn capabilities(&self) -> Result<Vec<CapabilitySpec>, ToolExecutionError> {
            Ok(Vec::new())
        }

        async fn execute(&self, _name: &str, _params: Value) -> Result<Value, ToolExecutionError> {
            panic!("executor bug")
        }
    }

    struct Harness {
        peer: MemoryPeer,
        frames: fmpsc::UnboundedSender<ClientFrame>,
        outbound: fmpsc::UnboundedReceiver<ServerMessage>,
        handle: JoinHandle<Result<()>>,
    }

    impl Harness {
        fn start(
            registry: &Arc<SessionRegistry>,
            session_id: &str,
            executor: Arc<dyn CapabilityExecutor>,
            conversation: Option<Arc<ConversationManager>>,
        ) -> Self {
            let (connector, peer) = memory_duplex();
            let mut bridge = Self::bridge(session_id, Arc::new(connector), executor, settings());
            if let Some(manager) = conversation {
                bridge = bridge.with_conversation(manager);
            }
            Self::launch(registry, bridge, peer)
        }

        fn bridge(
            session_id: &str,
            connector: Arc<dyn Connector>,
            executor: Arc<dyn CapabilityExecutor>,
            settings: BridgeSettings,
        ) -> SessionBridge {
            let client = Arc::new(RealtimeClient::new(connector, ClientConfig::default()));
            SessionBridge::new(session_id, client, executor, settings)
        }

        fn launch(registry: &Arc<SessionRegistry>, bridge: SessionBridge, peer: MemoryPeer) -> Self {
            let lease = registry.acquire(&bridge.session_id);

            let (frames, frames_rx) = fmpsc::unbounded();
            let (out_tx, outbound) = fmpsc::unbounded();
            let sink = out_tx.sink_map_err(anyhow::Error::from);
            let handle = tokio::spawn(bridge.run(lease, sink, frames_rx));
            Self {
                peer,
                frames,
                outbound,
                handle,
            }
        }

        fn send(&self, message: Value) {
            self.frames
                .unbounded_send(ClientFrame::Text(message.to_string()))
                .unwrap();
        }

        async fn next(&mut self) -> ServerMessage {
            self.outbound.next().await.expect("bridge closed the client sink")
        }

        async fn finish(self) -> (Result<()>, MemoryPeer, Vec<ServerMessage>) {
            let Harness {
                peer,
                frames,
                outbound,
                handle,
            } = self;
            let result = handle.await.unwrap();
            drop(frames);
            let rest = outbound.collect::<Vec<_>>().await;
            (result, peer, rest)
        }
    }

    fn count(envelopes: &[Value], name: &str) -> usize {
        envelopes
            .iter()
            .filter(|e| e["event"].get(name).is_some())
            .count()
    }

    fn event_name(envelope: &Value) -> Option<&str> {
        envelope["event"].as_object()?.keys().next().map(String::as_str)
    }

    #[tokio::test]
    async fn test_close_mid_turn_tears_down_once() {
        let registry = Arc::new(SessionRegistry::new());
        let mut h = Harness::start(&registry, "s1", Arc::new(EchoExecutor), None);

        assert!(matches!(h.next().await, ServerMessage::Ready { ref session_id, .. } if session_id == "s1"));
        assert!(registry.is_active());

        h.send(json!({"type": "audio_start"}));
        h.send(json!({"type": "audio", "data": encode_base64(&[0, 0, 1, 0])}));
        h.send(json!({"type": "close"}));

        let (result, mut peer, _) = h.finish().await;
        result.unwrap();
        assert!(!registry.is_active());

        let sent = peer.drain_sent();
        assert_eq!(count(&sent, "sessionStart"), 1);
        assert_eq!(count(&sent, "audioInput"), 1);
        assert_eq!(count(&sent, "promptEnd"), 1);
        assert_eq!(count(&sent, "sessionEnd"), 1);

        // The open audio turn is closed before the prompt ends.
        let tools = &sent[0]["event"]["sessionStart"]["toolConfiguration"]["tools"];
        assert_eq!(tools.as_array().map(Vec::len), Some(1));
        let prompt_end = sent.iter().position(|e| e["event"].get("promptEnd").is_some()).unwrap();
        assert!(sent[..prompt_end].iter().rev().any(|e| e["event"].get("contentEnd").is_some()));
    }

    #[tokio::test]
    async fn test_failing_tool_sends_exactly_one_result() {
        let registry = Arc::new(SessionRegistry::new());
        let mut h = Harness::start(&registry, "s1", Arc::new(EchoExecutor), None);
        assert!(matches!(h.next().await, ServerMessage::Ready { .. }));

        h.peer.send(&json!({"event": {"toolUse": {
            "toolUseId": "c1", "toolName": "explode", "content": "{\"x\": 1}"
        }}}));

        assert_eq!(
            h.next().await,
            ServerMessage::ToolUse {
                name: "explode".into(),
                call_id: "c1".into(),
                input: json!({"x": 1}),
            }
        );
        match h.next().await {
            ServerMessage::ToolResult {
                call_id, is_error, result, ..
            } => {
                assert_eq!(call_id, "c1");
                assert!(is_error);
                assert!(result.contains("boom"));
            }
            other => panic!("unexpected message {other:?}"),
        }

        h.send(json!({"type": "close"}));
        let (result, mut peer, rest) = h.finish().await;
        result.unwrap();
        assert!(rest.iter().all(|m| !matches!(m, ServerMessage::ToolResult { .. })));

        let sent = peer.drain_sent();
        assert_eq!(count(&sent, "toolResult"), 1);
        let tool_block = sent
            .iter()
            .filter(|e| {
                e["event"]["contentStart"]["toolResultInputConfiguration"]["toolUseId"] == "c1"
            })
            .count();
        assert_eq!(tool_block, 1);
    }

    #[tokio::test]
    async fn test_slow_tool_does_not_delay_audio() {
        let registry = Arc::new(SessionRegistry::new());
        let gate = Arc::new(Notify::new());
        let executor = Arc::new(GatedExecutor { gate: gate.clone() });
        let mut h = Harness::start(&registry, "s1", executor, None);
        assert!(matches!(h.next().await, ServerMessage::Ready { .. }));

        h.peer.send(&json!({"event": {"toolUse": {
            "toolUseId": "c1", "toolName": "slow", "content": ""
        }}}));
        h.peer.send(&json!({"event": {"audioOutput": {"content": encode_base64(&[1, 0, 2, 0])}}}));

        assert!(matches!(h.next().await, ServerMessage::ToolUse { .. }));
        assert_eq!(
            h.next().await,
            ServerMessage::Audio {
                data: encode_base64(&[1, 0, 2, 0]),
            }
        );

        gate.notify_one();
        assert!(matches!(
            h.next().await,
            ServerMessage::ToolResult { ref result, is_error: false, .. } if result == "late answer"
        ));

        h.send(json!({"type": "close"}));
        h.finish().await.0.unwrap();
    }

    #[tokio::test]
    async fn test_panicked_tool_gets_error_result_at_teardown() {
        let registry = Arc::new(SessionRegistry::new());
        let mut h = Harness::start(&registry, "s1", Arc::new(PanickingExecutor), None);
        assert!(matches!(h.next().await, ServerMessage::Ready { .. }));

        h.peer.send(&json!({"event": {"toolUse": {
            "toolUseId": "c9", "toolName": "broken", "content": ""
        }}}));
        assert!(matches!(h.next().await, ServerMessage::ToolUse { .. }));

        h.send(json!({"type": "close"}));
        let (result, mut peer, rest) = h.finish().await;
        result.unwrap();

        assert!(rest.iter().any(|m| matches!(
            m,
            ServerMessage::ToolResult { call_id, is_error: true, .. } if call_id == "c9"
        )));
        let sent = peer.drain_sent();
        assert_eq!(count(&sent, "toolResult"), 1);
        assert_eq!(count(&sent, "sessionEnd"), 1);
    }

    #[tokio::test]
    async fn test_new_connection_replaces_active_session() {
        let registry = Arc::new(SessionRegistry::new());
        let mut first = Harness::start(&registry, "s1", Arc::new(EchoExecutor), None);
        assert!(matches!(first.next().await, ServerMessage::Ready { .. }));

        let mut second = Harness::start(&registry, "s2", Arc::new(EchoExecutor), None);
        let (result, mut peer, _) = first.finish().await;
        result.unwrap();
        assert_eq!(count(&peer.drain_sent(), "sessionEnd"), 1);

        assert!(matches!(second.next().await, ServerMessage::Ready { ref session_id, .. } if session_id == "s2"));
        assert_eq!(registry.active_id().as_deref(), Some("s2"));

        second.send(json!({"type": "close"}));
        second.finish().await.0.unwrap();
        assert!(!registry.is_active());
    }

    #[tokio::test]
    async fn test_model_transport_failure_reports_error() {
        let registry = Arc::new(SessionRegistry::new());
        let mut h = Harness::start(&registry, "s1", Arc::new(EchoExecutor), None);
        assert!(matches!(h.next().await, ServerMessage::Ready { .. }));

        h.peer.fail("connection reset");
        let (result, _peer, rest) = h.finish().await;
        assert!(result.is_err());
        assert!(matches!(rest.last(), Some(ServerMessage::Error { message }) if message.contains("connection reset")));
        assert!(!registry.is_active());
    }

    #[tokio::test]
    async fn test_transcripts_are_forwarded_and_recorded() {
        let registry = Arc::new(SessionRegistry::new());
        let manager = Arc::new(ConversationManager::new(
            "kitchen",
            ContextConfig::default(),
            Arc::new(MemoryConversationStore::new()),
        ));
        let mut h = Harness::start(&registry, "s1", Arc::new(EchoExecutor), Some(manager.clone()));
        assert!(matches!(
            h.next().await,
            ServerMessage::Ready { ref conversation_id, .. } if conversation_id == "kitchen"
        ));

        h.peer.send(&json!({"event": {"textOutput": {"role": "USER", "content": "What time is it?"}}}));
        h.peer.send(&json!({"event": {"textOutput": {"role": "ASSISTANT", "content": "{\"interrupted\": true}"}}}));
        h.peer.send(&json!({"event": {"textOutput": {"role": "ASSISTANT", "content": "Almost noon."}}}));

        assert_eq!(
            h.next().await,
            ServerMessage::Transcript {
                role: "user".into(),
                content: "What time is it?".into(),
            }
        );
        assert_eq!(h.next().await, ServerMessage::TurnDetected { interrupted: true });
        assert!(matches!(h.next().await, ServerMessage::Transcript { ref role, .. } if role == "assistant"));

        h.send(json!({"type": "close"}));
        h.finish().await.0.unwrap();

        let conversation = manager.snapshot().await;
        let recorded: Vec<_> = conversation
            .messages
            .iter()
            .map(|m| (m.role, m.content.as_str()))
            .collect();
        assert_eq!(
            recorded,
            vec![
                (MessageRole::User, "What time is it?"),
                (MessageRole::Assistant, "Almost noon."),
            ]
        );
    }

    /// Passes envelopes through but leaves the flush after the first
    /// `toolResult` pending without a wake-up, like a congested socket.
    struct StallingSink {
        inner: OutboundSink,
        stall_next_flush: bool,
        stalled: bool,
    }

    impl Sink<String> for StallingSink {
        type Error = RealtimeError;

        fn poll_ready(mut self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<parley_realtime::Result<()>> {
            self.inner.as_mut().poll_ready(cx)
        }

        fn start_send(mut self: Pin<&mut Self>, item: String) -> parley_realtime::Result<()> {
            if !self.stalled && item.contains("\"toolResult\"") {
                self.stall_next_flush = true;
            }
            self.inner.as_mut().start_send(item)
        }

        fn poll_flush(mut self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<parley_realtime::Result<()>> {
            if self.stall_next_flush {
                self.stall_next_flush = false;
                self.stalled = true;
                return Poll::Pending;
            }
            self.inner.as_mut().poll_flush(cx)
        }

        fn poll_close(mut self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<parley_realtime::Result<()>> {
            self.inner.as_mut().poll_close(cx)
        }
    }

    struct StallingConnector(MemoryConnector);

    #[async_trait]
    impl Connector for StallingConnector {
        async fn open(&self) -> parley_realtime::Result<Duplex> {
            let duplex = self.0.open().await?;
            Ok(Duplex {
                sink: Box::pin(StallingSink {
                    inner: duplex.sink,
                    stall_next_flush: false,
                    stalled: false,
                }),
                stream: duplex.stream,
            })
        }
    }

    #[tokio::test]
    async fn test_stalled_tool_result_is_never_sent_twice() {
        let registry = Arc::new(SessionRegistry::new());
        let (connector, peer) = memory_duplex();
        let bridge = Harness::bridge(
            "s1",
            Arc::new(StallingConnector(connector)),
            Arc::new(EchoExecutor),
            settings(),
        );
        let mut h = Harness::launch(&registry, bridge, peer);
        assert!(matches!(h.next().await, ServerMessage::Ready { .. }));

        h.peer.send(&json!({"event": {"toolUse": {
            "toolUseId": "c1", "toolName": "echo", "content": "{}"
        }}}));
        assert!(matches!(h.next().await, ServerMessage::ToolUse { .. }));

        let mut sent = Vec::new();
        while count(&sent, "toolResult") == 0 {
            sent.push(h.peer.next_sent().await.expect("model side closed early"));
        }

        h.send(json!({"type": "close"}));
        let (result, mut peer, _) = h.finish().await;
        result.unwrap();
        sent.extend(peer.drain_sent());

        assert_eq!(count(&sent, "toolResult"), 1);
        let tool_blocks = sent
            .iter()
            .filter(|e| {
                e["event"]["contentStart"]["toolResultInputConfiguration"]["toolUseId"] == "c1"
            })
            .count();
        assert_eq!(tool_blocks, 1);
        assert_eq!(count(&sent, "sessionEnd"), 1);
        assert!(!registry.is_active());
    }

    #[tokio::test]
    async fn test_cancelled_tool_resolves_with_its_own_error_result() {
        let registry = Arc::new(SessionRegistry::new());
        let executor = Arc::new(GatedExecutor {
            gate: Arc::new(Notify::new()),
        });
        let mut h = Harness::start(&registry, "s1", executor, None);
        assert!(matches!(h.next().await, ServerMessage::Ready { .. }));

        h.peer.send(&json!({"event": {"toolUse": {
            "toolUseId": "c3", "toolName": "stuck", "content": ""
        }}}));
        assert!(matches!(h.next().await, ServerMessage::ToolUse { .. }));

        h.send(json!({"type": "close"}));
        let (result, mut peer, rest) = h.finish().await;
        result.unwrap();

        let results: Vec<_> = rest
            .iter()
            .filter(|m| matches!(m, ServerMessage::ToolResult { .. }))
            .collect();
        assert_eq!(results.len(), 1);
        assert!(matches!(
            results[0],
            ServerMessage::ToolResult { result, is_error: true, .. }
                if result.contains("did not complete before the session ended")
        ));

        let sent = peer.drain_sent();
        assert_eq!(count(&sent, "toolResult"), 1);
        let tool_result = sent.iter().position(|e| e["event"].get("toolResult").is_some()).unwrap();
        assert_eq!(event_name(&sent[tool_result + 1]), Some("contentEnd"));
    }

    #[tokio::test]
    async fn test_reset_clears_transcript_and_session_continues() {
        let registry = Arc::new(SessionRegistry::new());
        let transcript = Arc::new(TranscriptLog::in_memory());
        let (connector, peer) = memory_duplex();
        let bridge = Harness::bridge("s1", Arc::new(connector), Arc::new(EchoExecutor), settings())
            .with_transcript(transcript.clone());
        let mut h = Harness::launch(&registry, bridge, peer);
        assert!(matches!(h.next().await, ServerMessage::Ready { .. }));

        h.peer.send(&json!({"event": {"textOutput": {"role": "USER", "content": "Turn on the lights."}}}));
        assert!(matches!(h.next().await, ServerMessage::Transcript { .. }));
        assert_eq!(transcript.entries().len(), 1);

        h.send(json!({"type": "reset"}));
        for _ in 0..100 {
            if transcript.entries().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(transcript.entries().is_empty());

        h.peer.send(&json!({"event": {"textOutput": {"role": "ASSISTANT", "content": "Done."}}}));
        assert_eq!(
            h.next().await,
            ServerMessage::Transcript {
                role: "assistant".into(),
                content: "Done.".into(),
            }
        );
        let entries = transcript.entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].content, "Done.");

        h.send(json!({"type": "close"}));
        h.finish().await.0.unwrap();
    }

    #[tokio::test]
    async fn test_binary_frames_are_forwarded_as_audio() {
        let registry = Arc::new(SessionRegistry::new());
        let mut h = Harness::start(&registry, "s1", Arc::new(EchoExecutor), None);
        assert!(matches!(h.next().await, ServerMessage::Ready { .. }));

        h.send(json!({"type": "audio_start"}));
        h.frames
            .unbounded_send(ClientFrame::Binary(vec![7, 0, 9, 0]))
            .unwrap();
        h.send(json!({"type": "audio_end"}));
        h.send(json!({"type": "close"}));

        let (result, mut peer, _) = h.finish().await;
        result.unwrap();
        let sent = peer.drain_sent();
        let audio: Vec<_> = sent
            .iter()
            .filter_map(|e| e["event"]["audioInput"]["content"].as_str())
            .collect();
        assert_eq!(audio, vec![encode_base64(&[7, 0, 9, 0])]);
    }

    #[tokio::test]
    async fn test_model_content_end_flushes_resampled_audio() {
        let registry = Arc::new(SessionRegistry::new());
        let mut rates = settings();
        rates.output_audio.format = AudioFormat::pcm16_mono(24_000);
        let (connector, peer) = memory_duplex();
        let bridge = Harness::bridge("s1", Arc::new(connector), Arc::new(EchoExecutor), rates);
        let mut h = Harness::launch(&registry, bridge, peer);
        assert!(matches!(h.next().await, ServerMessage::Ready { .. }));

        // 100 samples at 24 kHz is less than one resampler chunk.
        let short = crate::audio::encode_pcm16(&[0.25; 100]);
        h.peer.send(&json!({"event": {"audioOutput": {"content": encode_base64(&short)}}}));
        h.peer.send(&json!({"event": {"contentEnd": {"contentName": "a1"}}}));

        match h.next().await {
            ServerMessage::Audio { data } => {
                let samples = decode_base64(&data).unwrap().len() / 2;
                assert!(samples > 0 && samples <= 67, "got {samples}");
            }
            other => panic!("unexpected message {other:?}"),
        }

        h.send(json!({"type": "close"}));
        h.finish().await.0.unwrap();
    }
}
