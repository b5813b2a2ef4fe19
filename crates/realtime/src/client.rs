//! The protocol client: one duplex connection, one session.
//!
//! The client sequences the session/prompt/content lifecycle and keeps the
//! correlation ids. Outbound envelopes are written under a single lock, so a
//! bracketed content block (start, payload, end) is never interleaved with
//! other writes. Inbound envelopes are exposed once through [`RealtimeClient::receive`].

use crate::error::{RealtimeError, Result};
use crate::event::is_completion;
use crate::transport::{Connector, InboundStream, OutboundSink};
use crate::types::{
    AudioFormat, AudioOutputConfig, ClientConfig, ContentType, Role, SessionInfo, SessionState,
    ToolSpec,
};
use crate::wire::{self, OutboundEvent};
use base64::Engine;
use futures::{SinkExt, Stream, StreamExt, stream};
use serde_json::Value;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Lazy, non-restartable sequence of raw inbound envelopes.
///
/// Items are decoded JSON; a non-JSON frame yields a non-fatal protocol error
/// and the sequence continues. The sequence ends after the completion marker,
/// after a transport failure, or when the service closes the stream.
pub type EnvelopeStream = Pin<Box<dyn Stream<Item = Result<Value>> + Send>>;

struct Inner {
    state: SessionState,
    connection_id: Option<String>,
    prompt_id: Option<String>,
    audio_content_id: Option<String>,
    output_audio: Option<AudioFormat>,
    sink: Option<OutboundSink>,
}

pub struct RealtimeClient {
    connector: Arc<dyn Connector>,
    config: ClientConfig,
    inner: Mutex<Inner>,
    inbound: StdMutex<Option<InboundStream>>,
    active: Arc<AtomicBool>,
}

impl RealtimeClient {
    pub fn new(connector: Arc<dyn Connector>, config: ClientConfig) -> Self {
        Self {
            connector,
            config,
            inner: Mutex::new(Inner {
                state: SessionState::Disconnected,
                connection_id: None,
                prompt_id: None,
                audio_content_id: None,
                output_audio: None,
                sink: None,
            }),
            inbound: StdMutex::new(None),
            active: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Whether the connection is open and has not failed.
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    pub async fn session(&self) -> SessionInfo {
        let inner = self.inner.lock().await;
        SessionInfo {
            connection_id: inner.connection_id.clone(),
            state: inner.state,
            prompt_id: inner.prompt_id.clone(),
            audio_content_id: inner.audio_content_id.clone(),
            input_audio: self.config.input_audio.clone(),
            output_audio: inner.output_audio.clone(),
        }
    }

    /// Opens the duplex stream and generates fresh correlation ids.
    ///
    /// Bounded by the configured connect timeout; any failure is a
    /// [`RealtimeError::Connection`].
    pub async fn connect(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if self.is_active() {
            return Err(RealtimeError::InvalidState {
                operation: "connect",
                state: inner.state,
            });
        }
        inner.state = SessionState::Connecting;

        let opened = tokio::time::timeout(self.config.connect_timeout, self.connector.open()).await;
        let duplex = match opened {
            Ok(Ok(duplex)) => duplex,
            Ok(Err(e)) => {
                inner.state = SessionState::Disconnected;
                return Err(match e {
                    RealtimeError::Connection(reason) => RealtimeError::Connection(reason),
                    other => RealtimeError::Connection(other.to_string()),
                });
            }
            Err(_) => {
                inner.state = SessionState::Disconnected;
                return Err(RealtimeError::Connection(format!(
                    "timed out after {:?}",
                    self.config.connect_timeout
                )));
            }
        };

        let connection_id = Uuid::new_v4().to_string();
        info!(%connection_id, "Realtime connection established.");
        inner.connection_id = Some(connection_id);
        inner.prompt_id = Some(Uuid::new_v4().to_string());
        inner.audio_content_id = None;
        inner.output_audio = None;
        inner.sink = Some(duplex.sink);
        self.set_inbound(Some(duplex.stream));
        self.active.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Sends inference parameters and the complete capability list.
    ///
    /// Callable once per session; there is no way to amend capabilities later.
    pub async fn start_session(&self, capabilities: &[ToolSpec]) -> Result<()> {
        let mut inner = self.inner.lock().await;
        self.require(&inner, "start session", &[SessionState::Connecting])?;
        let text = wire::encode(OutboundEvent::SessionStart(wire::SessionStart {
            inference_configuration: &self.config.inference,
            tool_configuration: wire::ToolConfiguration::from_specs(capabilities)?,
        }))?;
        self.transmit(&mut inner, text).await?;
        inner.state = SessionState::SessionReady;
        debug!(capabilities = capabilities.len(), "Session started.");
        Ok(())
    }

    /// Declares the output text/audio formats and opens the prompt.
    pub async fn start_prompt(&self, output: &AudioOutputConfig) -> Result<()> {
        let mut inner = self.inner.lock().await;
        self.require(&inner, "start prompt", &[SessionState::SessionReady])?;
        let prompt_id = prompt_id(&inner)?;
        let text = wire::encode(OutboundEvent::PromptStart(wire::PromptStart {
            prompt_name: &prompt_id,
            text_output_configuration: wire::MediaType::text(),
            audio_output_configuration: wire::AudioConfiguration::new(
                &output.format,
                Some(&output.voice_id),
            ),
            tool_use_output_configuration: wire::MediaType::json(),
        }))?;
        self.transmit(&mut inner, text).await?;
        inner.state = SessionState::PromptActive;
        inner.output_audio = Some(output.format.clone());
        Ok(())
    }

    /// Sends a SYSTEM text block. Must precede the first audio turn.
    pub async fn send_system_message(&self, text: &str) -> Result<()> {
        let mut inner = self.inner.lock().await;
        self.require(&inner, "send system message", &[SessionState::PromptActive])?;
        let prompt_id = prompt_id(&inner)?;
        let content_id = Uuid::new_v4().to_string();

        let start = wire::encode(OutboundEvent::ContentStart(wire::ContentStart {
            prompt_name: &prompt_id,
            content_name: &content_id,
            content_type: ContentType::Text,
            interactive: false,
            role: Role::System,
            audio_input_configuration: None,
            text_input_configuration: Some(wire::MediaType::text()),
            tool_result_input_configuration: None,
        }))?;
        let body = wire::encode(OutboundEvent::TextInput(wire::ContentChunk {
            prompt_name: &prompt_id,
            content_name: &content_id,
            content: text,
        }))?;
        let end = content_end(&prompt_id, &content_id)?;

        for envelope in [start, body, end] {
            self.transmit(&mut inner, envelope).await?;
        }
        Ok(())
    }

    /// Opens a USER audio content block and returns its content id.
    pub async fn begin_audio_turn(&self) -> Result<String> {
        let mut inner = self.inner.lock().await;
        self.require(&inner, "begin audio turn", &[SessionState::PromptActive])?;
        let prompt_id = prompt_id(&inner)?;
        let content_id = Uuid::new_v4().to_string();
        let text = wire::encode(OutboundEvent::ContentStart(wire::ContentStart {
            prompt_name: &prompt_id,
            content_name: &content_id,
            content_type: ContentType::Audio,
            interactive: true,
            role: Role::User,
            audio_input_configuration: Some(wire::AudioConfiguration::new(
                &self.config.input_audio,
                None,
            )),
            text_input_configuration: None,
            tool_result_input_configuration: None,
        }))?;
        self.transmit(&mut inner, text).await?;
        inner.state = SessionState::ContentActive;
        inner.audio_content_id = Some(content_id.clone());
        Ok(content_id)
    }

    /// Sends one PCM frame. Only valid inside an audio turn.
    pub async fn send_audio_frame(&self, bytes: &[u8]) -> Result<()> {
        let mut inner = self.inner.lock().await;
        self.require(&inner, "send audio frame", &[SessionState::ContentActive])?;
        let prompt_id = prompt_id(&inner)?;
        let content_id = inner
            .audio_content_id
            .clone()
            .ok_or(RealtimeError::InvalidState {
                operation: "send audio frame",
                state: inner.state,
            })?;
        let encoded = base64::engine::general_purpose::STANDARD.encode(bytes);
        let text = wire::encode(OutboundEvent::AudioInput(wire::ContentChunk {
            prompt_name: &prompt_id,
            content_name: &content_id,
            content: &encoded,
        }))?;
        self.transmit(&mut inner, text).await
    }

    /// Closes the open audio content block.
    pub async fn end_audio_turn(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;
        self.require(&inner, "end audio turn", &[SessionState::ContentActive])?;
        self.close_audio_turn(&mut inner).await
    }

    /// Sends a TOOL_RESULT block for `call_id`. Non-string results are serialized.
    pub async fn send_tool_result(&self, call_id: &str, result: &Value) -> Result<()> {
        let mut inner = self.inner.lock().await;
        self.require(
            &inner,
            "send tool result",
            &[SessionState::PromptActive, SessionState::ContentActive],
        )?;
        let prompt_id = prompt_id(&inner)?;
        let content_id = Uuid::new_v4().to_string();
        let content = match result {
            Value::String(text) => text.clone(),
            other => serde_json::to_string(other)?,
        };

        let start = wire::encode(OutboundEvent::ContentStart(wire::ContentStart {
            prompt_name: &prompt_id,
            content_name: &content_id,
            content_type: ContentType::Tool,
            interactive: false,
            role: Role::Tool,
            audio_input_configuration: None,
            text_input_configuration: None,
            tool_result_input_configuration: Some(wire::ToolResultInputConfiguration {
                tool_use_id: call_id,
                content_type: ContentType::Text,
                text_input_configuration: wire::MediaType::text(),
            }),
        }))?;
        let body = wire::encode(OutboundEvent::ToolResult(wire::ContentChunk {
            prompt_name: &prompt_id,
            content_name: &content_id,
            content: &content,
        }))?;
        let end = content_end(&prompt_id, &content_id)?;

        for envelope in [start, body, end] {
            self.transmit(&mut inner, envelope).await?;
        }
        debug!(%call_id, "Tool result sent.");
        Ok(())
    }

    /// Ends the prompt, closing an open audio turn first.
    pub async fn end_prompt(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;
        self.require(
            &inner,
            "end prompt",
            &[SessionState::PromptActive, SessionState::ContentActive],
        )?;
        if inner.state == SessionState::ContentActive {
            self.close_audio_turn(&mut inner).await?;
        }
        let prompt_id = prompt_id(&inner)?;
        let text = wire::encode(OutboundEvent::PromptEnd(wire::PromptRef {
            prompt_name: &prompt_id,
        }))?;
        self.transmit(&mut inner, text).await?;
        inner.state = SessionState::PromptEnded;
        Ok(())
    }

    /// Sends `sessionEnd`. Best effort: failures are logged, never returned.
    pub async fn end_session(&self) {
        let mut inner = self.inner.lock().await;
        if !self.is_active() || inner.state == SessionState::SessionEnded {
            return;
        }
        let sent = match wire::encode(OutboundEvent::SessionEnd(wire::EmptyBody {})) {
            Ok(text) => self.transmit(&mut inner, text).await,
            Err(e) => Err(e),
        };
        if let Err(e) = sent {
            warn!(error = %e, "Failed to send sessionEnd.");
        }
        inner.state = SessionState::SessionEnded;
    }

    /// Closes the transport and marks the client inactive. Idempotent.
    pub async fn close(&self) {
        let mut inner = self.inner.lock().await;
        self.active.store(false, Ordering::SeqCst);
        if let Some(mut sink) = inner.sink.take() {
            if let Err(e) = sink.close().await {
                debug!(error = %e, "Error while closing realtime sink.");
            }
        }
        self.set_inbound(None);
        if inner.state != SessionState::SessionEnded {
            inner.state = SessionState::Disconnected;
        }
        inner.audio_content_id = None;
    }

    /// Takes the inbound envelope sequence. Can be called once per connection.
    pub fn receive(&self) -> Result<EnvelopeStream> {
        let inbound = self
            .inbound
            .lock()
            .map_err(|_| RealtimeError::Connection("inbound stream lock poisoned".into()))?
            .take();
        let Some(inbound) = inbound else {
            return Err(if self.is_active() {
                RealtimeError::InvalidState {
                    operation: "receive",
                    state: SessionState::PromptActive,
                }
            } else {
                RealtimeError::NotConnected
            });
        };

        let active = self.active.clone();
        let envelopes = stream::unfold((inbound, false), move |(mut inbound, finished)| {
            let active = active.clone();
            async move {
                if finished {
                    return None;
                }
                match inbound.next().await {
                    Some(Ok(text)) => match serde_json::from_str::<Value>(&text) {
                        Ok(value) => {
                            let done = is_completion(&value);
                            Some((Ok(value), (inbound, done)))
                        }
                        Err(e) => Some((
                            Err(RealtimeError::Protocol(format!("envelope is not JSON: {e}"))),
                            (inbound, false),
                        )),
                    },
                    Some(Err(e)) => {
                        let fatal = e.is_fatal();
                        if fatal {
                            active.store(false, Ordering::SeqCst);
                        }
                        Some((Err(e), (inbound, fatal)))
                    }
                    None => {
                        debug!("Realtime inbound stream closed.");
                        active.store(false, Ordering::SeqCst);
                        None
                    }
                }
            }
        });
        Ok(Box::pin(envelopes))
    }

    fn set_inbound(&self, stream: Option<InboundStream>) {
        match self.inbound.lock() {
            Ok(mut slot) => *slot = stream,
            Err(poisoned) => *poisoned.into_inner() = stream,
        }
    }

    fn require(&self, inner: &Inner, operation: &'static str, allowed: &[SessionState]) -> Result<()> {
        if !self.is_active() {
            return Err(RealtimeError::NotConnected);
        }
        if !allowed.contains(&inner.state) {
            return Err(RealtimeError::InvalidState {
                operation,
                state: inner.state,
            });
        }
        Ok(())
    }

    async fn close_audio_turn(&self, inner: &mut Inner) -> Result<()> {
        let prompt_id = prompt_id(inner)?;
        let Some(content_id) = inner.audio_content_id.take() else {
            return Ok(());
        };
        let text = content_end(&prompt_id, &content_id)?;
        self.transmit(inner, text).await?;
        inner.state = SessionState::PromptActive;
        Ok(())
    }

    /// Writes one envelope. A write failure marks the client inactive.
    async fn transmit(&self, inner: &mut Inner, text: String) -> Result<()> {
        let sink = inner.sink.as_mut().ok_or(RealtimeError::NotConnected)?;
        if let Err(e) = sink.send(text).await {
            self.active.store(false, Ordering::SeqCst);
            return Err(match e {
                RealtimeError::Connection(reason) => RealtimeError::Connection(reason),
                other => RealtimeError::Connection(other.to_string()),
            });
        }
        Ok(())
    }
}

fn prompt_id(inner: &Inner) -> Result<String> {
    inner.prompt_id.clone().ok_or(RealtimeError::NotConnected)
}

fn content_end(prompt_id: &str, content_id: &str) -> Result<String> {
    wire::encode(OutboundEvent::ContentEnd(wire::ContentRef {
        prompt_name: prompt_id,
        content_name: content_id,
    }))
}
