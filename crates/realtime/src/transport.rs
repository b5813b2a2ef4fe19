//! Duplex transports to the speech model service.
//!
//! A [`Connector`] opens one envelope-oriented duplex per call. The WebSocket
//! connector is used in production; the in-memory pair lets a test (or a local
//! tool) play the part of the model service.

use crate::error::{RealtimeError, Result};
use async_trait::async_trait;
use futures::channel::mpsc;
use futures::{Sink, SinkExt, Stream, StreamExt, future};
use secrecy::{ExposeSecret, SecretString};
use serde_json::Value;
use std::pin::Pin;
use std::sync::Mutex;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{
        client::IntoClientRequest,
        http::HeaderValue,
        protocol::Message as WsMessage,
    },
};
use tracing::{debug, info};

/// Outbound half: serialized envelopes.
pub type OutboundSink = Pin<Box<dyn Sink<String, Error = RealtimeError> + Send>>;
/// Inbound half: raw envelope text, ending when the peer closes.
pub type InboundStream = Pin<Box<dyn Stream<Item = Result<String>> + Send>>;

/// Both halves of one opened connection.
pub struct Duplex {
    pub sink: OutboundSink,
    pub stream: InboundStream,
}

/// Opens a duplex envelope stream to the model service.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn open(&self) -> Result<Duplex>;
}

/// Connects over WebSocket, optionally authenticating with a bearer token.
pub struct WebSocketConnector {
    url: String,
    api_key: Option<SecretString>,
}

impl WebSocketConnector {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            api_key: None,
        }
    }

    pub fn with_api_key(mut self, api_key: SecretString) -> Self {
        self.api_key = Some(api_key);
        self
    }
}

#[async_trait]
impl Connector for WebSocketConnector {
    async fn open(&self) -> Result<Duplex> {
        let mut request = self
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| RealtimeError::Connection(format!("invalid endpoint: {e}")))?;
        if let Some(api_key) = &self.api_key {
            let value = format!("Bearer {}", api_key.expose_secret())
                .parse::<HeaderValue>()
                .map_err(|e| RealtimeError::Connection(format!("invalid credential: {e}")))?;
            request.headers_mut().insert("Authorization", value);
        }

        let (ws_stream, _) = connect_async(request)
            .await
            .map_err(|e| RealtimeError::Connection(e.to_string()))?;
        info!(url = %self.url, "Connected to speech model service.");
        let (ws_tx, ws_rx) = ws_stream.split();

        let sink = ws_tx
            .sink_map_err(|e| RealtimeError::Connection(e.to_string()))
            .with(|text: String| future::ready(Ok::<_, RealtimeError>(WsMessage::Text(text.into()))));

        let stream = ws_rx.filter_map(|msg| {
            future::ready(match msg {
                Ok(WsMessage::Text(text)) => Some(Ok(text.as_str().to_owned())),
                Ok(WsMessage::Binary(data)) => Some(
                    String::from_utf8(data.to_vec())
                        .map_err(|e| RealtimeError::Protocol(format!("binary frame is not UTF-8: {e}"))),
                ),
                Ok(WsMessage::Close(frame)) => {
                    debug!(?frame, "Model service sent close frame.");
                    None
                }
                Ok(_) => None,
                Err(e) => Some(Err(RealtimeError::Connection(e.to_string()))),
            })
        });

        Ok(Duplex {
            sink: Box::pin(sink),
            stream: Box::pin(stream),
        })
    }
}

/// Client side of an in-process duplex. Opens exactly once.
pub struct MemoryConnector {
    duplex: Mutex<Option<Duplex>>,
}

/// Model-service side of an in-process duplex.
pub struct MemoryPeer {
    sent: mpsc::UnboundedReceiver<String>,
    inbound: mpsc::UnboundedSender<Result<String>>,
}

/// Creates a connected in-memory pair.
pub fn memory_duplex() -> (MemoryConnector, MemoryPeer) {
    let (client_tx, peer_rx) = mpsc::unbounded::<String>();
    let (peer_tx, client_rx) = mpsc::unbounded::<Result<String>>();
    let duplex = Duplex {
        sink: Box::pin(client_tx.sink_map_err(|e| RealtimeError::Connection(e.to_string()))),
        stream: Box::pin(client_rx),
    };
    (
        MemoryConnector {
            duplex: Mutex::new(Some(duplex)),
        },
        MemoryPeer {
            sent: peer_rx,
            inbound: peer_tx,
        },
    )
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn open(&self) -> Result<Duplex> {
        self.duplex
            .lock()
            .map_err(|_| RealtimeError::Connection("memory transport poisoned".into()))?
            .take()
            .ok_or_else(|| RealtimeError::Connection("memory transport already opened".into()))
    }
}

impl MemoryPeer {
    /// Delivers one envelope to the client. Returns false once the client is gone.
    pub fn send(&self, envelope: &Value) -> bool {
        self.inbound.unbounded_send(Ok(envelope.to_string())).is_ok()
    }

    /// Delivers raw text, which need not be valid JSON.
    pub fn send_text(&self, text: impl Into<String>) -> bool {
        self.inbound.unbounded_send(Ok(text.into())).is_ok()
    }

    /// Injects a transport failure into the client's inbound stream.
    pub fn fail(&self, reason: impl Into<String>) -> bool {
        self.inbound
            .unbounded_send(Err(RealtimeError::Connection(reason.into())))
            .is_ok()
    }

    /// Ends the client's inbound stream, as a remote close would.
    pub fn hang_up(&self) {
        self.inbound.close_channel();
    }

    /// Next envelope written by the client, or `None` once its sink is closed.
    pub async fn next_sent(&mut self) -> Option<Value> {
        let text = self.sent.next().await?;
        serde_json::from_str(&text).ok()
    }

    /// Every envelope written so far, without waiting.
    pub fn drain_sent(&mut self) -> Vec<Value> {
        let mut out = Vec::new();
        while let Ok(Some(text)) = self.sent.try_next() {
            if let Ok(value) = serde_json::from_str(&text) {
                out.push(value);
            }
        }
        out
    }
}
