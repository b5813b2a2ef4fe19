//! Client for a bidirectional speech-to-speech model service.
//!
//! - `client`: the session/prompt/content lifecycle over one duplex connection.
//! - `event`: inbound envelope parsing into [`ProtocolEvent`].
//! - `dispatcher`: fan-out of parsed events to handlers.
//! - `transport`: the [`Connector`] seam (WebSocket and in-memory).

pub mod client;
pub mod dispatcher;
pub mod error;
pub mod event;
pub mod transport;
pub mod types;
mod wire;

pub use client::{EnvelopeStream, RealtimeClient};
pub use dispatcher::{Delivery, Dispatcher, Handler};
pub use error::{RealtimeError, Result};
pub use event::{EventKind, ProtocolEvent, is_completion, parse_envelope, parse_text};
pub use transport::{Connector, Duplex, MemoryConnector, MemoryPeer, WebSocketConnector, memory_duplex};
pub use types::{
    AudioEncoding, AudioFormat, AudioOutputConfig, ClientConfig, ContentType, InferenceConfig,
    Role, SessionInfo, SessionState, ToolSpec,
};
