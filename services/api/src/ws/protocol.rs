//! Defines the WebSocket message protocol between the voice client and the bridge.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Messages sent from the client to the bridge.
#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Opens a user audio turn.
    AudioStart,
    /// One base64-encoded PCM16 frame inside the open turn.
    Audio { data: String },
    /// Closes the user audio turn.
    AudioEnd,
    /// Clears the session's visible transcript.
    Reset,
    /// Ends the session.
    Close,
}

/// Messages sent from the bridge to the client.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// The model session is open and audio may flow.
    Ready {
        session_id: String,
        conversation_id: String,
    },
    /// A chunk of base64-encoded PCM16 audio of the model's voice.
    Audio { data: String },
    /// A visible line of dialogue.
    Transcript { role: String, content: String },
    /// The model invoked a tool.
    ToolUse {
        name: String,
        call_id: String,
        input: Value,
    },
    /// A tool finished; `is_error` marks a failure carried as text.
    ToolResult {
        name: String,
        call_id: String,
        result: String,
        is_error: bool,
    },
    /// The model detected the start of a user turn; `interrupted` means barge-in.
    TurnDetected { interrupted: bool },
    /// A session-ending failure.
    Error { message: String },
}

/// One frame read from the client transport, independent of the socket library.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientFrame {
    Text(String),
    /// Raw PCM16 audio, equivalent to an `audio` message with the same bytes.
    Binary(Vec<u8>),
    Close,
}
