//! Inbound envelope parsing into a tagged event model.
//!
//! Each envelope carries one populated key under `event` (or a top-level
//! `error`). The key selects a decoder from a static table; keys the table
//! does not know become [`ProtocolEvent::Unknown`] so newer service versions
//! do not break older clients.

use crate::error::{RealtimeError, Result};
use crate::types::{ContentType, Role};
use base64::Engine;
use serde::Deserialize;
use serde_json::{Map, Value, json};
use std::collections::HashMap;
use std::sync::LazyLock;

/// One decoded protocol event.
#[derive(Debug, Clone, PartialEq)]
pub enum ProtocolEvent {
    SessionStart,
    PromptStart,
    ContentStart {
        role: Role,
        content_type: ContentType,
    },
    AudioInput {
        content_id: String,
        bytes: Vec<u8>,
    },
    TextInput {
        content_id: String,
        text: String,
    },
    ContentEnd {
        content_id: String,
    },
    ToolUse {
        call_id: String,
        name: String,
        input: Map<String, Value>,
    },
    ToolResult {
        call_id: String,
        output: String,
    },
    AudioOutput {
        bytes: Vec<u8>,
    },
    TextOutput {
        role: Role,
        text: String,
    },
    Error {
        code: String,
        message: String,
    },
    TurnDetected {
        interrupted: bool,
    },
    Completion,
    Unknown {
        raw: Value,
    },
}

/// The tag of a [`ProtocolEvent`], used as the dispatch key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    SessionStart,
    PromptStart,
    ContentStart,
    AudioInput,
    TextInput,
    ContentEnd,
    ToolUse,
    ToolResult,
    AudioOutput,
    TextOutput,
    Error,
    TurnDetected,
    Completion,
    Unknown,
}

impl ProtocolEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            ProtocolEvent::SessionStart => EventKind::SessionStart,
            ProtocolEvent::PromptStart => EventKind::PromptStart,
            ProtocolEvent::ContentStart { .. } => EventKind::ContentStart,
            ProtocolEvent::AudioInput { .. } => EventKind::AudioInput,
            ProtocolEvent::TextInput { .. } => EventKind::TextInput,
            ProtocolEvent::ContentEnd { .. } => EventKind::ContentEnd,
            ProtocolEvent::ToolUse { .. } => EventKind::ToolUse,
            ProtocolEvent::ToolResult { .. } => EventKind::ToolResult,
            ProtocolEvent::AudioOutput { .. } => EventKind::AudioOutput,
            ProtocolEvent::TextOutput { .. } => EventKind::TextOutput,
            ProtocolEvent::Error { .. } => EventKind::Error,
            ProtocolEvent::TurnDetected { .. } => EventKind::TurnDetected,
            ProtocolEvent::Completion => EventKind::Completion,
            ProtocolEvent::Unknown { .. } => EventKind::Unknown,
        }
    }
}

type Decoder = fn(&Value) -> Result<ProtocolEvent>;

static DECODERS: LazyLock<HashMap<&'static str, Decoder>> = LazyLock::new(|| {
    HashMap::from([
        ("sessionStart", decode_session_start as Decoder),
        ("promptStart", decode_prompt_start),
        ("contentStart", decode_content_start),
        ("audioInput", decode_audio_input),
        ("textInput", decode_text_input),
        ("contentEnd", decode_content_end),
        ("toolUse", decode_tool_use),
        ("toolResult", decode_tool_result),
        ("audioOutput", decode_audio_output),
        ("textOutput", decode_text_output),
        ("turnDetected", decode_turn_detected),
        ("completionEnd", decode_completion),
    ])
});

/// Parses envelope text. Invalid JSON is a protocol error.
pub fn parse_text(text: &str) -> Result<ProtocolEvent> {
    let raw: Value = serde_json::from_str(text)
        .map_err(|e| RealtimeError::Protocol(format!("envelope is not JSON: {e}")))?;
    parse_envelope(&raw)
}

/// Maps one decoded envelope onto a [`ProtocolEvent`].
pub fn parse_envelope(raw: &Value) -> Result<ProtocolEvent> {
    let envelope = raw
        .as_object()
        .ok_or_else(|| RealtimeError::Protocol("envelope is not a JSON object".into()))?;

    if let Some(error) = envelope.get("error") {
        return decode_error(error);
    }
    let Some(event) = envelope.get("event") else {
        return Ok(ProtocolEvent::Unknown { raw: raw.clone() });
    };
    let event = event
        .as_object()
        .ok_or_else(|| RealtimeError::Protocol("`event` is not an object".into()))?;

    let mut populated = event.iter().filter(|(_, body)| !body.is_null());
    let (name, body) = match (populated.next(), populated.next()) {
        (Some(entry), None) => entry,
        (None, _) => return Err(RealtimeError::Protocol("envelope carries no event".into())),
        (Some(_), Some(_)) => {
            return Err(RealtimeError::Protocol(
                "envelope carries more than one event".into(),
            ));
        }
    };

    match DECODERS.get(name.as_str()) {
        Some(decode) => decode(body),
        None => Ok(ProtocolEvent::Unknown { raw: raw.clone() }),
    }
}

/// True when the envelope is the service's end-of-completion marker.
pub fn is_completion(raw: &Value) -> bool {
    raw.get("event")
        .and_then(|event| event.get("completionEnd"))
        .is_some_and(|body| !body.is_null())
}

fn body<'a, T: Deserialize<'a>>(name: &str, value: &'a Value) -> Result<T> {
    T::deserialize(value).map_err(|e| RealtimeError::Protocol(format!("invalid {name}: {e}")))
}

fn decode_base64(name: &str, content: &str) -> Result<Vec<u8>> {
    base64::engine::general_purpose::STANDARD
        .decode(content)
        .map_err(|e| RealtimeError::Protocol(format!("invalid {name} payload: {e}")))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ContentStartBody {
    role: Role,
    #[serde(rename = "type")]
    content_type: ContentType,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ContentChunkBody {
    #[serde(default, alias = "contentId")]
    content_name: String,
    content: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ContentEndBody {
    #[serde(default, alias = "contentName")]
    content_id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ToolUseBody {
    tool_use_id: String,
    tool_name: String,
    #[serde(default)]
    content: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ToolResultBody {
    #[serde(default)]
    tool_use_id: Option<String>,
    #[serde(default)]
    content_name: String,
    content: String,
}

#[derive(Deserialize)]
struct TextOutputBody {
    role: Role,
    content: String,
}

#[derive(Deserialize)]
struct AudioOutputBody {
    content: String,
}

#[derive(Deserialize)]
struct TurnDetectedBody {
    #[serde(default)]
    interrupted: bool,
}

#[derive(Deserialize)]
struct ErrorBody {
    #[serde(default)]
    code: Value,
    #[serde(default)]
    message: String,
}

fn decode_session_start(_: &Value) -> Result<ProtocolEvent> {
    Ok(ProtocolEvent::SessionStart)
}

fn decode_prompt_start(_: &Value) -> Result<ProtocolEvent> {
    Ok(ProtocolEvent::PromptStart)
}

fn decode_completion(_: &Value) -> Result<ProtocolEvent> {
    Ok(ProtocolEvent::Completion)
}

fn decode_content_start(value: &Value) -> Result<ProtocolEvent> {
    let b: ContentStartBody = body("contentStart", value)?;
    Ok(ProtocolEvent::ContentStart {
        role: b.role,
        content_type: b.content_type,
    })
}

fn decode_audio_input(value: &Value) -> Result<ProtocolEvent> {
    let b: ContentChunkBody = body("audioInput", value)?;
    Ok(ProtocolEvent::AudioInput {
        bytes: decode_base64("audioInput", &b.content)?,
        content_id: b.content_name,
    })
}

fn decode_text_input(value: &Value) -> Result<ProtocolEvent> {
    let b: ContentChunkBody = body("textInput", value)?;
    Ok(ProtocolEvent::TextInput {
        content_id: b.content_name,
        text: b.content,
    })
}

fn decode_content_end(value: &Value) -> Result<ProtocolEvent> {
    let b: ContentEndBody = body("contentEnd", value)?;
    Ok(ProtocolEvent::ContentEnd {
        content_id: b.content_id,
    })
}

/// Tool input is decoded leniently: anything that is not a JSON object is
/// preserved under a `raw` key instead of failing the call.
fn decode_tool_use(value: &Value) -> Result<ProtocolEvent> {
    let b: ToolUseBody = body("toolUse", value)?;
    let input = if b.content.trim().is_empty() {
        Map::new()
    } else {
        match serde_json::from_str::<Value>(&b.content) {
            Ok(Value::Object(map)) => map,
            _ => match json!({ "raw": b.content }) {
                Value::Object(map) => map,
                _ => Map::new(),
            },
        }
    };
    Ok(ProtocolEvent::ToolUse {
        call_id: b.tool_use_id,
        name: b.tool_name,
        input,
    })
}

fn decode_tool_result(value: &Value) -> Result<ProtocolEvent> {
    let b: ToolResultBody = body("toolResult", value)?;
    Ok(ProtocolEvent::ToolResult {
        call_id: b.tool_use_id.unwrap_or(b.content_name),
        output: b.content,
    })
}

fn decode_audio_output(value: &Value) -> Result<ProtocolEvent> {
    let b: AudioOutputBody = body("audioOutput", value)?;
    Ok(ProtocolEvent::AudioOutput {
        bytes: decode_base64("audioOutput", &b.content)?,
    })
}

fn decode_text_output(value: &Value) -> Result<ProtocolEvent> {
    let b: TextOutputBody = body("textOutput", value)?;
    Ok(ProtocolEvent::TextOutput {
        role: b.role,
        text: b.content,
    })
}

fn decode_turn_detected(value: &Value) -> Result<ProtocolEvent> {
    let b: TurnDetectedBody = body("turnDetected", value)?;
    Ok(ProtocolEvent::TurnDetected {
        interrupted: b.interrupted,
    })
}

fn decode_error(value: &Value) -> Result<ProtocolEvent> {
    let b: ErrorBody = body("error", value)?;
    let code = match b.code {
        Value::String(code) => code,
        Value::Null => String::new(),
        other => other.to_string(),
    };
    Ok(ProtocolEvent::Error {
        code,
        message: b.message,
    })
}
