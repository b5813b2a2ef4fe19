//! Session, audio and capability types shared by the client and the parser.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

/// Lifecycle of one model-service session.
///
/// `Connecting` covers the span between an open transport and `sessionStart`;
/// `ContentActive` is only entered by an open audio turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionState {
    Disconnected,
    Connecting,
    SessionReady,
    PromptActive,
    ContentActive,
    PromptEnded,
    SessionEnded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Role {
    User,
    Assistant,
    System,
    Tool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ContentType {
    Text,
    Audio,
    Tool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AudioEncoding {
    Base64,
}

/// PCM audio format declared once per session for one direction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AudioFormat {
    #[serde(rename = "sampleRateHertz")]
    pub sample_rate: u32,
    #[serde(rename = "sampleSizeBits")]
    pub bit_depth: u16,
    pub channel_count: u16,
    pub encoding: AudioEncoding,
}

impl AudioFormat {
    /// 16-bit mono PCM at the given rate.
    pub fn pcm16_mono(sample_rate: u32) -> Self {
        Self {
            sample_rate,
            bit_depth: 16,
            channel_count: 1,
            encoding: AudioEncoding::Base64,
        }
    }
}

/// Output audio declaration sent with `promptStart`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioOutputConfig {
    pub format: AudioFormat,
    pub voice_id: String,
}

/// Sampling parameters sent with `sessionStart`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InferenceConfig {
    pub max_tokens: u32,
    pub top_p: f32,
    pub temperature: f32,
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            max_tokens: 1024,
            top_p: 0.9,
            temperature: 0.7,
        }
    }
}

/// A capability the model may invoke, declared once at session start.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

/// Static client settings.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub inference: InferenceConfig,
    pub input_audio: AudioFormat,
    pub connect_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            inference: InferenceConfig::default(),
            input_audio: AudioFormat::pcm16_mono(16_000),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

/// Snapshot of a client's session: identity, lifecycle and correlation ids.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionInfo {
    pub connection_id: Option<String>,
    pub state: SessionState,
    pub prompt_id: Option<String>,
    pub audio_content_id: Option<String>,
    pub input_audio: AudioFormat,
    pub output_audio: Option<AudioFormat>,
}
