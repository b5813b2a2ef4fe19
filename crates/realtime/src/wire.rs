//! Outbound envelope encoding: `{"event": {<name>: {...}}}`.

use crate::error::Result;
use crate::types::{AudioFormat, ContentType, InferenceConfig, Role, ToolSpec};
use serde::Serialize;

const TEXT_MEDIA_TYPE: &str = "text/plain";
const JSON_MEDIA_TYPE: &str = "application/json";
const LPCM_MEDIA_TYPE: &str = "audio/lpcm";
const SPEECH_AUDIO_TYPE: &str = "SPEECH";

#[derive(Serialize)]
struct Envelope<'a> {
    event: OutboundEvent<'a>,
}

#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
pub(crate) enum OutboundEvent<'a> {
    SessionStart(SessionStart<'a>),
    PromptStart(PromptStart<'a>),
    ContentStart(ContentStart<'a>),
    AudioInput(ContentChunk<'a>),
    TextInput(ContentChunk<'a>),
    ToolResult(ContentChunk<'a>),
    ContentEnd(ContentRef<'a>),
    PromptEnd(PromptRef<'a>),
    SessionEnd(EmptyBody),
}

#[derive(Serialize, Debug)]
pub(crate) struct EmptyBody {}

#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
pub(crate) struct SessionStart<'a> {
    pub inference_configuration: &'a InferenceConfig,
    pub tool_configuration: ToolConfiguration,
}

#[derive(Serialize, Debug)]
pub(crate) struct ToolConfiguration {
    pub tools: Vec<ToolEntry>,
}

#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ToolEntry {
    pub tool_spec: WireToolSpec,
}

#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
pub(crate) struct WireToolSpec {
    pub name: String,
    pub description: String,
    pub input_schema: InputSchema,
}

/// The service expects the JSON schema as an embedded string.
#[derive(Serialize, Debug)]
pub(crate) struct InputSchema {
    pub json: String,
}

impl ToolConfiguration {
    pub(crate) fn from_specs(specs: &[ToolSpec]) -> Result<Self> {
        let tools = specs
            .iter()
            .map(|spec| {
                Ok(ToolEntry {
                    tool_spec: WireToolSpec {
                        name: spec.name.clone(),
                        description: spec.description.clone(),
                        input_schema: InputSchema {
                            json: serde_json::to_string(&spec.input_schema)?,
                        },
                    },
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { tools })
    }
}

#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
pub(crate) struct MediaType {
    pub media_type: &'static str,
}

impl MediaType {
    pub(crate) fn text() -> Self {
        Self {
            media_type: TEXT_MEDIA_TYPE,
        }
    }

    pub(crate) fn json() -> Self {
        Self {
            media_type: JSON_MEDIA_TYPE,
        }
    }
}

#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
pub(crate) struct AudioConfiguration<'a> {
    pub media_type: &'static str,
    #[serde(flatten)]
    pub format: &'a AudioFormat,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub voice_id: Option<&'a str>,
    pub audio_type: &'static str,
}

impl<'a> AudioConfiguration<'a> {
    pub(crate) fn new(format: &'a AudioFormat, voice_id: Option<&'a str>) -> Self {
        Self {
            media_type: LPCM_MEDIA_TYPE,
            format,
            voice_id,
            audio_type: SPEECH_AUDIO_TYPE,
        }
    }
}

#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
pub(crate) struct PromptStart<'a> {
    pub prompt_name: &'a str,
    pub text_output_configuration: MediaType,
    pub audio_output_configuration: AudioConfiguration<'a>,
    pub tool_use_output_configuration: MediaType,
}

#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ContentStart<'a> {
    pub prompt_name: &'a str,
    pub content_name: &'a str,
    #[serde(rename = "type")]
    pub content_type: ContentType,
    pub interactive: bool,
    pub role: Role,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audio_input_configuration: Option<AudioConfiguration<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text_input_configuration: Option<MediaType>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_result_input_configuration: Option<ToolResultInputConfiguration<'a>>,
}

#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ToolResultInputConfiguration<'a> {
    pub tool_use_id: &'a str,
    #[serde(rename = "type")]
    pub content_type: ContentType,
    pub text_input_configuration: MediaType,
}

#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ContentChunk<'a> {
    pub prompt_name: &'a str,
    pub content_name: &'a str,
    pub content: &'a str,
}

#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ContentRef<'a> {
    pub prompt_name: &'a str,
    pub content_name: &'a str,
}

#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
pub(crate) struct PromptRef<'a> {
    pub prompt_name: &'a str,
}

/// Serializes one outbound event into its envelope text.
pub(crate) fn encode(event: OutboundEvent<'_>) -> Result<String> {
    Ok(serde_json::to_string(&Envelope { event })?)
}
