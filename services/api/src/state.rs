//! Shared Application State
//!
//! `AppState` holds the resources every handler and voice session shares:
//! configuration, the active-session registry, the conversation pool and the
//! model-service connector.

use crate::config::Config;
use crate::conversations::ConversationPool;
use crate::ws::bridge::BridgeSettings;
use crate::ws::registry::SessionRegistry;
use parley_realtime::{AudioFormat, AudioOutputConfig, ClientConfig, Connector, InferenceConfig};
use std::sync::Arc;

/// Created once at startup and passed to all handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub registry: Arc<SessionRegistry>,
    pub conversations: Arc<ConversationPool>,
    pub connector: Arc<dyn Connector>,
    pub system_prompt: Arc<String>,
}

impl AppState {
    /// Realtime client settings for one voice session.
    pub fn client_config(&self) -> ClientConfig {
        ClientConfig {
            inference: InferenceConfig::default(),
            input_audio: AudioFormat::pcm16_mono(self.config.model_input_sample_rate),
            connect_timeout: self.config.connect_timeout,
        }
    }

    pub fn bridge_settings(&self) -> BridgeSettings {
        BridgeSettings {
            system_prompt: self.system_prompt.as_ref().clone(),
            output_audio: AudioOutputConfig {
                format: AudioFormat::pcm16_mono(self.config.model_output_sample_rate),
                voice_id: self.config.voice_id.clone(),
            },
            model_input_sample_rate: self.config.model_input_sample_rate,
            client_sample_rate: self.config.client_sample_rate,
            tool_timeout: self.config.tool_timeout,
            tool_grace: self.config.tool_grace,
            predecessor_wait: self.config.tool_grace + self.config.connect_timeout,
            transcripts_dir: Some(self.config.transcripts_dir.clone()),
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::config::SummaryConfig;
    use parley_core::{ContextConfig, MemoryConversationStore};
    use parley_realtime::memory_duplex;
    use std::time::Duration;

    /// State backed by an in-memory store and an unused in-memory connector.
    pub(crate) fn app_state() -> Arc<AppState> {
        let config = Config {
            bind_address: ([127, 0, 0, 1], 0).into(),
            database_url: None,
            conversations_dir: "./data/conversations".into(),
            transcripts_dir: "./data/transcripts".into(),
            model_endpoint: "ws://localhost:9000".into(),
            model_api_key: None,
            voice_id: "matthew".into(),
            model_input_sample_rate: 16_000,
            model_output_sample_rate: 24_000,
            client_sample_rate: 16_000,
            connect_timeout: Duration::from_secs(1),
            tool_timeout: Duration::from_secs(1),
            tool_grace: Duration::from_millis(100),
            context: ContextConfig::default(),
            summary: SummaryConfig {
                api_key: None,
                api_base: "https://api.openai.com/v1/".into(),
                model: "gpt-4o-mini".into(),
            },
            log_level: tracing::Level::INFO,
            prompts_path: "./prompts".into(),
        };
        let (connector, _peer) = memory_duplex();
        Arc::new(AppState {
            conversations: Arc::new(ConversationPool::new(
                config.context,
                Arc::new(MemoryConversationStore::new()),
            )),
            config: Arc::new(config),
            registry: Arc::new(SessionRegistry::new()),
            connector: Arc::new(connector),
            system_prompt: Arc::new("You are a helpful voice assistant.".into()),
        })
    }

    #[test]
    fn test_bridge_settings_follow_config() {
        let state = app_state();
        let settings = state.bridge_settings();
        assert_eq!(settings.output_audio.format.sample_rate, 24_000);
        assert_eq!(settings.client_sample_rate, 16_000);
        assert_eq!(state.client_config().input_audio.sample_rate, 16_000);
        assert_eq!(settings.predecessor_wait, Duration::from_millis(1_100));
    }
}
