use crate::error::ContextError;
use async_openai::{
    Client,
    config::OpenAIConfig,
    types::{
        ChatCompletionRequestSystemMessageArgs, ChatCompletionRequestUserMessageArgs,
        CreateChatCompletionRequestArgs, CreateChatCompletionResponse,
    },
};
use async_trait::async_trait;

const DEFAULT_PROMPT: &str = "You compress conversation history. Summarize the transcript you are \
given into a short factual account of what was discussed, decided, and left open. Keep names, \
numbers, and commitments. If a previous summary is included, fold it into the new one. Reply \
with the summary only.";

/// Condenses older conversation text into a bounded summary.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Summarizer: Send + Sync {
    /// Returns a summary of `text` no longer than roughly `max_tokens` tokens.
    async fn summarize(&self, text: &str, max_tokens: usize) -> Result<String, ContextError>;
}

/// A [`Summarizer`] backed by any OpenAI-compatible chat completion API.
pub struct LlmSummarizer {
    client: Client<OpenAIConfig>,
    model: String,
    prompt: String,
}

impl LlmSummarizer {
    /// * `config` - API key and base URL of the completion service.
    /// * `model` - The model identifier to summarize with (e.g., "gpt-4o-mini").
    pub fn new(config: OpenAIConfig, model: impl Into<String>) -> Self {
        Self {
            client: Client::with_config(config),
            model: model.into(),
            prompt: DEFAULT_PROMPT.to_string(),
        }
    }

    pub fn with_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.prompt = prompt.into();
        self
    }

    pub fn model(&self) -> &str {
        &self.model
    }
}

#[async_trait]
impl Summarizer for LlmSummarizer {
    async fn summarize(&self, text: &str, max_tokens: usize) -> Result<String, ContextError> {
        let failed = |e: async_openai::error::OpenAIError| ContextError::Summarization(e.to_string());

        let system = ChatCompletionRequestSystemMessageArgs::default()
            .content(self.prompt.as_str())
            .build()
            .map_err(failed)?;
        let user = ChatCompletionRequestUserMessageArgs::default()
            .content(text)
            .build()
            .map_err(failed)?;
        let request = CreateChatCompletionRequestArgs::default()
            .model(&self.model)
            .max_completion_tokens(u32::try_from(max_tokens).unwrap_or(u32::MAX))
            .messages(vec![system.into(), user.into()])
            .build()
            .map_err(failed)?;

        let response: CreateChatCompletionResponse =
            self.client.chat().create(request).await.map_err(failed)?;

        response
            .choices
            .first()
            .and_then(|choice| choice.message.content.clone())
            .map(|content| content.trim().to_string())
            .filter(|content| !content.is_empty())
            .ok_or_else(|| ContextError::Summarization("completion had no text content".into()))
    }
}
