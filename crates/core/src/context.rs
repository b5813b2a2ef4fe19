//! Token-budgeted conversation memory.
//!
//! A [`ConversationManager`] owns one conversation. Every appended message is
//! counted and persisted; once the running total crosses the summarize
//! threshold a background compaction folds everything but the most recent
//! `verbatim_keep_tokens` into a single summary. The model sees the summary
//! followed by as many recent messages as fit in `max_tokens`.

use crate::conversation::{Conversation, ConversationMessage, MessageRole};
use crate::error::ContextError;
use crate::store::ConversationStore;
use crate::summarizer::Summarizer;
use crate::tokens::{ApproxTokenCounter, CHARS_PER_TOKEN, TokenCounter, truncate_chars};
use serde_json::{Map, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::{Mutex, MutexGuard};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContextConfig {
    pub max_tokens: usize,
    pub verbatim_keep_tokens: usize,
    pub summarize_threshold_tokens: usize,
    pub summary_max_tokens: usize,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            max_tokens: 8000,
            verbatim_keep_tokens: 2000,
            summarize_threshold_tokens: 6000,
            summary_max_tokens: 500,
        }
    }
}

impl ContextConfig {
    /// Checks the budget ordering compaction relies on.
    pub fn validate(&self) -> Result<(), ContextError> {
        let invalid = |field, reason| Err(ContextError::InvalidConfig { field, reason });
        if self.summary_max_tokens == 0 {
            return invalid("summary_max_tokens", "must be positive".into());
        }
        if self.verbatim_keep_tokens >= self.summarize_threshold_tokens {
            return invalid(
                "verbatim_keep_tokens",
                format!(
                    "{} must be below summarize_threshold_tokens ({})",
                    self.verbatim_keep_tokens, self.summarize_threshold_tokens
                ),
            );
        }
        if self.summarize_threshold_tokens >= self.max_tokens {
            return invalid(
                "summarize_threshold_tokens",
                format!(
                    "{} must be below max_tokens ({})",
                    self.summarize_threshold_tokens, self.max_tokens
                ),
            );
        }
        Ok(())
    }
}

struct State {
    conversation: Conversation,
    loaded: bool,
    /// Bumped by `clear` and by every committed compaction. A compaction that
    /// observes a different generation when it comes back discards its result.
    generation: u64,
}

pub struct ConversationManager {
    id: String,
    config: ContextConfig,
    store: Arc<dyn ConversationStore>,
    summarizer: Option<Arc<dyn Summarizer>>,
    counter: Arc<dyn TokenCounter>,
    state: Mutex<State>,
    compaction_lock: Mutex<()>,
    pending: StdMutex<Option<JoinHandle<()>>>,
    fallbacks: AtomicU64,
}

impl ConversationManager {
    pub fn new(id: impl Into<String>, config: ContextConfig, store: Arc<dyn ConversationStore>) -> Self {
        let id = id.into();
        Self {
            state: Mutex::new(State {
                conversation: Conversation::new(id.clone()),
                loaded: false,
                generation: 0,
            }),
            id,
            config,
            store,
            summarizer: None,
            counter: Arc::new(ApproxTokenCounter),
            compaction_lock: Mutex::new(()),
            pending: StdMutex::new(None),
            fallbacks: AtomicU64::new(0),
        }
    }

    pub fn with_summarizer(mut self, summarizer: Arc<dyn Summarizer>) -> Self {
        self.summarizer = Some(summarizer);
        self
    }

    pub fn with_token_counter(mut self, counter: Arc<dyn TokenCounter>) -> Self {
        self.counter = counter;
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn config(&self) -> &ContextConfig {
        &self.config
    }

    /// How many compactions fell back to truncation. A rising value means the
    /// summarizer is unhealthy.
    pub fn fallback_count(&self) -> u64 {
        self.fallbacks.load(Ordering::Relaxed)
    }

    /// Appends a message and schedules compaction if the total crossed the
    /// threshold. Returns as soon as the message is recorded and persisted.
    pub async fn add_message(self: &Arc<Self>, role: MessageRole, content: &str) -> ConversationMessage {
        self.add_message_with_metadata(role, content, Map::new()).await
    }

    pub async fn add_message_with_metadata(
        self: &Arc<Self>,
        role: MessageRole,
        content: &str,
        metadata: Map<String, Value>,
    ) -> ConversationMessage {
        let message = ConversationMessage::new(role, content, self.counter.count(content))
            .with_metadata(metadata);

        let over_threshold = {
            let mut state = self.state().await;
            state.conversation.push(message.clone());
            self.check_totals(&mut state.conversation);
            self.persist(&state.conversation).await;
            state.conversation.total_token_count > self.config.summarize_threshold_tokens
        };

        if over_threshold {
            self.schedule_compaction();
        }
        message
    }

    /// The summary (if any) followed by the recent window, within `max_tokens`.
    pub async fn get_context(&self) -> String {
        self.state().await.conversation.render(self.config.max_tokens)
    }

    pub async fn snapshot(&self) -> Conversation {
        self.state().await.conversation.clone()
    }

    /// Drops every message and the summary, and persists the empty state.
    /// A compaction in flight is discarded when it returns.
    pub async fn clear(&self) {
        let mut state = self.state().await;
        state.generation += 1;
        state.loaded = true;
        state.conversation = Conversation::new(self.id.clone());
        self.persist(&state.conversation).await;
        info!(conversation_id = %self.id, "Conversation cleared.");
    }

    /// Waits for any scheduled compaction to finish.
    pub async fn flush(&self) {
        loop {
            let handle = match self.pending.lock() {
                Ok(mut pending) => pending.take(),
                Err(_) => None,
            };
            let Some(handle) = handle else {
                return;
            };
            if let Err(e) = handle.await {
                error!(conversation_id = %self.id, error = %e, "Compaction task failed.");
            }
        }
    }

    fn schedule_compaction(self: &Arc<Self>) {
        let Ok(mut pending) = self.pending.lock() else {
            return;
        };
        if pending.as_ref().is_some_and(|handle| !handle.is_finished()) {
            debug!(conversation_id = %self.id, "Compaction already scheduled.");
            return;
        }
        let this = Arc::clone(self);
        *pending = Some(tokio::spawn(async move {
            this.compact().await;
        }));
    }

    /// Folds everything older than the verbatim tail into the summary.
    /// Returns whether the conversation changed.
    #[instrument(name = "compaction", skip(self), fields(conversation_id = %self.id))]
    pub async fn compact(&self) -> bool {
        let _exclusive = self.compaction_lock.lock().await;

        let (generation, split, old_text) = {
            let state = self.state().await;
            let conversation = &state.conversation;
            let split = conversation.split_point(self.config.verbatim_keep_tokens);
            if split == 0 {
                return false;
            }
            let old_text = fold_text(conversation.summary.as_deref(), &conversation.messages[..split]);
            (state.generation, split, old_text)
        };

        let summary = self.summarize(&old_text).await;

        let mut state = self.state().await;
        if state.generation != generation {
            debug!("Conversation changed during compaction; discarding summary.");
            return false;
        }
        state.generation += 1;

        let conversation = &mut state.conversation;
        conversation.messages.drain(..split);
        conversation.summary_tokens = self.counter.count(&summary);
        conversation.summary = Some(summary);
        conversation.recalculate_total();
        self.check_totals(conversation);
        self.persist(conversation).await;

        info!(
            folded = split,
            kept = conversation.messages.len(),
            summary_tokens = conversation.summary_tokens,
            total_tokens = conversation.total_token_count,
            "Compacted conversation."
        );
        true
    }

    async fn summarize(&self, old_text: &str) -> String {
        let outcome = match &self.summarizer {
            Some(summarizer) => summarizer
                .summarize(old_text, self.config.summary_max_tokens)
                .await
                .and_then(|summary| {
                    if summary.trim().is_empty() {
                        Err(ContextError::Summarization("empty summary".into()))
                    } else {
                        Ok(summary)
                    }
                }),
            None => Err(ContextError::Summarization("no summarizer configured".into())),
        };

        match outcome {
            Ok(summary) => summary,
            Err(e) => {
                let fallbacks = self.fallbacks.fetch_add(1, Ordering::Relaxed) + 1;
                warn!(
                    summarizer_fallback = true,
                    error = %e,
                    fallbacks,
                    "Summarization failed; falling back to truncation."
                );
                truncate_chars(old_text, self.config.summary_max_tokens * CHARS_PER_TOKEN).to_string()
            }
        }
    }

    async fn state(&self) -> MutexGuard<'_, State> {
        let mut state = self.state.lock().await;
        if !state.loaded {
            state.loaded = true;
            match self.store.load(&self.id).await {
                Ok(Some(mut conversation)) => {
                    self.check_totals(&mut conversation);
                    debug!(
                        conversation_id = %self.id,
                        messages = conversation.messages.len(),
                        "Restored conversation."
                    );
                    state.conversation = conversation;
                }
                Ok(None) => {}
                Err(e) => {
                    error!(conversation_id = %self.id, error = %e, "Failed to load conversation; starting empty.");
                }
            }
        }
        state
    }

    fn check_totals(&self, conversation: &mut Conversation) {
        if !conversation.is_consistent() {
            error!(
                conversation_id = %conversation.id,
                recorded = conversation.total_token_count,
                expected = conversation.expected_total(),
                "Token total out of step with contents; recalculating."
            );
            conversation.recalculate_total();
        }
    }

    async fn persist(&self, conversation: &Conversation) {
        if let Err(e) = self.store.save(conversation).await {
            error!(conversation_id = %conversation.id, error = %e, "Failed to persist conversation.");
        }
    }
}

fn fold_text(previous_summary: Option<&str>, messages: &[ConversationMessage]) -> String {
    let mut parts = Vec::with_capacity(messages.len() + 1);
    if let Some(summary) = previous_summary {
        parts.push(format!("Previous summary:\n{summary}\n"));
    }
    for message in messages {
        parts.push(format!("{}: {}", message.role, message.content));
    }
    parts.join("\n")
}
