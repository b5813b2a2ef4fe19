//! One [`ConversationManager`] per conversation id, shared by the voice
//! sessions and the REST handlers.

use parley_core::{
    ContextConfig, ContextError, ConversationManager, ConversationStore, Summarizer,
};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

pub struct ConversationPool {
    config: ContextConfig,
    store: Arc<dyn ConversationStore>,
    summarizer: Option<Arc<dyn Summarizer>>,
    managers: Mutex<HashMap<String, Arc<ConversationManager>>>,
}

impl ConversationPool {
    pub fn new(config: ContextConfig, store: Arc<dyn ConversationStore>) -> Self {
        Self {
            config,
            store,
            summarizer: None,
            managers: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_summarizer(mut self, summarizer: Arc<dyn Summarizer>) -> Self {
        self.summarizer = Some(summarizer);
        self
    }

    /// The manager for `id`, created on first use. Its state loads lazily.
    pub async fn get(&self, id: &str) -> Arc<ConversationManager> {
        let mut managers = self.managers.lock().await;
        if let Some(manager) = managers.get(id) {
            return Arc::clone(manager);
        }
        debug!(conversation_id = %id, "Creating conversation manager.");
        let mut manager = ConversationManager::new(id, self.config, Arc::clone(&self.store));
        if let Some(summarizer) = &self.summarizer {
            manager = manager.with_summarizer(Arc::clone(summarizer));
        }
        let manager = Arc::new(manager);
        managers.insert(id.to_string(), Arc::clone(&manager));
        manager
    }

    /// The manager for `id` if the conversation exists in memory or in the store.
    pub async fn find(&self, id: &str) -> Result<Option<Arc<ConversationManager>>, ContextError> {
        if let Some(manager) = self.managers.lock().await.get(id) {
            return Ok(Some(Arc::clone(manager)));
        }
        match self.store.load(id).await? {
            Some(_) => Ok(Some(self.get(id).await)),
            None => Ok(None),
        }
    }

    /// Summarizer fallbacks across every live manager.
    pub async fn fallback_count(&self) -> u64 {
        self.managers
            .lock()
            .await
            .values()
            .map(|m| m.fallback_count())
            .sum()
    }

    /// Waits for scheduled compactions on every manager.
    pub async fn flush_all(&self) {
        let managers: Vec<_> = self.managers.lock().await.values().cloned().collect();
        for manager in managers {
            manager.flush().await;
        }
    }
}
