//! Durable storage for conversation documents.

use crate::conversation::Conversation;
use crate::error::ContextError;
use async_trait::async_trait;
use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::debug;

/// Loads and saves whole conversation documents by id.
#[async_trait]
pub trait ConversationStore: Send + Sync {
    async fn load(&self, id: &str) -> Result<Option<Conversation>, ContextError>;
    async fn save(&self, conversation: &Conversation) -> Result<(), ContextError>;
}

/// One JSON document per conversation under a root directory.
///
/// Writes go to a temporary sibling first and are renamed into place, so a
/// crash mid-write leaves the previous document intact.
#[derive(Debug, Clone)]
pub struct FileConversationStore {
    root: PathBuf,
}

impl FileConversationStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path_for(&self, id: &str) -> PathBuf {
        self.root.join(format!("{}.json", sanitize_id(id)))
    }
}

/// Maps an arbitrary id onto a safe file stem.
pub fn sanitize_id(id: &str) -> String {
    let cleaned: String = id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.is_empty() {
        "_".to_string()
    } else {
        cleaned
    }
}

#[async_trait]
impl ConversationStore for FileConversationStore {
    async fn load(&self, id: &str) -> Result<Option<Conversation>, ContextError> {
        let path = self.path_for(id);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let conversation = serde_json::from_slice(&bytes)?;
        debug!(path = %path.display(), "Loaded conversation document.");
        Ok(Some(conversation))
    }

    async fn save(&self, conversation: &Conversation) -> Result<(), ContextError> {
        tokio::fs::create_dir_all(&self.root).await?;
        let path = self.path_for(&conversation.id);
        let tmp = path.with_extension("json.tmp");
        let body = serde_json::to_vec_pretty(conversation)?;
        tokio::fs::write(&tmp, body).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }
}

/// Keeps serialized documents in memory. Used by tests and when no storage is
/// configured.
#[derive(Debug, Default)]
pub struct MemoryConversationStore {
    documents: Mutex<HashMap<String, String>>,
}

impl MemoryConversationStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.documents.lock().map(|d| d.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl ConversationStore for MemoryConversationStore {
    async fn load(&self, id: &str) -> Result<Option<Conversation>, ContextError> {
        let document = self
            .documents
            .lock()
            .map_err(|_| ContextError::Persistence("store lock poisoned".into()))?
            .get(id)
            .cloned();
        match document {
            Some(text) => Ok(Some(serde_json::from_str(&text)?)),
            None => Ok(None),
        }
    }

    async fn save(&self, conversation: &Conversation) -> Result<(), ContextError> {
        let text = serde_json::to_string(conversation)?;
        self.documents
            .lock()
            .map_err(|_| ContextError::Persistence("store lock poisoned".into()))?
            .insert(conversation.id.clone(), text);
        Ok(())
    }
}
