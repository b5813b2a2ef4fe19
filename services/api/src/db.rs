//! Data Access Layer
//!
//! PostgreSQL persistence for conversations. Each conversation is one JSONB
//! document keyed by its id and replaced on every save.

use anyhow::Result;
use async_trait::async_trait;
use parley_core::{ContextError, Conversation, ConversationStore};
use sqlx::PgPool;
use sqlx::types::Json;

/// A wrapper around the `PgPool` to provide a clear data access interface.
#[derive(Clone)]
pub struct Db {
    pool: PgPool,
}

impl Db {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Runs all pending `sqlx` migrations.
    pub async fn run_migrations(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    pub async fn load_conversation(&self, id: &str) -> Result<Option<Conversation>> {
        let document = sqlx::query_scalar::<_, Json<Conversation>>(
            "SELECT document FROM conversations WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(document.map(|Json(conversation)| conversation))
    }

    pub async fn save_conversation(&self, conversation: &Conversation) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO conversations (id, document, updated_at)
            VALUES ($1, $2, NOW())
            ON CONFLICT (id) DO UPDATE
            SET document = EXCLUDED.document, updated_at = NOW()
            "#,
        )
        .bind(&conversation.id)
        .bind(Json(conversation))
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl ConversationStore for Db {
    async fn load(&self, id: &str) -> Result<Option<Conversation>, ContextError> {
        self.load_conversation(id)
            .await
            .map_err(|e| ContextError::Persistence(format!("{e:#}")))
    }

    async fn save(&self, conversation: &Conversation) -> Result<(), ContextError> {
        self.save_conversation(conversation)
            .await
            .map_err(|e| ContextError::Persistence(format!("{e:#}")))
    }
}
