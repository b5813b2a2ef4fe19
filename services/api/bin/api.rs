//! Main Entrypoint for the Parley API Service
//!
//! This binary is responsible for:
//! 1. Loading configuration from the environment.
//! 2. Choosing the conversation store (PostgreSQL or files) and running migrations.
//! 3. Initializing shared services (the summarizer and the model-service connector).
//! 4. Constructing the Axum router and applying middleware.
//! 5. Starting the web server and flushing conversation state on shutdown.

use anyhow::Context;
use async_openai::config::OpenAIConfig;
use parley_api::{
    config::Config, conversations::ConversationPool, db::Db, router::create_router,
    state::AppState, ws::registry::SessionRegistry,
};
use parley_core::{ConversationStore, FileConversationStore, LlmSummarizer};
use parley_realtime::WebSocketConnector;
use secrecy::ExposeSecret;
use sqlx::PgPool;
use std::{collections::HashMap, fs, net::SocketAddr, sync::Arc};
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

/// Listens for the `Ctrl+C` signal to gracefully shut down the server.
async fn shutdown_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("Failed to install Ctrl+C handler");
    info!("Received shutdown signal. Shutting down gracefully...");
}

/// A helper function to load prompts from a directory.
fn load_prompts(prompts_path: &std::path::Path) -> anyhow::Result<HashMap<String, String>> {
    let mut prompts = HashMap::new();
    for entry in std::fs::read_dir(prompts_path)? {
        let entry = entry?;
        let path = entry.path();
        if path.is_file() && path.extension().and_then(|s| s.to_str()) == Some("md") {
            let prompt_key = path
                .file_stem()
                .and_then(|s| s.to_str())
                .context("Could not get file stem")?
                .to_string();
            let content = fs::read_to_string(&path)?;
            prompts.insert(prompt_key, content);
        }
    }
    Ok(prompts)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // --- 1. Load Configuration ---
    let config = Config::from_env().context("Failed to load configuration")?;

    // --- 2. Initialize Logging ---
    tracing_subscriber::fmt()
        .with_max_level(config.log_level)
        .with_timer(tracing_subscriber::fmt::time::ChronoLocal::rfc_3339())
        .init();
    info!("Configuration loaded. Initializing application state...");

    // --- 3. Initialize Conversation Storage ---
    let store: Arc<dyn ConversationStore> = match &config.database_url {
        Some(database_url) => {
            let pool = PgPool::connect(database_url)
                .await
                .context("Failed to connect to database")?;
            let db = Db::new(pool);
            db.run_migrations().await?;
            info!("Database connection established and migrations are up-to-date.");
            Arc::new(db)
        }
        None => {
            info!(dir = %config.conversations_dir.display(), "DATABASE_URL not set; storing conversations as files.");
            Arc::new(FileConversationStore::new(&config.conversations_dir))
        }
    };

    // --- 4. Initialize Shared Services ---
    let prompts = load_prompts(&config.prompts_path)
        .with_context(|| format!("Failed to read prompts from {}", config.prompts_path.display()))?;
    let system_prompt = Arc::new(
        prompts
            .get("system_prompt")
            .context("system_prompt.md not found in prompts directory")?
            .clone(),
    );

    let mut conversations = ConversationPool::new(config.context, store);
    match &config.summary.api_key {
        Some(api_key) => {
            let openai_config = OpenAIConfig::new()
                .with_api_key(api_key.expose_secret())
                .with_api_base(&config.summary.api_base);
            info!(model = %config.summary.model, "Summarizer enabled.");
            conversations = conversations.with_summarizer(Arc::new(LlmSummarizer::new(
                openai_config,
                config.summary.model.clone(),
            )));
        }
        None => warn!("SUMMARY_API_KEY not set; compaction will always truncate."),
    }
    let conversations = Arc::new(conversations);

    let mut connector = WebSocketConnector::new(config.model_endpoint.clone());
    if let Some(api_key) = &config.model_api_key {
        connector = connector.with_api_key(api_key.clone());
    }

    let app_state = Arc::new(AppState {
        config: Arc::new(config.clone()),
        registry: Arc::new(SessionRegistry::new()),
        conversations: Arc::clone(&conversations),
        connector: Arc::new(connector),
        system_prompt,
    });

    // --- 5. Create Router and Apply Middleware ---
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = create_router(app_state).layer(cors);

    // --- 6. Start Server ---
    info!(
        model_endpoint = %config.model_endpoint,
        voice = %config.voice_id,
        bind_address = %config.bind_address,
        "Service configured. Starting server..."
    );
    let listener = tokio::net::TcpListener::bind(config.bind_address).await?;

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    conversations.flush_all().await;
    info!("Server has shut down.");
    Ok(())
}
