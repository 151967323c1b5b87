use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::Router;
use tower_http::cors::CorsLayer;

use super::api::{self, AppState};
use super::coordinator::Coordinator;
use super::db::{DbHandle, OrchestrationDb};
use super::documents::SqliteDocumentStore;
use super::llm::LlmClients;
use super::stages::{StageContext, StageSettings};
use super::tools::BuiltinTools;
use crate::config::{LlmSection, OntExtractConfig};

/// Configuration for the orchestration server.
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub db_path: PathBuf,
    pub dev_mode: bool,
    pub resume_on_startup: bool,
    pub settings: StageSettings,
    pub llm: LlmSection,
    pub embedding_dimensions: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8720,
            db_path: PathBuf::from(".ontextract/ontextract.db"),
            dev_mode: false,
            resume_on_startup: true,
            settings: StageSettings::default(),
            llm: LlmSection::default(),
            embedding_dimensions: 256,
        }
    }
}

impl ServerConfig {
    pub fn from_config(config: &OntExtractConfig) -> Self {
        let toml = &config.toml;
        Self {
            host: toml.server.host.clone(),
            port: toml.server.port,
            db_path: config.db_path(),
            dev_mode: false,
            resume_on_startup: toml.orchestration.resume_on_startup,
            settings: StageSettings {
                review_policy: toml.orchestration.review_policy,
                max_concurrent_documents: toml.orchestration.max_concurrent_documents,
            },
            llm: toml.llm.clone(),
            embedding_dimensions: toml.tools.embedding_dimensions,
        }
    }
}

/// Build the full application router.
pub fn build_router(state: Arc<AppState>) -> Router {
    api::api_router().with_state(state)
}

/// Wire the store, LLM clients and tools into a coordinator.
pub fn build_coordinator(config: &ServerConfig, db: DbHandle) -> Result<Coordinator> {
    let llm = LlmClients::from_config(&config.llm).context("Failed to configure LLM clients")?;
    let tools = BuiltinTools {
        embedding_dimensions: config.embedding_dimensions,
    };
    let ctx = StageContext::new(
        db.clone(),
        Arc::new(SqliteDocumentStore::new(db)),
        llm,
        Arc::new(tools),
        config.settings.clone(),
    );
    Ok(Coordinator::new(ctx))
}

/// Start the orchestration server.
pub async fn start_server(config: ServerConfig) -> Result<()> {
    if let Some(parent) = config.db_path.parent() {
        std::fs::create_dir_all(parent).context("Failed to create database directory")?;
    }

    let db = OrchestrationDb::new(&config.db_path).context("Failed to initialize database")?;
    let coordinator = build_coordinator(&config, DbHandle::new(db))?;

    if config.resume_on_startup {
        let resumed = coordinator
            .recover_interrupted()
            .await
            .context("Failed to recover interrupted runs")?;
        if !resumed.is_empty() {
            tracing::info!(runs = resumed.len(), "resumed interrupted runs");
        }
    }

    let state = Arc::new(AppState::new(coordinator));
    let mut app = build_router(Arc::clone(&state));

    if config.dev_mode {
        app = app.layer(CorsLayer::permissive());
    }

    let host = if config.dev_mode { "0.0.0.0" } else { config.host.as_str() };
    let addr = format!("{}:{}", host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    let local_addr = listener.local_addr()?;
    tracing::info!(address = %local_addr, db = %config.db_path.display(), "OntExtract orchestrator listening");
    println!("OntExtract orchestrator running at http://{}", local_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    state.coordinator.shutdown().await;
    tracing::info!("server shut down");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("failed to listen for Ctrl+C: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown requested");
}
