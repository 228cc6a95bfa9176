//! Main Entrypoint for the Vocabulary API Service
//!
//! This binary is responsible for:
//! 1. Loading configuration from the environment.
//! 2. Initializing the database connection pool and running migrations.
//! 3. Building the prompt store, the LLM phase agents and the orchestrator.
//! 4. Constructing the Axum router and applying middleware.
//! 5. Starting the web server and handling graceful shutdown.

use anyhow::Context;
use async_openai::config::OpenAIConfig;
use sqlx::PgPool;
use std::{net::SocketAddr, sync::Arc};
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};
use vocab_api::{
    config::{Config, Provider},
    db::Db,
    router::create_router,
    state::AppState,
};
use vocab_core::{
    Collaborators, OrchestratorSettings, PhaseOrchestrator, PhaseRegistry, PhaseTable,
    ResumptionPolicy,
    llm_agent::LlmPhaseAgentFactory,
    llm_client::{LLMClient, OpenAICompatibleClient},
    prompt_server::ConfigServerPromptStore,
    prompt_store::{CachedPromptStore, DirectoryPromptStore, PromptStore},
    repository::Repository,
    retry::RetryPolicy,
};

/// Listens for the `Ctrl+C` signal to gracefully shut down the server.
async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to install Ctrl+C handler");
        std::future::pending::<()>().await;
    }
    info!("Received shutdown signal. Shutting down gracefully...");
}

fn llm_client(config: &Config) -> anyhow::Result<Arc<dyn LLMClient>> {
    let openai_config = match &config.provider {
        Provider::OpenAI => {
            info!("Using OpenAI provider.");
            let api_key = config
                .openai_api_key
                .as_ref()
                .context("OPENAI_API_KEY is not set")?;
            OpenAIConfig::new()
                .with_api_key(api_key)
                .with_api_base("https://api.openai.com/v1/")
        }
        Provider::Gemini => {
            info!("Using Gemini provider.");
            let api_key = config
                .gemini_api_key
                .as_ref()
                .context("GEMINI_API_KEY is not set")?;
            OpenAIConfig::new()
                .with_api_key(api_key)
                .with_api_base("https://generativelanguage.googleapis.com/v1beta/openai")
        }
    };
    Ok(Arc::new(OpenAICompatibleClient::new(
        openai_config,
        config.chat_model.clone(),
    )))
}

fn prompt_store(config: &Config) -> Arc<dyn PromptStore> {
    let bundled: Arc<dyn PromptStore> = Arc::new(DirectoryPromptStore::new(
        config.prompts_path.clone(),
        config.prompt_env.clone(),
    ));
    let source: Arc<dyn PromptStore> = match &config.prompt_server_url {
        Some(url) => {
            info!(%url, namespace = %config.prompt_namespace, "Reading prompts from config server.");
            Arc::new(
                ConfigServerPromptStore::new(
                    url.clone(),
                    config.prompt_namespace.clone(),
                    config.prompt_env.clone(),
                )
                .with_fallback(bundled),
            )
        }
        None => {
            info!(path = %config.prompts_path.display(), "Reading prompts from directory.");
            bundled
        }
    };
    Arc::new(CachedPromptStore::new(source, config.prompt_cache_ttl))
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

    // --- 3. Initialize Database ---
    let pool = PgPool::connect(&config.database_url)
        .await
        .context("Failed to connect to database")?;
    let db = Arc::new(Db::new(pool));
    db.run_migrations().await?;
    info!("Database connection established and migrations are up-to-date.");

    // --- 4. Initialize the Orchestrator ---
    let repository: Arc<dyn Repository> = db.clone();
    let agents = Arc::new(LlmPhaseAgentFactory::new(llm_client(&config)?, repository.clone()));
    let registry = PhaseRegistry::new().with_fallback(agents);
    let phases = PhaseTable::from_order(&config.phase_order, &registry)
        .context("Invalid PHASE_ORDER")?;

    let settings = OrchestratorSettings {
        locale: config.prompt_locale.clone(),
        max_turns_per_phase: config.phase_max_turns,
        max_phase_duration: config.phase_max_duration,
        farewell_timeout: config.farewell_timeout,
        retry: RetryPolicy::new(config.retry_max_attempts, config.retry_base_delay),
        resumption: ResumptionPolicy::new(config.warm_return_after),
    };
    let orchestrator = Arc::new(PhaseOrchestrator::new(
        Collaborators {
            repository,
            prompts: prompt_store(&config),
            phases: Arc::new(phases),
        },
        settings,
    ));

    let app_state = Arc::new(AppState {
        db,
        orchestrator,
        config: Arc::new(config.clone()),
    });

    // --- 5. Create Router and Apply Middleware ---
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = create_router(app_state).layer(cors);

    // --- 6. Start Server ---
    info!(
        provider = ?config.provider,
        model = %config.chat_model,
        phases = ?config.phase_order,
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

    info!("Server has shut down.");
    Ok(())
}
