//! Main Entrypoint for the Restaurant Voice Agent Service
//!
//! This binary is responsible for:
//! 1. Loading configuration from the environment.
//! 2. Checking the Deepgram key and loading the agent settings.
//! 3. Opening the menu and order store (Postgres or in-memory).
//! 4. Constructing the Axum router and applying middleware.
//! 5. Starting the web server and closing live calls on shutdown.

use anyhow::Context;
use restaurant_api::{
    config::{Config, StoreKind},
    db::Db,
    router::create_router,
    state::AppState,
    ws::{bridge::CloseReason, provider::deepgram},
};
use restaurant_core::{BackendStore, InMemoryStore};
use sqlx::PgPool;
use std::{net::SocketAddr, sync::Arc};
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info};

/// Listens for the `Ctrl+C` signal to gracefully shut down the server.
async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to install Ctrl+C handler");
        std::future::pending::<()>().await;
    }
    info!("Received shutdown signal. Shutting down gracefully...");
}

async fn open_store(config: &Config) -> anyhow::Result<Arc<dyn BackendStore>> {
    match config.store {
        StoreKind::Postgres => {
            let url = config
                .database_url
                .as_deref()
                .context("DATABASE_URL is required for the postgres store")?;
            let pool = PgPool::connect(url)
                .await
                .context("Failed to connect to database")?;
            let db = Db::new(pool);
            db.run_migrations().await?;
            info!("Database connection established and migrations are up-to-date.");
            Ok(Arc::new(db))
        }
        StoreKind::Memory => {
            let store = match &config.menu_seed_path {
                Some(path) => {
                    let raw = std::fs::read_to_string(path).with_context(|| {
                        format!("Failed to read menu seed from {}", path.display())
                    })?;
                    InMemoryStore::from_json(&raw)?
                }
                None => InMemoryStore::demo(),
            };
            info!(items = store.menu().len(), "Using in-memory menu store.");
            Ok(Arc::new(store))
        }
    }
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

    // --- 3. Voice Agent ---
    if config.validate_agent_key {
        deepgram::validate_api_key(&reqwest::Client::new(), &config.deepgram_api_key)
            .await
            .context("Deepgram API key check failed")?;
    }
    let agent_settings = deepgram::agent_settings(deepgram::load_settings(
        &config.agent_settings_path,
    )?)?;

    // --- 4. Store ---
    let store = open_store(&config).await?;

    let app_state = Arc::new(AppState::new(store, agent_settings, config.clone()));
    let sessions = app_state.sessions.clone();

    // --- 5. Create Router and Apply Middleware ---
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = create_router(app_state).layer(cors);

    // --- 6. Start Server ---
    info!(
        store = config.store.as_str(),
        agent_url = %config.agent_url,
        bind_address = %config.bind_address,
        "Service configured. Starting server..."
    );
    let listener = tokio::net::TcpListener::bind(config.bind_address).await?;

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        shutdown_signal().await;
        sessions.close_all(CloseReason::Shutdown).await;
    })
    .await?;

    info!("Server has shut down.");
    Ok(())
}
