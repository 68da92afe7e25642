mod analysis;
mod config;
mod db;
mod errors;
mod models;
mod reports;
mod routes;
mod session;
mod state;
mod vision_client;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::Config;
use crate::db::{create_pool, ensure_schema};
use crate::reports::history::HistoryHub;
use crate::reports::store::{InMemoryReportStore, PgReportStore, ReportStore};
use crate::routes::build_router;
use crate::session::IdentityService;
use crate::state::AppState;
use crate::vision_client::VisionClient;

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    // Initialize structured logging
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new(format!("{}={}", env!("CARGO_CRATE_NAME"), &config.rust_log))
        }))
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting Retina API v{}", env!("CARGO_PKG_VERSION"));

    // Report store: PostgreSQL when configured, otherwise process memory
    let store: Arc<dyn ReportStore> = match &config.database_url {
        Some(url) => {
            let pool = create_pool(url).await?;
            ensure_schema(&pool).await?;
            Arc::new(PgReportStore::new(pool))
        }
        None => {
            warn!("DATABASE_URL not set; reports are kept in memory and lost on restart");
            Arc::new(InMemoryReportStore::default())
        }
    };
    let history = HistoryHub::new(store);

    let vision = VisionClient::from_config(&config).context("Failed to build vision client")?;
    info!(
        "Vision client initialized (model: {}, format: {:?}, attempts: {})",
        config.gemini_model, config.result_format, config.analysis_max_attempts
    );
    if config.gemini_api_key.is_empty() {
        warn!("GEMINI_API_KEY is empty; relying on the environment to inject credentials");
    }

    let authenticator = Arc::new(
        IdentityService::new(config.identity_verify_url.clone())
            .context("Failed to build identity client")?,
    );

    let state = AppState::new(config.clone(), vision, history, authenticator);

    let app = build_router(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    let addr: SocketAddr = format!("0.0.0.0:{}", config.port).parse()?;
    info!("Listening on {addr}");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
