use axum::{Router, routing::get};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use newsloom::config::NewsloomConfig;
use newsloom::llm::{ChatApi, LlmClient};
use newsloom::orchestrator::{self, Pipeline, Scraper};
use newsloom::store::Store;
use newsloom::{AppState, handlers};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("newsloom=debug,tower_http=debug")),
        )
        .init();

    let db_path = std::env::var("NEWSLOOM_DB").unwrap_or_else(|_| "./newsloom.db".to_string());
    let config_path =
        std::env::var("NEWSLOOM_CONFIG").unwrap_or_else(|_| "./newsloom.toml".to_string());
    let model = std::env::var("OPENAI_MODEL").unwrap_or_else(|_| "gpt-4.1-mini".to_string());
    let api_key = std::env::var("OPENAI_API_KEY").unwrap_or_default();
    if api_key.is_empty() {
        tracing::warn!("OPENAI_API_KEY not set; grouping and trend analysis will degrade to fallbacks");
    }
    let interval_minutes = std::env::var("SCHEDULE_INTERVAL_MINUTES")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(15);

    // schema-setup failure here is fatal and exits non-zero
    let store = Arc::new(Store::open(&db_path)?);
    tracing::info!("store opened at {db_path}");

    let config = NewsloomConfig::load(&config_path)?;
    let chat: Arc<dyn ChatApi> = Arc::new(LlmClient::new(api_key));
    let pipeline = Arc::new(Pipeline::new(store.clone(), chat, config, model));

    // site-specific scrapers register here; none ship with the core crate
    let scrapers: Vec<Arc<dyn Scraper>> = Vec::new();
    orchestrator::spawn_orchestrator(pipeline, scrapers, interval_minutes);

    let state = AppState { store };
    let app = Router::new()
        .route("/api/home_groups", get(handlers::groups::home_groups))
        .route("/api/category_groups", get(handlers::groups::category_groups))
        .route("/api/trending", get(handlers::trending::trending))
        .route(
            "/api/trending_entities",
            get(handlers::trending::trending_entities),
        )
        .route(
            "/api/category_entities",
            get(handlers::trending::category_entities),
        )
        .route("/api/cve_table", get(handlers::cves::cve_table))
        .route("/healthz", get(handlers::health::healthz))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], 8080));
    tracing::info!("newsloom listening on {addr}");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("clean shutdown");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.ok();
    };
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => tracing::warn!("failed to install SIGTERM handler: {e}"),
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::info!("shutdown signal received");
}
