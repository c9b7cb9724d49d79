// Run one full pipeline tick (enrich -> group -> merge -> trends) against
// the configured database and exit. Useful for backfills and debugging
// without the scheduler or the HTTP surface.

use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use newsloom::config::NewsloomConfig;
use newsloom::llm::{ChatApi, LlmClient};
use newsloom::orchestrator::Pipeline;
use newsloom::store::Store;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("newsloom=info")),
        )
        .init();

    let db_path = std::env::var("NEWSLOOM_DB").unwrap_or_else(|_| "./newsloom.db".to_string());
    let config_path =
        std::env::var("NEWSLOOM_CONFIG").unwrap_or_else(|_| "./newsloom.toml".to_string());
    let model = std::env::var("OPENAI_MODEL").unwrap_or_else(|_| "gpt-4.1-mini".to_string());
    let api_key = std::env::var("OPENAI_API_KEY").unwrap_or_default();

    let store = Arc::new(Store::open(&db_path)?);
    let config = NewsloomConfig::load(&config_path)?;
    let chat: Arc<dyn ChatApi> = Arc::new(LlmClient::new(api_key));

    let pipeline = Pipeline::new(store, chat, config, model);
    pipeline.run_tick(&[]).await?;
    Ok(())
}
