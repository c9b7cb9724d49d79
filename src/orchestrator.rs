use async_trait::async_trait;
use futures_util::StreamExt;
use futures_util::stream;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use crate::config::NewsloomConfig;
use crate::enricher::Enricher;
use crate::grouping::GroupingCoordinator;
use crate::llm::ChatApi;
use crate::merger::Merger;
use crate::mitre::MitreClient;
use crate::models::article::ScrapedArticle;
use crate::store::Store;
use crate::trends::TrendSynthesizer;

/// Scrapers run concurrently, everything after them is sequential against
/// the single-writer store.
const SCRAPER_WORKERS: usize = 5;

/// A site-specific article source. Implementations live outside the core
/// pipeline; the orchestrator only needs a name and a fetch.
#[async_trait]
pub trait Scraper: Send + Sync {
    fn name(&self) -> &str;
    async fn fetch(&self) -> anyhow::Result<Vec<ScrapedArticle>>;
}

/// One full analysis pass: scrape → enrich → group → merge → trends.
pub struct Pipeline {
    store: Arc<Store>,
    enricher: Enricher,
    grouping: GroupingCoordinator,
    merger: Merger,
    trends: TrendSynthesizer,
}

impl Pipeline {
    pub fn new(
        store: Arc<Store>,
        chat: Arc<dyn ChatApi>,
        config: NewsloomConfig,
        model: String,
    ) -> Self {
        let enricher = Enricher::new(
            store.clone(),
            chat.clone(),
            MitreClient::new(),
            config.enricher.clone(),
            model.clone(),
        );
        let grouping = GroupingCoordinator::new(
            store.clone(),
            chat.clone(),
            config.grouping.clone(),
            model.clone(),
        );
        let merger = Merger::new(store.clone(), chat.clone(), config.merging.threshold, model.clone());
        let trends = TrendSynthesizer::new(
            store.clone(),
            chat,
            config.trending.clone(),
            config.enricher.token_budget,
            model,
        );
        Self {
            store,
            enricher,
            grouping,
            merger,
            trends,
        }
    }

    pub fn run_tick<'a>(
        &'a self,
        scrapers: &'a [Arc<dyn Scraper>],
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + 'a>> {
        Box::pin(async move {
            let started = std::time::Instant::now();
            tracing::info!("pipeline tick starting");

            self.run_scrapers(scrapers).await;
            self.enricher.run().await?;
            self.grouping.run().await?;
            self.merger.run().await?;
            self.trends.run().await?;

            tracing::info!("pipeline tick finished in {:.1}s", started.elapsed().as_secs_f64());
            Ok(())
        })
    }

    /// Fan the scrapers out over a bounded worker pool. Scraper failures
    /// are isolated; inserts dedupe by link.
    pub fn run_scrapers<'a>(&'a self, scrapers: &'a [Arc<dyn Scraper>]) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>> {
        Box::pin(async move {
            if scrapers.is_empty() {
                return;
            }
            tracing::info!("running {} scrapers ({SCRAPER_WORKERS} workers)", scrapers.len());
            let mut fetches: Vec<Pin<Box<dyn Future<Output = (String, anyhow::Result<Vec<ScrapedArticle>>)> + Send>>> =
                Vec::with_capacity(scrapers.len());
            for scraper in scrapers.iter().cloned() {
                fetches.push(Box::pin(async move {
                    let name = scraper.name().to_string();
                    let result = scraper.fetch().await;
                    (name, result)
                }));
            }
            let results: Vec<(String, anyhow::Result<Vec<ScrapedArticle>>)> = stream::iter(fetches)
                .buffer_unordered(SCRAPER_WORKERS)
                .collect()
                .await;

            let mut inserted = 0usize;
            for (name, result) in results {
                match result {
                    Ok(articles) => {
                        for article in &articles {
                            match self.store.insert_article(article) {
                                Ok(Some(_)) => inserted += 1,
                                Ok(None) => {}
                                Err(e) => {
                                    tracing::warn!("insert failed for {} from {name}: {e}", article.link)
                                }
                            }
                        }
                        tracing::info!("scraper {name}: {} articles fetched", articles.len());
                    }
                    Err(e) => tracing::error!("scraper {name} failed: {e}"),
                }
            }
            tracing::info!("scrapers done, {inserted} new articles");
        })
    }
}

/// Run the pipeline once at startup, then on every schedule tick. A failed
/// tick is logged and the next one still runs.
async fn orchestrator_loop(pipeline: Arc<Pipeline>, scrapers: Vec<Arc<dyn Scraper>>, interval_minutes: u64) {
    tracing::info!("orchestrator started ({interval_minutes}m interval)");
    let mut interval = tokio::time::interval(Duration::from_secs(interval_minutes * 60));
    loop {
        interval.tick().await;
        if let Err(e) = pipeline.run_tick(&scrapers).await {
            tracing::error!("pipeline tick error: {e}");
        }
    }
}

pub fn spawn_orchestrator(
    pipeline: Arc<Pipeline>,
    scrapers: Vec<Arc<dyn Scraper>>,
    interval_minutes: u64,
) {
    tokio::spawn(orchestrator_loop(pipeline, scrapers, interval_minutes));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::testing::ScriptedChat;

    struct StubScraper {
        name: String,
        articles: Vec<ScrapedArticle>,
        fail: bool,
    }

    #[async_trait]
    impl Scraper for StubScraper {
        fn name(&self) -> &str {
            &self.name
        }

        async fn fetch(&self) -> anyhow::Result<Vec<ScrapedArticle>> {
            if self.fail {
                anyhow::bail!("fetch blew up");
            }
            Ok(self.articles.clone())
        }
    }

    fn scraped(link: &str) -> ScrapedArticle {
        ScrapedArticle {
            link: link.to_string(),
            title: "t".to_string(),
            content: "c".to_string(),
            published_date: "2024-06-01 12:00:00".to_string(),
            source: "stub".to_string(),
            author: None,
        }
    }

    #[tokio::test]
    async fn test_scraper_pool_inserts_and_isolates_failures() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let pipeline = Pipeline::new(
            store.clone(),
            Arc::new(ScriptedChat::failing()),
            NewsloomConfig::default(),
            "test-model".to_string(),
        );
        let scrapers: Vec<Arc<dyn Scraper>> = vec![
            Arc::new(StubScraper {
                name: "good".to_string(),
                articles: vec![scraped("https://a/1"), scraped("https://a/2")],
                fail: false,
            }),
            Arc::new(StubScraper {
                name: "bad".to_string(),
                articles: Vec::new(),
                fail: true,
            }),
            Arc::new(StubScraper {
                name: "duplicate".to_string(),
                articles: vec![scraped("https://a/1")],
                fail: false,
            }),
        ];
        pipeline.run_scrapers(&scrapers).await;
        let ungrouped = store.ungrouped_articles().unwrap();
        assert_eq!(ungrouped.len(), 2);
    }
}
