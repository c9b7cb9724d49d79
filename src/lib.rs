pub mod category;
pub mod config;
pub mod consistency;
pub mod enricher;
pub mod grouping;
pub mod handlers;
pub mod llm;
pub mod merger;
pub mod mitre;
pub mod models;
pub mod orchestrator;
pub mod signature;
pub mod similarity;
pub mod store;
pub mod timefmt;
pub mod trends;

use std::sync::Arc;

use store::Store;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<Store>,
}
