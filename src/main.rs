use std::sync::Arc;

use tracing::info;
use tracing_subscriber::EnvFilter;

use chat_edge::config::Config;
use chat_edge::gateway::{self, AppState};
use chat_edge::generate::stats::UpstreamStats;
use chat_edge::generate::HttpGenerator;
use chat_edge::orchestrator::Orchestrator;
use chat_edge::places::{KeywordMatcher, Matcher, SeedPlaceStore};
use chat_edge::resources::SharedResources;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Config::from_env();

    // The seeded store stands in for the relational backend; swap in a real
    // PlaceStore implementation to serve live data.
    let store = Arc::new(SeedPlaceStore::with_default_seed());
    let resources = SharedResources::new(
        store,
        Box::new(|| Ok(Box::new(KeywordMatcher::build()) as Box<dyn Matcher>)),
        config.dataset_ttl,
    );
    let stats = Arc::new(UpstreamStats::new());
    let generator = Arc::new(HttpGenerator::new(config.upstream_endpoint.clone()));
    let orchestrator = Orchestrator::new(&config, resources, generator, stats);

    let app = gateway::router(Arc::new(AppState { orchestrator }));

    info!(addr = %config.bind_addr, upstream = %config.upstream_endpoint, "chat gateway listening");
    let listener = tokio::net::TcpListener::bind(config.bind_addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}
