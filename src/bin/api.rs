//! API server entry point.

use finadvisor_orchestrator::agent::AdvisoryEngine;
use finadvisor_orchestrator::api::start_server;
use finadvisor_orchestrator::llm::OpenRouterClient;
use finadvisor_orchestrator::store::AdvisoryStore;
use std::sync::Arc;
use tracing::info;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    if std::env::var("OPENROUTER_API_KEY").is_err() {
        eprintln!("OPENROUTER_API_KEY not set; completion calls will fail until it is configured");
    }

    let port: u16 = std::env::var("PORT")
        .or_else(|_| std::env::var("API_PORT"))
        .unwrap_or_else(|_| "8000".to_string())
        .parse()?;

    info!("FinAdvisor orchestrator - API server");
    info!(port, "Starting");

    let backend = Arc::new(OpenRouterClient::from_env());
    let store = Arc::new(AdvisoryStore::from_env());
    let engine = Arc::new(AdvisoryEngine::new(backend, store.clone()));

    info!("Advisory engine initialized");

    start_server(engine, store, port).await?;

    Ok(())
}
