//! Interactive CLI for the advisory orchestrator.

use finadvisor_orchestrator::agent::AdvisoryEngine;
use finadvisor_orchestrator::llm::OpenRouterClient;
use finadvisor_orchestrator::store::AdvisoryStore;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::info;

const TEST_USER_ID: &str = "user_ext_001";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let backend = Arc::new(OpenRouterClient::from_env());
    let store = Arc::new(AdvisoryStore::from_env());
    let engine = AdvisoryEngine::new(backend, store);

    info!("Advisory engine initialized");
    println!("[FinAdvisor] system started (User: {})", TEST_USER_ID);
    println!("{}", "-".repeat(60));

    let mut session_id: Option<String> = None;
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();

    loop {
        stdout.write_all(b"\nUser: ").await?;
        stdout.flush().await?;

        let Some(line) = lines.next_line().await? else {
            break;
        };
        let input = line.trim();

        if matches!(input.to_lowercase().as_str(), "exit" | "q" | "quit") {
            println!("Goodbye.");
            break;
        }
        if input.is_empty() {
            continue;
        }

        println!("Thinking...");

        match engine
            .process_turn(session_id.as_deref(), TEST_USER_ID, input)
            .await
        {
            Ok(result) => {
                session_id = Some(result.session_id.clone());

                if let Some(history) = &result.debate_history {
                    println!("\n{} Debate Log {}", "=".repeat(20), "=".repeat(20));
                    for entry in history {
                        println!("\n{}\n{}", entry, "-".repeat(50));
                    }
                    println!("{}\n", "=".repeat(55));
                }

                match result.message {
                    Some(message) => {
                        println!("\nAgent ({}):\n{}", result.stage.as_str(), message)
                    }
                    None => println!(
                        "\nAgent (safety):\nI can't help with that request. \
                         Let's keep things to safe, finance-related topics."
                    ),
                }
            }
            Err(e) => eprintln!("Error: {}", e),
        }
    }

    Ok(())
}
