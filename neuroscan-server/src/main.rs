use std::sync::Arc;

use clap::Parser;
use futures::TryStreamExt;
use neuroscan_core::{create_store_from_config, GeminiClient, NeuroscanConfig};
use tokio::sync::broadcast;
use tracing_subscriber::{fmt, EnvFilter};

use neuroscan_server::http::{start_http_server, HttpState};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[arg(short, long, default_value = "neuroscan.toml")]
    config: String,

    /// Check the model key and the object store, then exit
    #[arg(long)]
    check: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present (GOOGLE_API_KEY, AWS_* in development)
    dotenvy::dotenv().ok();

    let args = Args::parse();

    let config = match NeuroscanConfig::load(&args.config) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to load config from {}: {}", args.config, e);
            std::process::exit(1);
        }
    };

    // RUST_LOG wins over [service] log_level
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.service.log_level));
    fmt().with_env_filter(filter).init();

    let model = match GeminiClient::new(None, config.model.clone()) {
        Ok(m) => m,
        Err(e) => {
            eprintln!("Failed to create Gemini client: {}", e);
            std::process::exit(1);
        }
    };

    let store = match create_store_from_config(&config) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("Failed to open scan store: {}", e);
            std::process::exit(1);
        }
    };

    if args.check {
        println!("✅ Gemini model: {}", model.model());
        match store.list().try_next().await {
            Ok(Some(record)) => println!(
                "✅ {} store reachable, newest scan {}",
                store.name(),
                record.timestamp
            ),
            Ok(None) => println!("✅ {} store reachable, no scans yet", store.name()),
            Err(e) => {
                println!("❌ {} store check failed: {}", store.name(), e);
                std::process::exit(1);
            }
        }
        return Ok(());
    }

    let (tx, _rx) = broadcast::channel(1);
    let shutdown_tx = tx.clone();

    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
            return;
        }
        tracing::info!("Shutdown signal received");
        let _ = shutdown_tx.send(());
    });

    tracing::info!(
        storage = store.name(),
        model = model.model(),
        "Starting NeuroScan server"
    );

    let state = Arc::new(HttpState::new(config, store, Arc::new(model)));
    start_http_server(state, tx.subscribe()).await?;

    Ok(())
}
