//! Batch summarization worker binary
//!
//! Runs independently of the agent process; coordinates through the
//! summarization queue and the pages directory only. The API key comes
//! from the environment, never from argv.

use anyhow::Result;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use mnemo_core::batch::{BatchWorker, BatchWorkerConfig};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "mnemo=debug,info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    dotenvy::dotenv().ok();
    let config = BatchWorkerConfig::from_env()?;
    info!("Batch worker starting");
    info!("  Data dir: {}", config.data_dir.display());
    info!("  Batch API: {}", config.api_url);
    info!("  Model: {}", config.model);

    let mut worker = BatchWorker::new(config)?;

    tokio::select! {
        result = worker.run() => result,
        _ = tokio::signal::ctrl_c() => {
            // The queue is on disk; pending work resumes on restart.
            info!("Batch worker shutting down");
            Ok(())
        }
    }
}
