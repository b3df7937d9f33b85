//! Codex Table Server
//!
//! Serves both client bindings until interrupted.

use std::sync::Arc;

use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use codex_table::{GameServer, ServerConfig, MAX_PLAYERS, MIN_PLAYERS, PROTOCOL_VERSION, VERSION};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = FmtSubscriber::builder().with_env_filter(filter).finish();
    tracing::subscriber::set_global_default(subscriber)?;

    info!("Codex Table Server v{} (protocol {})", VERSION, PROTOCOL_VERSION);
    info!("Tables of {} to {} players", MIN_PLAYERS, MAX_PLAYERS);

    let config = ServerConfig::from_env();
    if let Some(seed) = config.seed {
        info!("Deck seed fixed: {}", hex::encode(seed.to_be_bytes()));
    }

    let server = Arc::new(GameServer::new(config));
    let listeners = server.bind().await?;

    let runner = server.clone();
    let serving = tokio::spawn(async move { runner.serve(listeners).await });

    tokio::signal::ctrl_c().await?;
    info!("Interrupted, shutting down");
    server.shutdown().await;

    serving.await??;
    Ok(())
}
