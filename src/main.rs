// =============================================================================
// nofx engine — Host Process Entry Point
// =============================================================================

use std::sync::Arc;

use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use nofx_engine::config::FileConfigStore;
use nofx_engine::journal::Journal;
use nofx_engine::signals::CandidateSources;
use nofx_engine::TraderManager;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & logging ─────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("nofx engine starting up");

    // ── 2. Shared collaborators ──────────────────────────────────────────
    let store = Arc::new(FileConfigStore::from_env()?);
    let journal = Arc::new(Journal::from_env());
    let signals = Arc::new(CandidateSources::from_env());

    info!(log_root = %journal.root().display(), "journal root resolved");

    // ── 3. Manager & traders ─────────────────────────────────────────────
    let manager = Arc::new(TraderManager::new(store, journal, signals));

    match manager.start_all() {
        Ok(0) => warn!("no traders configured — idle until shutdown"),
        Ok(count) => info!(count, "traders running"),
        Err(e) => warn!(error = %e, "failed to load trader configs"),
    }

    info!("all subsystems running — press Ctrl+C to stop");

    // ── 4. Graceful shutdown ─────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    warn!("shutdown signal received — stopping traders");

    manager.stop_all().await;

    info!("nofx engine shut down complete");
    Ok(())
}
