//! Octopus server.
//!
//! Run with: cargo run -p octopus-server -- --help
//!
//! Every flag can also be set through its `OCTOPUS_*` environment variable.

mod config;

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use octopus_core::TranscriptStore;
use octopus_executor::ClaudeAdapter;
use octopus_session::{SessionRegistry, storage::MemoryStore};
use octopus_transport::{AppState, router};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::Config;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let config = Config::parse();
    if config.auth_token == "changeme" {
        tracing::warn!("Using the default auth token; set OCTOPUS_AUTH_TOKEN");
    }

    let store = open_store(&config).await?;
    let registry = Arc::new(SessionRegistry::new(
        store,
        Arc::new(ClaudeAdapter::new(config.claude())),
        config.working_dir(),
    ));
    registry
        .restore()
        .await
        .context("restoring sessions from the store")?;

    let app = router(
        AppState::new(Arc::clone(&registry), config.auth_token.as_str()),
        &config.cors_origins,
    );

    let listener = config.listener().await?;
    let addr = listener.local_addr().context("reading bound address")?;
    tracing::info!("Octopus listening on http://{addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    shutdown_sessions(&registry).await;
    Ok(())
}

#[cfg(feature = "sqlite")]
async fn open_store(config: &Config) -> anyhow::Result<Arc<dyn TranscriptStore>> {
    if config.in_memory {
        tracing::info!("Using in-memory session store");
        return Ok(Arc::new(MemoryStore::new()));
    }
    let path = config.database_path()?;
    let store = octopus_session::storage::SqliteStore::open(&path)
        .await
        .with_context(|| format!("opening database {}", path.display()))?;
    tracing::info!(path = %path.display(), "Using SQLite session store");
    Ok(Arc::new(store))
}

#[cfg(not(feature = "sqlite"))]
async fn open_store(config: &Config) -> anyhow::Result<Arc<dyn TranscriptStore>> {
    if !config.in_memory {
        tracing::warn!("Built without SQLite support; sessions will not survive a restart");
    }
    Ok(Arc::new(MemoryStore::new()))
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {e}");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown requested");
}

/// Close every live assistant process before exiting.
async fn shutdown_sessions(registry: &SessionRegistry) {
    let closed = registry.close_all().await;
    if closed > 0 {
        tracing::info!(handles = closed, "Closed assistant processes");
    }
}
