//! cardsync headless binary: drives the card runtime against a page snapshot.

use std::{path::Path, sync::Arc};

use anyhow::Context;
use cardsync::{
    clock::SystemClock,
    config::RuntimeConfig,
    dao::event_store::{EventStore, FileEventStore, MemoryEventStore},
    dom::{Document, markup::MarkupNode},
    services::transport::WsConnector,
    state::{Runtime, RuntimeDeps},
};
use tokio_stream::StreamExt;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use url::Url;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let config = RuntimeConfig::load();
    let application_key = config
        .application_key
        .clone()
        .context("no application key configured (set CARDSYNC_APPLICATION_KEY)")?;
    let server_url = Url::parse(&config.server_url)
        .with_context(|| format!("invalid server URL `{}`", config.server_url))?;

    let document = match &config.page_path {
        Some(path) => load_page(path).await?,
        None => {
            warn!("no page snapshot configured; starting with an empty page");
            Document::new()
        }
    };

    let event_store: Arc<dyn EventStore> = match &config.storage_dir {
        Some(dir) => Arc::new(FileEventStore::new(dir.clone())),
        None => Arc::new(MemoryEventStore::new()),
    };
    let deps = RuntimeDeps {
        connector: Arc::new(WsConnector::new(server_url, application_key)),
        event_store,
        clock: Arc::new(SystemClock),
    };

    info!(server_url = %config.server_url, "starting cardsync runtime");
    let runtime = Runtime::init(config, document, deps)
        .await
        .context("starting runtime")?;

    let mut changes = runtime.store().changes();
    let logger = tokio::spawn(async move {
        while let Some(snapshot) = changes.next().await {
            for (game_id, state) in snapshot.iter() {
                info!(
                    game_id = %game_id,
                    version = %state.version,
                    loading = state.loading,
                    source = ?state.source,
                    poster = ?state.poster_url,
                    "card state"
                );
            }
        }
    });

    shutdown_signal().await;
    info!("shutdown requested");
    runtime.teardown().await;
    logger.abort();
    Ok(())
}

/// Read a JSON page snapshot: an array of markup nodes placed under the document root.
async fn load_page(path: &Path) -> anyhow::Result<Document> {
    let raw = tokio::fs::read(path)
        .await
        .with_context(|| format!("reading page snapshot {}", path.display()))?;
    let nodes: Vec<MarkupNode> = serde_json::from_slice(&raw)
        .with_context(|| format!("parsing page snapshot {}", path.display()))?;
    Ok(Document::from_markup(&nodes))
}

/// Configure tracing subscribers so logs include spans by default.
fn init_tracing() {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,cardsync=debug".into());
    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Wait for Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {},
                    _ = term.recv() => {},
                }
            }
            Err(err) => {
                warn!(error = %err, "failed to install SIGTERM handler; waiting for Ctrl+C");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
