use anyhow::{Context, Result};
use safereturn_core::{DecisionPipeline, GalleryHandle, IdentityStore, OnnxExtractor};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

mod config;
mod dbus_interface;
mod engine;

use dbus_interface::{RecognizerService, BUS_NAME, OBJECT_PATH};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("safereturnd starting");

    let config = config::Config::from_env().context("invalid configuration")?;
    tracing::info!(
        gallery = %config.gallery_dir.display(),
        identities = %config.identity_table.display(),
        threshold = %config.threshold,
        workers = config.workers,
        "configuration loaded"
    );

    let identities = IdentityStore::load(&config.identity_table).with_context(|| {
        format!("failed to load identity table {}", config.identity_table.display())
    })?;
    tracing::info!(records = identities.len(), "identity table loaded");

    let extractors = (0..config.workers)
        .map(|_| OnnxExtractor::load(&config.model_dir))
        .collect::<Result<Vec<_>, _>>()
        .with_context(|| format!("failed to load models from {}", config.model_dir.display()))?;
    tracing::info!(count = extractors.len(), "models loaded");

    let pipeline = DecisionPipeline::new(
        Arc::new(GalleryHandle::default()),
        Arc::new(identities),
        config.threshold,
    );
    let ctx = Arc::new(engine::EngineContext::new(
        pipeline,
        config.gallery_dir.clone(),
        config.cache_path.clone(),
    ));
    let engine = engine::spawn_engine(extractors, Arc::clone(&ctx))?;

    // An empty gallery is a valid serving state; ReloadGallery can retry later.
    match engine.rebuild().await {
        Ok(summary) => tracing::info!(
            entries = summary.entries,
            warnings = summary.warnings.len(),
            "initial gallery loaded"
        ),
        Err(e) => tracing::error!(error = %e, "initial gallery load failed; serving empty gallery"),
    }

    let service = RecognizerService {
        engine,
        ctx,
        config: config.clone(),
    };
    let builder = if config.session_bus {
        zbus::connection::Builder::session()?
    } else {
        zbus::connection::Builder::system()?
    };
    let _conn = builder
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, service)?
        .build()
        .await
        .context("failed to register on D-Bus")?;

    tracing::info!(bus = BUS_NAME, path = OBJECT_PATH, "safereturnd ready");

    tokio::signal::ctrl_c().await?;
    tracing::info!("safereturnd shutting down");

    Ok(())
}
