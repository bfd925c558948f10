use safereturn_core::{
    Decision, DecisionPipeline, EmbeddingExtractor, GalleryBuilder, GalleryError, GalleryLoad,
    PipelineError,
};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Pipeline(#[from] PipelineError),
    #[error("gallery rebuild failed: {0}")]
    Gallery(#[from] GalleryError),
    #[error("at least one extractor is required")]
    NoWorkers,
    #[error("failed to spawn engine thread: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("engine threads exited")]
    ChannelClosed,
}

/// Summary of the most recent successful gallery build.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GallerySummary {
    pub entries: usize,
    pub identifiers: usize,
    pub cache_hits: usize,
    pub warnings: Vec<String>,
}

impl From<&GalleryLoad> for GallerySummary {
    fn from(load: &GalleryLoad) -> Self {
        Self {
            entries: load.index.len(),
            identifiers: load.index.identifiers().len(),
            cache_hits: load.cache_hits,
            warnings: load.warnings.iter().map(ToString::to_string).collect(),
        }
    }
}

/// State shared by every engine thread.
pub struct EngineContext {
    pub pipeline: DecisionPipeline,
    pub gallery_dir: PathBuf,
    pub cache_path: Option<PathBuf>,
    last_load: Mutex<GallerySummary>,
    rebuild_lock: Mutex<()>,
}

impl EngineContext {
    pub fn new(
        pipeline: DecisionPipeline,
        gallery_dir: PathBuf,
        cache_path: Option<PathBuf>,
    ) -> Self {
        Self {
            pipeline,
            gallery_dir,
            cache_path,
            last_load: Mutex::new(GallerySummary::default()),
            rebuild_lock: Mutex::new(()),
        }
    }

    pub fn last_load(&self) -> GallerySummary {
        self.last_load
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// Messages sent from D-Bus handlers to the engine threads.
enum EngineRequest {
    Decide {
        image: Vec<u8>,
        reply: oneshot::Sender<Result<Decision, EngineError>>,
    },
    Rebuild {
        reply: oneshot::Sender<Result<GallerySummary, EngineError>>,
    },
}

/// Clone-safe handle to the engine threads.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
    workers: usize,
}

impl EngineHandle {
    /// Classify one query image on the next free worker.
    pub async fn decide(&self, image: Vec<u8>) -> Result<Decision, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::Decide {
                image,
                reply: reply_tx,
            })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)?
    }

    /// Rebuild the gallery from disk and publish it. On failure the
    /// previously published gallery keeps serving.
    pub async fn rebuild(&self) -> Result<GallerySummary, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::Rebuild { reply: reply_tx })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)?
    }

    pub fn workers(&self) -> usize {
        self.workers
    }
}

/// Spawn one OS thread per extractor.
///
/// Each thread owns its extractor exclusively, so the number of model
/// instances in memory equals the number of workers. Threads pull requests
/// from a shared queue and exit when every handle has been dropped.
pub fn spawn_engine<E>(
    extractors: Vec<E>,
    ctx: Arc<EngineContext>,
) -> Result<EngineHandle, EngineError>
where
    E: EmbeddingExtractor + Send + 'static,
{
    if extractors.is_empty() {
        return Err(EngineError::NoWorkers);
    }
    let workers = extractors.len();
    let (tx, rx) = mpsc::channel::<EngineRequest>(workers * 4);
    let rx = Arc::new(Mutex::new(rx));

    for (i, mut extractor) in extractors.into_iter().enumerate() {
        let rx = Arc::clone(&rx);
        let ctx = Arc::clone(&ctx);
        std::thread::Builder::new()
            .name(format!("safereturn-engine-{i}"))
            .spawn(move || {
                tracing::info!(
                    worker = i,
                    model = extractor.model_version(),
                    "engine thread started"
                );
                loop {
                    // Hold the lock only while waiting, never while working.
                    let req = rx
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .blocking_recv();
                    let Some(req) = req else {
                        break;
                    };
                    match req {
                        EngineRequest::Decide { image, reply } => {
                            let result = ctx
                                .pipeline
                                .decide(&mut extractor, &image)
                                .map_err(EngineError::from);
                            let _ = reply.send(result);
                        }
                        EngineRequest::Rebuild { reply } => {
                            let _ = reply.send(run_rebuild(&ctx, &mut extractor));
                        }
                    }
                }
                tracing::info!(worker = i, "engine thread exiting");
            })
            .map_err(EngineError::Spawn)?;
    }

    Ok(EngineHandle { tx, workers })
}

fn run_rebuild<E: EmbeddingExtractor>(
    ctx: &EngineContext,
    extractor: &mut E,
) -> Result<GallerySummary, EngineError> {
    let _guard = ctx.rebuild_lock.lock().unwrap_or_else(PoisonError::into_inner);

    let mut builder = GalleryBuilder::new(&ctx.gallery_dir).identities(ctx.pipeline.identities());
    if let Some(path) = &ctx.cache_path {
        builder = builder.cache(path);
    }

    let load = match builder.build(extractor) {
        Ok(load) => load,
        Err(e) => {
            tracing::error!(error = %e, "gallery rebuild failed; keeping current gallery");
            return Err(e.into());
        }
    };

    let summary = GallerySummary::from(&load);
    let previous = ctx.pipeline.gallery().publish(load.index);
    tracing::info!(
        entries = summary.entries,
        identifiers = summary.identifiers,
        cache_hits = summary.cache_hits,
        previous = previous.len(),
        "gallery published"
    );

    *ctx.last_load.lock().unwrap_or_else(PoisonError::into_inner) = summary.clone();
    Ok(summary)
}
