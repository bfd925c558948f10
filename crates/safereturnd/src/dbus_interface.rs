use crate::config::Config;
use crate::engine::{EngineContext, EngineError, EngineHandle};
use safereturn_core::{GalleryError, PipelineError};
use std::sync::Arc;
use zbus::{interface, DBusError};

pub const BUS_NAME: &str = "org.safereturn.Recognizer1";
pub const OBJECT_PATH: &str = "/org/safereturn/Recognizer1";

/// D-Bus interface for the Safe Return recognition daemon.
///
/// Bus name: org.safereturn.Recognizer1
/// Object path: /org/safereturn/Recognizer1
pub struct RecognizerService {
    pub engine: EngineHandle,
    pub ctx: Arc<EngineContext>,
    pub config: Config,
}

/// Errors returned over the bus. `Unavailable` is transient; callers may
/// retry the same request.
#[derive(DBusError, Debug)]
#[zbus(prefix = "org.safereturn.Recognizer1.Error")]
pub enum RecognizerError {
    #[zbus(error)]
    ZBus(zbus::Error),
    Unavailable(String),
    Failed(String),
}

impl From<EngineError> for RecognizerError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::Pipeline(PipelineError::ExtractorUnavailable(reason)) => {
                Self::Unavailable(reason)
            }
            EngineError::Gallery(e @ GalleryError::ExtractorUnavailable { .. }) => {
                Self::Unavailable(e.to_string())
            }
            other => Self::Failed(other.to_string()),
        }
    }
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<String, RecognizerError> {
    serde_json::to_string(value).map_err(|e| RecognizerError::Failed(e.to_string()))
}

#[interface(name = "org.safereturn.Recognizer1")]
impl RecognizerService {
    /// Classify an encoded image. Returns the decision as JSON.
    async fn recognize(&self, image: Vec<u8>) -> Result<String, RecognizerError> {
        tracing::info!(bytes = image.len(), "recognize requested");
        let decision = self.engine.decide(image).await?;
        to_json(&decision)
    }

    /// Re-scan the gallery directory and publish the result.
    async fn reload_gallery(&self) -> Result<String, RecognizerError> {
        tracing::info!("reload_gallery requested");
        let summary = self.engine.rebuild().await?;
        to_json(&summary)
    }

    /// Return daemon status information.
    async fn status(&self) -> Result<String, RecognizerError> {
        let identities = self.ctx.pipeline.identities();
        let snapshot = self.ctx.pipeline.gallery().snapshot();
        Ok(serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "galleryDir": self.config.gallery_dir,
            "galleryFound": self.config.gallery_dir.is_dir(),
            "identityTable": self.config.identity_table,
            "identities": identities.len(),
            "entries": snapshot.len(),
            "identifiers": snapshot.identifiers().len(),
            "lastLoad": self.ctx.last_load(),
            "threshold": self.ctx.pipeline.threshold().value(),
            "workers": self.engine.workers(),
            "cacheEnabled": self.config.cache_path.is_some(),
        })
        .to_string())
    }
}
