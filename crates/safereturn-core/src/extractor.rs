//! Embedding extraction boundary.
//!
//! The gallery and the decision pipeline only see [`EmbeddingExtractor`]:
//! image bytes in, fixed-length embedding out. [`OnnxExtractor`] is the
//! production SCRFD + ArcFace chain; [`MockExtractor`] produces deterministic
//! hash-based embeddings for tests and dry runs.

use crate::detector::{DetectorError, FaceDetector};
use crate::recognizer::{self, FaceRecognizer, RecognizerError};
use crate::types::Embedding;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::path::Path;
use thiserror::Error;

pub const SCRFD_MODEL_FILE: &str = "det_10g.onnx";
pub const ARCFACE_MODEL_FILE: &str = "w600k_r50.onnx";

/// Why an image produced no embedding.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ExtractError {
    #[error("no face detected in image")]
    NoFace,
    #[error("could not decode image: {0}")]
    Malformed(String),
    /// The model could not run (inference failure, out of resources).
    /// Retrying later may succeed.
    #[error("extractor unavailable: {0}")]
    Unavailable(String),
}

impl ExtractError {
    /// Whether this failure says something about the input rather than the model.
    pub fn is_input_fault(&self) -> bool {
        !matches!(self, ExtractError::Unavailable(_))
    }
}

/// Converts an arbitrary encoded image into a face embedding.
///
/// Implementations are blocking and may hold a large model; callers decide
/// how many run at once.
pub trait EmbeddingExtractor {
    fn extract(&mut self, image: &[u8]) -> Result<Embedding, ExtractError>;

    /// Model version stamped on embeddings, used to invalidate cached ones.
    fn model_version(&self) -> &str;
}

#[derive(Error, Debug)]
pub enum ModelLoadError {
    #[error("detector: {0}")]
    Detector(#[from] DetectorError),
    #[error("recognizer: {0}")]
    Recognizer(#[from] RecognizerError),
}

/// SCRFD detection followed by ArcFace recognition of the most confident face.
pub struct OnnxExtractor {
    detector: FaceDetector,
    recognizer: FaceRecognizer,
}

impl OnnxExtractor {
    /// Load `det_10g.onnx` and `w600k_r50.onnx` from `model_dir`.
    pub fn load(model_dir: &Path) -> Result<Self, ModelLoadError> {
        let detector = FaceDetector::load(&model_dir.join(SCRFD_MODEL_FILE))?;
        let recognizer = FaceRecognizer::load(&model_dir.join(ARCFACE_MODEL_FILE))?;
        Ok(Self { detector, recognizer })
    }
}

impl EmbeddingExtractor for OnnxExtractor {
    fn extract(&mut self, image: &[u8]) -> Result<Embedding, ExtractError> {
        let rgb = image::load_from_memory(image)
            .map_err(|e| ExtractError::Malformed(e.to_string()))?
            .to_rgb8();

        let faces = self
            .detector
            .detect(&rgb)
            .map_err(|e| ExtractError::Unavailable(e.to_string()))?;
        let face = faces.first().ok_or(ExtractError::NoFace)?;

        tracing::debug!(
            confidence = face.confidence,
            faces = faces.len(),
            "extract: using most confident face"
        );

        self.recognizer.extract(&rgb, face).map_err(|e| match e {
            RecognizerError::NoLandmarks => ExtractError::NoFace,
            other => ExtractError::Unavailable(other.to_string()),
        })
    }

    fn model_version(&self) -> &str {
        recognizer::ARCFACE_MODEL_VERSION
    }
}

/// Deterministic stand-in for a face model.
///
/// Every distinct byte string maps to its own pseudo-random unit vector, so
/// identical images score 1.0 against each other and unrelated images land
/// near 0. Images starting with [`MockExtractor::NO_FACE`] have no face;
/// empty input is malformed.
#[derive(Debug, Clone)]
pub struct MockExtractor {
    dimensions: usize,
    available: bool,
}

impl MockExtractor {
    pub const NO_FACE: &'static [u8] = b"NOFACE";
    pub const MODEL_VERSION: &'static str = "mock-hash";

    pub fn new() -> Self {
        Self {
            dimensions: 512,
            available: true,
        }
    }

    /// An extractor whose model never comes up; every call is transient.
    pub fn unavailable() -> Self {
        Self {
            available: false,
            ..Self::new()
        }
    }

    fn hash_to_vector(&self, image: &[u8]) -> Vec<f32> {
        let values = (0..self.dimensions)
            .map(|i| {
                let mut hasher = DefaultHasher::new();
                image.hash(&mut hasher);
                i.hash(&mut hasher);
                let h = hasher.finish();
                ((h as f64 / u64::MAX as f64) * 2.0 - 1.0) as f32
            })
            .collect();
        recognizer::l2_normalize(values)
    }
}

impl Default for MockExtractor {
    fn default() -> Self {
        Self::new()
    }
}

impl EmbeddingExtractor for MockExtractor {
    fn extract(&mut self, image: &[u8]) -> Result<Embedding, ExtractError> {
        if !self.available {
            return Err(ExtractError::Unavailable("mock model offline".into()));
        }
        if image.is_empty() {
            return Err(ExtractError::Malformed("empty image".into()));
        }
        if image.starts_with(Self::NO_FACE) {
            return Err(ExtractError::NoFace);
        }
        Ok(Embedding {
            values: self.hash_to_vector(image),
            model_version: Some(Self::MODEL_VERSION.to_string()),
        })
    }

    fn model_version(&self) -> &str {
        Self::MODEL_VERSION
    }
}
