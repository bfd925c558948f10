//! safereturn-core — Face recognition decision pipeline.
//!
//! Reference photos are reduced to ArcFace embeddings (SCRFD detection,
//! five-point alignment, ONNX Runtime inference) and held in an immutable
//! gallery snapshot. Query images are matched by cosine similarity against
//! that snapshot and resolved to a display name through the identity table.

pub mod alignment;
pub mod cache;
pub mod detector;
pub mod extractor;
pub mod gallery;
pub mod identity;
pub mod pipeline;
pub mod recognizer;
pub mod types;

use std::path::PathBuf;

pub use extractor::{EmbeddingExtractor, ExtractError, MockExtractor, OnnxExtractor};
pub use gallery::{
    GalleryBuilder, GalleryError, GalleryHandle, GalleryIndex, GalleryLoad, LoadWarning,
};
pub use identity::{IdentityError, IdentityRecord, IdentityStore};
pub use pipeline::{Decision, DecisionPipeline, PipelineError};
pub use types::{CosineMatcher, Embedding, MatchResult, Matcher, ReferenceEntry, Threshold};

/// Directory searched for `det_10g.onnx` and `w600k_r50.onnx` when none is configured.
pub fn default_model_dir() -> PathBuf {
    PathBuf::from("/usr/share/safe-return/models")
}
