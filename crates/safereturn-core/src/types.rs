use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// Bounding box for a detected face, with optional facial landmarks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
    /// Five-point facial landmarks: [left_eye, right_eye, nose, left_mouth, right_mouth].
    pub landmarks: Option<[(f32, f32); 5]>,
}

/// Face embedding vector (typically 512-dimensional for ArcFace).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
    /// Model version that produced this embedding (e.g., "w600k_r50").
    pub model_version: Option<String>,
}

impl Embedding {
    /// Compute cosine similarity between two embeddings.
    ///
    /// Returns a value in [-1, 1]. Higher = more similar.
    /// Uses constant-time computation: always processes all dimensions.
    pub fn similarity(&self, other: &Embedding) -> f32 {
        let mut dot = 0.0f32;
        let mut norm_a = 0.0f32;
        let mut norm_b = 0.0f32;

        for (a, b) in self.values.iter().zip(other.values.iter()) {
            dot += a * b;
            norm_a += a * a;
            norm_b += b * b;
        }

        let denom = norm_a.sqrt() * norm_b.sqrt();
        if denom > 0.0 { dot / denom } else { 0.0 }
    }

    /// Match confidence in [0, 1]: cosine similarity floored at zero.
    ///
    /// Equivalent to `1 - cosine_distance` for any pair that points the same
    /// way; opposing embeddings score 0 rather than going negative.
    pub fn confidence(&self, other: &Embedding) -> f32 {
        self.similarity(other).clamp(0.0, 1.0)
    }
}

/// One reference photo in the gallery, reduced to its embedding.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReferenceEntry {
    /// Identity this photo belongs to (key into the identity store).
    pub identifier: String,
    /// Photo the embedding was extracted from.
    pub source: PathBuf,
    pub embedding: Embedding,
}

/// Acceptance threshold for a match, guaranteed to lie in [0, 1].
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Serialize)]
pub struct Threshold(f32);

#[derive(Error, Debug, PartialEq)]
#[error("confidence threshold must be within [0, 1], got {0}")]
pub struct ThresholdError(pub f32);

impl Threshold {
    pub fn new(value: f32) -> Result<Self, ThresholdError> {
        if value.is_finite() && (0.0..=1.0).contains(&value) {
            Ok(Self(value))
        } else {
            Err(ThresholdError(value))
        }
    }

    pub fn value(self) -> f32 {
        self.0
    }
}

impl Default for Threshold {
    fn default() -> Self {
        Self(0.6)
    }
}

impl fmt::Display for Threshold {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.2}", self.0)
    }
}

/// Result of matching a probe embedding against a gallery.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchResult {
    pub matched: bool,
    /// Confidence of the best-scoring entry in [0, 1], reported on reject too.
    pub confidence: f32,
    /// Identifier of the matched entry (accept only).
    pub identifier: Option<String>,
    /// Photo that produced the match (accept only).
    pub source: Option<PathBuf>,
}

impl MatchResult {
    /// Reject with zero confidence, the answer for an empty gallery.
    pub fn empty() -> Self {
        Self {
            matched: false,
            confidence: 0.0,
            identifier: None,
            source: None,
        }
    }
}

/// Strategy for comparing a probe embedding against the gallery's reference entries.
pub trait Matcher {
    fn compare(&self, probe: &Embedding, gallery: &[ReferenceEntry], threshold: Threshold)
        -> MatchResult;
}

/// Cosine similarity matcher with constant-time gallery traversal.
///
/// Always iterates ALL gallery entries to prevent timing side-channels
/// that could leak gallery size or match position. Ties keep the earliest
/// entry in gallery order, since only a strictly higher score replaces the
/// current best.
pub struct CosineMatcher;

impl Matcher for CosineMatcher {
    fn compare(
        &self,
        probe: &Embedding,
        gallery: &[ReferenceEntry],
        threshold: Threshold,
    ) -> MatchResult {
        let mut best_conf = f32::NEG_INFINITY;
        let mut best_idx: Option<usize> = None;

        for (i, entry) in gallery.iter().enumerate() {
            let conf = probe.confidence(&entry.embedding);
            if conf > best_conf {
                best_conf = conf;
                best_idx = Some(i);
            }
        }

        match best_idx {
            Some(idx) if best_conf >= threshold.value() => MatchResult {
                matched: true,
                confidence: best_conf,
                identifier: Some(gallery[idx].identifier.clone()),
                source: Some(gallery[idx].source.clone()),
            },
            Some(_) => MatchResult {
                confidence: best_conf,
                ..MatchResult::empty()
            },
            None => MatchResult::empty(),
        }
    }
}
