//! Decision pipeline — extract, match, resolve the identity, report.
//!
//! Every call is a pure function of the query image, the extractor and the
//! gallery snapshot taken at the start of the call. Nothing is cached and
//! nothing is retried.

use crate::extractor::{EmbeddingExtractor, ExtractError};
use crate::gallery::GalleryHandle;
use crate::identity::{placeholder_name, IdentityStore};
use crate::types::{CosineMatcher, Embedding, Matcher, Threshold};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

pub const MSG_MATCH: &str = "Match found";
pub const MSG_NO_MATCH: &str = "No match found in database";
pub const MSG_NO_FACE: &str = "No face detected in image";
pub const MSG_UNDECODABLE: &str = "Could not decode image";

#[derive(Error, Debug, Clone, PartialEq)]
pub enum PipelineError {
    /// Transient: the caller may retry the same image.
    #[error("extractor unavailable: {0}")]
    ExtractorUnavailable(String),
}

/// Outcome of one query, as handed to callers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Decision {
    pub matched: bool,
    /// No usable face in the query; distinct from a reject.
    pub inconclusive: bool,
    /// Accepted identifier has no identity record; `display_name` is a placeholder.
    pub degraded: bool,
    pub identifier: Option<String>,
    pub display_name: Option<String>,
    /// Best-match confidence in [0, 1]; 0 when inconclusive.
    pub confidence: f32,
    pub message: String,
}

impl Decision {
    fn inconclusive(message: &str) -> Self {
        Self {
            matched: false,
            inconclusive: true,
            degraded: false,
            identifier: None,
            display_name: None,
            confidence: 0.0,
            message: message.to_string(),
        }
    }

    fn reject(confidence: f32) -> Self {
        Self {
            matched: false,
            inconclusive: false,
            degraded: false,
            identifier: None,
            display_name: None,
            confidence,
            message: MSG_NO_MATCH.to_string(),
        }
    }
}

/// Classifies query images against the current gallery snapshot.
pub struct DecisionPipeline<M = CosineMatcher> {
    gallery: Arc<GalleryHandle>,
    identities: Arc<IdentityStore>,
    threshold: Threshold,
    matcher: M,
}

impl DecisionPipeline<CosineMatcher> {
    pub fn new(
        gallery: Arc<GalleryHandle>,
        identities: Arc<IdentityStore>,
        threshold: Threshold,
    ) -> Self {
        Self::with_matcher(gallery, identities, threshold, CosineMatcher)
    }
}

impl<M: Matcher> DecisionPipeline<M> {
    pub fn with_matcher(
        gallery: Arc<GalleryHandle>,
        identities: Arc<IdentityStore>,
        threshold: Threshold,
        matcher: M,
    ) -> Self {
        Self {
            gallery,
            identities,
            threshold,
            matcher,
        }
    }

    /// Classify raw image bytes.
    ///
    /// `Ok` covers accept, reject and inconclusive; `Err` only signals a
    /// transient extractor failure.
    pub fn decide<E>(&self, extractor: &mut E, image: &[u8]) -> Result<Decision, PipelineError>
    where
        E: EmbeddingExtractor + ?Sized,
    {
        let probe = match extractor.extract(image) {
            Ok(probe) => probe,
            Err(ExtractError::NoFace) => {
                tracing::info!(bytes = image.len(), "decide: no face detected");
                return Ok(Decision::inconclusive(MSG_NO_FACE));
            }
            Err(ExtractError::Malformed(reason)) => {
                tracing::info!(bytes = image.len(), %reason, "decide: image could not be decoded");
                return Ok(Decision::inconclusive(MSG_UNDECODABLE));
            }
            Err(ExtractError::Unavailable(reason)) => {
                tracing::warn!(%reason, "decide: extractor unavailable");
                return Err(PipelineError::ExtractorUnavailable(reason));
            }
        };

        Ok(self.decide_embedding(&probe))
    }

    /// Match an already-extracted embedding and resolve its identity.
    pub fn decide_embedding(&self, probe: &Embedding) -> Decision {
        let snapshot = self.gallery.snapshot();
        let result = self.matcher.compare(probe, snapshot.entries(), self.threshold);

        let decision = match result.identifier {
            Some(identifier) if result.matched => {
                let (display_name, degraded) = match self.identities.display_name(&identifier) {
                    Some(name) => (name.to_string(), false),
                    None => {
                        tracing::warn!(%identifier, "matched identifier has no identity record");
                        (placeholder_name(&identifier), true)
                    }
                };
                Decision {
                    matched: true,
                    inconclusive: false,
                    degraded,
                    identifier: Some(identifier),
                    display_name: Some(display_name),
                    confidence: result.confidence,
                    message: MSG_MATCH.to_string(),
                }
            }
            _ => Decision::reject(result.confidence),
        };

        tracing::info!(
            matched = decision.matched,
            identifier = decision.identifier.as_deref().unwrap_or("-"),
            confidence = decision.confidence,
            threshold = self.threshold.value(),
            gallery = snapshot.len(),
            degraded = decision.degraded,
            "decision"
        );

        decision
    }

    pub fn gallery(&self) -> &Arc<GalleryHandle> {
        &self.gallery
    }

    pub fn identities(&self) -> &IdentityStore {
        &self.identities
    }

    pub fn threshold(&self) -> Threshold {
        self.threshold
    }
}
