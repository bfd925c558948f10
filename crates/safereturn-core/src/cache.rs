//! On-disk cache of gallery representations.
//!
//! Stores one embedding per photo, keyed by its path relative to the gallery
//! root and stamped with the photo's size, SHA-256 digest and the model
//! version. A rebuild reuses an entry only when the photo's bytes are
//! unchanged, whatever its modification time says.

use crate::types::Embedding;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::Path;
use thiserror::Error;

const CACHE_FORMAT_VERSION: u32 = 2;

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("cache io: {0}")]
    Io(#[from] std::io::Error),
    #[error("cache is corrupt: {0}")]
    Corrupt(#[from] serde_json::Error),
    #[error("cache format version {found} is not supported")]
    Version { found: u32 },
}

/// Size and content digest of a photo when its embedding was computed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileStamp {
    pub len: u64,
    /// Hex-encoded SHA-256 of the photo bytes.
    pub sha256: String,
}

impl FileStamp {
    pub fn of(bytes: &[u8]) -> Self {
        Self {
            len: bytes.len() as u64,
            sha256: hex::encode(Sha256::digest(bytes)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CachedRepresentation {
    #[serde(flatten)]
    stamp: FileStamp,
    model_version: String,
    embedding: Vec<f32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepresentationCache {
    version: u32,
    entries: BTreeMap<String, CachedRepresentation>,
}

impl Default for RepresentationCache {
    fn default() -> Self {
        Self {
            version: CACHE_FORMAT_VERSION,
            entries: BTreeMap::new(),
        }
    }
}

impl RepresentationCache {
    /// Read the cache at `path`. A missing file is an empty cache.
    pub fn load(path: &Path) -> Result<Self, CacheError> {
        let raw = match std::fs::read(path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => return Err(e.into()),
        };
        let cache: Self = serde_json::from_slice(&raw)?;
        if cache.version != CACHE_FORMAT_VERSION {
            return Err(CacheError::Version { found: cache.version });
        }
        Ok(cache)
    }

    /// Write via a sibling temp file and rename, so readers never see half a cache.
    pub fn save(&self, path: &Path) -> Result<(), CacheError> {
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_vec(self)?)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }

    /// Cached embedding for `key`, if the photo and model are unchanged.
    pub fn lookup(&self, key: &str, stamp: &FileStamp, model_version: &str) -> Option<Embedding> {
        let cached = self.entries.get(key)?;
        if cached.stamp != *stamp || cached.model_version != model_version {
            return None;
        }
        Some(Embedding {
            values: cached.embedding.clone(),
            model_version: Some(cached.model_version.clone()),
        })
    }

    pub fn insert(
        &mut self,
        key: String,
        stamp: FileStamp,
        model_version: &str,
        embedding: &Embedding,
    ) {
        self.entries.insert(
            key,
            CachedRepresentation {
                stamp,
                model_version: model_version.to_string(),
                embedding: embedding.values.clone(),
            },
        );
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
