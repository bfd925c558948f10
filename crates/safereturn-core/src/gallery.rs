//! Gallery index — reference photos reduced to embeddings.
//!
//! A [`GalleryIndex`] is built wholesale from a photo directory and never
//! mutated afterwards. [`GalleryHandle`] publishes the current index as an
//! `Arc` snapshot; a rebuild swaps the pointer, so queries already holding
//! the old snapshot finish against it.
//!
//! Naming convention:
//! - `<root>/<id>.<ext>`        → identifier `<id>` (file stem)
//! - `<root>/<id>/<any>.<ext>`  → identifier `<id>` (several photos per person)

use crate::cache::{FileStamp, RepresentationCache};
use crate::extractor::{EmbeddingExtractor, ExtractError};
use crate::identity::IdentityStore;
use crate::types::ReferenceEntry;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};
use thiserror::Error;
use walkdir::WalkDir;

pub const IMAGE_EXTENSIONS: [&str; 5] = ["jpg", "jpeg", "png", "bmp", "webp"];

#[derive(Error, Debug)]
pub enum GalleryError {
    /// The extractor failed for a reason unrelated to the photo. The build is
    /// abandoned so a half-built gallery is never published.
    #[error("extractor unavailable while building gallery from {path}: {source}")]
    ExtractorUnavailable {
        path: PathBuf,
        #[source]
        source: ExtractError,
    },
}

/// A problem that degraded the gallery without failing the build.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum LoadWarning {
    #[error("gallery directory {0} does not exist; serving an empty gallery")]
    MissingDirectory(PathBuf),
    #[error("could not read {path}: {reason}")]
    Unreadable { path: PathBuf, reason: String },
    #[error("skipped {path}: {reason}")]
    Skipped { path: PathBuf, reason: ExtractError },
    #[error("identifier {0:?} has photos but no identity record")]
    DanglingIdentity(String),
    #[error("representation cache: {0}")]
    Cache(String),
}

/// Immutable set of reference entries in deterministic (sorted path) order.
#[derive(Debug, Clone, Default)]
pub struct GalleryIndex {
    entries: Vec<ReferenceEntry>,
}

/// Outcome of a successful build.
#[derive(Debug)]
pub struct GalleryLoad {
    pub index: GalleryIndex,
    pub warnings: Vec<LoadWarning>,
    /// Entries whose embedding came from the representation cache.
    pub cache_hits: usize,
}

impl GalleryIndex {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Build an index from `photo_dir` with no cache and no identity check.
    pub fn build<E>(photo_dir: &Path, extractor: &mut E) -> Result<GalleryLoad, GalleryError>
    where
        E: EmbeddingExtractor + ?Sized,
    {
        GalleryBuilder::new(photo_dir).build(extractor)
    }

    pub fn from_entries(entries: Vec<ReferenceEntry>) -> Self {
        Self { entries }
    }

    pub fn entries(&self) -> &[ReferenceEntry] {
        &self.entries
    }

    /// Distinct identifiers with at least one photo.
    pub fn identifiers(&self) -> BTreeSet<&str> {
        self.entries.iter().map(|e| e.identifier.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Configures and runs a gallery build.
pub struct GalleryBuilder<'a> {
    photo_dir: PathBuf,
    cache_path: Option<PathBuf>,
    identities: Option<&'a IdentityStore>,
}

struct Photo {
    path: PathBuf,
    /// Path relative to the gallery root, `/`-separated; the cache key.
    key: String,
    identifier: String,
}

impl<'a> GalleryBuilder<'a> {
    pub fn new(photo_dir: impl Into<PathBuf>) -> Self {
        Self {
            photo_dir: photo_dir.into(),
            cache_path: None,
            identities: None,
        }
    }

    /// Reuse and refresh embeddings stored at `path`.
    pub fn cache(mut self, path: impl Into<PathBuf>) -> Self {
        self.cache_path = Some(path.into());
        self
    }

    /// Warn about identifiers that have no identity record.
    pub fn identities(mut self, store: &'a IdentityStore) -> Self {
        self.identities = Some(store);
        self
    }

    pub fn build<E>(self, extractor: &mut E) -> Result<GalleryLoad, GalleryError>
    where
        E: EmbeddingExtractor + ?Sized,
    {
        let mut warnings = Vec::new();

        if !self.photo_dir.is_dir() {
            let warning = LoadWarning::MissingDirectory(self.photo_dir.clone());
            tracing::warn!("{warning}");
            warnings.push(warning);
            return Ok(GalleryLoad {
                index: GalleryIndex::empty(),
                warnings,
                cache_hits: 0,
            });
        }

        let previous = match &self.cache_path {
            Some(path) => RepresentationCache::load(path).unwrap_or_else(|e| {
                warnings.push(LoadWarning::Cache(e.to_string()));
                RepresentationCache::default()
            }),
            None => RepresentationCache::default(),
        };
        let mut refreshed = RepresentationCache::default();

        let model_version = extractor.model_version().to_string();
        let mut entries = Vec::new();
        let mut cache_hits = 0;

        for photo in discover_photos(&self.photo_dir, &mut warnings) {
            let bytes = match std::fs::read(&photo.path) {
                Ok(bytes) => bytes,
                Err(e) => {
                    warnings.push(LoadWarning::Unreadable {
                        path: photo.path,
                        reason: e.to_string(),
                    });
                    continue;
                }
            };
            let stamp = FileStamp::of(&bytes);

            let embedding = match previous.lookup(&photo.key, &stamp, &model_version) {
                Some(embedding) => {
                    cache_hits += 1;
                    embedding
                }
                None => match extractor.extract(&bytes) {
                    Ok(embedding) => embedding,
                    Err(reason) if reason.is_input_fault() => {
                        warnings.push(LoadWarning::Skipped {
                            path: photo.path,
                            reason,
                        });
                        continue;
                    }
                    Err(source) => {
                        return Err(GalleryError::ExtractorUnavailable {
                            path: photo.path,
                            source,
                        });
                    }
                },
            };

            refreshed.insert(photo.key, stamp, &model_version, &embedding);
            entries.push(ReferenceEntry {
                identifier: photo.identifier,
                source: photo.path,
                embedding,
            });
        }

        let index = GalleryIndex::from_entries(entries);

        if let Some(store) = self.identities {
            for identifier in index.identifiers() {
                if !store.contains(identifier) {
                    warnings.push(LoadWarning::DanglingIdentity(identifier.to_string()));
                }
            }
        }

        if let Some(path) = &self.cache_path {
            if let Err(e) = refreshed.save(path) {
                warnings.push(LoadWarning::Cache(e.to_string()));
            }
        }

        for warning in &warnings {
            tracing::warn!("{warning}");
        }
        tracing::info!(
            dir = %self.photo_dir.display(),
            entries = index.len(),
            identities = index.identifiers().len(),
            cache_hits,
            warnings = warnings.len(),
            "gallery built"
        );

        Ok(GalleryLoad {
            index,
            warnings,
            cache_hits,
        })
    }
}

fn is_image(path: &Path) -> bool {
    path.extension()
        .map(|e| e.to_string_lossy().to_ascii_lowercase())
        .is_some_and(|e| IMAGE_EXTENSIONS.contains(&e.as_str()))
}

fn is_hidden(name: &std::ffi::OsStr) -> bool {
    name.to_string_lossy().starts_with('.')
}

/// Image files under `root` in sorted order, with identifiers resolved.
fn discover_photos(root: &Path, warnings: &mut Vec<LoadWarning>) -> Vec<Photo> {
    let walker = WalkDir::new(root)
        .min_depth(1)
        .max_depth(2)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| !is_hidden(e.file_name()));

    let mut photos = Vec::new();
    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                warnings.push(LoadWarning::Unreadable {
                    path: e.path().map(Path::to_path_buf).unwrap_or_else(|| root.to_path_buf()),
                    reason: e.to_string(),
                });
                continue;
            }
        };
        if !entry.file_type().is_file() || !is_image(entry.path()) {
            continue;
        }
        let Ok(relative) = entry.path().strip_prefix(root) else {
            continue;
        };
        if let Some(identifier) = identifier_for(relative) {
            photos.push(Photo {
                path: entry.path().to_path_buf(),
                key: relative
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy())
                    .collect::<Vec<_>>()
                    .join("/"),
                identifier,
            });
        }
    }
    photos
}

/// Identifier for a photo path relative to the gallery root.
fn identifier_for(relative: &Path) -> Option<String> {
    let mut components = relative.components();
    let first = components.next()?.as_os_str().to_string_lossy().into_owned();
    if components.next().is_some() {
        // <id>/<photo>
        return Some(first);
    }
    relative
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .filter(|s| !s.is_empty())
}

/// Shared, swappable pointer to the current gallery snapshot.
#[derive(Debug)]
pub struct GalleryHandle {
    current: RwLock<Arc<GalleryIndex>>,
}

impl GalleryHandle {
    pub fn new(index: GalleryIndex) -> Self {
        Self {
            current: RwLock::new(Arc::new(index)),
        }
    }

    /// The snapshot queries should match against.
    pub fn snapshot(&self) -> Arc<GalleryIndex> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Replace the published snapshot, returning the previous one.
    pub fn publish(&self, index: GalleryIndex) -> Arc<GalleryIndex> {
        let next = Arc::new(index);
        let mut current = self.current.write().unwrap_or_else(PoisonError::into_inner);
        std::mem::replace(&mut *current, next)
    }
}

impl Default for GalleryHandle {
    fn default() -> Self {
        Self::new(GalleryIndex::empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extractor::MockExtractor;
    use crate::identity::IdentityRecord;
    use std::fs;

    fn write(dir: &Path, rel: &str, bytes: &[u8]) {
        let path = dir.join(rel);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(path, bytes).unwrap();
    }

    /// Counts real extractions so cache hits are observable.
    struct CountingExtractor {
        inner: MockExtractor,
        calls: usize,
    }

    impl CountingExtractor {
        fn new() -> Self {
            Self {
                inner: MockExtractor::new(),
                calls: 0,
            }
        }
    }

    impl EmbeddingExtractor for CountingExtractor {
        fn extract(&mut self, image: &[u8]) -> Result<crate::types::Embedding, ExtractError> {
            self.calls += 1;
            self.inner.extract(image)
        }

        fn model_version(&self) -> &str {
            self.inner.model_version()
        }
    }

    #[test]
    fn test_identifier_for() {
        assert_eq!(identifier_for(Path::new("001.jpg")).as_deref(), Some("001"));
        assert_eq!(identifier_for(Path::new("002/front.png")).as_deref(), Some("002"));
        assert_eq!(identifier_for(Path::new("a.b.jpeg")).as_deref(), Some("a.b"));
    }

    #[test]
    fn test_is_image() {
        assert!(is_image(Path::new("x.JPG")));
        assert!(is_image(Path::new("x.webp")));
        assert!(!is_image(Path::new("x.txt")));
        assert!(!is_image(Path::new("noext")));
    }

    #[test]
    fn test_build_orders_and_names_entries() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "b.jpg", b"bob");
        write(dir.path(), "a.jpg", b"alice");
        write(dir.path(), "c/side.png", b"carol-side");
        write(dir.path(), "c/front.png", b"carol-front");
        write(dir.path(), "notes.txt", b"ignored");
        write(dir.path(), ".hidden/x.jpg", b"ignored");

        let load = GalleryIndex::build(dir.path(), &mut MockExtractor::new()).unwrap();
        assert!(load.warnings.is_empty(), "{:?}", load.warnings);

        let ids: Vec<&str> = load.index.entries().iter().map(|e| e.identifier.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c", "c"]);
        assert!(load.index.entries()[2].source.ends_with("c/front.png"));
        assert_eq!(load.index.identifiers().len(), 3);
    }

    #[test]
    fn test_build_is_deterministic() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "x.jpg", b"x");
        write(dir.path(), "y.jpg", b"y");

        let first = GalleryIndex::build(dir.path(), &mut MockExtractor::new()).unwrap();
        let second = GalleryIndex::build(dir.path(), &mut MockExtractor::new()).unwrap();
        let pairs = |l: &GalleryLoad| {
            l.index
                .entries()
                .iter()
                .map(|e| (e.identifier.clone(), e.embedding.clone()))
                .collect::<Vec<_>>()
        };
        assert_eq!(pairs(&first), pairs(&second));
    }

    #[test]
    fn test_bad_photos_are_skipped_with_warnings() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "good.jpg", b"face");
        write(dir.path(), "blank.jpg", b"NOFACE wall");
        write(dir.path(), "empty.jpg", b"");

        let load = GalleryIndex::build(dir.path(), &mut MockExtractor::new()).unwrap();
        assert_eq!(load.index.len(), 1);
        assert_eq!(load.warnings.len(), 2);
        assert!(load.warnings.iter().any(|w| matches!(
            w,
            LoadWarning::Skipped { reason: ExtractError::NoFace, .. }
        )));
    }

    #[test]
    fn test_missing_directory_is_empty_gallery() {
        let dir = tempfile::tempdir().unwrap();
        let load =
            GalleryIndex::build(&dir.path().join("nope"), &mut MockExtractor::new()).unwrap();
        assert!(load.index.is_empty());
        assert!(matches!(load.warnings[..], [LoadWarning::MissingDirectory(_)]));
    }

    #[test]
    fn test_unavailable_extractor_fails_build() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "a.jpg", b"alice");
        let result = GalleryIndex::build(dir.path(), &mut MockExtractor::unavailable());
        assert!(matches!(result, Err(GalleryError::ExtractorUnavailable { .. })));
    }

    #[test]
    fn test_dangling_identities_reported() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "A.jpg", b"alice");
        write(dir.path(), "C.jpg", b"carol");
        let store = IdentityStore::from_records([IdentityRecord {
            identifier: "A".into(),
            display_name: "Alice".into(),
        }])
        .unwrap();

        let load = GalleryBuilder::new(dir.path())
            .identities(&store)
            .build(&mut MockExtractor::new())
            .unwrap();
        assert_eq!(load.index.len(), 2);
        assert_eq!(load.warnings, vec![LoadWarning::DanglingIdentity("C".into())]);
    }

    #[test]
    fn test_cache_reuses_unchanged_photos() {
        let dir = tempfile::tempdir().unwrap();
        let cache_path = dir.path().join(".representations.json");
        write(dir.path(), "a.jpg", b"alice");
        write(dir.path(), "b.jpg", b"bob");

        let mut extractor = CountingExtractor::new();
        let first = GalleryBuilder::new(dir.path())
            .cache(&cache_path)
            .build(&mut extractor)
            .unwrap();
        assert_eq!(extractor.calls, 2);
        assert_eq!(first.cache_hits, 0);
        assert!(cache_path.exists());

        write(dir.path(), "c.jpg", b"carol");
        let second = GalleryBuilder::new(dir.path())
            .cache(&cache_path)
            .build(&mut extractor)
            .unwrap();
        assert_eq!(extractor.calls, 3);
        assert_eq!(second.cache_hits, 2);
        assert_eq!(
            first.index.entries()[0].embedding,
            second.index.entries()[0].embedding
        );
    }

    #[test]
    fn test_cache_misses_photo_replaced_with_same_length() {
        let dir = tempfile::tempdir().unwrap();
        let cache_path = dir.path().join(".representations.json");
        write(dir.path(), "A.jpg", b"alice-old");

        let mut extractor = CountingExtractor::new();
        let first = GalleryBuilder::new(dir.path())
            .cache(&cache_path)
            .build(&mut extractor)
            .unwrap();

        // Same size, and usually the same mtime second.
        write(dir.path(), "A.jpg", b"alice-new");
        let second = GalleryBuilder::new(dir.path())
            .cache(&cache_path)
            .build(&mut extractor)
            .unwrap();

        assert_eq!(extractor.calls, 2);
        assert_eq!(second.cache_hits, 0);
        assert_ne!(
            first.index.entries()[0].embedding,
            second.index.entries()[0].embedding
        );
        assert_eq!(
            second.index.entries()[0].embedding,
            MockExtractor::new().extract(b"alice-new").unwrap()
        );
    }

    #[test]
    fn test_corrupt_cache_is_a_warning() {
        let dir = tempfile::tempdir().unwrap();
        let cache_path = dir.path().join(".representations.json");
        fs::write(&cache_path, b"garbage").unwrap();
        write(dir.path(), "a.jpg", b"alice");

        let load = GalleryBuilder::new(dir.path())
            .cache(&cache_path)
            .build(&mut MockExtractor::new())
            .unwrap();
        assert_eq!(load.index.len(), 1);
        assert!(matches!(load.warnings[..], [LoadWarning::Cache(_)]));
    }

    #[test]
    fn test_handle_swap_keeps_old_snapshot_alive() {
        let handle = GalleryHandle::default();
        let before = handle.snapshot();
        assert!(before.is_empty());

        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "a.jpg", b"alice");
        let load = GalleryIndex::build(dir.path(), &mut MockExtractor::new()).unwrap();
        let previous = handle.publish(load.index);

        assert!(Arc::ptr_eq(&before, &previous));
        assert!(before.is_empty());
        assert_eq!(handle.snapshot().len(), 1);
    }
}
