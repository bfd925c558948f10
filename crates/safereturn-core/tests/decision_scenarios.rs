//! End-to-end decisions over on-disk galleries and identity tables.

use safereturn_core::identity::placeholder_name;
use safereturn_core::{
    DecisionPipeline, GalleryBuilder, GalleryHandle, GalleryIndex, IdentityStore, MockExtractor,
    Threshold,
};
use std::path::Path;
use std::sync::Arc;

fn write(dir: &Path, rel: &str, bytes: &[u8]) {
    let path = dir.join(rel);
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, bytes).unwrap();
}

struct Fixture {
    _dir: tempfile::TempDir,
    pipeline: DecisionPipeline,
}

fn fixture(photos: &[(&str, &[u8])], table: &str, threshold: f32) -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let gallery_dir = dir.path().join("data");
    std::fs::create_dir_all(&gallery_dir).unwrap();
    for (name, bytes) in photos {
        write(&gallery_dir, name, bytes);
    }
    let table_path = dir.path().join("sheet.csv");
    std::fs::write(&table_path, table).unwrap();

    let identities = IdentityStore::load(&table_path).unwrap();
    let load = GalleryBuilder::new(&gallery_dir)
        .identities(&identities)
        .build(&mut MockExtractor::new())
        .unwrap();

    Fixture {
        pipeline: DecisionPipeline::new(
            Arc::new(GalleryHandle::new(load.index)),
            Arc::new(identities),
            Threshold::new(threshold).unwrap(),
        ),
        _dir: dir,
    }
}

const ALICE: &[u8] = b"a.jpg: alice, frontal";
const BOB: &[u8] = b"b.jpg: bob, frontal";
const CAROL: &[u8] = b"c.jpg: carol, frontal";
const STRANGER: &[u8] = b"visitor, unrelated";

#[test]
fn alice_and_bob_scenario() {
    let f = fixture(
        &[("A.jpg", ALICE), ("B.jpg", BOB)],
        "Inmate Id,Name\nA,Alice\nB,Bob\n",
        0.6,
    );
    let mut ex = MockExtractor::new();

    let d = f.pipeline.decide(&mut ex, ALICE).unwrap();
    assert!(d.matched);
    assert_eq!(d.identifier.as_deref(), Some("A"));
    assert_eq!(d.display_name.as_deref(), Some("Alice"));
    assert!(d.confidence >= 0.6);

    let d = f.pipeline.decide(&mut ex, STRANGER).unwrap();
    assert!(!d.matched);
    assert!(!d.inconclusive);
    assert!(d.confidence < 0.6);
}

#[test]
fn dangling_reference_gets_placeholder() {
    let f = fixture(
        &[("A.jpg", ALICE), ("C.jpg", CAROL)],
        "Inmate Id,Name\nA,Alice\n",
        0.6,
    );
    let d = f.pipeline.decide(&mut MockExtractor::new(), CAROL).unwrap();
    assert!(d.matched);
    assert!(d.degraded);
    assert_eq!(d.identifier.as_deref(), Some("C"));
    assert_eq!(d.display_name, Some(placeholder_name("C")));
}

#[test]
fn no_face_is_inconclusive_regardless_of_gallery() {
    let query = b"NOFACE: photo of a wall";
    let empty = fixture(&[], "id,name\n", 0.6);
    let full = fixture(&[("A.jpg", ALICE)], "id,name\nA,Alice\n", 0.0);

    for f in [&empty, &full] {
        let d = f.pipeline.decide(&mut MockExtractor::new(), query).unwrap();
        assert!(d.inconclusive);
        assert!(!d.matched);
    }
}

#[test]
fn empty_gallery_rejects_everything() {
    let f = fixture(&[], "id,name\nA,Alice\n", 0.0);
    for query in [ALICE, BOB, STRANGER] {
        let d = f.pipeline.decide(&mut MockExtractor::new(), query).unwrap();
        assert!(!d.matched);
        assert_eq!(d.confidence, 0.0);
    }
}

#[test]
fn round_trip_after_adding_reference() {
    let dir = tempfile::tempdir().unwrap();
    let handle = Arc::new(GalleryHandle::new(GalleryIndex::empty()));
    let identities = Arc::new(
        IdentityStore::from_rows(vec![
            vec!["id".to_string(), "name".to_string()],
            vec!["X".to_string(), "Xavier".to_string()],
        ])
        .unwrap(),
    );
    let threshold = Threshold::new(0.6).unwrap();
    let pipeline = DecisionPipeline::new(handle.clone(), identities, threshold);
    let mut ex = MockExtractor::new();
    let photo = b"xavier, frontal";

    assert!(!pipeline.decide(&mut ex, photo).unwrap().matched);

    write(dir.path(), "X/front.jpg", photo);
    let load = GalleryIndex::build(dir.path(), &mut ex).unwrap();
    handle.publish(load.index);

    let d = pipeline.decide(&mut ex, photo).unwrap();
    assert!(d.matched);
    assert_eq!(d.identifier.as_deref(), Some("X"));
    assert!(d.confidence >= threshold.value());
}

#[test]
fn failed_rebuild_keeps_published_gallery() {
    let f = fixture(&[("A.jpg", ALICE)], "id,name\nA,Alice\n", 0.6);
    let handle = f.pipeline.gallery().clone();
    let before = handle.snapshot();

    let dir = tempfile::tempdir().unwrap();
    write(dir.path(), "B.jpg", BOB);
    let rebuilt = GalleryIndex::build(dir.path(), &mut MockExtractor::unavailable());
    assert!(rebuilt.is_err());

    assert!(Arc::ptr_eq(&before, &handle.snapshot()));
    let d = f.pipeline.decide(&mut MockExtractor::new(), ALICE).unwrap();
    assert_eq!(d.identifier.as_deref(), Some("A"));
}

#[test]
fn repeated_queries_are_identical() {
    let f = fixture(
        &[("A.jpg", ALICE), ("B.jpg", BOB), ("C/1.png", CAROL)],
        "id,name\nA,Alice\nB,Bob\nC,Carol\n",
        0.6,
    );
    let mut ex = MockExtractor::new();
    for query in [ALICE, CAROL, STRANGER] {
        let first = f.pipeline.decide(&mut ex, query).unwrap();
        let second = f.pipeline.decide(&mut ex, query).unwrap();
        assert_eq!(first, second);
    }
}

#[test]
fn acceptance_is_monotonic_in_threshold() {
    let photos: &[(&str, &[u8])] = &[("A.jpg", ALICE), ("B.jpg", BOB)];
    let table = "id,name\nA,Alice\nB,Bob\n";
    let thresholds = [0.0f32, 0.2, 0.4, 0.6, 0.8, 1.0];

    for query in [ALICE, STRANGER] {
        let accepted: Vec<bool> = thresholds
            .iter()
            .map(|&t| {
                let f = fixture(photos, table, t);
                f.pipeline.decide(&mut MockExtractor::new(), query).unwrap().matched
            })
            .collect();
        // Once rejected at some threshold, every higher threshold rejects too.
        for pair in accepted.windows(2) {
            assert!(pair[0] || !pair[1], "{accepted:?}");
        }
    }
}
