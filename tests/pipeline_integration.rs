//! Integration tests for discovery, identity, manifests, and organize

use audiobook_shepherd::core::{collect_book_dirs, LibraryIndex, ManifestStore, OrganizeEngine, PlanAction};
use audiobook_shepherd::models::manifest::RunStatus;
use audiobook_shepherd::models::{HintSet, SourceBook};
use audiobook_shepherd::utils::{book_hash, sanitize_component, ComponentKind};
use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

const STAGES: &[&str] = &["validate", "concat", "convert", "organize", "cleanup"];

/// Create a mock multi-file audiobook folder
fn make_book(root: &Path, name: &str, tracks: usize) -> std::path::PathBuf {
    let dir = root.join(name);
    fs::create_dir_all(&dir).unwrap();
    for i in 1..=tracks {
        fs::write(dir.join(format!("{:02}.mp3", i)), b"fake mp3 data").unwrap();
    }
    dir
}

#[test]
fn test_discovery_walk() {
    let temp = TempDir::new().unwrap();
    let root = temp.path();

    make_book(root, "Brandon Sanderson - Mistborn 01 - The Final Empire", 14);
    make_book(root, "Paulo Coelho - The Alchemist", 1);

    // Non-book noise.
    fs::create_dir(root.join("empty_folder")).unwrap();
    fs::write(root.join("stray.txt"), b"not audio").unwrap();

    let books = collect_book_dirs(root).unwrap();
    assert_eq!(books.len(), 2);
}

#[test]
fn test_identity_determinism() {
    let temp = TempDir::new().unwrap();
    let dir = make_book(temp.path(), "Some Book", 3);

    let first = book_hash(&dir).unwrap();
    let second = book_hash(&dir).unwrap();
    assert_eq!(first, second);
    assert_eq!(first.len(), 16);

    // Identity depends on the audio set.
    fs::write(dir.join("04.mp3"), b"x").unwrap();
    assert_ne!(book_hash(&dir).unwrap(), first);
}

#[test]
fn test_identity_ignores_non_audio() {
    let temp = TempDir::new().unwrap();
    let dir = make_book(temp.path(), "Some Book", 3);
    let before = book_hash(&dir).unwrap();

    fs::write(dir.join("cover.jpg"), b"image").unwrap();
    fs::write(dir.join("notes.txt"), b"text").unwrap();
    assert_eq!(book_hash(&dir).unwrap(), before);
}

#[tokio::test]
async fn test_manifest_lifecycle() {
    let temp = TempDir::new().unwrap();
    let store = ManifestStore::new(temp.path()).unwrap();
    let hash = "1234abcd5678ef90";

    let manifest = store
        .create(hash, Path::new("/in/book"), STAGES, 2, false)
        .await
        .unwrap();
    assert_eq!(manifest.status, RunStatus::Pending);

    // Simulate a run up through convert, then a crash before organize.
    store
        .set_stage(hash, "validate", RunStatus::Completed, None)
        .await
        .unwrap();
    store
        .set_stage(hash, "concat", RunStatus::Completed, None)
        .await
        .unwrap();
    store
        .set_stage(hash, "convert", RunStatus::InProgress, None)
        .await
        .unwrap();

    // A fresh load sees exactly the persisted state.
    let resumed = store.load(hash).await.unwrap();
    assert_eq!(resumed.stage_status("validate"), RunStatus::Completed);
    assert_eq!(resumed.stage_status("convert"), RunStatus::InProgress);
    assert_eq!(resumed.stage_status("organize"), RunStatus::Pending);

    // Failure bookkeeping.
    store
        .set_stage(hash, "convert", RunStatus::Failed, None)
        .await
        .unwrap();
    store
        .set_error(hash, "external_tool", "encoder exited with 1", "convert")
        .await
        .unwrap();
    store.increment_retry(hash).await.unwrap();

    let failed = store.load(hash).await.unwrap();
    assert_eq!(failed.retry_count, 1);
    assert_eq!(failed.last_error.as_ref().unwrap().stage, "convert");
}

#[tokio::test]
async fn test_manifest_force_recreate() {
    let temp = TempDir::new().unwrap();
    let store = ManifestStore::new(temp.path()).unwrap();
    let hash = "aaaabbbbccccdddd";

    store
        .create(hash, Path::new("/in/book"), STAGES, 2, false)
        .await
        .unwrap();
    store
        .set_stage(hash, "validate", RunStatus::Completed, None)
        .await
        .unwrap();

    // Force starts over from nothing.
    let fresh = store
        .create(hash, Path::new("/in/book"), STAGES, 2, true)
        .await
        .unwrap();
    assert_eq!(fresh.stage_status("validate"), RunStatus::Pending);
    assert_eq!(fresh.retry_count, 0);
}

fn engine_for(root: &Path) -> OrganizeEngine {
    let index = LibraryIndex::build(root).unwrap();
    OrganizeEngine::new(
        root.to_path_buf(),
        Arc::new(Mutex::new(index)),
        0o644,
        "Unknown Author".to_string(),
        false,
        false,
    )
}

fn identity(author: &str, title: &str, series: &str, position: &str) -> HintSet {
    HintSet {
        author: author.to_string(),
        title: title.to_string(),
        series: series.to_string(),
        position: position.to_string(),
        ..Default::default()
    }
}

#[test]
fn test_destination_shapes() {
    let library = TempDir::new().unwrap();
    let engine = engine_for(library.path());

    // With series: <root>/<Author>/<Series>/<PaddedPos> - <Title>/<Title>.m4b
    let plan = engine
        .plan(
            Path::new("/in/book"),
            &identity("Brandon Sanderson", "The Final Empire", "Mistborn", "1"),
            2,
            false,
        )
        .unwrap();
    assert_eq!(
        plan.dest_path(),
        library
            .path()
            .join("Brandon Sanderson/Mistborn/01 - The Final Empire/The Final Empire.m4b")
    );

    // Without series: <root>/<Author>/<Title>/<Title>.m4b
    let plan = engine
        .plan(
            Path::new("/in/book2"),
            &identity("Paulo Coelho", "The Alchemist", "", ""),
            2,
            false,
        )
        .unwrap();
    assert_eq!(
        plan.dest_path(),
        library.path().join("Paulo Coelho/The Alchemist/The Alchemist.m4b")
    );
}

#[test]
fn test_correctly_placed_is_skipped() {
    let library = TempDir::new().unwrap();
    let book_dir = library.path().join("Neil Gaiman/American Gods");
    fs::create_dir_all(&book_dir).unwrap();
    fs::write(book_dir.join("American Gods.m4b"), b"audio").unwrap();

    let engine = engine_for(library.path());
    let plan = engine
        .plan(&book_dir, &identity("Neil Gaiman", "American Gods", "", ""), 2, true)
        .unwrap();

    assert_eq!(plan.action, PlanAction::SkipCorrectlyPlaced);
    let result = engine
        .commit(&plan, &book_dir.join("American Gods.m4b"), &book_dir)
        .unwrap();
    assert!(result.is_none());
    // Nothing moved.
    assert!(book_dir.join("American Gods.m4b").exists());
}

#[test]
fn test_same_stem_different_books_do_not_collide() {
    let library = TempDir::new().unwrap();
    let engine = engine_for(library.path());

    let src1 = TempDir::new().unwrap();
    let file1 = src1.path().join("book.m4b");
    fs::write(&file1, b"one").unwrap();

    let src2 = TempDir::new().unwrap();
    let file2 = src2.path().join("book.m4b");
    fs::write(&file2, b"two").unwrap();

    let plan1 = engine
        .plan(src1.path(), &identity("Author One", "Same Title Alpha", "", ""), 2, false)
        .unwrap();
    let plan2 = engine
        .plan(src2.path(), &identity("Author Two", "Same Title Beta", "", ""), 2, false)
        .unwrap();

    let dest1 = engine.commit(&plan1, &file1, src1.path()).unwrap().unwrap();
    let dest2 = engine.commit(&plan2, &file2, src2.path()).unwrap().unwrap();

    assert_ne!(dest1, dest2);
    assert!(dest1.exists());
    assert!(dest2.exists());
}

#[test]
fn test_casing_reuse_on_second_commit() {
    let library = TempDir::new().unwrap();
    fs::create_dir_all(library.path().join("brandon sanderson/Mistborn")).unwrap();

    let engine = engine_for(library.path());
    let plan = engine
        .plan(
            Path::new("/in/x"),
            &identity("Brandon Sanderson", "The Well of Ascension", "Mistborn", "2"),
            2,
            false,
        )
        .unwrap();

    // Existing author folder casing wins over the resolved casing.
    assert!(plan.dest_dir.starts_with(library.path().join("brandon sanderson")));
}

#[test]
fn test_sanitize_properties() {
    // No invalid bytes, bounded length, multi-byte safety.
    let nasty = format!("A{}B: the * sequel?.m4b", "界".repeat(120));
    let out = sanitize_component(&nasty, ComponentKind::Filename);

    assert!(out.len() <= 255);
    for c in ['/', '\\', ':', '*', '?', '"', '<', '>', '|'] {
        assert!(!out.contains(c));
    }
    assert!(std::str::from_utf8(out.as_bytes()).is_ok());
    assert!(out.ends_with(".m4b"));

    // Idempotence.
    assert_eq!(sanitize_component(&out, ComponentKind::Filename), out);
}

#[test]
fn test_discover_sorts_tracks_naturally() {
    let temp = TempDir::new().unwrap();
    let dir = temp.path().join("Numbered");
    fs::create_dir(&dir).unwrap();
    for n in [1, 2, 10, 11] {
        fs::write(dir.join(format!("{}.mp3", n)), b"x").unwrap();
    }

    let book = SourceBook::discover(&dir).unwrap();
    let names: Vec<String> = book
        .audio_files
        .iter()
        .map(|p| p.file_name().unwrap().to_string_lossy().to_string())
        .collect();
    assert_eq!(names, vec!["1.mp3", "2.mp3", "10.mp3", "11.mp3"]);
}
