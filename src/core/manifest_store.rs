//! Per-book manifest persistence
//!
//! One JSON document per book under the manifest directory, named
//! `<book_hash>.json`. Every mutation is read-modify-write behind a
//! per-hash mutex, written to a temp file and renamed so a crash at any
//! point leaves either the old document or the new one, never a partial.

use crate::models::manifest::{LastError, Manifest, RunStatus, StageState};
use anyhow::{Context, Result};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;

/// Manifest document store
pub struct ManifestStore {
    dir: PathBuf,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl ManifestStore {
    /// Open (and create) the manifest directory
    pub fn new(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create manifest dir {}", dir.display()))?;
        Ok(Self {
            dir: dir.to_path_buf(),
            locks: Mutex::new(HashMap::new()),
        })
    }

    pub fn manifest_path(&self, book_hash: &str) -> PathBuf {
        self.dir.join(format!("{}.json", book_hash))
    }

    pub fn exists(&self, book_hash: &str) -> bool {
        self.manifest_path(book_hash).exists()
    }

    /// Initialize a manifest with every stage pending.
    ///
    /// Fails when one already exists unless `force`, which deletes the old
    /// document first (a forced rerun starts from nothing, not from zeroed
    /// fields).
    pub async fn create(
        &self,
        book_hash: &str,
        source_path: &Path,
        stage_names: &[&str],
        max_retries: u32,
        force: bool,
    ) -> Result<Manifest> {
        let guard = self.lock_for(book_hash).await;
        let _held = guard.lock().await;

        let path = self.manifest_path(book_hash);
        if path.exists() {
            if !force {
                anyhow::bail!("manifest already exists for {}", book_hash);
            }
            std::fs::remove_file(&path)
                .with_context(|| format!("Failed to delete {}", path.display()))?;
            tracing::info!("Deleted existing manifest for {} (force)", book_hash);
        }

        let manifest = Manifest::new(book_hash, source_path, stage_names, max_retries);
        self.write_atomic(book_hash, &manifest)?;
        Ok(manifest)
    }

    /// Load a manifest document
    pub async fn load(&self, book_hash: &str) -> Result<Manifest> {
        let path = self.manifest_path(book_hash);
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read manifest {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Corrupt manifest {}", path.display()))
    }

    /// Delete a manifest; missing is not an error
    pub async fn delete(&self, book_hash: &str) -> Result<()> {
        let guard = self.lock_for(book_hash).await;
        let _held = guard.lock().await;

        let path = self.manifest_path(book_hash);
        if path.exists() {
            std::fs::remove_file(&path)
                .with_context(|| format!("Failed to delete {}", path.display()))?;
        }
        Ok(())
    }

    /// Merge a sparse patch into the document
    pub async fn update(&self, book_hash: &str, patch: Value) -> Result<Manifest> {
        self.mutate(book_hash, |doc| {
            deep_merge(doc, &patch);
            Ok(())
        })
        .await
    }

    /// Set one value by dotted path, e.g. `stages.convert.output_path`
    pub async fn update_path(&self, book_hash: &str, dotted: &str, value: Value) -> Result<Manifest> {
        self.mutate(book_hash, |doc| {
            set_dotted(doc, dotted, value.clone());
            Ok(())
        })
        .await
    }

    /// Transition a stage, stamping the matching timestamp
    pub async fn set_stage(
        &self,
        book_hash: &str,
        stage: &str,
        status: RunStatus,
        payload: Option<Map<String, Value>>,
    ) -> Result<()> {
        let now = chrono::Utc::now().to_rfc3339();
        self.mutate(book_hash, move |doc| {
            let stage_entry = doc
                .get_mut("stages")
                .and_then(|s| s.as_object_mut())
                .context("manifest has no stages object")?
                .entry(stage.to_string())
                .or_insert_with(|| serde_json::to_value(StageState::pending()).unwrap());

            let obj = stage_entry
                .as_object_mut()
                .context("stage entry is not an object")?;
            obj.insert("status".into(), Value::String(status.as_str().into()));
            match status {
                RunStatus::InProgress => {
                    obj.insert("started_at".into(), Value::String(now.clone()));
                }
                RunStatus::Completed | RunStatus::Failed => {
                    obj.insert("finished_at".into(), Value::String(now.clone()));
                }
                RunStatus::Pending => {}
            }
            if let Some(ref payload) = payload {
                for (key, value) in payload {
                    obj.insert(key.clone(), value.clone());
                }
            }
            Ok(())
        })
        .await?;
        Ok(())
    }

    /// Record the last error without touching stage status
    pub async fn set_error(
        &self,
        book_hash: &str,
        category: &str,
        message: &str,
        stage: &str,
    ) -> Result<()> {
        let last_error = LastError {
            category: category.to_string(),
            message: message.to_string(),
            stage: stage.to_string(),
        };
        self.mutate(book_hash, move |doc| {
            doc.as_object_mut()
                .context("manifest is not an object")?
                .insert("last_error".into(), serde_json::to_value(&last_error)?);
            Ok(())
        })
        .await?;
        Ok(())
    }

    /// Bump the retry counter, returning the new count
    pub async fn increment_retry(&self, book_hash: &str) -> Result<u32> {
        let updated = self
            .mutate(book_hash, |doc| {
                let obj = doc.as_object_mut().context("manifest is not an object")?;
                let count = obj
                    .get("retry_count")
                    .and_then(|v| v.as_u64())
                    .unwrap_or(0)
                    + 1;
                obj.insert("retry_count".into(), Value::from(count));
                Ok(())
            })
            .await?;
        Ok(updated.retry_count)
    }

    /// Set the book-level status, stamping `completed_at` on completion
    pub async fn set_book_status(&self, book_hash: &str, status: RunStatus) -> Result<()> {
        let now = chrono::Utc::now().to_rfc3339();
        self.mutate(book_hash, move |doc| {
            let obj = doc.as_object_mut().context("manifest is not an object")?;
            obj.insert("status".into(), Value::String(status.as_str().into()));
            if status == RunStatus::Completed {
                obj.insert("completed_at".into(), Value::String(now.clone()));
            }
            Ok(())
        })
        .await?;
        Ok(())
    }

    /// Read-modify-write under the per-hash mutex
    async fn mutate<F>(&self, book_hash: &str, mutator: F) -> Result<Manifest>
    where
        F: FnOnce(&mut Value) -> Result<()>,
    {
        let guard = self.lock_for(book_hash).await;
        let _held = guard.lock().await;

        let path = self.manifest_path(book_hash);
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read manifest {}", path.display()))?;
        let mut doc: Value = serde_json::from_str(&content)
            .with_context(|| format!("Corrupt manifest {}", path.display()))?;

        mutator(&mut doc)?;

        if let Some(obj) = doc.as_object_mut() {
            obj.insert(
                "updated_at".into(),
                Value::String(chrono::Utc::now().to_rfc3339()),
            );
        }

        let manifest: Manifest =
            serde_json::from_value(doc.clone()).context("Patched manifest no longer parses")?;
        self.write_atomic_value(book_hash, &doc)?;
        Ok(manifest)
    }

    fn write_atomic(&self, book_hash: &str, manifest: &Manifest) -> Result<()> {
        let doc = serde_json::to_value(manifest).context("Failed to serialize manifest")?;
        self.write_atomic_value(book_hash, &doc)
    }

    fn write_atomic_value(&self, book_hash: &str, doc: &Value) -> Result<()> {
        let path = self.manifest_path(book_hash);
        let tmp = self.dir.join(format!(".{}.json.tmp", book_hash));

        let content =
            serde_json::to_string_pretty(doc).context("Failed to serialize manifest")?;
        std::fs::write(&tmp, content)
            .with_context(|| format!("Failed to write {}", tmp.display()))?;
        std::fs::rename(&tmp, &path)
            .with_context(|| format!("Failed to commit {}", path.display()))?;
        Ok(())
    }

    async fn lock_for(&self, book_hash: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks
            .entry(book_hash.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

/// Recursively merge `patch` into `doc`; objects merge, everything else
/// replaces
fn deep_merge(doc: &mut Value, patch: &Value) {
    match (doc, patch) {
        (Value::Object(doc_map), Value::Object(patch_map)) => {
            for (key, patch_value) in patch_map {
                match doc_map.get_mut(key) {
                    Some(existing) => deep_merge(existing, patch_value),
                    None => {
                        doc_map.insert(key.clone(), patch_value.clone());
                    }
                }
            }
        }
        (doc_slot, patch_value) => {
            *doc_slot = patch_value.clone();
        }
    }
}

/// Set a value at a dotted path, creating intermediate objects
fn set_dotted(doc: &mut Value, dotted: &str, value: Value) {
    let mut current = doc;
    let parts: Vec<&str> = dotted.split('.').collect();

    for (i, part) in parts.iter().enumerate() {
        if i == parts.len() - 1 {
            if let Some(obj) = current.as_object_mut() {
                obj.insert(part.to_string(), value);
            }
            return;
        }
        if !current.get(*part).map(|v| v.is_object()).unwrap_or(false) {
            if let Some(obj) = current.as_object_mut() {
                obj.insert(part.to_string(), Value::Object(Map::new()));
            }
        }
        current = match current.get_mut(*part) {
            Some(next) => next,
            None => return,
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const STAGES: &[&str] = &["validate", "concat", "convert", "organize", "cleanup"];

    async fn store() -> (tempfile::TempDir, ManifestStore) {
        let dir = tempdir().unwrap();
        let store = ManifestStore::new(dir.path()).unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn test_create_and_load() {
        let (_dir, store) = store().await;
        store
            .create("aaaa000011112222", Path::new("/in/book"), STAGES, 2, false)
            .await
            .unwrap();

        let loaded = store.load("aaaa000011112222").await.unwrap();
        assert_eq!(loaded.book_hash, "aaaa000011112222");
        assert_eq!(loaded.status, RunStatus::Pending);
        assert_eq!(loaded.stages.len(), STAGES.len());
    }

    #[tokio::test]
    async fn test_create_twice_fails_without_force() {
        let (_dir, store) = store().await;
        store
            .create("aaaa000011112222", Path::new("/in/book"), STAGES, 2, false)
            .await
            .unwrap();
        assert!(store
            .create("aaaa000011112222", Path::new("/in/book"), STAGES, 2, false)
            .await
            .is_err());

        // Force deletes and recreates.
        store
            .create("aaaa000011112222", Path::new("/in/book"), STAGES, 2, true)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_set_stage_and_timestamps() {
        let (_dir, store) = store().await;
        store
            .create("bbbb000011112222", Path::new("/in/book"), STAGES, 2, false)
            .await
            .unwrap();

        store
            .set_stage("bbbb000011112222", "validate", RunStatus::InProgress, None)
            .await
            .unwrap();
        let m = store.load("bbbb000011112222").await.unwrap();
        assert_eq!(m.stage_status("validate"), RunStatus::InProgress);
        assert!(m.stage_value("validate", "started_at").is_some());

        let mut payload = Map::new();
        payload.insert("file_count".into(), Value::from(14));
        store
            .set_stage("bbbb000011112222", "validate", RunStatus::Completed, Some(payload))
            .await
            .unwrap();
        let m = store.load("bbbb000011112222").await.unwrap();
        assert_eq!(m.stage_status("validate"), RunStatus::Completed);
        assert_eq!(m.stage_value("validate", "file_count").unwrap(), 14);
    }

    #[tokio::test]
    async fn test_set_error_preserves_stage_status() {
        let (_dir, store) = store().await;
        store
            .create("cccc000011112222", Path::new("/in/book"), STAGES, 2, false)
            .await
            .unwrap();

        store
            .set_error("cccc000011112222", "external_tool", "encoder blew up", "convert")
            .await
            .unwrap();

        let m = store.load("cccc000011112222").await.unwrap();
        assert_eq!(m.stage_status("convert"), RunStatus::Pending);
        let err = m.last_error.unwrap();
        assert_eq!(err.category, "external_tool");
        assert_eq!(err.stage, "convert");
    }

    #[tokio::test]
    async fn test_increment_retry() {
        let (_dir, store) = store().await;
        store
            .create("dddd000011112222", Path::new("/in/book"), STAGES, 2, false)
            .await
            .unwrap();

        assert_eq!(store.increment_retry("dddd000011112222").await.unwrap(), 1);
        assert_eq!(store.increment_retry("dddd000011112222").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_update_refreshes_updated_at() {
        let (_dir, store) = store().await;
        let created = store
            .create("eeee000011112222", Path::new("/in/book"), STAGES, 2, false)
            .await
            .unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let updated = store
            .update(
                "eeee000011112222",
                serde_json::json!({"metadata": {"author": "Someone"}}),
            )
            .await
            .unwrap();

        assert_eq!(updated.metadata.author, "Someone");
        assert!(updated.updated_at >= created.updated_at);
    }

    #[tokio::test]
    async fn test_update_path_dotted() {
        let (_dir, store) = store().await;
        store
            .create("ffff000011112222", Path::new("/in/book"), STAGES, 2, false)
            .await
            .unwrap();

        store
            .update_path(
                "ffff000011112222",
                "stages.convert.output_path",
                Value::String("/work/out.m4b".into()),
            )
            .await
            .unwrap();

        let m = store.load("ffff000011112222").await.unwrap();
        assert_eq!(
            m.stage_value("convert", "output_path").unwrap(),
            "/work/out.m4b"
        );
    }

    #[tokio::test]
    async fn test_no_tmp_files_left_behind() {
        let (dir, store) = store().await;
        store
            .create("abab000011112222", Path::new("/in/book"), STAGES, 2, false)
            .await
            .unwrap();
        store
            .set_book_status("abab000011112222", RunStatus::Completed)
            .await
            .unwrap();

        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());

        let m = store.load("abab000011112222").await.unwrap();
        assert_eq!(m.status, RunStatus::Completed);
        assert!(m.completed_at.is_some());
    }

    #[test]
    fn test_deep_merge() {
        let mut doc = serde_json::json!({"a": {"b": 1, "c": 2}, "d": 3});
        deep_merge(&mut doc, &serde_json::json!({"a": {"c": 9}, "e": 4}));
        assert_eq!(doc, serde_json::json!({"a": {"b": 1, "c": 9}, "d": 3, "e": 4}));
    }
}
