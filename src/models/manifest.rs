//! Per-book manifest document

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Status of a book or of a single stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Pending => "pending",
            RunStatus::InProgress => "in_progress",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One stage's persisted state: its status plus a free-form payload
/// (file counts, paths, timestamps, target bitrate, ...)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageState {
    pub status: RunStatus,
    #[serde(flatten)]
    pub payload: Map<String, Value>,
}

impl StageState {
    pub fn pending() -> Self {
        Self {
            status: RunStatus::Pending,
            payload: Map::new(),
        }
    }
}

/// Resolved book identity; empty string means unresolved
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResolvedMetadata {
    #[serde(default)]
    pub author: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub series: String,
    #[serde(default)]
    pub position: String,
    #[serde(default)]
    pub year: String,
    #[serde(default)]
    pub asin: String,
}

/// Last failure recorded for a book
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LastError {
    pub category: String,
    pub message: String,
    pub stage: String,
}

/// The persisted per-book state document.
///
/// Unknown fields survive a load/store round-trip via the flattened map, so
/// newer writers do not lose data to older readers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    pub book_hash: String,
    pub source_path: PathBuf,
    pub status: RunStatus,
    #[serde(default)]
    pub stages: BTreeMap<String, StageState>,
    #[serde(default)]
    pub metadata: ResolvedMetadata,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default)]
    pub max_retries: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<LastError>,
    pub created_at: String,
    pub updated_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Manifest {
    /// Fresh manifest with every named stage at `pending`
    pub fn new(
        book_hash: &str,
        source_path: &std::path::Path,
        stage_names: &[&str],
        max_retries: u32,
    ) -> Self {
        let now = chrono::Utc::now().to_rfc3339();
        let stages = stage_names
            .iter()
            .map(|name| (name.to_string(), StageState::pending()))
            .collect();

        Self {
            book_hash: book_hash.to_string(),
            source_path: source_path.to_path_buf(),
            status: RunStatus::Pending,
            stages,
            metadata: ResolvedMetadata::default(),
            retry_count: 0,
            max_retries,
            last_error: None,
            created_at: now.clone(),
            updated_at: now,
            completed_at: None,
            extra: Map::new(),
        }
    }

    /// Status of a stage, `pending` when the stage is not yet recorded
    pub fn stage_status(&self, stage: &str) -> RunStatus {
        self.stages
            .get(stage)
            .map(|s| s.status)
            .unwrap_or(RunStatus::Pending)
    }

    /// A stage's payload value, if recorded
    pub fn stage_value(&self, stage: &str, key: &str) -> Option<&Value> {
        self.stages.get(stage).and_then(|s| s.payload.get(key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    #[test]
    fn test_new_manifest_all_pending() {
        let m = Manifest::new("deadbeef00112233", Path::new("/in/book"), &["validate", "convert"], 2);
        assert_eq!(m.status, RunStatus::Pending);
        assert_eq!(m.stage_status("validate"), RunStatus::Pending);
        assert_eq!(m.stage_status("convert"), RunStatus::Pending);
        assert_eq!(m.stage_status("never-registered"), RunStatus::Pending);
        assert_eq!(m.retry_count, 0);
        assert_eq!(m.max_retries, 2);
    }

    #[test]
    fn test_unknown_fields_roundtrip() {
        let json = r#"{
            "book_hash": "deadbeef00112233",
            "source_path": "/in/book",
            "status": "pending",
            "created_at": "2026-01-01T00:00:00Z",
            "updated_at": "2026-01-01T00:00:00Z",
            "some_future_field": {"nested": true}
        }"#;

        let m: Manifest = serde_json::from_str(json).unwrap();
        assert!(m.extra.contains_key("some_future_field"));

        let out = serde_json::to_string(&m).unwrap();
        assert!(out.contains("some_future_field"));
    }

    #[test]
    fn test_status_serialization() {
        assert_eq!(
            serde_json::to_string(&RunStatus::InProgress).unwrap(),
            "\"in_progress\""
        );
        let status: RunStatus = serde_json::from_str("\"completed\"").unwrap();
        assert_eq!(status, RunStatus::Completed);
    }

    #[test]
    fn test_stage_payload_flatten() {
        let json = r#"{"status": "completed", "file_count": 14, "target_bitrate": "128k"}"#;
        let stage: StageState = serde_json::from_str(json).unwrap();
        assert_eq!(stage.status, RunStatus::Completed);
        assert_eq!(stage.payload.get("file_count").unwrap(), 14);
    }
}
