//! Typed wrapper over the external audio inspector (ffprobe)

use crate::error::PipelineError;
use crate::utils::subprocess;
use anyhow::{Context, Result};
use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::process::Command;

const PROBE_TIMEOUT: Duration = Duration::from_secs(60);

/// Audio inspection client.
///
/// Every query spawns the prober and reads its stdout as the declared type.
/// A missing binary, a non-zero exit, or empty stdout is a hard error;
/// corrupt inputs must abort the pipeline rather than produce silent zeros.
/// Only `tags` degrades (to an empty map) on parse failure.
#[derive(Clone)]
pub struct Prober {
    prober_path: PathBuf,
}

impl Prober {
    /// Locate the prober on PATH
    pub fn new() -> Result<Self> {
        let prober_path = which::which("ffprobe")
            .map_err(|_| PipelineError::Config("ffprobe not found in PATH".to_string()))?;
        Ok(Self { prober_path })
    }

    /// Use an explicit prober binary
    pub fn with_path(prober_path: PathBuf) -> Self {
        Self { prober_path }
    }

    /// Duration of the file in seconds
    pub async fn duration_seconds(&self, file: &Path) -> Result<f64> {
        let out = self
            .query_entry(file, "format=duration")
            .await
            .with_context(|| format!("Failed to probe duration of {}", file.display()))?;
        out.parse::<f64>()
            .map_err(|_| PipelineError::Input(format!("unparseable duration for {}: {:?}", file.display(), out)).into())
    }

    /// Audio bitrate in bits per second
    pub async fn bitrate_bps(&self, file: &Path) -> Result<u64> {
        let out = self
            .query_entry(file, "format=bit_rate")
            .await
            .with_context(|| format!("Failed to probe bitrate of {}", file.display()))?;
        out.parse::<u64>()
            .map_err(|_| PipelineError::Input(format!("unparseable bitrate for {}: {:?}", file.display(), out)).into())
    }

    /// Channel count of the first audio stream
    pub async fn channel_count(&self, file: &Path) -> Result<u8> {
        let output = self
            .run(&[
                "-v", "error",
                "-select_streams", "a:0",
                "-show_entries", "stream=channels",
                "-of", "default=noprint_wrappers=1:nokey=1",
            ], file)
            .await?;
        output
            .trim()
            .parse::<u8>()
            .map_err(|_| PipelineError::Input(format!("unparseable channel count for {}", file.display())).into())
    }

    /// Container format name (e.g. `mp3`, `mov,mp4,m4a,3gp,3g2,mj2`)
    pub async fn format_name(&self, file: &Path) -> Result<String> {
        let out = self.query_entry(file, "format=format_name").await?;
        Ok(out)
    }

    /// Embedded tags as a lowercase-keyed map; empty on parse failure
    pub async fn tags(&self, file: &Path) -> Result<HashMap<String, String>> {
        let output = self
            .run(&["-v", "error", "-show_entries", "format_tags", "-of", "json"], file)
            .await?;

        let json: Value = match serde_json::from_str(&output) {
            Ok(json) => json,
            Err(e) => {
                tracing::warn!("Unparseable tag output for {}: {}", file.display(), e);
                return Ok(HashMap::new());
            }
        };

        let mut tags = HashMap::new();
        if let Some(map) = json["format"]["tags"].as_object() {
            for (key, value) in map {
                if let Some(value) = value.as_str() {
                    tags.insert(key.to_lowercase(), value.to_string());
                }
            }
        }
        Ok(tags)
    }

    /// Number of chapters in the container
    pub async fn chapter_count(&self, file: &Path) -> Result<usize> {
        let output = self
            .run(&["-v", "error", "-show_chapters", "-of", "json"], file)
            .await?;

        let json: Value = serde_json::from_str(&output)
            .map_err(|e| PipelineError::Input(format!("unparseable chapter output for {}: {}", file.display(), e)))?;

        Ok(json["chapters"].as_array().map(|a| a.len()).unwrap_or(0))
    }

    /// Single format-entry query with the compact output writer
    async fn query_entry(&self, file: &Path, entry: &str) -> Result<String> {
        self.run(&[
            "-v", "error",
            "-show_entries", entry,
            "-of", "default=noprint_wrappers=1:nokey=1",
        ], file)
        .await
    }

    async fn run(&self, args: &[&str], file: &Path) -> Result<String> {
        let mut cmd = Command::new(&self.prober_path);
        cmd.args(args).arg(file);

        let output = subprocess::expect_success(cmd, "ffprobe", Some(PROBE_TIMEOUT), None).await?;
        let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();

        if stdout.is_empty() {
            return Err(PipelineError::ExternalTool {
                tool: "ffprobe".to_string(),
                message: format!("empty output for {}", file.display()),
            }
            .into());
        }
        Ok(stdout)
    }
}
