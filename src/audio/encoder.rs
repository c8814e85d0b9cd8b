//! External encoder invocation (ffmpeg)

use crate::error::PipelineError;
use crate::utils::subprocess;
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

/// Cover operations are quick; encodes are unbounded but cancellable.
const COVER_TIMEOUT: Duration = Duration::from_secs(30);

/// Encoder subprocess wrapper
#[derive(Clone)]
pub struct Encoder {
    encoder_path: PathBuf,
}

impl Encoder {
    /// Locate the encoder on PATH
    pub fn new() -> Result<Self> {
        let encoder_path = which::which("ffmpeg")
            .map_err(|_| PipelineError::Config("ffmpeg not found in PATH".to_string()))?;
        Ok(Self { encoder_path })
    }

    /// Use an explicit encoder binary
    pub fn with_path(encoder_path: PathBuf) -> Self {
        Self { encoder_path }
    }

    /// Concatenate and transcode a track list into one chaptered M4B.
    ///
    /// The encode has no timeout; cancellation terminates the subprocess at
    /// the caller's request.
    pub async fn encode_concat_to_m4b(
        &self,
        concat_file: &Path,
        chapters_file: Option<&Path>,
        output: &Path,
        bitrate_kbps: u32,
        cancel: CancellationToken,
    ) -> Result<()> {
        let mut cmd = Command::new(&self.encoder_path);
        cmd.args(["-y", "-f", "concat", "-safe", "0", "-i"])
            .arg(concat_file);

        if let Some(chapters) = chapters_file {
            cmd.arg("-i").arg(chapters).args(["-map_metadata", "1"]);
        }

        // Drop embedded cover-art video streams; the tagger attaches art.
        cmd.arg("-vn");
        cmd.args(["-c:a", "aac", "-b:a", &format!("{}k", bitrate_kbps)]);
        cmd.args(["-movflags", "+faststart", "-f", "mp4"]);
        cmd.arg(output);

        tracing::debug!("Encoder concat command: {:?}", cmd.as_std());
        tracing::info!(
            "Encoding {} → {} ({}kbps)",
            concat_file.display(),
            output.display(),
            bitrate_kbps
        );

        subprocess::expect_success(cmd, "ffmpeg", None, Some(cancel))
            .await
            .context("Encoder failed")?;
        Ok(())
    }

    /// Convert a single input file to a chaptered M4B
    pub async fn encode_single_to_m4b(
        &self,
        input: &Path,
        chapters_file: Option<&Path>,
        output: &Path,
        bitrate_kbps: u32,
        cancel: CancellationToken,
    ) -> Result<()> {
        let mut cmd = Command::new(&self.encoder_path);
        cmd.args(["-y", "-i"]).arg(input);

        if let Some(chapters) = chapters_file {
            cmd.arg("-i").arg(chapters).args(["-map_metadata", "1"]);
        }

        cmd.arg("-vn");
        cmd.args(["-c:a", "aac", "-b:a", &format!("{}k", bitrate_kbps)]);
        cmd.args(["-movflags", "+faststart", "-f", "mp4"]);
        cmd.arg(output);

        tracing::debug!("Encoder convert command: {:?}", cmd.as_std());

        subprocess::expect_success(cmd, "ffmpeg", None, Some(cancel))
            .await
            .context("Encoder failed")?;
        Ok(())
    }

    /// Extract embedded cover art to a JPEG; `Ok(false)` when none exists
    pub async fn extract_embedded_cover(&self, audio: &Path, output: &Path) -> Result<bool> {
        let mut cmd = Command::new(&self.encoder_path);
        cmd.args(["-y", "-i"])
            .arg(audio)
            .args(["-an", "-frames:v", "1"])
            .arg(output);

        let result = subprocess::run_tool(cmd, "ffmpeg", Some(COVER_TIMEOUT), None).await?;
        Ok(result.status.success() && output.exists())
    }

    /// Re-encode a cover image to JPEG, stripping codecs the tagger refuses
    pub async fn reencode_cover_jpeg(&self, input: &Path, output: &Path) -> Result<()> {
        let mut cmd = Command::new(&self.encoder_path);
        cmd.args(["-y", "-i"])
            .arg(input)
            .args(["-frames:v", "1"])
            .arg(output);

        subprocess::expect_success(cmd, "ffmpeg", Some(COVER_TIMEOUT), None)
            .await
            .context("Cover re-encode failed")?;
        Ok(())
    }

    /// Write the concat document with the escaping the encoder requires
    pub fn create_concat_file(files: &[&Path], output: &Path) -> Result<()> {
        let mut content = String::new();
        for file in files {
            if !file.exists() {
                anyhow::bail!("File not found: {}", file.display());
            }

            let abs_path = file
                .canonicalize()
                .with_context(|| format!("Failed to resolve path: {}", file.display()))?;

            // Concat format: single quotes around the path, embedded single
            // quotes escaped as '\''.
            let path_str = abs_path.to_string_lossy();
            let escaped = path_str.replace('\'', r"'\''");

            content.push_str(&format!("file '{}'\n", escaped));
        }

        std::fs::write(output, content).context("Failed to write concat file")?;
        Ok(())
    }
}
