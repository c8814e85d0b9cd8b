//! External tagger invocation (AtomicParsley)

use crate::audio::Encoder;
use crate::utils::subprocess;
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::process::Command;

/// Tag fields the pipeline writes into a finished M4B
#[derive(Debug, Clone, Default)]
pub struct TagRequest {
    pub title: String,
    pub author: String,
    pub series: String,
    pub position: String,
    pub year: String,
    pub asin: String,
    pub narrator: String,
    pub description: String,
}

impl TagRequest {
    /// Flatten to the key/value pairs handed to the tagger
    pub fn pairs(&self) -> Vec<(&'static str, String)> {
        let mut pairs = Vec::new();
        if !self.title.is_empty() {
            pairs.push(("--title", self.title.clone()));
            // Plex and most audiobook players read the album as the book.
            pairs.push(("--album", self.title.clone()));
        }
        if !self.author.is_empty() {
            pairs.push(("--artist", self.author.clone()));
            pairs.push(("--albumArtist", self.author.clone()));
        }
        if !self.series.is_empty() {
            let group = if self.position.is_empty() {
                self.series.clone()
            } else {
                format!("{} #{}", self.series, self.position)
            };
            pairs.push(("--grouping", group));
        }
        if !self.year.is_empty() {
            pairs.push(("--year", self.year.clone()));
        }
        if !self.narrator.is_empty() {
            // Narrator as composer is the audiobook convention.
            pairs.push(("--composer", self.narrator.clone()));
        }
        if !self.description.is_empty() {
            let truncated = if self.description.len() > 4000 {
                let mut end = 4000;
                while !self.description.is_char_boundary(end) {
                    end -= 1;
                }
                format!("{}...", &self.description[..end])
            } else {
                self.description.clone()
            };
            pairs.push(("--longdesc", truncated));
        }
        pairs.push(("--stik", "Audiobook".to_string()));
        pairs
    }
}

/// Tagger subprocess wrapper
#[derive(Clone)]
pub struct Tagger {
    tagger_path: PathBuf,
    timeout: Duration,
}

impl Tagger {
    /// Locate the tagger on PATH
    pub fn new(timeout_s: u64) -> Result<Self> {
        let tagger_path = which::which("AtomicParsley").map_err(|_| {
            crate::error::PipelineError::Config("AtomicParsley not found in PATH".to_string())
        })?;
        Ok(Self {
            tagger_path,
            timeout: Duration::from_secs(timeout_s),
        })
    }

    /// Use an explicit tagger binary
    pub fn with_path(tagger_path: PathBuf, timeout_s: u64) -> Self {
        Self {
            tagger_path,
            timeout: Duration::from_secs(timeout_s),
        }
    }

    /// Write tags (and optionally cover art) into the M4B in place
    pub async fn write_tags(
        &self,
        file: &Path,
        request: &TagRequest,
        cover: Option<&Path>,
    ) -> Result<()> {
        let mut cmd = Command::new(&self.tagger_path);
        cmd.arg(file);

        for (flag, value) in request.pairs() {
            cmd.arg(flag).arg(value);
        }

        if !request.asin.is_empty() {
            cmd.args([
                "--rDNSatom",
                &request.asin,
                "name=asin",
                "domain=com.audible",
            ]);
        }

        if let Some(cover) = cover {
            cmd.args(["--artwork", &cover.display().to_string()]);
        }

        cmd.arg("--overWrite");

        tracing::info!("Tagging {}", file.display());
        subprocess::expect_success(cmd, "AtomicParsley", Some(self.timeout), None)
            .await
            .context("Tagger failed")?;
        Ok(())
    }
}

/// Image formats the tagger accepts as-is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CoverFormat {
    Jpeg,
    Png,
    Other,
}

fn sniff_cover(path: &Path) -> Result<CoverFormat> {
    let bytes = std::fs::read(path)
        .with_context(|| format!("Failed to read cover {}", path.display()))?;

    Ok(if bytes.starts_with(&[0xFF, 0xD8, 0xFF]) {
        CoverFormat::Jpeg
    } else if bytes.starts_with(&[0x89, b'P', b'N', b'G']) {
        CoverFormat::Png
    } else {
        CoverFormat::Other
    })
}

/// Make a cover safe for the tagger.
///
/// JPEG and PNG pass through untouched; anything else (webp covers from
/// some catalogs, truncated downloads) is stripped and re-encoded to JPEG
/// in the work directory. Returns the path to hand the tagger.
pub async fn prepare_cover(
    encoder: &Encoder,
    cover: &Path,
    work_dir: &Path,
) -> Result<PathBuf> {
    match sniff_cover(cover)? {
        CoverFormat::Jpeg | CoverFormat::Png => Ok(cover.to_path_buf()),
        CoverFormat::Other => {
            let reencoded = work_dir.join("cover.jpg");
            tracing::info!(
                "Cover {} uses an unsupported codec; re-encoding to JPEG",
                cover.display()
            );
            encoder.reencode_cover_jpeg(cover, &reencoded).await?;
            Ok(reencoded)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn test_tag_pairs() {
        let request = TagRequest {
            title: "The Final Empire".to_string(),
            author: "Brandon Sanderson".to_string(),
            series: "Mistborn".to_string(),
            position: "1".to_string(),
            year: "2006".to_string(),
            ..Default::default()
        };

        let pairs = request.pairs();
        assert!(pairs.contains(&("--title", "The Final Empire".to_string())));
        assert!(pairs.contains(&("--albumArtist", "Brandon Sanderson".to_string())));
        assert!(pairs.contains(&("--grouping", "Mistborn #1".to_string())));
        assert!(pairs.contains(&("--stik", "Audiobook".to_string())));
    }

    #[test]
    fn test_empty_fields_omitted() {
        let request = TagRequest::default();
        let pairs = request.pairs();
        assert!(!pairs.iter().any(|(flag, _)| *flag == "--title"));
        assert!(!pairs.iter().any(|(flag, _)| *flag == "--year"));
    }

    #[test]
    fn test_sniff_cover_formats() {
        let dir = tempdir().unwrap();

        let jpeg = dir.path().join("a.jpg");
        fs::write(&jpeg, [0xFF, 0xD8, 0xFF, 0xE0, 0x00]).unwrap();
        assert_eq!(sniff_cover(&jpeg).unwrap(), CoverFormat::Jpeg);

        let png = dir.path().join("a.png");
        fs::write(&png, [0x89, b'P', b'N', b'G', 0x0D]).unwrap();
        assert_eq!(sniff_cover(&png).unwrap(), CoverFormat::Png);

        let webp = dir.path().join("a.webp");
        fs::write(&webp, b"RIFF....WEBP").unwrap();
        assert_eq!(sniff_cover(&webp).unwrap(), CoverFormat::Other);
    }
}
