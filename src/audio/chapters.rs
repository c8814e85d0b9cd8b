//! Chapter generation from source tracks

use anyhow::{Context, Result};
use std::path::Path;

/// One chapter with millisecond boundaries
#[derive(Debug, Clone, PartialEq)]
pub struct Chapter {
    pub title: String,
    pub start_ms: u64,
    pub end_ms: u64,
}

/// Build one chapter per source file by accumulating probed durations.
///
/// `files` and `durations` are parallel, already in playback order.
pub fn chapters_from_tracks(files: &[&Path], durations: &[f64]) -> Vec<Chapter> {
    let mut chapters = Vec::with_capacity(files.len());
    let mut cursor_ms = 0u64;

    for (i, (file, duration)) in files.iter().zip(durations.iter()).enumerate() {
        let length_ms = (duration * 1000.0).round() as u64;
        let title = chapter_title(file, i + 1);

        chapters.push(Chapter {
            title,
            start_ms: cursor_ms,
            end_ms: cursor_ms + length_ms,
        });
        cursor_ms += length_ms;
    }

    chapters
}

/// Chapter title from the file stem, falling back to a numbered chapter
fn chapter_title(file: &Path, number: usize) -> String {
    let stem = file
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("")
        .replace('_', " ")
        .trim()
        .to_string();

    // Bare track numbers ("01", "007") carry no information; name the
    // chapter by ordinal instead.
    if stem.is_empty() || stem.chars().all(|c| c.is_ascii_digit()) {
        format!("Chapter {}", number)
    } else {
        stem
    }
}

/// Write chapters as an ffmetadata document the encoder consumes
pub fn write_ffmetadata(chapters: &[Chapter], output: &Path) -> Result<()> {
    let mut content = String::from(";FFMETADATA1\n");

    for chapter in chapters {
        content.push_str("[CHAPTER]\n");
        content.push_str("TIMEBASE=1/1000\n");
        content.push_str(&format!("START={}\n", chapter.start_ms));
        content.push_str(&format!("END={}\n", chapter.end_ms));
        content.push_str(&format!("title={}\n", escape_metadata(&chapter.title)));
    }

    std::fs::write(output, content)
        .with_context(|| format!("Failed to write chapter file {}", output.display()))?;
    Ok(())
}

/// Escape the characters the ffmetadata format treats specially
fn escape_metadata(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '=' | ';' | '#' | '\\' | '\n' => {
                out.push('\\');
                out.push(c);
            }
            _ => out.push(c),
        }
    }
    out
}
