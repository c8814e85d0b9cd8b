//! Hint extraction from embedded audio tags

use crate::audio::Prober;
use crate::models::HintSet;
use anyhow::Result;
use id3::TagLike;
use std::path::Path;

/// Read embedded tags from the first audio file into the hint shape.
///
/// MP3 and MP4 containers are read directly; other formats go through the
/// prober. Tag failures are never fatal here; a book without usable tags
/// simply contributes an empty hint set.
pub async fn extract_tag_hints(audio_file: &Path, prober: &Prober) -> Result<HintSet> {
    let ext = audio_file
        .extension()
        .and_then(|s| s.to_str())
        .map(|s| s.to_lowercase())
        .unwrap_or_default();

    let hints = match ext.as_str() {
        "mp3" => extract_id3(audio_file),
        "m4a" | "m4b" => extract_mp4(audio_file),
        _ => extract_via_prober(audio_file, prober).await,
    };

    Ok(hints.unwrap_or_else(|e| {
        tracing::debug!("No usable tags in {}: {}", audio_file.display(), e);
        HintSet::default()
    }))
}

fn extract_id3(file: &Path) -> Result<HintSet> {
    let tag = id3::Tag::read_from_path(file)?;

    Ok(HintSet {
        author: tag
            .album_artist()
            .or_else(|| tag.artist())
            .unwrap_or("")
            .to_string(),
        title: tag.album().or_else(|| tag.title()).unwrap_or("").to_string(),
        year: tag.year().map(|y| y.to_string()).unwrap_or_default(),
        ..Default::default()
    })
}

fn extract_mp4(file: &Path) -> Result<HintSet> {
    let tag = mp4ameta::Tag::read_from_path(file)?;

    Ok(HintSet {
        author: tag
            .album_artist()
            .or_else(|| tag.artist())
            .unwrap_or("")
            .to_string(),
        title: tag.album().or_else(|| tag.title()).unwrap_or("").to_string(),
        year: tag.year().unwrap_or("").to_string(),
        ..Default::default()
    })
}

async fn extract_via_prober(file: &Path, prober: &Prober) -> Result<HintSet> {
    let tags = prober.tags(file).await?;

    Ok(HintSet {
        author: tags
            .get("album_artist")
            .or_else(|| tags.get("artist"))
            .cloned()
            .unwrap_or_default(),
        title: tags
            .get("album")
            .or_else(|| tags.get("title"))
            .cloned()
            .unwrap_or_default(),
        year: tags
            .get("date")
            .map(|d| d.chars().take(4).collect())
            .unwrap_or_default(),
        ..Default::default()
    })
}
