//! The stage implementations

use crate::audio::{chapters_from_tracks, prepare_cover, write_ffmetadata, Chapter, Encoder, TagRequest};
use crate::core::organize::{OrganizeEngine, PlanAction};
use crate::core::stage::{PipelineMode, StageContext};
use crate::error::PipelineError;
use crate::models::HintSet;
use crate::utils::{check_disk_space, sanitize_component, ComponentKind};
use anyhow::{Context, Result};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};

/// Output bitrate never exceeds the source and stays within spoken-word
/// bounds
const MAX_BITRATE_KBPS: u32 = 128;
const MIN_BITRATE_KBPS: u32 = 32;

/// Cover filenames recognized in a book folder, in preference order
const COVER_FILENAMES: &[&str] = &["cover.jpg", "folder.jpg", "cover.png", "folder.png"];

/// validate: confirm the source is readable audio and the host has room
pub async fn run_validate(ctx: &StageContext) -> Result<Map<String, Value>> {
    let book = &ctx.book;

    if book.audio_files.is_empty() {
        return Err(PipelineError::Input(format!(
            "no audio files under {}",
            book.source_dir.display()
        ))
        .into());
    }

    // Probe every file; zero-byte or corrupt audio fails here, before any
    // expensive work.
    let mut durations = Vec::with_capacity(book.audio_files.len());
    for file in &book.audio_files {
        let duration = ctx.prober.duration_seconds(file).await?;
        durations.push(duration);
    }
    let total_duration: f64 = durations.iter().sum();

    let source_bitrate = ctx.prober.bitrate_bps(&book.audio_files[0]).await?;

    let total_bytes = crate::utils::dir_size(&book.source_dir)?;
    let required = total_bytes.saturating_mul(ctx.config.processing.disk_space_multiple);
    check_disk_space(&ctx.config.work_dir(), required)?;

    let mut payload = Map::new();
    payload.insert("file_count".into(), Value::from(book.audio_files.len()));
    payload.insert("total_bytes".into(), Value::from(total_bytes));
    payload.insert("total_duration_s".into(), Value::from(total_duration));
    payload.insert("source_bitrate_bps".into(), Value::from(source_bitrate));
    payload.insert(
        "durations".into(),
        Value::Array(durations.into_iter().map(Value::from).collect()),
    );
    Ok(payload)
}

/// concat: lay down the encoder's input list in the scratch directory
pub async fn run_concat(ctx: &StageContext) -> Result<Map<String, Value>> {
    let book = &ctx.book;
    let mut payload = Map::new();
    payload.insert("file_count".into(), Value::from(book.audio_files.len()));

    if book.audio_files.len() == 1 {
        payload.insert("mode".into(), Value::from("single"));
        return Ok(payload);
    }

    let concat_path = ctx.work_dir.join("concat.txt");
    payload.insert("mode".into(), Value::from("concat"));
    payload.insert(
        "concat_path".into(),
        Value::from(concat_path.display().to_string()),
    );

    if ctx.dry_run {
        tracing::info!("[DRY RUN] Would write concat list {}", concat_path.display());
        return Ok(payload);
    }

    std::fs::create_dir_all(&ctx.work_dir)
        .with_context(|| format!("Failed to create {}", ctx.work_dir.display()))?;

    let refs: Vec<&Path> = book.audio_files.iter().map(|p| p.as_path()).collect();
    Encoder::create_concat_file(&refs, &concat_path)?;

    Ok(payload)
}

/// convert: one chaptered M4B in the scratch directory
pub async fn run_convert(ctx: &StageContext) -> Result<Map<String, Value>> {
    let book = &ctx.book;
    let mut payload = Map::new();

    // A source that is already a single M4B needs no encoding; organize
    // works straight from it.
    if book.is_single_m4b() {
        payload.insert(
            "output_path".into(),
            Value::from(book.audio_files[0].display().to_string()),
        );
        payload.insert("encoded".into(), Value::from(false));
        return Ok(payload);
    }

    let durations = stored_durations(ctx).await;
    let durations = match durations {
        Some(d) if d.len() == book.audio_files.len() => d,
        _ => {
            // Validate did not run in this mode or its payload is gone;
            // probe again.
            let mut fresh = Vec::with_capacity(book.audio_files.len());
            for file in &book.audio_files {
                fresh.push(ctx.prober.duration_seconds(file).await?);
            }
            fresh
        }
    };

    let source_bitrate = match stored_bitrate(ctx).await {
        Some(bps) => bps,
        None => ctx.prober.bitrate_bps(&book.audio_files[0]).await?,
    };
    let target_kbps =
        ((source_bitrate / 1000) as u32).clamp(MIN_BITRATE_KBPS, MAX_BITRATE_KBPS);
    payload.insert("target_bitrate_kbps".into(), Value::from(target_kbps));

    let chapters: Vec<Chapter> = if book.audio_files.len() > 1 {
        let refs: Vec<&Path> = book.audio_files.iter().map(|p| p.as_path()).collect();
        chapters_from_tracks(&refs, &durations)
    } else {
        Vec::new()
    };
    payload.insert("chapter_count".into(), Value::from(chapters.len()));

    let output = ctx
        .work_dir
        .join(format!("{}.m4b", sanitize_component(&book.dir_name(), ComponentKind::Folder)));
    payload.insert("output_path".into(), Value::from(output.display().to_string()));
    payload.insert("encoded".into(), Value::from(true));

    if ctx.dry_run {
        tracing::info!(
            "[DRY RUN] Would encode {} files at {}kbps -> {}",
            book.audio_files.len(),
            target_kbps,
            output.display()
        );
        return Ok(payload);
    }

    std::fs::create_dir_all(&ctx.work_dir)
        .with_context(|| format!("Failed to create {}", ctx.work_dir.display()))?;

    let chapters_file = if chapters.is_empty() {
        None
    } else {
        let path = ctx.work_dir.join("chapters.txt");
        write_ffmetadata(&chapters, &path)?;
        Some(path)
    };

    if book.audio_files.len() == 1 {
        ctx.encoder
            .encode_single_to_m4b(
                &book.audio_files[0],
                chapters_file.as_deref(),
                &output,
                target_kbps,
                ctx.cancel.clone(),
            )
            .await?;
    } else {
        let concat_path = ctx.work_dir.join("concat.txt");
        if !concat_path.exists() {
            let refs: Vec<&Path> = book.audio_files.iter().map(|p| p.as_path()).collect();
            Encoder::create_concat_file(&refs, &concat_path)?;
        }
        ctx.encoder
            .encode_concat_to_m4b(
                &concat_path,
                chapters_file.as_deref(),
                &output,
                target_kbps,
                ctx.cancel.clone(),
            )
            .await?;
    }

    // Probe the result back; a zero-length or chapterless output means the
    // encode silently failed.
    let out_duration = ctx.prober.duration_seconds(&output).await?;
    if out_duration <= 0.0 {
        return Err(PipelineError::ExternalTool {
            tool: "ffmpeg".into(),
            message: format!("produced empty output {}", output.display()),
        }
        .into());
    }
    if !chapters.is_empty() {
        let count = ctx.prober.chapter_count(&output).await?;
        if count != chapters.len() {
            tracing::warn!(
                "Expected {} chapters in {}, probe reports {}",
                chapters.len(),
                output.display(),
                count
            );
        }
    }
    payload.insert("duration_s".into(), Value::from(out_duration));

    Ok(payload)
}

/// organize: resolve identity, tag, and commit into the library
pub async fn run_organize(ctx: &StageContext) -> Result<Map<String, Value>> {
    let book = &ctx.book;
    let mut payload = Map::new();

    let outcome = ctx
        .resolver
        .resolve(book, &ctx.prober, ctx.asin_override.as_deref())
        .await?;

    let move_mode = ctx.mode == PipelineMode::Organize;
    let source_file = organize_source_file(ctx, move_mode).await?;

    let engine = OrganizeEngine::new(
        ctx.config.directories.library_root.clone(),
        ctx.index.clone(),
        ctx.config.organization.file_mode_bits(),
        ctx.config.organization.unknown_author.clone(),
        ctx.dry_run,
        ctx.force,
    );

    let plan = engine.plan(
        &book.source_dir,
        &outcome.identity,
        outcome.position_pad,
        move_mode,
    )?;
    payload.insert(
        "destination".into(),
        Value::from(plan.dest_path().display().to_string()),
    );
    payload.insert("action".into(), Value::from(action_name(plan.action)));

    // Tag the produced file before it enters the library. Books being
    // reorganized keep their existing tags.
    if plan.action == PlanAction::Copy && !ctx.dry_run {
        let cover = find_cover(ctx, &outcome).await;
        let request = tag_request(&outcome.identity, &outcome);
        ctx.tagger
            .write_tags(&source_file, &request, cover.as_deref())
            .await?;
    }

    let committed = engine.commit(&plan, &source_file, &book.source_dir)?;

    if !ctx.dry_run {
        let metadata_patch = serde_json::json!({
            "metadata": {
                "author": outcome.identity.author,
                "title": outcome.identity.title,
                "series": outcome.identity.series,
                "position": outcome.identity.position,
                "year": outcome.identity.year,
                "asin": outcome.identity.asin,
            }
        });
        ctx.store.update(&book.book_hash, metadata_patch).await?;
    }

    payload.insert("committed".into(), Value::from(committed.is_some()));
    Ok(payload)
}

/// cleanup: drop scratch space, archive the consumed source
pub async fn run_cleanup(ctx: &StageContext) -> Result<Map<String, Value>> {
    let mut payload = Map::new();

    if ctx.dry_run {
        tracing::info!("[DRY RUN] Would remove {}", ctx.work_dir.display());
        return Ok(payload);
    }

    if ctx.work_dir.exists() {
        if ctx.config.processing.keep_work_files {
            tracing::info!("Keeping work files at {}", ctx.work_dir.display());
        } else if let Err(e) = std::fs::remove_dir_all(&ctx.work_dir) {
            tracing::warn!("Failed to remove {}: {}", ctx.work_dir.display(), e);
        }
    }

    if let Some(archive_dir) = &ctx.config.archive.archive_dir {
        if ctx.mode == PipelineMode::Convert {
            let archived = archive_source(&ctx.book.source_dir, archive_dir)?;
            payload.insert("archived_to".into(), Value::from(archived.display().to_string()));
            prune_archive(archive_dir, ctx.config.archive.retention_days);
        }
    }

    Ok(payload)
}

fn action_name(action: PlanAction) -> &'static str {
    match action {
        PlanAction::Copy => "copy",
        PlanAction::Move => "move",
        PlanAction::SkipCorrectlyPlaced => "skip_correctly_placed",
    }
}

/// The file organize will place, depending on mode
async fn organize_source_file(ctx: &StageContext, move_mode: bool) -> Result<PathBuf> {
    if move_mode {
        if !ctx.book.is_single_m4b() {
            return Err(PipelineError::Input(format!(
                "organize mode requires a finished M4B, {} holds {} audio files",
                ctx.book.source_dir.display(),
                ctx.book.audio_files.len()
            ))
            .into());
        }
        return Ok(ctx.book.audio_files[0].clone());
    }

    // Convert mode: the convert stage recorded where it wrote the output.
    if !ctx.dry_run {
        let manifest = ctx.store.load(&ctx.book.book_hash).await?;
        if let Some(path) = manifest
            .stage_value("convert", "output_path")
            .and_then(|v| v.as_str())
        {
            return Ok(PathBuf::from(path));
        }
    }
    // Dry run predicts the same path convert would use.
    Ok(ctx
        .work_dir
        .join(format!("{}.m4b", sanitize_component(&ctx.book.dir_name(), ComponentKind::Folder))))
}

fn tag_request(identity: &HintSet, outcome: &crate::metadata::ResolutionOutcome) -> TagRequest {
    TagRequest {
        title: identity.title.clone(),
        author: identity.author.clone(),
        series: identity.series.clone(),
        position: identity.position.clone(),
        year: identity.year.clone(),
        asin: identity.asin.clone(),
        narrator: outcome
            .candidate
            .as_ref()
            .and_then(|c| c.narrators.first().cloned())
            .unwrap_or_default(),
        description: outcome
            .candidate
            .as_ref()
            .and_then(|c| c.publisher_summary.clone())
            .unwrap_or_default(),
    }
}

/// Cover art: folder file, then embedded art, then the catalog. Every
/// failure here is logged and dropped; a missing cover never fails a book.
async fn find_cover(
    ctx: &StageContext,
    outcome: &crate::metadata::ResolutionOutcome,
) -> Option<PathBuf> {
    for name in COVER_FILENAMES {
        let candidate = ctx.book.source_dir.join(name);
        if candidate.is_file() {
            return finish_cover(ctx, &candidate).await;
        }
    }

    let extracted = ctx.work_dir.join("embedded_cover.jpg");
    match ctx
        .encoder
        .extract_embedded_cover(&ctx.book.audio_files[0], &extracted)
        .await
    {
        Ok(true) => return finish_cover(ctx, &extracted).await,
        Ok(false) => {}
        Err(e) => tracing::warn!("Embedded cover extraction failed: {}", e),
    }

    if ctx.config.catalog.download_covers {
        if let Some(url) = outcome.candidate.as_ref().and_then(|c| c.cover_url.as_deref()) {
            let downloaded = ctx.work_dir.join("catalog_cover.jpg");
            match ctx.resolver.download_cover(url, &downloaded).await {
                Ok(()) => return finish_cover(ctx, &downloaded).await,
                Err(e) => tracing::warn!("Cover download failed: {}", e),
            }
        }
    }

    None
}

async fn finish_cover(ctx: &StageContext, cover: &Path) -> Option<PathBuf> {
    match prepare_cover(&ctx.encoder, cover, &ctx.work_dir).await {
        Ok(prepared) => Some(prepared),
        Err(e) => {
            tracing::warn!("Cover preparation failed for {}: {}", cover.display(), e);
            None
        }
    }
}

async fn stored_durations(ctx: &StageContext) -> Option<Vec<f64>> {
    if ctx.dry_run {
        return None;
    }
    let manifest = ctx.store.load(&ctx.book.book_hash).await.ok()?;
    let values = manifest.stage_value("validate", "durations")?.as_array()?;
    values.iter().map(|v| v.as_f64()).collect()
}

async fn stored_bitrate(ctx: &StageContext) -> Option<u64> {
    if ctx.dry_run {
        return None;
    }
    let manifest = ctx.store.load(&ctx.book.book_hash).await.ok()?;
    manifest
        .stage_value("validate", "source_bitrate_bps")?
        .as_u64()
}

/// Move a consumed source under the archive directory
fn archive_source(source_dir: &Path, archive_dir: &Path) -> Result<PathBuf> {
    std::fs::create_dir_all(archive_dir)
        .with_context(|| format!("Failed to create {}", archive_dir.display()))?;

    let name = source_dir
        .file_name()
        .context("source has no directory name")?;
    let mut dest = archive_dir.join(name);

    // Keep distinct sources with the same name apart.
    let mut counter = 2;
    while dest.exists() {
        dest = archive_dir.join(format!("{}_{}", name.to_string_lossy(), counter));
        counter += 1;
    }

    std::fs::rename(source_dir, &dest).with_context(|| {
        format!(
            "Failed to archive {} to {}",
            source_dir.display(),
            dest.display()
        )
    })?;
    tracing::info!("Archived source to {}", dest.display());
    Ok(dest)
}

/// Delete archive entries past their retention window
fn prune_archive(archive_dir: &Path, retention_days: u64) {
    let cutoff = std::time::SystemTime::now()
        - std::time::Duration::from_secs(retention_days * 24 * 3600);

    let Ok(entries) = std::fs::read_dir(archive_dir) else {
        return;
    };
    for entry in entries.flatten() {
        let Ok(metadata) = entry.metadata() else {
            continue;
        };
        let Ok(modified) = metadata.modified() else {
            continue;
        };
        if modified < cutoff {
            let path = entry.path();
            tracing::info!("Pruning expired archive entry {}", path.display());
            let result = if metadata.is_dir() {
                std::fs::remove_dir_all(&path)
            } else {
                std::fs::remove_file(&path)
            };
            if let Err(e) = result {
                tracing::warn!("Failed to prune {}: {}", path.display(), e);
            }
        }
    }
}
