//! Stage sequencing for one book
//!
//! Stages are an ordered list; a mode names the subset to run. The runner
//! honors the manifest: completed stages are skipped on rerun unless the
//! caller forced a fresh start, in which case the manifest was deleted
//! outright before any stage ran.

use crate::audio::{Encoder, Prober, Tagger};
use crate::core::library::LibraryIndex;
use crate::core::manifest_store::ManifestStore;
use crate::core::stages;
use crate::error::{self, PipelineError};
use crate::metadata::MetadataResolver;
use crate::models::{Config, RunStatus, SourceBook};
use anyhow::Result;
use futures::future::BoxFuture;
use lazy_static::lazy_static;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;

/// The pipeline's stages, in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Validate,
    Concat,
    Convert,
    Organize,
    Cleanup,
}

impl Stage {
    pub const ALL: [Stage; 5] = [
        Stage::Validate,
        Stage::Concat,
        Stage::Convert,
        Stage::Organize,
        Stage::Cleanup,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Stage::Validate => "validate",
            Stage::Concat => "concat",
            Stage::Convert => "convert",
            Stage::Organize => "organize",
            Stage::Cleanup => "cleanup",
        }
    }

    /// Names of every stage, for manifest initialization
    pub fn all_names() -> Vec<&'static str> {
        Stage::ALL.iter().map(|s| s.name()).collect()
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Named stage subsets selectable by the caller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineMode {
    /// Full pipeline: validate → concat → convert → organize → cleanup
    Convert,
    /// Reorganize existing books: organize only
    Organize,
}

impl PipelineMode {
    pub fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "convert" => Ok(PipelineMode::Convert),
            "organize" => Ok(PipelineMode::Organize),
            other => Err(PipelineError::Config(format!("unknown mode: {}", other)).into()),
        }
    }

    pub fn stages(&self) -> &'static [Stage] {
        match self {
            PipelineMode::Convert => &Stage::ALL,
            PipelineMode::Organize => &[Stage::Organize],
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            PipelineMode::Convert => "convert",
            PipelineMode::Organize => "organize",
        }
    }
}

/// Everything a stage runner sees for one book
pub struct StageContext {
    pub book: SourceBook,
    pub config: Arc<Config>,
    pub store: Arc<ManifestStore>,
    pub index: Arc<Mutex<LibraryIndex>>,
    pub prober: Prober,
    pub encoder: Encoder,
    pub tagger: Tagger,
    pub resolver: Arc<MetadataResolver>,
    pub cancel: CancellationToken,
    pub mode: PipelineMode,
    pub force: bool,
    pub dry_run: bool,
    /// Per-book scratch directory under the configured work dir
    pub work_dir: PathBuf,
    pub asin_override: Option<String>,
}

/// A stage runner: consumes the context, returns the completed payload
pub type StageFn = for<'a> fn(&'a StageContext) -> BoxFuture<'a, Result<Map<String, Value>>>;

fn validate_runner(ctx: &StageContext) -> BoxFuture<'_, Result<Map<String, Value>>> {
    Box::pin(stages::run_validate(ctx))
}

fn concat_runner(ctx: &StageContext) -> BoxFuture<'_, Result<Map<String, Value>>> {
    Box::pin(stages::run_concat(ctx))
}

fn convert_runner(ctx: &StageContext) -> BoxFuture<'_, Result<Map<String, Value>>> {
    Box::pin(stages::run_convert(ctx))
}

fn organize_runner(ctx: &StageContext) -> BoxFuture<'_, Result<Map<String, Value>>> {
    Box::pin(stages::run_organize(ctx))
}

fn cleanup_runner(ctx: &StageContext) -> BoxFuture<'_, Result<Map<String, Value>>> {
    Box::pin(stages::run_cleanup(ctx))
}

lazy_static! {
    /// Stage name → runner. Selecting a stage with no registration is an
    /// immediate error, never a silent skip.
    static ref REGISTRY: HashMap<Stage, StageFn> = {
        let mut map: HashMap<Stage, StageFn> = HashMap::new();
        map.insert(Stage::Validate, validate_runner as StageFn);
        map.insert(Stage::Concat, concat_runner as StageFn);
        map.insert(Stage::Convert, convert_runner as StageFn);
        map.insert(Stage::Organize, organize_runner as StageFn);
        map.insert(Stage::Cleanup, cleanup_runner as StageFn);
        map
    };
}

/// Look up a stage's runner
pub fn runner_for(stage: Stage) -> Result<StageFn> {
    REGISTRY
        .get(&stage)
        .copied()
        .ok_or_else(|| PipelineError::Config(format!("stage {} is not registered", stage)).into())
}

/// Run every stage of the context's mode for one book.
///
/// On failure the manifest keeps the failed stage and `last_error` so the
/// next batch resumes exactly where this one stopped.
pub async fn run_book(ctx: &StageContext) -> Result<()> {
    let hash = &ctx.book.book_hash;

    if !ctx.dry_run {
        if ctx.force {
            ctx.store.delete(hash).await?;
        }
        if !ctx.store.exists(hash) {
            ctx.store
                .create(
                    hash,
                    &ctx.book.source_dir,
                    &Stage::all_names(),
                    ctx.config.processing.max_retries,
                    false,
                )
                .await?;
        }
        ctx.store.set_book_status(hash, RunStatus::InProgress).await?;
    }

    for stage in ctx.mode.stages() {
        if ctx.cancel.is_cancelled() {
            return Err(PipelineError::Transient("batch cancelled".into()).into());
        }

        let runner = runner_for(*stage)?;
        let name = stage.name();

        if !ctx.dry_run {
            let manifest = ctx.store.load(hash).await?;
            if manifest.stage_status(name) == RunStatus::Completed {
                tracing::info!("[{}] {} already completed, skipping", &hash[..8], name);
                continue;
            }
            ctx.store
                .set_stage(hash, name, RunStatus::InProgress, None)
                .await?;
        }

        tracing::info!("[{}] {} running for {:?}", &hash[..8], name, ctx.book.dir_name());

        match runner(ctx).await {
            Ok(payload) => {
                if !ctx.dry_run {
                    ctx.store
                        .set_stage(hash, name, RunStatus::Completed, Some(payload))
                        .await?;
                }
            }
            Err(e) => {
                tracing::error!("[{}] {} failed: {:#}", &hash[..8], name, e);
                if !ctx.dry_run {
                    ctx.store
                        .set_stage(hash, name, RunStatus::Failed, None)
                        .await?;
                    ctx.store
                        .set_error(hash, error::kind_of(&e), &format!("{:#}", e), name)
                        .await?;
                    if error::classify(&e) != crate::error::ErrorCategory::Permanent {
                        ctx.store.increment_retry(hash).await?;
                    }
                    ctx.store.set_book_status(hash, RunStatus::Failed).await?;
                }
                return Err(e);
            }
        }
    }

    if !ctx.dry_run {
        ctx.store.set_book_status(hash, RunStatus::Completed).await?;
    }
    tracing::info!("[{}] completed: {:?}", &hash[..8], ctx.book.dir_name());
    Ok(())
}
