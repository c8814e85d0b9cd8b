//! Batch orchestration: walk, dedup, schedule, throttle, summarize

use crate::audio::{Encoder, Prober, Tagger};
use crate::core::library::LibraryIndex;
use crate::core::manifest_store::ManifestStore;
use crate::core::retry::{retry_transient, RetryConfig};
use crate::core::stage::{run_book, PipelineMode, StageContext};
use crate::error;
use crate::metadata::MetadataResolver;
use crate::models::{Config, SourceBook};
use crate::utils::sanitize::is_audio_path;
use crate::utils::{LoadMonitor, LockAttempt, ProcessLock};
use anyhow::{Context, Result};
use indicatif::{ProgressBar, ProgressStyle};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;

/// Outcome of one book in a batch
#[derive(Debug, Clone)]
pub struct BookResult {
    pub name: String,
    pub book_hash: String,
    pub success: bool,
    pub exit_code: i32,
    pub message: Option<String>,
    pub elapsed_s: f64,
}

/// Outcome of a whole batch
#[derive(Debug, Default)]
pub struct BatchReport {
    pub results: Vec<BookResult>,
    /// Another batch held the lock; treated as success by callers
    pub contended: bool,
}

impl BatchReport {
    pub fn succeeded(&self) -> usize {
        self.results.iter().filter(|r| r.success).count()
    }

    pub fn failed(&self) -> usize {
        self.results.len() - self.succeeded()
    }

    /// Process exit code: worst category observed wins
    /// (permanent > transient > success); contention and empty batches
    /// are success.
    pub fn exit_code(&self) -> i32 {
        if self.contended || self.results.is_empty() {
            return 0;
        }
        let codes: Vec<i32> = self
            .results
            .iter()
            .filter(|r| !r.success)
            .map(|r| r.exit_code)
            .collect();
        if codes.contains(&2) {
            2
        } else if codes.contains(&3) {
            3
        } else if !codes.is_empty() {
            1
        } else {
            0
        }
    }
}

/// Walk one input root and collect book directories.
///
/// A directory is a book root as soon as it directly contains an audio
/// file; descent stops there so disc subfolders never become separate
/// books. Symlinks are not followed; hidden directories are skipped. One
/// pass, no per-directory re-walks.
pub fn collect_book_dirs(root: &Path) -> Result<Vec<PathBuf>> {
    let mut books = Vec::new();
    let mut stack = vec![root.to_path_buf()];

    while let Some(dir) = stack.pop() {
        let entries = std::fs::read_dir(&dir)
            .with_context(|| format!("Failed to read {}", dir.display()))?;

        let mut subdirs = Vec::new();
        let mut has_audio = false;

        for entry in entries {
            let entry = entry.context("Failed to read directory entry")?;
            let file_type = entry.file_type().context("Failed to stat entry")?;
            let name = entry.file_name().to_string_lossy().to_string();

            if name.starts_with('.') || file_type.is_symlink() {
                continue;
            }

            if file_type.is_file() && is_audio_path(&entry.path()) {
                has_audio = true;
            } else if file_type.is_dir() {
                subdirs.push(entry.path());
            }
        }

        if has_audio {
            books.push(dir);
        } else {
            stack.extend(subdirs);
        }
    }

    Ok(books)
}

/// The batch orchestrator. Owns the shared state (library index, manifest
/// store) for one run and drives the worker pool.
pub struct BatchOrchestrator {
    config: Arc<Config>,
    cancel: CancellationToken,
}

impl BatchOrchestrator {
    pub fn new(config: Config, cancel: CancellationToken) -> Self {
        Self {
            config: Arc::new(config),
            cancel,
        }
    }

    /// Run the batch over the given source paths (directories or bare
    /// audio files).
    pub async fn run(
        &self,
        source_paths: &[PathBuf],
        mode: PipelineMode,
        asin_override: Option<String>,
    ) -> Result<BatchReport> {
        // One batch per host; a second caller exits cleanly.
        let lock_path = self.config.lock_path();
        let _lock = match ProcessLock::acquire(&lock_path)? {
            LockAttempt::Acquired(lock) => lock,
            LockAttempt::Contended => {
                return Ok(BatchReport {
                    contended: true,
                    ..Default::default()
                });
            }
        };

        let books = self.discover(source_paths, mode)?;
        if books.is_empty() {
            // Explicitly named sources with no audio are bad input; an
            // empty configured root is an ordinary no-op.
            if !source_paths.is_empty() {
                return Err(crate::error::PipelineError::Input(
                    "no audio files under the given source paths".to_string(),
                )
                .into());
            }
            tracing::info!("Nothing to do");
            return Ok(BatchReport::default());
        }

        let total = books.len();
        tracing::info!(
            "Batch: {} book(s), {} worker(s), mode {}",
            total,
            self.config.effective_parallel(),
            mode.name()
        );

        // Shared state, one owner each, built once per batch.
        let store = Arc::new(ManifestStore::new(&self.config.manifest_dir())?);
        let index = Arc::new(Mutex::new(LibraryIndex::build(
            &self.config.directories.library_root,
        )?));
        let prober = match &self.config.advanced.prober_path {
            Some(path) => Prober::with_path(path.clone()),
            None => Prober::new()?,
        };
        let encoder = match &self.config.advanced.encoder_path {
            Some(path) => Encoder::with_path(path.clone()),
            None => Encoder::new()?,
        };
        let tagger = match &self.config.advanced.tagger_path {
            Some(path) => Tagger::with_path(path.clone(), self.config.advanced.tagger_timeout_s),
            None => Tagger::new(self.config.advanced.tagger_timeout_s)?,
        };
        let resolver = Arc::new(MetadataResolver::from_config(&self.config)?);
        let load = Arc::new(LoadMonitor::new());

        let semaphore = Arc::new(Semaphore::new(self.config.effective_parallel()));
        let (result_tx, mut result_rx) = mpsc::channel(total);

        let progress = ProgressBar::new(total as u64);
        progress.set_style(
            ProgressStyle::with_template("{spinner} [{bar:40}] {pos}/{len} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_bar()),
        );

        let mut handles = Vec::new();
        for book in books {
            if self.cancel.is_cancelled() {
                tracing::warn!("Cancelled; not dispatching remaining books");
                break;
            }

            let config = Arc::clone(&self.config);
            let store = Arc::clone(&store);
            let index = Arc::clone(&index);
            let resolver = Arc::clone(&resolver);
            let load = Arc::clone(&load);
            let semaphore = Arc::clone(&semaphore);
            let cancel = self.cancel.clone();
            let result_tx = result_tx.clone();
            let prober = prober.clone();
            let encoder = encoder.clone();
            let tagger = tagger.clone();
            let asin_override = asin_override.clone();

            let handle = tokio::spawn(async move {
                let Ok(_permit) = semaphore.acquire().await else {
                    return;
                };

                // Host-load throttle: hold the slot but do not start new
                // work while the machine is saturated.
                let ceiling = config.concurrency.cpu_ceiling;
                let sleep = Duration::from_secs(config.concurrency.throttle_sleep_s.max(1));
                while load.is_overloaded(ceiling) && !cancel.is_cancelled() {
                    tracing::info!(
                        "Host load above ceiling {:.2}; sleeping {:?}",
                        ceiling,
                        sleep
                    );
                    tokio::time::sleep(sleep).await;
                }
                if cancel.is_cancelled() {
                    return;
                }

                let started = Instant::now();
                let name = book.dir_name();
                let book_hash = book.book_hash.clone();

                let ctx = StageContext {
                    work_dir: config.work_dir().join(&book.book_hash),
                    book,
                    config: Arc::clone(&config),
                    store,
                    index,
                    prober,
                    encoder,
                    tagger,
                    resolver,
                    cancel,
                    mode,
                    force: config.processing.force,
                    dry_run: config.processing.dry_run,
                    asin_override,
                };

                let retry = RetryConfig::new(
                    config.processing.max_retries,
                    Duration::from_secs(config.processing.retry_delay_s),
                );
                let outcome = retry_transient(&retry, || run_book(&ctx)).await;

                let elapsed_s = started.elapsed().as_secs_f64();
                let result = match outcome {
                    Ok(()) => BookResult {
                        name,
                        book_hash,
                        success: true,
                        exit_code: 0,
                        message: None,
                        elapsed_s,
                    },
                    Err(e) => BookResult {
                        name,
                        book_hash,
                        success: false,
                        exit_code: error::exit_code_of(&e),
                        message: Some(format!("{:#}", e)),
                        elapsed_s,
                    },
                };
                let _ = result_tx.send(result).await;
            });
            handles.push(handle);
        }
        drop(result_tx);

        let mut results = Vec::new();
        while let Some(result) = result_rx.recv().await {
            progress.inc(1);
            if result.success {
                progress.set_message(format!("✓ {}", result.name));
            } else {
                progress.set_message(format!("✗ {}", result.name));
            }
            results.push(result);
        }
        progress.finish_and_clear();

        for handle in handles {
            let _ = handle.await;
        }

        tracing::info!(
            "Batch complete: {}/{} succeeded",
            results.iter().filter(|r| r.success).count(),
            results.len()
        );

        Ok(BatchReport {
            results,
            contended: false,
        })
    }

    /// Discover and dedup books across all source paths
    fn discover(&self, source_paths: &[PathBuf], mode: PipelineMode) -> Result<Vec<SourceBook>> {
        let mut roots: Vec<PathBuf> = source_paths.to_vec();
        if roots.is_empty() {
            roots = self.config.directories.source_roots.clone();
        }
        if roots.is_empty() && mode == PipelineMode::Organize {
            // Reorganize defaults to the library itself.
            roots.push(self.config.directories.library_root.clone());
        }

        let mut seen = HashSet::new();
        let mut books = Vec::new();

        for root in &roots {
            if root.is_file() {
                match SourceBook::from_file(root) {
                    Ok(book) => {
                        if seen.insert(book.book_hash.clone()) {
                            books.push(book);
                        }
                    }
                    Err(e) => tracing::warn!("Skipping {}: {}", root.display(), e),
                }
                continue;
            }

            if !root.is_dir() {
                tracing::warn!("Source does not exist: {}", root.display());
                continue;
            }

            for book_dir in collect_book_dirs(root)? {
                match SourceBook::discover(&book_dir) {
                    Ok(book) => {
                        if seen.insert(book.book_hash.clone()) {
                            books.push(book);
                        } else {
                            tracing::debug!(
                                "Duplicate book {} at {}",
                                book.book_hash,
                                book_dir.display()
                            );
                        }
                    }
                    Err(e) => tracing::warn!("Skipping {}: {}", book_dir.display(), e),
                }
            }
        }

        Ok(books)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn test_collect_book_dirs_stops_at_audio() {
        let dir = tempdir().unwrap();

        // A book with a disc subfolder: one book, not two.
        let book = dir.path().join("Author - Book");
        fs::create_dir_all(book.join("CD1")).unwrap();
        fs::write(book.join("intro.mp3"), b"x").unwrap();
        fs::write(book.join("CD1/01.mp3"), b"x").unwrap();

        // A deeper book with no audio in intermediate folders.
        let nested = dir.path().join("By Author/Another Book");
        fs::create_dir_all(&nested).unwrap();
        fs::write(nested.join("01.mp3"), b"x").unwrap();

        // Noise that must not be collected.
        fs::create_dir(dir.path().join(".hidden")).unwrap();
        fs::create_dir(dir.path().join("empty")).unwrap();

        let mut books = collect_book_dirs(dir.path()).unwrap();
        books.sort();
        assert_eq!(books.len(), 2);
        assert!(books.contains(&book));
        assert!(books.contains(&nested));
    }

    #[test]
    fn test_collect_book_dirs_root_is_book() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("01.mp3"), b"x").unwrap();
        fs::create_dir(dir.path().join("sub")).unwrap();
        fs::write(dir.path().join("sub/02.mp3"), b"x").unwrap();

        // Audio directly in the root: the root is the book, descent stops.
        let books = collect_book_dirs(dir.path()).unwrap();
        assert_eq!(books, vec![dir.path().to_path_buf()]);
    }

    #[test]
    fn test_report_exit_codes() {
        let ok = BookResult {
            name: "a".into(),
            book_hash: "h1".into(),
            success: true,
            exit_code: 0,
            message: None,
            elapsed_s: 1.0,
        };
        let transient = BookResult {
            exit_code: 1,
            success: false,
            name: "b".into(),
            book_hash: "h2".into(),
            message: Some("timeout".into()),
            elapsed_s: 1.0,
        };
        let permanent = BookResult {
            exit_code: 3,
            success: false,
            name: "c".into(),
            book_hash: "h3".into(),
            message: Some("corrupt".into()),
            elapsed_s: 1.0,
        };

        let report = BatchReport {
            results: vec![ok.clone()],
            contended: false,
        };
        assert_eq!(report.exit_code(), 0);

        let report = BatchReport {
            results: vec![ok.clone(), transient.clone()],
            contended: false,
        };
        assert_eq!(report.exit_code(), 1);

        // Permanent outranks transient.
        let report = BatchReport {
            results: vec![ok, transient, permanent],
            contended: false,
        };
        assert_eq!(report.exit_code(), 3);

        let report = BatchReport {
            results: vec![],
            contended: true,
        };
        assert_eq!(report.exit_code(), 0);
    }

    #[test]
    fn test_dedup_by_hash() {
        let dir = tempdir().unwrap();
        let book = dir.path().join("Book");
        fs::create_dir(&book).unwrap();
        fs::write(book.join("01.mp3"), b"x").unwrap();

        let config = Config::default();
        let orchestrator = BatchOrchestrator::new(config, CancellationToken::new());

        // The same root twice still yields one book.
        let books = orchestrator
            .discover(
                &[dir.path().to_path_buf(), dir.path().to_path_buf()],
                PipelineMode::Convert,
            )
            .unwrap();
        assert_eq!(books.len(), 1);
    }
}
