//! Process-wide batch lock, disk preflight, and host-load probing

use crate::error::PipelineError;
use anyhow::{Context, Result};
use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

/// Advisory exclusive lock held for the lifetime of one batch.
///
/// A second batch on the same host must treat contention as a clean no-op
/// (cron and webhook callers interpret exit 0 as success), so acquisition
/// reports contention as a distinct outcome rather than an error.
pub struct ProcessLock {
    file: File,
}

/// Outcome of a lock attempt
pub enum LockAttempt {
    Acquired(ProcessLock),
    Contended,
}

impl ProcessLock {
    /// Try to take the batch lock at `path`
    pub fn acquire(path: &Path) -> Result<LockAttempt> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create lock directory {}", parent.display()))?;
        }

        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .open(path)
            .with_context(|| format!("Failed to open lock file {}", path.display()))?;

        match file.try_lock_exclusive() {
            Ok(()) => {
                tracing::debug!("Acquired batch lock at {}", path.display());
                Ok(LockAttempt::Acquired(ProcessLock { file }))
            }
            Err(_) => {
                tracing::info!("Another batch holds {}; exiting", path.display());
                Ok(LockAttempt::Contended)
            }
        }
    }
}

impl Drop for ProcessLock {
    fn drop(&mut self) {
        let _ = fs2::FileExt::unlock(&self.file);
    }
}

/// Verify the destination filesystem has room for a book.
///
/// `required` is normally 3x the source size: concat scratch, the encoded
/// output, and headroom for the tagger's rewrite.
pub fn check_disk_space(target: &Path, required: u64) -> Result<()> {
    let probe = nearest_existing(target);
    let available = fs2::available_space(&probe)
        .with_context(|| format!("Failed to stat free space at {}", probe.display()))?;

    if available < required {
        return Err(PipelineError::Input(format!(
            "insufficient disk space at {}: {} bytes free, {} required",
            probe.display(),
            available,
            required
        ))
        .into());
    }
    Ok(())
}

fn nearest_existing(path: &Path) -> PathBuf {
    let mut current = path.to_path_buf();
    while !current.exists() {
        match current.parent() {
            Some(parent) => current = parent.to_path_buf(),
            None => break,
        }
    }
    current
}

/// Total size of all files under a directory
pub fn dir_size(path: &Path) -> Result<u64> {
    let mut total = 0u64;
    for entry in walkdir::WalkDir::new(path).follow_links(false) {
        let entry = entry.context("Failed to read directory entry")?;
        if entry.file_type().is_file() {
            total += entry.metadata().map(|m| m.len()).unwrap_or(0);
        }
    }
    Ok(total)
}

/// Host CPU load probe used to throttle dispatch
pub struct LoadMonitor {
    cpu_count: usize,
}

impl LoadMonitor {
    pub fn new() -> Self {
        Self {
            cpu_count: num_cpus::get().max(1),
        }
    }

    /// 1-minute load average divided by CPU count
    pub fn load_ratio(&self) -> f64 {
        let load = sysinfo::System::load_average();
        load.one / self.cpu_count as f64
    }

    /// Whether dispatching another book would push the host past the ceiling
    pub fn is_overloaded(&self, ceiling: f64) -> bool {
        let ratio = self.load_ratio();
        if ratio > ceiling {
            tracing::debug!("Host load ratio {:.2} exceeds ceiling {:.2}", ratio, ceiling);
            true
        } else {
            false
        }
    }

    pub fn cpu_count(&self) -> usize {
        self.cpu_count
    }
}

impl Default for LoadMonitor {
    fn default() -> Self {
        Self::new()
    }
}
