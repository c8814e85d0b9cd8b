//! Destination planning and file commitment

use crate::core::library::LibraryIndex;
use crate::error::PipelineError;
use crate::models::HintSet;
use crate::utils::{sanitize_component, ComponentKind};
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

/// What the engine will do with a planned book
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanAction {
    /// Copy the produced file into the library (convert mode)
    Copy,
    /// Move the whole source directory into place (reorganize mode)
    Move,
    /// The book already lives at its resolved destination
    SkipCorrectlyPlaced,
}

/// A decided destination for one book
#[derive(Debug, Clone)]
pub struct Plan {
    pub dest_dir: PathBuf,
    pub dest_filename: String,
    pub action: PlanAction,
}

impl Plan {
    pub fn dest_path(&self) -> PathBuf {
        self.dest_dir.join(&self.dest_filename)
    }

    /// Basename of the book directory, the first half of the dedup key
    pub fn book_dir_name(&self) -> String {
        self.dest_dir
            .file_name()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_default()
    }

    /// File stem, the second half of the dedup key
    pub fn stem(&self) -> String {
        Path::new(&self.dest_filename)
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| self.dest_filename.clone())
    }
}

/// Organize engine: plans destinations against the library index and
/// commits files exactly once per `(book_dir, stem)`
pub struct OrganizeEngine {
    root: PathBuf,
    index: Arc<Mutex<LibraryIndex>>,
    file_mode: u32,
    unknown_author: String,
    dry_run: bool,
    /// Forced reruns overwrite an existing destination instead of failing
    force: bool,
}

impl OrganizeEngine {
    pub fn new(
        root: PathBuf,
        index: Arc<Mutex<LibraryIndex>>,
        file_mode: u32,
        unknown_author: String,
        dry_run: bool,
        force: bool,
    ) -> Self {
        Self {
            root,
            index,
            file_mode,
            unknown_author,
            dry_run,
            force,
        }
    }

    /// Decide the destination for a resolved book.
    ///
    /// `source_dir` is the book's directory and anchors the
    /// correctly-placed check; the audio file's immediate parent may be a
    /// disc subfolder and must not be used for that comparison.
    pub fn plan(
        &self,
        source_dir: &Path,
        identity: &HintSet,
        position_pad: usize,
        move_mode: bool,
    ) -> Result<Plan> {
        let author_raw = if identity.author.is_empty() {
            self.unknown_author.clone()
        } else {
            identity.author.clone()
        };
        let title_raw = if identity.title.is_empty() {
            source_dir
                .file_name()
                .map(|s| s.to_string_lossy().to_string())
                .unwrap_or_else(|| "Unknown Title".to_string())
        } else {
            identity.title.clone()
        };

        let author = sanitize_component(&author_raw, ComponentKind::Folder);
        let title = sanitize_component(&title_raw, ComponentKind::Folder);

        // Reuse existing casing at every level the index already knows.
        let index = self.index.lock().expect("library index poisoned");

        let author_dir = index.lookup_author(&author).unwrap_or(author);

        let dest_dir = if identity.series.is_empty() {
            let book_dir = index
                .lookup_child(&author_dir, &title)
                .unwrap_or_else(|| title.clone());
            self.root.join(&author_dir).join(book_dir)
        } else {
            let series = sanitize_component(&identity.series, ComponentKind::Folder);
            let series_dir = index
                .lookup_child(&author_dir, &series)
                .unwrap_or(series);

            let padded = pad_position(&identity.position, position_pad);
            let book_name = if padded.is_empty() {
                title.clone()
            } else {
                format!("{} - {}", padded, title)
            };
            let book_dir = index
                .lookup_child(&author_dir, &book_name)
                .unwrap_or(book_name);

            self.root.join(&author_dir).join(series_dir).join(book_dir)
        };
        drop(index);

        let dest_filename = sanitize_component(&format!("{}.m4b", title), ComponentKind::Filename);

        let action = if same_location(&dest_dir, source_dir) {
            PlanAction::SkipCorrectlyPlaced
        } else if move_mode {
            PlanAction::Move
        } else {
            PlanAction::Copy
        };

        Ok(Plan {
            dest_dir,
            dest_filename,
            action,
        })
    }

    /// Execute a plan. Returns the destination path, or `None` when the
    /// plan skipped (already placed, or another worker claimed the
    /// destination first).
    pub fn commit(&self, plan: &Plan, source_file: &Path, source_dir: &Path) -> Result<Option<PathBuf>> {
        if plan.action == PlanAction::SkipCorrectlyPlaced {
            tracing::info!("Already placed correctly: {}", source_dir.display());
            return Ok(None);
        }

        // Claim the destination before touching the filesystem so two
        // concurrent organizes cannot write the same file. A forced rerun
        // may reclaim its own already-indexed destination.
        {
            let mut index = self.index.lock().expect("library index poisoned");
            let newly_claimed = index.mark_processed(&plan.book_dir_name(), &plan.stem());
            if !newly_claimed && !(self.force && plan.dest_path().exists()) {
                tracing::warn!(
                    "Destination {} already claimed by another book; skipping {}",
                    plan.dest_path().display(),
                    source_dir.display()
                );
                return Ok(None);
            }
        }

        let dest_path = plan.dest_path();

        if self.dry_run {
            tracing::info!(
                "[DRY RUN] Would {} {} -> {}",
                if plan.action == PlanAction::Move { "move" } else { "copy" },
                source_dir.display(),
                dest_path.display()
            );
            return Ok(Some(dest_path));
        }

        match plan.action {
            PlanAction::Copy => self.commit_copy(source_file, &dest_path)?,
            PlanAction::Move => self.commit_move(source_dir, &plan.dest_dir)?,
            PlanAction::SkipCorrectlyPlaced => unreachable!(),
        }

        // Make the new folders visible to later planners in this batch.
        {
            let mut index = self.index.lock().expect("library index poisoned");
            if let Ok(relative) = plan.dest_dir.strip_prefix(&self.root) {
                let mut components = relative.components();
                if let Some(author) = components.next() {
                    let author = author.as_os_str().to_string_lossy().to_string();
                    for child in components {
                        index.register(&author, &child.as_os_str().to_string_lossy());
                    }
                }
            }
        }

        Ok(Some(dest_path))
    }

    /// Copy with exclusive create and explicit permissions
    fn commit_copy(&self, source_file: &Path, dest_path: &Path) -> Result<()> {
        std::fs::create_dir_all(dest_path.parent().context("destination has no parent")?)
            .with_context(|| format!("Failed to create {}", dest_path.display()))?;

        // create_new turns a duplicate destination into an error instead of
        // an overwrite; only a forced rerun writes over an existing file.
        let mut options = std::fs::OpenOptions::new();
        options.write(true);
        if self.force {
            options.create(true).truncate(true);
        } else {
            options.create_new(true);
        }

        let mut dest = options.open(dest_path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::AlreadyExists {
                anyhow::Error::new(PipelineError::Input(format!(
                    "destination already exists: {}",
                    dest_path.display()
                )))
            } else {
                anyhow::Error::new(e)
                    .context(format!("Failed to create {}", dest_path.display()))
            }
        })?;

        let mut src = std::fs::File::open(source_file)
            .with_context(|| format!("Failed to open {}", source_file.display()))?;
        std::io::copy(&mut src, &mut dest)
            .with_context(|| format!("Failed to copy to {}", dest_path.display()))?;
        drop(dest);

        set_file_mode(dest_path, self.file_mode);

        tracing::info!("Copied {} -> {}", source_file.display(), dest_path.display());
        Ok(())
    }

    /// Move the entire source directory, preserving disc subfolders, then
    /// prune emptied parents without ever crossing the library root
    fn commit_move(&self, source_dir: &Path, dest_dir: &Path) -> Result<()> {
        if let Some(parent) = dest_dir.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }

        // A forced rerun reclaims its destination; otherwise an occupied
        // destination is a refusal, never an overwrite.
        if dest_dir.exists() {
            if !self.force {
                return Err(PipelineError::Input(format!(
                    "destination already exists: {}",
                    dest_dir.display()
                ))
                .into());
            }
            tracing::info!("Removing existing destination {} (force)", dest_dir.display());
            if dest_dir.is_dir() {
                std::fs::remove_dir_all(dest_dir)
                    .with_context(|| format!("Failed to remove {}", dest_dir.display()))?;
            } else {
                std::fs::remove_file(dest_dir)
                    .with_context(|| format!("Failed to remove {}", dest_dir.display()))?;
            }
        }

        std::fs::rename(source_dir, dest_dir).with_context(|| {
            format!(
                "Failed to move {} to {}",
                source_dir.display(),
                dest_dir.display()
            )
        })?;

        tracing::info!("Moved {} -> {}", source_dir.display(), dest_dir.display());

        if let Some(parent) = source_dir.parent() {
            remove_empty_parents(parent, &self.root);
        }
        Ok(())
    }
}

/// Zero-pad a series position, leaving the fractional part alone
pub fn pad_position(position: &str, width: usize) -> String {
    if position.is_empty() {
        return String::new();
    }
    match position.split_once('.') {
        Some((whole, frac)) => match whole.parse::<u32>() {
            Ok(n) => format!("{:0width$}.{}", n, frac, width = width),
            Err(_) => position.to_string(),
        },
        None => match position.parse::<u32>() {
            Ok(n) => format!("{:0width$}", n, width = width),
            Err(_) => position.to_string(),
        },
    }
}

/// Whether the resolved destination equals the book's current directory
fn same_location(dest_dir: &Path, source_dir: &Path) -> bool {
    match (dest_dir.canonicalize(), source_dir.canonicalize()) {
        (Ok(a), Ok(b)) => a == b,
        _ => dest_dir == source_dir,
    }
}

/// Remove empty directories from `start` upward, stopping at (and never
/// removing) `boundary`
pub fn remove_empty_parents(start: &Path, boundary: &Path) {
    let mut current = start.to_path_buf();
    loop {
        if current == boundary || !current.starts_with(boundary) {
            break;
        }
        let empty = match std::fs::read_dir(&current) {
            Ok(mut entries) => entries.next().is_none(),
            Err(_) => break,
        };
        if !empty {
            break;
        }
        if std::fs::remove_dir(&current).is_err() {
            break;
        }
        tracing::debug!("Removed empty directory {}", current.display());
        match current.parent() {
            Some(parent) => current = parent.to_path_buf(),
            None => break,
        }
    }
}

fn set_file_mode(path: &Path, mode: u32) {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        // NFS and some mounts refuse permission changes; not worth failing
        // a book over.
        if let Err(e) = std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode)) {
            tracing::warn!("chmod {:o} failed for {}: {}", mode, path.display(), e);
        }
    }
    #[cfg(not(unix))]
    {
        let _ = (path, mode);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    fn engine(root: &Path) -> OrganizeEngine {
        let index = LibraryIndex::build(root).unwrap();
        OrganizeEngine::new(
            root.to_path_buf(),
            Arc::new(Mutex::new(index)),
            0o644,
            "Unknown Author".to_string(),
            false,
            false,
        )
    }

    fn identity(author: &str, title: &str, series: &str, position: &str) -> HintSet {
        HintSet {
            author: author.to_string(),
            title: title.to_string(),
            series: series.to_string(),
            position: position.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_plan_without_series() {
        let dir = tempdir().unwrap();
        let engine = engine(dir.path());

        let plan = engine
            .plan(
                Path::new("/in/somewhere"),
                &identity("Paulo Coelho", "The Alchemist", "", ""),
                2,
                false,
            )
            .unwrap();

        assert_eq!(
            plan.dest_dir,
            dir.path().join("Paulo Coelho").join("The Alchemist")
        );
        assert_eq!(plan.dest_filename, "The Alchemist.m4b");
        assert_eq!(plan.action, PlanAction::Copy);
    }

    #[test]
    fn test_plan_with_series() {
        let dir = tempdir().unwrap();
        let engine = engine(dir.path());

        let plan = engine
            .plan(
                Path::new("/in/somewhere"),
                &identity("Brandon Sanderson", "The Final Empire", "Mistborn", "1"),
                2,
                false,
            )
            .unwrap();

        assert_eq!(
            plan.dest_dir,
            dir.path()
                .join("Brandon Sanderson")
                .join("Mistborn")
                .join("01 - The Final Empire")
        );
        assert_eq!(plan.dest_filename, "The Final Empire.m4b");
    }

    #[test]
    fn test_plan_unknown_author() {
        let dir = tempdir().unwrap();
        let engine = engine(dir.path());

        let plan = engine
            .plan(Path::new("/in/Mystery Book"), &identity("", "Mystery Book", "", ""), 2, false)
            .unwrap();

        assert!(plan.dest_dir.starts_with(dir.path().join("Unknown Author")));
    }

    #[test]
    fn test_plan_reuses_existing_casing() {
        let dir = tempdir().unwrap();
        fs::create_dir_all(dir.path().join("BRANDON SANDERSON/Mistborn")).unwrap();
        let engine = engine(dir.path());

        let plan = engine
            .plan(
                Path::new("/in/x"),
                &identity("Brandon Sanderson", "The Final Empire", "Mistborn", "1"),
                2,
                false,
            )
            .unwrap();

        assert!(plan.dest_dir.starts_with(dir.path().join("BRANDON SANDERSON")));
    }

    #[test]
    fn test_correctly_placed_detection() {
        let dir = tempdir().unwrap();
        let book_dir = dir.path().join("Neil Gaiman").join("American Gods");
        fs::create_dir_all(&book_dir).unwrap();
        fs::write(book_dir.join("American Gods.m4b"), b"x").unwrap();

        let engine = engine(dir.path());
        let plan = engine
            .plan(&book_dir, &identity("Neil Gaiman", "American Gods", "", ""), 2, true)
            .unwrap();

        assert_eq!(plan.action, PlanAction::SkipCorrectlyPlaced);
        let committed = engine
            .commit(&plan, &book_dir.join("American Gods.m4b"), &book_dir)
            .unwrap();
        assert!(committed.is_none());
    }

    #[test]
    fn test_commit_copy_writes_once() {
        let dir = tempdir().unwrap();
        let src_dir = tempdir().unwrap();
        let src = src_dir.path().join("book.m4b");
        fs::write(&src, b"audio").unwrap();

        let engine = engine(dir.path());
        let plan = engine
            .plan(src_dir.path(), &identity("A Author", "A Title", "", ""), 2, false)
            .unwrap();

        let dest = engine.commit(&plan, &src, src_dir.path()).unwrap().unwrap();
        assert!(dest.exists());
        assert_eq!(fs::read(&dest).unwrap(), b"audio");

        // A second commit of the same plan is refused by the index claim.
        let second = engine.commit(&plan, &src, src_dir.path()).unwrap();
        assert!(second.is_none());
    }

    #[test]
    fn test_force_overwrites_existing_destination() {
        let dir = tempdir().unwrap();
        let src_dir = tempdir().unwrap();
        let src = src_dir.path().join("book.m4b");
        fs::write(&src, b"new audio").unwrap();

        // Pre-existing destination from an earlier run.
        let dest_dir = dir.path().join("A Author/A Title");
        fs::create_dir_all(&dest_dir).unwrap();
        fs::write(dest_dir.join("A Title.m4b"), b"old audio").unwrap();

        let index = LibraryIndex::build(dir.path()).unwrap();
        let engine = OrganizeEngine::new(
            dir.path().to_path_buf(),
            Arc::new(Mutex::new(index)),
            0o644,
            "Unknown Author".to_string(),
            false,
            true,
        );

        let plan = engine
            .plan(src_dir.path(), &identity("A Author", "A Title", "", ""), 2, false)
            .unwrap();
        let dest = engine.commit(&plan, &src, src_dir.path()).unwrap().unwrap();
        assert_eq!(fs::read(&dest).unwrap(), b"new audio");
    }

    #[test]
    fn test_force_move_replaces_destination() {
        let root = tempdir().unwrap();
        let outside = tempdir().unwrap();

        // Leftover destination from an earlier run.
        let dest_dir = root.path().join("Author Person/My Book");
        fs::create_dir_all(&dest_dir).unwrap();
        fs::write(dest_dir.join("My Book.m4b"), b"old audio").unwrap();

        let src_dir = outside.path().join("My Book");
        fs::create_dir_all(&src_dir).unwrap();
        fs::write(src_dir.join("My Book.m4b"), b"new audio").unwrap();

        let index = LibraryIndex::build(root.path()).unwrap();
        let engine = OrganizeEngine::new(
            root.path().to_path_buf(),
            Arc::new(Mutex::new(index)),
            0o644,
            "Unknown Author".to_string(),
            false,
            true,
        );

        let plan = engine
            .plan(&src_dir, &identity("Author Person", "My Book", "", ""), 2, true)
            .unwrap();
        assert_eq!(plan.action, PlanAction::Move);

        engine
            .commit(&plan, &src_dir.join("My Book.m4b"), &src_dir)
            .unwrap();
        assert_eq!(
            fs::read(plan.dest_dir.join("My Book.m4b")).unwrap(),
            b"new audio"
        );
        assert!(!src_dir.exists());
    }

    #[test]
    fn test_commit_move_preserves_subdirs() {
        let root = tempdir().unwrap();
        let outside = tempdir().unwrap();
        let src_dir = outside.path().join("My Book");
        fs::create_dir_all(src_dir.join("CD1")).unwrap();
        fs::write(src_dir.join("CD1/01.mp3"), b"x").unwrap();

        let engine = engine(root.path());
        let plan = engine
            .plan(&src_dir, &identity("Author Person", "My Book", "", ""), 2, true)
            .unwrap();
        assert_eq!(plan.action, PlanAction::Move);

        engine.commit(&plan, &src_dir.join("CD1/01.mp3"), &src_dir).unwrap();
        assert!(plan.dest_dir.join("CD1/01.mp3").exists());
        assert!(!src_dir.exists());
    }

    #[test]
    fn test_empty_parent_cleanup_bounded() {
        let root = tempdir().unwrap();
        let nested = root.path().join("a/b/c");
        fs::create_dir_all(&nested).unwrap();

        remove_empty_parents(&nested, root.path());

        assert!(!root.path().join("a").exists());
        // The boundary itself must survive.
        assert!(root.path().exists());
    }

    #[test]
    fn test_cleanup_never_climbs_above_boundary() {
        let root = tempdir().unwrap();
        let boundary = root.path().join("library");
        let outside = root.path().join("elsewhere");
        fs::create_dir_all(&boundary).unwrap();
        fs::create_dir_all(&outside).unwrap();

        remove_empty_parents(&outside, &boundary);
        assert!(outside.exists());
    }

    #[test]
    fn test_pad_position() {
        assert_eq!(pad_position("1", 2), "01");
        assert_eq!(pad_position("1", 3), "001");
        assert_eq!(pad_position("12", 2), "12");
        assert_eq!(pad_position("1.5", 2), "01.5");
        assert_eq!(pad_position("", 2), "");
    }
}
