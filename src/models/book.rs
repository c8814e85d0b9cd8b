//! Discovered source book

use crate::utils::sanitize;
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// One logical audiobook rooted at a source directory.
///
/// Identity (`book_hash`) is a function of the source path and the audio
/// basename set only; nothing else about the directory participates.
#[derive(Debug, Clone)]
pub struct SourceBook {
    pub source_dir: PathBuf,
    pub book_hash: String,
    /// Audio files in natural order, including files in disc subfolders
    pub audio_files: Vec<PathBuf>,
    /// Name the parser sees: the directory basename, or the file stem for
    /// a book handed over as a bare audio file
    pub name: String,
}

impl SourceBook {
    /// Wrap a single audio file handed directly to the CLI
    pub fn from_file(file: &Path) -> Result<Self> {
        if !file.is_file() || !sanitize::is_audio_path(file) {
            anyhow::bail!("not an audio file: {}", file.display());
        }

        // Identity must not depend on how the caller spelled the path; a
        // relative argument or symlinked alias hashes like its absolute
        // form.
        let file = file
            .canonicalize()
            .with_context(|| format!("Failed to resolve {}", file.display()))?;

        let source_dir = file
            .parent()
            .context("audio file has no parent directory")?
            .to_path_buf();
        let basename = file
            .file_name()
            .context("audio file has no name")?
            .to_string_lossy()
            .to_string();
        let name = file
            .file_stem()
            .context("audio file has no stem")?
            .to_string_lossy()
            .to_string();

        let book_hash = sanitize::book_hash_from_parts(&source_dir, &[basename]);

        Ok(Self {
            source_dir,
            book_hash,
            audio_files: vec![file],
            name,
        })
    }

    /// Discover a book at `source_dir`, failing when it holds no audio
    pub fn discover(source_dir: &Path) -> Result<Self> {
        if !source_dir.is_dir() {
            anyhow::bail!("not a directory: {}", source_dir.display());
        }

        // Hash and manifest both carry the absolute directory, never the
        // caller's spelling of it.
        let source_dir = source_dir
            .canonicalize()
            .with_context(|| format!("Failed to resolve {}", source_dir.display()))?;

        let mut audio_files = Vec::new();
        for entry in WalkDir::new(&source_dir).follow_links(false) {
            let entry = entry.context("Failed to read directory entry")?;
            if entry.file_type().is_file() && sanitize::is_audio_path(entry.path()) {
                audio_files.push(entry.path().to_path_buf());
            }
        }

        if audio_files.is_empty() {
            anyhow::bail!("no audio files under {}", source_dir.display());
        }

        crate::utils::natural_sort(&mut audio_files);

        let basenames: Vec<String> = audio_files
            .iter()
            .map(|p| p.file_name().unwrap_or_default().to_string_lossy().to_string())
            .collect();
        let book_hash = sanitize::book_hash_from_parts(&source_dir, &basenames);
        let name = source_dir
            .file_name()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| source_dir.display().to_string());

        Ok(Self {
            source_dir,
            book_hash,
            audio_files,
            name,
        })
    }

    /// Name used for hints and display
    pub fn dir_name(&self) -> String {
        self.name.clone()
    }

    /// Whether the source is already a single M4B
    pub fn is_single_m4b(&self) -> bool {
        self.audio_files.len() == 1
            && self.audio_files[0]
                .extension()
                .and_then(|s| s.to_str())
                .map(|s| s.eq_ignore_ascii_case("m4b"))
                .unwrap_or(false)
    }

}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn test_discover_sorted() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("10.mp3"), b"x").unwrap();
        fs::write(dir.path().join("2.mp3"), b"x").unwrap();
        fs::write(dir.path().join("notes.txt"), b"x").unwrap();

        let book = SourceBook::discover(dir.path()).unwrap();
        assert_eq!(book.audio_files.len(), 2);
        assert!(book.audio_files[0].ends_with("2.mp3"));
        assert!(book.audio_files[1].ends_with("10.mp3"));
        assert_eq!(book.book_hash.len(), 16);
    }

    #[test]
    fn test_discover_disc_subfolders() {
        let dir = tempdir().unwrap();
        let cd1 = dir.path().join("CD1");
        let cd2 = dir.path().join("CD2");
        fs::create_dir(&cd1).unwrap();
        fs::create_dir(&cd2).unwrap();
        fs::write(cd1.join("01.mp3"), b"x").unwrap();
        fs::write(cd2.join("01.mp3"), b"x").unwrap();

        let book = SourceBook::discover(dir.path()).unwrap();
        assert_eq!(book.audio_files.len(), 2);
    }

    #[test]
    fn test_discover_empty_fails() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("readme.txt"), b"x").unwrap();
        assert!(SourceBook::discover(dir.path()).is_err());
    }

    #[test]
    fn test_single_m4b_detection() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("book.m4b"), b"x").unwrap();

        let book = SourceBook::discover(dir.path()).unwrap();
        assert!(book.is_single_m4b());
    }

    #[test]
    fn test_from_file_uses_stem_as_name() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("The Alchemist - Paulo Coelho.mp3");
        fs::write(&file, b"x").unwrap();

        let book = SourceBook::from_file(&file).unwrap();
        assert_eq!(book.name, "The Alchemist - Paulo Coelho");
        assert_eq!(book.audio_files.len(), 1);
        assert_eq!(book.source_dir, dir.path().canonicalize().unwrap());
    }

    #[test]
    fn test_identity_ignores_path_spelling() {
        let dir = tempdir().unwrap();
        let book_dir = dir.path().join("Book");
        fs::create_dir(&book_dir).unwrap();
        fs::write(book_dir.join("01.mp3"), b"x").unwrap();

        // `Book` and `Book/../Book` are the same directory and must share
        // one identity.
        let direct = SourceBook::discover(&book_dir).unwrap();
        let aliased = SourceBook::discover(&dir.path().join("Book/../Book")).unwrap();
        assert_eq!(direct.book_hash, aliased.book_hash);
        assert_eq!(direct.source_dir, aliased.source_dir);
    }

    #[test]
    fn test_from_file_rejects_non_audio() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("notes.txt");
        fs::write(&file, b"x").unwrap();
        assert!(SourceBook::from_file(&file).is_err());
    }
}
