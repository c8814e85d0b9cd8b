//! Book identity hashing and filesystem-safe name components

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use std::path::Path;
use walkdir::WalkDir;

/// Audio extensions recognized as book content (lowercase)
pub const AUDIO_EXTENSIONS: &[&str] = &["mp3", "flac", "m4a", "m4b", "ogg", "wma"];

/// Maximum byte length of a single path component on common filesystems
const MAX_COMPONENT_BYTES: usize = 255;

/// Characters that cannot appear in a path component
const INVALID_CHARS: &[char] = &['/', '\\', ':', '*', '?', '"', '<', '>', '|'];

/// What a sanitized component will be used as
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComponentKind {
    Folder,
    Filename,
}

/// Check whether a path carries a recognized audio extension
pub fn is_audio_path(path: &Path) -> bool {
    path.extension()
        .and_then(|s| s.to_str())
        .map(|s| {
            let lower = s.to_lowercase();
            AUDIO_EXTENSIONS.iter().any(|ext| *ext == lower)
        })
        .unwrap_or(false)
}

/// Collect the audio-file basenames under a book directory, natural-sorted.
///
/// Recurses so multi-disc layouts (`CD1/`, `CD2/`) contribute to identity;
/// symlinks are not followed.
pub fn collect_audio_basenames(source_dir: &Path) -> Result<Vec<String>> {
    let mut names = Vec::new();

    for entry in WalkDir::new(source_dir).follow_links(false) {
        let entry = entry.context("Failed to read directory entry")?;
        if entry.file_type().is_file() && is_audio_path(entry.path()) {
            names.push(entry.file_name().to_string_lossy().to_string());
        }
    }

    names.sort_by(|a, b| natord::compare(a, b));
    Ok(names)
}

/// Compute the 16-hex identity of a book directory.
///
/// SHA-256 over the absolute source path followed by the natural-sorted
/// audio basenames; stable across reruns while the directory and its audio
/// set are unchanged. The path is resolved first so relative spellings and
/// symlinked aliases hash identically.
pub fn book_hash(source_dir: &Path) -> Result<String> {
    let source_dir = source_dir
        .canonicalize()
        .with_context(|| format!("Failed to resolve {}", source_dir.display()))?;
    let names = collect_audio_basenames(&source_dir)?;
    if names.is_empty() {
        anyhow::bail!("no audio files under {}", source_dir.display());
    }
    Ok(book_hash_from_parts(&source_dir, &names))
}

/// Hash from a pre-collected basename list (already sorted). Callers are
/// responsible for handing in the canonicalized directory.
pub fn book_hash_from_parts(source_dir: &Path, audio_basenames: &[String]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(source_dir.to_string_lossy().as_bytes());
    hasher.update(b"\n");
    for name in audio_basenames {
        hasher.update(name.as_bytes());
        hasher.update(b"\n");
    }

    let digest = hasher.finalize();
    let hex: String = digest.iter().map(|b| format!("{:02x}", b)).collect();
    hex[..16].to_string()
}

/// Produce a filesystem-safe path component.
///
/// Invalid characters become a space (folders) or underscore (filenames),
/// runs collapse to one, edge dots and whitespace are stripped, and the
/// result is truncated to 255 bytes without splitting a UTF-8 sequence.
/// Filenames keep their extension through truncation. Never returns an
/// empty string.
pub fn sanitize_component(name: &str, kind: ComponentKind) -> String {
    match kind {
        ComponentKind::Folder => {
            let cleaned = replace_and_collapse(name, ' ');
            finish_component(truncate_utf8(&cleaned, MAX_COMPONENT_BYTES))
        }
        ComponentKind::Filename => {
            // Keep the extension intact across truncation.
            let (stem, ext) = match name.rsplit_once('.') {
                Some((stem, ext)) if !stem.is_empty() && !ext.is_empty() => {
                    (stem.to_string(), Some(ext.to_string()))
                }
                _ => (name.to_string(), None),
            };

            let stem = replace_and_collapse(&stem, '_');
            match ext {
                Some(ext) => {
                    let ext = replace_and_collapse(&ext, '_');
                    let stem_max = MAX_COMPONENT_BYTES.saturating_sub(ext.len() + 1);
                    let stem = finish_component(truncate_utf8(&stem, stem_max));
                    format!("{}.{}", stem, ext.trim())
                }
                None => finish_component(truncate_utf8(&stem, MAX_COMPONENT_BYTES)),
            }
        }
    }
}

/// Replace invalid characters and collapse whitespace/underscore runs
fn replace_and_collapse(name: &str, replacement: char) -> String {
    let mut out = String::with_capacity(name.len());
    let mut last_was_filler = false;

    for c in name.chars() {
        let mapped = if INVALID_CHARS.contains(&c) || c == '\0' {
            replacement
        } else {
            c
        };

        let is_filler = mapped.is_whitespace() || mapped == '_';
        if is_filler {
            if !last_was_filler {
                out.push(mapped);
            }
        } else {
            out.push(mapped);
        }
        last_was_filler = is_filler;
    }

    out
}

/// Strip edge dots/whitespace and substitute the sentinel for emptiness
fn finish_component(s: String) -> String {
    let trimmed = s
        .trim_matches(|c: char| c.is_whitespace() || c == '.')
        .trim_matches('_')
        .to_string();
    if trimmed.is_empty() {
        "_".to_string()
    } else {
        trimmed
    }
}

/// Truncate to at most `max_bytes` without splitting a multi-byte sequence
fn truncate_utf8(s: &str, max_bytes: usize) -> String {
    if s.len() <= max_bytes {
        return s.to_string();
    }
    let mut end = max_bytes;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    s[..end].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn test_book_hash_deterministic() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("01.mp3"), b"a").unwrap();
        fs::write(dir.path().join("02.mp3"), b"b").unwrap();

        let first = book_hash(dir.path()).unwrap();
        let second = book_hash(dir.path()).unwrap();
        assert_eq!(first, second);
        assert_eq!(first.len(), 16);
        assert!(first.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_book_hash_changes_with_content() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("01.mp3"), b"a").unwrap();
        let before = book_hash(dir.path()).unwrap();

        fs::write(dir.path().join("02.mp3"), b"b").unwrap();
        let after = book_hash(dir.path()).unwrap();
        assert_ne!(before, after);
    }

    #[test]
    fn test_book_hash_includes_subdirs() {
        let dir = tempdir().unwrap();
        let cd1 = dir.path().join("CD1");
        fs::create_dir(&cd1).unwrap();
        fs::write(cd1.join("01.mp3"), b"a").unwrap();

        let hash = book_hash(dir.path()).unwrap();
        assert_eq!(hash.len(), 16);
    }

    #[test]
    fn test_book_hash_empty_dir_fails() {
        let dir = tempdir().unwrap();
        assert!(book_hash(dir.path()).is_err());
    }

    #[test]
    fn test_book_hash_ignores_path_spelling() {
        let dir = tempdir().unwrap();
        let book_dir = dir.path().join("Book");
        fs::create_dir(&book_dir).unwrap();
        fs::write(book_dir.join("01.mp3"), b"a").unwrap();

        let direct = book_hash(&book_dir).unwrap();
        let aliased = book_hash(&dir.path().join("Book/../Book")).unwrap();
        assert_eq!(direct, aliased);
    }

    #[test]
    fn test_is_audio_path() {
        assert!(is_audio_path(Path::new("a.mp3")));
        assert!(is_audio_path(Path::new("a.FLAC")));
        assert!(is_audio_path(Path::new("a.M4B")));
        assert!(!is_audio_path(Path::new("a.txt")));
        assert!(!is_audio_path(Path::new("noext")));
    }

    #[test]
    fn test_sanitize_folder() {
        assert_eq!(
            sanitize_component("Foo: Bar / Baz", ComponentKind::Folder),
            "Foo Bar Baz"
        );
        assert_eq!(sanitize_component("...dots...", ComponentKind::Folder), "dots");
        assert_eq!(sanitize_component("", ComponentKind::Folder), "_");
        assert_eq!(sanitize_component("***", ComponentKind::Folder), "_");
    }

    #[test]
    fn test_sanitize_filename_keeps_extension() {
        let name = sanitize_component("What? A Book!.m4b", ComponentKind::Filename);
        assert!(name.ends_with(".m4b"));
        assert!(!name.contains('?'));

        let long_stem = "х".repeat(300);
        let name = sanitize_component(&format!("{}.m4b", long_stem), ComponentKind::Filename);
        assert!(name.len() <= 255);
        assert!(name.ends_with(".m4b"));
    }

    #[test]
    fn test_sanitize_idempotent() {
        let once = sanitize_component("A * Very ? Odd : Name", ComponentKind::Folder);
        let twice = sanitize_component(&once, ComponentKind::Folder);
        assert_eq!(once, twice);
    }

    #[test]
    fn test_sanitize_no_invalid_bytes() {
        let out = sanitize_component("a/b\\c:d*e?f\"g<h>i|j", ComponentKind::Folder);
        for c in INVALID_CHARS {
            assert!(!out.contains(*c));
        }
    }

    #[test]
    fn test_truncate_multibyte_boundary() {
        // 300 bytes of CJK; truncation must land on a character boundary.
        let title = "書".repeat(100);
        let out = sanitize_component(&title, ComponentKind::Folder);
        assert!(out.len() <= 255);
        assert!(std::str::from_utf8(out.as_bytes()).is_ok());
    }

    #[test]
    fn test_exact_255_passes_unchanged() {
        let name = "a".repeat(255);
        assert_eq!(sanitize_component(&name, ComponentKind::Folder), name);
    }
}
