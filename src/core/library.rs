//! In-memory view of the destination library
//!
//! Built by one walk at batch start, then kept current as organizes commit.
//! Lookups are normalized so `The Stormlight Archive` and `Stormlight
//! Archive (2010)` land in the same folder; the processed-file set keys on
//! `"<book_dir>/<stem>"` so two books that both ship an `01.mp3` never
//! collide.

use anyhow::{Context, Result};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use unicode_normalization::UnicodeNormalization;
use walkdir::WalkDir;

/// Words ignored when one name's tokens are a subset of another's
const STOP_WORDS: &[&str] = &["the", "of", "a", "an", "and"];

/// Two names are the same folder when their token sets overlap this much
const JACCARD_THRESHOLD: f64 = 0.85;

/// Library index over `<root>/<Author>/[<Series>/]<Book>/` folders
#[derive(Debug, Default)]
pub struct LibraryIndex {
    root: PathBuf,
    /// normalized author name → actual directory name
    authors: HashMap<String, String>,
    /// actual author dir → (normalized child → actual child)
    author_children: HashMap<String, HashMap<String, String>>,
    /// `"<book_dir_basename>/<file_stem>"` for every committed file
    existing_files: HashSet<String>,
}

impl LibraryIndex {
    /// Build the index with one walk of the destination root
    pub fn build(root: &Path) -> Result<Self> {
        let mut index = Self {
            root: root.to_path_buf(),
            ..Default::default()
        };

        if !root.exists() {
            return Ok(index);
        }

        for entry in WalkDir::new(root)
            .min_depth(1)
            .max_depth(4)
            .follow_links(false)
        {
            let entry = entry.context("Failed to read library entry")?;
            let path = entry.path();
            let name = entry.file_name().to_string_lossy().to_string();

            if name.starts_with('.') {
                continue;
            }

            let depth = entry.depth();
            if entry.file_type().is_dir() {
                if depth == 1 {
                    index.authors.insert(normalize(&name), name);
                } else if depth == 2 || depth == 3 {
                    // Series folders and book folders both count as
                    // children of their author.
                    if let Some(author) = component_at(path, root, 0) {
                        index
                            .author_children
                            .entry(author)
                            .or_default()
                            .insert(normalize(&name), name);
                    }
                }
            } else if entry.file_type().is_file() {
                if let (Some(stem), Some(parent)) = (
                    path.file_stem().map(|s| s.to_string_lossy().to_string()),
                    path.parent()
                        .and_then(|p| p.file_name())
                        .map(|s| s.to_string_lossy().to_string()),
                ) {
                    index.existing_files.insert(file_key(&parent, &stem));
                }
            }
        }

        tracing::info!(
            "Library index: {} authors, {} files under {}",
            index.authors.len(),
            index.existing_files.len(),
            root.display()
        );
        Ok(index)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Existing author directory matching `name`, if any
    pub fn lookup_author(&self, name: &str) -> Option<String> {
        let normalized = normalize(name);
        if let Some(actual) = self.authors.get(&normalized) {
            return Some(actual.clone());
        }
        self.authors
            .iter()
            .find(|(existing, _)| near_match(&normalized, existing))
            .map(|(_, actual)| actual.clone())
    }

    /// Existing series/book directory under an author matching `name`
    pub fn lookup_child(&self, author_dir: &str, name: &str) -> Option<String> {
        let children = self.author_children.get(author_dir)?;
        let normalized = normalize(name);
        if let Some(actual) = children.get(&normalized) {
            return Some(actual.clone());
        }
        children
            .iter()
            .find(|(existing, _)| near_match(&normalized, existing))
            .map(|(_, actual)| actual.clone())
    }

    /// Record a newly created directory pair
    pub fn register(&mut self, author_dir: &str, child_dir: &str) {
        self.authors
            .entry(normalize(author_dir))
            .or_insert_with(|| author_dir.to_string());
        self.author_children
            .entry(author_dir.to_string())
            .or_default()
            .insert(normalize(child_dir), child_dir.to_string());
    }

    /// Claim a destination; `false` when another book already owns it
    pub fn mark_processed(&mut self, book_dir: &str, stem: &str) -> bool {
        self.existing_files.insert(file_key(book_dir, stem))
    }

    pub fn is_processed(&self, book_dir: &str, stem: &str) -> bool {
        self.existing_files.contains(&file_key(book_dir, stem))
    }
}

fn file_key(book_dir: &str, stem: &str) -> String {
    format!("{}/{}", book_dir, stem)
}

fn component_at(path: &Path, root: &Path, index: usize) -> Option<String> {
    path.strip_prefix(root)
        .ok()?
        .components()
        .nth(index)
        .map(|c| c.as_os_str().to_string_lossy().to_string())
}

/// Normalize a name for lookup: NFC, lowercase, punctuation to spaces,
/// collapsed whitespace, four-digit years dropped, one trailing `s` removed
pub fn normalize(name: &str) -> String {
    let nfc: String = name.nfc().collect();
    let lowered = nfc.to_lowercase();

    let mut cleaned = String::with_capacity(lowered.len());
    for c in lowered.chars() {
        if c.is_alphanumeric() {
            cleaned.push(c);
        } else {
            cleaned.push(' ');
        }
    }

    let tokens: Vec<&str> = cleaned
        .split_whitespace()
        .filter(|t| !(t.len() == 4 && t.chars().all(|c| c.is_ascii_digit())))
        .collect();

    let mut joined = tokens.join(" ");
    if joined.len() > 1 && joined.ends_with('s') && !joined.ends_with("ss") {
        joined.pop();
    }
    joined
}

/// Near-match: token subset with only stop words left over, or a Jaccard
/// similarity of at least 0.85 over token sets
pub fn near_match(a: &str, b: &str) -> bool {
    let a_tokens: HashSet<&str> = a.split_whitespace().collect();
    let b_tokens: HashSet<&str> = b.split_whitespace().collect();

    if a_tokens.is_empty() || b_tokens.is_empty() {
        return false;
    }

    if subset_with_stop_words(&a_tokens, &b_tokens) || subset_with_stop_words(&b_tokens, &a_tokens)
    {
        return true;
    }

    let intersection = a_tokens.intersection(&b_tokens).count() as f64;
    let union = a_tokens.union(&b_tokens).count() as f64;
    intersection / union >= JACCARD_THRESHOLD
}

fn subset_with_stop_words(smaller: &HashSet<&str>, larger: &HashSet<&str>) -> bool {
    if !smaller.is_subset(larger) {
        return false;
    }
    larger
        .difference(smaller)
        .all(|extra| STOP_WORDS.contains(extra))
}
