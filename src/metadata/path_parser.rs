//! Hint extraction from source directory paths
//!
//! Rules apply in declared order and the first match wins; the fall-through
//! rule (directory basename as title) always matches last. An
//! `.author-override` marker file in any ancestor pins the author for all
//! descendants and outranks every other metadata source.

use crate::models::{HintSet, SourceBook};
use lazy_static::lazy_static;
use regex::Regex;
use std::path::Path;

/// Words that never form an author name on their own
const STOP_WORDS: &[&str] = &["the", "of", "a", "an", "and"];

/// Marker file pinning the author for a subtree
pub const AUTHOR_OVERRIDE_MARKER: &str = ".author-override";

lazy_static! {
    // A: "Author - Series N - Title" with optional trailing "(YYYY)"
    static ref RULE_SERIES: Regex = Regex::new(
        r"^(?P<author>.+?)\s+-\s+(?P<series>.+?)\s+(?P<pos>\d{1,3}(?:\.\d+)?)\s+-\s+(?P<title>.+?)(?:\s+\((?P<year>\d{4})\))?$"
    )
    .unwrap();
    // B: "Author - Title"
    static ref RULE_AUTHOR_TITLE: Regex =
        Regex::new(r"^(?P<author>.+?)\s+-\s+(?P<title>.+)$").unwrap();
    // C: "Title [ASIN]"
    static ref RULE_ASIN: Regex =
        Regex::new(r"^(?P<title>.+?)\s*\[(?P<asin>B[0-9A-Z]{9})\]$").unwrap();
    // D: "Title (YYYY)"
    static ref RULE_YEAR: Regex = Regex::new(r"^(?P<title>.+?)\s*\((?P<year>\d{4})\)$").unwrap();
    // E: "Title (Series N)"
    static ref RULE_PAREN_SERIES: Regex =
        Regex::new(r"^(?P<title>.+?)\s*\((?P<series>.+?)\s+(?P<pos>\d{1,3}(?:\.\d+)?)\)$").unwrap();
    // F: "[01] Title"
    static ref RULE_BRACKET_POS: Regex =
        Regex::new(r"^\[(?P<pos>\d{1,3})\]\s*(?P<title>.+)$").unwrap();
    static ref PURE_NUMBER: Regex = Regex::new(r"^\d+(?:\.\d+)?$").unwrap();
}

/// Parse hints for a discovered book, applying the override marker last
pub fn parse_hints(book: &SourceBook) -> HintSet {
    let dir_name = book.dir_name();
    let mut hints = parse_dir_name(&dir_name);

    // G: an author-only directory whose audio sits in a nested folder; the
    // nested folder supplies the title. Only the fall-through rule leaves
    // the title equal to the raw directory name.
    if hints.author.is_empty() && hints.title == dir_name {
        if let Some(nested) = nested_title(book) {
            if accept_author(&dir_name) {
                hints = HintSet {
                    author: dir_name,
                    title: nested,
                    ..Default::default()
                };
            }
        }
    }

    if let Some(author) = find_author_override(&book.source_dir) {
        hints.author = author;
        hints.author_pinned = true;
    }

    hints
}

/// Apply the name rules in order to a directory basename
pub fn parse_dir_name(name: &str) -> HintSet {
    let name = name.trim();

    if let Some(caps) = RULE_SERIES.captures(name) {
        let author = caps["author"].trim().to_string();
        if accept_author(&author) {
            return HintSet {
                author,
                series: caps["series"].trim().to_string(),
                position: clean_position(&caps["pos"]),
                title: caps["title"].trim().to_string(),
                year: caps
                    .name("year")
                    .map(|m| m.as_str().to_string())
                    .unwrap_or_default(),
                ..Default::default()
            };
        }
    }

    if let Some(caps) = RULE_AUTHOR_TITLE.captures(name) {
        let left = caps["author"].trim().to_string();
        let right = caps["title"].trim().to_string();
        let (author, title) = orient_author_title(left, right);
        if accept_author(&author) && !PURE_NUMBER.is_match(&title) && !PURE_NUMBER.is_match(&author)
        {
            return HintSet {
                author,
                title,
                ..Default::default()
            };
        }
    }

    if let Some(caps) = RULE_ASIN.captures(name) {
        // The bracketed token contributes the asin only.
        return HintSet {
            title: caps["title"].trim().to_string(),
            asin: caps["asin"].to_string(),
            ..Default::default()
        };
    }

    if let Some(caps) = RULE_YEAR.captures(name) {
        return HintSet {
            title: caps["title"].trim().to_string(),
            year: caps["year"].to_string(),
            ..Default::default()
        };
    }

    if let Some(caps) = RULE_PAREN_SERIES.captures(name) {
        return HintSet {
            title: caps["title"].trim().to_string(),
            series: caps["series"].trim().to_string(),
            position: clean_position(&caps["pos"]),
            ..Default::default()
        };
    }

    if let Some(caps) = RULE_BRACKET_POS.captures(name) {
        return HintSet {
            title: caps["title"].trim().to_string(),
            position: clean_position(&caps["pos"]),
            ..Default::default()
        };
    }

    // Fall-through: the basename is the title.
    HintSet {
        title: name.to_string(),
        ..Default::default()
    }
}

/// Orient a two-part dash split.
///
/// Titles lead with articles far more often than author names do, so
/// "The Alchemist - Paulo Coelho" puts the author on the right. A left
/// side that is nothing but stop words stays put and fails the author
/// check instead.
fn orient_author_title(left: String, right: String) -> (String, String) {
    let left_article = starts_with_article(&left) && !all_stop_words(&left);
    let right_article = starts_with_article(&right);
    if left_article && !right_article {
        (right, left)
    } else {
        (left, right)
    }
}

fn all_stop_words(s: &str) -> bool {
    let mut any = false;
    for word in s.split_whitespace() {
        if !STOP_WORDS.contains(&word.to_lowercase().as_str()) {
            return false;
        }
        any = true;
    }
    any
}

fn starts_with_article(s: &str) -> bool {
    s.split_whitespace()
        .next()
        .map(|first| {
            let lower = first.to_lowercase();
            lower == "the" || lower == "a" || lower == "an"
        })
        .unwrap_or(false)
}

/// Reject author candidates that are a year or made only of stop words
fn accept_author(candidate: &str) -> bool {
    let trimmed = candidate.trim();
    if trimmed.is_empty() {
        return false;
    }
    if trimmed.len() == 4 && trimmed.chars().all(|c| c.is_ascii_digit()) {
        return false;
    }
    if PURE_NUMBER.is_match(trimmed) {
        return false;
    }
    !all_stop_words(trimmed)
}

/// Strip leading zeros but keep fractional positions ("01" → "1", "1.5" stays)
fn clean_position(pos: &str) -> String {
    if let Some((whole, frac)) = pos.split_once('.') {
        let whole = whole.trim_start_matches('0');
        let whole = if whole.is_empty() { "0" } else { whole };
        format!("{}.{}", whole, frac)
    } else {
        let stripped = pos.trim_start_matches('0');
        if stripped.is_empty() {
            "0".to_string()
        } else {
            stripped.to_string()
        }
    }
}

/// Title from the audio files' own directory when it differs from the root
fn nested_title(book: &SourceBook) -> Option<String> {
    let parent = book.audio_files.first()?.parent()?;
    if parent == book.source_dir {
        return None;
    }
    let name = parent.file_name()?.to_string_lossy().to_string();
    // Disc folders are not titles.
    if name.to_lowercase().starts_with("cd") || name.to_lowercase().starts_with("disc") {
        return None;
    }
    Some(name)
}

/// Look for the override marker in the source directory and its ancestors
pub fn find_author_override(source_dir: &Path) -> Option<String> {
    let mut current = Some(source_dir);
    while let Some(dir) = current {
        let marker = dir.join(AUTHOR_OVERRIDE_MARKER);
        if marker.is_file() {
            match std::fs::read_to_string(&marker) {
                Ok(content) => {
                    let author = content.lines().next().unwrap_or("").trim().to_string();
                    if !author.is_empty() {
                        tracing::debug!(
                            "Author pinned to {:?} by {}",
                            author,
                            marker.display()
                        );
                        return Some(author);
                    }
                }
                Err(e) => {
                    tracing::warn!("Unreadable override marker {}: {}", marker.display(), e);
                }
            }
        }
        current = dir.parent();
    }
    None
}
