//! Metadata hint tuple shared by the parser, tag extractor, and resolver

use serde::{Deserialize, Serialize};

/// `(author, title, series, position, year)` with empty strings for unknowns.
///
/// `asin` rides along when a source can supply one; `author_pinned` marks an
/// author that came from a `.author-override` marker and must not be
/// replaced by any later source.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HintSet {
    pub author: String,
    pub title: String,
    pub series: String,
    pub position: String,
    pub year: String,
    pub asin: String,
    #[serde(default)]
    pub author_pinned: bool,
}

impl HintSet {
    pub fn is_empty(&self) -> bool {
        self.author.is_empty()
            && self.title.is_empty()
            && self.series.is_empty()
            && self.position.is_empty()
            && self.year.is_empty()
            && self.asin.is_empty()
    }

    pub fn has_author(&self) -> bool {
        !self.author.is_empty()
    }

    pub fn has_title(&self) -> bool {
        !self.title.is_empty()
    }

    /// Fill unknown fields from another source, keeping existing values
    pub fn merge_missing(&mut self, other: &HintSet) {
        if self.author.is_empty() {
            self.author = other.author.clone();
        }
        if self.title.is_empty() {
            self.title = other.title.clone();
        }
        if self.series.is_empty() {
            self.series = other.series.clone();
        }
        if self.position.is_empty() {
            self.position = other.position.clone();
        }
        if self.year.is_empty() {
            self.year = other.year.clone();
        }
        if self.asin.is_empty() {
            self.asin = other.asin.clone();
        }
        self.author_pinned |= other.author_pinned;
    }

    /// Whether both sets name an author and they disagree after folding case
    pub fn author_conflicts_with(&self, other: &HintSet) -> bool {
        self.has_author()
            && other.has_author()
            && !self.author.eq_ignore_ascii_case(&other.author)
    }
}
