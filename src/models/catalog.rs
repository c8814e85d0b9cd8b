//! Catalog candidate models

use serde::{Deserialize, Serialize};

/// One result from a catalog search
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogCandidate {
    pub asin: String,
    pub title: String,
    pub authors: Vec<String>,
    /// Primary series name, empty when standalone
    #[serde(default)]
    pub series: String,
    /// Position within the series ("1", "1.5", ...), empty when standalone
    #[serde(default)]
    pub position: String,
    pub year: Option<u32>,
    pub cover_url: Option<String>,
    #[serde(default)]
    pub narrators: Vec<String>,
    pub publisher_summary: Option<String>,
    /// Known series length, when the catalog exposes it
    pub series_book_count: Option<u32>,
}

impl CatalogCandidate {
    pub fn primary_author(&self) -> Option<&str> {
        self.authors.first().map(|s| s.as_str())
    }

    pub fn has_series(&self) -> bool {
        !self.series.is_empty()
    }
}

/// A candidate together with its fuzzy score against the hint tuple
#[derive(Debug, Clone)]
pub struct ScoredCandidate {
    pub candidate: CatalogCandidate,
    pub score: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_primary_author() {
        let candidate = CatalogCandidate {
            asin: "B00TEST0001".to_string(),
            title: "Example".to_string(),
            authors: vec!["First Author".to_string(), "Second Author".to_string()],
            series: String::new(),
            position: String::new(),
            year: Some(2020),
            cover_url: None,
            narrators: vec![],
            publisher_summary: None,
            series_book_count: None,
        };

        assert_eq!(candidate.primary_author(), Some("First Author"));
        assert!(!candidate.has_series());
    }
}
