//! Metadata fusion engine
//!
//! Decides one identity per book from four sources, in falling precedence:
//! the `.author-override` marker (author only), the LLM opinion, the best
//! catalog candidate, then path/tag hints. Every source may be absent; a
//! book with nothing but a folder name still resolves to a title.

use crate::audio::Prober;
use crate::metadata::catalog::{best_match, rank_candidates, CatalogClient, CatalogRegion};
use crate::metadata::llm::{LlmResolver, ResolveRequest};
use crate::metadata::{path_parser, tags};
use crate::models::{CatalogCandidate, Config, HintSet, ScoredCandidate, SourceBook};
use anyhow::Result;

/// Result of resolving one book
#[derive(Debug, Clone)]
pub struct ResolutionOutcome {
    /// Final identity; empty fields stay empty
    pub identity: HintSet,
    /// The catalog candidate the identity came from, when one was accepted
    pub candidate: Option<CatalogCandidate>,
    /// Zero-pad width for series positions in destination folders
    pub position_pad: usize,
}

/// Fusion engine over the catalog client and the LLM resolver
pub struct MetadataResolver {
    catalog: Option<CatalogClient>,
    llm: Option<LlmResolver>,
    threshold: f64,
    dominance_margin: f64,
    resolve_all: bool,
}

impl MetadataResolver {
    pub fn from_config(config: &Config) -> Result<Self> {
        let catalog = if config.catalog.enabled {
            Some(CatalogClient::new(
                CatalogRegion::from_str(&config.catalog.region),
                config.catalog.timeout_s,
            )?)
        } else {
            None
        };

        let llm = LlmResolver::from_config(&config.llm)?;

        Ok(Self {
            catalog,
            llm,
            threshold: config.catalog.threshold,
            dominance_margin: config.llm.dominance_margin,
            resolve_all: config.llm.resolve_all,
        })
    }

    /// Resolve one book's identity
    pub async fn resolve(
        &self,
        book: &SourceBook,
        prober: &Prober,
        asin_override: Option<&str>,
    ) -> Result<ResolutionOutcome> {
        let path_hints = path_parser::parse_hints(book);
        let tag_hints = match book.audio_files.first() {
            Some(first) => tags::extract_tag_hints(first, prober).await?,
            None => HintSet::default(),
        };

        let mut merged = path_hints.clone();
        merged.merge_missing(&tag_hints);

        // An explicit ASIN bypasses search entirely; the hints only break
        // ties, they never override the catalog record.
        let asin = asin_override
            .map(|s| s.to_string())
            .or_else(|| {
                if merged.asin.is_empty() {
                    None
                } else {
                    Some(merged.asin.clone())
                }
            });

        let scored: Vec<ScoredCandidate> = match (&self.catalog, &asin) {
            (Some(catalog), Some(asin)) => catalog
                .fetch_by_asin(asin)
                .await
                .map(|candidate| {
                    vec![ScoredCandidate {
                        score: 1.0,
                        candidate,
                    }]
                })
                .unwrap_or_default(),
            (Some(catalog), None) => {
                let candidates = catalog.search(&merged).await;
                rank_candidates(candidates, &merged)
            }
            (None, _) => Vec::new(),
        };

        let accepted = best_match(&scored, self.threshold).cloned();

        let llm_opinion = if self.should_ask_llm(&scored, &path_hints, &tag_hints) {
            self.ask_llm(book, &path_hints, &tag_hints, &scored).await
        } else {
            None
        };

        let identity = compose_identity(&merged, accepted.as_ref(), llm_opinion.as_ref());
        let position_pad = position_pad(&scored);

        let candidate = match llm_opinion {
            // When the LLM picked, keep whichever candidate it agrees with
            // so cover art and narrator still come from the catalog.
            Some(ref opinion) => scored
                .iter()
                .find(|s| s.candidate.title.eq_ignore_ascii_case(&opinion.title))
                .map(|s| s.candidate.clone())
                .or(accepted.map(|s| s.candidate)),
            None => accepted.map(|s| s.candidate),
        };

        tracing::info!(
            "Resolved {:?}: author={:?} title={:?} series={:?}",
            book.dir_name(),
            identity.author,
            identity.title,
            identity.series
        );

        Ok(ResolutionOutcome {
            identity,
            candidate,
            position_pad,
        })
    }

    /// Fetch a candidate's cover through the catalog client
    pub async fn download_cover(&self, url: &str, dest: &std::path::Path) -> Result<()> {
        match &self.catalog {
            Some(catalog) => catalog.download_cover(url, dest).await,
            None => anyhow::bail!("catalog disabled"),
        }
    }

    /// LLM triggers: ambiguity, a source conflict, or resolve-all
    fn should_ask_llm(
        &self,
        scored: &[ScoredCandidate],
        path_hints: &HintSet,
        tag_hints: &HintSet,
    ) -> bool {
        if self.llm.is_none() {
            return false;
        }
        if self.resolve_all {
            return true;
        }
        if path_hints.author_conflicts_with(tag_hints) {
            return true;
        }
        if scored.len() >= 2 {
            let margin = scored[0].score - scored[1].score;
            if margin < self.dominance_margin {
                return true;
            }
        }
        false
    }

    async fn ask_llm(
        &self,
        book: &SourceBook,
        path_hints: &HintSet,
        tag_hints: &HintSet,
        scored: &[ScoredCandidate],
    ) -> Option<HintSet> {
        let llm = self.llm.as_ref()?;
        let dir_name = book.dir_name();
        let request = ResolveRequest {
            dir_name: &dir_name,
            path_hints,
            tag_hints,
            candidates: scored,
        };

        // With complete hints and several close candidates, picking one is
        // a cheaper question than re-deriving the identity.
        if path_hints.has_author() && path_hints.has_title() && scored.len() >= 2 {
            if let Some(index) = llm.disambiguate(&request).await {
                return Some(candidate_to_hints(&scored[index].candidate));
            }
        }

        llm.resolve(&request).await
    }
}

/// Layer the sources into one identity
fn compose_identity(
    merged: &HintSet,
    accepted: Option<&ScoredCandidate>,
    llm_opinion: Option<&HintSet>,
) -> HintSet {
    let mut identity = match llm_opinion {
        Some(opinion) => {
            let mut id = opinion.clone();
            if let Some(scored) = accepted {
                id.merge_missing(&candidate_to_hints(&scored.candidate));
            }
            id
        }
        None => match accepted {
            Some(scored) => candidate_to_hints(&scored.candidate),
            None => HintSet::default(),
        },
    };

    identity.merge_missing(merged);

    // The override marker outranks everything for the author field.
    if merged.author_pinned {
        identity.author = merged.author.clone();
        identity.author_pinned = true;
    }

    identity
}

fn candidate_to_hints(candidate: &CatalogCandidate) -> HintSet {
    HintSet {
        author: candidate.primary_author().unwrap_or("").to_string(),
        title: candidate.title.clone(),
        series: candidate.series.clone(),
        position: candidate.position.clone(),
        year: candidate.year.map(|y| y.to_string()).unwrap_or_default(),
        asin: candidate.asin.clone(),
        author_pinned: false,
    }
}

/// Pad positions to 3 digits when any candidate shows a series that long
fn position_pad(scored: &[ScoredCandidate]) -> usize {
    let long_series = scored.iter().any(|s| {
        s.candidate.series_book_count.map(|n| n >= 100).unwrap_or(false)
            || s.candidate
                .position
                .split('.')
                .next()
                .and_then(|p| p.parse::<u32>().ok())
                .map(|p| p >= 100)
                .unwrap_or(false)
    });
    if long_series {
        3
    } else {
        2
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(title: &str, author: &str, series: &str, position: &str) -> CatalogCandidate {
        CatalogCandidate {
            asin: "B000000001".to_string(),
            title: title.to_string(),
            authors: vec![author.to_string()],
            series: series.to_string(),
            position: position.to_string(),
            year: Some(2006),
            cover_url: None,
            narrators: vec![],
            publisher_summary: None,
            series_book_count: None,
        }
    }

    #[test]
    fn test_compose_catalog_only() {
        let merged = HintSet {
            title: "final empire".to_string(),
            ..Default::default()
        };
        let scored = ScoredCandidate {
            score: 0.9,
            candidate: candidate("The Final Empire", "Brandon Sanderson", "Mistborn", "1"),
        };

        let identity = compose_identity(&merged, Some(&scored), None);
        assert_eq!(identity.author, "Brandon Sanderson");
        assert_eq!(identity.title, "The Final Empire");
        assert_eq!(identity.series, "Mistborn");
        assert_eq!(identity.asin, "B000000001");
    }

    #[test]
    fn test_compose_llm_overrides_catalog() {
        let merged = HintSet::default();
        let scored = ScoredCandidate {
            score: 0.9,
            candidate: candidate("Wrong Edition", "Brandon Sanderson", "Mistborn", "1"),
        };
        let opinion = HintSet {
            author: "Brandon Sanderson".to_string(),
            title: "The Final Empire".to_string(),
            ..Default::default()
        };

        let identity = compose_identity(&merged, Some(&scored), Some(&opinion));
        assert_eq!(identity.title, "The Final Empire");
        // Missing fields still fill from the candidate.
        assert_eq!(identity.series, "Mistborn");
    }

    #[test]
    fn test_compose_pinned_author_wins() {
        let merged = HintSet {
            author: "Pinned Person".to_string(),
            author_pinned: true,
            ..Default::default()
        };
        let scored = ScoredCandidate {
            score: 0.95,
            candidate: candidate("Some Title", "Catalog Author", "", ""),
        };

        let identity = compose_identity(&merged, Some(&scored), None);
        assert_eq!(identity.author, "Pinned Person");
        assert_eq!(identity.title, "Some Title");
    }

    #[test]
    fn test_compose_fallback_to_hints() {
        let merged = HintSet {
            author: "Paulo Coelho".to_string(),
            title: "The Alchemist".to_string(),
            ..Default::default()
        };

        let identity = compose_identity(&merged, None, None);
        assert_eq!(identity.author, "Paulo Coelho");
        assert_eq!(identity.title, "The Alchemist");
    }

    #[test]
    fn test_position_pad_widens_for_long_series() {
        let short = vec![ScoredCandidate {
            score: 0.9,
            candidate: candidate("T", "A", "S", "7"),
        }];
        assert_eq!(position_pad(&short), 2);

        let long = vec![ScoredCandidate {
            score: 0.9,
            candidate: candidate("T", "A", "S", "131"),
        }];
        assert_eq!(position_pad(&long), 3);
    }
}
