//! Audiobook catalog client and candidate scoring

use crate::models::{CatalogCandidate, HintSet, ScoredCandidate};
use anyhow::{Context, Result};
use reqwest::Client;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Score weights: title dominates, author second, position a tiebreaker
const TITLE_WEIGHT: f64 = 0.6;
const AUTHOR_WEIGHT: f64 = 0.3;
const POSITION_WEIGHT: f64 = 0.1;

/// 5xx responses are retried this many times with doubling delay
const MAX_ATTEMPTS: u32 = 3;

/// Pagination is capped; more results only dilute the scorer
const MAX_RESULTS: &str = "10";

/// Catalog regional endpoints
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CatalogRegion {
    Us,
    Uk,
    Ca,
    Au,
    Fr,
    De,
    Jp,
    It,
    In,
    Es,
}

impl CatalogRegion {
    pub fn from_str(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "uk" => CatalogRegion::Uk,
            "ca" => CatalogRegion::Ca,
            "au" => CatalogRegion::Au,
            "fr" => CatalogRegion::Fr,
            "de" => CatalogRegion::De,
            "jp" => CatalogRegion::Jp,
            "it" => CatalogRegion::It,
            "in" => CatalogRegion::In,
            "es" => CatalogRegion::Es,
            _ => CatalogRegion::Us,
        }
    }

    /// Top-level domain suffix of the regional API host
    pub fn tld(&self) -> &'static str {
        match self {
            CatalogRegion::Us => ".com",
            CatalogRegion::Uk => ".co.uk",
            CatalogRegion::Ca => ".ca",
            CatalogRegion::Au => ".com.au",
            CatalogRegion::Fr => ".fr",
            CatalogRegion::De => ".de",
            CatalogRegion::Jp => ".co.jp",
            CatalogRegion::It => ".it",
            CatalogRegion::In => ".in",
            CatalogRegion::Es => ".es",
        }
    }
}

/// Catalog search client.
///
/// Transport failures never propagate out of `search`; a catalog outage
/// degrades the pipeline to path/tag resolution instead of failing books.
pub struct CatalogClient {
    client: Client,
    region: CatalogRegion,
}

impl CatalogClient {
    pub fn new(region: CatalogRegion, timeout_s: u64) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(timeout_s))
            .user_agent("audiobook-shepherd")
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self { client, region })
    }

    fn base_url(&self) -> String {
        format!("https://api.audible{}/1.0/catalog/products", self.region.tld())
    }

    /// Search by hint tuple; empty on any transport problem
    pub async fn search(&self, hints: &HintSet) -> Vec<CatalogCandidate> {
        if hints.title.is_empty() && hints.author.is_empty() {
            return Vec::new();
        }

        let mut params: Vec<(&str, &str)> = vec![
            ("num_results", MAX_RESULTS),
            ("products_sort_by", "Relevance"),
            (
                "response_groups",
                "contributors,series,media,product_desc,product_attrs",
            ),
        ];
        if !hints.title.is_empty() {
            params.push(("title", &hints.title));
        }
        if !hints.author.is_empty() {
            params.push(("author", &hints.author));
        }

        tracing::debug!(
            "Catalog search: title={:?} author={:?}",
            hints.title,
            hints.author
        );

        match self.get_with_backoff(&self.base_url(), &params).await {
            Ok(response) => response
                .products
                .into_iter()
                .filter_map(convert_product)
                .collect(),
            Err(e) => {
                tracing::warn!("Catalog search failed, continuing without it: {}", e);
                Vec::new()
            }
        }
    }

    /// Fetch one candidate by ASIN; None on failure or unknown ASIN
    pub async fn fetch_by_asin(&self, asin: &str) -> Option<CatalogCandidate> {
        let url = format!("{}/{}", self.base_url(), asin);
        let params = [(
            "response_groups",
            "contributors,series,media,product_desc,product_attrs",
        )];

        match self.get_one_with_backoff(&url, &params).await {
            Ok(response) => convert_product(response.product),
            Err(e) => {
                tracing::warn!("Catalog lookup for ASIN {} failed: {}", asin, e);
                None
            }
        }
    }

    /// Download a candidate's cover image
    pub async fn download_cover(&self, cover_url: &str, dest_path: &Path) -> Result<()> {
        tracing::debug!("Downloading cover from {}", cover_url);

        let response = self
            .client
            .get(cover_url)
            .send()
            .await
            .context("Failed to download cover")?;

        if !response.status().is_success() {
            anyhow::bail!("Cover download failed: {}", response.status());
        }

        let bytes = response.bytes().await.context("Failed to read cover bytes")?;
        std::fs::write(dest_path, bytes).context("Failed to write cover file")?;
        Ok(())
    }

    async fn get_with_backoff(
        &self,
        url: &str,
        params: &[(&str, &str)],
    ) -> Result<SearchResponse> {
        self.request_with_backoff(url, params).await
    }

    async fn get_one_with_backoff(
        &self,
        url: &str,
        params: &[(&str, &str)],
    ) -> Result<ProductResponse> {
        self.request_with_backoff(url, params).await
    }

    async fn request_with_backoff<T: serde::de::DeserializeOwned>(
        &self,
        url: &str,
        params: &[(&str, &str)],
    ) -> Result<T> {
        let mut delay = Duration::from_secs(1);
        let mut last_err = None;

        for attempt in 1..=MAX_ATTEMPTS {
            match self.client.get(url).query(params).send().await {
                Ok(response) if response.status().is_server_error() => {
                    last_err = Some(anyhow::anyhow!("server error {}", response.status()));
                    if attempt < MAX_ATTEMPTS {
                        tracing::debug!(
                            "Catalog returned {}, retrying in {:?}",
                            response.status(),
                            delay
                        );
                        tokio::time::sleep(delay).await;
                        delay *= 2;
                    }
                }
                Ok(response) if !response.status().is_success() => {
                    anyhow::bail!("catalog returned status {}", response.status());
                }
                Ok(response) => {
                    return response.json().await.context("Failed to parse catalog response");
                }
                Err(e) => {
                    // Connection-level failure: not worth a backoff loop.
                    return Err(e).context("Catalog request failed");
                }
            }
        }

        Err(last_err.unwrap_or_else(|| anyhow::anyhow!("catalog request failed")))
    }
}

// Catalog API response structures

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    products: Vec<Product>,
}

#[derive(Debug, Deserialize)]
struct ProductResponse {
    product: Product,
}

#[derive(Debug, Deserialize)]
struct Product {
    asin: String,
    title: Option<String>,
    #[serde(default)]
    authors: Vec<Person>,
    #[serde(default)]
    narrators: Vec<Person>,
    #[serde(default)]
    series: Vec<Series>,
    release_date: Option<String>,
    publisher_summary: Option<String>,
    product_images: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct Person {
    name: String,
}

#[derive(Debug, Deserialize)]
struct Series {
    title: String,
    sequence: Option<String>,
}

fn convert_product(product: Product) -> Option<CatalogCandidate> {
    let title = product.title?;

    let year = product
        .release_date
        .as_deref()
        .and_then(|d| d.split('-').next())
        .and_then(|y| y.parse::<u32>().ok());

    // Prefer the largest available image.
    let cover_url = product.product_images.as_ref().and_then(|images| {
        images
            .get("500")
            .or_else(|| images.get("250"))
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
    });

    let (series, position) = product
        .series
        .first()
        .map(|s| {
            (
                s.title.clone(),
                s.sequence.as_deref().map(clean_sequence).unwrap_or_default(),
            )
        })
        .unwrap_or_default();

    Some(CatalogCandidate {
        asin: product.asin,
        title,
        authors: product.authors.into_iter().map(|a| a.name).collect(),
        series,
        position,
        year,
        cover_url,
        narrators: product.narrators.into_iter().map(|n| n.name).collect(),
        publisher_summary: product.publisher_summary,
        series_book_count: None,
    })
}

/// Extract the numeric part of a series sequence ("Book 1" → "1")
fn clean_sequence(sequence: &str) -> String {
    use lazy_static::lazy_static;
    use regex::Regex;

    lazy_static! {
        static ref SEQ_REGEX: Regex = Regex::new(r"(\d+(?:\.\d+)?)").unwrap();
    }

    SEQ_REGEX
        .captures(sequence)
        .and_then(|cap| cap.get(1))
        .map(|m| m.as_str().to_string())
        .unwrap_or_else(|| sequence.to_string())
}

// Candidate scoring

/// Normalized similarity of two strings (1.0 = identical)
fn similarity(a: &str, b: &str) -> f64 {
    strsim::normalized_levenshtein(&normalize(a), &normalize(b))
}

fn normalize(s: &str) -> String {
    let mut normalized = s.to_lowercase().trim().to_string();
    if let Some(stripped) = normalized.strip_prefix("the ") {
        normalized = stripped.to_string();
    }
    normalized.retain(|c| c.is_alphanumeric() || c.is_whitespace());
    normalized
}

/// Score one candidate against the hint tuple.
///
/// Components the hints cannot judge (empty fields) contribute a neutral
/// 0.5 so an unknown author neither promotes nor kills a candidate.
pub fn score_candidate(candidate: &CatalogCandidate, hints: &HintSet) -> f64 {
    let title_sim = if hints.title.is_empty() {
        0.5
    } else {
        similarity(&hints.title, &candidate.title)
    };

    let author_sim = if hints.author.is_empty() {
        0.5
    } else {
        candidate
            .authors
            .iter()
            .map(|a| similarity(&hints.author, a))
            .fold(0.0, f64::max)
    };

    let position_sim = if hints.position.is_empty() || candidate.position.is_empty() {
        0.5
    } else if hints.position == candidate.position {
        1.0
    } else {
        0.0
    };

    TITLE_WEIGHT * title_sim + AUTHOR_WEIGHT * author_sim + POSITION_WEIGHT * position_sim
}

/// Score and sort candidates, best first
pub fn rank_candidates(candidates: Vec<CatalogCandidate>, hints: &HintSet) -> Vec<ScoredCandidate> {
    let mut scored: Vec<ScoredCandidate> = candidates
        .into_iter()
        .map(|candidate| ScoredCandidate {
            score: score_candidate(&candidate, hints),
            candidate,
        })
        .collect();

    scored.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
    scored
}

/// Best candidate above the acceptance threshold, if any
pub fn best_match(scored: &[ScoredCandidate], threshold: f64) -> Option<&ScoredCandidate> {
    scored.first().filter(|s| s.score >= threshold)
}
