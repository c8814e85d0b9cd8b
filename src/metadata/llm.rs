//! LLM disambiguator over an OpenAI-compatible chat endpoint
//!
//! The model is a tiebreaker, not an authority: any malformed or failed
//! response is treated as "no opinion" and the pipeline falls back to the
//! best catalog candidate.

use crate::models::config::LlmConfig;
use crate::models::{HintSet, ScoredCandidate};
use anyhow::{Context, Result};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Token caps keep responses terse and cheap
const RESOLVE_MAX_TOKENS: u32 = 150;
const DISAMBIGUATE_MAX_TOKENS: u32 = 10;
const TEMPERATURE: f32 = 0.1;

/// Directory names are untrusted input; bound what reaches the prompt
const MAX_DIR_NAME_CHARS: usize = 200;

/// Everything the resolver can show the model for one book
pub struct ResolveRequest<'a> {
    pub dir_name: &'a str,
    pub path_hints: &'a HintSet,
    pub tag_hints: &'a HintSet,
    pub candidates: &'a [ScoredCandidate],
}

/// Chat-completion client
pub struct LlmResolver {
    client: Client,
    base_url: String,
    api_key: String,
    model: String,
}

impl LlmResolver {
    /// Build from config; `None` when disabled or no key is available
    pub fn from_config(config: &LlmConfig) -> Result<Option<Self>> {
        if !config.enabled {
            return Ok(None);
        }

        let api_key = config
            .api_key
            .clone()
            .or_else(|| std::env::var("SHEPHERD_LLM_API_KEY").ok());
        let Some(api_key) = api_key else {
            tracing::warn!("LLM resolution enabled but no API key configured; skipping");
            return Ok(None);
        };

        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_s))
            .user_agent("audiobook-shepherd")
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Some(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key,
            model: config.model.clone(),
        }))
    }

    /// Fuse conflicting sources into one identity; `None` = no opinion
    pub async fn resolve(&self, request: &ResolveRequest<'_>) -> Option<HintSet> {
        let prompt = build_resolve_prompt(request);

        let content = self
            .complete(&prompt, RESOLVE_MAX_TOKENS)
            .await
            .map_err(|e| tracing::warn!("LLM resolve failed: {}", e))
            .ok()?;

        let hints = parse_labeled_response(&content);
        if hints.is_empty() {
            tracing::debug!("LLM response carried no labeled fields; ignoring");
            None
        } else {
            Some(hints)
        }
    }

    /// Pick one of several close candidates; `None` = no opinion
    pub async fn disambiguate(&self, request: &ResolveRequest<'_>) -> Option<usize> {
        let prompt = build_disambiguate_prompt(request);

        let content = self
            .complete(&prompt, DISAMBIGUATE_MAX_TOKENS)
            .await
            .map_err(|e| tracing::warn!("LLM disambiguate failed: {}", e))
            .ok()?;

        let index: usize = content
            .trim()
            .trim_matches(|c: char| !c.is_ascii_digit())
            .parse()
            .ok()?;

        if index >= 1 && index <= request.candidates.len() {
            Some(index - 1)
        } else {
            None
        }
    }

    async fn complete(&self, prompt: &str, max_tokens: u32) -> Result<String> {
        // A fresh nonce per call defeats semantic caches on proxy layers
        // that would otherwise replay an answer for a different book.
        let nonce = uuid::Uuid::new_v4().simple().to_string();
        let content = format!("[request-id: {}]\n{}", nonce, prompt);

        let body = ChatRequest {
            model: &self.model,
            messages: vec![ChatMessage {
                role: "user",
                content: &content,
            }],
            temperature: TEMPERATURE,
            max_tokens,
        };

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .header("Cache-Control", "no-cache")
            .json(&body)
            .send()
            .await
            .context("LLM request failed")?;

        if !response.status().is_success() {
            anyhow::bail!("LLM endpoint returned {}", response.status());
        }

        let parsed: ChatResponse = response.json().await.context("Unparseable LLM response")?;
        parsed
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .context("LLM response had no choices")
    }
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
    max_tokens: u32,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatResponseMessage,
}

#[derive(Deserialize)]
struct ChatResponseMessage {
    content: String,
}

/// Strip newlines and bound the length of untrusted directory names
fn sanitize_for_prompt(name: &str) -> String {
    let flat: String = name
        .chars()
        .map(|c| if c == '\n' || c == '\r' { ' ' } else { c })
        .collect();
    flat.chars().take(MAX_DIR_NAME_CHARS).collect()
}

fn describe_hints(label: &str, hints: &HintSet) -> String {
    format!(
        "{}: author={:?} title={:?} series={:?} position={:?} year={:?}\n",
        label, hints.author, hints.title, hints.series, hints.position, hints.year
    )
}

fn describe_candidates(candidates: &[ScoredCandidate]) -> String {
    let mut out = String::new();
    for (i, scored) in candidates.iter().take(5).enumerate() {
        let c = &scored.candidate;
        out.push_str(&format!(
            "{}. {:?} by {:?} (series {:?} #{:?}, score {:.2})\n",
            i + 1,
            c.title,
            c.authors.join(", "),
            c.series,
            c.position,
            scored.score
        ));
    }
    out
}

fn build_resolve_prompt(request: &ResolveRequest<'_>) -> String {
    let mut prompt = String::from(
        "You are identifying an audiobook from conflicting metadata sources.\n\
         Answer with exactly four lines and nothing else:\n\
         AUTHOR: <author>\nTITLE: <title>\nSERIES: <series or blank>\nPOSITION: <number or blank>\n\n",
    );
    prompt.push_str(&format!(
        "Source folder name: {:?}\n",
        sanitize_for_prompt(request.dir_name)
    ));
    prompt.push_str(&describe_hints("Parsed from path", request.path_hints));
    prompt.push_str(&describe_hints("Embedded tags", request.tag_hints));
    if !request.candidates.is_empty() {
        prompt.push_str("Catalog candidates:\n");
        prompt.push_str(&describe_candidates(request.candidates));
    }
    prompt
}

fn build_disambiguate_prompt(request: &ResolveRequest<'_>) -> String {
    let mut prompt = String::from(
        "Pick the catalog entry that matches this audiobook. \
         Answer with the number only.\n\n",
    );
    prompt.push_str(&format!(
        "Source folder name: {:?}\n",
        sanitize_for_prompt(request.dir_name)
    ));
    prompt.push_str(&describe_hints("Parsed from path", request.path_hints));
    prompt.push_str("Candidates:\n");
    prompt.push_str(&describe_candidates(request.candidates));
    prompt
}

/// Extract labeled lines from a model response, tolerating markdown fences,
/// leading whitespace, and trailing commentary
pub fn parse_labeled_response(content: &str) -> HintSet {
    let mut hints = HintSet::default();

    for line in content.lines() {
        let line = line.trim().trim_start_matches(['`', '*', '-', '>']).trim();
        let Some((label, value)) = line.split_once(':') else {
            continue;
        };

        let value = value.trim().trim_matches(['"', '*', '`']).trim().to_string();
        match label.trim().to_uppercase().as_str() {
            "AUTHOR" => hints.author = value,
            "TITLE" => hints.title = value,
            "SERIES" => hints.series = value,
            "POSITION" => hints.position = value,
            _ => {}
        }
    }

    hints
}
