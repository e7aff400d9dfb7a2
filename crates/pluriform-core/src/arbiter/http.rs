//! HTTP arbiter over an OpenAI-compatible chat completions endpoint

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;

use super::{ArbiterDecision, ArbiterError, ArticleCapsule, CandidateCapsule, EventArbiter};

// ============================================================================
// CONFIGURATION
// ============================================================================

/// Configuration for the LLM arbitration step
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct LlmConfig {
    /// Enable LLM-based final decision for event assignment
    pub enabled: bool,
    /// Number of top-scoring candidates presented per decision
    pub top_n: usize,
    /// Minimum boosted score for a candidate to be presented
    pub min_score: f32,
    /// Chat completions base URL (OpenAI-compatible)
    pub base_url: String,
    /// Model identifier
    pub model: String,
    /// Bearer token; read from the environment by the host application
    pub api_key: Option<String>,
    /// Wall-clock timeout per request in seconds
    pub timeout_secs: u64,
    /// Retries after the first attempt
    pub max_retries: u32,
    /// Base for exponential backoff between retries, in seconds
    pub retry_backoff_secs: f64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            top_n: 3,
            min_score: 0.40,
            base_url: "https://api.mistral.ai/v1".to_string(),
            model: "mistral-small-latest".to_string(),
            api_key: None,
            timeout_secs: 120,
            max_retries: 3,
            retry_backoff_secs: 2.0,
        }
    }
}

// ============================================================================
// HTTP ARBITER
// ============================================================================

/// Arbiter backed by a chat completions provider
pub struct HttpArbiter {
    client: reqwest::Client,
    config: LlmConfig,
}

impl HttpArbiter {
    pub fn new(config: LlmConfig) -> Result<Self, ArbiterError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self { client, config })
    }

    async fn request(&self, prompt: &str) -> Result<String, ArbiterError> {
        let endpoint = format!(
            "{}/chat/completions",
            self.config.base_url.trim_end_matches('/')
        );
        let payload = json!({
            "model": self.config.model,
            "messages": [{"role": "user", "content": prompt}],
            "temperature": 0.1,
            "max_tokens": 50,
        });

        let mut request = self.client.post(endpoint).json(&payload);
        if let Some(key) = &self.config.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ArbiterError::Status {
                status: status.as_u16(),
                body: body.chars().take(200).collect(),
            });
        }

        let body: serde_json::Value = response.json().await?;
        body["choices"][0]["message"]["content"]
            .as_str()
            .map(|content| content.to_string())
            .ok_or_else(|| ArbiterError::MalformedResponse("missing completion content".into()))
    }
}

#[async_trait]
impl EventArbiter for HttpArbiter {
    async fn decide(
        &self,
        article: &ArticleCapsule,
        candidates: &[CandidateCapsule],
    ) -> Result<ArbiterDecision, ArbiterError> {
        let prompt = build_prompt(article, candidates);

        let mut attempt: u32 = 0;
        loop {
            match self.request(&prompt).await {
                Ok(reply) => {
                    let decision = super::parse_decision(&reply, candidates);
                    tracing::info!(
                        decision = ?decision,
                        candidates = candidates.len(),
                        "arbiter_decision"
                    );
                    return Ok(decision);
                }
                Err(error) if error.is_retryable() && attempt < self.config.max_retries => {
                    attempt += 1;
                    let delay = self.config.retry_backoff_secs * 2f64.powi(attempt as i32 - 1);
                    tracing::warn!(%error, attempt, delay_secs = delay, "arbiter_retry");
                    tokio::time::sleep(Duration::from_secs_f64(delay)).await;
                }
                Err(error) => return Err(error),
            }
        }
    }
}

// ============================================================================
// PROMPT
// ============================================================================

fn build_prompt(article: &ArticleCapsule, candidates: &[CandidateCapsule]) -> String {
    let locations = if article.locations.is_empty() {
        "unknown".to_string()
    } else {
        article.locations.join(", ")
    };
    let date = article
        .published_at
        .map(|d| d.format("%Y-%m-%d").to_string())
        .unwrap_or_else(|| "unknown".to_string());
    let article_type = article
        .event_type
        .map(|t| t.as_str().to_string())
        .unwrap_or_else(|| "unknown".to_string());

    let mut candidate_blocks = String::new();
    for (idx, candidate) in candidates.iter().enumerate() {
        candidate_blocks.push_str(&format!(
            "EVENT {} (score={:.2}):\n  Title: {}\n",
            idx + 1,
            candidate.score,
            candidate.title.as_deref().unwrap_or("(untitled)")
        ));
        if let Some(summary) = &candidate.summary {
            candidate_blocks.push_str(&format!("  Summary: {}\n", truncate(summary, 200)));
        }
        candidate_blocks.push_str(&format!(
            "  Type: {}\n  Articles: {}\n  Last updated: {}\n",
            candidate
                .event_type
                .map(|t| t.as_str().to_string())
                .unwrap_or_else(|| "unknown".to_string()),
            candidate.article_count,
            candidate.last_updated_at.format("%Y-%m-%d"),
        ));
    }

    format!(
        "You are clustering Dutch news articles. Decide if this NEW article belongs to an \
existing event or should create a NEW_EVENT.\n\n\
NEW ARTICLE:\n\
Type: {article_type}\n\
Location: {locations}\n\
Date: {date}\n\
Text: {title}\n\n{excerpt}\n\n\
CANDIDATE EVENTS:\n{candidate_blocks}\n\
MATCHING CRITERIA:\n\
SAME EVENT if:\n\
  - exact same incident (same victim, same accident, same political decision)\n\
  - same specific people or organizations involved\n\
  - same specific location for local events such as crimes and accidents\n\
  - continuation or update of the same story, within 1-2 days for breaking news\n\
DIFFERENT EVENT if:\n\
  - different victims or suspects, even for a similar crime type\n\
  - different locations for local events\n\
  - same general topic but distinct incidents\n\
  - more than 2 days apart for breaking news\n\n\
CRITICAL FOR CRIMES: different victim names OR different cities means ALWAYS different events.\n\n\
Respond with ONLY one of: {options} or NEW_EVENT\n\nResponse:",
        title = article.title,
        excerpt = truncate(&article.excerpt, 1200),
        options = (1..=candidates.len())
            .map(|k| format!("\"EVENT_{}\"", k))
            .collect::<Vec<_>>()
            .join(" or "),
    )
}

fn truncate(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

// ============================================================================
// TESTS
// ============================================================================
