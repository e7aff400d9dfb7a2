//! LLM arbitration for borderline candidate events
//!
//! The coordinator hands the arbiter a compact view of the article and the
//! top scored candidates; the arbiter answers with one of the candidates or
//! asks for a new event. The reply grammar is tiny on purpose: `NEW_EVENT`
//! or `EVENT_k` (1-indexed), anything else counts as unclear and the
//! coordinator falls back to the score-only decision.

mod http;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::model::EventType;

pub use http::{HttpArbiter, LlmConfig};

// ============================================================================
// ERROR TYPES
// ============================================================================

/// Arbiter error type
#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum ArbiterError {
    /// Transport-level failure (connect, timeout, body read)
    #[error("arbiter request failed: {0}")]
    Http(#[from] reqwest::Error),
    /// Non-success HTTP status from the provider
    #[error("arbiter provider returned status {status}: {body}")]
    Status { status: u16, body: String },
    /// Response payload did not carry a completion
    #[error("arbiter response malformed: {0}")]
    MalformedResponse(String),
}

impl ArbiterError {
    /// Whether a retry might succeed (timeouts, rate limits, 5xx)
    pub fn is_retryable(&self) -> bool {
        match self {
            ArbiterError::Http(error) => error.is_timeout() || error.is_connect(),
            ArbiterError::Status { status, .. } => *status == 429 || *status >= 500,
            ArbiterError::MalformedResponse(_) => false,
        }
    }
}

// ============================================================================
// CAPSULES
// ============================================================================

/// Compact article view submitted to the arbiter
#[derive(Debug, Clone)]
pub struct ArticleCapsule {
    pub title: String,
    /// Leading slice of the content, capped at roughly 1200 characters
    pub excerpt: String,
    pub event_type: Option<EventType>,
    pub locations: Vec<String>,
    pub published_at: Option<DateTime<Utc>>,
}

/// Compact candidate event view, in descending score order
#[derive(Debug, Clone)]
pub struct CandidateCapsule {
    pub event_id: i64,
    pub title: Option<String>,
    pub summary: Option<String>,
    pub event_type: Option<EventType>,
    pub article_count: i64,
    pub last_updated_at: DateTime<Utc>,
    pub score: f32,
}

// ============================================================================
// DECISION
// ============================================================================

/// Outcome of one arbitration call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArbiterDecision {
    /// Link to the selected existing event
    Existing(i64),
    /// None of the candidates fit; seed a new event
    New,
    /// Reply did not match the grammar; caller falls back to score
    Unclear,
}

/// Match an arbiter reply against the decision grammar
///
/// Accepts `NEW_EVENT` / `NEW EVENT` and `EVENT_k` / `EVENT k` with k
/// 1-indexed into the presented candidates.
pub fn parse_decision(reply: &str, candidates: &[CandidateCapsule]) -> ArbiterDecision {
    let decision = reply.trim().to_uppercase();
    if decision.contains("NEW_EVENT") || decision.contains("NEW EVENT") {
        return ArbiterDecision::New;
    }

    for (idx, candidate) in candidates.iter().enumerate() {
        let k = idx + 1;
        if decision.contains(&format!("EVENT_{}", k)) || decision.contains(&format!("EVENT {}", k))
        {
            return ArbiterDecision::Existing(candidate.event_id);
        }
    }

    ArbiterDecision::Unclear
}

// ============================================================================
// TRAIT
// ============================================================================

/// The arbitration collaborator
///
/// Implementations must not touch the repository; cancellation mid-call
/// leaves no partial state behind.
#[async_trait]
pub trait EventArbiter: Send + Sync {
    async fn decide(
        &self,
        article: &ArticleCapsule,
        candidates: &[CandidateCapsule],
    ) -> Result<ArbiterDecision, ArbiterError>;
}

// ============================================================================
// TESTS
// ============================================================================
