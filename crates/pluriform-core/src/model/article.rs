//! Article records and the enrichment input contract
//!
//! An article arrives fully enriched: dense embedding, sparse lexical
//! vector, typed named entities, and extracted locations/dates are all
//! precomputed upstream. The engine only reads these features.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ============================================================================
// EVENT TYPES
// ============================================================================

/// Classified event type, drawn from a closed set
///
/// The upstream classifier emits strings; parsing is case-insensitive and
/// anything unknown maps to `Other` so the type gate can never be fooled by
/// casing differences.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum EventType {
    Politics,
    Crime,
    Sports,
    International,
    Business,
    Entertainment,
    Weather,
    Royal,
    #[default]
    Other,
}

impl EventType {
    /// Convert to string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Politics => "politics",
            EventType::Crime => "crime",
            EventType::Sports => "sports",
            EventType::International => "international",
            EventType::Business => "business",
            EventType::Entertainment => "entertainment",
            EventType::Weather => "weather",
            EventType::Royal => "royal",
            EventType::Other => "other",
        }
    }

    /// Parse from a classifier tag
    pub fn parse_name(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "politics" => EventType::Politics,
            "crime" => EventType::Crime,
            "sports" => EventType::Sports,
            "international" => EventType::International,
            "business" => EventType::Business,
            "entertainment" => EventType::Entertainment,
            "weather" => EventType::Weather,
            "royal" => EventType::Royal,
            _ => EventType::Other,
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ============================================================================
// ENTITIES
// ============================================================================

/// A named entity with its surface text and optional type label
///
/// Labels follow the NER tag set (PERSON, GPE, LOC, ORG, ...); surface text
/// keeps its original casing, comparisons are done lowercased.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Entity {
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

impl Entity {
    pub fn new(text: impl Into<String>, label: Option<&str>) -> Self {
        Self {
            text: text.into(),
            label: label.map(|l| l.trim().to_uppercase()),
        }
    }

    /// Whether the label marks a PERSON entity
    pub fn is_person(&self) -> bool {
        matches!(self.label.as_deref(), Some(l) if l.eq_ignore_ascii_case("PERSON"))
    }

    /// Whether the label marks a geo-political entity or location
    pub fn is_location(&self) -> bool {
        matches!(
            self.label.as_deref(),
            Some(l) if l.eq_ignore_ascii_case("GPE") || l.eq_ignore_ascii_case("LOC")
        )
    }
}

// ============================================================================
// ARTICLE
// ============================================================================

/// A persisted, enriched article
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Article {
    pub id: i64,
    pub guid: String,
    pub url: String,
    pub title: String,
    pub summary: Option<String>,
    pub content: String,
    pub source_name: Option<String>,
    /// Free-form source metadata (may carry `spectrum` and `media_type`)
    pub source_metadata: Option<serde_json::Value>,
    /// Dense embedding at the configured dimension; empty when absent
    pub embedding: Vec<f32>,
    /// Sparse lexical vector, zero entries dropped
    pub tfidf: HashMap<String, f32>,
    pub entities: Vec<Entity>,
    pub extracted_locations: Vec<String>,
    pub extracted_dates: Vec<String>,
    pub event_type: Option<EventType>,
    pub published_at: Option<DateTime<Utc>>,
    pub fetched_at: DateTime<Utc>,
}

impl Article {
    /// Publication time if present, fetch time otherwise
    pub fn reference_time(&self) -> DateTime<Utc> {
        self.published_at.unwrap_or(self.fetched_at)
    }
}

/// Input contract for the enrichment pipeline writing new articles
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct NewArticle {
    pub guid: String,
    pub url: String,
    pub title: String,
    #[serde(default)]
    pub summary: Option<String>,
    pub content: String,
    #[serde(default)]
    pub source_name: Option<String>,
    #[serde(default)]
    pub source_metadata: Option<serde_json::Value>,
    #[serde(default)]
    pub embedding: Vec<f32>,
    #[serde(default)]
    pub tfidf: HashMap<String, f32>,
    #[serde(default)]
    pub entities: Vec<Entity>,
    #[serde(default)]
    pub extracted_locations: Vec<String>,
    #[serde(default)]
    pub extracted_dates: Vec<String>,
    #[serde(default)]
    pub event_type: Option<EventType>,
    #[serde(default)]
    pub published_at: Option<DateTime<Utc>>,
    pub fetched_at: DateTime<Utc>,
}

// ============================================================================
// TESTS
// ============================================================================
