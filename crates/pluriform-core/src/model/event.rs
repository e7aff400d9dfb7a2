//! Event clusters, article links, and centroid snapshots

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::article::{Entity, EventType};

// ============================================================================
// EVENT
// ============================================================================

/// A persisted event cluster built from related articles
///
/// The centroid fields are running means over the member articles; an empty
/// centroid embedding means "no centroid" (the event cannot be indexed).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub id: i64,
    /// Human-readable unique slug derived from the seed title
    pub slug: String,
    pub title: Option<String>,
    pub description: Option<String>,
    pub centroid_embedding: Vec<f32>,
    pub centroid_tfidf: HashMap<String, f32>,
    pub centroid_entities: Vec<Entity>,
    pub event_type: Option<EventType>,
    pub first_seen_at: DateTime<Utc>,
    pub last_updated_at: DateTime<Utc>,
    pub article_count: i64,
    pub archived_at: Option<DateTime<Utc>>,
}

impl Event {
    /// Whether the event is still live (not soft-deleted)
    pub fn is_active(&self) -> bool {
        self.archived_at.is_none()
    }

    /// Whether the event carries an indexable centroid
    pub fn has_centroid(&self) -> bool {
        !self.centroid_embedding.is_empty()
    }
}

// ============================================================================
// SCORE BREAKDOWN ON LINKS
// ============================================================================

/// Full per-link scoring record persisted alongside every event-article link
///
/// Extends the scorer's breakdown with the additive boosts and the decision
/// that produced the link. Key names are part of the stored-link contract
/// (`time_decay`, `location_boost`, `boosted_final`, ...). Seed links store
/// all similarity axes at 1.0 and `decision = "seed"`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LinkBreakdown {
    pub embedding: f32,
    pub tfidf: f32,
    pub entities: f32,
    pub time_decay: f32,
    pub combined: f32,
    pub r#final: f32,
    pub location_boost: f32,
    pub date_boost: f32,
    pub boosted_final: f32,
    pub decision: String,
}

// ============================================================================
// EVENT-ARTICLE LINK
// ============================================================================

/// Link row between an event and an article, unique per pair
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventArticleLink {
    pub event_id: i64,
    pub article_id: i64,
    pub similarity: f32,
    pub breakdown: LinkBreakdown,
    pub linked_at: DateTime<Utc>,
}

// ============================================================================
// CENTROID SNAPSHOT
// ============================================================================

/// Lightweight view of an event centroid for the vector index
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CentroidSnapshot {
    pub event_id: i64,
    pub centroid_embedding: Vec<f32>,
    pub first_seen_at: DateTime<Utc>,
    pub last_updated_at: DateTime<Utc>,
    pub archived_at: Option<DateTime<Utc>>,
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_activity_and_centroid_flags() {
        let now = Utc::now();
        let mut event = Event {
            id: 7,
            slug: "steekpartij-purmerend".into(),
            title: Some("Steekpartij in Purmerend".into()),
            description: None,
            centroid_embedding: vec![0.1, 0.2],
            centroid_tfidf: HashMap::new(),
            centroid_entities: vec![],
            event_type: Some(EventType::Crime),
            first_seen_at: now,
            last_updated_at: now,
            article_count: 1,
            archived_at: None,
        };
        assert!(event.is_active());
        assert!(event.has_centroid());

        event.archived_at = Some(now);
        event.centroid_embedding.clear();
        assert!(!event.is_active());
        assert!(!event.has_centroid());
    }

    #[test]
    fn test_breakdown_serializes_final_key() {
        let breakdown = LinkBreakdown {
            embedding: 1.0,
            tfidf: 1.0,
            entities: 1.0,
            time_decay: 1.0,
            combined: 1.0,
            r#final: 1.0,
            location_boost: 0.0,
            date_boost: 0.0,
            boosted_final: 1.0,
            decision: "seed".into(),
        };
        let json = serde_json::to_value(&breakdown).unwrap();
        assert_eq!(json["final"], 1.0);
        assert_eq!(json["time_decay"], 1.0);
        assert_eq!(json["decision"], "seed");
        assert_eq!(json["boosted_final"], 1.0);
    }
}
