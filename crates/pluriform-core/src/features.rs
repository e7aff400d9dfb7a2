//! Feature extraction for articles and event centroids
//!
//! Normalizes persisted records into the scorer's vocabulary: dense
//! embedding, sparse lexical vector, and lowercased entity sets split by
//! type. Pure functions; no I/O beyond the record itself.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};

use crate::model::{Article, Entity, Event};

// ============================================================================
// FEATURE BUNDLES
// ============================================================================

/// Normalized feature bundle extracted from an article
#[derive(Debug, Clone)]
pub struct ArticleFeatures {
    /// Dense embedding; empty when the article was never embedded
    pub embedding: Vec<f32>,
    /// Sparse lexical vector with zero entries dropped
    pub tfidf: HashMap<String, f32>,
    /// All entity surface texts, lowercased
    pub entity_texts: HashSet<String>,
    /// PERSON-typed subset
    pub person_entities: HashSet<String>,
    /// GPE/LOC-typed subset
    pub location_entities: HashSet<String>,
    /// Publication time if present, fetch time otherwise
    pub reference_time: DateTime<Utc>,
}

impl ArticleFeatures {
    /// Whether the article carries a usable embedding
    pub fn has_embedding(&self) -> bool {
        !self.embedding.is_empty()
    }
}

/// Centroid feature bundle representing an existing event
#[derive(Debug, Clone)]
pub struct EventFeatures {
    pub centroid_embedding: Vec<f32>,
    pub centroid_tfidf: HashMap<String, f32>,
    pub entity_texts: HashSet<String>,
    pub person_entities: HashSet<String>,
    pub location_entities: HashSet<String>,
    pub last_updated_at: DateTime<Utc>,
    pub first_seen_at: DateTime<Utc>,
}

// ============================================================================
// EXTRACTION
// ============================================================================

/// Split an entity list into lowercased (all, person, location) text sets
fn entity_sets(entities: &[Entity]) -> (HashSet<String>, HashSet<String>, HashSet<String>) {
    let mut all = HashSet::new();
    let mut persons = HashSet::new();
    let mut locations = HashSet::new();

    for entity in entities {
        let text = entity.text.trim().to_lowercase();
        if text.is_empty() {
            continue;
        }
        if entity.is_person() {
            persons.insert(text.clone());
        } else if entity.is_location() {
            locations.insert(text.clone());
        }
        all.insert(text);
    }

    (all, persons, locations)
}

fn sanitize_tfidf(raw: &HashMap<String, f32>) -> HashMap<String, f32> {
    raw.iter()
        .filter(|(_, value)| **value != 0.0)
        .map(|(token, value)| (token.clone(), *value))
        .collect()
}

/// Normalize an article's persisted features for scoring
pub fn article_features(article: &Article) -> ArticleFeatures {
    let (entity_texts, person_entities, location_entities) = entity_sets(&article.entities);
    ArticleFeatures {
        embedding: article.embedding.clone(),
        tfidf: sanitize_tfidf(&article.tfidf),
        entity_texts,
        person_entities,
        location_entities,
        reference_time: article.reference_time(),
    }
}

/// Normalize an event's centroid fields for scoring
pub fn event_features(event: &Event) -> EventFeatures {
    let (entity_texts, person_entities, location_entities) = entity_sets(&event.centroid_entities);
    EventFeatures {
        centroid_embedding: event.centroid_embedding.clone(),
        centroid_tfidf: sanitize_tfidf(&event.centroid_tfidf),
        entity_texts,
        person_entities,
        location_entities,
        last_updated_at: event.last_updated_at,
        first_seen_at: event.first_seen_at,
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::EventType;

    fn article_with(entities: Vec<Entity>, embedding: Vec<f32>) -> Article {
        let now = Utc::now();
        Article {
            id: 1,
            guid: "guid".into(),
            url: "https://example.nl".into(),
            title: "Titel".into(),
            summary: None,
            content: String::new(),
            source_name: None,
            source_metadata: None,
            embedding,
            tfidf: HashMap::from([("kamer".to_string(), 0.5), ("leeg".to_string(), 0.0)]),
            entities,
            extracted_locations: vec![],
            extracted_dates: vec![],
            event_type: Some(EventType::Politics),
            published_at: Some(now - chrono::Duration::hours(2)),
            fetched_at: now,
        }
    }

    #[test]
    fn test_entity_sets_are_lowercased_and_typed() {
        let article = article_with(
            vec![
                Entity::new("Mark Rutte", Some("PERSON")),
                Entity::new("Den Haag", Some("GPE")),
                Entity::new("Veluwe", Some("LOC")),
                Entity::new("Tweede Kamer", Some("ORG")),
                Entity::new("  ", Some("ORG")),
            ],
            vec![1.0],
        );
        let features = article_features(&article);

        assert_eq!(features.entity_texts.len(), 4);
        assert!(features.person_entities.contains("mark rutte"));
        assert!(features.location_entities.contains("den haag"));
        assert!(features.location_entities.contains("veluwe"));
        assert!(!features.location_entities.contains("tweede kamer"));
    }

    #[test]
    fn test_zero_tfidf_entries_are_dropped() {
        let article = article_with(vec![], vec![1.0]);
        let features = article_features(&article);
        assert!(features.tfidf.contains_key("kamer"));
        assert!(!features.tfidf.contains_key("leeg"));
    }

    #[test]
    fn test_missing_embedding_marker() {
        let article = article_with(vec![], vec![]);
        let features = article_features(&article);
        assert!(!features.has_embedding());
    }

    #[test]
    fn test_reference_time_falls_back_to_fetch_time() {
        let mut article = article_with(vec![], vec![1.0]);
        article.published_at = None;
        let features = article_features(&article);
        assert_eq!(features.reference_time, article.fetched_at);
    }
}
