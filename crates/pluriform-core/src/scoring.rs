//! Hybrid article-to-event scoring
//!
//! Combines dense embedding cosine, sparse lexical cosine, and weighted
//! entity overlap into one similarity, then modulates it with time decay
//! and an entity penalty. All components are clamped to [0, 1].

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::features::{ArticleFeatures, EventFeatures};

// ============================================================================
// PARAMETERS
// ============================================================================

/// Runtime configuration for hybrid scoring
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct ScoreParameters {
    /// Weight applied to embedding cosine similarity
    pub weight_embedding: f32,
    /// Weight applied to sparse lexical cosine similarity
    pub weight_tfidf: f32,
    /// Weight applied to entity overlap
    pub weight_entities: f32,
    /// Half-life in hours for time decay (0 disables decay)
    pub time_decay_half_life_hours: f32,
    /// Lower bound for the decay multiplier
    pub time_decay_floor: f32,
}

impl Default for ScoreParameters {
    fn default() -> Self {
        Self {
            weight_embedding: 0.6,
            weight_tfidf: 0.3,
            weight_entities: 0.1,
            time_decay_half_life_hours: 48.0,
            time_decay_floor: 0.35,
        }
    }
}

impl ScoreParameters {
    /// Sum of the component weights; zero is a configuration error
    pub fn weight_sum(&self) -> f32 {
        self.weight_embedding + self.weight_tfidf + self.weight_entities
    }
}

// ============================================================================
// BREAKDOWN
// ============================================================================

/// Detailed breakdown of one hybrid score computation
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScoreBreakdown {
    pub embedding: f32,
    pub tfidf: f32,
    pub entities: f32,
    pub time_decay: f32,
    pub combined: f32,
    pub r#final: f32,
}

impl ScoreBreakdown {
    fn zero() -> Self {
        Self {
            embedding: 0.0,
            tfidf: 0.0,
            entities: 0.0,
            time_decay: 1.0,
            combined: 0.0,
            r#final: 0.0,
        }
    }
}

// ============================================================================
// SCORING
// ============================================================================

/// Compute the weighted similarity between an article and an event
pub fn compute_hybrid_score(
    article: &ArticleFeatures,
    event: &EventFeatures,
    params: &ScoreParameters,
    now: DateTime<Utc>,
) -> ScoreBreakdown {
    let weight_sum = params.weight_sum();
    if weight_sum <= 0.0 {
        tracing::warn!(total_weight = weight_sum, "hybrid_score_invalid_weights");
        return ScoreBreakdown::zero();
    }

    let embedding_similarity = cosine_dense(&article.embedding, &event.centroid_embedding);
    let tfidf_similarity = cosine_sparse(&article.tfidf, &event.centroid_tfidf);
    let entity_overlap = weighted_entity_overlap(article, event);

    let combined = (params.weight_embedding * embedding_similarity
        + params.weight_tfidf * tfidf_similarity
        + params.weight_entities * entity_overlap)
        / weight_sum;

    let decay = time_decay(
        article.reference_time,
        event.last_updated_at,
        params.time_decay_half_life_hours,
        params.time_decay_floor,
        now,
    );

    // Low entity overlap gets a multiplicative penalty so purely semantic
    // matches cannot cluster unrelated stories. The two steps do not stack.
    let entity_penalty = if entity_overlap < 0.10 {
        0.80
    } else if entity_overlap < 0.20 {
        0.90
    } else {
        1.0
    };

    ScoreBreakdown {
        embedding: clamp01(embedding_similarity),
        tfidf: clamp01(tfidf_similarity),
        entities: clamp01(entity_overlap),
        time_decay: clamp01(decay),
        combined: clamp01(combined),
        r#final: clamp01(combined * decay * entity_penalty),
    }
}

fn clamp01(value: f32) -> f32 {
    value.clamp(0.0, 1.0)
}

/// Cosine of two dense vectors; zero when either is empty or has zero norm
fn cosine_dense(a: &[f32], b: &[f32]) -> f32 {
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    (dot / (norm_a * norm_b)).clamp(-1.0, 1.0)
}

/// Cosine over the key intersection with full-vector norms in the denominator
fn cosine_sparse(a: &HashMap<String, f32>, b: &HashMap<String, f32>) -> f32 {
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    let dot: f32 = a
        .iter()
        .filter_map(|(token, value)| b.get(token).map(|other| value * other))
        .sum();
    let norm_a: f32 = a.values().map(|v| v * v).sum::<f32>().sqrt();
    let norm_b: f32 = b.values().map(|v| v * v).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    (dot / (norm_a * norm_b)).clamp(-1.0, 1.0)
}

fn jaccard(a: &HashSet<String>, b: &HashSet<String>) -> f32 {
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    let intersection = a.intersection(b).count();
    let union = a.union(b).count();
    if union == 0 {
        return 0.0;
    }
    intersection as f32 / union as f32
}

/// Weighted entity matching prioritizing PERSON and location entities
///
/// PERSON matches carry 0.50, location (GPE/LOC) matches 0.30, general
/// matches 0.20. An axis contributes only when both sides have entities of
/// that type; the result is normalized over the contributing weights. With
/// no typed entities on either side, falls back to plain Jaccard.
fn weighted_entity_overlap(article: &ArticleFeatures, event: &EventFeatures) -> f32 {
    let mut total = 0.0;
    let mut weight_sum = 0.0;

    if !article.person_entities.is_empty() && !event.person_entities.is_empty() {
        total += 0.50 * jaccard(&article.person_entities, &event.person_entities);
        weight_sum += 0.50;
    }

    if !article.location_entities.is_empty() && !event.location_entities.is_empty() {
        total += 0.30 * jaccard(&article.location_entities, &event.location_entities);
        weight_sum += 0.30;
    }

    if !article.entity_texts.is_empty() && !event.entity_texts.is_empty() {
        total += 0.20 * jaccard(&article.entity_texts, &event.entity_texts);
        weight_sum += 0.20;
    }

    if weight_sum > 0.0 {
        return total / weight_sum;
    }

    jaccard(&article.entity_texts, &event.entity_texts)
}

/// Exponential decay over the gap between article time and event freshness
///
/// Articles at or before the event's last update decay nothing; the decay
/// never drops below the configured floor.
fn time_decay(
    article_time: DateTime<Utc>,
    last_updated: DateTime<Utc>,
    half_life: f32,
    floor: f32,
    _now: DateTime<Utc>,
) -> f32 {
    if half_life <= 0.0 {
        return 1.0;
    }

    let hours = (article_time - last_updated).num_seconds() as f32 / 3600.0;
    if hours <= 0.0 {
        return 1.0;
    }

    let decay = 0.5_f32.powf(hours / half_life);
    if floor <= 0.0 { decay } else { decay.max(floor) }
}

// ============================================================================
// TESTS
// ============================================================================
