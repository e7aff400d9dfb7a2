//! Assignment coordination
//!
//! For every enriched article: retrieve candidate events from the vector
//! index, apply the hard constraints, score and boost the survivors, let
//! the LLM arbiter weigh in on borderline cases, then link the article to
//! the best event or seed a new one. Index trouble degrades to "no
//! candidates" (seeding is the conservative outcome); repository failures
//! propagate untouched.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::arbiter::{ArbiterDecision, ArticleCapsule, CandidateCapsule, EventArbiter, LlmConfig};
use crate::features::{self, ArticleFeatures};
use crate::index::VectorIndexService;
use crate::insights::InsightScheduler;
use crate::model::{Article, Event, EventType, LinkBreakdown};
use crate::repository::{EventRepository, RepositoryError};
use crate::scoring::{ScoreBreakdown, ScoreParameters, compute_hybrid_score};

// ============================================================================
// CONSTANTS
// ============================================================================

/// Minimum boosted score a cross-type candidate must reach to stay in play
const CROSS_TYPE_SCORE_FLOOR: f32 = 0.70;

/// Additive bonus for sharing an extracted location with a member article
const LOCATION_BOOST: f32 = 0.10;

/// Additive bonus for sharing an extracted date string with a member article
const DATE_BOOST: f32 = 0.05;

/// Crime candidates further apart than this many days are dropped
const CRIME_MAX_DAY_GAP: i64 = 2;

/// Entity overlap required when one crime side has no extracted locations
const CRIME_MISSING_LOCATION_MIN_OVERLAP: f32 = 0.50;

// ============================================================================
// CONFIGURATION
// ============================================================================

/// Configuration for the assignment decision
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct AssignmentConfig {
    /// Minimum boosted score required to link to an existing event
    pub score_threshold: f32,
    /// Minimum entity overlap required to cluster at all (tuning knob)
    pub min_entity_overlap: f32,
    /// Entity overlap below this always warrants LLM verification (tuning knob)
    pub low_entity_llm_threshold: f32,
}

impl Default for AssignmentConfig {
    fn default() -> Self {
        Self {
            score_threshold: 0.82,
            min_entity_overlap: 0.05,
            low_entity_llm_threshold: 0.15,
        }
    }
}

// ============================================================================
// ERROR AND OUTCOME TYPES
// ============================================================================

/// Assignment error type; only genuine persistence failures surface
#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum AssignmentError {
    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

/// Why an article was skipped without a decision
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    MissingArticle,
    MissingEmbedding,
}

/// Outcome of an event assignment decision
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssignmentResult {
    pub article_id: i64,
    pub event_id: i64,
    pub created: bool,
    pub score: f32,
    pub threshold: f32,
    pub breakdown: LinkBreakdown,
}

/// Tagged assignment outcome
#[derive(Debug, Clone)]
pub enum AssignmentOutcome {
    /// Article joined an existing event
    Linked(AssignmentResult),
    /// Article seeded a new event
    Seeded(AssignmentResult),
    /// Article could not be assigned (missing row or embedding)
    Skipped(SkipReason),
}

impl AssignmentOutcome {
    /// The assignment result, when a decision was made
    pub fn result(&self) -> Option<&AssignmentResult> {
        match self {
            AssignmentOutcome::Linked(result) | AssignmentOutcome::Seeded(result) => Some(result),
            AssignmentOutcome::Skipped(_) => None,
        }
    }
}

// ============================================================================
// COORDINATOR
// ============================================================================

struct ScoredCandidate {
    event: Event,
    breakdown: ScoreBreakdown,
    boosted: f32,
    location_boost: f32,
    date_boost: f32,
}

/// Orchestrates candidate retrieval, scoring, arbitration, and persistence
pub struct AssignmentCoordinator {
    repo: Arc<EventRepository>,
    index: Arc<VectorIndexService>,
    arbiter: Option<Arc<dyn EventArbiter>>,
    insights: Option<Arc<InsightScheduler>>,
    scoring: ScoreParameters,
    config: AssignmentConfig,
    llm: LlmConfig,
}

impl AssignmentCoordinator {
    pub fn new(
        repo: Arc<EventRepository>,
        index: Arc<VectorIndexService>,
        scoring: ScoreParameters,
        config: AssignmentConfig,
        llm: LlmConfig,
    ) -> Self {
        Self {
            repo,
            index,
            arbiter: None,
            insights: None,
            scoring,
            config,
            llm,
        }
    }

    /// Attach the LLM arbiter collaborator
    pub fn with_arbiter(mut self, arbiter: Arc<dyn EventArbiter>) -> Self {
        self.arbiter = Some(arbiter);
        self
    }

    /// Attach the insight auto-generation scheduler
    pub fn with_insights(mut self, insights: Arc<InsightScheduler>) -> Self {
        self.insights = Some(insights);
        self
    }

    /// Assign an enriched article to an existing event or create a new one
    pub async fn assign(&self, article_id: i64) -> Result<AssignmentOutcome, AssignmentError> {
        let correlation_id = Uuid::new_v4();
        let Some(article) = self.repo.get_article(article_id)? else {
            tracing::warn!(%correlation_id, article_id, "event_assignment_article_missing");
            return Ok(AssignmentOutcome::Skipped(SkipReason::MissingArticle));
        };

        let article_features = features::article_features(&article);
        if !article_features.has_embedding() {
            tracing::warn!(%correlation_id, article_id, "event_assignment_missing_embedding");
            return Ok(AssignmentOutcome::Skipped(SkipReason::MissingEmbedding));
        }

        let now = Utc::now();
        let candidates = self.candidate_lookup(&article_features, now, correlation_id).await;

        let candidate_ids: Vec<i64> = candidates.iter().map(|c| c.event_id).collect();
        let mut event_map: HashMap<i64, Event> = self
            .repo
            .get_events_by_ids(&candidate_ids)?
            .into_iter()
            .map(|event| (event.id, event))
            .collect();
        let member_articles = self.repo.articles_for_events(&candidate_ids)?;

        let mut scored: Vec<ScoredCandidate> = Vec::new();
        for candidate in &candidates {
            let Some(event) = event_map.remove(&candidate.event_id) else {
                continue;
            };
            let members = member_articles
                .get(&event.id)
                .map(Vec::as_slice)
                .unwrap_or(&[]);

            let type_mismatch = matches!(
                (article.event_type, event.event_type),
                (Some(a), Some(e)) if a != e
            );

            if article.event_type == Some(EventType::Crime)
                && event.event_type == Some(EventType::Crime)
                && !members.is_empty()
                && !passes_crime_gates(&article, &event, members, correlation_id)
            {
                continue;
            }

            let breakdown = compute_hybrid_score(
                &article_features,
                &features::event_features(&event),
                &self.scoring,
                now,
            );
            let (location_boost, date_boost) = member_boosts(&article, members);
            let boosted = breakdown.r#final + location_boost + date_boost;
            if location_boost > 0.0 || date_boost > 0.0 {
                tracing::debug!(
                    %correlation_id,
                    event_id = event.id,
                    base_score = breakdown.r#final,
                    location_boost,
                    date_boost,
                    boosted_score = boosted,
                    "entity_overlap_boost"
                );
            }

            if type_mismatch {
                if boosted < CROSS_TYPE_SCORE_FLOOR {
                    tracing::debug!(
                        %correlation_id,
                        event_id = event.id,
                        score = boosted,
                        "low_confidence_cross_type_skip"
                    );
                    continue;
                }
                tracing::debug!(
                    %correlation_id,
                    event_id = event.id,
                    score = boosted,
                    "high_confidence_cross_type_match"
                );
            }

            scored.push(ScoredCandidate {
                event,
                breakdown,
                boosted,
                location_boost,
                date_boost,
            });
        }

        scored.sort_by(|a, b| {
            b.boosted
                .partial_cmp(&a.boosted)
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        let (best, force_seed) = self
            .arbitrate(&article, &scored, correlation_id)
            .await;

        let threshold = self.config.score_threshold;
        if !force_seed {
            if let Some(chosen) = best.map(|idx| &scored[idx]) {
                if chosen.boosted >= threshold {
                    let result = self
                        .link_article(&article, &article_features, chosen, now, threshold)?;
                    self.reconcile_index(result.event_id, correlation_id).await;
                    tracing::info!(
                        %correlation_id,
                        event_id = result.event_id,
                        score = result.score,
                        threshold,
                        "event_assignment_linked"
                    );
                    return Ok(AssignmentOutcome::Linked(result));
                }
            }
        }

        let result = self.seed_event(&article, &article_features, now, threshold)?;
        self.reconcile_index(result.event_id, correlation_id).await;
        tracing::info!(
            %correlation_id,
            event_id = result.event_id,
            score = result.score,
            threshold,
            "event_assignment_created"
        );
        Ok(AssignmentOutcome::Seeded(result))
    }

    /// Candidate retrieval; index trouble degrades to an empty candidate set
    async fn candidate_lookup(
        &self,
        article_features: &ArticleFeatures,
        now: DateTime<Utc>,
        correlation_id: Uuid,
    ) -> Vec<crate::index::VectorCandidate> {
        if let Err(error) = self.index.ensure_ready(&self.repo).await {
            tracing::warn!(%correlation_id, %error, "vector_index_unavailable");
            return vec![];
        }
        match self.index.query(&article_features.embedding, None, now).await {
            Ok(candidates) => candidates,
            Err(error) => {
                tracing::warn!(%correlation_id, %error, "vector_index_query_failed");
                vec![]
            }
        }
    }

    /// LLM arbitration over the top candidates
    ///
    /// Returns (best candidate index, force-seed flag). Unclear replies and
    /// arbiter failures fall back to the highest-scoring candidate.
    async fn arbitrate(
        &self,
        article: &Article,
        scored: &[ScoredCandidate],
        correlation_id: Uuid,
    ) -> (Option<usize>, bool) {
        let mut best: Option<usize> = None;
        let mut force_seed = false;

        if self.llm.enabled {
            if let Some(arbiter) = &self.arbiter {
                let capsules: Vec<CandidateCapsule> = scored
                    .iter()
                    .filter(|candidate| candidate.boosted >= self.llm.min_score)
                    .take(self.llm.top_n)
                    .map(candidate_capsule)
                    .collect();
                if !capsules.is_empty() {
                    tracing::debug!(
                        %correlation_id,
                        candidates_count = capsules.len(),
                        "using_llm_for_decision"
                    );
                    match arbiter.decide(&article_capsule(article), &capsules).await {
                        Ok(ArbiterDecision::Existing(event_id)) => {
                            best = scored.iter().position(|c| c.event.id == event_id);
                            tracing::info!(%correlation_id, event_id, "llm_selected_event");
                        }
                        Ok(ArbiterDecision::New) => {
                            force_seed = true;
                            tracing::info!(%correlation_id, "llm_selected_new_event");
                        }
                        Ok(ArbiterDecision::Unclear) => {
                            tracing::warn!(%correlation_id, "llm_decision_unclear");
                        }
                        Err(error) => {
                            tracing::warn!(%correlation_id, %error, "llm_decision_failed");
                        }
                    }
                }
            }
        }

        if best.is_none() && !force_seed && !scored.is_empty() {
            best = Some(0);
            tracing::debug!(
                %correlation_id,
                event_id = scored[0].event.id,
                score = scored[0].boosted,
                "using_score_based_decision"
            );
        }
        (best, force_seed)
    }

    fn link_article(
        &self,
        article: &Article,
        article_features: &ArticleFeatures,
        chosen: &ScoredCandidate,
        now: DateTime<Utc>,
        threshold: f32,
    ) -> Result<AssignmentResult, AssignmentError> {
        let breakdown = LinkBreakdown {
            embedding: chosen.breakdown.embedding,
            tfidf: chosen.breakdown.tfidf,
            entities: chosen.breakdown.entities,
            time_decay: chosen.breakdown.time_decay,
            combined: chosen.breakdown.combined,
            r#final: chosen.breakdown.r#final,
            location_boost: chosen.location_boost,
            date_boost: chosen.date_boost,
            boosted_final: chosen.boosted,
            decision: "link".to_string(),
        };
        let (event, _link) = self.repo.append_article_to_event(
            chosen.event.id,
            article,
            &article_features.embedding,
            &article_features.tfidf,
            &article.entities,
            chosen.boosted,
            &breakdown,
            now,
        )?;
        self.maybe_schedule_insights(event.id, event.last_updated_at);
        Ok(AssignmentResult {
            article_id: article.id,
            event_id: event.id,
            created: false,
            score: chosen.boosted,
            threshold,
            breakdown,
        })
    }

    fn seed_event(
        &self,
        article: &Article,
        article_features: &ArticleFeatures,
        now: DateTime<Utc>,
        threshold: f32,
    ) -> Result<AssignmentResult, AssignmentError> {
        let event = self.repo.create_event_skeleton(
            article,
            &article_features.embedding,
            &article_features.tfidf,
            &article.entities,
            now,
        )?;

        let breakdown = LinkBreakdown {
            embedding: 1.0,
            tfidf: 1.0,
            entities: if article_features.entity_texts.is_empty() {
                0.0
            } else {
                1.0
            },
            time_decay: 1.0,
            combined: 1.0,
            r#final: 1.0,
            location_boost: 0.0,
            date_boost: 0.0,
            boosted_final: 1.0,
            decision: "seed".to_string(),
        };
        let (event, _link) = self.repo.append_article_to_event(
            event.id,
            article,
            &article_features.embedding,
            &article_features.tfidf,
            &article.entities,
            breakdown.r#final,
            &breakdown,
            now,
        )?;
        self.maybe_schedule_insights(event.id, event.last_updated_at);
        Ok(AssignmentResult {
            article_id: article.id,
            event_id: event.id,
            created: true,
            score: breakdown.r#final,
            threshold,
            breakdown,
        })
    }

    /// Push the committed centroid into the index; lag is repaired by the
    /// next maintenance run, so failures only warn
    async fn reconcile_index(&self, event_id: i64, correlation_id: Uuid) {
        let Ok(Some(event)) = self.repo.get_event(event_id) else {
            return;
        };
        if !event.has_centroid() {
            return;
        }
        if let Err(error) = self
            .index
            .upsert(event.id, &event.centroid_embedding, event.last_updated_at)
            .await
        {
            tracing::warn!(%correlation_id, event_id, %error, "vector_index_upsert_failed");
        }
    }

    fn maybe_schedule_insights(&self, event_id: i64, last_updated_at: DateTime<Utc>) {
        if let Some(insights) = &self.insights {
            insights.schedule(event_id, last_updated_at);
        }
    }
}

// ============================================================================
// HARD CONSTRAINTS AND BOOSTS
// ============================================================================

fn lowercase_set(values: &[String]) -> HashSet<String> {
    values
        .iter()
        .map(|v| v.trim().to_lowercase())
        .filter(|v| !v.is_empty())
        .collect()
}

fn entity_text_set(articles: &[&Article]) -> HashSet<String> {
    let mut set = HashSet::new();
    for article in articles {
        for entity in &article.entities {
            let text = entity.text.trim().to_lowercase();
            if !text.is_empty() {
                set.insert(text);
            }
        }
    }
    set
}

fn jaccard_sets(a: &HashSet<String>, b: &HashSet<String>) -> f32 {
    let union = a.union(b).count();
    if union == 0 {
        return 0.0;
    }
    a.intersection(b).count() as f32 / union as f32
}

/// Hard constraints for local incidents: two crime reports belong together
/// only when their places and times agree
fn passes_crime_gates(
    article: &Article,
    event: &Event,
    members: &[Article],
    correlation_id: Uuid,
) -> bool {
    let article_locs = lowercase_set(&article.extracted_locations);
    let mut event_locs: HashSet<String> = HashSet::new();
    for member in members {
        event_locs.extend(lowercase_set(&member.extracted_locations));
    }

    // Crimes in different cities are different events, full stop.
    if !article_locs.is_empty() && !event_locs.is_empty() && article_locs.is_disjoint(&event_locs)
    {
        tracing::debug!(
            %correlation_id,
            article_id = article.id,
            event_id = event.id,
            "crime_location_mismatch"
        );
        return false;
    }

    // One side without locations: require substantial entity agreement.
    if article_locs.is_empty() || event_locs.is_empty() {
        let article_entities = entity_text_set(&[article]);
        let member_refs: Vec<&Article> = members.iter().collect();
        let event_entities = entity_text_set(&member_refs);
        if !article_entities.is_empty() && !event_entities.is_empty() {
            let overlap = jaccard_sets(&article_entities, &event_entities);
            if overlap < CRIME_MISSING_LOCATION_MIN_OVERLAP {
                tracing::debug!(
                    %correlation_id,
                    article_id = article.id,
                    event_id = event.id,
                    entity_overlap = overlap,
                    "crime_missing_location_low_entity_overlap"
                );
                return false;
            }
        }
    }

    if let Some(published) = article.published_at {
        let days_diff = (published - event.last_updated_at).num_days().abs();
        if days_diff > CRIME_MAX_DAY_GAP {
            tracing::debug!(
                %correlation_id,
                article_id = article.id,
                event_id = event.id,
                days_diff,
                "crime_time_mismatch"
            );
            return false;
        }
    }

    true
}

/// Additive boosts for sharing literal locations or dates with any member
fn member_boosts(article: &Article, members: &[Article]) -> (f32, f32) {
    if members.is_empty() {
        return (0.0, 0.0);
    }

    let mut location_boost = 0.0;
    let article_locs = lowercase_set(&article.extracted_locations);
    if !article_locs.is_empty() {
        for member in members {
            if !article_locs.is_disjoint(&lowercase_set(&member.extracted_locations)) {
                location_boost = LOCATION_BOOST;
                break;
            }
        }
    }

    let mut date_boost = 0.0;
    let article_dates = lowercase_set(&article.extracted_dates);
    if !article_dates.is_empty() {
        for member in members {
            if !article_dates.is_disjoint(&lowercase_set(&member.extracted_dates)) {
                date_boost = DATE_BOOST;
                break;
            }
        }
    }

    (location_boost, date_boost)
}

fn article_capsule(article: &Article) -> ArticleCapsule {
    ArticleCapsule {
        title: article.title.clone(),
        excerpt: article.content.chars().take(1200).collect(),
        event_type: article.event_type,
        locations: article.extracted_locations.clone(),
        published_at: article.published_at,
    }
}

fn candidate_capsule(candidate: &ScoredCandidate) -> CandidateCapsule {
    CandidateCapsule {
        event_id: candidate.event.id,
        title: candidate.event.title.clone(),
        summary: candidate.event.description.clone(),
        event_type: candidate.event.event_type,
        article_count: candidate.event.article_count,
        last_updated_at: candidate.event.last_updated_at,
        score: candidate.boosted,
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Entity;

    fn article(
        id: i64,
        event_type: Option<EventType>,
        locations: &[&str],
        dates: &[&str],
        entities: &[&str],
    ) -> Article {
        let now = Utc::now();
        Article {
            id,
            guid: format!("guid-{}", id),
            url: format!("https://example.nl/{}", id),
            title: format!("Artikel {}", id),
            summary: None,
            content: String::new(),
            source_name: None,
            source_metadata: None,
            embedding: vec![1.0],
            tfidf: HashMap::new(),
            entities: entities.iter().map(|e| Entity::new(*e, None)).collect(),
            extracted_locations: locations.iter().map(|l| l.to_string()).collect(),
            extracted_dates: dates.iter().map(|d| d.to_string()).collect(),
            event_type,
            published_at: Some(now),
            fetched_at: now,
        }
    }

    fn crime_event(id: i64) -> Event {
        let now = Utc::now();
        Event {
            id,
            slug: format!("event-{}", id),
            title: None,
            description: None,
            centroid_embedding: vec![1.0],
            centroid_tfidf: HashMap::new(),
            centroid_entities: vec![],
            event_type: Some(EventType::Crime),
            first_seen_at: now,
            last_updated_at: now,
            article_count: 1,
            archived_at: None,
        }
    }

    #[test]
    fn test_crime_gate_rejects_disjoint_cities() {
        let incoming = article(1, Some(EventType::Crime), &["Terneuzen"], &[], &["politie"]);
        let member = article(2, Some(EventType::Crime), &["Purmerend"], &[], &["politie"]);
        let event = crime_event(10);

        assert!(!passes_crime_gates(
            &incoming,
            &event,
            &[member],
            Uuid::new_v4()
        ));
    }

    #[test]
    fn test_crime_gate_accepts_shared_city() {
        let incoming = article(1, Some(EventType::Crime), &["Purmerend"], &[], &["politie"]);
        let member = article(2, Some(EventType::Crime), &["purmerend"], &[], &["politie"]);
        let event = crime_event(10);

        assert!(passes_crime_gates(
            &incoming,
            &event,
            &[member],
            Uuid::new_v4()
        ));
    }

    #[test]
    fn test_crime_gate_missing_locations_needs_entity_agreement() {
        let incoming = article(
            1,
            Some(EventType::Crime),
            &[],
            &[],
            &["politie", "steekpartij"],
        );
        let member = article(2, Some(EventType::Crime), &["Purmerend"], &[], &["brand"]);
        let event = crime_event(10);
        assert!(!passes_crime_gates(
            &incoming,
            &event,
            &[member],
            Uuid::new_v4()
        ));

        let agreeing_member = article(
            3,
            Some(EventType::Crime),
            &["Purmerend"],
            &[],
            &["politie", "steekpartij"],
        );
        assert!(passes_crime_gates(
            &incoming,
            &event,
            &[agreeing_member],
            Uuid::new_v4()
        ));
    }

    #[test]
    fn test_crime_gate_rejects_wide_time_gap() {
        let mut incoming = article(1, Some(EventType::Crime), &["Purmerend"], &[], &["politie"]);
        let member = article(2, Some(EventType::Crime), &["Purmerend"], &[], &["politie"]);
        let event = crime_event(10);
        incoming.published_at = Some(event.last_updated_at + chrono::Duration::days(5));

        assert!(!passes_crime_gates(
            &incoming,
            &event,
            &[member],
            Uuid::new_v4()
        ));
    }

    #[test]
    fn test_member_boosts() {
        let incoming = article(
            1,
            None,
            &["Den Haag"],
            &["12 maart"],
            &[],
        );
        let sharing_both = article(2, None, &["den haag"], &["12 MAART"], &[]);
        let sharing_none = article(3, None, &["Utrecht"], &["1 april"], &[]);

        assert_eq!(member_boosts(&incoming, &[sharing_both]), (0.10, 0.05));
        assert_eq!(member_boosts(&incoming, &[sharing_none]), (0.0, 0.0));
        assert_eq!(member_boosts(&incoming, &[]), (0.0, 0.0));
    }

    #[test]
    fn test_article_capsule_caps_excerpt() {
        let mut long = article(1, None, &[], &[], &[]);
        long.content = "x".repeat(5000);
        let capsule = article_capsule(&long);
        assert_eq!(capsule.excerpt.chars().count(), 1200);
    }
}
