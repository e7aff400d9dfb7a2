//! Shared harness for end-to-end assignment and maintenance tests

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tempfile::TempDir;

use pluriform_core::arbiter::{
    ArbiterDecision, ArbiterError, ArticleCapsule, CandidateCapsule, EventArbiter,
};
use pluriform_core::{
    AssignmentConfig, AssignmentCoordinator, Entity, EventRepository, EventType, LlmConfig,
    NewArticle, ScoreParameters, VectorIndexConfig, VectorIndexService,
};

pub const DIM: usize = 8;

pub struct Harness {
    pub dir: TempDir,
    pub repo: Arc<EventRepository>,
    pub index: Arc<VectorIndexService>,
}

pub fn harness() -> Harness {
    let dir = TempDir::new().unwrap();
    let repo = Arc::new(EventRepository::open(Some(dir.path().join("pluriform.db"))).unwrap());
    let index = Arc::new(VectorIndexService::new(VectorIndexConfig {
        dimension: DIM,
        index_path: dir.path().join("vector_index.bin"),
        metadata_path: dir.path().join("vector_index.meta.json"),
        max_elements: 64,
        ..VectorIndexConfig::default()
    }));
    Harness { dir, repo, index }
}

pub fn coordinator(h: &Harness) -> AssignmentCoordinator {
    coordinator_with_threshold(h, 0.82)
}

pub fn coordinator_with_threshold(h: &Harness, threshold: f32) -> AssignmentCoordinator {
    AssignmentCoordinator::new(
        Arc::clone(&h.repo),
        Arc::clone(&h.index),
        ScoreParameters::default(),
        AssignmentConfig {
            score_threshold: threshold,
            ..AssignmentConfig::default()
        },
        LlmConfig::default(),
    )
}

/// Unit vector along one axis
pub fn axis(i: usize) -> Vec<f32> {
    let mut v = vec![0.0; DIM];
    v[i] = 1.0;
    v
}

/// Unit vector with the given cosine against axis 0
pub fn toward_axis0(cosine: f32) -> Vec<f32> {
    let mut v = vec![0.0; DIM];
    v[0] = cosine;
    v[1] = (1.0 - cosine * cosine).sqrt();
    v
}

pub fn politics_article(guid: &str, embedding: Vec<f32>) -> NewArticle {
    let now = Utc::now();
    NewArticle {
        guid: guid.to_string(),
        url: format!("https://example.nl/{}", guid),
        title: format!("Kabinet onder druk {}", guid),
        summary: Some("Het kabinet staat onder druk.".into()),
        content: "Den Haag - het kabinet staat onder druk na het debat.".into(),
        source_name: Some("nos".into()),
        source_metadata: None,
        embedding,
        tfidf: HashMap::from([("kabinet".to_string(), 0.7), ("debat".to_string(), 0.3)]),
        entities: vec![
            Entity::new("kamer", None),
            Entity::new("kabinet", None),
        ],
        extracted_locations: vec!["Den Haag".into()],
        extracted_dates: vec!["12 maart".into()],
        event_type: Some(EventType::Politics),
        published_at: Some(now),
        fetched_at: now,
    }
}

pub fn crime_article(guid: &str, embedding: Vec<f32>, location: &str) -> NewArticle {
    let now = Utc::now();
    NewArticle {
        guid: guid.to_string(),
        url: format!("https://example.nl/{}", guid),
        title: format!("Steekpartij in {}", location),
        summary: None,
        content: format!("Bij een steekpartij in {} raakte een man gewond.", location),
        source_name: Some("ad".into()),
        source_metadata: None,
        embedding,
        tfidf: HashMap::from([("steekpartij".to_string(), 0.8), ("politie".to_string(), 0.2)]),
        entities: vec![
            Entity::new("politie", None),
            Entity::new("steekpartij", None),
        ],
        extracted_locations: vec![location.to_string()],
        extracted_dates: vec![],
        event_type: Some(EventType::Crime),
        published_at: Some(now),
        fetched_at: now,
    }
}

/// Arbiter stub returning a fixed decision and recording the call
pub struct FixedArbiter {
    decision: ArbiterDecision,
    pub called: AtomicBool,
}

impl FixedArbiter {
    pub fn new(decision: ArbiterDecision) -> Arc<Self> {
        Arc::new(Self {
            decision,
            called: AtomicBool::new(false),
        })
    }

    pub fn was_called(&self) -> bool {
        self.called.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EventArbiter for FixedArbiter {
    async fn decide(
        &self,
        _article: &ArticleCapsule,
        candidates: &[CandidateCapsule],
    ) -> Result<ArbiterDecision, ArbiterError> {
        self.called.store(true, Ordering::SeqCst);
        // "EVENT_1" resolves against whatever was actually presented.
        Ok(match self.decision {
            ArbiterDecision::Existing(_) => ArbiterDecision::Existing(candidates[0].event_id),
            other => other,
        })
    }
}

/// Arbiter stub that always fails, for fallback tests
pub struct FailingArbiter;

#[async_trait]
impl EventArbiter for FailingArbiter {
    async fn decide(
        &self,
        _article: &ArticleCapsule,
        _candidates: &[CandidateCapsule],
    ) -> Result<ArbiterDecision, ArbiterError> {
        Err(ArbiterError::Status {
            status: 503,
            body: "besloten wolk".into(),
        })
    }
}

/// Age an event in the store so retention logic can see it as stale
pub fn age_event(h: &Harness, event_id: i64, to: DateTime<Utc>) {
    let event = h.repo.get_event(event_id).unwrap().unwrap();
    h.repo
        .apply_maintenance(
            &[pluriform_core::EventRecompute {
                event_id,
                centroid_embedding: event.centroid_embedding,
                centroid_tfidf: event.centroid_tfidf,
                centroid_entities: event.centroid_entities,
                article_count: event.article_count,
                first_seen_at: to,
                last_updated_at: to,
            }],
            &[],
            to,
        )
        .unwrap();
}
