//! Event maintenance: centroid refresh, archival, and index reconciliation
//!
//! Incremental centroid averaging at link time accumulates float drift; the
//! maintenance run recomputes every active centroid exactly from the member
//! articles, archives events outside the retention window, and reconciles
//! the vector index (rebuilding it when drift against the store is found).

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::index::{IndexError, VectorIndexService};
use crate::model::Entity;
use crate::repository::{
    EventBundle, EventRecompute, EventRepository, RepositoryError, merge_entities,
};

// ============================================================================
// CONFIGURATION
// ============================================================================

/// Configuration for the maintenance job
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct MaintenanceConfig {
    /// Archive events inactive beyond this many days
    pub retention_days: i64,
    /// Rebuild the vector index when drift against the store is detected
    pub rebuild_on_drift: bool,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            retention_days: 14,
            rebuild_on_drift: true,
        }
    }
}

// ============================================================================
// ERROR AND STATS
// ============================================================================

/// Maintenance error type
#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum MaintenanceError {
    #[error(transparent)]
    Repository(#[from] RepositoryError),
    #[error(transparent)]
    Index(#[from] IndexError),
}

/// Outcome summary for a maintenance run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MaintenanceStats {
    pub events_processed: usize,
    pub events_recomputed: usize,
    pub events_archived: usize,
    pub vector_upserts: usize,
    pub vector_removals: usize,
    pub index_rebuilt: bool,
}

// ============================================================================
// CENTROID RECOMPUTATION
// ============================================================================

/// Element-wise mean across member embeddings, zero-padding to the longest
fn mean_dense(vectors: &[&[f32]]) -> Vec<f32> {
    let clean: Vec<&[f32]> = vectors.iter().copied().filter(|v| !v.is_empty()).collect();
    if clean.is_empty() {
        return vec![];
    }
    let dimension = clean.iter().map(|v| v.len()).max().unwrap_or(0);
    let mut totals = vec![0.0f32; dimension];
    for vector in &clean {
        for (i, value) in vector.iter().enumerate() {
            totals[i] += value;
        }
    }
    let count = clean.len() as f32;
    totals.iter().map(|total| total / count).collect()
}

/// Mean across sparse vectors over their key union, dropping near-zero
fn mean_sparse(vectors: &[&HashMap<String, f32>]) -> HashMap<String, f32> {
    let clean: Vec<&HashMap<String, f32>> = vectors
        .iter()
        .copied()
        .filter(|v| !v.is_empty())
        .collect();
    if clean.is_empty() {
        return HashMap::new();
    }
    let mut accumulator: HashMap<String, f32> = HashMap::new();
    for vector in &clean {
        for (token, value) in vector.iter() {
            *accumulator.entry(token.clone()).or_default() += value;
        }
    }
    let count = clean.len() as f32;
    accumulator
        .into_iter()
        .filter_map(|(token, total)| {
            let mean = total / count;
            (mean.abs() > 1e-9).then_some((token, mean))
        })
        .collect()
}

struct RecomputePlan {
    recomputes: Vec<EventRecompute>,
    vector_updates: Vec<(i64, Vec<f32>, DateTime<Utc>)>,
    vector_removals: Vec<i64>,
    /// Effective last_updated per event after recomputation
    freshness: HashMap<i64, DateTime<Utc>>,
}

/// Recompute centroids exactly from member articles
fn recompute_centroids(bundles: &[EventBundle]) -> RecomputePlan {
    let mut plan = RecomputePlan {
        recomputes: Vec::new(),
        vector_updates: Vec::new(),
        vector_removals: Vec::new(),
        freshness: HashMap::new(),
    };

    for bundle in bundles {
        let event = &bundle.event;
        plan.freshness.insert(event.id, event.last_updated_at);
        if bundle.articles.is_empty() {
            continue;
        }

        let embeddings: Vec<&[f32]> = bundle
            .articles
            .iter()
            .map(|a| a.embedding.as_slice())
            .collect();
        let tfidf_vectors: Vec<&HashMap<String, f32>> =
            bundle.articles.iter().map(|a| &a.tfidf).collect();

        let centroid_embedding = mean_dense(&embeddings);
        let centroid_tfidf = mean_sparse(&tfidf_vectors);
        let centroid_entities = bundle
            .articles
            .iter()
            .fold(Vec::<Entity>::new(), |merged, article| {
                merge_entities(&merged, &article.entities)
            });

        let reference_times: Vec<DateTime<Utc>> = bundle
            .articles
            .iter()
            .map(|a| a.reference_time())
            .collect();
        let last_updated_at = reference_times
            .iter()
            .copied()
            .fold(event.last_updated_at, |a, b| a.max(b));
        let first_seen_at = reference_times
            .iter()
            .copied()
            .fold(event.first_seen_at, |a, b| a.min(b));

        plan.freshness.insert(event.id, last_updated_at);
        if centroid_embedding.is_empty() {
            plan.vector_removals.push(event.id);
        } else {
            plan.vector_updates
                .push((event.id, centroid_embedding.clone(), last_updated_at));
        }
        plan.recomputes.push(EventRecompute {
            event_id: event.id,
            centroid_embedding,
            centroid_tfidf,
            centroid_entities,
            article_count: bundle.articles.len() as i64,
            first_seen_at,
            last_updated_at,
        });
    }

    plan
}

// ============================================================================
// SERVICE
// ============================================================================

/// Coordinates centroid refresh, archival, and index maintenance
pub struct MaintenanceService {
    repo: Arc<EventRepository>,
    index: Arc<VectorIndexService>,
    config: MaintenanceConfig,
}

impl MaintenanceService {
    pub fn new(
        repo: Arc<EventRepository>,
        index: Arc<VectorIndexService>,
        config: MaintenanceConfig,
    ) -> Self {
        Self {
            repo,
            index,
            config,
        }
    }

    /// Execute the full maintenance workflow
    pub async fn run(&self) -> Result<MaintenanceStats, MaintenanceError> {
        let correlation_id = Uuid::new_v4();
        self.index.ensure_ready(&self.repo).await?;

        let bundles = self.repo.load_active_events_with_articles()?;
        let now = Utc::now();
        let plan = recompute_centroids(&bundles);

        let cutoff = now - Duration::days(self.config.retention_days);
        let archive_ids: Vec<i64> = bundles
            .iter()
            .filter(|bundle| bundle.event.archived_at.is_none())
            .filter(|bundle| {
                plan.freshness
                    .get(&bundle.event.id)
                    .map(|freshness| *freshness <= cutoff)
                    .unwrap_or(false)
            })
            .map(|bundle| bundle.event.id)
            .collect();

        let archived = self
            .repo
            .apply_maintenance(&plan.recomputes, &archive_ids, now)?;

        let mut vector_upserts = 0;
        for (event_id, embedding, last_updated_at) in &plan.vector_updates {
            match self.index.upsert(*event_id, embedding, *last_updated_at).await {
                Ok(()) => vector_upserts += 1,
                Err(error) => {
                    tracing::warn!(%correlation_id, event_id, %error, "vector_index_upsert_failed")
                }
            }
        }

        let mut removals: HashSet<i64> = plan.vector_removals.iter().copied().collect();
        removals.extend(archive_ids.iter().copied());
        let mut vector_removals = 0;
        for event_id in &removals {
            match self.index.remove(*event_id).await {
                Ok(()) => vector_removals += 1,
                Err(error) => {
                    tracing::warn!(%correlation_id, event_id, %error, "vector_index_remove_failed")
                }
            }
        }

        let mut index_rebuilt = false;
        if self.detect_index_drift().await? && self.config.rebuild_on_drift {
            self.index.rebuild(&self.repo).await?;
            index_rebuilt = true;
        }

        let stats = MaintenanceStats {
            events_processed: bundles.len(),
            events_recomputed: plan.recomputes.len(),
            events_archived: archived,
            vector_upserts,
            vector_removals,
            index_rebuilt,
        };
        tracing::info!(
            %correlation_id,
            events_processed = stats.events_processed,
            events_recomputed = stats.events_recomputed,
            events_archived = stats.events_archived,
            vector_upserts = stats.vector_upserts,
            vector_removals = stats.vector_removals,
            index_rebuilt = stats.index_rebuilt,
            "event_maintenance_completed"
        );
        Ok(stats)
    }

    /// Any asymmetry between active centroid-bearing events and the index
    async fn detect_index_drift(&self) -> Result<bool, MaintenanceError> {
        let snapshots = self.repo.fetch_index_snapshots()?;
        let active_ids: HashSet<i64> = snapshots.iter().map(|s| s.event_id).collect();
        let indexed_ids = self.index.indexed_ids().await;

        let missing = active_ids.difference(&indexed_ids).count();
        let stale = indexed_ids.difference(&active_ids).count();
        if missing > 0 || stale > 0 {
            tracing::warn!(missing, stale, "vector_index_drift_detected");
            return Ok(true);
        }
        Ok(false)
    }
}

// ============================================================================
// TESTS
// ============================================================================
