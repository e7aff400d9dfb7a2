//! Persistent HNSW index over event centroids
//!
//! Uses USearch in cosine space. Labels are event identifiers; every
//! mutation is persisted to disk (index blob + JSON metadata sidecar)
//! under a cross-process file lock. A single async mutex serializes all
//! access, and the ANN library calls run off the cooperative thread.

use std::collections::{HashMap, HashSet};
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::task;
use usearch::{Index, IndexOptions, MetricKind, ScalarKind};

use crate::repository::{EventRepository, RepositoryError};

// ============================================================================
// ERROR TYPES
// ============================================================================

/// Vector index error types
#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum IndexError {
    #[error("index creation failed: {0}")]
    Creation(String),
    #[error("failed to add centroid: {0}")]
    Add(String),
    #[error("index search failed: {0}")]
    Search(String),
    #[error("index persistence failed: {0}")]
    Persistence(String),
    #[error("index dimension mismatch (saved={saved}, expected={expected})")]
    DimensionMismatch { saved: usize, expected: usize },
    #[error("vector index not initialised; call ensure_ready() first")]
    NotReady,
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("metadata error: {0}")]
    Metadata(#[from] serde_json::Error),
    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

// ============================================================================
// CONFIGURATION
// ============================================================================

/// Configuration for the event centroid index
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct VectorIndexConfig {
    /// Dimensionality of centroid embeddings
    pub dimension: usize,
    /// Filesystem path for the persisted index blob
    pub index_path: PathBuf,
    /// Path for the JSON metadata sidecar
    pub metadata_path: PathBuf,
    /// Initial index capacity
    pub max_elements: usize,
    /// HNSW connectivity parameter
    pub m: usize,
    /// HNSW expansion factor for index building
    pub ef_construction: usize,
    /// HNSW expansion factor for search
    pub ef_search: usize,
    /// Maximum candidates returned per query
    pub candidate_top_k: usize,
    /// Only events updated within this window are candidates
    pub candidate_time_window_days: i64,
}

impl Default for VectorIndexConfig {
    fn default() -> Self {
        Self {
            dimension: 384,
            index_path: PathBuf::from("data/vector_index.bin"),
            metadata_path: PathBuf::from("data/vector_index.meta.json"),
            max_elements: 20_000,
            m: 16,
            ef_construction: 200,
            ef_search: 64,
            candidate_top_k: 10,
            candidate_time_window_days: 7,
        }
    }
}

// ============================================================================
// METADATA SIDECAR
// ============================================================================

/// Sidecar descriptor saved next to the index blob
///
/// Carries the build parameters (a dimension mismatch on load forces a
/// rebuild) plus the label/timestamp table USearch cannot enumerate itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct IndexMetadata {
    pub dimension: usize,
    pub max_elements: usize,
    pub m: usize,
    pub ef_construction: usize,
    pub ef_search: usize,
    pub label_count: usize,
    pub saved_at: DateTime<Utc>,
    #[serde(default)]
    pub labels: Vec<IndexLabel>,
}

/// One indexed event with the freshness used for recency filtering
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct IndexLabel {
    pub event_id: i64,
    pub last_updated_at: DateTime<Utc>,
}

// ============================================================================
// QUERY RESULTS
// ============================================================================

/// Result of a nearest-neighbour lookup
#[derive(Debug, Clone)]
pub struct VectorCandidate {
    pub event_id: i64,
    pub similarity: f32,
    pub distance: f32,
    pub last_updated_at: DateTime<Utc>,
}

// ============================================================================
// SERVICE
// ============================================================================

struct IndexState {
    index: Index,
    labels: HashSet<i64>,
    timestamps: HashMap<i64, DateTime<Utc>>,
}

/// Process-global index service with recency-aware querying
///
/// Construct once at startup; all operations serialize on one async mutex
/// so readers never observe a partially rebuilt index.
pub struct VectorIndexService {
    config: VectorIndexConfig,
    state: Mutex<Option<IndexState>>,
}

impl VectorIndexService {
    pub fn new(config: VectorIndexConfig) -> Self {
        Self {
            config,
            state: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &VectorIndexConfig {
        &self.config
    }

    /// Load the index from disk or rebuild it from the repository
    ///
    /// Idempotent: once the index is live, later calls return immediately.
    pub async fn ensure_ready(&self, repo: &EventRepository) -> Result<(), IndexError> {
        let mut slot = self.state.lock().await;
        if slot.is_some() {
            return Ok(());
        }

        if self.config.index_path.exists() && self.config.metadata_path.exists() {
            match self.load_from_disk() {
                Ok(state) => {
                    if self.adopt_loaded_state(&mut slot, state, repo)? {
                        return Ok(());
                    }
                    // Orphaned labels: fall through to a rebuild.
                }
                Err(error) => {
                    tracing::warn!(%error, action = "rebuild", "vector_index_load_failed");
                }
            }
        }

        self.rebuild_locked(&mut slot, repo)?;
        Ok(())
    }

    /// Force a rebuild of the index from the repository
    pub async fn rebuild(&self, repo: &EventRepository) -> Result<usize, IndexError> {
        let mut slot = self.state.lock().await;
        self.rebuild_locked(&mut slot, repo)
    }

    /// Insert or replace an event centroid and persist the index
    pub async fn upsert(
        &self,
        event_id: i64,
        embedding: &[f32],
        last_updated_at: DateTime<Utc>,
    ) -> Result<(), IndexError> {
        let mut slot = self.state.lock().await;
        let state = slot.as_mut().ok_or(IndexError::NotReady)?;

        if embedding.len() != self.config.dimension {
            tracing::warn!(
                event_id,
                reason = "invalid_vector",
                "vector_index_skip_upsert"
            );
            return Ok(());
        }

        Self::ensure_capacity(&state.index, state.labels.len() + 1)?;

        let key = event_id as u64;
        task::block_in_place(|| {
            if state.labels.contains(&event_id) {
                state
                    .index
                    .remove(key)
                    .map_err(|e| IndexError::Add(e.to_string()))?;
            }
            state
                .index
                .add(key, embedding)
                .map_err(|e| IndexError::Add(e.to_string()))
        })?;

        state.labels.insert(event_id);
        state.timestamps.insert(event_id, last_updated_at);
        self.persist_locked(state)
    }

    /// Drop an event from the index and persist the change
    pub async fn remove(&self, event_id: i64) -> Result<(), IndexError> {
        let mut slot = self.state.lock().await;
        let Some(state) = slot.as_mut() else {
            return Ok(());
        };
        if !state.labels.contains(&event_id) {
            return Ok(());
        }

        task::block_in_place(|| state.index.remove(event_id as u64))
            .map_err(|e| IndexError::Add(e.to_string()))?;
        state.labels.remove(&event_id);
        state.timestamps.remove(&event_id);
        self.persist_locked(state)
    }

    /// Event identifiers currently present in the index
    pub async fn indexed_ids(&self) -> HashSet<i64> {
        let slot = self.state.lock().await;
        slot.as_ref()
            .map(|state| state.labels.clone())
            .unwrap_or_default()
    }

    /// Query the nearest events filtered by the configured recency window
    ///
    /// Over-fetches 3x the requested count (capped by index size) so the
    /// recency filter still leaves enough survivors.
    pub async fn query(
        &self,
        embedding: &[f32],
        top_k: Option<usize>,
        now: DateTime<Utc>,
    ) -> Result<Vec<VectorCandidate>, IndexError> {
        let slot = self.state.lock().await;
        let state = slot.as_ref().ok_or(IndexError::NotReady)?;

        if embedding.len() != self.config.dimension || state.labels.is_empty() {
            return Ok(vec![]);
        }

        let desired = top_k.unwrap_or(self.config.candidate_top_k).max(1);
        let search_k = (desired * 3).max(desired).min(state.labels.len());
        let cutoff = now - Duration::days(self.config.candidate_time_window_days);

        let matches = task::block_in_place(|| state.index.search(embedding, search_k))
            .map_err(|e| IndexError::Search(e.to_string()))?;

        let mut results = Vec::with_capacity(desired);
        for (key, distance) in matches.keys.iter().zip(matches.distances.iter()) {
            let event_id = *key as i64;
            let Some(last_updated) = state.timestamps.get(&event_id) else {
                continue;
            };
            if *last_updated < cutoff {
                continue;
            }
            results.push(VectorCandidate {
                event_id,
                similarity: (1.0 - *distance).clamp(0.0, 1.0),
                distance: *distance,
                last_updated_at: *last_updated,
            });
            if results.len() >= desired {
                break;
            }
        }
        Ok(results)
    }

    // ------------------------------------------------------------------
    // internals (state mutex held by the caller)
    // ------------------------------------------------------------------

    fn create_index(&self, capacity: usize) -> Result<Index, IndexError> {
        let options = IndexOptions {
            dimensions: self.config.dimension,
            metric: MetricKind::Cos,
            quantization: ScalarKind::F32,
            connectivity: self.config.m,
            expansion_add: self.config.ef_construction,
            expansion_search: self.config.ef_search,
            multi: false,
        };
        let index = Index::new(&options).map_err(|e| IndexError::Creation(e.to_string()))?;
        index
            .reserve(capacity)
            .map_err(|e| IndexError::Creation(e.to_string()))?;
        Ok(index)
    }

    fn ensure_capacity(index: &Index, required: usize) -> Result<(), IndexError> {
        let current = index.capacity();
        if required <= current {
            return Ok(());
        }
        let new_capacity = required.max(current + current / 2);
        task::block_in_place(|| index.reserve(new_capacity))
            .map_err(|e| IndexError::Creation(e.to_string()))?;
        tracing::info!(new_max_elements = new_capacity, "vector_index_resized");
        Ok(())
    }

    fn load_from_disk(&self) -> Result<IndexState, IndexError> {
        let raw = std::fs::read_to_string(&self.config.metadata_path)?;
        let metadata: IndexMetadata = serde_json::from_str(&raw)?;
        if metadata.dimension != self.config.dimension {
            return Err(IndexError::DimensionMismatch {
                saved: metadata.dimension,
                expected: self.config.dimension,
            });
        }

        let index = self.create_index(metadata.max_elements.max(self.config.max_elements))?;
        let path = path_str(&self.config.index_path)?;
        task::block_in_place(|| index.load(&path))
            .map_err(|e| IndexError::Persistence(e.to_string()))?;

        if index.size() != metadata.labels.len() {
            return Err(IndexError::Persistence(format!(
                "label table out of sync with index blob ({} vs {})",
                metadata.labels.len(),
                index.size()
            )));
        }

        let mut labels = HashSet::with_capacity(metadata.labels.len());
        let mut timestamps = HashMap::with_capacity(metadata.labels.len());
        for label in &metadata.labels {
            labels.insert(label.event_id);
            timestamps.insert(label.event_id, label.last_updated_at);
        }

        tracing::info!(
            path = %self.config.index_path.display(),
            label_count = labels.len(),
            "vector_index_loaded"
        );
        Ok(IndexState {
            index,
            labels,
            timestamps,
        })
    }

    /// Refresh a loaded state against the repository; false means the index
    /// holds labels the store no longer knows and must be rebuilt.
    fn adopt_loaded_state(
        &self,
        slot: &mut Option<IndexState>,
        mut state: IndexState,
        repo: &EventRepository,
    ) -> Result<bool, IndexError> {
        let snapshots = repo.fetch_index_snapshots()?;
        let mut timestamps = HashMap::new();
        let mut available = HashSet::new();
        for snapshot in &snapshots {
            if state.labels.contains(&snapshot.event_id) {
                timestamps.insert(snapshot.event_id, snapshot.last_updated_at);
                available.insert(snapshot.event_id);
            }
        }

        let orphaned = state.labels.difference(&available).count();
        if orphaned > 0 {
            tracing::warn!(orphan_count = orphaned, "vector_index_orphaned_labels");
            return Ok(false);
        }

        state.timestamps = timestamps;
        *slot = Some(state);
        Ok(true)
    }

    fn rebuild_locked(
        &self,
        slot: &mut Option<IndexState>,
        repo: &EventRepository,
    ) -> Result<usize, IndexError> {
        let snapshots = repo.fetch_index_snapshots()?;
        let capacity = self.config.max_elements.max(snapshots.len() + 256);
        let index = self.create_index(capacity)?;

        let mut labels = HashSet::new();
        let mut timestamps = HashMap::new();
        task::block_in_place(|| -> Result<(), IndexError> {
            for snapshot in &snapshots {
                if snapshot.centroid_embedding.len() != self.config.dimension {
                    tracing::warn!(
                        event_id = snapshot.event_id,
                        reason = "invalid_vector",
                        "vector_index_skip_snapshot"
                    );
                    continue;
                }
                index
                    .add(snapshot.event_id as u64, &snapshot.centroid_embedding)
                    .map_err(|e| IndexError::Add(e.to_string()))?;
                labels.insert(snapshot.event_id);
                timestamps.insert(snapshot.event_id, snapshot.last_updated_at);
            }
            Ok(())
        })?;

        let state = IndexState {
            index,
            labels,
            timestamps,
        };
        self.persist_locked(&state)?;
        let label_count = state.labels.len();
        *slot = Some(state);
        tracing::info!(label_count, "vector_index_rebuilt");
        Ok(label_count)
    }

    /// Atomically save blob and sidecar under the cross-process file lock
    fn persist_locked(&self, state: &IndexState) -> Result<(), IndexError> {
        if let Some(parent) = self.config.index_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        if let Some(parent) = self.config.metadata_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mut labels: Vec<IndexLabel> = state
            .timestamps
            .iter()
            .map(|(event_id, last_updated_at)| IndexLabel {
                event_id: *event_id,
                last_updated_at: *last_updated_at,
            })
            .collect();
        labels.sort_by_key(|label| label.event_id);

        let metadata = IndexMetadata {
            dimension: self.config.dimension,
            max_elements: state.index.capacity(),
            m: self.config.m,
            ef_construction: self.config.ef_construction,
            ef_search: self.config.ef_search,
            label_count: labels.len(),
            saved_at: Utc::now(),
            labels,
        };
        let metadata_json = serde_json::to_string_pretty(&metadata)?;

        let lock_path = PathBuf::from(format!("{}.lock", self.config.index_path.display()));
        let index_tmp = PathBuf::from(format!("{}.tmp", self.config.index_path.display()));
        let metadata_tmp = PathBuf::from(format!("{}.tmp", self.config.metadata_path.display()));
        let index_tmp_str = path_str(&index_tmp)?;

        task::block_in_place(|| -> Result<(), IndexError> {
            let lock_file = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(false)
                .open(&lock_path)?;
            lock_file.lock_exclusive()?;

            let result = (|| -> Result<(), IndexError> {
                state
                    .index
                    .save(&index_tmp_str)
                    .map_err(|e| IndexError::Persistence(e.to_string()))?;
                std::fs::rename(&index_tmp, &self.config.index_path)?;
                std::fs::write(&metadata_tmp, &metadata_json)?;
                std::fs::rename(&metadata_tmp, &self.config.metadata_path)?;
                Ok(())
            })();

            let _ = fs2::FileExt::unlock(&lock_file);
            result
        })
    }
}

fn path_str(path: &Path) -> Result<String, IndexError> {
    path.to_str()
        .map(|s| s.to_string())
        .ok_or_else(|| IndexError::Persistence("invalid path".to_string()))
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::EventRepository;
    use tempfile::TempDir;

    const DIM: usize = 8;

    fn service(dir: &TempDir) -> VectorIndexService {
        VectorIndexService::new(VectorIndexConfig {
            dimension: DIM,
            index_path: dir.path().join("index.bin"),
            metadata_path: dir.path().join("index.meta.json"),
            max_elements: 16,
            ..VectorIndexConfig::default()
        })
    }

    fn repo(dir: &TempDir) -> EventRepository {
        EventRepository::open(Some(dir.path().join("events.db"))).unwrap()
    }

    fn axis(i: usize) -> Vec<f32> {
        let mut v = vec![0.0; DIM];
        v[i] = 1.0;
        v
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_upsert_query_and_recency_filter() {
        let dir = TempDir::new().unwrap();
        let index = service(&dir);
        let repo = repo(&dir);
        index.ensure_ready(&repo).await.unwrap();

        let now = Utc::now();
        index.upsert(1, &axis(0), now).await.unwrap();
        index.upsert(2, &axis(1), now).await.unwrap();
        index
            .upsert(3, &axis(0), now - Duration::days(30))
            .await
            .unwrap();

        let results = index.query(&axis(0), Some(5), now).await.unwrap();
        assert_eq!(results[0].event_id, 1);
        assert!(results[0].similarity > 0.99);
        // Event 3 matches perfectly but fell outside the recency window.
        assert!(results.iter().all(|c| c.event_id != 3));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_upsert_replaces_existing_label() {
        let dir = TempDir::new().unwrap();
        let index = service(&dir);
        let repo = repo(&dir);
        index.ensure_ready(&repo).await.unwrap();

        let now = Utc::now();
        index.upsert(1, &axis(0), now).await.unwrap();
        index.upsert(1, &axis(1), now).await.unwrap();

        assert_eq!(index.indexed_ids().await.len(), 1);
        let results = index.query(&axis(1), Some(1), now).await.unwrap();
        assert_eq!(results[0].event_id, 1);
        assert!(results[0].similarity > 0.99);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_remove_and_indexed_ids() {
        let dir = TempDir::new().unwrap();
        let index = service(&dir);
        let repo = repo(&dir);
        index.ensure_ready(&repo).await.unwrap();

        let now = Utc::now();
        index.upsert(1, &axis(0), now).await.unwrap();
        index.upsert(2, &axis(1), now).await.unwrap();
        index.remove(1).await.unwrap();

        let ids = index.indexed_ids().await;
        assert!(!ids.contains(&1));
        assert!(ids.contains(&2));

        // Removing an absent label is a no-op.
        index.remove(99).await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_persisted_index_round_trips_ranked_results() {
        let dir = TempDir::new().unwrap();
        let repo = repo(&dir);
        let now = Utc::now();

        // Real events back the index so a reload passes the orphan check.
        let mut event_ids = Vec::new();
        for i in 0..6 {
            let article = repo
                .insert_article(&crate::model::NewArticle {
                    guid: format!("guid-{}", i),
                    url: format!("https://example.nl/{}", i),
                    title: format!("Artikel {}", i),
                    summary: None,
                    content: String::new(),
                    source_name: None,
                    source_metadata: None,
                    embedding: axis(i),
                    tfidf: Default::default(),
                    entities: vec![],
                    extracted_locations: vec![],
                    extracted_dates: vec![],
                    event_type: None,
                    published_at: Some(now),
                    fetched_at: now,
                })
                .unwrap();
            let event = repo
                .create_event_skeleton(&article, &article.embedding, &article.tfidf, &[], now)
                .unwrap();
            event_ids.push(event.id);
        }

        let query = {
            let index = service(&dir);
            index.ensure_ready(&repo).await.unwrap();
            index.query(&axis(2), Some(3), now).await.unwrap()
        };

        let reloaded = service(&dir);
        reloaded.ensure_ready(&repo).await.unwrap();
        let reloaded_query = reloaded.query(&axis(2), Some(3), now).await.unwrap();

        let ids: Vec<i64> = query.iter().map(|c| c.event_id).collect();
        let reloaded_ids: Vec<i64> = reloaded_query.iter().map(|c| c.event_id).collect();
        assert_eq!(ids, reloaded_ids);
        assert_eq!(ids[0], event_ids[2]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_dimension_mismatch_forces_rebuild() {
        let dir = TempDir::new().unwrap();
        let repo = repo(&dir);
        let now = Utc::now();

        {
            let index = service(&dir);
            index.ensure_ready(&repo).await.unwrap();
            index.upsert(1, &axis(0), now).await.unwrap();
        }

        // Same files, different configured dimension: the saved blob must be
        // abandoned and the index rebuilt from the repository (empty here).
        let mismatched = VectorIndexService::new(VectorIndexConfig {
            dimension: DIM * 2,
            index_path: dir.path().join("index.bin"),
            metadata_path: dir.path().join("index.meta.json"),
            max_elements: 16,
            ..VectorIndexConfig::default()
        });
        mismatched.ensure_ready(&repo).await.unwrap();
        assert!(mismatched.indexed_ids().await.is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_capacity_grows_past_initial_maximum() {
        let dir = TempDir::new().unwrap();
        let index = VectorIndexService::new(VectorIndexConfig {
            dimension: DIM,
            index_path: dir.path().join("index.bin"),
            metadata_path: dir.path().join("index.meta.json"),
            max_elements: 4,
            ..VectorIndexConfig::default()
        });
        let repo = repo(&dir);
        index.ensure_ready(&repo).await.unwrap();

        // A fresh rebuild reserves a 256-slot floor, so push well past it.
        let now = Utc::now();
        for i in 0..300usize {
            let mut v = vec![0.0; DIM];
            v[i % DIM] = 1.0;
            v[(i + 1) % DIM] = 0.5;
            index.upsert(i as i64 + 1, &v, now).await.unwrap();
        }
        assert_eq!(index.indexed_ids().await.len(), 300);

        let results = index.query(&axis(0), Some(5), now).await.unwrap();
        assert_eq!(results.len(), 5);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_wrong_dimension_vector_is_skipped() {
        let dir = TempDir::new().unwrap();
        let index = service(&dir);
        let repo = repo(&dir);
        index.ensure_ready(&repo).await.unwrap();

        index.upsert(1, &[1.0, 2.0], Utc::now()).await.unwrap();
        assert!(index.indexed_ids().await.is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_query_before_ready_errors() {
        let dir = TempDir::new().unwrap();
        let index = service(&dir);
        let result = index.query(&axis(0), Some(3), Utc::now()).await;
        assert!(matches!(result, Err(IndexError::NotReady)));
    }
}
