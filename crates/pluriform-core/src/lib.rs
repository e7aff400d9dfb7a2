//! # Pluriform Core
//!
//! Event detection and maintenance engine for a Dutch-language news
//! aggregator. Enriched articles stream in from many outlets; this crate
//! decides, per article, whether it reports on an already-known real-world
//! event or seeds a new one, and keeps the resulting cluster graph healthy:
//!
//! - **Hybrid scoring**: embedding cosine + sparse lexical cosine + typed
//!   entity overlap, modulated by time decay and an entity penalty
//! - **HNSW candidate retrieval**: persistent USearch index over event
//!   centroids with recency-filtered queries
//! - **Hard constraints**: event-type gate and location/time gates for
//!   local incidents such as crimes
//! - **LLM arbitration**: borderline candidates go to a prompt-driven
//!   arbiter that picks a candidate or requests a new event
//! - **Maintenance**: exact centroid recomputation, stale-event archival,
//!   and index drift detection with rebuild
//!
//! NLP enrichment (embeddings, TF-IDF, NER) happens upstream; feed
//! fetching, the HTTP API, and insight generation are external
//! collaborators.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use pluriform_core::{
//!     AssignmentCoordinator, EngineConfig, EventRepository, VectorIndexService,
//! };
//!
//! let config = EngineConfig::default();
//! config.validate()?;
//!
//! let repo = Arc::new(EventRepository::open(None)?);
//! let index = Arc::new(VectorIndexService::new(config.index.clone()));
//!
//! let coordinator = AssignmentCoordinator::new(
//!     Arc::clone(&repo),
//!     Arc::clone(&index),
//!     config.scoring.clone(),
//!     config.assignment.clone(),
//!     config.llm.clone(),
//! );
//!
//! match coordinator.assign(article_id).await? {
//!     outcome => println!("{:?}", outcome.result()),
//! }
//! ```

// ============================================================================
// MODULES
// ============================================================================

pub mod arbiter;
pub mod assignment;
pub mod config;
pub mod features;
pub mod index;
pub mod insights;
pub mod maintenance;
pub mod model;
pub mod repository;
pub mod scoring;

// ============================================================================
// PUBLIC API RE-EXPORTS
// ============================================================================

// Data model
pub use model::{
    Article, CentroidSnapshot, Entity, Event, EventArticleLink, EventType, LinkBreakdown,
    NewArticle,
};

// Feature extraction
pub use features::{ArticleFeatures, EventFeatures, article_features, event_features};

// Scoring
pub use scoring::{ScoreBreakdown, ScoreParameters, compute_hybrid_score};

// Vector index
pub use index::{IndexError, VectorCandidate, VectorIndexConfig, VectorIndexService};

// Repository
pub use repository::{EventBundle, EventRecompute, EventRepository, RepositoryError};

// Assignment
pub use assignment::{
    AssignmentConfig, AssignmentCoordinator, AssignmentError, AssignmentOutcome, AssignmentResult,
    SkipReason,
};

// LLM arbitration
pub use arbiter::{
    ArbiterDecision, ArbiterError, ArticleCapsule, CandidateCapsule, EventArbiter, HttpArbiter,
    LlmConfig, parse_decision,
};

// Insight scheduling
pub use insights::{InsightConfig, InsightError, InsightScheduler, InsightSink};

// Maintenance
pub use maintenance::{MaintenanceConfig, MaintenanceError, MaintenanceService, MaintenanceStats};

// Configuration
pub use config::{ConfigError, EngineConfig};

// ============================================================================
// VERSION INFO
// ============================================================================

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default embedding dimension (paraphrase-multilingual-MiniLM-L12-v2)
pub const DEFAULT_EMBEDDING_DIMENSION: usize = 384;

// ============================================================================
// PRELUDE
// ============================================================================

/// Convenient imports for common usage
pub mod prelude {
    pub use crate::{
        Article, AssignmentCoordinator, AssignmentOutcome, AssignmentResult, EngineConfig, Entity,
        Event, EventArbiter, EventRepository, EventType, MaintenanceService, MaintenanceStats,
        NewArticle, ScoreParameters, VectorIndexService,
    };
}
