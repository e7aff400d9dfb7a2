//! Persistent vector index over event centroids

mod vector;

pub use vector::{
    IndexError, IndexLabel, IndexMetadata, VectorCandidate, VectorIndexConfig, VectorIndexService,
};
