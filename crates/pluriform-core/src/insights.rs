//! Supervised queue for background insight generation
//!
//! Linking or seeding an event may schedule an asynchronous insight
//! refresh. The queue is bounded, deduplicated per event id, and gated by a
//! refresh TTL so a burst of links produces at most one task. Generation
//! itself is a collaborator behind `InsightSink`; the engine never builds
//! prompts or persists insights.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

// ============================================================================
// ERROR AND COLLABORATOR
// ============================================================================

/// Failure reported by an insight sink
#[derive(Debug, thiserror::Error)]
#[error("insight generation failed: {0}")]
pub struct InsightError(pub String);

/// External collaborator that produces and persists insights for an event
#[async_trait]
pub trait InsightSink: Send + Sync {
    async fn generate_for_event(&self, event_id: i64) -> Result<(), InsightError>;
}

// ============================================================================
// CONFIGURATION
// ============================================================================

/// Configuration for insight auto-generation
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct InsightConfig {
    /// Schedule insight refreshes on link/seed
    pub auto_generate: bool,
    /// Minimum minutes between refreshes per event
    pub refresh_ttl_minutes: i64,
    /// Bounded queue capacity; overflow drops the request with a warning
    pub queue_capacity: usize,
}

impl Default for InsightConfig {
    fn default() -> Self {
        Self {
            auto_generate: true,
            refresh_ttl_minutes: 30,
            queue_capacity: 64,
        }
    }
}

// ============================================================================
// SCHEDULER
// ============================================================================

/// Deduplicating, TTL-gated scheduler in front of an `InsightSink`
pub struct InsightScheduler {
    tx: Mutex<Option<mpsc::Sender<i64>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    pending: Arc<Mutex<HashSet<i64>>>,
    last_generated: Arc<Mutex<HashMap<i64, DateTime<Utc>>>>,
    refresh_ttl: Duration,
}

impl InsightScheduler {
    /// Spawn the worker task draining the queue into the sink
    pub fn start(sink: Arc<dyn InsightSink>, config: &InsightConfig) -> Self {
        let (tx, mut rx) = mpsc::channel::<i64>(config.queue_capacity.max(1));
        let pending = Arc::new(Mutex::new(HashSet::new()));
        let last_generated = Arc::new(Mutex::new(HashMap::new()));

        let worker_pending = Arc::clone(&pending);
        let worker_generated = Arc::clone(&last_generated);
        let worker = tokio::spawn(async move {
            while let Some(event_id) = rx.recv().await {
                if let Err(error) = sink.generate_for_event(event_id).await {
                    tracing::warn!(event_id, %error, "insight_autogen_failed");
                }
                if let Ok(mut generated) = worker_generated.lock() {
                    generated.insert(event_id, Utc::now());
                }
                if let Ok(mut pending) = worker_pending.lock() {
                    pending.remove(&event_id);
                }
            }
        });

        Self {
            tx: Mutex::new(Some(tx)),
            worker: Mutex::new(Some(worker)),
            pending,
            last_generated,
            refresh_ttl: Duration::minutes(config.refresh_ttl_minutes),
        }
    }

    /// Request an insight refresh; returns whether the event was enqueued
    ///
    /// Skips events already pending and events whose last refresh is newer
    /// than the TTL relative to the event's freshness. Never blocks: a full
    /// queue drops the request.
    pub fn schedule(&self, event_id: i64, last_updated_at: DateTime<Utc>) -> bool {
        {
            let Ok(pending) = self.pending.lock() else {
                return false;
            };
            if pending.contains(&event_id) {
                return false;
            }
        }

        if let Ok(generated) = self.last_generated.lock() {
            if let Some(previous) = generated.get(&event_id) {
                if last_updated_at <= *previous || last_updated_at - *previous < self.refresh_ttl {
                    return false;
                }
            }
        }

        let Ok(guard) = self.tx.lock() else {
            return false;
        };
        let Some(tx) = guard.as_ref() else {
            return false;
        };

        if let Ok(mut pending) = self.pending.lock() {
            pending.insert(event_id);
        }
        match tx.try_send(event_id) {
            Ok(()) => true,
            Err(error) => {
                tracing::warn!(event_id, %error, "insight_queue_full");
                if let Ok(mut pending) = self.pending.lock() {
                    pending.remove(&event_id);
                }
                false
            }
        }
    }

    /// Close the queue and wait for the worker to drain
    pub async fn shutdown(&self) {
        let tx = self.tx.lock().ok().and_then(|mut guard| guard.take());
        drop(tx);
        let worker = self.worker.lock().ok().and_then(|mut guard| guard.take());
        if let Some(handle) = worker {
            let _ = handle.await;
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
