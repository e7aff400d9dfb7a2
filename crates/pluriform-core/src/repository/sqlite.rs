//! SQLite event repository
//!
//! Separate reader/writer connections behind mutexes so the repository is
//! `Send + Sync` and callers can share it through an `Arc`. Every write
//! operation runs in its own transaction; the maintenance write set commits
//! as one transaction.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use directories::ProjectDirs;
use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, Row, params};
use serde::de::DeserializeOwned;

use crate::model::{
    Article, CentroidSnapshot, Entity, Event, EventArticleLink, EventType, LinkBreakdown,
    NewArticle,
};

// ============================================================================
// ERROR TYPES
// ============================================================================

/// Repository error type
#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum RepositoryError {
    /// Database error
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    /// JSON column (de)serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    /// Initialization error
    #[error("initialization error: {0}")]
    Init(String),
    /// Event not found
    #[error("event not found: {0}")]
    EventNotFound(i64),
}

/// Repository result type
pub type Result<T> = std::result::Result<T, RepositoryError>;

// ============================================================================
// MAINTENANCE PAYLOADS
// ============================================================================

/// An active event paired with its member articles
#[derive(Debug, Clone)]
pub struct EventBundle {
    pub event: Event,
    pub articles: Vec<Article>,
}

/// Recomputed centroid state written back during maintenance
#[derive(Debug, Clone)]
pub struct EventRecompute {
    pub event_id: i64,
    pub centroid_embedding: Vec<f32>,
    pub centroid_tfidf: HashMap<String, f32>,
    pub centroid_entities: Vec<Entity>,
    pub article_count: i64,
    pub first_seen_at: DateTime<Utc>,
    pub last_updated_at: DateTime<Utc>,
}

// ============================================================================
// CENTROID ARITHMETIC
// ============================================================================

/// Running mean over the longer of the two vectors, zero-padding the shorter
///
/// A zero member count adopts the new vector verbatim.
fn average_dense(existing: &[f32], new_vector: &[f32], count: i64) -> Vec<f32> {
    if new_vector.is_empty() {
        return existing.to_vec();
    }
    if existing.is_empty() || count <= 0 {
        return new_vector.to_vec();
    }

    let length = existing.len().max(new_vector.len());
    let n = count as f32;
    (0..length)
        .map(|i| {
            let prior = existing.get(i).copied().unwrap_or(0.0);
            let current = new_vector.get(i).copied().unwrap_or(0.0);
            (prior * n + current) / (n + 1.0)
        })
        .collect()
}

/// Running mean over the key union, dropping near-zero entries
fn average_sparse(
    existing: &HashMap<String, f32>,
    new_vector: &HashMap<String, f32>,
    count: i64,
) -> HashMap<String, f32> {
    if new_vector.is_empty() {
        return existing.clone();
    }
    if existing.is_empty() || count <= 0 {
        return new_vector.clone();
    }

    let n = count as f32;
    let mut averaged = HashMap::new();
    for token in existing.keys().chain(new_vector.keys()) {
        if averaged.contains_key(token) {
            continue;
        }
        let prior = existing.get(token).copied().unwrap_or(0.0);
        let current = new_vector.get(token).copied().unwrap_or(0.0);
        let value = (prior * n + current) / (n + 1.0);
        if value.abs() > 1e-9 {
            averaged.insert(token.clone(), value);
        }
    }
    averaged
}

/// Union-merge entity lists on lowercased (text, label), sorted by text
pub fn merge_entities(existing: &[Entity], new_entities: &[Entity]) -> Vec<Entity> {
    let mut merged: HashMap<(String, String), Entity> = HashMap::new();
    for entity in existing.iter().chain(new_entities.iter()) {
        let text = entity.text.trim();
        if text.is_empty() {
            continue;
        }
        let label = entity
            .label
            .as_deref()
            .map(str::trim)
            .filter(|l| !l.is_empty());
        let key = (
            text.to_lowercase(),
            label.map(str::to_lowercase).unwrap_or_default(),
        );
        merged.insert(
            key,
            Entity {
                text: text.to_string(),
                label: label.map(str::to_string),
            },
        );
    }
    let mut ordered: Vec<Entity> = merged.into_values().collect();
    ordered.sort_by(|a, b| a.text.to_lowercase().cmp(&b.text.to_lowercase()));
    ordered
}

// ============================================================================
// COLUMN CODECS
// ============================================================================

fn encode_embedding(embedding: &[f32]) -> Option<Vec<u8>> {
    if embedding.is_empty() {
        return None;
    }
    let mut bytes = Vec::with_capacity(embedding.len() * 4);
    for value in embedding {
        bytes.extend_from_slice(&value.to_le_bytes());
    }
    Some(bytes)
}

fn decode_embedding(payload: Option<Vec<u8>>) -> Vec<f32> {
    let Some(bytes) = payload else {
        return vec![];
    };
    bytes
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

fn parse_json_column<T: DeserializeOwned + Default>(
    idx: usize,
    raw: Option<String>,
) -> rusqlite::Result<T> {
    match raw {
        None => Ok(T::default()),
        Some(s) if s.is_empty() => Ok(T::default()),
        Some(s) => serde_json::from_str(&s)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e))),
    }
}

const ARTICLE_COLUMNS: &str = "id, guid, url, title, summary, content, source_name, \
     source_metadata, embedding, tfidf, entities, extracted_locations, extracted_dates, \
     event_type, published_at, fetched_at";

fn article_from_row(row: &Row<'_>, offset: usize) -> rusqlite::Result<Article> {
    Ok(Article {
        id: row.get(offset)?,
        guid: row.get(offset + 1)?,
        url: row.get(offset + 2)?,
        title: row.get(offset + 3)?,
        summary: row.get(offset + 4)?,
        content: row.get(offset + 5)?,
        source_name: row.get(offset + 6)?,
        source_metadata: parse_json_column::<Option<serde_json::Value>>(
            offset + 7,
            row.get(offset + 7)?,
        )?,
        embedding: decode_embedding(row.get(offset + 8)?),
        tfidf: parse_json_column(offset + 9, row.get(offset + 9)?)?,
        entities: parse_json_column(offset + 10, row.get(offset + 10)?)?,
        extracted_locations: parse_json_column(offset + 11, row.get(offset + 11)?)?,
        extracted_dates: parse_json_column(offset + 12, row.get(offset + 12)?)?,
        event_type: row
            .get::<_, Option<String>>(offset + 13)?
            .map(|tag| EventType::parse_name(&tag)),
        published_at: row.get(offset + 14)?,
        fetched_at: row.get(offset + 15)?,
    })
}

const EVENT_COLUMNS: &str = "id, slug, title, description, centroid_embedding, centroid_tfidf, \
     centroid_entities, event_type, first_seen_at, last_updated_at, article_count, archived_at";

fn event_from_row(row: &Row<'_>) -> rusqlite::Result<Event> {
    Ok(Event {
        id: row.get(0)?,
        slug: row.get(1)?,
        title: row.get(2)?,
        description: row.get(3)?,
        centroid_embedding: decode_embedding(row.get(4)?),
        centroid_tfidf: parse_json_column(5, row.get(5)?)?,
        centroid_entities: parse_json_column(6, row.get(6)?)?,
        event_type: row
            .get::<_, Option<String>>(7)?
            .map(|tag| EventType::parse_name(&tag)),
        first_seen_at: row.get(8)?,
        last_updated_at: row.get(9)?,
        article_count: row.get(10)?,
        archived_at: row.get(11)?,
    })
}

fn link_from_row(row: &Row<'_>) -> rusqlite::Result<EventArticleLink> {
    Ok(EventArticleLink {
        event_id: row.get(0)?,
        article_id: row.get(1)?,
        similarity: row.get::<_, Option<f64>>(2)?.unwrap_or(0.0) as f32,
        breakdown: parse_json_column(3, row.get(3)?)?,
        linked_at: row.get(4)?,
    })
}

fn slugify(value: &str) -> String {
    let mut slug = String::with_capacity(value.len());
    let mut pending_dash = false;
    for c in value.to_lowercase().chars() {
        if c.is_ascii_alphanumeric() {
            if pending_dash && !slug.is_empty() {
                slug.push('-');
            }
            pending_dash = false;
            slug.push(c);
        } else {
            pending_dash = true;
        }
    }
    if slug.is_empty() {
        slug.push_str("event");
    }
    slug
}

fn repeat_vars(count: usize) -> String {
    let mut vars = "?,".repeat(count);
    vars.pop();
    vars
}

// ============================================================================
// REPOSITORY
// ============================================================================

/// Encapsulates article/event read and write operations
pub struct EventRepository {
    writer: Mutex<Connection>,
    reader: Mutex<Connection>,
}

impl EventRepository {
    /// Apply PRAGMAs to a connection
    fn configure_connection(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;
             PRAGMA temp_store = MEMORY;",
        )?;
        Ok(())
    }

    /// Open the repository, creating the schema when needed
    ///
    /// Without an explicit path the database lives under the platform data
    /// directory.
    pub fn open(db_path: Option<PathBuf>) -> Result<Self> {
        let path = match db_path {
            Some(p) => p,
            None => {
                let proj_dirs = ProjectDirs::from("nl", "pluriform", "core").ok_or_else(|| {
                    RepositoryError::Init("could not determine project directories".to_string())
                })?;
                let data_dir = proj_dirs.data_dir();
                std::fs::create_dir_all(data_dir)?;
                data_dir.join("pluriform.db")
            }
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let writer_conn = Connection::open(&path)?;
        Self::configure_connection(&writer_conn)?;
        super::migrations::apply_migrations(&writer_conn)?;

        let reader_conn = Connection::open(&path)?;
        Self::configure_connection(&reader_conn)?;

        Ok(Self {
            writer: Mutex::new(writer_conn),
            reader: Mutex::new(reader_conn),
        })
    }

    fn writer(&self) -> Result<MutexGuard<'_, Connection>> {
        self.writer
            .lock()
            .map_err(|_| RepositoryError::Init("writer lock poisoned".into()))
    }

    fn reader(&self) -> Result<MutexGuard<'_, Connection>> {
        self.reader
            .lock()
            .map_err(|_| RepositoryError::Init("reader lock poisoned".into()))
    }

    // ------------------------------------------------------------------
    // articles
    // ------------------------------------------------------------------

    /// Persist an enriched article (the enrichment pipeline's write path)
    pub fn insert_article(&self, input: &NewArticle) -> Result<Article> {
        let writer = self.writer()?;
        writer.execute(
            "INSERT INTO articles (
                guid, url, title, summary, content, source_name, source_metadata,
                embedding, tfidf, entities, extracted_locations, extracted_dates,
                event_type, published_at, fetched_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
            params![
                input.guid,
                input.url,
                input.title,
                input.summary,
                input.content,
                input.source_name,
                input
                    .source_metadata
                    .as_ref()
                    .map(serde_json::to_string)
                    .transpose()?,
                encode_embedding(&input.embedding),
                serde_json::to_string(&input.tfidf)?,
                serde_json::to_string(&input.entities)?,
                serde_json::to_string(&input.extracted_locations)?,
                serde_json::to_string(&input.extracted_dates)?,
                input.event_type.map(|t| t.as_str()),
                input.published_at,
                input.fetched_at,
            ],
        )?;
        let id = writer.last_insert_rowid();
        drop(writer);

        self.get_article(id)?
            .ok_or_else(|| RepositoryError::Init(format!("article {} vanished after insert", id)))
    }

    /// Fetch a single article by identifier
    pub fn get_article(&self, article_id: i64) -> Result<Option<Article>> {
        let reader = self.reader()?;
        let article = reader
            .query_row(
                &format!("SELECT {} FROM articles WHERE id = ?1", ARTICLE_COLUMNS),
                params![article_id],
                |row| article_from_row(row, 0),
            )
            .optional()?;
        Ok(article)
    }

    /// Member articles grouped by event, for the given events only
    pub fn articles_for_events(&self, event_ids: &[i64]) -> Result<HashMap<i64, Vec<Article>>> {
        if event_ids.is_empty() {
            return Ok(HashMap::new());
        }
        let reader = self.reader()?;
        let sql = format!(
            "SELECT ea.event_id, {} FROM event_articles ea
             JOIN articles a ON a.id = ea.article_id
             WHERE ea.event_id IN ({})",
            prefixed_article_columns(),
            repeat_vars(event_ids.len())
        );
        let mut stmt = reader.prepare(&sql)?;
        let rows = stmt.query_map(rusqlite::params_from_iter(event_ids.iter()), |row| {
            Ok((row.get::<_, i64>(0)?, article_from_row(row, 1)?))
        })?;

        let mut grouped: HashMap<i64, Vec<Article>> = HashMap::new();
        for row in rows {
            let (event_id, article) = row?;
            grouped.entry(event_id).or_default().push(article);
        }
        Ok(grouped)
    }

    // ------------------------------------------------------------------
    // events
    // ------------------------------------------------------------------

    /// Fetch non-archived events for the given identifiers
    pub fn get_events_by_ids(&self, event_ids: &[i64]) -> Result<Vec<Event>> {
        if event_ids.is_empty() {
            return Ok(vec![]);
        }
        let reader = self.reader()?;
        let sql = format!(
            "SELECT {} FROM events WHERE id IN ({}) AND archived_at IS NULL",
            EVENT_COLUMNS,
            repeat_vars(event_ids.len())
        );
        let mut stmt = reader.prepare(&sql)?;
        let events = stmt
            .query_map(rusqlite::params_from_iter(event_ids.iter()), event_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(events)
    }

    /// Fetch a single event regardless of archival state
    pub fn get_event(&self, event_id: i64) -> Result<Option<Event>> {
        let reader = self.reader()?;
        let event = reader
            .query_row(
                &format!("SELECT {} FROM events WHERE id = ?1", EVENT_COLUMNS),
                params![event_id],
                event_from_row,
            )
            .optional()?;
        Ok(event)
    }

    /// Active events that carry centroid embeddings, for vector indexing
    pub fn fetch_index_snapshots(&self) -> Result<Vec<CentroidSnapshot>> {
        let reader = self.reader()?;
        let mut stmt = reader.prepare(
            "SELECT id, centroid_embedding, first_seen_at, last_updated_at, archived_at
             FROM events
             WHERE archived_at IS NULL AND centroid_embedding IS NOT NULL",
        )?;
        let snapshots = stmt
            .query_map([], |row| {
                Ok(CentroidSnapshot {
                    event_id: row.get(0)?,
                    centroid_embedding: decode_embedding(row.get(1)?),
                    first_seen_at: row.get(2)?,
                    last_updated_at: row.get(3)?,
                    archived_at: row.get(4)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        tracing::debug!(count = snapshots.len(), "event_snapshots_loaded");
        Ok(snapshots)
    }

    /// Active events and their linked articles, for maintenance
    pub fn load_active_events_with_articles(&self) -> Result<Vec<EventBundle>> {
        let events = {
            let reader = self.reader()?;
            let mut stmt = reader.prepare(&format!(
                "SELECT {} FROM events WHERE archived_at IS NULL",
                EVENT_COLUMNS
            ))?;
            stmt.query_map([], event_from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?
        };
        if events.is_empty() {
            return Ok(vec![]);
        }

        let event_ids: Vec<i64> = events.iter().map(|e| e.id).collect();
        let mut grouped = self.articles_for_events(&event_ids)?;

        let bundles = events
            .into_iter()
            .map(|event| {
                let articles = grouped.remove(&event.id).unwrap_or_default();
                EventBundle { event, articles }
            })
            .collect::<Vec<_>>();
        tracing::debug!(count = bundles.len(), "event_bundles_loaded");
        Ok(bundles)
    }

    /// Create a new event row seeded from the first article
    ///
    /// Allocates a unique slug from the seed title and inherits the seed's
    /// event type.
    pub fn create_event_skeleton(
        &self,
        article: &Article,
        embedding: &[f32],
        tfidf: &HashMap<String, f32>,
        entities: &[Entity],
        timestamp: DateTime<Utc>,
    ) -> Result<Event> {
        let base = if !article.title.trim().is_empty() {
            article.title.clone()
        } else {
            article.url.clone()
        };
        let base_slug = slugify(&base);

        let mut writer = self.writer()?;
        let tx = writer.transaction()?;
        let slug = Self::allocate_unique_slug(&tx, &base_slug)?;

        tx.execute(
            "INSERT INTO events (
                slug, title, description, centroid_embedding, centroid_tfidf,
                centroid_entities, event_type, first_seen_at, last_updated_at, article_count
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, 0)",
            params![
                slug,
                article.title,
                article.summary,
                encode_embedding(embedding),
                serde_json::to_string(tfidf)?,
                serde_json::to_string(&merge_entities(&[], entities))?,
                article.event_type.map(|t| t.as_str()),
                timestamp,
                timestamp,
            ],
        )?;
        let event_id = tx.last_insert_rowid();
        tx.commit()?;
        drop(writer);

        tracing::info!(event_id, slug = %slug, "event_created");
        self.get_event(event_id)?
            .ok_or(RepositoryError::EventNotFound(event_id))
    }

    fn allocate_unique_slug(tx: &rusqlite::Transaction<'_>, base_slug: &str) -> Result<String> {
        let mut candidate = base_slug.to_string();
        let mut suffix = 1;
        loop {
            let exists: Option<i64> = tx
                .query_row(
                    "SELECT id FROM events WHERE slug = ?1",
                    params![candidate],
                    |row| row.get(0),
                )
                .optional()?;
            if exists.is_none() {
                return Ok(candidate);
            }
            candidate = format!("{}-{}", base_slug, suffix);
            suffix += 1;
        }
    }

    /// Link an article to an event and fold it into the centroids
    ///
    /// One transaction covers the centroid update, the member count bump,
    /// the freshness advance, and the link row. Linking the same article a
    /// second time returns the existing link with no further mutation.
    pub fn append_article_to_event(
        &self,
        event_id: i64,
        article: &Article,
        embedding: &[f32],
        tfidf: &HashMap<String, f32>,
        entities: &[Entity],
        similarity: f32,
        breakdown: &LinkBreakdown,
        timestamp: DateTime<Utc>,
    ) -> Result<(Event, EventArticleLink)> {
        let mut writer = self.writer()?;
        let tx = writer.transaction()?;

        let existing = tx
            .query_row(
                "SELECT event_id, article_id, similarity, breakdown, linked_at
                 FROM event_articles WHERE event_id = ?1 AND article_id = ?2",
                params![event_id, article.id],
                link_from_row,
            )
            .optional()?;
        if let Some(link) = existing {
            tx.commit()?;
            drop(writer);
            tracing::debug!(event_id, article_id = article.id, "event_link_exists");
            let event = self
                .get_event(event_id)?
                .ok_or(RepositoryError::EventNotFound(event_id))?;
            return Ok((event, link));
        }

        let event = tx
            .query_row(
                &format!("SELECT {} FROM events WHERE id = ?1", EVENT_COLUMNS),
                params![event_id],
                event_from_row,
            )
            .optional()?
            .ok_or(RepositoryError::EventNotFound(event_id))?;

        let count = event.article_count;
        let centroid_embedding = average_dense(&event.centroid_embedding, embedding, count);
        let centroid_tfidf = average_sparse(&event.centroid_tfidf, tfidf, count);
        let centroid_entities = merge_entities(&event.centroid_entities, entities);

        tx.execute(
            "UPDATE events SET centroid_embedding = ?1, centroid_tfidf = ?2,
                centroid_entities = ?3, article_count = ?4, last_updated_at = ?5
             WHERE id = ?6",
            params![
                encode_embedding(&centroid_embedding),
                serde_json::to_string(&centroid_tfidf)?,
                serde_json::to_string(&centroid_entities)?,
                count + 1,
                timestamp,
                event_id,
            ],
        )?;

        tx.execute(
            "INSERT INTO event_articles (event_id, article_id, similarity, breakdown, linked_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                event_id,
                article.id,
                similarity as f64,
                serde_json::to_string(breakdown)?,
                timestamp,
            ],
        )?;
        tx.commit()?;
        drop(writer);

        tracing::info!(
            event_id,
            article_id = article.id,
            similarity,
            "event_linked_article"
        );

        let updated = Event {
            centroid_embedding,
            centroid_tfidf,
            centroid_entities,
            article_count: count + 1,
            last_updated_at: timestamp,
            ..event
        };
        let link = EventArticleLink {
            event_id,
            article_id: article.id,
            similarity,
            breakdown: breakdown.clone(),
            linked_at: timestamp,
        };
        Ok((updated, link))
    }

    /// All link rows for an event, newest first
    pub fn links_for_event(&self, event_id: i64) -> Result<Vec<EventArticleLink>> {
        let reader = self.reader()?;
        let mut stmt = reader.prepare(
            "SELECT event_id, article_id, similarity, breakdown, linked_at
             FROM event_articles WHERE event_id = ?1 ORDER BY linked_at DESC, id DESC",
        )?;
        let links = stmt
            .query_map(params![event_id], link_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(links)
    }

    /// Mark the given events as archived; already-archived rows are untouched
    pub fn archive_events(&self, event_ids: &[i64], timestamp: DateTime<Utc>) -> Result<usize> {
        if event_ids.is_empty() {
            return Ok(0);
        }
        let mut writer = self.writer()?;
        let tx = writer.transaction()?;
        let sql = format!(
            "UPDATE events SET archived_at = ? WHERE id IN ({}) AND archived_at IS NULL",
            repeat_vars(event_ids.len())
        );
        let mut values: Vec<Box<dyn rusqlite::ToSql>> = vec![Box::new(timestamp)];
        for id in event_ids {
            values.push(Box::new(*id));
        }
        let archived = tx.execute(
            &sql,
            rusqlite::params_from_iter(values.iter().map(|v| v.as_ref())),
        )?;
        tx.commit()?;

        if archived > 0 {
            tracing::info!(count = archived, "event_archived");
        }
        Ok(archived)
    }

    /// Apply a maintenance write set (centroid recomputes + archival) in one
    /// transaction
    pub fn apply_maintenance(
        &self,
        recomputes: &[EventRecompute],
        archive_ids: &[i64],
        timestamp: DateTime<Utc>,
    ) -> Result<usize> {
        let mut writer = self.writer()?;
        let tx = writer.transaction()?;

        for update in recomputes {
            tx.execute(
                "UPDATE events SET centroid_embedding = ?1, centroid_tfidf = ?2,
                    centroid_entities = ?3, article_count = ?4,
                    first_seen_at = ?5, last_updated_at = ?6
                 WHERE id = ?7",
                params![
                    encode_embedding(&update.centroid_embedding),
                    serde_json::to_string(&update.centroid_tfidf)?,
                    serde_json::to_string(&update.centroid_entities)?,
                    update.article_count,
                    update.first_seen_at,
                    update.last_updated_at,
                    update.event_id,
                ],
            )?;
        }

        let mut archived = 0;
        if !archive_ids.is_empty() {
            let sql = format!(
                "UPDATE events SET archived_at = ? WHERE id IN ({}) AND archived_at IS NULL",
                repeat_vars(archive_ids.len())
            );
            let mut values: Vec<Box<dyn rusqlite::ToSql>> = vec![Box::new(timestamp)];
            for id in archive_ids {
                values.push(Box::new(*id));
            }
            archived = tx.execute(
                &sql,
                rusqlite::params_from_iter(values.iter().map(|v| v.as_ref())),
            )?;
        }

        tx.commit()?;
        if archived > 0 {
            tracing::info!(count = archived, "event_archived");
        }
        Ok(archived)
    }
}

fn prefixed_article_columns() -> String {
    ARTICLE_COLUMNS
        .split(", ")
        .map(|col| format!("a.{}", col.trim()))
        .collect::<Vec<_>>()
        .join(", ")
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open_repo(dir: &TempDir) -> EventRepository {
        EventRepository::open(Some(dir.path().join("test.db"))).unwrap()
    }

    fn new_article(guid: &str, title: &str, embedding: Vec<f32>) -> NewArticle {
        NewArticle {
            guid: guid.into(),
            url: format!("https://example.nl/{}", guid),
            title: title.into(),
            summary: Some("samenvatting".into()),
            content: "inhoud".into(),
            source_name: Some("nos".into()),
            source_metadata: None,
            embedding,
            tfidf: HashMap::from([("kamer".to_string(), 0.5)]),
            entities: vec![Entity::new("Den Haag", Some("GPE"))],
            extracted_locations: vec!["Den Haag".into()],
            extracted_dates: vec![],
            event_type: Some(EventType::Politics),
            published_at: Some(Utc::now()),
            fetched_at: Utc::now(),
        }
    }

    fn seed_breakdown() -> LinkBreakdown {
        LinkBreakdown {
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
        }
    }

    #[test]
    fn test_slugify() {
        assert_eq!(slugify("Kabinet valt over asielbeleid!"), "kabinet-valt-over-asielbeleid");
        assert_eq!(slugify("  --  "), "event");
        assert_eq!(slugify("A&B 1/2"), "a-b-1-2");
    }

    #[test]
    fn test_average_dense_zero_pads_and_adopts_first() {
        assert_eq!(average_dense(&[], &[1.0, 2.0], 0), vec![1.0, 2.0]);
        let averaged = average_dense(&[1.0], &[0.0, 1.0], 1);
        assert_eq!(averaged, vec![0.5, 0.5]);
    }

    #[test]
    fn test_average_sparse_drops_near_zero() {
        let existing = HashMap::from([("a".to_string(), 1e-10_f32)]);
        let new_vector = HashMap::from([("b".to_string(), 1.0_f32)]);
        let averaged = average_sparse(&existing, &new_vector, 1);
        assert!(!averaged.contains_key("a"));
        assert!((averaged["b"] - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_merge_entities_dedupes_case_insensitively() {
        let merged = merge_entities(
            &[Entity::new("Den Haag", Some("GPE"))],
            &[
                Entity::new("den haag", Some("GPE")),
                Entity::new("Rutte", Some("PERSON")),
            ],
        );
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0].text.to_lowercase(), "den haag");
        assert_eq!(merged[1].text, "Rutte");
    }

    #[test]
    fn test_insert_and_get_article_roundtrip() {
        let dir = TempDir::new().unwrap();
        let repo = open_repo(&dir);
        let article = repo
            .insert_article(&new_article("a1", "Kabinet valt", vec![1.0, 0.0]))
            .unwrap();

        let loaded = repo.get_article(article.id).unwrap().unwrap();
        assert_eq!(loaded.title, "Kabinet valt");
        assert_eq!(loaded.embedding, vec![1.0, 0.0]);
        assert_eq!(loaded.event_type, Some(EventType::Politics));
        assert_eq!(loaded.entities.len(), 1);
        assert!(repo.get_article(9999).unwrap().is_none());
    }

    #[test]
    fn test_slug_collision_appends_suffix() {
        let dir = TempDir::new().unwrap();
        let repo = open_repo(&dir);
        let now = Utc::now();

        let a1 = repo
            .insert_article(&new_article("a1", "Brand in Utrecht", vec![1.0]))
            .unwrap();
        let a2 = repo
            .insert_article(&new_article("a2", "Brand in Utrecht", vec![1.0]))
            .unwrap();

        let e1 = repo
            .create_event_skeleton(&a1, &a1.embedding, &a1.tfidf, &a1.entities, now)
            .unwrap();
        let e2 = repo
            .create_event_skeleton(&a2, &a2.embedding, &a2.tfidf, &a2.entities, now)
            .unwrap();

        assert_eq!(e1.slug, "brand-in-utrecht");
        assert_eq!(e2.slug, "brand-in-utrecht-1");
        assert_eq!(e1.event_type, Some(EventType::Politics));
    }

    #[test]
    fn test_append_updates_centroid_incrementally() {
        let dir = TempDir::new().unwrap();
        let repo = open_repo(&dir);
        let now = Utc::now();

        let a1 = repo
            .insert_article(&new_article("a1", "Eerste", vec![1.0, 0.0]))
            .unwrap();
        let event = repo
            .create_event_skeleton(&a1, &a1.embedding, &a1.tfidf, &a1.entities, now)
            .unwrap();
        let (event, _) = repo
            .append_article_to_event(
                event.id,
                &a1,
                &a1.embedding,
                &a1.tfidf,
                &a1.entities,
                1.0,
                &seed_breakdown(),
                now,
            )
            .unwrap();
        assert_eq!(event.article_count, 1);
        assert_eq!(event.centroid_embedding, vec![1.0, 0.0]);

        let a2 = repo
            .insert_article(&new_article("a2", "Tweede", vec![0.0, 1.0]))
            .unwrap();
        let later = now + chrono::Duration::hours(2);
        let (event, link) = repo
            .append_article_to_event(
                event.id,
                &a2,
                &a2.embedding,
                &a2.tfidf,
                &a2.entities,
                0.9,
                &seed_breakdown(),
                later,
            )
            .unwrap();

        assert_eq!(event.article_count, 2);
        assert_eq!(event.centroid_embedding, vec![0.5, 0.5]);
        assert_eq!(event.last_updated_at, later);
        assert!((link.similarity - 0.9).abs() < 1e-6);

        let stored = repo.get_event(event.id).unwrap().unwrap();
        assert_eq!(stored.centroid_embedding, vec![0.5, 0.5]);
        assert_eq!(stored.article_count, 2);
    }

    #[test]
    fn test_append_twice_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let repo = open_repo(&dir);
        let now = Utc::now();

        let a1 = repo
            .insert_article(&new_article("a1", "Eerste", vec![1.0, 0.0]))
            .unwrap();
        let event = repo
            .create_event_skeleton(&a1, &a1.embedding, &a1.tfidf, &a1.entities, now)
            .unwrap();
        for _ in 0..2 {
            repo.append_article_to_event(
                event.id,
                &a1,
                &a1.embedding,
                &a1.tfidf,
                &a1.entities,
                1.0,
                &seed_breakdown(),
                now,
            )
            .unwrap();
        }

        let stored = repo.get_event(event.id).unwrap().unwrap();
        assert_eq!(stored.article_count, 1);
        assert_eq!(stored.centroid_embedding, vec![1.0, 0.0]);
        assert_eq!(repo.links_for_event(event.id).unwrap().len(), 1);
    }

    #[test]
    fn test_archive_events_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let repo = open_repo(&dir);
        let now = Utc::now();

        let a1 = repo
            .insert_article(&new_article("a1", "Oud nieuws", vec![1.0]))
            .unwrap();
        let event = repo
            .create_event_skeleton(&a1, &a1.embedding, &a1.tfidf, &a1.entities, now)
            .unwrap();

        assert_eq!(repo.archive_events(&[event.id], now).unwrap(), 1);
        assert_eq!(repo.archive_events(&[event.id], now).unwrap(), 0);
        assert!(repo.get_event(event.id).unwrap().unwrap().archived_at.is_some());
        assert!(repo.get_events_by_ids(&[event.id]).unwrap().is_empty());
    }

    #[test]
    fn test_snapshots_exclude_archived_and_empty_centroids() {
        let dir = TempDir::new().unwrap();
        let repo = open_repo(&dir);
        let now = Utc::now();

        let a1 = repo
            .insert_article(&new_article("a1", "Met centroid", vec![1.0]))
            .unwrap();
        let a2 = repo
            .insert_article(&new_article("a2", "Zonder centroid", vec![]))
            .unwrap();
        let kept = repo
            .create_event_skeleton(&a1, &a1.embedding, &a1.tfidf, &a1.entities, now)
            .unwrap();
        let empty = repo
            .create_event_skeleton(&a2, &a2.embedding, &a2.tfidf, &a2.entities, now)
            .unwrap();
        let archived = {
            let a3 = repo
                .insert_article(&new_article("a3", "Gearchiveerd", vec![1.0]))
                .unwrap();
            let event = repo
                .create_event_skeleton(&a3, &a3.embedding, &a3.tfidf, &a3.entities, now)
                .unwrap();
            repo.archive_events(&[event.id], now).unwrap();
            event
        };

        let snapshots = repo.fetch_index_snapshots().unwrap();
        let ids: Vec<i64> = snapshots.iter().map(|s| s.event_id).collect();
        assert!(ids.contains(&kept.id));
        assert!(!ids.contains(&empty.id));
        assert!(!ids.contains(&archived.id));
    }

    #[test]
    fn test_load_active_events_with_articles_groups_members() {
        let dir = TempDir::new().unwrap();
        let repo = open_repo(&dir);
        let now = Utc::now();

        let a1 = repo
            .insert_article(&new_article("a1", "Eerste", vec![1.0, 0.0]))
            .unwrap();
        let a2 = repo
            .insert_article(&new_article("a2", "Tweede", vec![0.0, 1.0]))
            .unwrap();
        let event = repo
            .create_event_skeleton(&a1, &a1.embedding, &a1.tfidf, &a1.entities, now)
            .unwrap();
        for article in [&a1, &a2] {
            repo.append_article_to_event(
                event.id,
                article,
                &article.embedding,
                &article.tfidf,
                &article.entities,
                1.0,
                &seed_breakdown(),
                now,
            )
            .unwrap();
        }

        let bundles = repo.load_active_events_with_articles().unwrap();
        assert_eq!(bundles.len(), 1);
        assert_eq!(bundles[0].articles.len(), 2);
    }
}
