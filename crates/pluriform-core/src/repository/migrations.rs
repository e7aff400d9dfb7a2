//! Database Migrations
//!
//! Schema migration definitions for the storage layer.

/// Migration definitions
pub const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        description: "Initial schema: articles, events, event_articles",
        up: MIGRATION_V1_UP,
    },
    Migration {
        version: 2,
        description: "Indexes for candidate lookup and maintenance scans",
        up: MIGRATION_V2_UP,
    },
];

/// A database migration
#[derive(Debug, Clone)]
pub struct Migration {
    /// Version number
    pub version: u32,
    /// Description
    pub description: &'static str,
    /// SQL to apply
    pub up: &'static str,
}

/// V1: Initial schema
const MIGRATION_V1_UP: &str = r#"
CREATE TABLE IF NOT EXISTS articles (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    guid TEXT NOT NULL,
    url TEXT NOT NULL,
    title TEXT NOT NULL,
    summary TEXT,
    content TEXT NOT NULL DEFAULT '',
    source_name TEXT,
    source_metadata TEXT,

    -- Precomputed NLP features from the enrichment pipeline
    embedding BLOB,
    tfidf TEXT,
    entities TEXT DEFAULT '[]',
    extracted_locations TEXT DEFAULT '[]',
    extracted_dates TEXT DEFAULT '[]',
    event_type TEXT,

    published_at TEXT,
    fetched_at TEXT NOT NULL,

    UNIQUE (guid),
    UNIQUE (url)
);

CREATE TABLE IF NOT EXISTS events (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    slug TEXT NOT NULL UNIQUE,
    title TEXT,
    description TEXT,

    -- Running means over member articles
    centroid_embedding BLOB,
    centroid_tfidf TEXT,
    centroid_entities TEXT DEFAULT '[]',

    event_type TEXT,
    first_seen_at TEXT NOT NULL,
    last_updated_at TEXT NOT NULL,
    article_count INTEGER NOT NULL DEFAULT 0,
    archived_at TEXT
);

CREATE TABLE IF NOT EXISTS event_articles (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    event_id INTEGER NOT NULL REFERENCES events(id) ON DELETE CASCADE,
    article_id INTEGER NOT NULL REFERENCES articles(id) ON DELETE CASCADE,
    similarity REAL,
    breakdown TEXT,
    linked_at TEXT NOT NULL,

    UNIQUE (event_id, article_id)
);

-- Schema version tracking
CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER PRIMARY KEY,
    applied_at TEXT NOT NULL
);

INSERT OR IGNORE INTO schema_version (version, applied_at) VALUES (1, datetime('now'));
"#;

/// V2: Indexes for the hot paths (candidate event loads, maintenance scans)
const MIGRATION_V2_UP: &str = r#"
CREATE INDEX IF NOT EXISTS idx_events_archived ON events(archived_at);
CREATE INDEX IF NOT EXISTS idx_events_last_updated ON events(last_updated_at);
CREATE INDEX IF NOT EXISTS idx_events_event_type ON events(event_type);
CREATE INDEX IF NOT EXISTS idx_event_articles_event ON event_articles(event_id);
CREATE INDEX IF NOT EXISTS idx_event_articles_article ON event_articles(article_id);
CREATE INDEX IF NOT EXISTS idx_articles_event_type ON articles(event_type);

UPDATE schema_version SET version = 2, applied_at = datetime('now');
"#;

/// Get current schema version from database
pub fn get_current_version(conn: &rusqlite::Connection) -> rusqlite::Result<u32> {
    conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_version",
        [],
        |row| row.get(0),
    )
    .or(Ok(0))
}

/// Apply pending migrations
pub fn apply_migrations(conn: &rusqlite::Connection) -> rusqlite::Result<u32> {
    let current_version = get_current_version(conn)?;
    let mut applied = 0;

    for migration in MIGRATIONS {
        if migration.version > current_version {
            tracing::info!(
                "Applying migration v{}: {}",
                migration.version,
                migration.description
            );
            conn.execute_batch(migration.up)?;
            applied += 1;
        }
    }

    Ok(applied)
}
