//! SQLite-backed memory store.
//!
//! The relational `memories` table is the single source of truth. Two
//! cooperating indexes — an in-memory vector index persisted through
//! `memories_vec` blobs and an FTS5 table — are rebuildable derivations
//! and are kept transactionally in step with the primary table.

mod fts;
mod memory;
mod turns;
mod vec;

pub use memory::{DeltaReport, MemoryOp, NewMemory};
pub use vec::{bytes_to_embedding, cosine_similarity, embedding_to_bytes, l2_distance};

use std::sync::RwLock;

use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use serde::{Deserialize, Serialize};

use crate::error::{MemoryError, Result};

/// Set busy_timeout on every connection handed out by the pool.
/// Prevents SQLITE_BUSY when a flush transaction overlaps reads.
#[derive(Debug)]
struct BusyTimeoutCustomizer;
impl r2d2::CustomizeConnection<rusqlite::Connection, rusqlite::Error> for BusyTimeoutCustomizer {
    fn on_acquire(&self, conn: &mut rusqlite::Connection) -> std::result::Result<(), rusqlite::Error> {
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        Ok(())
    }
}

type PooledConn = r2d2::PooledConnection<SqliteConnectionManager>;

const MAX_KEY_LEN: usize = 128;
const MAX_VALUE_LEN: usize = 2048;

/// Closed set of memory types. Stored as lowercase strings at the SQL edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemoryType {
    Preference,
    Fact,
    Commitment,
    Relationship,
    Event,
    Skill,
    Constraint,
}

impl MemoryType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Preference => "preference",
            Self::Fact => "fact",
            Self::Commitment => "commitment",
            Self::Relationship => "relationship",
            Self::Event => "event",
            Self::Skill => "skill",
            Self::Constraint => "constraint",
        }
    }
}

impl std::str::FromStr for MemoryType {
    type Err = MemoryError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "preference" => Ok(Self::Preference),
            "fact" => Ok(Self::Fact),
            "commitment" => Ok(Self::Commitment),
            "relationship" => Ok(Self::Relationship),
            "event" => Ok(Self::Event),
            "skill" => Ok(Self::Skill),
            "constraint" => Ok(Self::Constraint),
            other => Err(MemoryError::Validation(format!("unknown memory type '{other}'"))),
        }
    }
}

impl std::fmt::Display for MemoryType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single durable memory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Memory {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: MemoryType,
    pub category: String,
    pub key: String,
    pub value: String,
    pub source_turn: i64,
    pub last_used_turn: i64,
    pub confidence: f64,
    pub created_at: f64,
    pub updated_at: f64,
    pub is_active: bool,
}

/// Immutable record of one logged message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnRecord {
    pub turn_id: i64,
    pub role: String,
    pub content: String,
    pub timestamp: f64,
    pub memories_retrieved: Vec<String>,
}

/// Index coherence snapshot: all three counts must agree.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct IntegrityReport {
    pub active: usize,
    pub vector_indexed: usize,
    pub fts_indexed: usize,
    pub ok: bool,
}

/// Query words dropped before FTS matching.
const STOPWORDS: &[&str] = &[
    "the", "a", "an", "is", "are", "was", "were", "i", "me", "my", "can", "you", "your", "we",
    "they", "it", "its", "this", "that", "in", "on", "at", "to", "for", "of", "with", "and",
    "or", "but", "not", "no", "do", "does", "did", "has", "have", "had", "be", "been", "being",
    "will", "would", "could", "should", "may", "might", "shall", "so", "if", "then", "than",
    "too", "very", "just", "about", "up", "out", "how", "what", "when", "where", "who", "which",
    "there", "here", "all", "each", "every", "both", "few", "more", "most", "other", "some",
    "such", "only", "own", "same", "also", "into", "over", "after", "before", "between",
];

pub(crate) fn is_stopword(word: &str) -> bool {
    STOPWORDS.contains(&word)
}

/// Wall-clock seconds since the Unix epoch.
pub fn now_ts() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("system clock before Unix epoch")
        .as_secs_f64()
}

pub(crate) fn new_memory_id() -> String {
    let hex = uuid::Uuid::new_v4().simple().to_string();
    format!("mem_{}", &hex[..8])
}

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS memories (
    id          TEXT PRIMARY KEY,
    type        TEXT NOT NULL,
    category    TEXT NOT NULL,
    key         TEXT NOT NULL,
    value       TEXT NOT NULL,
    source_turn INTEGER NOT NULL,
    confidence  REAL NOT NULL DEFAULT 0.9,
    created_at  REAL NOT NULL,
    updated_at  REAL NOT NULL,
    is_active   INTEGER NOT NULL DEFAULT 1,
    last_used_turn INTEGER NOT NULL DEFAULT 0
);
CREATE INDEX IF NOT EXISTS idx_memories_key ON memories(key, is_active);
CREATE INDEX IF NOT EXISTS idx_memories_active ON memories(is_active);

CREATE TABLE IF NOT EXISTS turns (
    turn_id     INTEGER PRIMARY KEY,
    role        TEXT NOT NULL,
    content     TEXT NOT NULL,
    timestamp   REAL NOT NULL,
    memories_retrieved TEXT NOT NULL DEFAULT '[]'
);

CREATE TABLE IF NOT EXISTS profile (
    key         TEXT PRIMARY KEY,
    value       TEXT NOT NULL,
    updated_at  REAL NOT NULL,
    source_turn INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS memories_vec (
    id        TEXT PRIMARY KEY REFERENCES memories(id),
    embedding BLOB NOT NULL
);
"#;

// External-content FTS — inserts and deletes are managed manually so the
// index can be scoped to active memories only.
const FTS_SCHEMA: &str = "CREATE VIRTUAL TABLE IF NOT EXISTS memories_fts USING fts5(\
     id UNINDEXED, key, value, category, tokenize='unicode61')";

/// SQLite-backed memory store.
pub struct MemoryStore {
    pool: Pool<SqliteConnectionManager>,
    /// In-memory vector index over active memories, loaded from `memories_vec`.
    vec_index: RwLock<vec::VecIndex>,
}

impl MemoryStore {
    pub(crate) fn conn(&self) -> Result<PooledConn> {
        self.pool.get().map_err(|e| MemoryError::Internal(format!("pool: {e}")))
    }

    /// Open (or create) a database at the given path.
    ///
    /// Runs forward migrations, rebuilds the FTS index if it diverged from
    /// the active set, and loads the vector index.
    pub fn open(path: &str) -> Result<Self> {
        let pool_size = if path == ":memory:" { 2 } else { 8 };
        let manager = if path == ":memory:" {
            // Shared cache so all pool connections see the same in-memory DB.
            // Each open gets a unique name to avoid cross-test pollution.
            let name = uuid::Uuid::new_v4().to_string();
            SqliteConnectionManager::file(format!("file:{name}?mode=memory&cache=shared"))
        } else {
            SqliteConnectionManager::file(path)
        };
        let pool = Pool::builder()
            .max_size(pool_size)
            .connection_customizer(Box::new(BusyTimeoutCustomizer))
            .build(manager)
            .map_err(|e| MemoryError::Internal(format!("pool: {e}")))?;

        let conn = pool.get().map_err(|e| MemoryError::Internal(e.to_string()))?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
        conn.execute_batch(SCHEMA)?;
        conn.execute(FTS_SCHEMA, [])?;

        // Forward migration: databases created before retrieval tracking
        // lack the last_used_turn column.
        if conn.prepare("SELECT last_used_turn FROM memories LIMIT 0").is_err() {
            conn.execute(
                "ALTER TABLE memories ADD COLUMN last_used_turn INTEGER NOT NULL DEFAULT 0",
                [],
            )?;
            tracing::info!("migrated schema: added last_used_turn column");
        }
        drop(conn);

        let store = Self { pool, vec_index: RwLock::new(vec::VecIndex::new()) };
        store.rebuild_fts_if_diverged()?;
        store.load_vec_index()?;
        Ok(store)
    }

    /// Count active/vector/FTS rows. All three must agree after any operation.
    pub fn integrity(&self) -> Result<IntegrityReport> {
        let conn = self.conn()?;
        let active: i64 =
            conn.query_row("SELECT COUNT(*) FROM memories WHERE is_active = 1", [], |r| r.get(0))?;
        let vector: i64 = conn.query_row("SELECT COUNT(*) FROM memories_vec", [], |r| r.get(0))?;
        let fts: i64 = conn.query_row("SELECT COUNT(*) FROM memories_fts", [], |r| r.get(0))?;
        Ok(IntegrityReport {
            active: active as usize,
            vector_indexed: vector as usize,
            fts_indexed: fts as usize,
            ok: active == vector && active == fts,
        })
    }
}

pub(crate) fn validate_new(mem: &NewMemory) -> Result<()> {
    if mem.key.trim().is_empty() {
        return Err(MemoryError::Validation("memory key must not be empty".into()));
    }
    if mem.value.trim().is_empty() {
        return Err(MemoryError::Validation("memory value must not be empty".into()));
    }
    if mem.key.chars().count() > MAX_KEY_LEN {
        return Err(MemoryError::Validation("memory key too long".into()));
    }
    if mem.value.chars().count() > MAX_VALUE_LEN {
        return Err(MemoryError::Validation("memory value too long".into()));
    }
    if !(0.0..=1.0).contains(&mem.confidence) {
        return Err(MemoryError::Validation(format!(
            "confidence {} outside [0, 1]",
            mem.confidence
        )));
    }
    Ok(())
}

pub(crate) fn row_to_memory(row: &rusqlite::Row) -> rusqlite::Result<Memory> {
    let kind_str: String = row.get("type")?;
    let kind = kind_str.parse().map_err(|_| {
        rusqlite::Error::FromSqlConversionFailure(
            0,
            rusqlite::types::Type::Text,
            format!("unknown memory type '{kind_str}'").into(),
        )
    })?;
    Ok(Memory {
        id: row.get("id")?,
        kind,
        category: row.get("category")?,
        key: row.get("key")?,
        value: row.get("value")?,
        source_turn: row.get("source_turn")?,
        last_used_turn: row.get("last_used_turn")?,
        confidence: row.get("confidence")?,
        created_at: row.get("created_at")?,
        updated_at: row.get("updated_at")?,
        is_active: row.get::<_, i64>("is_active")? != 0,
    })
}
