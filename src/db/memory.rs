//! Memory CRUD and transactional delta application.

use rusqlite::params;

use crate::thresholds::PROFILE_MIN_CONFIDENCE;

use super::*;

/// Fields required to create a memory. The store assigns the id and
/// timestamps; the key is canonicalized to lowercase on insert.
#[derive(Debug, Clone)]
pub struct NewMemory {
    pub kind: MemoryType,
    pub category: String,
    pub key: String,
    pub value: String,
    pub confidence: f64,
    pub source_turn: i64,
}

/// One resolved action of a distillation delta, ready to apply.
#[derive(Debug)]
pub enum MemoryOp {
    Add { fields: NewMemory, embedding: Vec<f32> },
    Update { id: String, value: Option<String>, confidence: Option<f64>, embedding: Option<Vec<f32>> },
    Expire { id: String },
}

/// What a delta application actually did.
#[derive(Debug, Default, Clone, Copy, serde::Serialize)]
pub struct DeltaReport {
    pub added: usize,
    pub updated: usize,
    pub expired: usize,
}

enum IndexEdit {
    Put(String, Vec<f32>),
    Remove(String),
}

impl MemoryStore {
    /// Insert a new memory into all three indexes atomically. Fails with
    /// `DuplicateKey` if an active memory already holds the key.
    pub fn add(&self, mem: NewMemory, embedding: &[f32]) -> Result<String> {
        validate_new(&mem)?;
        let conn = self.conn()?;
        conn.execute_batch("BEGIN IMMEDIATE")?;
        let result = Self::add_in_conn(&conn, &mem, embedding);
        match result {
            Ok(id) => {
                conn.execute_batch("COMMIT")?;
                self.vec_index_put(&id, embedding.to_vec());
                Ok(id)
            }
            Err(e) => {
                let _ = conn.execute_batch("ROLLBACK");
                Err(e)
            }
        }
    }

    fn add_in_conn(conn: &rusqlite::Connection, mem: &NewMemory, embedding: &[f32]) -> Result<String> {
        let key = mem.key.trim().to_lowercase();
        let exists: i64 = conn.query_row(
            "SELECT COUNT(*) FROM memories WHERE key = ?1 AND is_active = 1",
            params![key],
            |r| r.get(0),
        )?;
        if exists > 0 {
            return Err(MemoryError::DuplicateKey(key));
        }

        let id = new_memory_id();
        let now = now_ts();
        conn.execute(
            "INSERT INTO memories \
             (id, type, category, key, value, source_turn, confidence, \
              created_at, updated_at, is_active, last_used_turn) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8, 1, 0)",
            params![
                id,
                mem.kind.as_str(),
                mem.category,
                key,
                mem.value,
                mem.source_turn,
                mem.confidence,
                now,
            ],
        )?;
        Self::vec_row_insert(conn, &id, embedding)?;
        Self::fts_row_insert(conn, &id, &key, &mem.value, &mem.category)?;

        if mem.kind == MemoryType::Preference && mem.confidence >= PROFILE_MIN_CONFIDENCE {
            Self::profile_upsert_in_conn(conn, &key, &mem.value, mem.source_turn)?;
        }
        Ok(id)
    }

    /// Mutate value and/or confidence in place, optionally re-embedding.
    /// Atomic across all three indexes; `source_turn` is preserved.
    pub fn update(
        &self,
        id: &str,
        value: Option<&str>,
        confidence: Option<f64>,
        embedding: Option<&[f32]>,
    ) -> Result<Memory> {
        let conn = self.conn()?;
        conn.execute_batch("BEGIN IMMEDIATE")?;
        let result = Self::update_in_conn(&conn, id, value, confidence, embedding);
        match result {
            Ok(updated) => {
                conn.execute_batch("COMMIT")?;
                if let Some(emb) = embedding {
                    self.vec_index_put(id, emb.to_vec());
                }
                Ok(updated)
            }
            Err(e) => {
                let _ = conn.execute_batch("ROLLBACK");
                Err(e)
            }
        }
    }

    fn update_in_conn(
        conn: &rusqlite::Connection,
        id: &str,
        value: Option<&str>,
        confidence: Option<f64>,
        embedding: Option<&[f32]>,
    ) -> Result<Memory> {
        let current = Self::get_in_conn(conn, id)?
            .filter(|m| m.is_active)
            .ok_or_else(|| MemoryError::NotFound(id.to_string()))?;

        if let Some(c) = confidence {
            if !(0.0..=1.0).contains(&c) {
                return Err(MemoryError::Validation(format!("confidence {c} outside [0, 1]")));
            }
        }
        if let Some(v) = value {
            if v.trim().is_empty() {
                return Err(MemoryError::Validation("memory value must not be empty".into()));
            }
        }

        let new_value = value.unwrap_or(&current.value);
        let new_confidence = confidence.unwrap_or(current.confidence);
        conn.execute(
            "UPDATE memories SET value = ?1, confidence = ?2, updated_at = ?3 WHERE id = ?4",
            params![new_value, new_confidence, now_ts(), id],
        )?;
        if let Some(emb) = embedding {
            Self::vec_row_insert(conn, id, emb)?;
        }
        if value.is_some() {
            Self::fts_row_delete(conn, id)?;
            Self::fts_row_insert(conn, id, &current.key, new_value, &current.category)?;
        }

        if current.kind == MemoryType::Preference {
            if new_confidence >= PROFILE_MIN_CONFIDENCE {
                Self::profile_upsert_in_conn(conn, &current.key, new_value, current.source_turn)?;
            } else {
                Self::profile_delete_in_conn(conn, &current.key)?;
            }
        }

        Self::get_in_conn(conn, id)?.ok_or_else(|| MemoryError::NotFound(id.to_string()))
    }

    /// Soft-delete: clears `is_active` and removes the vector and FTS
    /// entries. The relational row is retained for audit.
    pub fn expire(&self, id: &str) -> Result<()> {
        let conn = self.conn()?;
        conn.execute_batch("BEGIN IMMEDIATE")?;
        let result = Self::expire_in_conn(&conn, id);
        match result {
            Ok(_) => {
                conn.execute_batch("COMMIT")?;
                self.vec_index_remove(id);
                Ok(())
            }
            Err(e) => {
                let _ = conn.execute_batch("ROLLBACK");
                Err(e)
            }
        }
    }

    fn expire_in_conn(conn: &rusqlite::Connection, id: &str) -> Result<Memory> {
        let mem = Self::get_in_conn(conn, id)?
            .ok_or_else(|| MemoryError::NotFound(id.to_string()))?;
        conn.execute(
            "UPDATE memories SET is_active = 0, updated_at = ?1 WHERE id = ?2",
            params![now_ts(), id],
        )?;
        Self::vec_row_delete(conn, id)?;
        Self::fts_row_delete(conn, id)?;
        if mem.kind == MemoryType::Preference {
            Self::profile_delete_in_conn(conn, &mem.key)?;
        }
        Ok(mem)
    }

    /// Soft-delete the active memory holding `key`, if any.
    pub fn expire_key(&self, key: &str) -> Result<()> {
        match self.find_by_key(key)? {
            Some(mem) => self.expire(&mem.id),
            None => Err(MemoryError::NotFound(format!("active key '{key}'"))),
        }
    }

    /// Record that a memory surfaced at `turn_id`. Never decreases
    /// `last_used_turn`.
    pub fn touch(&self, id: &str, turn_id: i64) -> Result<()> {
        self.conn()?.execute(
            "UPDATE memories SET last_used_turn = ?2 WHERE id = ?1 AND last_used_turn < ?2",
            params![id, turn_id],
        )?;
        Ok(())
    }

    /// All active memories, highest confidence first.
    pub fn get_active(&self) -> Result<Vec<Memory>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT * FROM memories WHERE is_active = 1 ORDER BY confidence DESC, key ASC",
        )?;
        let rows = stmt
            .query_map([], row_to_memory)?
            .filter_map(|r| r.map_err(|e| tracing::warn!("row parse: {e}")).ok())
            .collect();
        Ok(rows)
    }

    pub fn get_by_id(&self, id: &str) -> Result<Option<Memory>> {
        let conn = self.conn()?;
        Self::get_in_conn(&conn, id)
    }

    fn get_in_conn(conn: &rusqlite::Connection, id: &str) -> Result<Option<Memory>> {
        let mut stmt = conn.prepare("SELECT * FROM memories WHERE id = ?1")?;
        let mut rows = stmt.query(params![id])?;
        match rows.next()? {
            Some(row) => Ok(Some(row_to_memory(row)?)),
            None => Ok(None),
        }
    }

    /// The active memory holding `key`, if any.
    pub fn find_by_key(&self, key: &str) -> Result<Option<Memory>> {
        let conn = self.conn()?;
        let mut stmt =
            conn.prepare("SELECT * FROM memories WHERE key = ?1 AND is_active = 1 LIMIT 1")?;
        let mut rows = stmt.query(params![key.trim().to_lowercase()])?;
        match rows.next()? {
            Some(row) => Ok(Some(row_to_memory(row)?)),
            None => Ok(None),
        }
    }

    pub fn active_count(&self) -> Result<usize> {
        let n: i64 = self.conn()?.query_row(
            "SELECT COUNT(*) FROM memories WHERE is_active = 1",
            [],
            |r| r.get(0),
        )?;
        Ok(n as usize)
    }

    /// Apply a whole distillation delta in one transaction: either every
    /// action lands or none do. Ops are applied in order, so an `Expire`
    /// that frees a key must precede the `Add` that reuses it.
    pub fn apply_ops(&self, ops: Vec<MemoryOp>) -> Result<DeltaReport> {
        if ops.is_empty() {
            return Ok(DeltaReport::default());
        }
        let conn = self.conn()?;
        conn.execute_batch("BEGIN IMMEDIATE")?;

        let mut report = DeltaReport::default();
        let mut edits: Vec<IndexEdit> = Vec::new();
        let result = (|| -> Result<()> {
            for op in &ops {
                match op {
                    MemoryOp::Add { fields, embedding } => {
                        validate_new(fields)?;
                        let id = Self::add_in_conn(&conn, fields, embedding)?;
                        edits.push(IndexEdit::Put(id, embedding.clone()));
                        report.added += 1;
                    }
                    MemoryOp::Update { id, value, confidence, embedding } => {
                        Self::update_in_conn(
                            &conn,
                            id,
                            value.as_deref(),
                            *confidence,
                            embedding.as_deref(),
                        )?;
                        if let Some(emb) = embedding {
                            edits.push(IndexEdit::Put(id.clone(), emb.clone()));
                        }
                        report.updated += 1;
                    }
                    MemoryOp::Expire { id } => {
                        Self::expire_in_conn(&conn, id)?;
                        edits.push(IndexEdit::Remove(id.clone()));
                        report.expired += 1;
                    }
                }
            }
            Ok(())
        })();

        match result {
            Ok(()) => {
                conn.execute_batch("COMMIT")?;
                for edit in edits {
                    match edit {
                        IndexEdit::Put(id, emb) => self.vec_index_put(&id, emb),
                        IndexEdit::Remove(id) => self.vec_index_remove(&id),
                    }
                }
                Ok(report)
            }
            Err(e) => {
                let _ = conn.execute_batch("ROLLBACK");
                Err(e)
            }
        }
    }
}
