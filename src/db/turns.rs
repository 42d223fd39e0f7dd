//! Turn log and profile projection.

use rusqlite::params;

use super::*;

impl MemoryStore {
    /// Append an immutable turn record and return its id. Ids are assigned
    /// by the store — strictly increasing and dense, including across
    /// restarts.
    pub fn log_turn(&self, role: &str, content: &str, memories_retrieved: &[String]) -> Result<i64> {
        let retrieved_json =
            serde_json::to_string(memories_retrieved).unwrap_or_else(|_| "[]".into());
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO turns (turn_id, role, content, timestamp, memories_retrieved) \
             SELECT COALESCE(MAX(turn_id), 0) + 1, ?1, ?2, ?3, ?4 FROM turns",
            params![role, content, now_ts(), retrieved_json],
        )?;
        let id: i64 = conn.query_row("SELECT MAX(turn_id) FROM turns", [], |r| r.get(0))?;
        Ok(id)
    }

    /// Highest logged turn id; 0 when the log is empty.
    pub fn last_turn_id(&self) -> Result<i64> {
        let id: Option<i64> =
            self.conn()?.query_row("SELECT MAX(turn_id) FROM turns", [], |r| r.get(0))?;
        Ok(id.unwrap_or(0))
    }

    /// Turn records in `[start, end]` inclusive, oldest first.
    pub fn turns_in_range(&self, start: i64, end: i64) -> Result<Vec<TurnRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT turn_id, role, content, timestamp, memories_retrieved \
             FROM turns WHERE turn_id >= ?1 AND turn_id <= ?2 ORDER BY turn_id ASC",
        )?;
        let rows = stmt
            .query_map(params![start, end], |row| {
                let retrieved_json: String = row.get(4)?;
                Ok(TurnRecord {
                    turn_id: row.get(0)?,
                    role: row.get(1)?,
                    content: row.get(2)?,
                    timestamp: row.get(3)?,
                    memories_retrieved: serde_json::from_str(&retrieved_json).unwrap_or_default(),
                })
            })?
            .filter_map(|r| r.map_err(|e| tracing::warn!("row parse: {e}")).ok())
            .collect();
        Ok(rows)
    }

    pub(super) fn profile_upsert_in_conn(
        conn: &rusqlite::Connection,
        key: &str,
        value: &str,
        source_turn: i64,
    ) -> Result<()> {
        conn.execute(
            "INSERT OR REPLACE INTO profile (key, value, updated_at, source_turn) \
             VALUES (?1, ?2, ?3, ?4)",
            params![key, value, now_ts(), source_turn],
        )?;
        Ok(())
    }

    pub(super) fn profile_delete_in_conn(conn: &rusqlite::Connection, key: &str) -> Result<()> {
        conn.execute("DELETE FROM profile WHERE key = ?1", params![key])?;
        Ok(())
    }

    pub fn profile_upsert(&self, key: &str, value: &str, source_turn: i64) -> Result<()> {
        let conn = self.conn()?;
        Self::profile_upsert_in_conn(&conn, key, value, source_turn)
    }

    pub fn profile_delete(&self, key: &str) -> Result<()> {
        let conn = self.conn()?;
        Self::profile_delete_in_conn(&conn, key)
    }

    /// Flat key→value view of the profile, ordered by key so prompt output
    /// is stable.
    pub fn profile_snapshot(&self) -> Result<std::collections::BTreeMap<String, String>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT key, value FROM profile ORDER BY key")?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?
            .filter_map(|r| r.map_err(|e| tracing::warn!("row parse: {e}")).ok())
            .collect();
        Ok(rows)
    }
}
