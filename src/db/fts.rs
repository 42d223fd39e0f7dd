//! FTS5 full-text search over key, value, and category.

use rusqlite::params;

use super::*;

impl MemoryStore {
    pub(super) fn fts_row_insert(
        conn: &rusqlite::Connection,
        id: &str,
        key: &str,
        value: &str,
        category: &str,
    ) -> Result<()> {
        conn.execute(
            "INSERT INTO memories_fts(id, key, value, category) VALUES (?1, ?2, ?3, ?4)",
            params![id, key, value, category],
        )?;
        Ok(())
    }

    pub(super) fn fts_row_delete(conn: &rusqlite::Connection, id: &str) -> Result<()> {
        conn.execute("DELETE FROM memories_fts WHERE id = ?1", params![id])?;
        Ok(())
    }

    /// Rebuild the FTS index from the active set when row counts diverge
    /// (e.g. after a crash between index writes). Idempotent, runs on open.
    pub(super) fn rebuild_fts_if_diverged(&self) -> Result<()> {
        let conn = self.conn()?;
        let fts_count: i64 =
            conn.query_row("SELECT COUNT(*) FROM memories_fts", [], |r| r.get(0))?;
        let active_count: i64 =
            conn.query_row("SELECT COUNT(*) FROM memories WHERE is_active = 1", [], |r| r.get(0))?;
        if fts_count == active_count {
            return Ok(());
        }

        conn.execute("DELETE FROM memories_fts", [])?;
        let mut stmt =
            conn.prepare("SELECT id, key, value, category FROM memories WHERE is_active = 1")?;
        let rows: Vec<(String, String, String, String)> = stmt
            .query_map([], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
            })?
            .filter_map(|r| r.map_err(|e| tracing::warn!("row parse: {e}")).ok())
            .collect();
        for (id, key, value, category) in &rows {
            Self::fts_row_insert(&conn, id, key, value, category)?;
        }
        tracing::info!(count = rows.len(), "rebuilt FTS index from primary table");
        Ok(())
    }

    /// Top-k BM25 matches among active memories. Returns `(id, score)` with
    /// higher scores better. Stopwords and one/two-letter words are dropped
    /// from the query before matching.
    pub fn search_fts(&self, query: &str, k: usize) -> Vec<(String, f64)> {
        let words: Vec<String> = query
            .to_lowercase()
            .split(|c: char| !c.is_alphanumeric() && c != '_')
            .filter(|w| w.len() > 2 && !is_stopword(w))
            .take(10)
            .map(str::to_string)
            .collect();
        if words.is_empty() {
            return vec![];
        }
        let fts_query = words.join(" OR ");

        let Ok(conn) = self.conn() else { return vec![] };
        let Ok(mut stmt) = conn.prepare(
            "SELECT id, rank FROM memories_fts \
             WHERE memories_fts MATCH ?1 ORDER BY rank LIMIT ?2",
        ) else {
            return vec![];
        };

        stmt.query_map(params![fts_query, k as i64], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, f64>(1)?))
        })
        .map(|iter| {
            iter.filter_map(|r| r.ok())
                // FTS5 rank is negative-better; flip so higher is better.
                .map(|(id, rank)| (id, -rank))
                .collect()
        })
        .unwrap_or_default()
    }

}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{MemoryStore, MemoryType, NewMemory};

    fn store_with(key: &str, value: &str) -> MemoryStore {
        let store = MemoryStore::open(":memory:").expect("in-memory store");
        store
            .add(
                NewMemory {
                    kind: MemoryType::Fact,
                    category: "general".into(),
                    key: key.into(),
                    value: value.into(),
                    confidence: 0.9,
                    source_turn: 1,
                },
                &[0.1, 0.2, 0.3],
            )
            .unwrap();
        store
    }

    #[test]
    fn fts_matches_value_words() {
        let store = store_with("favorite_food", "spicy ramen with extra garlic");
        let hits = store.search_fts("ramen garlic", 10);
        assert_eq!(hits.len(), 1);
    }

    #[test]
    fn fts_matches_key_tokens() {
        let store = store_with("favorite_food", "spicy ramen");
        assert!(!store.search_fts("favorite_food", 10).is_empty());
    }

    #[test]
    fn stopword_only_query_is_empty() {
        let store = store_with("favorite_food", "spicy ramen");
        assert!(store.search_fts("what is the", 10).is_empty());
    }

    #[test]
    fn expired_rows_leave_the_index() {
        let store = store_with("favorite_food", "spicy ramen");
        let id = store.find_by_key("favorite_food").unwrap().unwrap().id;
        store.expire(&id).unwrap();
        assert!(store.search_fts("ramen", 10).is_empty());
    }
}
