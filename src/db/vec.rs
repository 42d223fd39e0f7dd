//! Vector index and similarity search.

use rusqlite::params;

use super::*;

/// In-memory map of active memory id → embedding. Brute-force scans are
/// fine at this scale; the durable copy lives in `memories_vec`.
pub(super) struct VecIndex {
    entries: std::collections::HashMap<String, Vec<f32>>,
}

impl VecIndex {
    pub(super) fn new() -> Self {
        Self { entries: std::collections::HashMap::new() }
    }

    pub(super) fn insert(&mut self, id: String, emb: Vec<f32>) {
        self.entries.insert(id, emb);
    }

    pub(super) fn remove(&mut self, id: &str) {
        self.entries.remove(id);
    }

    pub(super) fn get(&self, id: &str) -> Option<&Vec<f32>> {
        self.entries.get(id)
    }

    pub(super) fn iter(&self) -> impl Iterator<Item = (&String, &Vec<f32>)> {
        self.entries.iter()
    }

    pub(super) fn clear(&mut self) {
        self.entries.clear();
    }
}

/// Squared-root Euclidean distance. Lower is closer.
pub fn l2_distance(a: &[f32], b: &[f32]) -> f64 {
    if a.len() != b.len() || a.is_empty() {
        return f64::MAX;
    }
    let mut sum = 0.0f64;
    for i in 0..a.len() {
        let d = a[i] as f64 - b[i] as f64;
        sum += d * d;
    }
    sum.sqrt()
}

/// Cosine similarity between two vectors.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let (mut dot, mut na, mut nb) = (0.0f64, 0.0f64, 0.0f64);
    for i in 0..a.len() {
        let (ai, bi) = (a[i] as f64, b[i] as f64);
        dot += ai * bi;
        na += ai * ai;
        nb += bi * bi;
    }
    let denom = na.sqrt() * nb.sqrt();
    if denom == 0.0 {
        0.0
    } else {
        dot / denom
    }
}

/// Serialize an f32 vector to little-endian bytes for BLOB storage.
pub fn embedding_to_bytes(v: &[f32]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(v.len() * 4);
    for &f in v {
        buf.extend_from_slice(&f.to_le_bytes());
    }
    buf
}

/// Deserialize bytes back to an f32 vector.
pub fn bytes_to_embedding(b: &[u8]) -> Vec<f32> {
    b.chunks_exact(4)
        .map(|chunk| {
            let arr: [u8; 4] = chunk.try_into().expect("4 bytes");
            f32::from_le_bytes(arr)
        })
        .collect()
}

impl MemoryStore {
    /// Load embeddings of all active memories into the in-memory index.
    pub(super) fn load_vec_index(&self) -> Result<()> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT v.id, v.embedding FROM memories_vec v \
             JOIN memories m ON m.id = v.id WHERE m.is_active = 1",
        )?;
        let pairs: Vec<(String, Vec<f32>)> = stmt
            .query_map([], |row| {
                let id: String = row.get(0)?;
                let blob: Vec<u8> = row.get(1)?;
                Ok((id, bytes_to_embedding(&blob)))
            })?
            .filter_map(|r| r.map_err(|e| tracing::warn!("row parse: {e}")).ok())
            .collect();

        let mut idx = self
            .vec_index
            .write()
            .map_err(|_| MemoryError::Internal("vector index lock poisoned".into()))?;
        idx.clear();
        let count = pairs.len();
        for (id, emb) in pairs {
            idx.insert(id, emb);
        }
        tracing::debug!(count, "loaded vector index");
        Ok(())
    }

    pub(super) fn vec_index_put(&self, id: &str, emb: Vec<f32>) {
        if let Ok(mut idx) = self.vec_index.write() {
            idx.insert(id.to_string(), emb);
        }
    }

    pub(super) fn vec_index_remove(&self, id: &str) {
        if let Ok(mut idx) = self.vec_index.write() {
            idx.remove(id);
        }
    }

    /// Look up the stored embedding for a memory.
    pub fn embedding_of(&self, id: &str) -> Option<Vec<f32>> {
        self.vec_index.read().ok().and_then(|idx| idx.get(id).cloned())
    }

    /// k-nearest active memories by L2 distance, ascending.
    pub fn search_vector(&self, query_emb: &[f32], k: usize) -> Vec<(String, f64)> {
        let Ok(idx) = self.vec_index.read() else { return vec![] };
        let mut scored: Vec<(String, f64)> = idx
            .iter()
            .map(|(id, emb)| (id.clone(), l2_distance(query_emb, emb)))
            .collect();
        scored.sort_by(|a, b| {
            a.1.partial_cmp(&b.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.cmp(&b.0))
        });
        scored.truncate(k);
        scored
    }

    pub(super) fn vec_row_insert(
        conn: &rusqlite::Connection,
        id: &str,
        embedding: &[f32],
    ) -> Result<()> {
        conn.execute(
            "INSERT OR REPLACE INTO memories_vec (id, embedding) VALUES (?1, ?2)",
            params![id, embedding_to_bytes(embedding)],
        )?;
        Ok(())
    }

    pub(super) fn vec_row_delete(conn: &rusqlite::Connection, id: &str) -> Result<()> {
        conn.execute("DELETE FROM memories_vec WHERE id = ?1", params![id])?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn embedding_roundtrip() {
        let original: Vec<f32> = vec![1.0, -2.5, 3.125, 0.0, f32::MAX];
        let bytes = embedding_to_bytes(&original);
        assert_eq!(bytes_to_embedding(&bytes), original);
    }

    #[test]
    fn l2_zero_for_identical() {
        let v = vec![0.5f32, -0.5, 2.0];
        assert!(l2_distance(&v, &v) < 1e-12);
    }

    #[test]
    fn l2_orders_by_closeness() {
        let q = vec![1.0f32, 0.0];
        let near = vec![0.9f32, 0.1];
        let far = vec![-1.0f32, 0.0];
        assert!(l2_distance(&q, &near) < l2_distance(&q, &far));
    }

    #[test]
    fn cosine_same_vec() {
        let v: Vec<f32> = vec![1.0, 2.0, 3.0];
        assert!((cosine_similarity(&v, &v) - 1.0).abs() < 1e-10);
    }

    #[test]
    fn cosine_perpendicular() {
        let a: Vec<f32> = vec![1.0, 0.0];
        let b: Vec<f32> = vec![0.0, 1.0];
        assert!(cosine_similarity(&a, &b).abs() < 1e-10);
    }
}
