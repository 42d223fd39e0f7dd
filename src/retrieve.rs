//! Hybrid retrieval: vector + full-text search fused with Reciprocal Rank
//! Fusion.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::db::{Memory, MemoryStore};
use crate::error::Result;
use crate::llm::Embedder;

/// Both index lists are overfetched by this factor so RRF has enough
/// candidates to outrank single-index noise.
const OVERFETCH: usize = 3;

/// A retrieved memory with its fused score and the per-index ranks that
/// produced it (rank 0 = best; `None` = absent from that list).
#[derive(Debug, Clone)]
pub struct RetrievalResult {
    pub memory: Memory,
    pub score: f64,
    pub vector_rank: Option<usize>,
    pub fts_rank: Option<usize>,
}

pub struct Retriever {
    store: Arc<MemoryStore>,
    embedder: Arc<dyn Embedder>,
    rrf_k: f64,
}

#[derive(Default)]
struct Candidate {
    fused: f64,
    vector_rank: Option<usize>,
    fts_rank: Option<usize>,
}

fn rank_ord(rank: Option<usize>) -> usize {
    rank.unwrap_or(usize::MAX)
}

impl Retriever {
    pub fn new(store: Arc<MemoryStore>, embedder: Arc<dyn Embedder>, rrf_k: f64) -> Self {
        Self { store, embedder, rrf_k }
    }

    /// Find the most relevant active memories for `query`.
    ///
    /// Every returned memory is touched with `current_turn` before the
    /// result leaves the retriever, so callers observe the updated
    /// `last_used_turn`. An empty store yields an empty list; an embedding
    /// failure degrades to FTS-only retrieval.
    pub async fn retrieve(
        &self,
        query: &str,
        top_k: usize,
        current_turn: i64,
    ) -> Result<Vec<RetrievalResult>> {
        if top_k == 0 || self.store.active_count()? == 0 {
            return Ok(vec![]);
        }

        let vector_hits = match self.embedder.embed(query).await {
            Ok(qv) => self.store.search_vector(&qv, top_k * OVERFETCH),
            Err(e) => {
                warn!(error = %e, "embedding unavailable, degrading to FTS-only retrieval");
                vec![]
            }
        };
        let fts_hits = self.store.search_fts(query, top_k * OVERFETCH);
        debug!(
            vector = vector_hits.len(),
            fts = fts_hits.len(),
            "retrieval candidates"
        );

        let mut candidates: HashMap<String, Candidate> = HashMap::new();
        for (rank, (id, _distance)) in vector_hits.iter().enumerate() {
            let c = candidates.entry(id.clone()).or_default();
            c.fused += 1.0 / (self.rrf_k + rank as f64);
            c.vector_rank = Some(rank);
        }
        for (rank, (id, _score)) in fts_hits.iter().enumerate() {
            let c = candidates.entry(id.clone()).or_default();
            c.fused += 1.0 / (self.rrf_k + rank as f64);
            c.fts_rank = Some(rank);
        }

        let mut ranked: Vec<(String, Candidate)> = candidates.into_iter().collect();
        ranked.sort_by(|(id_a, a), (id_b, b)| {
            b.fused
                .partial_cmp(&a.fused)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| rank_ord(a.vector_rank).cmp(&rank_ord(b.vector_rank)))
                .then_with(|| rank_ord(a.fts_rank).cmp(&rank_ord(b.fts_rank)))
                .then_with(|| id_a.cmp(id_b))
        });

        let mut results = Vec::with_capacity(top_k);
        for (id, cand) in ranked {
            if results.len() >= top_k {
                break;
            }
            let Some(memory) = self.store.get_by_id(&id)? else {
                debug!(id, "candidate vanished between search and fetch");
                continue;
            };
            if !memory.is_active {
                continue;
            }
            // Touch before the result leaves, so downstream readers see the
            // updated last_used_turn.
            self.store.touch(&id, current_turn)?;
            let mut memory = memory;
            memory.last_used_turn = memory.last_used_turn.max(current_turn);
            results.push(RetrievalResult {
                memory,
                score: cand.fused,
                vector_rank: cand.vector_rank,
                fts_rank: cand.fts_rank,
            });
        }
        Ok(results)
    }
}
