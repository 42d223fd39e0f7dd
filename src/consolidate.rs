//! Periodic memory maintenance: duplicate merging, staleness decay, and
//! low-confidence expiration.
//!
//! Over long conversations the store accumulates near-duplicates and stale
//! claims that clutter retrieval. A consolidation pass keeps the active set
//! lean without involving the LLM.

use serde::Serialize;
use tracing::{debug, info};

use crate::db::{cosine_similarity, Memory, MemoryStore};
use crate::error::Result;
use crate::thresholds::{
    DECAY_FACTOR, DECAY_TURN_THRESHOLD, DUPLICATE_COSINE_SIM, EXPIRE_MIN_CONFIDENCE,
};

/// Summary of a single consolidation run.
#[derive(Debug, Default, Clone, Serialize)]
pub struct ConsolidationReport {
    pub duplicates_found: usize,
    pub duplicates_merged: usize,
    pub memories_decayed: usize,
    pub memories_expired: usize,
    pub active_before: usize,
    pub active_after: usize,
}

/// A cluster of memories expressing the same underlying fact.
struct DuplicateGroup {
    canonical: Memory,
    duplicates: Vec<Memory>,
}

/// Run all consolidation steps and return a summary report.
pub fn run(store: &MemoryStore, current_turn: i64) -> Result<ConsolidationReport> {
    let active_before = store.active_count()?;

    let groups = find_duplicates(store)?;
    let duplicates_found = groups.len();
    let mut duplicates_merged = 0;
    for group in &groups {
        for dup in &group.duplicates {
            store.expire(&dup.id)?;
            debug!(
                duplicate = dup.id,
                canonical = group.canonical.id,
                key = dup.key,
                "expired duplicate memory"
            );
            duplicates_merged += 1;
        }
    }

    let memories_decayed = decay_stale(store, current_turn)?;
    let memories_expired = expire_low_confidence(store)?;

    let report = ConsolidationReport {
        duplicates_found,
        duplicates_merged,
        memories_decayed,
        memories_expired,
        active_before,
        active_after: store.active_count()?,
    };
    info!(
        merged = report.duplicates_merged,
        decayed = report.memories_decayed,
        expired = report.memories_expired,
        before = report.active_before,
        after = report.active_after,
        "consolidation complete"
    );
    Ok(report)
}

/// Two-pass duplicate detection: exact key match (defensive — key
/// uniqueness should already hold), then pairwise cosine similarity over
/// stored embeddings.
fn find_duplicates(store: &MemoryStore) -> Result<Vec<DuplicateGroup>> {
    let active = store.get_active()?;
    if active.len() < 2 {
        return Ok(vec![]);
    }

    let mut grouped: std::collections::HashSet<String> = std::collections::HashSet::new();
    let mut groups = Vec::new();

    let mut by_key: std::collections::HashMap<&str, Vec<&Memory>> =
        std::collections::HashMap::new();
    for mem in &active {
        by_key.entry(mem.key.as_str()).or_default().push(mem);
    }
    for mems in by_key.values() {
        if mems.len() < 2 {
            continue;
        }
        let (canonical, duplicates) = pick_canonical(mems.iter().map(|m| (*m).clone()).collect());
        for m in mems {
            grouped.insert(m.id.clone());
        }
        groups.push(DuplicateGroup { canonical, duplicates });
    }

    for (i, mem) in active.iter().enumerate() {
        if grouped.contains(&mem.id) {
            continue;
        }
        let Some(emb) = store.embedding_of(&mem.id) else { continue };

        let mut cluster = vec![mem.clone()];
        for other in active.iter().skip(i + 1) {
            if grouped.contains(&other.id) {
                continue;
            }
            let Some(other_emb) = store.embedding_of(&other.id) else { continue };
            if cosine_similarity(&emb, &other_emb) >= DUPLICATE_COSINE_SIM {
                cluster.push(other.clone());
            }
        }
        if cluster.len() < 2 {
            continue;
        }
        for m in &cluster {
            grouped.insert(m.id.clone());
        }
        let (canonical, duplicates) = pick_canonical(cluster);
        groups.push(DuplicateGroup { canonical, duplicates });
    }

    Ok(groups)
}

/// Choose the best memory of a cluster: highest confidence, then most
/// recently updated.
fn pick_canonical(mut memories: Vec<Memory>) -> (Memory, Vec<Memory>) {
    memories.sort_by(|a, b| {
        b.confidence
            .partial_cmp(&a.confidence)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| {
                b.updated_at.partial_cmp(&a.updated_at).unwrap_or(std::cmp::Ordering::Equal)
            })
    });
    let canonical = memories.remove(0);
    (canonical, memories)
}

/// Reduce confidence of memories retrieved at least once but unused for
/// more than `DECAY_TURN_THRESHOLD` turns. Never-retrieved memories are
/// left alone — they may simply not have been needed yet.
fn decay_stale(store: &MemoryStore, current_turn: i64) -> Result<usize> {
    let mut decayed = 0;
    for mem in store.get_active()? {
        if mem.last_used_turn <= 0 {
            continue;
        }
        if current_turn - mem.last_used_turn <= DECAY_TURN_THRESHOLD {
            continue;
        }
        let new_confidence = mem.confidence * DECAY_FACTOR;
        store.update(&mem.id, None, Some(new_confidence), None)?;
        debug!(
            id = mem.id,
            key = mem.key,
            from = mem.confidence,
            to = new_confidence,
            "decayed stale memory"
        );
        decayed += 1;
    }
    Ok(decayed)
}

/// Deactivate memories whose confidence has fallen below the floor.
fn expire_low_confidence(store: &MemoryStore) -> Result<usize> {
    let mut expired = 0;
    for mem in store.get_active()? {
        if mem.confidence >= EXPIRE_MIN_CONFIDENCE {
            continue;
        }
        store.expire(&mem.id)?;
        debug!(id = mem.id, key = mem.key, confidence = mem.confidence, "expired low-confidence memory");
        expired += 1;
    }
    Ok(expired)
}
