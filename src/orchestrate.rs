//! Per-turn control flow: retrieve → inject → chat → log → maybe-flush.
//!
//! The orchestrator is the single point where component errors become
//! user-visible, and the only writer of conversation state. All effects of
//! turn N are observable before any effect of turn N+1.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::MemoryConfig;
use crate::consolidate;
use crate::context::ContextManager;
use crate::db::{DeltaReport, Memory, MemoryOp, MemoryStore, MemoryType, NewMemory};
use crate::distill::{DistilledMemory, Distiller, MemoryAction};
use crate::error::{MemoryError, Result};
use crate::llm::{Embedder, LanguageModel};
use crate::prompts;
use crate::retrieve::{RetrievalResult, Retriever};
use crate::thresholds::CONSOLIDATE_EVERY_FLUSHES;

/// One retrieved memory as surfaced in the turn envelope.
#[derive(Debug, Clone, Serialize)]
pub struct ActiveMemoryInfo {
    pub memory_id: String,
    pub content: String,
    pub origin_turn: i64,
    pub last_used_turn: i64,
    #[serde(rename = "type")]
    pub kind: MemoryType,
    pub confidence: f64,
}

/// Result envelope returned for every chat turn.
#[derive(Debug, Clone, Serialize)]
pub struct TurnOutcome {
    pub response: String,
    pub turn_id: i64,
    pub context_utilization: String,
    pub context_tokens: usize,
    pub retrieval_ms: f64,
    pub total_ms: f64,
    pub flush_triggered: bool,
    pub total_flushes: u64,
    pub total_memories: usize,
    pub active_memories: Vec<ActiveMemoryInfo>,
}

/// What a flush actually changed.
#[derive(Debug, Default, Clone, Serialize)]
pub struct FlushOutcome {
    pub window_turns: usize,
    pub delta: DeltaReport,
    pub kept: usize,
    pub coalesced: usize,
    pub total_memories: usize,
}

struct LiveEntry {
    id: Option<String>,
    value: String,
    source_turn: i64,
}

pub struct Orchestrator {
    store: Arc<MemoryStore>,
    llm: Arc<dyn LanguageModel>,
    embedder: Arc<dyn Embedder>,
    retriever: Retriever,
    distiller: Distiller,
    ctx: ContextManager,
    cfg: MemoryConfig,
    current_turn_id: i64,
    segment_start_turn: i64,
    total_flushes: u64,
}

impl Orchestrator {
    /// Open the store, validate configuration, and restore conversation
    /// state from disk. Fatal errors here (store corruption, embedder
    /// dimension mismatch, degenerate context config) abort construction.
    pub fn new(
        cfg: MemoryConfig,
        llm: Arc<dyn LanguageModel>,
        embedder: Arc<dyn Embedder>,
    ) -> Result<Self> {
        if embedder.dim() != cfg.embedding_dim {
            return Err(MemoryError::Embedding(format!(
                "embedder dimension {} does not match configured embedding_dim {}",
                embedder.dim(),
                cfg.embedding_dim
            )));
        }
        let store = Arc::new(MemoryStore::open(&cfg.db_path)?);
        let ctx = ContextManager::new(cfg.context_limit, cfg.flush_threshold, cfg.keep_tail_n)?;
        let retriever = Retriever::new(store.clone(), embedder.clone(), cfg.rrf_k);
        let distiller = Distiller::new(llm.clone(), cfg.distill_max_tokens);

        let current_turn_id = store.last_turn_id()?;
        let mut orch = Self {
            store,
            llm,
            embedder,
            retriever,
            distiller,
            ctx,
            cfg,
            current_turn_id,
            segment_start_turn: current_turn_id + 1,
            total_flushes: 0,
        };
        orch.rebuild_system_prompt(&[])?;
        info!(
            resumed_turn = current_turn_id,
            memories = orch.store.active_count()?,
            "orchestrator ready"
        );
        Ok(orch)
    }

    pub fn store(&self) -> &Arc<MemoryStore> {
        &self.store
    }

    pub fn total_flushes(&self) -> u64 {
        self.total_flushes
    }

    /// Process one user message end to end.
    ///
    /// Nothing is logged until the model reply arrives, so a turn cancelled
    /// mid-call leaves the turn log unchanged.
    pub async fn chat_turn(&mut self, user_message: &str) -> Result<TurnOutcome> {
        let total_start = Instant::now();
        self.current_turn_id = self.store.last_turn_id()? + 1;

        let retrieval_start = Instant::now();
        let results = self
            .retriever
            .retrieve(user_message, self.cfg.top_k, self.current_turn_id)
            .await?;
        let retrieval_ms = retrieval_start.elapsed().as_secs_f64() * 1000.0;

        let retrieved: Vec<Memory> = results.iter().map(|r| r.memory.clone()).collect();
        self.rebuild_system_prompt(&retrieved)?;
        self.ctx.append("user", user_message);

        let reply = self.llm.chat(&self.ctx.messages_for_api()).await?;
        self.ctx.append("assistant", reply.clone());

        let retrieved_ids: Vec<String> = results.iter().map(|r| r.memory.id.clone()).collect();
        let user_turn = self.store.log_turn("user", user_message, &retrieved_ids)?;
        debug_assert_eq!(user_turn, self.current_turn_id);
        self.current_turn_id = self.store.log_turn("assistant", &reply, &[])?;

        let flush_triggered = self.ctx.needs_flush();
        if flush_triggered {
            self.flush().await?;
        }

        Ok(TurnOutcome {
            response: reply,
            turn_id: user_turn,
            context_utilization: format!("{:.0}%", self.ctx.utilization() * 100.0),
            context_tokens: self.ctx.total_tokens(),
            retrieval_ms,
            total_ms: total_start.elapsed().as_secs_f64() * 1000.0,
            flush_triggered,
            total_flushes: self.total_flushes,
            total_memories: self.store.active_count()?,
            active_memories: results.iter().map(envelope_entry).collect(),
        })
    }

    /// Distill the current window into memory and truncate the context.
    /// Identical to the threshold-triggered flush, invoked by the caller.
    pub async fn manual_flush(&mut self) -> Result<FlushOutcome> {
        self.flush().await
    }

    async fn flush(&mut self) -> Result<FlushOutcome> {
        let window_end = self.store.last_turn_id()?;
        if self.segment_start_turn > window_end {
            debug!("flush requested on empty window, nothing to distill");
            return Ok(FlushOutcome {
                total_memories: self.store.active_count()?,
                ..Default::default()
            });
        }

        let window = self.store.turns_in_range(self.segment_start_turn, window_end)?;
        let active = self.store.get_active()?;
        let delta = self.distiller.distill(&window, &active).await?;

        let (ops, kept, coalesced) = self.resolve_delta(delta, &active).await?;
        let report = self.store.apply_ops(ops)?;

        // Even an empty delta resets the window — unbounded growth is worse
        // than a lost segment.
        self.rebuild_system_prompt(&[])?;
        self.ctx.reset()?;
        self.segment_start_turn = window_end + 1;
        self.total_flushes += 1;
        info!(
            added = report.added,
            updated = report.updated,
            expired = report.expired,
            kept,
            coalesced,
            window = window.len(),
            flushes = self.total_flushes,
            "flushed context into memory"
        );

        if self.total_flushes % CONSOLIDATE_EVERY_FLUSHES == 0 {
            let consolidation = consolidate::run(&self.store, self.current_turn_id)?;
            debug!(
                merged = consolidation.duplicates_merged,
                decayed = consolidation.memories_decayed,
                expired = consolidation.memories_expired,
                "periodic consolidation"
            );
        }

        Ok(FlushOutcome {
            window_turns: window.len(),
            delta: report,
            kept,
            coalesced,
            total_memories: self.store.active_count()?,
        })
    }

    /// Translate a parsed delta into store operations, resolving key
    /// collisions: an `add` whose key is already active and not otherwise
    /// targeted becomes deactivate-then-add, preserving the oldest
    /// source_turn.
    async fn resolve_delta(
        &self,
        delta: Vec<DistilledMemory>,
        active: &[Memory],
    ) -> Result<(Vec<MemoryOp>, usize, usize)> {
        // Evolving view of the active key space as ops accumulate. Entries
        // added within this delta carry no id yet.
        let mut live: HashMap<String, LiveEntry> = active
            .iter()
            .map(|m| {
                (
                    m.key.clone(),
                    LiveEntry {
                        id: Some(m.id.clone()),
                        value: m.value.clone(),
                        source_turn: m.source_turn,
                    },
                )
            })
            .collect();
        let by_id: HashMap<&str, &Memory> = active.iter().map(|m| (m.id.as_str(), m)).collect();

        let mut ops = Vec::new();
        let mut kept = 0;
        let mut coalesced = 0;

        let window_start = self.segment_start_turn;
        for dm in delta {
            match dm.action {
                MemoryAction::Keep => kept += 1,
                MemoryAction::Expire => {
                    let target = dm
                        .id
                        .as_deref()
                        .filter(|id| by_id.contains_key(id))
                        .map(str::to_string)
                        .or_else(|| live.get(&dm.key).and_then(|e| e.id.clone()));
                    match target {
                        Some(id) => {
                            live.retain(|_, e| e.id.as_deref() != Some(id.as_str()));
                            ops.push(MemoryOp::Expire { id });
                        }
                        None => warn!(key = dm.key, "expire targets no active memory, skipping"),
                    }
                }
                MemoryAction::Update => {
                    let existing = dm
                        .id
                        .as_deref()
                        .and_then(|id| by_id.get(id))
                        .map(|m| (m.id.clone(), m.key.clone()))
                        .or_else(|| {
                            live.get(&dm.key)
                                .and_then(|e| e.id.clone())
                                .map(|id| (id, dm.key.clone()))
                        });
                    match existing {
                        Some((id, key)) => {
                            let embedding =
                                self.embedder.embed(&format!("{key}: {}", dm.value)).await?;
                            if let Some(entry) = live.get_mut(&key) {
                                entry.value = dm.value.clone();
                            }
                            ops.push(MemoryOp::Update {
                                id,
                                value: Some(dm.value),
                                confidence: Some(dm.confidence),
                                embedding: Some(embedding),
                            });
                        }
                        None => {
                            // No resolvable target — fall through to add.
                            self.push_add(&mut ops, &mut live, dm, window_start, &mut coalesced)
                                .await?;
                        }
                    }
                }
                MemoryAction::Add => {
                    self.push_add(&mut ops, &mut live, dm, window_start, &mut coalesced).await?;
                }
            }
        }
        Ok((ops, kept, coalesced))
    }

    async fn push_add(
        &self,
        ops: &mut Vec<MemoryOp>,
        live: &mut HashMap<String, LiveEntry>,
        dm: DistilledMemory,
        window_start: i64,
        coalesced: &mut usize,
    ) -> Result<()> {
        let mut source_turn = dm.source_turn.unwrap_or(window_start).max(1);

        if let Some(existing) = live.get(&dm.key) {
            if existing.value.trim().eq_ignore_ascii_case(dm.value.trim()) {
                debug!(key = dm.key, "add duplicates active memory verbatim, skipping");
                return Ok(());
            }
            source_turn = source_turn.min(existing.source_turn);
            if let Some(old_id) = existing.id.clone() {
                // Implicit update: the distiller re-added a live key. Replace
                // the row, keeping the oldest source_turn. Logged to surface
                // distiller-prompt quality issues.
                info!(key = dm.key, old = old_id, "coalescing add into update of active key");
                ops.push(MemoryOp::Expire { id: old_id });
                *coalesced += 1;
            } else {
                // Key added earlier in this same delta with no id yet; the
                // later add wins, drop the earlier op.
                ops.retain(|op| !matches!(op, MemoryOp::Add { fields, .. } if fields.key == dm.key));
            }
            live.remove(&dm.key);
        }

        let embedding = self.embedder.embed(&format!("{}: {}", dm.key, dm.value)).await?;
        live.insert(
            dm.key.clone(),
            LiveEntry { id: None, value: dm.value.clone(), source_turn },
        );
        ops.push(MemoryOp::Add {
            fields: NewMemory {
                kind: dm.kind,
                category: dm.category,
                key: dm.key,
                value: dm.value,
                confidence: dm.confidence,
                source_turn,
            },
            embedding,
        });
        Ok(())
    }

    fn rebuild_system_prompt(&mut self, query_memories: &[Memory]) -> Result<()> {
        let profile = self.store.profile_snapshot()?;
        self.ctx.set_system_prompt(prompts::system_prompt(&profile, query_memories));
        Ok(())
    }
}

fn envelope_entry(result: &RetrievalResult) -> ActiveMemoryInfo {
    let m = &result.memory;
    ActiveMemoryInfo {
        memory_id: m.id.clone(),
        content: format!("{}: {}", m.key, m.value),
        origin_turn: m.source_turn,
        last_used_turn: m.last_used_turn,
        kind: m.kind,
        confidence: m.confidence,
    }
}
