//! Tuning constants shared across components.

/// Consolidation: cosine similarity above which two memories count as
/// duplicates of the same underlying fact.
pub const DUPLICATE_COSINE_SIM: f64 = 0.85;

/// Consolidation: a memory retrieved at least once but unused for this many
/// turns starts losing confidence.
pub const DECAY_TURN_THRESHOLD: i64 = 200;

/// Consolidation: multiplier applied to confidence per decay pass.
pub const DECAY_FACTOR: f64 = 0.9;

/// Consolidation: memories whose confidence falls below this are expired.
pub const EXPIRE_MIN_CONFIDENCE: f64 = 0.3;

/// Run a consolidation pass once every N context flushes.
pub const CONSOLIDATE_EVERY_FLUSHES: u64 = 5;

/// Profile projection: only preference memories at or above this confidence
/// are mirrored into the flat profile table.
pub const PROFILE_MIN_CONFIDENCE: f64 = 0.8;

/// Distiller: extracted values longer than this read as explanations rather
/// than user facts and are dropped by the world-fact filter.
pub const MAX_DISTILLED_VALUE_LEN: usize = 200;

/// Query-embedding LRU capacity.
pub const EMBED_CACHE_CAPACITY: usize = 128;
