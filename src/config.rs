//! Engine configuration.

/// Options recognized by the memory engine. All fields have working defaults;
/// use the builder-style setters to override.
#[derive(Debug, Clone)]
pub struct MemoryConfig {
    /// Path to the SQLite database file (":memory:" for tests).
    pub db_path: String,
    /// Token budget of the model context window.
    pub context_limit: usize,
    /// Fraction of the context window that triggers a flush.
    pub flush_threshold: f64,
    /// Number of memories surfaced per retrieval.
    pub top_k: usize,
    /// Fixed embedding dimension the store expects.
    pub embedding_dim: usize,
    /// Reciprocal Rank Fusion constant.
    pub rrf_k: f64,
    /// Response token cap for distillation calls.
    pub distill_max_tokens: u32,
    /// Messages retained across a context reset.
    pub keep_tail_n: usize,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            db_path: "memory.db".into(),
            context_limit: 8192,
            flush_threshold: 0.70,
            top_k: 5,
            embedding_dim: 384,
            rrf_k: 60.0,
            distill_max_tokens: 2000,
            keep_tail_n: 4,
        }
    }
}

impl MemoryConfig {
    pub fn new(db_path: impl Into<String>) -> Self {
        Self {
            db_path: db_path.into(),
            ..Default::default()
        }
    }

    pub fn context_limit(mut self, limit: usize) -> Self {
        self.context_limit = limit;
        self
    }

    pub fn flush_threshold(mut self, threshold: f64) -> Self {
        self.flush_threshold = threshold;
        self
    }

    pub fn top_k(mut self, k: usize) -> Self {
        self.top_k = k;
        self
    }

    pub fn embedding_dim(mut self, dim: usize) -> Self {
        self.embedding_dim = dim;
        self
    }

    pub fn rrf_k(mut self, k: f64) -> Self {
        self.rrf_k = k;
        self
    }

    pub fn distill_max_tokens(mut self, tokens: u32) -> Self {
        self.distill_max_tokens = tokens;
        self
    }

    pub fn keep_tail_n(mut self, n: usize) -> Self {
        self.keep_tail_n = n;
        self
    }
}
