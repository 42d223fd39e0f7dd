//! Token-accounted sliding window of chat messages.

use crate::error::{MemoryError, Result};
use crate::llm::ChatMessage;

/// Flat per-message overhead for role framing.
const ROLE_OVERHEAD: usize = 4;

fn is_cjk(c: char) -> bool {
    matches!(c,
        '\u{4E00}'..='\u{9FFF}'   // CJK Unified Basic
        | '\u{3400}'..='\u{4DBF}' // CJK Extension A
        | '\u{F900}'..='\u{FAFF}' // CJK Compatibility
        | '\u{3040}'..='\u{30FF}' // Hiragana + Katakana
        | '\u{AC00}'..='\u{D7AF}' // Hangul
    )
}

/// Estimate token count for mixed CJK/ASCII text.
///
/// CJK characters average ~1.5 tokens each; Latin text averages ~4 bytes per
/// token. Deterministic, and used consistently at embed-time and chat-time.
pub fn estimate_tokens(text: &str) -> usize {
    let mut cjk_count = 0_usize;
    let mut other_bytes = 0_usize;
    for c in text.chars() {
        if is_cjk(c) {
            cjk_count += 1;
        } else {
            other_bytes += c.len_utf8();
        }
    }
    let t = cjk_count as f64 / 1.5 + other_bytes as f64 / 4.0;
    t.ceil().max(1.0) as usize
}

/// Ordered chat messages plus a mutable system-prompt slot, with running
/// token totals. Decides when the conversation must flush to memory.
pub struct ContextManager {
    limit: usize,
    threshold: f64,
    keep_tail_n: usize,
    system_prompt: String,
    system_tokens: usize,
    messages: Vec<ChatMessage>,
    message_tokens: usize,
}

impl ContextManager {
    pub fn new(limit: usize, threshold: f64, keep_tail_n: usize) -> Result<Self> {
        if limit == 0 {
            return Err(MemoryError::ContextConfig("context_limit must be positive".into()));
        }
        if !(threshold > 0.0 && threshold <= 1.0) {
            return Err(MemoryError::ContextConfig(format!(
                "flush_threshold {threshold} outside (0, 1]"
            )));
        }
        Ok(Self {
            limit,
            threshold,
            keep_tail_n,
            system_prompt: String::new(),
            system_tokens: 0,
            messages: Vec::new(),
            message_tokens: 0,
        })
    }

    /// Replace the system slot and recompute its share of the total.
    pub fn set_system_prompt(&mut self, prompt: impl Into<String>) {
        self.system_prompt = prompt.into();
        self.system_tokens = estimate_tokens(&self.system_prompt) + ROLE_OVERHEAD;
    }

    pub fn append(&mut self, role: &str, content: impl Into<String>) {
        let content = content.into();
        self.message_tokens += estimate_tokens(&content) + ROLE_OVERHEAD;
        self.messages.push(ChatMessage { role: role.to_string(), content });
    }

    pub fn total_tokens(&self) -> usize {
        self.system_tokens + self.message_tokens
    }

    pub fn utilization(&self) -> f64 {
        self.total_tokens() as f64 / self.limit as f64
    }

    pub fn needs_flush(&self) -> bool {
        self.utilization() >= self.threshold
    }

    pub fn message_count(&self) -> usize {
        self.messages.len()
    }

    /// Drop all non-system messages except the last `keep_tail_n` and
    /// recompute totals. Errors if the retained tail alone still meets the
    /// flush threshold — that configuration could never make progress.
    pub fn reset(&mut self) -> Result<()> {
        let keep_from = self.messages.len().saturating_sub(self.keep_tail_n);
        self.messages.drain(..keep_from);
        self.message_tokens = self
            .messages
            .iter()
            .map(|m| estimate_tokens(&m.content) + ROLE_OVERHEAD)
            .sum();
        if self.needs_flush() {
            return Err(MemoryError::ContextConfig(format!(
                "context still at {:.0}% after reset; keep_tail_n {} is too large for \
                 flush_threshold {}",
                self.utilization() * 100.0,
                self.keep_tail_n,
                self.threshold
            )));
        }
        Ok(())
    }

    /// System prompt followed by retained messages, in order.
    pub fn messages_for_api(&self) -> Vec<ChatMessage> {
        let mut out = Vec::with_capacity(self.messages.len() + 1);
        out.push(ChatMessage::system(self.system_prompt.clone()));
        out.extend(self.messages.iter().cloned());
        out
    }
}
