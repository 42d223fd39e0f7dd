//! Shared test doubles: a deterministic embedder and a scripted LLM.
#![allow(dead_code)]

use std::collections::hash_map::DefaultHasher;
use std::collections::VecDeque;
use std::hash::{Hash, Hasher};
use std::sync::Mutex;

use async_trait::async_trait;
use memoir::error::{MemoryError, Result};
use memoir::llm::{ChatMessage, Embedder, LanguageModel};

/// Bag-of-words hashing embedder: deterministic, and texts sharing tokens
/// land near each other, which is all retrieval tests need.
pub struct HashEmbedder {
    dim: usize,
}

impl HashEmbedder {
    pub fn new(dim: usize) -> Self {
        Self { dim }
    }

    pub fn embed_sync(&self, text: &str) -> Vec<f32> {
        let mut v = vec![0f32; self.dim];
        for token in text.to_lowercase().split(|c: char| !c.is_alphanumeric()) {
            if token.is_empty() {
                continue;
            }
            let mut h = DefaultHasher::new();
            token.hash(&mut h);
            let idx = (h.finish() as usize) % self.dim;
            v[idx] += 1.0;
        }
        let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for x in &mut v {
                *x /= norm;
            }
        }
        v
    }
}

#[async_trait]
impl Embedder for HashEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        Ok(self.embed_sync(text))
    }

    fn dim(&self) -> usize {
        self.dim
    }
}

/// Embedder that always fails, for exercising FTS-only degradation.
pub struct FailingEmbedder {
    dim: usize,
}

impl FailingEmbedder {
    pub fn new(dim: usize) -> Self {
        Self { dim }
    }
}

#[async_trait]
impl Embedder for FailingEmbedder {
    async fn embed(&self, _text: &str) -> Result<Vec<f32>> {
        Err(MemoryError::Embedding("embedding model offline".into()))
    }

    fn dim(&self) -> usize {
        self.dim
    }
}

/// LLM double that replays queued responses. When a queue runs dry it falls
/// back to a bland reply ("Okay.") or an empty delta, so long filler
/// conversations don't need thousands of queued entries.
#[derive(Default)]
pub struct ScriptedModel {
    chat_replies: Mutex<VecDeque<String>>,
    json_replies: Mutex<VecDeque<String>>,
}

impl ScriptedModel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn queue_chat(&self, reply: impl Into<String>) {
        self.chat_replies.lock().unwrap().push_back(reply.into());
    }

    pub fn queue_json(&self, reply: impl Into<String>) {
        self.json_replies.lock().unwrap().push_back(reply.into());
    }
}

#[async_trait]
impl LanguageModel for ScriptedModel {
    async fn chat(&self, _messages: &[ChatMessage]) -> Result<String> {
        Ok(self
            .chat_replies
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| "Okay.".into()))
    }

    async fn json_complete(&self, _prompt: &str, _max_tokens: u32) -> Result<String> {
        Ok(self
            .json_replies
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| r#"{"actions": []}"#.into()))
    }
}

/// LLM double whose chat endpoint is down.
pub struct BrokenModel;

#[async_trait]
impl LanguageModel for BrokenModel {
    async fn chat(&self, _messages: &[ChatMessage]) -> Result<String> {
        Err(MemoryError::Llm("connection refused".into()))
    }

    async fn json_complete(&self, _prompt: &str, _max_tokens: u32) -> Result<String> {
        Err(MemoryError::Llm("connection refused".into()))
    }
}
