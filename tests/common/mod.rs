//! Shared stubs for integration tests. The pipeline's model singletons sit
//! behind traits precisely so tests can swap in deterministic fakes.
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;

use promptpress::semantic::SemanticError;
use promptpress::{Embedder, TokenCounter};

/// Counts whitespace-separated words, so test token budgets are exact.
pub struct WordCounter;

impl TokenCounter for WordCounter {
    fn count(&self, text: &str, _model: &str) -> usize {
        text.split_whitespace().count()
    }

    fn version(&self) -> &str {
        "words-v1"
    }
}

pub fn word_counter() -> Arc<dyn TokenCounter> {
    Arc::new(WordCounter)
}

/// Table-driven embedder: exact text → fixed vector. Unknown texts embed to
/// the first axis so queries always have a vector.
pub struct TableEmbedder {
    table: HashMap<String, Vec<f32>>,
    dimension: usize,
}

impl TableEmbedder {
    pub fn new(dimension: usize) -> Self {
        Self {
            table: HashMap::new(),
            dimension,
        }
    }

    pub fn insert(&mut self, text: impl Into<String>, vector: Vec<f32>) {
        self.table.insert(text.into(), unit(&vector));
    }

    fn default_vector(&self) -> Vec<f32> {
        let mut v = vec![0.0; self.dimension];
        v[0] = 1.0;
        v
    }
}

impl Embedder for TableEmbedder {
    fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>, SemanticError> {
        Ok(texts
            .iter()
            .map(|t| {
                self.table
                    .get(*t)
                    .cloned()
                    .unwrap_or_else(|| self.default_vector())
            })
            .collect())
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn id(&self) -> &str {
        "table-stub"
    }
}

/// An embedder that always fails, for degradation tests.
pub struct BrokenEmbedder;

impl Embedder for BrokenEmbedder {
    fn embed_batch(&self, _texts: &[&str]) -> Result<Vec<Vec<f32>>, SemanticError> {
        Err(SemanticError::Unavailable("model files missing".into()))
    }

    fn dimension(&self) -> usize {
        4
    }

    fn id(&self) -> &str {
        "broken-stub"
    }
}

pub fn unit(v: &[f32]) -> Vec<f32> {
    let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm <= f32::EPSILON {
        return v.to_vec();
    }
    v.iter().map(|x| x / norm).collect()
}

/// A string of `n` distinct lowercase words with a distinguishing prefix.
pub fn words(prefix: &str, n: usize) -> String {
    (0..n)
        .map(|i| format!("{prefix}{i}"))
        .collect::<Vec<_>>()
        .join(" ")
}
