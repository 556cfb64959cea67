//! Model-aware token counting.
//!
//! Selects a tiktoken encoder by model family and caches it for process
//! lifetime. Failure to locate an encoder is never fatal: counting degrades to
//! a chars/4 estimate and the run's stats carry `tokenizer_fallback = true`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tiktoken_rs::{cl100k_base, get_bpe_from_model, o200k_base, p50k_base, CoreBPE};

/// Counting surface the pipeline depends on. Tests inject stub counters.
pub trait TokenCounter: Send + Sync {
    fn count(&self, text: &str, model: &str) -> usize;

    /// Whether any count so far had to fall back to the estimate.
    fn fallback_used(&self) -> bool {
        false
    }

    /// Version tag folded into cache keys; bump when counts can change.
    fn version(&self) -> &str {
        "approx-v1"
    }
}

/// tiktoken-backed counter with a per-model encoder cache.
pub struct TiktokenCounter {
    encoders: Mutex<HashMap<String, Arc<CoreBPE>>>,
    family_map: HashMap<String, String>,
    fallback: AtomicBool,
}

impl TiktokenCounter {
    /// `family_map` maps model-name prefixes to encoding names
    /// (`o200k_base`, `cl100k_base`, `p50k_base`).
    pub fn new(family_map: HashMap<String, String>) -> Self {
        Self {
            encoders: Mutex::new(HashMap::new()),
            family_map,
            fallback: AtomicBool::new(false),
        }
    }

    fn encoder_for(&self, model: &str) -> Option<Arc<CoreBPE>> {
        if let Some(bpe) = self.encoders.lock().ok()?.get(model) {
            return Some(bpe.clone());
        }

        let built = get_bpe_from_model(model)
            .ok()
            .or_else(|| self.mapped_encoder(model))
            .or_else(|| {
                // Documented safe fallback for unknown families.
                self.fallback.store(true, Ordering::Relaxed);
                cl100k_base().ok()
            })?;

        let bpe = Arc::new(built);
        if let Ok(mut encoders) = self.encoders.lock() {
            encoders.insert(model.to_string(), bpe.clone());
        }
        Some(bpe)
    }

    fn mapped_encoder(&self, model: &str) -> Option<CoreBPE> {
        let encoding = self
            .family_map
            .iter()
            .find(|(prefix, _)| model.starts_with(prefix.as_str()))
            .map(|(_, enc)| enc.as_str())?;
        match encoding {
            "o200k_base" => o200k_base().ok(),
            "cl100k_base" => cl100k_base().ok(),
            "p50k_base" => p50k_base().ok(),
            _ => None,
        }
    }
}

impl Default for TiktokenCounter {
    fn default() -> Self {
        Self::new(HashMap::new())
    }
}

impl TokenCounter for TiktokenCounter {
    fn count(&self, text: &str, model: &str) -> usize {
        if text.is_empty() {
            return 0;
        }
        match self.encoder_for(model) {
            Some(bpe) => bpe.encode_with_special_tokens(text).len(),
            None => {
                self.fallback.store(true, Ordering::Relaxed);
                estimate_tokens(text)
            }
        }
    }

    fn fallback_used(&self) -> bool {
        self.fallback.load(Ordering::Relaxed)
    }

    fn version(&self) -> &str {
        "tiktoken-v1"
    }
}

/// Conservative approximation: 1 token per 4 characters, at least 1 for
/// non-empty text.
pub fn estimate_tokens(text: &str) -> usize {
    if text.is_empty() {
        0
    } else {
        (text.len() / 4).max(1)
    }
}

/// A counter bound to one target model, so stages can recount mutated content
/// without threading the model name everywhere.
#[derive(Clone)]
pub struct BoundCounter {
    counter: Arc<dyn TokenCounter>,
    model: String,
}

impl BoundCounter {
    pub fn new(counter: Arc<dyn TokenCounter>, model: impl Into<String>) -> Self {
        Self {
            counter,
            model: model.into(),
        }
    }

    pub fn count(&self, text: &str) -> usize {
        self.counter.count(text, &self.model)
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn fallback_used(&self) -> bool {
        self.counter.fallback_used()
    }

    pub fn version(&self) -> &str {
        self.counter.version()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_are_cached_and_stable() {
        let counter = TiktokenCounter::default();
        let a = counter.count("Hello, world!", "gpt-4");
        let b = counter.count("Hello, world!", "gpt-4");
        assert_eq!(a, b);
        assert!(a > 0 && a < 10);
    }

    #[test]
    fn unknown_model_falls_back_without_failing() {
        let counter = TiktokenCounter::default();
        let n = counter.count("some text to count", "totally-unknown-model-x");
        assert!(n > 0);
        assert!(counter.fallback_used());
    }

    #[test]
    fn family_map_resolves_prefixes() {
        let mut map = HashMap::new();
        map.insert("claude-".to_string(), "cl100k_base".to_string());
        let counter = TiktokenCounter::new(map);
        let n = counter.count("mapped family", "claude-opus");
        assert!(n > 0);
        assert!(!counter.fallback_used());
    }

    #[test]
    fn estimate_floor_is_one_token() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("ab"), 1);
        assert_eq!(estimate_tokens(&"x".repeat(40)), 10);
    }
}
