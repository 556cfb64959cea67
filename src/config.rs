//! Run configuration.
//!
//! One `OptimizeConfig` is resolved per request and is immutable for the run;
//! fallback states that widen the kept window operate on a local copy.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizeConfig {
    /// Upper bound on output tokens.
    pub target_budget_tokens: usize,
    /// Reserve subtracted from the budget before packing. Clamped to a
    /// quarter of the budget so tiny budgets stay usable.
    pub safety_margin_tokens: usize,
    /// N for the keep-last-N-turns heuristic.
    pub keep_last_n_turns: usize,
    /// Whole-string regexes that mark stale assistant chatter as junk.
    pub junk_patterns: Vec<String>,
    pub dedupe_normalize: DedupeNormalize,
    /// Tool names to keep; empty or `*` keeps everything.
    pub tool_allowlist: Vec<String>,
    /// Max records kept when compacting a uniform JSON array.
    pub json_truncate_items: usize,
    /// Arrays shorter than this many chars are left alone.
    pub json_truncate_chars: usize,
    /// Context lines kept around error lines in log output.
    pub log_error_window_lines: usize,
    /// Unconditionally kept tail of log output.
    pub log_tail_lines: usize,
    pub enable_semantic: bool,
    pub enable_compression: bool,
    pub enable_cache: bool,
    /// Per-kind neighbour pull from the vector store.
    pub vector_topk: usize,
    /// Relevance vs diversity trade-off for MMR.
    pub mmr_lambda: f64,
    /// Per-kind budget fractions; `chat` is accepted as an alias of
    /// `assistant`.
    pub type_fractions: HashMap<String, f64>,
    /// Decay constant for the recency factor, in logical timestamp units.
    pub recency_tau: f64,
    /// Source tag → trust in [0, 1]; unknown sources score 0.5.
    pub source_trust: HashMap<String, f64>,
    /// Target compressed/original token ratio.
    pub compression_ratio: f64,
    /// Blocks below this size are not worth compressing.
    pub compression_min_tokens: usize,
    /// Minimum faithfulness for a compression candidate to be accepted.
    pub faithfulness_threshold: f64,
    pub cache_ttl_secs: u64,
    pub embedding_model: String,
    pub embedding_dim: usize,
    /// Model-name prefix → tiktoken encoding name.
    pub tokenizer_model_map: HashMap<String, String>,
    pub cache_timeout_ms: u64,
    pub embed_timeout_ms: u64,
    pub compress_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DedupeNormalize {
    pub lowercase: bool,
    pub collapse_whitespace: bool,
}

impl Default for DedupeNormalize {
    fn default() -> Self {
        Self {
            lowercase: true,
            collapse_whitespace: true,
        }
    }
}

fn default_junk_patterns() -> Vec<String> {
    vec![
        r"^(Sure|Of course|I can help|Let me help)\b.*".to_string(),
        r"^(Thank you|Thanks)\b.*".to_string(),
    ]
}

fn default_type_fractions() -> HashMap<String, f64> {
    HashMap::from([
        ("doc".to_string(), 0.4),
        ("assistant".to_string(), 0.3),
        ("tool".to_string(), 0.2),
        ("user".to_string(), 0.1),
    ])
}

fn default_source_trust() -> HashMap<String, f64> {
    HashMap::from([
        ("system".to_string(), 1.0),
        ("developer".to_string(), 1.0),
        ("docs".to_string(), 0.9),
        ("user".to_string(), 0.8),
    ])
}

impl Default for OptimizeConfig {
    fn default() -> Self {
        Self {
            target_budget_tokens: 8000,
            safety_margin_tokens: 300,
            keep_last_n_turns: 4,
            junk_patterns: default_junk_patterns(),
            dedupe_normalize: DedupeNormalize::default(),
            tool_allowlist: Vec::new(),
            json_truncate_items: 32,
            json_truncate_chars: 2000,
            log_error_window_lines: 2,
            log_tail_lines: 10,
            enable_semantic: false,
            enable_compression: false,
            enable_cache: true,
            vector_topk: 30,
            mmr_lambda: 0.7,
            type_fractions: default_type_fractions(),
            recency_tau: 8.0,
            source_trust: default_source_trust(),
            compression_ratio: 0.5,
            compression_min_tokens: 24,
            faithfulness_threshold: 0.85,
            cache_ttl_secs: 600,
            embedding_model: "all-minilm-l6-v2".to_string(),
            embedding_dim: 384,
            tokenizer_model_map: HashMap::new(),
            cache_timeout_ms: 500,
            embed_timeout_ms: 10_000,
            compress_timeout_ms: 10_000,
        }
    }
}

impl OptimizeConfig {
    /// Effective safety margin, clamped so validation cannot fail purely on a
    /// large static reserve.
    pub fn effective_safety_margin(&self) -> usize {
        self.safety_margin_tokens.min(self.target_budget_tokens / 4)
    }

    /// Budget fraction for a kind, honoring the `chat` alias.
    pub fn fraction_for(&self, kind: &str) -> f64 {
        if let Some(f) = self.type_fractions.get(kind) {
            return *f;
        }
        if kind == "assistant" {
            return self.type_fractions.get("chat").copied().unwrap_or(0.0);
        }
        0.0
    }

    pub fn trust_for(&self, source: &str) -> f64 {
        self.source_trust.get(source).copied().unwrap_or(0.5)
    }

    /// Canonical serialization of every option that affects pipeline output,
    /// folded into the cache key. Field order is fixed; maps are sorted.
    pub fn cache_key_material(&self) -> String {
        let mut fractions: Vec<_> = self
            .type_fractions
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect();
        fractions.sort();
        let mut trust: Vec<_> = self
            .source_trust
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect();
        trust.sort();
        format!(
            "budget={};margin={};keep_n={};junk={};allow={};json_items={};json_chars={};\
             log_win={};log_tail={};semantic={};compression={};topk={};lambda={};\
             fractions=[{}];tau={};trust=[{}];ratio={};min_tokens={};faith={}",
            self.target_budget_tokens,
            self.safety_margin_tokens,
            self.keep_last_n_turns,
            self.junk_patterns.join(","),
            self.tool_allowlist.join(","),
            self.json_truncate_items,
            self.json_truncate_chars,
            self.log_error_window_lines,
            self.log_tail_lines,
            self.enable_semantic,
            self.enable_compression,
            self.vector_topk,
            self.mmr_lambda,
            fractions.join(","),
            self.recency_tau,
            trust.join(","),
            self.compression_ratio,
            self.compression_min_tokens,
            self.faithfulness_threshold,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chat_alias_maps_to_assistant() {
        let mut config = OptimizeConfig::default();
        config.type_fractions = HashMap::from([
            ("doc".to_string(), 0.5),
            ("chat".to_string(), 0.5),
        ]);
        assert_eq!(config.fraction_for("assistant"), 0.5);
        assert_eq!(config.fraction_for("doc"), 0.5);
        assert_eq!(config.fraction_for("tool"), 0.0);
    }

    #[test]
    fn safety_margin_clamped_for_tiny_budgets() {
        let config = OptimizeConfig {
            target_budget_tokens: 100,
            safety_margin_tokens: 300,
            ..Default::default()
        };
        assert_eq!(config.effective_safety_margin(), 25);
    }

    #[test]
    fn cache_key_material_is_order_independent_for_maps() {
        let mut a = OptimizeConfig::default();
        a.type_fractions = HashMap::from([
            ("doc".to_string(), 0.6),
            ("tool".to_string(), 0.4),
        ]);
        let mut b = OptimizeConfig::default();
        b.type_fractions = HashMap::from([
            ("tool".to_string(), 0.4),
            ("doc".to_string(), 0.6),
        ]);
        assert_eq!(a.cache_key_material(), b.cache_key_material());
    }
}
