//! End-to-end pipeline scenarios: pure-heuristic reduction, constraint
//! extraction, cache hits, and gated compression.

mod common;

use std::sync::Arc;

use async_trait::async_trait;
use promptpress::compress::{CompressError, Compressor};
use promptpress::{
    BlockKind, ChatMessage, MemoryCache, OptimizeConfig, OptimizeRequest, Optimizer,
};

use common::word_counter;

fn s1_request() -> OptimizeRequest {
    OptimizeRequest::new(
        vec![
            ChatMessage::new("system", "You are helpful."),
            ChatMessage::new("user", "Hello"),
            ChatMessage::new("assistant", "Sure, I can help."),
            ChatMessage::new("user", "Hello"),
            ChatMessage::new("assistant", "Of course!"),
            ChatMessage::new("user", "What is Python?"),
        ],
        "gpt-4",
    )
}

fn s1_config() -> OptimizeConfig {
    OptimizeConfig {
        target_budget_tokens: 1000,
        keep_last_n_turns: 1,
        enable_cache: false,
        ..Default::default()
    }
}

#[tokio::test]
async fn pure_heuristic_reduction_drops_junk_and_duplicates() {
    let optimizer = Optimizer::new(word_counter());
    let outcome = optimizer.run(&s1_request(), &s1_config()).await.unwrap();

    let contents: Vec<(&str, BlockKind)> = outcome
        .blocks_out
        .iter()
        .map(|b| (b.content.as_str(), b.kind))
        .collect();
    assert_eq!(
        contents,
        vec![
            ("You are helpful.", BlockKind::System),
            ("Hello", BlockKind::User),
            ("What is Python?", BlockKind::User),
        ]
    );
    assert_eq!(outcome.stats.route, "heuristic");
    assert!(!outcome.stats.fallback_used);
    assert!(!outcome.stats.cache_hit);
    assert_eq!(outcome.dropped.len(), 3);
    assert!(outcome.dropped.iter().all(|d| d.reason == "filtered"));
}

#[tokio::test]
async fn constraint_sentences_become_a_protected_block() {
    let request = OptimizeRequest::new(
        vec![
            ChatMessage::new(
                "system",
                "You MUST reply in JSON. NEVER include PII. ALWAYS validate input.",
            ),
            ChatMessage::new("user", "Process data"),
        ],
        "gpt-4",
    );
    let config = OptimizeConfig {
        enable_cache: false,
        ..Default::default()
    };
    let optimizer = Optimizer::new(word_counter());
    let outcome = optimizer.run(&request, &config).await.unwrap();

    assert_eq!(outcome.blocks_out.len(), 3);
    assert_eq!(outcome.blocks_out[0].kind, BlockKind::System);
    let constraint = &outcome.blocks_out[1];
    assert_eq!(constraint.kind, BlockKind::Constraint);
    assert!(constraint.must_keep);
    assert_eq!(
        constraint.content,
        "You MUST reply in JSON.\nNEVER include PII.\nALWAYS validate input."
    );
    assert_eq!(outcome.blocks_out[2].kind, BlockKind::User);
}

#[tokio::test]
async fn second_identical_run_is_served_from_cache() {
    let config = OptimizeConfig {
        target_budget_tokens: 1000,
        keep_last_n_turns: 1,
        enable_cache: true,
        ..Default::default()
    };
    let optimizer = Optimizer::new(word_counter()).with_cache(Arc::new(MemoryCache::new()));

    let first = optimizer.run(&s1_request(), &config).await.unwrap();
    assert!(!first.stats.cache_hit);

    let second = optimizer.run(&s1_request(), &config).await.unwrap();
    assert!(second.stats.cache_hit);
    assert_eq!(second.stats.route, "heuristic+cache-hit");
    assert_eq!(second.stats.stage_timings_ms.semantic, 0);
    assert_eq!(second.stats.stage_timings_ms.compression, 0);

    let first_contents: Vec<&str> = first.blocks_out.iter().map(|b| b.content.as_str()).collect();
    let second_contents: Vec<&str> =
        second.blocks_out.iter().map(|b| b.content.as_str()).collect();
    assert_eq!(first_contents, second_contents);
}

#[tokio::test]
async fn config_change_misses_the_cache() {
    let optimizer = Optimizer::new(word_counter()).with_cache(Arc::new(MemoryCache::new()));

    let config = s1_config();
    let mut cached_config = config.clone();
    cached_config.enable_cache = true;
    optimizer.run(&s1_request(), &cached_config).await.unwrap();

    let mut other = cached_config.clone();
    other.keep_last_n_turns = 3;
    let outcome = optimizer.run(&s1_request(), &other).await.unwrap();
    assert!(!outcome.stats.cache_hit);
}

struct ScriptedCompressor {
    output: &'static str,
}

#[async_trait]
impl Compressor for ScriptedCompressor {
    async fn compress(
        &self,
        _text: &str,
        _ratio: f64,
        _force_preserve: &[&str],
    ) -> Result<(String, usize), CompressError> {
        Ok((
            self.output.to_string(),
            self.output.split_whitespace().count(),
        ))
    }
}

#[tokio::test]
async fn compression_is_gated_on_faithfulness_and_keeps_identifiers() {
    let request = OptimizeRequest::new(
        vec![
            ChatMessage::new("system", "Answer status code questions."),
            ChatMessage::new(
                "assistant",
                "The API returns 200 on success, 404 on not found, and 500 on error.",
            ),
        ],
        "gpt-4",
    );
    // system = 4 tokens (must-keep), assistant = 14 tokens, budget 15.
    let config = OptimizeConfig {
        target_budget_tokens: 15,
        safety_margin_tokens: 0,
        keep_last_n_turns: 0,
        enable_cache: false,
        enable_compression: true,
        compression_min_tokens: 4,
        ..Default::default()
    };
    let optimizer = Optimizer::new(word_counter()).with_compressor(Arc::new(ScriptedCompressor {
        output: "API: 200 success, 404 not found, 500 error.",
    }));
    let outcome = optimizer.run(&request, &config).await.unwrap();

    assert!(outcome.stats.route.contains("compression"));
    assert!(outcome.stats.tokens_after <= 15);
    assert!(!outcome.stats.fallback_used);
    assert!(outcome.stats.faithfulness_score.unwrap() >= 0.85);

    let compressed = outcome
        .blocks_out
        .iter()
        .find(|b| b.kind == BlockKind::Assistant)
        .unwrap();
    assert!(compressed.compressed);
    for id in ["200", "404", "500"] {
        assert!(compressed.content.contains(id));
    }
    assert_eq!(
        compressed.original_content.as_deref(),
        Some("The API returns 200 on success, 404 on not found, and 500 on error.")
    );
}

#[tokio::test]
async fn unfaithful_compression_falls_back_to_minimal_safe() {
    let request = OptimizeRequest::new(
        vec![
            ChatMessage::new("system", "Answer status code questions."),
            ChatMessage::new(
                "assistant",
                "The API returns 200 on success, 404 on not found, and 500 on error.",
            ),
        ],
        "gpt-4",
    );
    let config = OptimizeConfig {
        target_budget_tokens: 8,
        safety_margin_tokens: 0,
        keep_last_n_turns: 0,
        enable_cache: false,
        enable_compression: true,
        compression_min_tokens: 4,
        ..Default::default()
    };
    // A compressor that strips every identifier never passes the gate, so the
    // run recovers through fallback and keeps at least the system block.
    let optimizer = Optimizer::new(word_counter()).with_compressor(Arc::new(ScriptedCompressor {
        output: "statuses vary.",
    }));
    let outcome = optimizer.run(&request, &config).await.unwrap();

    assert!(outcome.stats.fallback_used);
    assert!(outcome
        .blocks_out
        .iter()
        .any(|b| b.kind == BlockKind::System));
    assert!(outcome.stats.tokens_after <= 8);
}

#[tokio::test]
async fn empty_requests_are_rejected_before_the_pipeline_runs() {
    let optimizer = Optimizer::new(word_counter());
    let config = OptimizeConfig::default();

    let no_messages = OptimizeRequest::new(Vec::new(), "gpt-4");
    assert!(matches!(
        optimizer.run(&no_messages, &config).await,
        Err(promptpress::PipelineError::InvalidRequest(_))
    ));

    let blank_user = OptimizeRequest::new(
        vec![
            ChatMessage::new("system", "s"),
            ChatMessage::new("user", "   "),
        ],
        "gpt-4",
    );
    assert!(matches!(
        optimizer.run(&blank_user, &config).await,
        Err(promptpress::PipelineError::InvalidRequest(_))
    ));
}
