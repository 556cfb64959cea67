//! Progressive fallback: selection that satisfies the budget at F0, and the
//! terminal case where even the minimal safe set cannot fit.

mod common;

use std::collections::HashMap;
use std::sync::Arc;

use promptpress::{
    BlockKind, ChatMessage, DocInput, OptimizeConfig, OptimizeRequest, Optimizer, PipelineError,
};

use common::{word_counter, words, TableEmbedder};

fn doc(i: usize, tokens: usize) -> DocInput {
    DocInput {
        id: format!("d{i}"),
        content: words(&format!("doc{i}x"), tokens),
        metadata: serde_json::Value::Null,
    }
}

fn config_budget(budget: usize) -> OptimizeConfig {
    OptimizeConfig {
        target_budget_tokens: budget,
        safety_margin_tokens: 0,
        enable_cache: false,
        enable_semantic: true,
        enable_compression: true,
        type_fractions: HashMap::from([("doc".to_string(), 1.0)]),
        ..Default::default()
    }
}

fn embedder_for(request: &OptimizeRequest) -> TableEmbedder {
    let dim = 4;
    let mut embedder = TableEmbedder::new(dim);
    if let Some(user) = request.messages.iter().rev().find(|m| m.role == "user") {
        embedder.insert(user.content.clone(), vec![1.0, 0.0, 0.0, 0.0]);
    }
    for (i, d) in request.docs.iter().enumerate() {
        let mut v = vec![0.2, 0.0, 0.0, 0.0];
        v[1 + (i % 3)] = 1.0;
        embedder.insert(d.content.clone(), v);
    }
    embedder
}

#[tokio::test]
async fn selection_satisfies_the_budget_without_fallback() {
    let mut request = OptimizeRequest::new(
        vec![
            ChatMessage::new("system", words("sys", 10)),
            ChatMessage::new("user", words("ask", 8)),
        ],
        "gpt-4",
    );
    request.docs = vec![doc(0, 50), doc(1, 50)];

    let embedder = embedder_for(&request);
    let optimizer = Optimizer::new(word_counter()).with_embedder(Arc::new(embedder));
    let outcome = optimizer.run(&request, &config_budget(20)).await.unwrap();

    assert_eq!(outcome.stats.tokens_after, 18);
    assert!(!outcome.stats.fallback_used);
    assert!(outcome
        .blocks_out
        .iter()
        .all(|b| b.kind != BlockKind::Doc));
    assert_eq!(
        outcome
            .dropped
            .iter()
            .filter(|d| d.kind == BlockKind::Doc)
            .count(),
        2
    );
}

#[tokio::test]
async fn oversized_must_keep_content_is_a_terminal_failure() {
    // system (10, must-keep) + latest user (30, must-keep) cannot fit a
    // 20-token budget; V5 forbids dropping either, so F3 still violates V4.
    let mut request = OptimizeRequest::new(
        vec![
            ChatMessage::new("system", words("sys", 10)),
            ChatMessage::new("user", words("ask", 30)),
        ],
        "gpt-4",
    );
    request.docs = vec![doc(0, 50), doc(1, 50)];

    let embedder = embedder_for(&request);
    let optimizer = Optimizer::new(word_counter()).with_embedder(Arc::new(embedder));
    let result = optimizer.run(&request, &config_budget(20)).await;

    match result {
        Err(PipelineError::ValidationFailed { details, .. }) => {
            assert!(details.contains("F3"));
            assert!(details.contains("V4"));
        }
        other => panic!("expected ValidationFailed, got {other:?}"),
    }
}

#[tokio::test]
async fn under_budget_conversation_passes_at_f0() {
    let request = OptimizeRequest::new(
        vec![
            ChatMessage::new("system", words("sys", 5)),
            ChatMessage::new("user", words("q1x", 5)),
            ChatMessage::new("assistant", words("a1x", 5)),
            ChatMessage::new("user", words("q2x", 5)),
        ],
        "gpt-4",
    );
    let config = OptimizeConfig {
        target_budget_tokens: 25,
        safety_margin_tokens: 0,
        keep_last_n_turns: 1,
        enable_cache: false,
        ..Default::default()
    };
    let optimizer = Optimizer::new(word_counter());
    let outcome = optimizer.run(&request, &config).await.unwrap();

    // Everything fits outright; no fallback involved.
    assert!(!outcome.stats.fallback_used);
    assert_eq!(outcome.stats.tokens_after, 20);
}

#[tokio::test]
async fn minimal_safe_recovers_when_nothing_else_can() {
    let mut request = OptimizeRequest::new(
        vec![
            ChatMessage::new("system", words("sys", 4)),
            ChatMessage::new("user", words("ask", 4)),
        ],
        "gpt-4",
    );
    request.docs = vec![doc(0, 200)];
    // No semantic stage configured: the doc cannot be dropped by selection,
    // so the run must fall through to minimal-safe.
    let config = OptimizeConfig {
        target_budget_tokens: 12,
        safety_margin_tokens: 0,
        enable_cache: false,
        enable_semantic: false,
        enable_compression: false,
        ..Default::default()
    };
    let optimizer = Optimizer::new(word_counter());
    let outcome = optimizer.run(&request, &config).await.unwrap();

    assert!(outcome.stats.fallback_used);
    assert!(outcome.stats.route.ends_with("+fallback"));
    assert_eq!(outcome.stats.tokens_after, 8);
    assert!(outcome
        .dropped
        .iter()
        .any(|d| d.kind == BlockKind::Doc && d.reason == "fallback"));
}
