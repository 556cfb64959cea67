//! Budget-aware semantic selection.
//!
//! Candidates are scored with a six-factor utility, re-ranked for diversity
//! with Maximal Marginal Relevance, then packed into per-kind sub-budgets
//! with a shared overflow pool. Must-keep blocks are never candidates; they
//! are carried through untouched.

use std::collections::HashMap;

use once_cell::sync::Lazy;
use regex::Regex;
use uuid::Uuid;

use crate::block::{Block, BlockKind};
use crate::config::OptimizeConfig;
use crate::heuristics::CONSTRAINT_KEYWORDS;

use super::cosine;

/// Candidates scoring below this never enter the packing phase.
const LOW_UTILITY_FLOOR: f64 = 0.2;

static UUID_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\b[0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{12}\b")
        .expect("uuid regex")
});
static HEX_ID_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b[0-9a-f]{7,40}\b").expect("hex id regex"));
static DECIMAL_ID_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b\d{3,}\b").expect("decimal id regex"));
static LABELED_ID_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b[A-Za-z]+[_-]\d+\b").expect("labeled id regex"));
static ENTITY_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b[A-Z][a-z]+\b|\b\d+(?:\.\d+)?\b").expect("entity regex"));

/// Why a candidate was not selected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    OverBudget,
    LowUtility,
    MmrRedundant,
    KindCap,
}

impl DropReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::OverBudget => "over-budget",
            Self::LowUtility => "low-utility",
            Self::MmrRedundant => "mmr-redundant",
            Self::KindCap => "kind-cap",
        }
    }
}

/// A selectable block together with its embedding.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub block: Block,
    pub embedding: Vec<f32>,
}

pub struct SelectionInput {
    /// The current pipeline block list; its order is the output order.
    pub blocks: Vec<Block>,
    /// Store neighbours not present in `blocks`; timestamps sit below the
    /// conversation so they sort to the front.
    pub extra: Vec<Candidate>,
    /// Embeddings for the non-must-keep blocks in `blocks`, by id.
    pub embeddings: HashMap<Uuid, Vec<f32>>,
    pub query_vec: Vec<f32>,
    pub query_text: String,
}

pub struct SelectionResult {
    pub selected: Vec<Block>,
    pub dropped: Vec<(Block, DropReason)>,
}

/// Concatenate the last up-to-3 user blocks, most recent first.
pub fn build_query_text(blocks: &[Block]) -> Option<String> {
    let mut users: Vec<&Block> = blocks
        .iter()
        .filter(|b| b.kind == BlockKind::User)
        .collect();
    if users.is_empty() {
        return None;
    }
    users.sort_by_key(|b| std::cmp::Reverse(b.timestamp));
    Some(
        users
            .iter()
            .take(3)
            .map(|b| b.content.as_str())
            .collect::<Vec<_>>()
            .join("\n"),
    )
}

/// Six-factor utility score in [0, 1].
pub fn utility(
    block: &Block,
    sim: f64,
    query_text: &str,
    newest_ts: i64,
    config: &OptimizeConfig,
) -> f64 {
    let sim = sim.clamp(0.0, 1.0);

    let age = (newest_ts - block.timestamp).max(0) as f64;
    let recency = (-age / config.recency_tau.max(f64::EPSILON)).exp();

    let constraint_hits = constraint_keyword_count(&block.content);
    let constraint = (constraint_hits as f64 / 3.0).min(1.0);

    let identifier = (identifier_count(&block.content) as f64 / 5.0).min(1.0);

    let trust = config.trust_for(source_family(&block.source));

    let entities = entity_jaccard(&block.content, query_text);

    let score = 0.40 * sim
        + 0.20 * recency
        + 0.15 * constraint
        + 0.10 * identifier
        + 0.10 * trust
        + 0.05 * entities;
    score.clamp(0.0, 1.0)
}

fn constraint_keyword_count(content: &str) -> usize {
    CONSTRAINT_KEYWORDS
        .iter()
        .map(|kw| content.matches(kw).count())
        .sum()
}

/// Count identifier-like tokens: UUIDs, hex and decimal ids, labeled ids,
/// code fences.
pub fn identifier_count(content: &str) -> usize {
    let uuids = UUID_RE.find_iter(content).count();
    let hex = HEX_ID_RE.find_iter(content).count();
    let decimals = DECIMAL_ID_RE.find_iter(content).count();
    let labeled = LABELED_ID_RE.find_iter(content).count();
    let fences = content.matches("```").count();
    uuids + hex + decimals + labeled + fences
}

/// Jaccard overlap of named-entity-like tokens (capitalized words, numbers).
fn entity_jaccard(a: &str, b: &str) -> f64 {
    let ea: std::collections::HashSet<&str> = ENTITY_RE.find_iter(a).map(|m| m.as_str()).collect();
    let eb: std::collections::HashSet<&str> = ENTITY_RE.find_iter(b).map(|m| m.as_str()).collect();
    if ea.is_empty() && eb.is_empty() {
        return 0.0;
    }
    let intersection = ea.intersection(&eb).count() as f64;
    let union = ea.union(&eb).count() as f64;
    intersection / union
}

/// The leading segment of a provenance tag, e.g. `retrieved:abc` → `retrieved`.
fn source_family(source: &str) -> &str {
    source.split(':').next().unwrap_or(source)
}

struct Scored {
    candidate: Candidate,
    utility: f64,
    mmr: f64,
}

/// Select blocks: utility scoring, MMR ordering, per-kind knapsack.
pub fn select_blocks(input: SelectionInput, config: &OptimizeConfig) -> SelectionResult {
    let SelectionInput {
        blocks,
        extra,
        embeddings,
        query_vec,
        query_text,
    } = input;

    let newest_ts = blocks.iter().map(|b| b.timestamp).max().unwrap_or(0);

    let must_keep_tokens: usize = blocks
        .iter()
        .filter(|b| b.must_keep)
        .map(|b| b.token_count)
        .sum();
    let budget = config.target_budget_tokens;
    let available = budget
        .saturating_sub(config.effective_safety_margin())
        .saturating_sub(must_keep_tokens);

    // Assemble candidates: non-must-keep pipeline blocks plus store extras.
    let mut candidates: Vec<Candidate> = Vec::new();
    let mut kept: Vec<Block> = Vec::new();
    for block in blocks {
        if block.must_keep {
            kept.push(block);
        } else {
            let embedding = embeddings.get(&block.id).cloned().unwrap_or_default();
            candidates.push(Candidate { block, embedding });
        }
    }
    candidates.extend(extra);

    let mut dropped: Vec<(Block, DropReason)> = Vec::new();

    // Score; shed the floor-failures before ranking.
    let mut scored: Vec<Scored> = Vec::new();
    for candidate in candidates {
        let sim = if candidate.embedding.is_empty() {
            0.0
        } else {
            cosine(&candidate.embedding, &query_vec) as f64
        };
        let u = utility(&candidate.block, sim, &query_text, newest_ts, config);
        if u < LOW_UTILITY_FLOOR {
            dropped.push((candidate.block, DropReason::LowUtility));
        } else {
            scored.push(Scored {
                candidate,
                utility: u,
                mmr: 0.0,
            });
        }
    }

    // Deterministic pre-order: utility desc, then priority desc, timestamp
    // desc, id lexicographic.
    scored.sort_by(|a, b| {
        b.utility
            .total_cmp(&a.utility)
            .then_with(|| b.candidate.block.priority.total_cmp(&a.candidate.block.priority))
            .then_with(|| b.candidate.block.timestamp.cmp(&a.candidate.block.timestamp))
            .then_with(|| a.candidate.block.id.to_string().cmp(&b.candidate.block.id.to_string()))
    });

    let ordered = mmr_order(scored, config.mmr_lambda);

    // Per-kind sub-budgets over the kinds actually present; the remainder of
    // the available budget pools into overflow.
    let mut sub_budgets: HashMap<&'static str, usize> = HashMap::new();
    for s in &ordered {
        let kind = s.candidate.block.kind.as_str();
        sub_budgets
            .entry(kind)
            .or_insert_with(|| (config.fraction_for(kind) * available as f64).floor() as usize);
    }
    let allocated: usize = sub_budgets.values().sum();
    if allocated > available && allocated > 0 {
        // Fractions are supposed to sum to at most 1.0; scale down if a
        // caller over-allocates so the packing can never exceed the budget.
        for sub in sub_budgets.values_mut() {
            *sub = (*sub as f64 * available as f64 / allocated as f64).floor() as usize;
        }
    }
    let allocated: usize = sub_budgets.values().sum();
    let mut overflow = available.saturating_sub(allocated);

    let mut accepted: Vec<Block> = Vec::new();
    for s in ordered {
        let kind = s.candidate.block.kind.as_str();
        let tokens = s.candidate.block.token_count;
        let sub = sub_budgets.get_mut(kind).expect("kind budget present");
        if tokens <= *sub + overflow {
            let from_sub = tokens.min(*sub);
            *sub -= from_sub;
            overflow -= tokens - from_sub;
            accepted.push(s.candidate.block);
        } else if config.fraction_for(kind) == 0.0 {
            dropped.push((s.candidate.block, DropReason::KindCap));
        } else if s.mmr < 0.0 {
            dropped.push((s.candidate.block, DropReason::MmrRedundant));
        } else {
            dropped.push((s.candidate.block, DropReason::OverBudget));
        }
    }

    // Output order is timestamp order; ties keep must-keep blocks (which
    // include any constraint inserted after its system block) first.
    let mut selected: Vec<Block> = kept.into_iter().chain(accepted).collect();
    selected.sort_by_key(|b| b.timestamp);

    SelectionResult { selected, dropped }
}

/// Greedy MMR ordering: repeatedly pick the candidate maximizing
/// `λ·utility − (1−λ)·max cosine to already-picked`.
fn mmr_order(mut pool: Vec<Scored>, lambda: f64) -> Vec<Scored> {
    let mut ordered: Vec<Scored> = Vec::with_capacity(pool.len());
    let mut picked_embeddings: Vec<Vec<f32>> = Vec::new();

    while !pool.is_empty() {
        let mut best_idx = 0usize;
        let mut best_score = f64::NEG_INFINITY;
        for (idx, s) in pool.iter().enumerate() {
            let redundancy = picked_embeddings
                .iter()
                .filter(|e| !e.is_empty() && !s.candidate.embedding.is_empty())
                .map(|e| cosine(e, &s.candidate.embedding) as f64)
                .fold(0.0f64, f64::max);
            let score = lambda * s.utility - (1.0 - lambda) * redundancy;
            if score > best_score {
                best_score = score;
                best_idx = idx;
            }
        }
        let mut chosen = pool.remove(best_idx);
        chosen.mmr = best_score;
        picked_embeddings.push(chosen.candidate.embedding.clone());
        ordered.push(chosen);
    }
    ordered
}
