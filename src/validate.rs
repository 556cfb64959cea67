//! Post-condition checks and the progressive fallback ladder.
//!
//! The validator compares the final block list against a snapshot of the
//! canonicalized input: which must-keep content existed, whether system/user
//! blocks were present, and which constraint blocks the heuristics created.
//! The fallback ladder (undo compression → widen the kept window → minimal
//! safe set) is driven by the orchestrator; this module owns the checks, the
//! transition report, and the terminal minimal-safe reduction.

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::block::{total_tokens, Block, BlockKind};

/// The five post-conditions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PostCondition {
    /// A system block is present (when the input had one).
    V1SystemPresent,
    /// A user block is present (when the input had one).
    V2UserPresent,
    /// Every extracted constraint survives with identical content.
    V3ConstraintsIntact,
    /// Total token count fits the budget.
    V4Budget,
    /// Every must-keep content from the canonicalized input survives.
    V5MustKeepIntact,
}

impl PostCondition {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::V1SystemPresent => "V1",
            Self::V2UserPresent => "V2",
            Self::V3ConstraintsIntact => "V3",
            Self::V4Budget => "V4",
            Self::V5MustKeepIntact => "V5",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Violation {
    pub condition: PostCondition,
    pub detail: String,
}

/// Snapshot of the canonicalized input the validator checks against.
#[derive(Debug, Clone)]
pub struct ValidationContext {
    pub had_system: bool,
    pub had_user: bool,
    /// Contents of blocks that were must-keep right after canonicalization.
    pub must_keep_contents: Vec<String>,
    /// Contents of constraint blocks created by the heuristics.
    pub constraint_contents: Vec<String>,
    pub budget_tokens: usize,
}

/// Run all five checks; an empty result means the output is valid.
pub fn validate(blocks: &[Block], ctx: &ValidationContext) -> Vec<Violation> {
    let mut violations = Vec::new();

    if ctx.had_system && !blocks.iter().any(|b| b.kind == BlockKind::System) {
        violations.push(Violation {
            condition: PostCondition::V1SystemPresent,
            detail: "input had a system block but the output has none".into(),
        });
    }

    if ctx.had_user && !blocks.iter().any(|b| b.kind == BlockKind::User) {
        violations.push(Violation {
            condition: PostCondition::V2UserPresent,
            detail: "input had a user block but the output has none".into(),
        });
    }

    for constraint in &ctx.constraint_contents {
        let present = blocks
            .iter()
            .any(|b| b.kind == BlockKind::Constraint && b.content == *constraint);
        if !present {
            violations.push(Violation {
                condition: PostCondition::V3ConstraintsIntact,
                detail: "an extracted constraint block is missing from the output".into(),
            });
            break;
        }
    }

    let total = total_tokens(blocks);
    if total > ctx.budget_tokens {
        violations.push(Violation {
            condition: PostCondition::V4Budget,
            detail: format!("{total} tokens > budget {}", ctx.budget_tokens),
        });
    }

    for content in &ctx.must_keep_contents {
        if !blocks.iter().any(|b| b.content == *content) {
            violations.push(Violation {
                condition: PostCondition::V5MustKeepIntact,
                detail: "a must-keep block from the input is missing".into(),
            });
            break;
        }
    }

    violations
}

/// The fallback ladder states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FallbackState {
    F0Initial,
    F1UndoCompression,
    F2WidenKeep,
    F3MinimalSafe,
}

impl FallbackState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::F0Initial => "F0",
            Self::F1UndoCompression => "F1",
            Self::F2WidenKeep => "F2",
            Self::F3MinimalSafe => "F3",
        }
    }
}

/// One step of the ladder: which state validated, and what it found.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FallbackTransition {
    pub state: FallbackState,
    pub violations: Vec<Violation>,
}

/// Full record of the ladder, reported in stats and on terminal failure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FallbackReport {
    pub transitions: Vec<FallbackTransition>,
}

impl FallbackReport {
    pub fn record(&mut self, state: FallbackState, violations: &[Violation]) {
        if !violations.is_empty() {
            warn!(
                state = state.as_str(),
                failed = ?violations.iter().map(|v| v.condition.as_str()).collect::<Vec<_>>(),
                "validation failed"
            );
        }
        self.transitions.push(FallbackTransition {
            state,
            violations: violations.to_vec(),
        });
    }

    /// Whether any state beyond F0 ran.
    pub fn fallback_used(&self) -> bool {
        self.transitions
            .iter()
            .any(|t| t.state != FallbackState::F0Initial)
    }

    pub fn describe(&self) -> String {
        self.transitions
            .iter()
            .map(|t| {
                let failed: Vec<&str> = t.violations.iter().map(|v| v.condition.as_str()).collect();
                if failed.is_empty() {
                    format!("{}: ok", t.state.as_str())
                } else {
                    format!("{}: failed {}", t.state.as_str(), failed.join(","))
                }
            })
            .collect::<Vec<_>>()
            .join("; ")
    }
}

/// F1: restore every compressed block's original content.
pub fn undo_all_compression(blocks: &mut [Block]) -> usize {
    let mut undone = 0;
    for block in blocks.iter_mut() {
        if block.compressed {
            block.undo_compression();
            undone += 1;
        }
    }
    undone
}

/// F3: keep only system and developer blocks, the most recent user block,
/// every constraint, and at most one tool block (highest priority).
pub fn minimal_safe(blocks: Vec<Block>) -> (Vec<Block>, Vec<Block>) {
    let last_user_ts = blocks
        .iter()
        .filter(|b| b.kind == BlockKind::User)
        .map(|b| b.timestamp)
        .max();
    let best_tool = blocks
        .iter()
        .filter(|b| b.kind == BlockKind::Tool)
        .max_by(|a, b| {
            a.priority
                .total_cmp(&b.priority)
                .then_with(|| a.timestamp.cmp(&b.timestamp))
        })
        .map(|b| b.id);

    let mut kept = Vec::new();
    let mut dropped = Vec::new();
    for block in blocks {
        let keep = match block.kind {
            BlockKind::System | BlockKind::Developer | BlockKind::Constraint => true,
            BlockKind::User => Some(block.timestamp) == last_user_ts,
            BlockKind::Tool => Some(block.id) == best_tool,
            BlockKind::Assistant | BlockKind::Doc => false,
        };
        if keep {
            kept.push(block);
        } else {
            dropped.push(block);
        }
    }
    (kept, dropped)
}
