//! Token-level compression with a faithfulness gate.
//!
//! A learned compressor can be injected behind the `Compressor` trait; when it
//! is absent or fails, the extractive summarizer takes over. Every candidate —
//! learned or extractive — must pass the faithfulness gate and be strictly
//! smaller than the original, otherwise the block keeps its original content.

use std::collections::HashSet;

use async_trait::async_trait;
use fancy_regex::Regex as FancyRegex;
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{debug, warn};

use crate::block::{Block, BlockKind};
use crate::config::OptimizeConfig;
use crate::heuristics::CONSTRAINT_KEYWORDS;
use crate::semantic::select::identifier_count;
use crate::tokenizer::BoundCounter;

/// Delimiter tokens a compressor must never drop.
pub const FORCE_PRESERVE_TOKENS: [&str; 6] = ["\n", ".", "!", "?", "```", ":"];

static SENTENCE_WITH_SEP: Lazy<FancyRegex> =
    Lazy::new(|| FancyRegex::new(r"(?<=[.!?])(\s+)").expect("sentence separator regex"));

static NUMBER_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b\d+(?:\.\d+)?\b").expect("number regex"));
static PROPER_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b[A-Z][a-z]+\b|\b[A-Z]{2,}\b").expect("proper noun regex"));
static UUID_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\b[0-9a-f]{8}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{12}\b")
        .expect("uuid regex")
});
static WORD_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"[A-Za-z0-9']+").expect("word regex"));

#[derive(Debug, thiserror::Error)]
pub enum CompressError {
    #[error("compressor unavailable: {0}")]
    Unavailable(String),
    #[error("compression failed: {0}")]
    Failed(String),
}

/// A learned or extractive text compressor.
#[async_trait]
pub trait Compressor: Send + Sync {
    /// Compress `text` to roughly `ratio` of its tokens, preserving every
    /// occurrence of the `force_preserve` delimiters. Returns the candidate
    /// and its token count.
    async fn compress(
        &self,
        text: &str,
        ratio: f64,
        force_preserve: &[&str],
    ) -> Result<(String, usize), CompressError>;
}

/// Extractive fallback: rank sentences with a similarity graph, boost the
/// ones carrying constraints or identifiers, keep top sentences in original
/// order until the target ratio is met.
pub struct ExtractiveCompressor {
    tokens: BoundCounter,
}

impl ExtractiveCompressor {
    pub fn new(tokens: BoundCounter) -> Self {
        Self { tokens }
    }

    fn compress_sync(&self, text: &str, ratio: f64) -> (String, usize) {
        let total = self.tokens.count(text);
        let target = ((total as f64) * ratio.clamp(0.05, 1.0)).ceil() as usize;

        let sentences = split_with_separators(text);
        if sentences.len() < 2 {
            return (text.to_string(), total);
        }

        let scores = rank_sentences(&sentences);

        // Greedy pick by score until the target is reached, then restore
        // original order.
        let mut order: Vec<usize> = (0..sentences.len()).collect();
        order.sort_by(|&a, &b| scores[b].total_cmp(&scores[a]).then(a.cmp(&b)));

        let mut picked: Vec<usize> = Vec::new();
        let mut picked_tokens = 0usize;
        for idx in order {
            if picked_tokens >= target && !picked.is_empty() {
                break;
            }
            picked_tokens += self.tokens.count(&sentences[idx].0);
            picked.push(idx);
        }
        picked.sort_unstable();

        let mut out = String::new();
        for (n, idx) in picked.iter().enumerate() {
            let (sentence, separator) = &sentences[*idx];
            out.push_str(sentence);
            if n + 1 < picked.len() {
                out.push_str(if separator.is_empty() { " " } else { separator });
            }
        }
        let count = self.tokens.count(&out);
        (out, count)
    }
}

#[async_trait]
impl Compressor for ExtractiveCompressor {
    async fn compress(
        &self,
        text: &str,
        ratio: f64,
        _force_preserve: &[&str],
    ) -> Result<(String, usize), CompressError> {
        // Whole sentences are kept verbatim, so the preserved delimiters
        // survive by construction.
        Ok(self.compress_sync(text, ratio))
    }
}

/// Split into (sentence, trailing separator) pairs.
fn split_with_separators(text: &str) -> Vec<(String, String)> {
    let mut out = Vec::new();
    let mut last = 0usize;
    let mut finder = SENTENCE_WITH_SEP.find_iter(text);
    while let Some(Ok(m)) = finder.next() {
        if m.start() > last {
            out.push((
                text[last..m.start()].to_string(),
                text[m.start()..m.end()].to_string(),
            ));
        }
        last = m.end();
    }
    if last < text.len() {
        out.push((text[last..].to_string(), String::new()));
    }
    out
}

/// Graph rank over sentence similarity, with constraint/identifier boosts.
fn rank_sentences(sentences: &[(String, String)]) -> Vec<f64> {
    let n = sentences.len();
    let word_sets: Vec<HashSet<String>> = sentences
        .iter()
        .map(|(s, _)| {
            WORD_RE
                .find_iter(s)
                .map(|m| m.as_str().to_lowercase())
                .filter(|w| w.len() >= 3)
                .collect()
        })
        .collect();

    let mut weights = vec![vec![0.0f64; n]; n];
    for i in 0..n {
        for j in (i + 1)..n {
            let a = &word_sets[i];
            let b = &word_sets[j];
            let union = a.union(b).count();
            if union == 0 {
                continue;
            }
            let sim = a.intersection(b).count() as f64 / union as f64;
            weights[i][j] = sim;
            weights[j][i] = sim;
        }
    }

    // Damped power iteration.
    let damping = 0.85;
    let mut scores = vec![1.0 / n as f64; n];
    for _ in 0..20 {
        let mut next = vec![(1.0 - damping) / n as f64; n];
        for i in 0..n {
            let out_sum: f64 = weights[i].iter().sum();
            if out_sum <= f64::EPSILON {
                continue;
            }
            for j in 0..n {
                if weights[i][j] > 0.0 {
                    next[j] += damping * scores[i] * weights[i][j] / out_sum;
                }
            }
        }
        scores = next;
    }

    for (i, (sentence, _)) in sentences.iter().enumerate() {
        let has_constraint = CONSTRAINT_KEYWORDS.iter().any(|kw| sentence.contains(kw));
        let has_identifier = identifier_count(sentence) > 0;
        if has_constraint {
            scores[i] *= 1.5;
        }
        if has_identifier {
            scores[i] *= 1.3;
        }
    }
    scores
}

/// Entities whose preservation the faithfulness score measures.
fn extract_entities(text: &str) -> HashSet<String> {
    let mut entities: HashSet<String> = HashSet::new();
    for m in PROPER_RE.find_iter(text) {
        entities.insert(m.as_str().to_string());
    }
    for m in NUMBER_RE.find_iter(text) {
        entities.insert(m.as_str().to_string());
    }
    let lowered = text.to_lowercase();
    for m in UUID_RE.find_iter(&lowered) {
        entities.insert(m.as_str().to_string());
    }
    for kw in CONSTRAINT_KEYWORDS {
        if text.contains(kw) {
            entities.insert(kw.to_string());
        }
    }
    entities
}

fn is_critical(entity: &str) -> bool {
    entity.chars().all(|c| c.is_ascii_digit())
        || (entity.len() >= 2 && entity.chars().all(|c| c.is_ascii_uppercase()))
        || UUID_RE.is_match(entity)
}

/// Information-preservation score in [0, 1]. Entity Jaccard blended with
/// critical-identifier recall: losing every identifier caps the score at 0.5,
/// well below any sane acceptance threshold.
pub fn faithfulness(original: &str, candidate: &str) -> f64 {
    let original_entities = extract_entities(original);
    if original_entities.is_empty() {
        return 1.0;
    }
    let candidate_entities = extract_entities(candidate);

    let intersection = original_entities.intersection(&candidate_entities).count() as f64;
    let union = original_entities.union(&candidate_entities).count() as f64;
    let jaccard = if union > 0.0 { intersection / union } else { 1.0 };

    let critical: Vec<&String> = original_entities.iter().filter(|e| is_critical(e)).collect();
    if critical.is_empty() {
        return jaccard;
    }
    let preserved = critical
        .iter()
        .filter(|e| candidate_entities.contains(**e))
        .count() as f64;
    let recall = preserved / critical.len() as f64;
    0.5 * jaccard + 0.5 * recall
}

/// Outcome of one compression pass.
#[derive(Debug, Default)]
pub struct CompressionStats {
    pub compressed: usize,
    pub rejected: usize,
    /// Minimum faithfulness over accepted candidates.
    pub min_faithfulness: Option<f64>,
}

fn eligible(block: &Block, config: &OptimizeConfig) -> bool {
    !block.must_keep
        && !block.compressed
        && !matches!(
            block.kind,
            BlockKind::System | BlockKind::Developer | BlockKind::Constraint
        )
        && block.token_count >= config.compression_min_tokens
}

/// Compress eligible blocks, largest first, until the running total fits
/// `target_tokens`. Rejections keep the original content.
pub async fn compress_blocks(
    blocks: &mut [Block],
    target_tokens: usize,
    config: &OptimizeConfig,
    tokens: &BoundCounter,
    compressor: &dyn Compressor,
) -> CompressionStats {
    let mut stats = CompressionStats::default();
    let mut total: usize = blocks.iter().map(|b| b.token_count).sum();

    let mut order: Vec<usize> = (0..blocks.len())
        .filter(|&i| eligible(&blocks[i], config))
        .collect();
    order.sort_by(|&a, &b| {
        blocks[b]
            .token_count
            .cmp(&blocks[a].token_count)
            .then_with(|| blocks[b].timestamp.cmp(&blocks[a].timestamp))
            .then_with(|| blocks[a].id.to_string().cmp(&blocks[b].id.to_string()))
    });

    for idx in order {
        if total <= target_tokens {
            break;
        }
        let block = &mut blocks[idx];
        let candidate = compressor
            .compress(&block.content, config.compression_ratio, &FORCE_PRESERVE_TOKENS)
            .await;
        let (text, _reported_tokens) = match candidate {
            Ok(result) => result,
            Err(e) => {
                warn!(block = %block.id, "compression failed, keeping original: {e}");
                stats.rejected += 1;
                continue;
            }
        };

        // Recount under the target model's tokenizer rather than trusting the
        // compressor's own accounting.
        let candidate_tokens = tokens.count(&text);
        let score = faithfulness(&block.content, &text);
        if score < config.faithfulness_threshold || candidate_tokens >= block.token_count {
            debug!(
                block = %block.id,
                faithfulness = score,
                "compression candidate rejected"
            );
            stats.rejected += 1;
            continue;
        }

        total -= block.token_count - candidate_tokens;
        block.apply_compression(text, candidate_tokens);
        stats.compressed += 1;
        stats.min_faithfulness = Some(match stats.min_faithfulness {
            Some(current) => current.min(score),
            None => score,
        });
    }

    stats
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tokenizer::TokenCounter;
    use std::sync::Arc;

    struct WordCounter;
    impl TokenCounter for WordCounter {
        fn count(&self, text: &str, _model: &str) -> usize {
            text.split_whitespace().count()
        }
    }

    fn counter() -> BoundCounter {
        BoundCounter::new(Arc::new(WordCounter), "gpt-4")
    }

    #[test]
    fn faithfulness_is_one_when_nothing_to_preserve() {
        assert_eq!(faithfulness("just plain words here", "plain words"), 1.0);
    }

    #[test]
    fn faithfulness_rejects_wholesale_identifier_loss() {
        let original = "The API returns 200 on success, 404 on not found, and 500 on error.";
        let stripped = "The API returns a status code describing the outcome.";
        assert!(faithfulness(original, stripped) < 0.85);
    }

    #[test]
    fn faithfulness_accepts_identifier_preserving_candidates() {
        let original = "The API returns 200 on success, 404 on not found, and 500 on error.";
        let kept = "API: 200 success, 404 not found, 500 error.";
        assert!(faithfulness(original, kept) >= 0.85);
    }

    #[test]
    fn faithfulness_is_monotonic_in_preservation() {
        let original = "Service Alpha returned 200 then 404 then 500 for Bravo.";
        let all = "Alpha returned 200 404 500 Bravo.";
        let some = "Alpha returned 200 for Bravo.";
        let none = "the service returned errors.";
        let f_all = faithfulness(original, all);
        let f_some = faithfulness(original, some);
        let f_none = faithfulness(original, none);
        assert!(f_all > f_some);
        assert!(f_some > f_none);
    }

    #[tokio::test]
    async fn extractive_keeps_sentences_with_identifiers() {
        let text = "The weather was mild throughout the week. \
                    Request 7821 failed with code 503 at the gateway. \
                    Everyone enjoyed the company picnic near the fountain. \
                    Margins improved modestly across the quarter. \
                    The garden needed watering twice this summer.";
        let compressor = ExtractiveCompressor::new(counter());
        let (out, out_tokens) = compressor
            .compress(text, 0.4, &FORCE_PRESERVE_TOKENS)
            .await
            .unwrap();
        assert!(out.contains("7821"));
        assert!(out_tokens < counter().count(text));
    }

    #[tokio::test]
    async fn single_sentence_text_is_returned_unchanged() {
        let text = "One single sentence without much to cut";
        let compressor = ExtractiveCompressor::new(counter());
        let (out, _) = compressor
            .compress(text, 0.3, &FORCE_PRESERVE_TOKENS)
            .await
            .unwrap();
        assert_eq!(out, text);
    }

    struct ScriptedCompressor {
        output: String,
    }

    #[async_trait]
    impl Compressor for ScriptedCompressor {
        async fn compress(
            &self,
            _text: &str,
            _ratio: f64,
            _force_preserve: &[&str],
        ) -> Result<(String, usize), CompressError> {
            Ok((self.output.clone(), self.output.split_whitespace().count()))
        }
    }

    #[tokio::test]
    async fn gate_rejects_unfaithful_candidates() {
        let content = "The API returns 200 on success, 404 on not found, and 500 on error.";
        let mut blocks = vec![Block::new(
            BlockKind::Assistant,
            content,
            counter().count(content),
            0,
            "assistant",
        )];
        let config = OptimizeConfig {
            compression_min_tokens: 4,
            ..Default::default()
        };
        let scripted = ScriptedCompressor {
            output: "status codes vary.".into(),
        };
        let stats = compress_blocks(&mut blocks, 5, &config, &counter(), &scripted).await;
        assert_eq!(stats.compressed, 0);
        assert_eq!(stats.rejected, 1);
        assert!(!blocks[0].compressed);
        assert_eq!(blocks[0].content, content);
    }

    #[tokio::test]
    async fn gate_accepts_faithful_smaller_candidates() {
        let content = "The API returns 200 on success, 404 on not found, and 500 on error.";
        let mut blocks = vec![Block::new(
            BlockKind::Assistant,
            content,
            counter().count(content),
            0,
            "assistant",
        )];
        let config = OptimizeConfig {
            compression_min_tokens: 4,
            ..Default::default()
        };
        let scripted = ScriptedCompressor {
            output: "API: 200 success, 404 not found, 500 error.".into(),
        };
        let stats = compress_blocks(&mut blocks, 5, &config, &counter(), &scripted).await;
        assert_eq!(stats.compressed, 1);
        assert!(blocks[0].compressed);
        assert!(blocks[0].token_count < counter().count(content));
        assert_eq!(blocks[0].original_content.as_deref(), Some(content));
        assert!(stats.min_faithfulness.unwrap() >= 0.85);
    }

    #[tokio::test]
    async fn protected_kinds_are_never_compressed() {
        let mut blocks = vec![
            Block::new(BlockKind::System, "a system prompt with many words in it here", 40, 0, "system"),
            Block::new(BlockKind::Constraint, "MUST stay intact for the whole run always", 40, 1, "extracted-constraints"),
        ];
        let config = OptimizeConfig {
            compression_min_tokens: 4,
            ..Default::default()
        };
        let scripted = ScriptedCompressor {
            output: "short".into(),
        };
        let stats = compress_blocks(&mut blocks, 5, &config, &counter(), &scripted).await;
        assert_eq!(stats.compressed, 0);
        assert!(!blocks[0].compressed);
        assert!(!blocks[1].compressed);
    }
}
