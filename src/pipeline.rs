//! Pipeline orchestration.
//!
//! One `Optimizer` instance holds the shared collaborators (token counter,
//! cache, embedder, vector store, compressor) and drives each request through
//! the staged transformation: canonicalize → heuristics → cache check →
//! semantic selection → compression → validation with progressive fallback.
//! Stage failures degrade; only an invalid request or a post-F3 validation
//! failure surface as errors.

use std::collections::{HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::block::{total_tokens, Block, BlockKind};
use crate::cache::{CacheKey, PromptCache, SingleFlight};
use crate::canonicalize::{blocks_to_messages, canonicalize, ChatMessage, OptimizeRequest};
use crate::compress::{compress_blocks, CompressionStats, Compressor, ExtractiveCompressor};
use crate::config::OptimizeConfig;
use crate::heuristics::{apply_heuristics, mark_last_turns};
use crate::semantic::select::{build_query_text, select_blocks, Candidate, SelectionInput};
use crate::semantic::{Embedder, VectorStore};
use crate::tokenizer::{BoundCounter, TokenCounter};
use crate::validate::{
    minimal_safe, undo_all_compression, validate, FallbackReport, FallbackState, PostCondition,
    ValidationContext,
};

/// Per-stage wall-clock timings in milliseconds.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct StageTimings {
    pub canonicalize: u64,
    pub heuristics: u64,
    pub cache: u64,
    pub semantic: u64,
    pub compression: u64,
    pub validate: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizeStats {
    pub tokens_before: usize,
    pub tokens_after: usize,
    pub tokens_saved: usize,
    /// `1 − after/before`; 0 when the input was empty.
    pub compression_ratio: f64,
    pub route: String,
    pub cache_hit: bool,
    pub fallback_used: bool,
    pub latency_ms: u64,
    pub stage_timings_ms: StageTimings,
    /// Minimum faithfulness over accepted compression candidates.
    pub faithfulness_score: Option<f64>,
    pub tokenizer_fallback: bool,
    /// External stages that were skipped after an error or timeout.
    pub degraded: Vec<String>,
    pub trace_id: Uuid,
}

/// A block that did not make it into the output, with the reason.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DroppedBlock {
    pub id: Uuid,
    pub kind: BlockKind,
    pub tokens: usize,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizeOutcome {
    pub blocks_out: Vec<Block>,
    pub messages_out: Vec<ChatMessage>,
    pub stats: OptimizeStats,
    pub dropped: Vec<DroppedBlock>,
}

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// The request cannot be optimized at all; nothing ran.
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    /// Post-conditions still failed after the last fallback state. The
    /// caller must not forward anything to the provider.
    #[error("validation failed (trace {trace_id}): {details}")]
    ValidationFailed { trace_id: Uuid, details: String },
}

pub struct Optimizer {
    tokens: Arc<dyn TokenCounter>,
    cache: Option<Arc<dyn PromptCache>>,
    embedder: Option<Arc<dyn Embedder>>,
    store: Option<Arc<dyn VectorStore>>,
    compressor: Option<Arc<dyn Compressor>>,
    flights: SingleFlight,
}

impl Optimizer {
    pub fn new(tokens: Arc<dyn TokenCounter>) -> Self {
        Self {
            tokens,
            cache: None,
            embedder: None,
            store: None,
            compressor: None,
            flights: SingleFlight::new(),
        }
    }

    pub fn with_cache(mut self, cache: Arc<dyn PromptCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn with_embedder(mut self, embedder: Arc<dyn Embedder>) -> Self {
        self.embedder = Some(embedder);
        self
    }

    pub fn with_store(mut self, store: Arc<dyn VectorStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_compressor(mut self, compressor: Arc<dyn Compressor>) -> Self {
        self.compressor = Some(compressor);
        self
    }

    /// Run the full pipeline for one request. Panics escaping any stage are
    /// caught here and reported as a validation failure with a trace id; the
    /// caller must not forward anything to the provider in that case.
    pub async fn run(
        &self,
        request: &OptimizeRequest,
        config: &OptimizeConfig,
    ) -> Result<OptimizeOutcome, PipelineError> {
        match AssertUnwindSafe(self.run_inner(request, config))
            .catch_unwind()
            .await
        {
            Ok(result) => result,
            Err(_) => {
                let trace_id = Uuid::new_v4();
                error!(trace = %trace_id, "pipeline panicked; refusing to emit a prompt");
                Err(PipelineError::ValidationFailed {
                    trace_id,
                    details: "internal error".to_string(),
                })
            }
        }
    }

    async fn run_inner(
        &self,
        request: &OptimizeRequest,
        config: &OptimizeConfig,
    ) -> Result<OptimizeOutcome, PipelineError> {
        let started = Instant::now();
        let trace_id = Uuid::new_v4();
        let mut timings = StageTimings::default();
        let mut degraded: Vec<String> = Vec::new();

        validate_request(request)?;

        let mut config = config.clone();
        if let Some(budget) = request.budget_override {
            config.target_budget_tokens = budget;
        }
        let budget = config.target_budget_tokens;
        let pack_target = budget.saturating_sub(config.effective_safety_margin());

        let bound = BoundCounter::new(self.tokens.clone(), request.target_model.clone());

        // Canonicalize and snapshot what the validator will hold us to.
        let stage = Instant::now();
        let canonical = canonicalize(request, &bound);
        timings.canonicalize = elapsed_ms(stage);

        let tokens_before = total_tokens(&canonical);
        let ctx_template = ValidationContext {
            had_system: canonical.iter().any(|b| b.kind == BlockKind::System),
            had_user: canonical.iter().any(|b| b.kind == BlockKind::User),
            must_keep_contents: canonical
                .iter()
                .filter(|b| b.must_keep)
                .map(|b| b.content.clone())
                .collect(),
            constraint_contents: Vec::new(),
            budget_tokens: budget,
        };
        let input_fingerprints: Vec<String> =
            canonical.iter().map(|b| b.fingerprint.clone()).collect();

        // Cache check under single-flight: concurrent identical requests wait
        // for the first computation and then observe its cached value.
        let cache_key = CacheKey::new(
            &request.target_model,
            self.tokens.version(),
            &input_fingerprints,
            &config,
        );
        let _flight = if config.enable_cache && self.cache.is_some() {
            Some(self.flights.acquire(&cache_key.key_hash).await)
        } else {
            None
        };

        if config.enable_cache {
            if let Some(cache) = &self.cache {
                let stage = Instant::now();
                let lookup = tokio::time::timeout(
                    Duration::from_millis(config.cache_timeout_ms),
                    cache.get(&cache_key),
                )
                .await;
                timings.cache = elapsed_ms(stage);
                match lookup {
                    Ok(Ok(Some(mut outcome))) => {
                        debug!(key = %cache_key.key_hash, "cache hit");
                        outcome.stats.cache_hit = true;
                        outcome.stats.route = "heuristic+cache-hit".to_string();
                        outcome.stats.trace_id = trace_id;
                        outcome.stats.latency_ms = elapsed_ms(started);
                        outcome.stats.stage_timings_ms = StageTimings {
                            cache: timings.cache,
                            canonicalize: timings.canonicalize,
                            ..Default::default()
                        };
                        return Ok(outcome);
                    }
                    Ok(Ok(None)) => {}
                    Ok(Err(e)) => {
                        warn!("cache get failed, treating as miss: {e}");
                        degraded.push("cache".to_string());
                    }
                    Err(_) => {
                        warn!("cache get timed out, treating as miss");
                        degraded.push("cache".to_string());
                    }
                }
            }
        }

        // Heuristics always run.
        let stage = Instant::now();
        let mut blocks = apply_heuristics(canonical.clone(), &config, &bound);
        timings.heuristics = elapsed_ms(stage);

        let mut ctx = ctx_template;
        ctx.constraint_contents = blocks
            .iter()
            .filter(|b| b.kind == BlockKind::Constraint && b.source == "extracted-constraints")
            .map(|b| b.content.clone())
            .collect();

        let checkpoint = blocks.clone();
        let mut route: Vec<&str> = vec!["heuristic"];
        let mut sel_dropped: Vec<DroppedBlock> = Vec::new();

        // Semantic selection, only when still over budget.
        let stage = Instant::now();
        if config.enable_semantic && total_tokens(&blocks) > budget {
            let (next, dropped, changed) = self
                .run_semantic(blocks, &config, &request.tenant_id, &bound, &mut degraded)
                .await;
            blocks = next;
            sel_dropped = dropped;
            if changed {
                route.push("semantic");
            }
        }
        timings.semantic = elapsed_ms(stage);

        // Compression, only when still over budget.
        let stage = Instant::now();
        let mut compression = CompressionStats::default();
        if config.enable_compression && total_tokens(&blocks) > budget {
            compression = self
                .run_compression(&mut blocks, pack_target, &config, &bound, &mut degraded)
                .await;
            if compression.compressed > 0 {
                route.push("compression");
            }
        }
        timings.compression = elapsed_ms(stage);

        // Validation with the progressive fallback ladder.
        let stage = Instant::now();
        let mut report = FallbackReport::default();
        let mut fallback_dropped: Vec<DroppedBlock> = Vec::new();

        let mut violations = validate(&blocks, &ctx);
        report.record(FallbackState::F0Initial, &violations);

        if !violations.is_empty()
            && violations
                .iter()
                .any(|v| v.condition == PostCondition::V4Budget)
        {
            undo_all_compression(&mut blocks);
            violations = validate(&blocks, &ctx);
            report.record(FallbackState::F1UndoCompression, &violations);
        }

        if !violations.is_empty() {
            // Widen the kept window on a local copy and replay selection and
            // compression from the heuristics checkpoint.
            let mut widened = config.clone();
            widened.keep_last_n_turns += 2;

            blocks = checkpoint.clone();
            mark_last_turns(&mut blocks, widened.keep_last_n_turns);
            if widened.enable_semantic && total_tokens(&blocks) > budget {
                let (next, dropped, changed) = self
                    .run_semantic(blocks, &widened, &request.tenant_id, &bound, &mut degraded)
                    .await;
                blocks = next;
                sel_dropped = dropped;
                if changed && !route.contains(&"semantic") {
                    route.push("semantic");
                }
            }
            if widened.enable_compression && total_tokens(&blocks) > budget {
                let stats = self
                    .run_compression(&mut blocks, pack_target, &widened, &bound, &mut degraded)
                    .await;
                if stats.compressed > 0 && !route.contains(&"compression") {
                    route.push("compression");
                }
                compression.compressed += stats.compressed;
                compression.rejected += stats.rejected;
                compression.min_faithfulness = match (compression.min_faithfulness, stats.min_faithfulness)
                {
                    (Some(a), Some(b)) => Some(a.min(b)),
                    (a, b) => a.or(b),
                };
            }
            violations = validate(&blocks, &ctx);
            report.record(FallbackState::F2WidenKeep, &violations);
        }

        if !violations.is_empty() {
            let (kept, removed) = minimal_safe(std::mem::take(&mut blocks));
            blocks = kept;
            for block in removed {
                fallback_dropped.push(DroppedBlock {
                    id: block.id,
                    kind: block.kind,
                    tokens: block.token_count,
                    reason: "fallback".to_string(),
                });
            }
            violations = validate(&blocks, &ctx);
            report.record(FallbackState::F3MinimalSafe, &violations);
            if !violations.is_empty() {
                return Err(PipelineError::ValidationFailed {
                    trace_id,
                    details: report.describe(),
                });
            }
        }
        timings.validate = elapsed_ms(stage);

        let fallback_used = report.fallback_used();
        if fallback_used {
            route.push("fallback");
        }

        // Assemble stats and the dropped list.
        let tokens_after = total_tokens(&blocks);
        let compression_ratio = if tokens_before == 0 {
            0.0
        } else {
            1.0 - tokens_after as f64 / tokens_before as f64
        };

        degraded.sort();
        degraded.dedup();
        let stats = OptimizeStats {
            tokens_before,
            tokens_after,
            tokens_saved: tokens_before.saturating_sub(tokens_after),
            compression_ratio,
            route: route.join("+"),
            cache_hit: false,
            fallback_used,
            latency_ms: elapsed_ms(started),
            stage_timings_ms: timings,
            faithfulness_score: compression.min_faithfulness,
            tokenizer_fallback: self.tokens.fallback_used(),
            degraded,
            trace_id,
        };

        let dropped = assemble_dropped(&canonical, &blocks, sel_dropped, fallback_dropped);

        let outcome = OptimizeOutcome {
            messages_out: blocks_to_messages(&blocks),
            blocks_out: blocks,
            stats,
            dropped,
        };

        if config.enable_cache {
            if let Some(cache) = &self.cache {
                let put = tokio::time::timeout(
                    Duration::from_millis(config.cache_timeout_ms),
                    cache.put(
                        &cache_key,
                        &outcome,
                        Duration::from_secs(config.cache_ttl_secs),
                    ),
                )
                .await;
                if !matches!(put, Ok(Ok(()))) {
                    warn!("cache put failed; result not cached");
                }
            }
        }

        Ok(outcome)
    }

    /// Embed the query and candidates, pull tenant-matched neighbours from
    /// the vector store, and run utility/MMR/knapsack selection. Any error
    /// leaves the block list untouched and records a degradation.
    async fn run_semantic(
        &self,
        blocks: Vec<Block>,
        config: &OptimizeConfig,
        tenant: &str,
        bound: &BoundCounter,
        degraded: &mut Vec<String>,
    ) -> (Vec<Block>, Vec<DroppedBlock>, bool) {
        let Some(embedder) = &self.embedder else {
            degraded.push("embedding".to_string());
            return (blocks, Vec::new(), false);
        };
        let Some(query_text) = build_query_text(&blocks) else {
            return (blocks, Vec::new(), false);
        };

        let candidate_ids: Vec<Uuid> = blocks
            .iter()
            .filter(|b| !b.must_keep)
            .map(|b| b.id)
            .collect();
        let mut texts: Vec<String> = vec![query_text.clone()];
        texts.extend(
            blocks
                .iter()
                .filter(|b| !b.must_keep)
                .map(|b| b.content.clone()),
        );

        let embed_task = {
            let embedder = embedder.clone();
            tokio::task::spawn_blocking(move || {
                let refs: Vec<&str> = texts.iter().map(String::as_str).collect();
                embedder.embed_batch(&refs)
            })
        };
        let vectors = match tokio::time::timeout(
            Duration::from_millis(config.embed_timeout_ms),
            embed_task,
        )
        .await
        {
            Ok(Ok(Ok(vectors))) => vectors,
            Ok(Ok(Err(e))) => {
                warn!("embedding unavailable, skipping semantic stage: {e}");
                degraded.push("embedding".to_string());
                return (blocks, Vec::new(), false);
            }
            Ok(Err(join)) => {
                warn!("embedding task failed: {join}");
                degraded.push("embedding".to_string());
                return (blocks, Vec::new(), false);
            }
            Err(_) => {
                warn!("embedding timed out, skipping semantic stage");
                degraded.push("embedding".to_string());
                return (blocks, Vec::new(), false);
            }
        };

        let mut vectors = vectors.into_iter();
        let Some(query_vec) = vectors.next() else {
            degraded.push("embedding".to_string());
            return (blocks, Vec::new(), false);
        };
        let embeddings: HashMap<Uuid, Vec<f32>> = candidate_ids.into_iter().zip(vectors).collect();

        let extra = self
            .pull_neighbours(&blocks, &query_vec, config, tenant, bound, degraded)
            .await;

        let before_ids: Vec<Uuid> = blocks.iter().map(|b| b.id).collect();
        let result = select_blocks(
            SelectionInput {
                blocks,
                extra,
                embeddings,
                query_vec,
                query_text,
            },
            config,
        );
        let after_ids: Vec<Uuid> = result.selected.iter().map(|b| b.id).collect();
        let changed = before_ids != after_ids;

        let dropped = result
            .dropped
            .into_iter()
            .map(|(block, reason)| DroppedBlock {
                id: block.id,
                kind: block.kind,
                tokens: block.token_count,
                reason: reason.as_str().to_string(),
            })
            .collect();

        (result.selected, dropped, changed)
    }

    /// Per-kind neighbour pull from the vector store for this tenant.
    async fn pull_neighbours(
        &self,
        blocks: &[Block],
        query_vec: &[f32],
        config: &OptimizeConfig,
        tenant: &str,
        bound: &BoundCounter,
        degraded: &mut Vec<String>,
    ) -> Vec<Candidate> {
        let Some(store) = &self.store else {
            return Vec::new();
        };
        if config.vector_topk == 0 {
            return Vec::new();
        }

        let known: HashSet<&str> = blocks.iter().map(|b| b.fingerprint.as_str()).collect();
        let min_ts = blocks.iter().map(|b| b.timestamp).min().unwrap_or(0);

        let mut records = Vec::new();
        for kind in [
            BlockKind::Doc,
            BlockKind::Assistant,
            BlockKind::Tool,
            BlockKind::User,
        ] {
            if config.fraction_for(kind.as_str()) <= 0.0 {
                continue;
            }
            let search = tokio::time::timeout(
                Duration::from_millis(config.embed_timeout_ms),
                store.ann_search(tenant, query_vec, config.vector_topk, Some(kind)),
            )
            .await;
            match search {
                Ok(Ok(found)) => records.extend(found),
                Ok(Err(e)) => {
                    warn!("vector store search failed: {e}");
                    degraded.push("vector-store".to_string());
                    return Vec::new();
                }
                Err(_) => {
                    warn!("vector store search timed out");
                    degraded.push("vector-store".to_string());
                    return Vec::new();
                }
            }
        }

        records.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.block_id.cmp(&b.block_id))
        });

        let mut extra = Vec::new();
        let mut seen: HashSet<String> = HashSet::new();
        let base_ts = min_ts - records.len() as i64;
        for (i, record) in records.into_iter().enumerate() {
            if known.contains(record.fingerprint.as_str()) || !seen.insert(record.fingerprint.clone())
            {
                continue;
            }
            let count = bound.count(&record.content);
            let block = Block::new(
                record.kind,
                record.content,
                count,
                base_ts + i as i64,
                format!("retrieved:{}", record.block_id),
            )
            .priority(0.6);
            extra.push(Candidate {
                block,
                embedding: record.embedding,
            });
        }
        extra
    }

    /// Compress with the injected compressor when present, otherwise the
    /// extractive fallback. A stage-level timeout leaves already-accepted
    /// compressions in place and records a degradation.
    async fn run_compression(
        &self,
        blocks: &mut Vec<Block>,
        target_tokens: usize,
        config: &OptimizeConfig,
        bound: &BoundCounter,
        degraded: &mut Vec<String>,
    ) -> CompressionStats {
        let extractive;
        let compressor: &dyn Compressor = match &self.compressor {
            Some(injected) => injected.as_ref(),
            None => {
                extractive = ExtractiveCompressor::new(bound.clone());
                &extractive
            }
        };

        match tokio::time::timeout(
            Duration::from_millis(config.compress_timeout_ms),
            compress_blocks(blocks, target_tokens, config, bound, compressor),
        )
        .await
        {
            Ok(stats) => stats,
            Err(_) => {
                warn!("compression timed out; keeping partial results");
                degraded.push("compressor".to_string());
                CompressionStats::default()
            }
        }
    }
}

fn validate_request(request: &OptimizeRequest) -> Result<(), PipelineError> {
    if request.messages.is_empty() {
        return Err(PipelineError::InvalidRequest("no messages".into()));
    }
    if let Some(last_user) = request
        .messages
        .iter()
        .rev()
        .find(|m| m.role == "user")
    {
        if last_user.content.trim().is_empty() {
            return Err(PipelineError::InvalidRequest("empty user content".into()));
        }
    }
    Ok(())
}

/// Canonical blocks absent from the final output are dropped; blocks the
/// selector or fallback rejected carry their specific reason, everything else
/// was filtered by a heuristic.
fn assemble_dropped(
    canonical: &[Block],
    final_blocks: &[Block],
    sel_dropped: Vec<DroppedBlock>,
    fallback_dropped: Vec<DroppedBlock>,
) -> Vec<DroppedBlock> {
    let final_ids: HashSet<Uuid> = final_blocks.iter().map(|b| b.id).collect();

    let mut by_id: HashMap<Uuid, DroppedBlock> = HashMap::new();
    for d in sel_dropped.into_iter().chain(fallback_dropped) {
        by_id.insert(d.id, d);
    }

    let mut dropped = Vec::new();
    for block in canonical {
        if final_ids.contains(&block.id) {
            continue;
        }
        let entry = by_id.remove(&block.id).unwrap_or_else(|| DroppedBlock {
            id: block.id,
            kind: block.kind,
            tokens: block.token_count,
            reason: "filtered".to_string(),
        });
        dropped.push(entry);
    }
    // Store-pulled candidates that were rejected are not canonical; report
    // them too, in a stable order.
    let mut remaining: Vec<DroppedBlock> = by_id.into_values().collect();
    remaining.sort_by(|a, b| a.id.cmp(&b.id));
    dropped.extend(
        remaining
            .into_iter()
            .filter(|d| !final_ids.contains(&d.id)),
    );
    dropped
}

fn elapsed_ms(since: Instant) -> u64 {
    since.elapsed().as_millis() as u64
}
