#![forbid(unsafe_code)]

//! # promptpress
//!
//! Middleware core that rewrites an LLM conversation — messages, tool
//! schemas, retrieved documents — into an equivalent prompt that fits a token
//! budget, without silently dropping anything the model needs.
//!
//! The pipeline is a strictly ordered sequence over a single block list:
//! canonicalize → deterministic heuristics → cache check → semantic selection
//! (utility scoring, MMR, per-kind knapsack) → gated compression → validation
//! with progressive fallback. Every stage preserves the must-keep contract:
//! protected content appears verbatim in the output or the run fails loudly.
//!
//! External collaborators (cache, embedding model, vector store, learned
//! compressor) sit behind traits; each degrades to a skipped stage rather
//! than failing the run.

pub mod block;
pub mod cache;
pub mod canonicalize;
pub mod compress;
pub mod config;
pub mod heuristics;
pub mod pipeline;
pub mod semantic;
pub mod tokenizer;
pub mod validate;

pub use block::{Block, BlockKind};
pub use cache::{CacheKey, MemoryCache, PromptCache, SingleFlight};
pub use canonicalize::{ChatMessage, DocInput, OptimizeRequest, ToolOutput, ToolSchema};
pub use compress::{Compressor, ExtractiveCompressor};
pub use config::OptimizeConfig;
pub use pipeline::{
    DroppedBlock, OptimizeOutcome, OptimizeStats, Optimizer, PipelineError, StageTimings,
};
pub use semantic::{Embedder, FastEmbedder, LazyEmbedder, SqliteVectorStore, VectorStore};
pub use tokenizer::{TiktokenCounter, TokenCounter};
