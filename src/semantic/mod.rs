//! Semantic subsystem: embeddings, the vector store, and budget-aware
//! selection.
//!
//! Everything here degrades gracefully: if the embedding model cannot load or
//! the store is unreachable, the semantic stage is skipped and the run
//! continues on heuristics alone.

pub mod embedder;
pub mod select;
pub mod store;

use std::sync::Arc;

use once_cell::sync::OnceCell;

pub use embedder::FastEmbedder;
pub use select::{select_blocks, DropReason, SelectionResult};
pub use store::{SqliteVectorStore, VectorRecord, VectorStore, VectorStoreError};

#[derive(Debug, thiserror::Error)]
pub enum SemanticError {
    #[error("embedding model unavailable: {0}")]
    Unavailable(String),
    #[error("embedding failed: {0}")]
    EmbeddingFailed(String),
    #[error("invalid input: {0}")]
    InvalidInput(String),
}

/// Text → unit-norm vector. Implementations must L2-normalize so dot product
/// equals cosine similarity. Tests inject table-driven stubs.
pub trait Embedder: Send + Sync {
    fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>, SemanticError>;
    fn dimension(&self) -> usize;
    fn id(&self) -> &str;
}

/// Lazy once-per-process initialization in front of a real embedder. The
/// loader runs on first use; failure is latched and every later call reports
/// the semantic stage as unavailable.
pub struct LazyEmbedder {
    cell: OnceCell<Result<Arc<dyn Embedder>, String>>,
    loader: Box<dyn Fn() -> Result<Arc<dyn Embedder>, SemanticError> + Send + Sync>,
    dimension: usize,
    id: String,
}

impl LazyEmbedder {
    pub fn new(
        id: impl Into<String>,
        dimension: usize,
        loader: impl Fn() -> Result<Arc<dyn Embedder>, SemanticError> + Send + Sync + 'static,
    ) -> Self {
        Self {
            cell: OnceCell::new(),
            loader: Box::new(loader),
            dimension,
            id: id.into(),
        }
    }

    fn inner(&self) -> Result<Arc<dyn Embedder>, SemanticError> {
        self.cell
            .get_or_init(|| (self.loader)().map_err(|e| e.to_string()))
            .clone()
            .map_err(SemanticError::Unavailable)
    }
}

impl Embedder for LazyEmbedder {
    fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>, SemanticError> {
        self.inner()?.embed_batch(texts)
    }

    fn dimension(&self) -> usize {
        self.cell
            .get()
            .and_then(|r| r.as_ref().ok())
            .map(|e| e.dimension())
            .unwrap_or(self.dimension)
    }

    fn id(&self) -> &str {
        &self.id
    }
}

/// Dot product of two unit-norm vectors, i.e. their cosine similarity.
pub fn cosine(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}
