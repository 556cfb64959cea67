//! FastEmbed-backed local embedder.
//!
//! Loads an ONNX model + tokenizer bundle from disk and produces L2-normalized
//! embeddings. Model assets are never downloaded; a missing bundle surfaces as
//! `SemanticError::Unavailable`, which the pipeline treats as "semantic stage
//! off".

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use fastembed::{
    InitOptionsUserDefined, Pooling, TextEmbedding, TokenizerFiles, UserDefinedEmbeddingModel,
};

use super::{Embedder, SemanticError};

const MODEL_FILE: &str = "model.onnx";
const TOKENIZER_JSON: &str = "tokenizer.json";
const CONFIG_JSON: &str = "config.json";
const SPECIAL_TOKENS_JSON: &str = "special_tokens_map.json";
const TOKENIZER_CONFIG_JSON: &str = "tokenizer_config.json";

pub struct FastEmbedder {
    model: Mutex<TextEmbedding>,
    id: String,
    dimension: usize,
}

impl FastEmbedder {
    /// Files that must all be present in the model directory.
    pub fn required_model_files() -> &'static [&'static str] {
        &[
            MODEL_FILE,
            TOKENIZER_JSON,
            CONFIG_JSON,
            SPECIAL_TOKENS_JSON,
            TOKENIZER_CONFIG_JSON,
        ]
    }

    /// Load the model + tokenizer bundle from a local directory.
    pub fn load_from_dir(
        model_dir: &Path,
        model_id: &str,
        dimension: usize,
    ) -> Result<Self, SemanticError> {
        if !model_dir.is_dir() {
            return Err(SemanticError::Unavailable(format!(
                "model directory not found: {}",
                model_dir.display()
            )));
        }

        let mut missing = Vec::new();
        for name in Self::required_model_files() {
            if !model_dir.join(name).is_file() {
                missing.push(*name);
            }
        }
        if !missing.is_empty() {
            return Err(SemanticError::Unavailable(format!(
                "model files missing in {}: {}",
                model_dir.display(),
                missing.join(", ")
            )));
        }

        let model_file = read_required(model_dir.join(MODEL_FILE), MODEL_FILE)?;
        let tokenizer_files = TokenizerFiles {
            tokenizer_file: read_required(model_dir.join(TOKENIZER_JSON), TOKENIZER_JSON)?,
            config_file: read_required(model_dir.join(CONFIG_JSON), CONFIG_JSON)?,
            special_tokens_map_file: read_required(
                model_dir.join(SPECIAL_TOKENS_JSON),
                SPECIAL_TOKENS_JSON,
            )?,
            tokenizer_config_file: read_required(
                model_dir.join(TOKENIZER_CONFIG_JSON),
                TOKENIZER_CONFIG_JSON,
            )?,
        };

        let mut model = UserDefinedEmbeddingModel::new(model_file, tokenizer_files);
        model.pooling = Some(Pooling::Mean);

        let model = TextEmbedding::try_new_from_user_defined(model, InitOptionsUserDefined::new())
            .map_err(|e| SemanticError::EmbeddingFailed(format!("fastembed init failed: {e}")))?;

        Ok(Self {
            model: Mutex::new(model),
            id: model_id.to_string(),
            dimension,
        })
    }

    fn normalize_in_place(embedding: &mut [f32]) {
        let norm: f32 = embedding.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > f32::EPSILON {
            for v in embedding.iter_mut() {
                *v /= norm;
            }
        }
    }
}

fn read_required(path: PathBuf, label: &str) -> Result<Vec<u8>, SemanticError> {
    fs::read(&path).map_err(|e| {
        SemanticError::Unavailable(format!("unable to read {label} at {}: {e}", path.display()))
    })
}

impl Embedder for FastEmbedder {
    fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>, SemanticError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        for text in texts {
            if text.is_empty() {
                return Err(SemanticError::InvalidInput("empty text in batch".into()));
            }
        }

        let mut model = self
            .model
            .lock()
            .map_err(|_| SemanticError::EmbeddingFailed("fastembed lock poisoned".into()))?;

        let mut embeddings = model
            .embed(texts.to_vec(), None)
            .map_err(|e| SemanticError::EmbeddingFailed(format!("fastembed embed failed: {e}")))?;

        for embedding in embeddings.iter_mut() {
            if embedding.len() != self.dimension {
                return Err(SemanticError::EmbeddingFailed(format!(
                    "dimension mismatch: expected {}, got {}",
                    self.dimension,
                    embedding.len()
                )));
            }
            Self::normalize_in_place(embedding);
        }

        Ok(embeddings)
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn id(&self) -> &str {
        &self.id
    }
}
