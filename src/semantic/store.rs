//! Multi-tenant vector store.
//!
//! Persists blocks and their embeddings in sqlite and answers cosine top-k
//! queries. Records expose their stored embedding so the selector can compute
//! pairwise similarities without re-embedding. The pipeline only reads from
//! the store; ingestion goes through `upsert` separately.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, Connection};
use serde_json::Value;

use crate::block::BlockKind;

use super::cosine;

#[derive(Debug, Clone)]
pub struct VectorRecord {
    pub block_id: String,
    pub tenant: String,
    pub kind: BlockKind,
    pub content: String,
    pub token_count: usize,
    pub created_at: DateTime<Utc>,
    pub fingerprint: String,
    pub metadata: Value,
    pub embedding: Vec<f32>,
}

#[derive(Debug, thiserror::Error)]
pub enum VectorStoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("store lock poisoned")]
    Poisoned,
    #[error("task join error: {0}")]
    Join(String),
    #[error("dimension mismatch: expected {expected}, got {got}")]
    Dimension { expected: usize, got: usize },
}

#[async_trait]
pub trait VectorStore: Send + Sync {
    async fn upsert(&self, record: VectorRecord) -> Result<(), VectorStoreError>;
    async fn delete(&self, block_id: &str) -> Result<(), VectorStoreError>;
    /// Records for `tenant` in descending cosine similarity to `query`.
    async fn ann_search(
        &self,
        tenant: &str,
        query: &[f32],
        top_k: usize,
        kind_filter: Option<BlockKind>,
    ) -> Result<Vec<VectorRecord>, VectorStoreError>;
}

/// Sqlite-backed store with the persistent schema: a `blocks` table keyed by
/// id with a unique (tenant, fingerprint) index for dedup, and an
/// `embeddings` table holding little-endian f32 vectors.
#[derive(Clone)]
pub struct SqliteVectorStore {
    path: PathBuf,
    conn: Arc<Mutex<Connection>>,
    dimension: usize,
    model_name: String,
}

impl SqliteVectorStore {
    pub fn open(
        path: impl AsRef<Path>,
        dimension: usize,
        model_name: impl Into<String>,
    ) -> Result<Self, VectorStoreError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let conn = Connection::open(&path)?;
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;\
             PRAGMA synchronous=NORMAL;\
             CREATE TABLE IF NOT EXISTS blocks (\
               id TEXT PRIMARY KEY,\
               tenant TEXT NOT NULL,\
               fingerprint TEXT NOT NULL,\
               kind TEXT NOT NULL,\
               content TEXT NOT NULL,\
               tokens INTEGER NOT NULL,\
               created_at INTEGER NOT NULL,\
               metadata TEXT\
             );\
             CREATE UNIQUE INDEX IF NOT EXISTS blocks_tenant_fingerprint \
               ON blocks(tenant, fingerprint);\
             CREATE INDEX IF NOT EXISTS blocks_tenant_kind ON blocks(tenant, kind);\
             CREATE TABLE IF NOT EXISTS embeddings (\
               block_id TEXT PRIMARY KEY REFERENCES blocks(id) ON DELETE CASCADE,\
               vector BLOB NOT NULL,\
               model_name TEXT NOT NULL\
             );",
        )?;

        Ok(Self {
            path,
            conn: Arc::new(Mutex::new(conn)),
            dimension,
            model_name: model_name.into(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn with_conn<F, R>(&self, f: F) -> Result<R, VectorStoreError>
    where
        F: FnOnce(&Connection) -> Result<R, VectorStoreError>,
    {
        let guard = self.conn.lock().map_err(|_| VectorStoreError::Poisoned)?;
        f(&guard)
    }
}

fn vector_to_blob(vector: &[f32]) -> Vec<u8> {
    let mut blob = Vec::with_capacity(vector.len() * 4);
    for v in vector {
        blob.extend_from_slice(&v.to_le_bytes());
    }
    blob
}

fn blob_to_vector(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

#[async_trait]
impl VectorStore for SqliteVectorStore {
    async fn upsert(&self, record: VectorRecord) -> Result<(), VectorStoreError> {
        if record.embedding.len() != self.dimension {
            return Err(VectorStoreError::Dimension {
                expected: self.dimension,
                got: record.embedding.len(),
            });
        }
        let store = self.clone();
        let model_name = self.model_name.clone();
        tokio::task::spawn_blocking(move || {
            store.with_conn(|conn| {
                // Dedup on (tenant, fingerprint): reuse the existing row id so
                // the embedding lands on the stored block.
                let existing: Option<String> = conn
                    .query_row(
                        "SELECT id FROM blocks WHERE tenant = ?1 AND fingerprint = ?2",
                        params![record.tenant, record.fingerprint],
                        |row| row.get(0),
                    )
                    .map(Some)
                    .or_else(|e| match e {
                        rusqlite::Error::QueryReturnedNoRows => Ok(None),
                        other => Err(other),
                    })?;

                let block_id = existing.unwrap_or_else(|| record.block_id.clone());
                conn.execute(
                    "INSERT INTO blocks (id, tenant, fingerprint, kind, content, tokens, created_at, metadata)\
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)\
                     ON CONFLICT(id) DO UPDATE SET \
                        content = excluded.content,\
                        tokens = excluded.tokens,\
                        created_at = excluded.created_at,\
                        metadata = excluded.metadata",
                    params![
                        block_id,
                        record.tenant,
                        record.fingerprint,
                        record.kind.as_str(),
                        record.content,
                        record.token_count as i64,
                        record.created_at.timestamp(),
                        record.metadata.to_string(),
                    ],
                )?;
                conn.execute(
                    "INSERT INTO embeddings (block_id, vector, model_name) VALUES (?1, ?2, ?3)\
                     ON CONFLICT(block_id) DO UPDATE SET \
                        vector = excluded.vector,\
                        model_name = excluded.model_name",
                    params![block_id, vector_to_blob(&record.embedding), model_name],
                )?;
                Ok(())
            })
        })
        .await
        .map_err(|e| VectorStoreError::Join(e.to_string()))?
    }

    async fn delete(&self, block_id: &str) -> Result<(), VectorStoreError> {
        let store = self.clone();
        let block_id = block_id.to_string();
        tokio::task::spawn_blocking(move || {
            store.with_conn(|conn| {
                conn.execute("DELETE FROM embeddings WHERE block_id = ?1", params![block_id])?;
                conn.execute("DELETE FROM blocks WHERE id = ?1", params![block_id])?;
                Ok(())
            })
        })
        .await
        .map_err(|e| VectorStoreError::Join(e.to_string()))?
    }

    async fn ann_search(
        &self,
        tenant: &str,
        query: &[f32],
        top_k: usize,
        kind_filter: Option<BlockKind>,
    ) -> Result<Vec<VectorRecord>, VectorStoreError> {
        if query.len() != self.dimension {
            return Err(VectorStoreError::Dimension {
                expected: self.dimension,
                got: query.len(),
            });
        }
        if top_k == 0 {
            return Ok(Vec::new());
        }

        let store = self.clone();
        let tenant = tenant.to_string();
        let query = query.to_vec();
        tokio::task::spawn_blocking(move || {
            store.with_conn(|conn| {
                let sql = match kind_filter {
                    Some(_) => {
                        "SELECT b.id, b.tenant, b.fingerprint, b.kind, b.content, b.tokens,\
                                b.created_at, b.metadata, e.vector \
                         FROM blocks b JOIN embeddings e ON b.id = e.block_id \
                         WHERE b.tenant = ?1 AND b.kind = ?2"
                    }
                    None => {
                        "SELECT b.id, b.tenant, b.fingerprint, b.kind, b.content, b.tokens,\
                                b.created_at, b.metadata, e.vector \
                         FROM blocks b JOIN embeddings e ON b.id = e.block_id \
                         WHERE b.tenant = ?1"
                    }
                };
                let mut stmt = conn.prepare(sql)?;
                let mut rows = match kind_filter {
                    Some(kind) => stmt.query(params![tenant, kind.as_str()])?,
                    None => stmt.query(params![tenant])?,
                };

                let mut scored: Vec<(f32, VectorRecord)> = Vec::new();
                let mut seen_fingerprints: HashSet<String> = HashSet::new();
                while let Some(row) = rows.next()? {
                    let kind_str: String = row.get(3)?;
                    let Some(kind) = BlockKind::parse(&kind_str) else {
                        continue;
                    };
                    let fingerprint: String = row.get(2)?;
                    if !seen_fingerprints.insert(fingerprint.clone()) {
                        continue;
                    }
                    let blob: Vec<u8> = row.get(8)?;
                    let embedding = blob_to_vector(&blob);
                    if embedding.len() != query.len() {
                        continue;
                    }
                    let metadata: Option<String> = row.get(7)?;
                    let created_at: i64 = row.get(6)?;
                    let record = VectorRecord {
                        block_id: row.get(0)?,
                        tenant: row.get(1)?,
                        kind,
                        content: row.get(4)?,
                        token_count: row.get::<_, i64>(5)? as usize,
                        created_at: Utc
                            .timestamp_opt(created_at, 0)
                            .single()
                            .unwrap_or_else(Utc::now),
                        fingerprint,
                        metadata: metadata
                            .and_then(|m| serde_json::from_str(&m).ok())
                            .unwrap_or(Value::Null),
                        embedding,
                    };
                    let score = cosine(&record.embedding, &query);
                    scored.push((score, record));
                }

                scored.sort_by(|a, b| {
                    b.0.total_cmp(&a.0)
                        .then_with(|| a.1.block_id.cmp(&b.1.block_id))
                });
                scored.truncate(top_k);
                Ok(scored.into_iter().map(|(_, r)| r).collect())
            })
        })
        .await
        .map_err(|e| VectorStoreError::Join(e.to_string()))?
    }
}
