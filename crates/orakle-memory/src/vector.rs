use std::sync::{Arc, Mutex};

use dashmap::DashMap;
use fastembed::{EmbeddingModel, InitOptions, TextEmbedding};
use rusqlite::Connection;
use serde::{de::DeserializeOwned, Serialize};

use crate::error::MemoryError;

/// Embedding backend abstraction (§4.1: "the embedding model is
/// configuration-selectable"). Per-string results are cached by the
/// implementation, not by callers.
pub trait Embedder: Send + Sync {
    fn embed(&self, text: &str) -> Result<Vec<f32>, MemoryError>;
}

/// Local ONNX-backed embedder via `fastembed`. `TextEmbedding::embed`
/// requires exclusive access to the inference session, so it is guarded by
/// a mutex; a per-string cache avoids re-running inference for text already
/// seen (§4.1: "must cache per-string embeddings").
pub struct FastEmbedEmbedder {
    model: Mutex<TextEmbedding>,
    cache: DashMap<String, Vec<f32>>,
}

impl FastEmbedEmbedder {
    pub fn new(model_name: &str) -> Result<Self, MemoryError> {
        let model = resolve_model(model_name);
        let embedding = TextEmbedding::try_new(InitOptions::new(model))
            .map_err(|e| MemoryError::Embedding(e.to_string()))?;
        Ok(Self {
            model: Mutex::new(embedding),
            cache: DashMap::new(),
        })
    }
}

fn resolve_model(name: &str) -> EmbeddingModel {
    match name {
        "BAAI/bge-small-en-v1.5" => EmbeddingModel::BGESmallENV15,
        "BAAI/bge-base-en-v1.5" => EmbeddingModel::BGEBaseENV15,
        "BAAI/bge-large-en-v1.5" => EmbeddingModel::BGELargeENV15,
        _ => EmbeddingModel::BGESmallENV15,
    }
}

impl Embedder for FastEmbedEmbedder {
    fn embed(&self, text: &str) -> Result<Vec<f32>, MemoryError> {
        if let Some(cached) = self.cache.get(text) {
            return Ok(cached.clone());
        }
        let model = self.model.lock().unwrap();
        let mut vectors = model
            .embed(vec![text], None)
            .map_err(|e| MemoryError::Embedding(e.to_string()))?;
        let vector = vectors.pop().ok_or_else(|| {
            MemoryError::Embedding("embedding backend returned no vectors".to_string())
        })?;
        self.cache.insert(text.to_string(), vector.clone());
        Ok(vector)
    }
}

/// Approximate-nearest-neighbor index over text with arbitrary metadata
/// (C4). Brute-force cosine similarity is adequate at the scale of a
/// single context's memories or conversation log; the relational store
/// remains authoritative (§3 Ownership, §9 "two vector stores, one
/// authority").
pub struct VectorStore<M> {
    conn: Arc<Mutex<Connection>>,
    table: String,
    embedder: Arc<dyn Embedder>,
    _marker: std::marker::PhantomData<M>,
}

impl<M> VectorStore<M>
where
    M: Serialize + DeserializeOwned + Clone,
{
    pub fn new(
        conn: Arc<Mutex<Connection>>,
        collection: &str,
        embedder: Arc<dyn Embedder>,
    ) -> Result<Self, MemoryError> {
        let table = format!("vec_{collection}");
        {
            let db = conn.lock().unwrap();
            db.execute_batch(&format!(
                "CREATE TABLE IF NOT EXISTS {table} (
                    id          TEXT PRIMARY KEY,
                    embedding   BLOB NOT NULL,
                    metadata    TEXT NOT NULL
                );"
            ))?;
        }
        Ok(Self {
            conn,
            table,
            embedder,
            _marker: std::marker::PhantomData,
        })
    }

    pub fn add(&self, id: &str, embedding_input: &str, metadata: &M) -> Result<(), MemoryError> {
        let embedding = self.embedder.embed(embedding_input)?;
        let blob = encode_f32s(&embedding);
        let meta_json = serde_json::to_string(metadata)?;
        let db = self.conn.lock().unwrap();
        db.execute(
            &format!(
                "INSERT INTO {} (id, embedding, metadata) VALUES (?1, ?2, ?3)
                 ON CONFLICT(id) DO UPDATE SET embedding = excluded.embedding, metadata = excluded.metadata",
                self.table
            ),
            rusqlite::params![id, blob, meta_json],
        )?;
        Ok(())
    }

    pub fn delete(&self, id: &str) -> Result<(), MemoryError> {
        let db = self.conn.lock().unwrap();
        db.execute(
            &format!("DELETE FROM {} WHERE id = ?1", self.table),
            [id],
        )?;
        Ok(())
    }

    pub fn reset(&self) -> Result<(), MemoryError> {
        let db = self.conn.lock().unwrap();
        db.execute(&format!("DELETE FROM {}", self.table), [])?;
        Ok(())
    }

    pub fn count(&self) -> Result<usize, MemoryError> {
        let db = self.conn.lock().unwrap();
        let n: i64 = db.query_row(&format!("SELECT COUNT(*) FROM {}", self.table), [], |r| r.get(0))?;
        Ok(n as usize)
    }

    /// Returns up to `limit` (metadata, squared_l2_distance) pairs sorted by
    /// ascending distance, excluding any id in `exclude_ids`. Distance is
    /// squared L2 over unit-normalized embeddings, matching the
    /// `1 - distance/2` cosine identity used by callers (§4.4 step 3).
    pub fn search_with_scores(
        &self,
        query: &str,
        limit: usize,
        exclude_ids: &[String],
    ) -> Result<Vec<(M, f32)>, MemoryError> {
        let query_vec = unit_normalize(self.embedder.embed(query)?);
        let rows: Vec<(String, Vec<u8>, String)> = {
            let db = self.conn.lock().unwrap();
            let mut stmt = db.prepare(&format!("SELECT id, embedding, metadata FROM {}", self.table))?;
            let rows = stmt.query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, Vec<u8>>(1)?, row.get::<_, String>(2)?))
            })?;
            rows.filter_map(|r| r.ok()).collect()
        };

        let mut scored: Vec<(M, f32)> = rows
            .into_iter()
            .filter(|(id, _, _)| !exclude_ids.contains(id))
            .filter_map(|(_, blob, meta_json)| {
                let embedding = unit_normalize(decode_f32s(&blob));
                let metadata: M = serde_json::from_str(&meta_json).ok()?;
                let distance = squared_l2(&query_vec, &embedding);
                Some((metadata, distance))
            })
            .collect();

        scored.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(limit);
        Ok(scored)
    }
}

fn unit_normalize(v: Vec<f32>) -> Vec<f32> {
    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm == 0.0 {
        return v;
    }
    v.into_iter().map(|x| x / norm).collect()
}

fn squared_l2(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| (x - y) * (x - y)).sum()
}

fn encode_f32s(v: &[f32]) -> Vec<u8> {
    v.iter().flat_map(|f| f.to_le_bytes()).collect()
}

fn decode_f32s(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}
