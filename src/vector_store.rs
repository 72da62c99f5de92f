//! Vector stores
//!
//! Two backends behind `VectorStore`: an in-memory index for tests and
//! short-lived runs, and a SQLite-backed collection so learned examples and
//! the product index survive restarts. Both score with cosine similarity over
//! a linear scan; collections here are small (thousands, not millions).

use crate::capabilities::{ScoredRecord, VectorDocument, VectorStore};
use crate::error::{AgentError, Result};
use async_trait::async_trait;
use rusqlite::{params, Connection};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Mutex, RwLock};
use tracing::debug;

/// Cosine similarity; 0.0 for mismatched dimensions or zero vectors.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let dot_product: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }

    dot_product / (norm_a * norm_b)
}

fn rank<'a, I>(documents: I, embedding: &[f32], top_k: usize, min_score: f32) -> Vec<ScoredRecord>
where
    I: Iterator<Item = &'a VectorDocument>,
{
    let mut results: Vec<ScoredRecord> = documents
        .filter_map(|doc| {
            let score = cosine_similarity(embedding, &doc.embedding);
            (score >= min_score).then(|| ScoredRecord {
                id: doc.id.clone(),
                text: doc.text.clone(),
                metadata: doc.metadata.clone(),
                score,
            })
        })
        .collect();

    results.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
    results.truncate(top_k);
    results
}

/// Insertion-ordered in-memory index. Re-adding an id replaces the document.
#[derive(Default)]
pub struct InMemoryVectorStore {
    documents: RwLock<Vec<VectorDocument>>,
}

impl InMemoryVectorStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl VectorStore for InMemoryVectorStore {
    async fn add(&self, document: VectorDocument) -> Result<()> {
        let mut documents = self
            .documents
            .write()
            .map_err(|_| AgentError::VectorStore("Vector index lock poisoned".to_string()))?;
        match documents.iter_mut().find(|d| d.id == document.id) {
            Some(existing) => *existing = document,
            None => documents.push(document),
        }
        Ok(())
    }

    async fn search(
        &self,
        embedding: &[f32],
        top_k: usize,
        min_score: f32,
    ) -> Result<Vec<ScoredRecord>> {
        let documents = self
            .documents
            .read()
            .map_err(|_| AgentError::VectorStore("Vector index lock poisoned".to_string()))?;
        Ok(rank(documents.iter(), embedding, top_k, min_score))
    }

    async fn len(&self) -> Result<usize> {
        self.documents
            .read()
            .map(|d| d.len())
            .map_err(|_| AgentError::VectorStore("Vector index lock poisoned".to_string()))
    }
}

/// A named collection inside a SQLite file. Embeddings and metadata are
/// stored as JSON text.
pub struct SqliteVectorStore {
    collection: String,
    db: Mutex<Connection>,
}

impl SqliteVectorStore {
    pub fn open(path: impl AsRef<Path>, collection: impl Into<String>) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let db = Connection::open(path.as_ref())
            .map_err(|e| AgentError::VectorStore(format!("Failed to open vector store: {}", e)))?;
        Self::with_connection(db, collection)
    }

    pub fn in_memory(collection: impl Into<String>) -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?, collection)
    }

    fn with_connection(db: Connection, collection: impl Into<String>) -> Result<Self> {
        db.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS vector_documents (
                collection TEXT NOT NULL,
                id TEXT NOT NULL,
                text TEXT NOT NULL,
                metadata TEXT NOT NULL,
                embedding TEXT NOT NULL,
                PRIMARY KEY (collection, id)
            );
            "#,
        )?;
        Ok(Self {
            collection: collection.into(),
            db: Mutex::new(db),
        })
    }

    fn conn(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.db
            .lock()
            .map_err(|_| AgentError::VectorStore("Vector store lock poisoned".to_string()))
    }

    fn load_all(&self) -> Result<Vec<VectorDocument>> {
        let raws = {
            let db = self.conn()?;
            let mut stmt = db.prepare(
                "SELECT id, text, metadata, embedding FROM vector_documents WHERE collection = ?1",
            )?;
            let rows = stmt
                .query_map(params![self.collection], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                    ))
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows
        };

        raws.into_iter()
            .map(|(id, text, metadata, embedding)| -> Result<VectorDocument> {
                Ok(VectorDocument {
                    id,
                    text,
                    metadata: serde_json::from_str::<HashMap<_, _>>(&metadata)?,
                    embedding: serde_json::from_str(&embedding)?,
                })
            })
            .collect()
    }
}

#[async_trait]
impl VectorStore for SqliteVectorStore {
    async fn add(&self, document: VectorDocument) -> Result<()> {
        let metadata = serde_json::to_string(&document.metadata)?;
        let embedding = serde_json::to_string(&document.embedding)?;
        let db = self.conn()?;
        db.execute(
            "INSERT OR REPLACE INTO vector_documents (collection, id, text, metadata, embedding)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![self.collection, document.id, document.text, metadata, embedding],
        )?;
        debug!("Stored vector document {} in '{}'", document.id, self.collection);
        Ok(())
    }

    async fn search(
        &self,
        embedding: &[f32],
        top_k: usize,
        min_score: f32,
    ) -> Result<Vec<ScoredRecord>> {
        let documents = self.load_all()?;
        Ok(rank(documents.iter(), embedding, top_k, min_score))
    }

    async fn len(&self) -> Result<usize> {
        let db = self.conn()?;
        let count: i64 = db.query_row(
            "SELECT COUNT(*) FROM vector_documents WHERE collection = ?1",
            params![self.collection],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }
}
