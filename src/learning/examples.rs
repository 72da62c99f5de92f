//! Learned-example memory
//!
//! Verified (question, SQL) pairs embedded for few-shot retrieval. The
//! embedding key is the question itself, so a new question lands next to the
//! examples that answered similar ones.

use crate::capabilities::{with_timeout, EmbeddingProvider, VectorDocument, VectorStore};
use crate::error::{AgentError, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};
use uuid::Uuid;

/// A verified pair as written to the vector store. Immutable once written.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LearnedExample {
    pub id: String,
    pub original_query: String,
    pub corrected_sql: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip)]
    pub embedding: Vec<f32>,
}

/// A stored example returned by similarity lookup.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ExampleMatch {
    pub id: String,
    pub original_query: String,
    pub corrected_sql: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub score: f32,
}

/// Result of `ExampleMemory::learn`.
#[derive(Debug, Clone, PartialEq)]
pub enum LearnOutcome {
    Stored(LearnedExample),
    Duplicate(ExampleMatch),
}

impl LearnOutcome {
    pub fn is_stored(&self) -> bool {
        matches!(self, LearnOutcome::Stored(_))
    }
}

/// Whitespace and case are not meaningful for duplicate detection.
pub fn normalize_sql(sql: &str) -> String {
    sql.trim()
        .trim_end_matches(';')
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

pub struct ExampleMemory {
    embedder: Arc<dyn EmbeddingProvider>,
    store: Arc<dyn VectorStore>,
    timeout: Duration,
    dedup_similarity: f32,
}

impl ExampleMemory {
    pub fn new(
        embedder: Arc<dyn EmbeddingProvider>,
        store: Arc<dyn VectorStore>,
        timeout: Duration,
        dedup_similarity: f32,
    ) -> Self {
        Self {
            embedder,
            store,
            timeout,
            dedup_similarity,
        }
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        with_timeout("embedding", self.timeout, self.embedder.embed(text)).await
    }

    async fn nearest(&self, embedding: &[f32], top_k: usize, min_score: f32) -> Result<Vec<ExampleMatch>> {
        let hits = with_timeout(
            "vector search",
            self.timeout,
            self.store.search(embedding, top_k, min_score),
        )
        .await?;
        Ok(hits
            .into_iter()
            .map(|hit| {
                let text_field = |key: &str| {
                    hit.metadata
                        .get(key)
                        .and_then(|v| v.as_str())
                        .map(str::to_string)
                };
                ExampleMatch {
                    original_query: text_field("originalQuery").unwrap_or_else(|| hit.text.clone()),
                    corrected_sql: text_field("correctedSql").unwrap_or_default(),
                    description: text_field("description"),
                    id: hit.id,
                    score: hit.score,
                }
            })
            .collect())
    }

    /// Every stored example at or above the dedup threshold. The window is
    /// the whole collection so a matching pair is found however many near
    /// questions with other SQL outrank it.
    async fn dedup_candidates(&self, embedding: &[f32]) -> Result<Vec<ExampleMatch>> {
        let stored = with_timeout("vector store", self.timeout, self.store.len()).await?;
        if stored == 0 {
            return Ok(Vec::new());
        }
        self.nearest(embedding, stored, self.dedup_similarity).await
    }

    fn duplicates_in(matches: Vec<ExampleMatch>, sql: &str) -> Vec<ExampleMatch> {
        let normalized = normalize_sql(sql);
        matches
            .into_iter()
            .filter(|m| normalize_sql(&m.corrected_sql) == normalized)
            .collect()
    }

    /// Stored examples at or above the dedup threshold whose SQL matches `sql`.
    pub async fn find_duplicates(&self, query: &str, sql: &str) -> Result<Vec<ExampleMatch>> {
        let embedding = self.embed(query).await?;
        let near = self.dedup_candidates(&embedding).await?;
        Ok(Self::duplicates_in(near, sql))
    }

    /// Embed a verified pair unless an equivalent one is already stored.
    ///
    /// Callers must have executed `sql` successfully first.
    pub async fn learn(
        &self,
        query: &str,
        sql: &str,
        description: Option<String>,
    ) -> Result<LearnOutcome> {
        if sql.trim().is_empty() {
            return Err(AgentError::InvalidArgument("Cannot learn an empty SQL statement".to_string()));
        }

        let embedding = self.embed(query).await?;
        let near = self.dedup_candidates(&embedding).await?;
        if let Some(existing) = Self::duplicates_in(near, sql).into_iter().next() {
            debug!(
                "Skipping learned example for '{}': duplicate of {} (score {:.3})",
                query, existing.id, existing.score
            );
            return Ok(LearnOutcome::Duplicate(existing));
        }

        let example = LearnedExample {
            id: Uuid::new_v4().to_string(),
            original_query: query.to_string(),
            corrected_sql: sql.to_string(),
            description,
            embedding,
        };

        let mut metadata = HashMap::new();
        metadata.insert("originalQuery".to_string(), Value::from(example.original_query.clone()));
        metadata.insert("correctedSql".to_string(), Value::from(example.corrected_sql.clone()));
        if let Some(description) = &example.description {
            metadata.insert("description".to_string(), Value::from(description.clone()));
        }

        with_timeout(
            "vector store",
            self.timeout,
            self.store.add(VectorDocument {
                id: example.id.clone(),
                text: example.original_query.clone(),
                metadata,
                embedding: example.embedding.clone(),
            }),
        )
        .await?;

        info!("Learned example {} for '{}'", example.id, query);
        Ok(LearnOutcome::Stored(example))
    }

    /// Nearest learned examples for a new question.
    pub async fn retrieve(&self, query: &str, top_k: usize) -> Result<Vec<ExampleMatch>> {
        if top_k == 0 {
            return Ok(Vec::new());
        }
        let embedding = self.embed(query).await?;
        self.nearest(&embedding, top_k, f32::MIN).await
    }

    pub async fn len(&self) -> Result<usize> {
        self.store.len().await
    }
}

/// Numbered few-shot block for the SQL generation prompt. Empty when there
/// is nothing to show.
pub fn format_for_prompt(examples: &[ExampleMatch]) -> String {
    if examples.is_empty() {
        return String::new();
    }
    let body = examples
        .iter()
        .enumerate()
        .map(|(idx, example)| {
            format!(
                "{}. Question: {}\n   Description: {}\n   SQL: {}",
                idx + 1,
                example.original_query,
                example.description.as_deref().unwrap_or(&example.original_query),
                example.corrected_sql
            )
        })
        .collect::<Vec<_>>()
        .join("\n\n");
    format!("Verified SQL examples for similar questions:\n\n{}", body)
}
