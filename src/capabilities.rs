//! Capability contracts
//!
//! Narrow async interfaces to everything the core does not own: the language
//! model, the relational store, the vector store, the embedding provider and
//! failed-query persistence. Implementations are injected at construction by
//! the composition root (`service::InsightService`).

use crate::agent::contracts::{AgentAction, Observation};
use crate::agent::synthesis::SynthesizedAnswer;
use crate::clarification::ClarificationSection;
use crate::error::{AgentError, Result};
use crate::learning::examples::ExampleMatch;
use crate::learning::failed_query::{
    FailedQuery, FailedQueryAttempt, FailedQueryStatus, StatusFilter,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

pub type Row = serde_json::Map<String, Value>;

/// Rows returned by a successful SELECT, unmodified.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct QueryRows {
    pub columns: Vec<String>,
    pub rows: Vec<Row>,
}

impl QueryRows {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// A document stored in a vector index.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VectorDocument {
    pub id: String,
    pub text: String,
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
    pub embedding: Vec<f32>,
}

/// A vector search hit, `score` is cosine similarity.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScoredRecord {
    pub id: String,
    pub text: String,
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
    pub score: f32,
}

/// Context handed to SQL generation: retrieved learned examples plus what the
/// agent has observed so far in this run.
#[derive(Debug, Clone, Default)]
pub struct SqlGenerationContext {
    pub examples: Vec<ExampleMatch>,
    pub observations: Vec<Observation>,
}

/// Everything the model needs to repair a failed statement.
#[derive(Debug, Clone)]
pub struct CorrectionRequest {
    pub original_query: String,
    pub failed_sql: String,
    pub error_message: String,
    pub error_code: Option<String>,
    pub prior_attempts: Vec<FailedQueryAttempt>,
    pub attempt_number: u32,
    pub max_attempts: u32,
}

#[async_trait]
pub trait GenerationCapability: Send + Sync {
    /// Raw clarification verdict; the analyzer normalizes it.
    async fn analyze_clarification(&self, query: &str) -> Result<ClarificationSection>;

    async fn generate_sql(&self, query: &str, context: &SqlGenerationContext) -> Result<String>;

    async fn correct_sql(&self, request: &CorrectionRequest) -> Result<String>;

    /// Pick the next think/act step given the observations so far.
    async fn choose_action(&self, query: &str, observations: &[Observation])
        -> Result<AgentAction>;

    /// Final answer with optional insights, chart hint and follow-ups.
    async fn synthesize_answer(&self, query: &str, observations: &[Observation])
        -> Result<SynthesizedAnswer>;

    /// Short human description stored alongside a learned example.
    async fn describe_sql(&self, query: &str, _sql: &str) -> Result<String> {
        Ok(query.to_string())
    }
}

#[async_trait]
pub trait RelationalStore: Send + Sync {
    /// Run one statement. Store rejections come back as `AgentError::Execution`.
    async fn query(&self, sql: &str) -> Result<QueryRows>;
}

#[async_trait]
pub trait VectorStore: Send + Sync {
    async fn add(&self, document: VectorDocument) -> Result<()>;

    /// Hits at or above `min_score`, ordered by descending score.
    async fn search(&self, embedding: &[f32], top_k: usize, min_score: f32)
        -> Result<Vec<ScoredRecord>>;

    async fn len(&self) -> Result<usize>;
}

#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;
}

/// Persistence for failed-query records.
#[async_trait]
pub trait FailedQueryRepository: Send + Sync {
    async fn save(&self, record: &FailedQuery) -> Result<()>;

    async fn find(&self, id: &str) -> Result<Option<FailedQuery>>;

    async fn update(&self, record: &FailedQuery) -> Result<()>;

    /// Write `record` only while the stored status is still `expected`.
    /// `false` means another writer moved the record first (or deleted it).
    async fn update_if_status(&self, record: &FailedQuery, expected: FailedQueryStatus)
        -> Result<bool>;

    /// One page (newest first) and the total number of matching records.
    async fn list(&self, status: StatusFilter, offset: usize, limit: usize)
        -> Result<(Vec<FailedQuery>, usize)>;

    async fn delete(&self, id: &str) -> Result<bool>;
}

/// Bound a capability call; an elapsed timer becomes `CapabilityTimeout`.
pub async fn with_timeout<T, F>(capability: &str, timeout: Duration, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => Err(AgentError::CapabilityTimeout {
            capability: capability.to_string(),
            timeout_ms: timeout.as_millis() as u64,
        }),
    }
}
