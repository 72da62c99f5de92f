//! Semantic Search Tool
//!
//! Turns a natural-language fragment into a vector query over the product
//! index. Input is either a bare string or a `{"query", "topK"}` envelope;
//! malformed envelopes degrade to a bare string. Transport failures are
//! reported in the payload instead of being raised.

use crate::capabilities::{with_timeout, EmbeddingProvider, ScoredRecord, VectorStore};
use crate::error::{AgentError, Result};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

pub const SEARCH_TOOL_NAME: &str = "semantic_search";
pub const DEFAULT_TOP_K: usize = 10;

/// Parsed tool input.
#[derive(Debug, Clone, PartialEq)]
pub enum SearchInput {
    Structured { query: String, top_k: Option<usize> },
    RawQuery(String),
}

impl SearchInput {
    /// Never fails: anything that is not a usable envelope is a raw query.
    pub fn parse(input: &str) -> Self {
        let parsed = match serde_json::from_str::<Value>(input.trim()) {
            Ok(Value::Object(map)) => map,
            _ => return SearchInput::RawQuery(input.trim().to_string()),
        };

        let query = parsed
            .get("query")
            .and_then(|v| v.as_str())
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty());

        match query {
            Some(query) => {
                let top_k = parsed
                    .get("topK")
                    .or_else(|| parsed.get("top_k"))
                    .and_then(|v| v.as_u64())
                    .filter(|k| *k > 0)
                    .map(|k| k as usize);
                SearchInput::Structured { query, top_k }
            }
            None => SearchInput::RawQuery(input.trim().to_string()),
        }
    }

    pub fn query(&self) -> &str {
        match self {
            SearchInput::Structured { query, .. } => query,
            SearchInput::RawQuery(query) => query,
        }
    }

    pub fn top_k_or(&self, default: usize) -> usize {
        match self {
            SearchInput::Structured { top_k: Some(k), .. } => *k,
            _ => default,
        }
    }
}

pub struct SemanticSearchTool {
    embedder: Arc<dyn EmbeddingProvider>,
    products: Arc<dyn VectorStore>,
    timeout: Duration,
    default_top_k: usize,
    min_score: f32,
}

impl SemanticSearchTool {
    pub fn new(
        embedder: Arc<dyn EmbeddingProvider>,
        products: Arc<dyn VectorStore>,
        timeout: Duration,
    ) -> Self {
        Self {
            embedder,
            products,
            timeout,
            default_top_k: DEFAULT_TOP_K,
            min_score: 0.0,
        }
    }

    pub fn with_default_top_k(mut self, top_k: usize) -> Self {
        self.default_top_k = top_k.max(1);
        self
    }

    pub fn with_min_score(mut self, min_score: f32) -> Self {
        self.min_score = min_score;
        self
    }

    /// Ranked candidates by descending score; empty when nothing clears the threshold.
    pub async fn search(&self, query: &str, top_k: usize) -> Result<Vec<ScoredRecord>> {
        if top_k == 0 {
            return Err(AgentError::InvalidArgument("topK must be positive".to_string()));
        }
        let embedding = with_timeout("embedding", self.timeout, self.embedder.embed(query)).await?;
        let mut hits = with_timeout(
            "vector search",
            self.timeout,
            self.products.search(&embedding, top_k, self.min_score),
        )
        .await?;
        hits.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        hits.truncate(top_k);
        info!("Semantic search '{}' returned {} result(s)", query, hits.len());
        Ok(hits)
    }

    pub async fn invoke(&self, input: &str) -> Value {
        let parsed = SearchInput::parse(input);
        let top_k = parsed.top_k_or(self.default_top_k);

        match self.search(parsed.query(), top_k).await {
            Ok(hits) => json!({
                "success": true,
                "count": hits.len(),
                "results": hits.iter().map(record_json).collect::<Vec<_>>(),
            }),
            Err(e) => {
                warn!("Semantic search failed: {}", e);
                json!({ "success": false, "error": e.to_string() })
            }
        }
    }
}

fn record_json(record: &ScoredRecord) -> Value {
    let field = |key: &str| record.metadata.get(key).cloned().unwrap_or(Value::Null);
    json!({
        "id": record.id,
        "name": field("name"),
        "description": field("description"),
        "category": field("category"),
        "market": field("market"),
        "text": record.text,
        "score": record.score,
    })
}
