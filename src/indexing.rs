//! Product indexing
//!
//! Feeds the semantic search corpus: product rows are read in pages through
//! the SQL tool, turned into one searchable text each and embedded into the
//! product vector store. A failed product is counted and skipped.

use crate::capabilities::{with_timeout, EmbeddingProvider, Row, VectorDocument, VectorStore};
use crate::error::{AgentError, Result};
use crate::tools::SqlExecutionTool;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

pub const DEFAULT_PRODUCT_QUERY: &str =
    "SELECT id, name, description, category, market FROM products ORDER BY id";
const BATCH_SIZE: usize = 100;

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct IndexReport {
    pub indexed: usize,
    pub failed: usize,
}

fn text_field(row: &Row, key: &str) -> Option<String> {
    match row.get(key)? {
        Value::Null => None,
        Value::String(s) if s.trim().is_empty() => None,
        Value::String(s) => Some(s.trim().to_string()),
        other => Some(other.to_string()),
    }
}

/// Name, description, category and market joined by spaces, blanks skipped.
pub fn product_text(row: &Row) -> String {
    ["name", "description", "category", "market"]
        .iter()
        .filter_map(|key| text_field(row, key))
        .collect::<Vec<_>>()
        .join(" ")
}

pub struct ProductIndexer {
    sql: Arc<SqlExecutionTool>,
    embedder: Arc<dyn EmbeddingProvider>,
    products: Arc<dyn VectorStore>,
    timeout: Duration,
}

impl ProductIndexer {
    pub fn new(
        sql: Arc<SqlExecutionTool>,
        embedder: Arc<dyn EmbeddingProvider>,
        products: Arc<dyn VectorStore>,
        timeout: Duration,
    ) -> Self {
        Self {
            sql,
            embedder,
            products,
            timeout,
        }
    }

    pub async fn index_all(&self) -> Result<IndexReport> {
        self.index_query(DEFAULT_PRODUCT_QUERY).await
    }

    /// Index the rows of `query`, which must select `id` and `name`.
    pub async fn index_query(&self, query: &str) -> Result<IndexReport> {
        let query = query.trim().trim_end_matches(';');
        let mut report = IndexReport::default();
        let mut offset = 0;

        info!("Starting product indexing");
        loop {
            let page_sql = format!("{} LIMIT {} OFFSET {}", query, BATCH_SIZE, offset);
            let page = self.sql.execute(&page_sql).await?;
            if page.is_empty() {
                break;
            }
            for row in &page.rows {
                match self.index_row(row).await {
                    Ok(()) => report.indexed += 1,
                    Err(e) => {
                        warn!("Failed to index product: {}", e);
                        report.failed += 1;
                    }
                }
            }
            if page.len() < BATCH_SIZE {
                break;
            }
            offset += BATCH_SIZE;
        }

        info!(
            "Indexing completed: {} indexed, {} failed",
            report.indexed, report.failed
        );
        Ok(report)
    }

    async fn index_row(&self, row: &Row) -> Result<()> {
        let id = text_field(row, "id").ok_or_else(|| {
            AgentError::InvalidArgument("Product row has no id".to_string())
        })?;
        let text = product_text(row);
        if text.is_empty() {
            return Err(AgentError::InvalidArgument(format!(
                "Product {} has no searchable text",
                id
            )));
        }

        let embedding = with_timeout("embedding", self.timeout, self.embedder.embed(&text)).await?;
        let metadata: HashMap<String, Value> = ["name", "description", "category", "market"]
            .iter()
            .map(|key| {
                (
                    key.to_string(),
                    text_field(row, key).map(Value::String).unwrap_or(Value::Null),
                )
            })
            .collect();

        with_timeout(
            "vector store",
            self.timeout,
            self.products.add(VectorDocument {
                id,
                text,
                metadata,
                embedding,
            }),
        )
        .await
    }
}
