//! Query Learning Store
//!
//! Owns failed-query records and the learned-example memory. Every status
//! transition goes through here; the correction loop only records failures
//! and hands over verified pairs.

use crate::capabilities::{with_timeout, FailedQueryRepository, GenerationCapability};
use crate::error::{AgentError, Result};
use crate::learning::examples::{ExampleMatch, ExampleMemory, LearnOutcome};
use crate::learning::failed_query::{FailedQuery, FailedQueryStatus, ListFilter, Page};
use crate::tools::SqlExecutionTool;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

pub struct QueryLearningStore {
    repository: Arc<dyn FailedQueryRepository>,
    examples: Arc<ExampleMemory>,
    sql: Arc<SqlExecutionTool>,
    generation: Arc<dyn GenerationCapability>,
    timeout: Duration,
}

impl QueryLearningStore {
    pub fn new(
        repository: Arc<dyn FailedQueryRepository>,
        examples: Arc<ExampleMemory>,
        sql: Arc<SqlExecutionTool>,
        generation: Arc<dyn GenerationCapability>,
        timeout: Duration,
    ) -> Self {
        Self {
            repository,
            examples,
            sql,
            generation,
            timeout,
        }
    }

    pub fn examples(&self) -> &ExampleMemory {
        &self.examples
    }

    async fn storage<T>(&self, fut: impl std::future::Future<Output = Result<T>>) -> Result<T> {
        with_timeout("failed-query storage", self.timeout, fut).await
    }

    pub async fn record_failure(&self, record: &FailedQuery) -> Result<String> {
        self.storage(self.repository.save(record)).await?;
        info!(
            "Recorded failed query {} after {} attempt(s): {}",
            record.id,
            record.attempts.len(),
            record.original_query
        );
        Ok(record.id.clone())
    }

    pub async fn get(&self, id: &str) -> Result<FailedQuery> {
        self.storage(self.repository.find(id))
            .await?
            .ok_or_else(|| AgentError::NotFound(format!("Failed query {}", id)))
    }

    /// Describe and embed a pair whose SQL has already executed successfully.
    pub async fn learn_verified(&self, query: &str, sql: &str) -> Result<LearnOutcome> {
        let description = match with_timeout(
            "description generation",
            self.timeout,
            self.generation.describe_sql(query, sql),
        )
        .await
        {
            Ok(d) if !d.trim().is_empty() => d.trim().to_string(),
            Ok(_) => query.to_string(),
            Err(e) => {
                warn!("Description generation failed, using the question: {}", e);
                query.to_string()
            }
        };
        self.examples.learn(query, sql, Some(description)).await
    }

    /// Stored examples equivalent to `(query, sql)`.
    pub async fn find_duplicates(&self, query: &str, sql: &str) -> Result<Vec<ExampleMatch>> {
        self.examples.find_duplicates(query, sql).await
    }

    /// Persist a transition out of `pending`. Losing a race with another
    /// writer is `InvalidState`, same as finding the record already closed.
    async fn close(&self, record: &FailedQuery) -> Result<()> {
        let written = self
            .storage(
                self.repository
                    .update_if_status(record, FailedQueryStatus::Pending),
            )
            .await?;
        if !written {
            return Err(AgentError::InvalidState(format!(
                "Failed query {} is no longer pending",
                record.id
            )));
        }
        Ok(())
    }

    /// `pending -> resolved`. The SQL must execute cleanly before anything
    /// changes; the pair is embedded before the status is persisted so a
    /// failed embedding leaves the record pending.
    pub async fn resolve(
        &self,
        id: &str,
        resolved_sql: &str,
        resolved_by: Option<String>,
        notes: Option<String>,
    ) -> Result<FailedQuery> {
        let record = self.get(id).await?;
        if record.status != FailedQueryStatus::Pending {
            return Err(AgentError::InvalidState(format!(
                "Failed query {} is {}, expected pending",
                id, record.status
            )));
        }

        self.sql.execute(resolved_sql).await?;

        let resolved = record.resolve(resolved_sql, resolved_by, notes)?;
        self.learn_verified(&resolved.original_query, resolved_sql).await?;
        self.close(&resolved).await?;
        info!("Resolved failed query {}", id);
        Ok(resolved)
    }

    pub async fn ignore(&self, id: &str, notes: Option<String>) -> Result<FailedQuery> {
        let ignored = self.get(id).await?.ignore(notes)?;
        self.close(&ignored).await?;
        info!("Ignored failed query {}", id);
        Ok(ignored)
    }

    /// Allowed in every status.
    pub async fn update_notes(&self, id: &str, notes: Option<String>) -> Result<FailedQuery> {
        let updated = self.get(id).await?.with_notes(notes);
        self.storage(self.repository.update(&updated)).await?;
        Ok(updated)
    }

    pub async fn delete(&self, id: &str) -> Result<()> {
        if !self.storage(self.repository.delete(id)).await? {
            return Err(AgentError::NotFound(format!("Failed query {}", id)));
        }
        info!("Deleted failed query {}", id);
        Ok(())
    }

    pub async fn list(&self, filter: ListFilter) -> Result<Page<FailedQuery>> {
        let offset = filter.offset()?;
        let limit = usize::try_from(filter.limit).unwrap_or(usize::MAX);
        let (data, total) = self
            .storage(self.repository.list(filter.status, offset, limit))
            .await?;
        Ok(Page::new(data, total, filter.page, filter.limit))
    }
}
