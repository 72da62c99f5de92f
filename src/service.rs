//! Composition root
//!
//! Builds every component from injected capabilities and exposes the two
//! outer operations: answering a question and working the failed-query queue.

use crate::agent::{AgentOrchestrator, OrchestratorSettings, QueryOptions, QueryResolution};
use crate::capabilities::{
    EmbeddingProvider, FailedQueryRepository, GenerationCapability, RelationalStore, VectorStore,
};
use crate::config::AgentConfig;
use crate::correction::CorrectionLoop;
use crate::embedding::OpenAiEmbedder;
use crate::error::Result;
use crate::indexing::ProductIndexer;
use crate::learning::{ExampleMemory, QueryLearningStore, SqliteFailedQueryRepository};
use crate::llm::LlmClient;
use crate::relational::SqliteRelationalStore;
use crate::tools::{SemanticSearchTool, SqlExecutionTool};
use crate::vector_store::SqliteVectorStore;
use std::sync::Arc;
use tracing::{info, warn};

const SCHEMA_QUERY: &str = "SELECT name, sql FROM sqlite_master \
                            WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name";

/// Everything the core does not own.
#[derive(Clone)]
pub struct Capabilities {
    pub generation: Arc<dyn GenerationCapability>,
    pub relational: Arc<dyn RelationalStore>,
    pub embedder: Arc<dyn EmbeddingProvider>,
    pub examples: Arc<dyn VectorStore>,
    pub products: Arc<dyn VectorStore>,
    pub failed_queries: Arc<dyn FailedQueryRepository>,
}

pub struct InsightService {
    orchestrator: AgentOrchestrator,
    learning: Arc<QueryLearningStore>,
    indexer: ProductIndexer,
}

impl InsightService {
    pub fn new(config: &AgentConfig, capabilities: Capabilities) -> Result<Self> {
        config.validate()?;
        let timeout = config.capability_timeout();

        let sql = Arc::new(SqlExecutionTool::new(capabilities.relational.clone(), timeout));
        let search = Arc::new(
            SemanticSearchTool::new(
                capabilities.embedder.clone(),
                capabilities.products.clone(),
                timeout,
            )
            .with_default_top_k(config.search_top_k)
            .with_min_score(config.search_min_score),
        );
        let examples = Arc::new(ExampleMemory::new(
            capabilities.embedder.clone(),
            capabilities.examples.clone(),
            timeout,
            config.dedup_similarity,
        ));
        let learning = Arc::new(QueryLearningStore::new(
            capabilities.failed_queries.clone(),
            examples,
            sql.clone(),
            capabilities.generation.clone(),
            timeout,
        ));
        let correction = Arc::new(
            CorrectionLoop::new(
                sql.clone(),
                capabilities.generation.clone(),
                learning.clone(),
                config.max_correction_attempts,
                timeout,
            )
            .learn_first_try_successes(config.learn_first_try_successes),
        );
        let orchestrator = AgentOrchestrator::new(
            capabilities.generation.clone(),
            search,
            correction,
            learning.clone(),
            OrchestratorSettings {
                max_steps: config.max_agent_steps,
                rag_top_k: config.rag_top_k,
                auto_apply_defaults: config.auto_apply_defaults,
                timeout,
            },
        );
        let indexer = ProductIndexer::new(
            sql,
            capabilities.embedder.clone(),
            capabilities.products.clone(),
            timeout,
        );

        Ok(Self {
            orchestrator,
            learning,
            indexer,
        })
    }

    /// Production wiring: OpenAI-compatible model and embeddings, SQLite for
    /// the sales data, the vectors and the failed-query queue.
    pub async fn from_config(config: &AgentConfig) -> Result<Self> {
        config.validate()?;
        let relational: Arc<dyn RelationalStore> =
            Arc::new(SqliteRelationalStore::open(&config.database_path)?);

        let mut llm = LlmClient::from_config(config)?;
        match load_schema(relational.clone(), config).await {
            Ok(schema) => llm = llm.with_schema(schema),
            Err(e) => warn!("Could not read database schema, using built-in summary: {}", e),
        }

        let vectors_path = config.learning_path.join("vectors.db");
        let capabilities = Capabilities {
            generation: Arc::new(llm),
            relational,
            embedder: Arc::new(OpenAiEmbedder::from_config(config)?),
            examples: Arc::new(SqliteVectorStore::open(&vectors_path, "sql_examples")?),
            products: Arc::new(SqliteVectorStore::open(&vectors_path, "products")?),
            failed_queries: Arc::new(SqliteFailedQueryRepository::open(&config.learning_path)?),
        };
        info!(
            "Service ready (database {}, learning store {})",
            config.database_path.display(),
            config.learning_path.display()
        );
        Self::new(config, capabilities)
    }

    pub async fn resolve_query(
        &self,
        raw_query: &str,
        options: QueryOptions,
    ) -> Result<QueryResolution> {
        self.orchestrator.run(raw_query, options).await
    }

    /// Failed-query queue: list, get, resolve, ignore, notes, delete.
    pub fn failed_queries(&self) -> &QueryLearningStore {
        &self.learning
    }

    pub fn indexer(&self) -> &ProductIndexer {
        &self.indexer
    }
}

/// `CREATE TABLE` statements of the relational store, one per line.
async fn load_schema(relational: Arc<dyn RelationalStore>, config: &AgentConfig) -> Result<String> {
    let tool = SqlExecutionTool::new(relational, config.capability_timeout());
    let rows = tool.execute(SCHEMA_QUERY).await?;
    Ok(rows
        .rows
        .iter()
        .filter_map(|row| row.get("sql").and_then(|v| v.as_str()))
        .map(|sql| sql.split_whitespace().collect::<Vec<_>>().join(" "))
        .collect::<Vec<_>>()
        .join("\n"))
}
