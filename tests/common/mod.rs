//! Scripted capabilities shared by the integration tests.
#![allow(dead_code)]

use async_trait::async_trait;
use serde_json::json;
use sql_insight_agent::agent::{parse_synthesis, AgentAction, Observation, SynthesizedAnswer};
use sql_insight_agent::capabilities::{
    CorrectionRequest, EmbeddingProvider, GenerationCapability, QueryRows, RelationalStore,
    ScoredRecord, SqlGenerationContext, VectorDocument, VectorStore,
};
use sql_insight_agent::clarification::ClarificationSection;
use sql_insight_agent::learning::InMemoryFailedQueryRepository;
use sql_insight_agent::vector_store::InMemoryVectorStore;
use sql_insight_agent::{AgentConfig, AgentError, Capabilities, InsightService, Result};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

pub enum ClarificationScript {
    Proceed,
    Ask(ClarificationSection),
    Fail,
}

/// Generation capability answering from queues. Empty queues mean: no SQL
/// (error), no correction (error), and `finish` for actions.
pub struct ScriptedGeneration {
    clarification: Mutex<ClarificationScript>,
    sql: Mutex<VecDeque<String>>,
    corrections: Mutex<VecDeque<Option<String>>>,
    actions: Mutex<VecDeque<AgentAction>>,
    synthesis: Mutex<Option<String>>,
    pub clarification_calls: AtomicUsize,
    pub generate_calls: AtomicUsize,
    pub correct_calls: AtomicUsize,
    pub action_calls: AtomicUsize,
    pub synthesis_calls: AtomicUsize,
    pub last_examples: Mutex<usize>,
    pub correction_requests: Mutex<Vec<CorrectionRequest>>,
}

impl ScriptedGeneration {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            clarification: Mutex::new(ClarificationScript::Proceed),
            sql: Mutex::new(VecDeque::new()),
            corrections: Mutex::new(VecDeque::new()),
            actions: Mutex::new(VecDeque::new()),
            synthesis: Mutex::new(None),
            clarification_calls: AtomicUsize::new(0),
            generate_calls: AtomicUsize::new(0),
            correct_calls: AtomicUsize::new(0),
            action_calls: AtomicUsize::new(0),
            synthesis_calls: AtomicUsize::new(0),
            last_examples: Mutex::new(0),
            correction_requests: Mutex::new(Vec::new()),
        })
    }

    pub fn set_clarification(&self, script: ClarificationScript) {
        *self.clarification.lock().unwrap() = script;
    }

    pub fn push_sql(&self, sql: &str) {
        self.sql.lock().unwrap().push_back(sql.to_string());
    }

    /// `None` makes that correction call fail.
    pub fn push_correction(&self, sql: Option<&str>) {
        self.corrections
            .lock()
            .unwrap()
            .push_back(sql.map(str::to_string));
    }

    pub fn push_action(&self, action: AgentAction) {
        self.actions.lock().unwrap().push_back(action);
    }

    /// Raw model text for synthesis; without it the answer is a count of
    /// observations.
    pub fn set_synthesis(&self, raw: &str) {
        *self.synthesis.lock().unwrap() = Some(raw.to_string());
    }

    pub fn sql_action(question: &str) -> AgentAction {
        AgentAction::Sql {
            question: question.to_string(),
        }
    }
}

#[async_trait]
impl GenerationCapability for ScriptedGeneration {
    async fn analyze_clarification(&self, _query: &str) -> Result<ClarificationSection> {
        self.clarification_calls.fetch_add(1, Ordering::SeqCst);
        match &*self.clarification.lock().unwrap() {
            ClarificationScript::Proceed => Ok(ClarificationSection::proceed()),
            ClarificationScript::Ask(section) => Ok(section.clone()),
            ClarificationScript::Fail => Err(AgentError::Llm("malformed verdict".to_string())),
        }
    }

    async fn generate_sql(&self, _query: &str, context: &SqlGenerationContext) -> Result<String> {
        self.generate_calls.fetch_add(1, Ordering::SeqCst);
        *self.last_examples.lock().unwrap() = context.examples.len();
        self.sql
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| AgentError::Llm("no scripted SQL".to_string()))
    }

    async fn correct_sql(&self, request: &CorrectionRequest) -> Result<String> {
        self.correct_calls.fetch_add(1, Ordering::SeqCst);
        self.correction_requests.lock().unwrap().push(request.clone());
        match self.corrections.lock().unwrap().pop_front() {
            Some(Some(sql)) => Ok(sql),
            _ => Err(AgentError::Llm("correction unavailable".to_string())),
        }
    }

    async fn choose_action(&self, _query: &str, _observations: &[Observation]) -> Result<AgentAction> {
        self.action_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .actions
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(AgentAction::Finish { reason: None }))
    }

    async fn synthesize_answer(
        &self,
        _query: &str,
        observations: &[Observation],
    ) -> Result<SynthesizedAnswer> {
        self.synthesis_calls.fetch_add(1, Ordering::SeqCst);
        Ok(match &*self.synthesis.lock().unwrap() {
            Some(raw) => parse_synthesis(raw),
            None => SynthesizedAnswer::narrative(format!(
                "answer from {} observation(s)",
                observations.len()
            )),
        })
    }

    async fn describe_sql(&self, query: &str, _sql: &str) -> Result<String> {
        Ok(format!("Answers: {}", query))
    }
}

enum Scripted {
    Rows(QueryRows),
    Fail { code: Option<String>, message: String },
}

fn statement_key(sql: &str) -> String {
    sql.trim()
        .trim_end_matches(';')
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Relational store answering from a statement table. Unknown statements
/// fail with a syntax error.
pub struct ScriptedStore {
    responses: Mutex<HashMap<String, Scripted>>,
    pub calls: AtomicUsize,
}

impl ScriptedStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            responses: Mutex::new(HashMap::new()),
            calls: AtomicUsize::new(0),
        })
    }

    pub fn rows(&self, sql: &str, rows: serde_json::Value) {
        let rows: Vec<serde_json::Map<String, serde_json::Value>> =
            serde_json::from_value(rows).unwrap();
        let columns = rows
            .first()
            .map(|r| r.keys().cloned().collect())
            .unwrap_or_default();
        self.responses
            .lock()
            .unwrap()
            .insert(statement_key(sql), Scripted::Rows(QueryRows { columns, rows }));
    }

    pub fn fail(&self, sql: &str, code: &str, message: &str) {
        self.responses.lock().unwrap().insert(
            statement_key(sql),
            Scripted::Fail {
                code: Some(code.to_string()),
                message: message.to_string(),
            },
        );
    }
}

#[async_trait]
impl RelationalStore for ScriptedStore {
    async fn query(&self, sql: &str) -> Result<QueryRows> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match self.responses.lock().unwrap().get(&statement_key(sql)) {
            Some(Scripted::Rows(rows)) => Ok(rows.clone()),
            Some(Scripted::Fail { code, message }) => Err(AgentError::Execution {
                code: code.clone(),
                message: message.clone(),
            }),
            None => Err(AgentError::Execution {
                code: Some("ER_PARSE_ERROR".to_string()),
                message: format!("You have an error in your SQL syntax near '{}'", sql),
            }),
        }
    }
}

/// Letter-frequency embedding: equal texts embed identically, related texts
/// land close together.
pub struct LetterEmbedder;

#[async_trait]
impl EmbeddingProvider for LetterEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let mut v = vec![0.0; 26];
        for c in text.to_lowercase().chars().filter(|c| c.is_ascii_lowercase()) {
            v[(c as u8 - b'a') as usize] += 1.0;
        }
        Ok(v)
    }
}

/// Embedding provider that always fails.
pub struct DownEmbedder;

#[async_trait]
impl EmbeddingProvider for DownEmbedder {
    async fn embed(&self, _text: &str) -> Result<Vec<f32>> {
        Err(AgentError::Embedding("503 Service Unavailable".to_string()))
    }
}

/// Vector store whose transport is down.
pub struct UnreachableVectorStore;

#[async_trait]
impl VectorStore for UnreachableVectorStore {
    async fn add(&self, _document: VectorDocument) -> Result<()> {
        Err(AgentError::VectorStore("connection refused".to_string()))
    }

    async fn search(&self, _embedding: &[f32], _top_k: usize, _min_score: f32) -> Result<Vec<ScoredRecord>> {
        Err(AgentError::VectorStore("connection refused".to_string()))
    }

    async fn len(&self) -> Result<usize> {
        Err(AgentError::VectorStore("connection refused".to_string()))
    }
}

pub struct Harness {
    pub service: InsightService,
    pub generation: Arc<ScriptedGeneration>,
    pub store: Arc<ScriptedStore>,
    pub examples: Arc<InMemoryVectorStore>,
    pub products: Arc<dyn VectorStore>,
    pub failed: Arc<InMemoryFailedQueryRepository>,
}

pub fn test_config() -> AgentConfig {
    AgentConfig {
        capability_timeout_secs: 5,
        max_correction_attempts: 3,
        search_min_score: 0.0,
        ..AgentConfig::default()
    }
}

pub fn harness_with(config: AgentConfig, products: Arc<dyn VectorStore>) -> Harness {
    harness_with_embedder(config, products, Arc::new(LetterEmbedder))
}

pub fn harness_with_embedder(
    config: AgentConfig,
    products: Arc<dyn VectorStore>,
    embedder: Arc<dyn EmbeddingProvider>,
) -> Harness {
    let generation = ScriptedGeneration::new();
    let store = ScriptedStore::new();
    let examples = Arc::new(InMemoryVectorStore::new());
    let failed = Arc::new(InMemoryFailedQueryRepository::new());
    let capabilities = Capabilities {
        generation: generation.clone(),
        relational: store.clone(),
        embedder,
        examples: examples.clone(),
        products: products.clone(),
        failed_queries: failed.clone(),
    };
    let service = InsightService::new(&config, capabilities).unwrap();
    Harness {
        service,
        generation,
        store,
        examples,
        products,
        failed,
    }
}

pub fn harness() -> Harness {
    harness_with(test_config(), Arc::new(InMemoryVectorStore::new()))
}

pub fn product(id: &str, name: &str, category: &str, embedding: Vec<f32>) -> VectorDocument {
    let mut metadata = HashMap::new();
    metadata.insert("name".to_string(), json!(name));
    metadata.insert("category".to_string(), json!(category));
    VectorDocument {
        id: id.to_string(),
        text: format!("{} {}", name, category),
        metadata,
        embedding,
    }
}
