//! Agent Orchestrator
//!
//! One run per incoming question:
//!
//! ```text
//! Start -> AnalyzingClarification -> NeedsClarification (terminal)
//!                                 -> Thinking <-> ActingTool -> Synthesizing -> Answer
//! ```
//!
//! Tool failures become observations and the loop keeps going. Two things end
//! a run early with an error: a `SecurityViolation` from SQL execution and a
//! failure to persist a failed-query record. A verified query that could not
//! be learned keeps its rows; the failure is traced and returned in
//! `AgentAnswer::warnings`. When the step budget runs out the answer is
//! synthesized from whatever was observed.

use crate::agent::contracts::{
    AgentAction, AgentAnswer, ManualResolution, Observation, QueryOptions, QueryResolution,
    TraceEvent, TraceEventType,
};
use crate::agent::synthesis::SynthesizedAnswer;
use crate::capabilities::{with_timeout, GenerationCapability, QueryRows, SqlGenerationContext};
use crate::clarification::{apply_answers, ClarificationAnalyzer, ClarificationType};
use crate::correction::{CorrectionLoop, CorrectionOutcome};
use crate::error::{AgentError, ErrorKind, Result};
use crate::learning::{ExampleMatch, FailedQuery, QueryLearningStore};
use crate::tools::sql::failure_payload;
use crate::tools::{SemanticSearchTool, ToolName};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

pub const MIN_QUERY_CHARS: usize = 3;
pub const MAX_QUERY_CHARS: usize = 500;

/// Validate and trim a raw question.
pub fn validate_query(raw_query: &str) -> Result<&str> {
    let query = raw_query.trim();
    let len = query.chars().count();
    if !(MIN_QUERY_CHARS..=MAX_QUERY_CHARS).contains(&len) {
        return Err(AgentError::InvalidArgument(format!(
            "Query must be between {} and {} characters, got {}",
            MIN_QUERY_CHARS, MAX_QUERY_CHARS, len
        )));
    }
    Ok(query)
}

#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub max_steps: u32,
    pub rag_top_k: usize,
    pub auto_apply_defaults: bool,
    pub timeout: Duration,
}

/// Mutable state of a single run.
#[derive(Default)]
struct RunState {
    observations: Vec<Observation>,
    trace: Vec<TraceEvent>,
    last_sql: Option<String>,
    last_rows: Option<QueryRows>,
    ticket: Option<FailedQuery>,
    warnings: Vec<String>,
}

impl RunState {
    fn observe(&mut self, tool: ToolName, input: &str, success: bool, payload: Value) {
        let step = self.observations.len() as u32 + 1;
        self.trace.push(TraceEvent::now(
            TraceEventType::ToolResult,
            json!({ "tool_name": tool, "step": step, "success": success }),
        ));
        self.observations.push(Observation {
            step,
            tool,
            input: input.to_string(),
            success,
            payload,
        });
    }
}

pub struct AgentOrchestrator {
    generation: Arc<dyn GenerationCapability>,
    analyzer: ClarificationAnalyzer,
    search: Arc<SemanticSearchTool>,
    correction: Arc<CorrectionLoop>,
    learning: Arc<QueryLearningStore>,
    settings: OrchestratorSettings,
}

impl AgentOrchestrator {
    pub fn new(
        generation: Arc<dyn GenerationCapability>,
        search: Arc<SemanticSearchTool>,
        correction: Arc<CorrectionLoop>,
        learning: Arc<QueryLearningStore>,
        settings: OrchestratorSettings,
    ) -> Self {
        Self {
            analyzer: ClarificationAnalyzer::new(generation.clone(), settings.timeout),
            generation,
            search,
            correction,
            learning,
            settings,
        }
    }

    pub async fn run(&self, raw_query: &str, options: QueryOptions) -> Result<QueryResolution> {
        let original = validate_query(raw_query)?;
        let mut state = RunState::default();
        let mut applied_defaults: HashMap<ClarificationType, String> = HashMap::new();

        let query = match &options.clarification_answers {
            Some(answers) => {
                state.trace.push(TraceEvent::now(
                    TraceEventType::Clarification,
                    json!({ "skipped": true, "answers": answers }),
                ));
                apply_answers(original, answers)
            }
            None => {
                let section = self.analyzer.analyze(original).await;
                state.trace.push(TraceEvent::now(
                    TraceEventType::Clarification,
                    json!({ "needs_clarification": section.needs_clarification, "reason": section.reason }),
                ));
                if section.needs_clarification {
                    if !self.settings.auto_apply_defaults {
                        return Ok(QueryResolution::NeedsClarification(section));
                    }
                    applied_defaults = section.defaults();
                    info!("Applying {} clarification default(s)", applied_defaults.len());
                }
                apply_answers(original, &applied_defaults)
            }
        };

        let mut finished = false;
        let mut cancelled = false;
        for step in 1..=self.settings.max_steps {
            if options.cancel.is_cancelled() {
                info!("Run cancelled before step {}", step);
                cancelled = true;
                break;
            }

            let action = self.decide(&query, &mut state).await;
            state.trace.push(TraceEvent::now(
                TraceEventType::ToolCall,
                json!({ "step": step, "action": action }),
            ));

            match action {
                AgentAction::Finish { .. } => {
                    finished = true;
                    break;
                }
                AgentAction::Sql { question } => self.act_sql(&question, &mut state).await?,
                AgentAction::Search { input } => {
                    let payload = self.search.invoke(&input).await;
                    let success = payload.get("success").and_then(|v| v.as_bool()).unwrap_or(false);
                    state.observe(ToolName::SemanticSearch, &input, success, payload);
                }
            }
        }

        let budget_exhausted = !finished && !cancelled;
        if budget_exhausted {
            warn!(
                "Step budget of {} exhausted, answering from partial observations",
                self.settings.max_steps
            );
        }

        if state.last_rows.is_none() {
            if let Some(ticket) = state.ticket.take() {
                return Ok(QueryResolution::NeedsManualResolution(ManualResolution {
                    message: format!(
                        "Unable to answer this question automatically. Failed query {} is pending manual resolution.",
                        ticket.id
                    ),
                    ticket_id: ticket.id,
                    trace: state.trace,
                }));
            }
        }

        let synthesized = if cancelled {
            SynthesizedAnswer::narrative("The run was cancelled before an answer was produced.")
        } else {
            self.synthesize(&query, &mut state).await
        };

        Ok(QueryResolution::Answered(AgentAnswer {
            answer: synthesized.answer,
            insights: synthesized.insights,
            visualization: synthesized.visualization,
            follow_ups: synthesized.follow_ups,
            sql: state.last_sql,
            rows: state.last_rows,
            observations: state.observations,
            applied_defaults,
            budget_exhausted,
            cancelled,
            warnings: state.warnings,
            trace: state.trace,
        }))
    }

    /// A failed decision is not fatal: with nothing observed yet the question
    /// goes straight to SQL, otherwise the run moves on to synthesis.
    async fn decide(&self, query: &str, state: &mut RunState) -> AgentAction {
        let decision = with_timeout(
            "action selection",
            self.settings.timeout,
            self.generation.choose_action(query, &state.observations),
        )
        .await;

        match decision {
            Ok(action) => action,
            Err(e) => {
                warn!("Action selection failed: {}", e);
                state.trace.push(TraceEvent::now(
                    TraceEventType::Error,
                    json!({ "stage": "action_selection", "error": e.to_string() }),
                ));
                if state.observations.is_empty() {
                    AgentAction::Sql {
                        question: query.to_string(),
                    }
                } else {
                    AgentAction::Finish {
                        reason: Some("action selection failed".to_string()),
                    }
                }
            }
        }
    }

    async fn retrieve_examples(&self, question: &str) -> Vec<ExampleMatch> {
        match self
            .learning
            .examples()
            .retrieve(question, self.settings.rag_top_k)
            .await
        {
            Ok(examples) => examples,
            Err(e) => {
                warn!("Learned-example retrieval failed, generating without examples: {}", e);
                Vec::new()
            }
        }
    }

    async fn act_sql(&self, question: &str, state: &mut RunState) -> Result<()> {
        let context = SqlGenerationContext {
            examples: self.retrieve_examples(question).await,
            observations: state.observations.clone(),
        };

        let sql = match with_timeout(
            "sql generation",
            self.settings.timeout,
            self.generation.generate_sql(question, &context),
        )
        .await
        {
            Ok(sql) => sql,
            Err(e) => {
                warn!("SQL generation failed: {}", e);
                state.observe(ToolName::SqlExecutor, question, false, failure_payload(&e));
                return Ok(());
            }
        };

        match self.correction.resolve(question, &sql).await {
            Ok(CorrectionOutcome::Resolved {
                sql,
                rows,
                attempts,
                learned,
                learn_error,
            }) => {
                for attempt in &attempts {
                    state.trace.push(TraceEvent::now(
                        TraceEventType::Retry,
                        json!({
                            "attempt": attempt.attempt_number,
                            "sql": attempt.corrected_sql,
                            "error": attempt.error_message,
                        }),
                    ));
                }
                if let Some(failure) = &learn_error {
                    warn!("Answering without learning the verified SQL: {}", failure.message);
                    state.trace.push(TraceEvent::now(
                        TraceEventType::Error,
                        json!({
                            "stage": "learning",
                            "kind": failure.kind,
                            "error": failure.message,
                            "fatal": false,
                        }),
                    ));
                    state
                        .warnings
                        .push(format!("Verified SQL was not learned: {}", failure.message));
                }
                let payload = json!({
                    "success": true,
                    "sql": sql,
                    "rowCount": rows.len(),
                    "columns": rows.columns,
                    "rows": rows.rows,
                    "correctedAfter": attempts.len(),
                    "learned": learned,
                    "learningError": learn_error.as_ref().map(|f| f.message.clone()),
                });
                state.observe(ToolName::SqlExecutor, question, true, payload);
                state.last_sql = Some(sql);
                state.last_rows = Some(rows);
            }
            Ok(CorrectionOutcome::NeedsManualResolution(record)) => {
                let payload = json!({
                    "success": false,
                    "needsManualResolution": true,
                    "ticketId": record.id,
                    "error": record.error_message,
                    "attempts": record.attempts.len(),
                });
                state.observe(ToolName::SqlExecutor, question, false, payload);
                state.ticket = Some(record);
            }
            Err(e) if e.is_security_violation() || e.kind() == ErrorKind::StorageError => {
                state.trace.push(TraceEvent::now(
                    TraceEventType::Error,
                    json!({ "kind": e.kind(), "error": e.to_string(), "fatal": true }),
                ));
                return Err(e);
            }
            Err(e) => {
                warn!("SQL tool failed: {}", e);
                state.observe(ToolName::SqlExecutor, question, false, failure_payload(&e));
            }
        }
        Ok(())
    }

    async fn synthesize(&self, query: &str, state: &mut RunState) -> SynthesizedAnswer {
        let result = with_timeout(
            "answer synthesis",
            self.settings.timeout,
            self.generation.synthesize_answer(query, &state.observations),
        )
        .await;

        state.trace.push(TraceEvent::now(
            TraceEventType::Synthesis,
            json!({ "success": result.is_ok(), "observations": state.observations.len() }),
        ));

        match result {
            Ok(synthesized) if !synthesized.answer.trim().is_empty() => synthesized,
            Ok(_) => SynthesizedAnswer::narrative(fallback_answer(state)),
            Err(e) => {
                warn!("Answer synthesis failed, using fallback text: {}", e);
                SynthesizedAnswer::narrative(fallback_answer(state))
            }
        }
    }
}

fn fallback_answer(state: &RunState) -> String {
    match &state.last_rows {
        Some(rows) => format!("The query returned {} row(s).", rows.len()),
        None => "Unable to produce an answer from the available data.".to_string(),
    }
}
