use crate::agent::synthesis::{FollowUpQuestion, Insights, VisualizationHint};
use crate::capabilities::QueryRows;
use crate::clarification::{ClarificationSection, ClarificationType};
use crate::tools::ToolName;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// One think/act decision from the generation capability.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum AgentAction {
    /// Answer (part of) the question with SQL; `question` is what to generate SQL for.
    Sql { question: String },
    /// Semantic product search; `input` is a bare string or a `{query, topK}` envelope.
    Search { input: String },
    Finish {
        #[serde(default)]
        reason: Option<String>,
    },
}

impl AgentAction {
    pub fn tool(&self) -> Option<ToolName> {
        match self {
            AgentAction::Sql { .. } => Some(ToolName::SqlExecutor),
            AgentAction::Search { .. } => Some(ToolName::SemanticSearch),
            AgentAction::Finish { .. } => None,
        }
    }
}

/// Output of one tool call, fed back into the next decision.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Observation {
    pub step: u32,
    pub tool: ToolName,
    pub input: String,
    pub success: bool,
    #[serde(default)]
    pub payload: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TraceEventType {
    Clarification,
    ThoughtSummary,
    ToolCall,
    ToolResult,
    Retry,
    Error,
    Synthesis,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceEvent {
    pub ts_ms: u64,
    pub event_type: TraceEventType,
    #[serde(default)]
    pub payload: Value,
}

impl TraceEvent {
    pub fn now(event_type: TraceEventType, payload: Value) -> Self {
        let ts_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;
        Self {
            ts_ms,
            event_type,
            payload,
        }
    }
}

/// Optional inputs to a run.
#[derive(Debug, Clone, Default)]
pub struct QueryOptions {
    /// Answers to a previous clarification request, keyed by axis. When
    /// present the analyzer is skipped.
    pub clarification_answers: Option<HashMap<ClarificationType, String>>,
    pub cancel: CancelFlag,
}

/// Caller-side abort signal. Checked before each loop iteration; in-flight
/// capability calls always finish.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentAnswer {
    pub answer: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub insights: Option<Insights>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub visualization: Option<VisualizationHint>,
    #[serde(default)]
    pub follow_ups: Vec<FollowUpQuestion>,
    /// Last SQL that executed successfully in this run.
    #[serde(default)]
    pub sql: Option<String>,
    #[serde(default)]
    pub rows: Option<QueryRows>,
    pub observations: Vec<Observation>,
    /// Clarification defaults applied instead of asking.
    #[serde(default)]
    pub applied_defaults: HashMap<ClarificationType, String>,
    /// The step budget ran out before the model chose to finish.
    #[serde(default)]
    pub budget_exhausted: bool,
    #[serde(default)]
    pub cancelled: bool,
    /// Problems that did not stop the run, such as a verified query that
    /// could not be learned.
    #[serde(default)]
    pub warnings: Vec<String>,
    #[serde(default)]
    pub trace: Vec<TraceEvent>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManualResolution {
    pub ticket_id: String,
    pub message: String,
    #[serde(default)]
    pub trace: Vec<TraceEvent>,
}

/// Terminal state of one run. Fatal errors are returned as `Err` instead.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status", content = "payload", rename_all = "camelCase")]
pub enum QueryResolution {
    Answered(AgentAnswer),
    NeedsClarification(ClarificationSection),
    NeedsManualResolution(ManualResolution),
}

impl QueryResolution {
    pub fn status(&self) -> &'static str {
        match self {
            QueryResolution::Answered(_) => "answered",
            QueryResolution::NeedsClarification(_) => "needsClarification",
            QueryResolution::NeedsManualResolution(_) => "needsManualResolution",
        }
    }
}
