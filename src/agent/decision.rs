//! Decision parsing
//!
//! The model answers the action prompt with
//! `{"action": "<tool name>|finish", "input": ..., "reason": "..."}`.
//! Tool names go through `ToolName`'s aliases; a missing SQL input falls back
//! to the user's question.

use crate::agent::contracts::AgentAction;
use crate::error::{AgentError, Result};
use crate::tools::ToolName;
use serde_json::Value;

pub fn parse_decision(raw: &str, user_query: &str) -> Result<AgentAction> {
    let value: Value = serde_json::from_str(raw.trim())
        .map_err(|e| AgentError::Llm(format!("Failed to parse action decision: {}", e)))?;

    let action = value
        .get("action")
        .or_else(|| value.get("tool"))
        .and_then(|v| v.as_str())
        .ok_or_else(|| AgentError::Llm("Action decision has no 'action' field".to_string()))?;

    let reason = value
        .get("reason")
        .and_then(|v| v.as_str())
        .map(str::to_string);

    if action.trim().eq_ignore_ascii_case("finish") {
        return Ok(AgentAction::Finish { reason });
    }

    let input = match value.get("input") {
        Some(Value::String(s)) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Some(v @ Value::Object(_)) => Some(v.to_string()),
        _ => None,
    };

    match action.parse::<ToolName>()? {
        ToolName::SqlExecutor => Ok(AgentAction::Sql {
            question: input.unwrap_or_else(|| user_query.to_string()),
        }),
        ToolName::SemanticSearch => Ok(AgentAction::Search {
            input: input.unwrap_or_else(|| user_query.to_string()),
        }),
    }
}
