//! Agent tools
//!
//! The reasoning loop can call exactly two tools. The model picks one by name;
//! dispatch happens on the closed `ToolName` set.

pub mod search;
pub mod sql;

pub use search::{SearchInput, SemanticSearchTool, SEARCH_TOOL_NAME};
pub use sql::{SqlExecutionTool, SQL_TOOL_NAME};

use crate::error::{AgentError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ToolName {
    SqlExecutor,
    SemanticSearch,
}

impl ToolName {
    pub fn as_str(&self) -> &'static str {
        match self {
            ToolName::SqlExecutor => SQL_TOOL_NAME,
            ToolName::SemanticSearch => SEARCH_TOOL_NAME,
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            ToolName::SqlExecutor => {
                "Answer with data from the sales database (products, sales, stores). Input: the question or sub-question to turn into a single read-only SELECT."
            }
            ToolName::SemanticSearch => {
                "Find products by meaning (features, materials, style) that SQL columns cannot express. Input: a natural-language string or {\"query\": \"...\", \"topK\": 10}."
            }
        }
    }
}

impl fmt::Display for ToolName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ToolName {
    type Err = AgentError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "sql_executor" | "sql" | "execute_sql" => Ok(ToolName::SqlExecutor),
            "semantic_search" | "search" => Ok(ToolName::SemanticSearch),
            other => Err(AgentError::InvalidArgument(format!("Unknown tool '{}'", other))),
        }
    }
}

/// Tool catalogue rendered into the action-selection prompt.
pub fn tool_catalogue() -> String {
    [ToolName::SqlExecutor, ToolName::SemanticSearch]
        .iter()
        .map(|t| format!("- {}: {}", t.as_str(), t.description()))
        .collect::<Vec<_>>()
        .join("\n")
}
