//! SQL Execution Tool
//!
//! Runs one read-only statement against the relational store. Anything that
//! is not a single SELECT is refused before the store is touched.

use crate::capabilities::{with_timeout, QueryRows, RelationalStore};
use crate::error::{AgentError, Result};
use serde_json::{json, Value};
use sqlparser::ast::Statement;
use sqlparser::dialect::GenericDialect;
use sqlparser::parser::Parser;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

pub const SQL_TOOL_NAME: &str = "sql_executor";

pub struct SqlExecutionTool {
    store: Arc<dyn RelationalStore>,
    timeout: Duration,
}

impl SqlExecutionTool {
    pub fn new(store: Arc<dyn RelationalStore>, timeout: Duration) -> Self {
        Self { store, timeout }
    }

    /// Statement-shape guard, independent of any store.
    ///
    /// The trimmed statement must start with `select` (case-insensitive).
    /// When it parses, it must also be exactly one query statement; text the
    /// parser does not understand is left for the store to reject so its
    /// native error reaches the correction loop.
    pub fn validate(sql: &str) -> Result<()> {
        let trimmed = sql.trim();
        if !trimmed.to_lowercase().starts_with("select") {
            let head: String = trimmed.chars().take(40).collect();
            return Err(AgentError::SecurityViolation(format!(
                "Only SELECT queries are allowed, got '{}'",
                head
            )));
        }

        match Parser::parse_sql(&GenericDialect {}, trimmed) {
            Ok(statements) => {
                if statements.len() > 1 {
                    return Err(AgentError::SecurityViolation(format!(
                        "Only a single statement is allowed, got {}",
                        statements.len()
                    )));
                }
                if let Some(statement) = statements.first() {
                    if !matches!(statement, Statement::Query(_)) {
                        return Err(AgentError::SecurityViolation(
                            "Only query statements are allowed".to_string(),
                        ));
                    }
                }
                Ok(())
            }
            Err(e) => {
                debug!("SQL guard could not parse statement, deferring to store: {}", e);
                Ok(())
            }
        }
    }

    pub async fn execute(&self, sql: &str) -> Result<QueryRows> {
        Self::validate(sql)?;

        let rows = with_timeout("sql execution", self.timeout, self.store.query(sql)).await;
        match &rows {
            Ok(r) => debug!("SQL returned {} row(s)", r.len()),
            Err(e) => warn!("SQL execution failed: {}", e),
        }
        rows
    }
}

pub(crate) fn failure_payload(error: &AgentError) -> Value {
    let mut payload = json!({
        "success": false,
        "kind": error.kind(),
        "error": error.to_string(),
    });
    if let AgentError::Execution { code: Some(code), .. } = error {
        payload["code"] = json!(code);
    }
    payload
}
