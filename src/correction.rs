//! Correction Loop
//!
//! Bounded self-repair for generated SQL. Attempt 1 executes the initial
//! statement; every later attempt asks the model for a corrected statement
//! and executes that. Attempts are strictly sequential because each
//! correction is built from the previous error.
//!
//! Outcomes:
//! - success: rows plus the attempt history; the pair is learned when a
//!   correction was needed (or always, with `learn_first_try_successes`).
//!   A learning failure is reported next to the rows, never instead of them.
//! - `SecurityViolation`: returned as an error at once, never retried
//! - budget exhausted: a pending `FailedQuery` is persisted and returned

use crate::capabilities::{with_timeout, CorrectionRequest, GenerationCapability, QueryRows};
use crate::error::{AgentError, ErrorKind, Result};
use crate::learning::{FailedQuery, FailedQueryAttempt, LearnOutcome, QueryLearningStore};
use crate::tools::SqlExecutionTool;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

/// Why a verified pair could not be stored as a learned example.
#[derive(Debug, Clone, PartialEq)]
pub struct LearningFailure {
    pub kind: ErrorKind,
    pub message: String,
}

impl From<AgentError> for LearningFailure {
    fn from(err: AgentError) -> Self {
        Self {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub enum CorrectionOutcome {
    Resolved {
        sql: String,
        rows: QueryRows,
        /// One entry per failed attempt before the success.
        attempts: Vec<FailedQueryAttempt>,
        learned: bool,
        learn_error: Option<LearningFailure>,
    },
    NeedsManualResolution(FailedQuery),
}

pub struct CorrectionLoop {
    sql: Arc<SqlExecutionTool>,
    generation: Arc<dyn GenerationCapability>,
    learning: Arc<QueryLearningStore>,
    max_attempts: u32,
    timeout: Duration,
    learn_first_try_successes: bool,
}

impl CorrectionLoop {
    pub fn new(
        sql: Arc<SqlExecutionTool>,
        generation: Arc<dyn GenerationCapability>,
        learning: Arc<QueryLearningStore>,
        max_attempts: u32,
        timeout: Duration,
    ) -> Self {
        Self {
            sql,
            generation,
            learning,
            max_attempts: max_attempts.max(1),
            timeout,
            learn_first_try_successes: false,
        }
    }

    pub fn learn_first_try_successes(mut self, enabled: bool) -> Self {
        self.learn_first_try_successes = enabled;
        self
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub async fn resolve(&self, original_query: &str, initial_sql: &str) -> Result<CorrectionOutcome> {
        let mut attempts: Vec<FailedQueryAttempt> = Vec::new();
        // (sql, message, code) of the last statement that reached the store.
        let mut last_failure: Option<(String, String, Option<String>)> = None;
        let mut first_failure: Option<(String, Option<String>)> = None;

        for attempt_number in 1..=self.max_attempts {
            let candidate = match &last_failure {
                None => initial_sql.to_string(),
                Some((failed_sql, message, code)) => {
                    let request = CorrectionRequest {
                        original_query: original_query.to_string(),
                        failed_sql: failed_sql.clone(),
                        error_message: message.clone(),
                        error_code: code.clone(),
                        prior_attempts: attempts.clone(),
                        attempt_number,
                        max_attempts: self.max_attempts,
                    };
                    match with_timeout("sql correction", self.timeout, self.generation.correct_sql(&request))
                        .await
                    {
                        Ok(sql) => sql,
                        Err(e) => {
                            warn!("Attempt {}: correction generation failed: {}", attempt_number, e);
                            attempts.push(FailedQueryAttempt {
                                attempt_number,
                                corrected_sql: String::new(),
                                error_message: e.to_string(),
                                timestamp: Utc::now(),
                            });
                            continue;
                        }
                    }
                }
            };

            match self.sql.execute(&candidate).await {
                Ok(rows) => {
                    let (learned, learn_error) = match self
                        .learn_if_needed(original_query, &candidate, attempt_number)
                        .await
                    {
                        Ok(learned) => (learned, None),
                        Err(e) => {
                            error!("Verified SQL for '{}' was not learned: {}", original_query, e);
                            (false, Some(LearningFailure::from(e)))
                        }
                    };
                    info!(
                        "SQL succeeded on attempt {}/{} ({} row(s))",
                        attempt_number,
                        self.max_attempts,
                        rows.len()
                    );
                    return Ok(CorrectionOutcome::Resolved {
                        sql: candidate,
                        rows,
                        attempts,
                        learned,
                        learn_error,
                    });
                }
                Err(AgentError::Execution { code, message }) => {
                    warn!(
                        "Attempt {}/{} failed: {}",
                        attempt_number, self.max_attempts, message
                    );
                    attempts.push(FailedQueryAttempt {
                        attempt_number,
                        corrected_sql: candidate.clone(),
                        error_message: message.clone(),
                        timestamp: Utc::now(),
                    });
                    if first_failure.is_none() {
                        first_failure = Some((message.clone(), code.clone()));
                    }
                    last_failure = Some((candidate, message, code));
                }
                // SecurityViolation and everything that is not a store
                // rejection ends the loop here.
                Err(e) => return Err(e),
            }
        }

        let (error_message, error_code) = first_failure.unwrap_or_else(|| {
            (
                "No corrected SQL could be generated".to_string(),
                None,
            )
        });
        let record = FailedQuery::pending(
            original_query,
            initial_sql,
            error_message,
            error_code,
            attempts,
        );
        self.learning.record_failure(&record).await?;
        warn!(
            "Giving up after {} attempt(s), failed query {} needs manual resolution",
            self.max_attempts, record.id
        );
        Ok(CorrectionOutcome::NeedsManualResolution(record))
    }

    async fn learn_if_needed(&self, query: &str, sql: &str, attempt_number: u32) -> Result<bool> {
        if attempt_number == 1 && !self.learn_first_try_successes {
            return Ok(false);
        }
        let outcome = self.learning.learn_verified(query, sql).await?;
        Ok(matches!(outcome, LearnOutcome::Stored(_)))
    }
}
