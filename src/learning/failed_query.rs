//! Failed-query records
//!
//! A `FailedQuery` is opened when the correction loop runs out of attempts.
//! It only ever moves `pending -> resolved` or `pending -> ignored`; after
//! that only `notes` may change.

use crate::error::{AgentError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum FailedQueryStatus {
    Pending,
    Resolved,
    Ignored,
}

impl FailedQueryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailedQueryStatus::Pending => "pending",
            FailedQueryStatus::Resolved => "resolved",
            FailedQueryStatus::Ignored => "ignored",
        }
    }
}

impl fmt::Display for FailedQueryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FailedQueryStatus {
    type Err = AgentError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "pending" => Ok(FailedQueryStatus::Pending),
            "resolved" => Ok(FailedQueryStatus::Resolved),
            "ignored" => Ok(FailedQueryStatus::Ignored),
            other => Err(AgentError::InvalidArgument(format!("Unknown status '{}'", other))),
        }
    }
}

/// Status filter for listing; `all` is the wildcard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StatusFilter {
    #[default]
    All,
    Only(FailedQueryStatus),
}

impl StatusFilter {
    pub fn matches(&self, status: FailedQueryStatus) -> bool {
        match self {
            StatusFilter::All => true,
            StatusFilter::Only(s) => *s == status,
        }
    }
}

impl FromStr for StatusFilter {
    type Err = AgentError;

    fn from_str(s: &str) -> Result<Self> {
        if s.trim().eq_ignore_ascii_case("all") {
            Ok(StatusFilter::All)
        } else {
            s.parse().map(StatusFilter::Only)
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FailedQueryAttempt {
    /// 1-based, contiguous within one record.
    pub attempt_number: u32,
    pub corrected_sql: String,
    pub error_message: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FailedQuery {
    pub id: String,
    pub original_query: String,
    /// The first SQL that failed, never rewritten.
    pub failed_sql: String,
    pub error_message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    pub attempts: Vec<FailedQueryAttempt>,
    pub status: FailedQueryStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_sql: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

impl FailedQuery {
    pub fn pending(
        original_query: impl Into<String>,
        failed_sql: impl Into<String>,
        error_message: impl Into<String>,
        error_code: Option<String>,
        attempts: Vec<FailedQueryAttempt>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            original_query: original_query.into(),
            failed_sql: failed_sql.into(),
            error_message: error_message.into(),
            error_code,
            attempts,
            status: FailedQueryStatus::Pending,
            created_at: now,
            updated_at: now,
            resolved_at: None,
            resolved_by: None,
            resolved_sql: None,
            notes: None,
        }
    }

    fn ensure_pending(&self) -> Result<()> {
        if self.status != FailedQueryStatus::Pending {
            return Err(AgentError::InvalidState(format!(
                "Failed query {} is {}, expected pending",
                self.id, self.status
            )));
        }
        Ok(())
    }

    pub fn resolve(
        mut self,
        resolved_sql: impl Into<String>,
        resolved_by: Option<String>,
        notes: Option<String>,
    ) -> Result<Self> {
        self.ensure_pending()?;
        let now = Utc::now();
        self.status = FailedQueryStatus::Resolved;
        self.resolved_sql = Some(resolved_sql.into());
        self.resolved_by = resolved_by;
        self.resolved_at = Some(now);
        self.updated_at = now;
        if notes.is_some() {
            self.notes = notes;
        }
        Ok(self)
    }

    pub fn ignore(mut self, notes: Option<String>) -> Result<Self> {
        self.ensure_pending()?;
        self.status = FailedQueryStatus::Ignored;
        self.updated_at = Utc::now();
        if notes.is_some() {
            self.notes = notes;
        }
        Ok(self)
    }

    /// The one mutation allowed in every status.
    pub fn with_notes(mut self, notes: Option<String>) -> Self {
        self.notes = notes;
        self.updated_at = Utc::now();
        self
    }
}

/// Paginated listing request. Pages are 1-indexed.
#[derive(Debug, Clone, Copy)]
pub struct ListFilter {
    pub status: StatusFilter,
    pub page: i64,
    pub limit: i64,
}

impl Default for ListFilter {
    fn default() -> Self {
        Self {
            status: StatusFilter::All,
            page: 1,
            limit: 20,
        }
    }
}

impl ListFilter {
    pub fn validate(&self) -> Result<()> {
        if self.page <= 0 {
            return Err(AgentError::InvalidArgument(format!(
                "page must be positive, got {}",
                self.page
            )));
        }
        if self.limit <= 0 {
            return Err(AgentError::InvalidArgument(format!(
                "limit must be positive, got {}",
                self.limit
            )));
        }
        Ok(())
    }

    /// Rows to skip. A page too far out to address is rejected rather than
    /// wrapped.
    pub fn offset(&self) -> Result<usize> {
        self.validate()?;
        (self.page - 1)
            .checked_mul(self.limit)
            .and_then(|offset| usize::try_from(offset).ok())
            .ok_or_else(|| {
                AgentError::InvalidArgument(format!(
                    "page {} with limit {} is out of range",
                    self.page, self.limit
                ))
            })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Page<T> {
    pub data: Vec<T>,
    pub total: usize,
    pub page: i64,
    pub limit: i64,
    pub total_pages: usize,
}

impl<T> Page<T> {
    pub fn new(data: Vec<T>, total: usize, page: i64, limit: i64) -> Self {
        let limit_usize = limit.max(1) as usize;
        Self {
            data,
            total,
            page,
            limit,
            total_pages: total.div_ceil(limit_usize),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pending() -> FailedQuery {
        FailedQuery::pending("q", "select * from orders", "no such table", None, Vec::new())
    }

    #[test]
    fn resolve_then_resolve_again_is_invalid_state() {
        let resolved = pending().resolve("select 1", None, None).unwrap();
        assert_eq!(resolved.status, FailedQueryStatus::Resolved);
        assert!(resolved.resolved_at.is_some());
        let err = resolved.clone().resolve("select 2", None, None).unwrap_err();
        assert!(matches!(err, AgentError::InvalidState(_)));
        let err = resolved.ignore(None).unwrap_err();
        assert!(matches!(err, AgentError::InvalidState(_)));
    }

    #[test]
    fn notes_survive_terminal_states() {
        let ignored = pending().ignore(Some("dup".to_string())).unwrap();
        let noted = ignored.with_notes(Some("checked again".to_string()));
        assert_eq!(noted.status, FailedQueryStatus::Ignored);
        assert_eq!(noted.notes.as_deref(), Some("checked again"));
    }

    #[test]
    fn status_filter_parsing() {
        assert_eq!("all".parse::<StatusFilter>().unwrap(), StatusFilter::All);
        assert_eq!(
            "Resolved".parse::<StatusFilter>().unwrap(),
            StatusFilter::Only(FailedQueryStatus::Resolved)
        );
        assert!("done".parse::<StatusFilter>().is_err());
    }

    #[test]
    fn list_filter_rejects_non_positive() {
        let bad_page = ListFilter { page: 0, ..ListFilter::default() };
        let bad_limit = ListFilter { limit: -1, ..ListFilter::default() };
        assert!(bad_page.validate().is_err());
        assert!(bad_limit.validate().is_err());
        assert_eq!(
            ListFilter { page: 3, limit: 10, status: StatusFilter::All }.offset().unwrap(),
            20
        );
    }

    #[test]
    fn far_pages_are_rejected_not_wrapped() {
        let far = ListFilter { page: i64::MAX, limit: 10, status: StatusFilter::All };
        assert!(matches!(far.offset(), Err(AgentError::InvalidArgument(_))));
        let wide = ListFilter { page: 3, limit: i64::MAX, status: StatusFilter::All };
        assert!(matches!(wide.offset(), Err(AgentError::InvalidArgument(_))));
        let first = ListFilter { page: 1, limit: i64::MAX, status: StatusFilter::All };
        assert_eq!(first.offset().unwrap(), 0);
    }

    #[test]
    fn total_pages_is_ceiling() {
        assert_eq!(Page::<()>::new(vec![], 0, 1, 10).total_pages, 0);
        assert_eq!(Page::<()>::new(vec![], 10, 1, 10).total_pages, 1);
        assert_eq!(Page::<()>::new(vec![], 11, 1, 10).total_pages, 2);
    }

    #[test]
    fn serializes_camel_case() {
        let json = serde_json::to_value(pending()).unwrap();
        assert_eq!(json["status"], "pending");
        assert!(json.get("originalQuery").is_some());
        assert!(json.get("failedSql").is_some());
    }
}
