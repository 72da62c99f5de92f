//! Failed-query persistence
//!
//! Architecture: SQLite, one row per record, indexed by `status` for the
//! filtered listing. Attempt history is stored as a JSON column since it is
//! only ever read back whole.

use crate::capabilities::FailedQueryRepository;
use crate::error::{AgentError, Result};
use crate::learning::failed_query::{FailedQuery, FailedQueryStatus, StatusFilter};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, ToSql};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use tracing::info;

const COLUMNS: &str = "id, original_query, failed_sql, error_message, error_code, attempts, \
                       status, created_at, updated_at, resolved_at, resolved_by, resolved_sql, notes";

const UPDATE_SET: &str = "UPDATE failed_queries SET original_query = ?2, failed_sql = ?3, \
                          error_message = ?4, error_code = ?5, attempts = ?6, status = ?7, \
                          created_at = ?8, updated_at = ?9, resolved_at = ?10, resolved_by = ?11, \
                          resolved_sql = ?12, notes = ?13";

#[derive(Clone, Copy)]
enum WriteMode {
    Insert,
    Update,
    UpdateIfStatus(FailedQueryStatus),
}

pub struct SqliteFailedQueryRepository {
    path: PathBuf,
    db: Mutex<Connection>,
}

/// Raw column values, converted outside of rusqlite's row closure.
struct RawRecord {
    id: String,
    original_query: String,
    failed_sql: String,
    error_message: String,
    error_code: Option<String>,
    attempts: String,
    status: String,
    created_at: String,
    updated_at: String,
    resolved_at: Option<String>,
    resolved_by: Option<String>,
    resolved_sql: Option<String>,
    notes: Option<String>,
}

impl RawRecord {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            original_query: row.get(1)?,
            failed_sql: row.get(2)?,
            error_message: row.get(3)?,
            error_code: row.get(4)?,
            attempts: row.get(5)?,
            status: row.get(6)?,
            created_at: row.get(7)?,
            updated_at: row.get(8)?,
            resolved_at: row.get(9)?,
            resolved_by: row.get(10)?,
            resolved_sql: row.get(11)?,
            notes: row.get(12)?,
        })
    }

    fn into_record(self) -> Result<FailedQuery> {
        Ok(FailedQuery {
            id: self.id,
            original_query: self.original_query,
            failed_sql: self.failed_sql,
            error_message: self.error_message,
            error_code: self.error_code,
            attempts: serde_json::from_str(&self.attempts)?,
            status: self.status.parse()?,
            created_at: parse_timestamp(&self.created_at)?,
            updated_at: parse_timestamp(&self.updated_at)?,
            resolved_at: self.resolved_at.as_deref().map(parse_timestamp).transpose()?,
            resolved_by: self.resolved_by,
            resolved_sql: self.resolved_sql,
            notes: self.notes,
        })
    }
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| AgentError::Storage(format!("Invalid timestamp '{}': {}", raw, e)))
}

impl SqliteFailedQueryRepository {
    /// Open (or create) `failed_queries.db` inside `dir`.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;
        let path = dir.join("failed_queries.db");
        let db = Connection::open(&path)
            .map_err(|e| AgentError::Storage(format!("Failed to open database: {}", e)))?;
        let repo = Self {
            path,
            db: Mutex::new(db),
        };
        repo.init_schema()?;
        info!("Failed-query repository at {}", repo.path.display());
        Ok(repo)
    }

    pub fn in_memory() -> Result<Self> {
        let db = Connection::open_in_memory()?;
        let repo = Self {
            path: PathBuf::from(":memory:"),
            db: Mutex::new(db),
        };
        repo.init_schema()?;
        Ok(repo)
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.db
            .lock()
            .map_err(|_| AgentError::Storage("Failed-query database lock poisoned".to_string()))
    }

    fn init_schema(&self) -> Result<()> {
        let db = self.conn()?;
        db.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS failed_queries (
                id TEXT PRIMARY KEY,
                original_query TEXT NOT NULL,
                failed_sql TEXT NOT NULL,
                error_message TEXT NOT NULL,
                error_code TEXT,
                attempts TEXT NOT NULL,
                status TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                resolved_at TEXT,
                resolved_by TEXT,
                resolved_sql TEXT,
                notes TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_failed_queries_status ON failed_queries(status);
            CREATE INDEX IF NOT EXISTS idx_failed_queries_created ON failed_queries(created_at);
            "#,
        )
        .map_err(|e| AgentError::Storage(format!("Failed to create schema: {}", e)))?;
        Ok(())
    }

    fn write(&self, record: &FailedQuery, mode: WriteMode) -> Result<usize> {
        let attempts = serde_json::to_string(&record.attempts)?;
        let sql = match mode {
            WriteMode::Insert => format!(
                "INSERT INTO failed_queries ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
                COLUMNS
            ),
            WriteMode::Update => format!("{} WHERE id = ?1", UPDATE_SET),
            WriteMode::UpdateIfStatus(_) => format!("{} WHERE id = ?1 AND status = ?14", UPDATE_SET),
        };
        let expected = match mode {
            WriteMode::UpdateIfStatus(status) => Some(status.as_str()),
            _ => None,
        };
        let status = record.status.as_str();
        let created_at = record.created_at.to_rfc3339();
        let updated_at = record.updated_at.to_rfc3339();
        let resolved_at = record.resolved_at.map(|t| t.to_rfc3339());
        let values: [&dyn ToSql; 14] = [
            &record.id,
            &record.original_query,
            &record.failed_sql,
            &record.error_message,
            &record.error_code,
            &attempts,
            &status,
            &created_at,
            &updated_at,
            &resolved_at,
            &record.resolved_by,
            &record.resolved_sql,
            &record.notes,
            &expected,
        ];
        let db = self.conn()?;
        // `?14` only appears in the conditional update.
        let bound = if expected.is_some() { &values[..] } else { &values[..13] };
        let changed = db.execute(&sql, bound)?;
        Ok(changed)
    }
}

#[async_trait]
impl FailedQueryRepository for SqliteFailedQueryRepository {
    async fn save(&self, record: &FailedQuery) -> Result<()> {
        self.write(record, WriteMode::Insert)?;
        Ok(())
    }

    async fn find(&self, id: &str) -> Result<Option<FailedQuery>> {
        let raw = {
            let db = self.conn()?;
            db.query_row(
                &format!("SELECT {} FROM failed_queries WHERE id = ?1", COLUMNS),
                params![id],
                RawRecord::from_row,
            )
            .optional()?
        };
        raw.map(RawRecord::into_record).transpose()
    }

    async fn update(&self, record: &FailedQuery) -> Result<()> {
        if self.write(record, WriteMode::Update)? == 0 {
            return Err(AgentError::NotFound(format!("Failed query {}", record.id)));
        }
        Ok(())
    }

    async fn update_if_status(
        &self,
        record: &FailedQuery,
        expected: FailedQueryStatus,
    ) -> Result<bool> {
        Ok(self.write(record, WriteMode::UpdateIfStatus(expected))? > 0)
    }

    async fn list(
        &self,
        status: StatusFilter,
        offset: usize,
        limit: usize,
    ) -> Result<(Vec<FailedQuery>, usize)> {
        let status_param: Option<&'static str> = match status {
            StatusFilter::All => None,
            StatusFilter::Only(s) => Some(s.as_str()),
        };

        let (raws, total) = {
            let db = self.conn()?;
            let total: i64 = db.query_row(
                "SELECT COUNT(*) FROM failed_queries WHERE ?1 IS NULL OR status = ?1",
                params![status_param],
                |row| row.get(0),
            )?;
            let mut stmt = db.prepare(&format!(
                "SELECT {} FROM failed_queries WHERE ?1 IS NULL OR status = ?1 \
                 ORDER BY created_at DESC, id ASC LIMIT ?2 OFFSET ?3",
                COLUMNS
            ))?;
            let raws = stmt
                .query_map(
                    params![status_param, limit as i64, offset as i64],
                    RawRecord::from_row,
                )?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            (raws, total as usize)
        };

        let records = raws
            .into_iter()
            .map(RawRecord::into_record)
            .collect::<Result<Vec<_>>>()?;
        Ok((records, total))
    }

    async fn delete(&self, id: &str) -> Result<bool> {
        let db = self.conn()?;
        let removed = db.execute("DELETE FROM failed_queries WHERE id = ?1", params![id])?;
        Ok(removed > 0)
    }
}

/// Process-local repository, used by tests and throwaway runs.
#[derive(Default)]
pub struct InMemoryFailedQueryRepository {
    records: Mutex<HashMap<String, FailedQuery>>,
}

impl InMemoryFailedQueryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    fn records(&self) -> Result<MutexGuard<'_, HashMap<String, FailedQuery>>> {
        self.records
            .lock()
            .map_err(|_| AgentError::Storage("Failed-query map lock poisoned".to_string()))
    }

    pub fn count_with_status(&self, status: FailedQueryStatus) -> usize {
        self.records()
            .map(|r| r.values().filter(|q| q.status == status).count())
            .unwrap_or(0)
    }
}

#[async_trait]
impl FailedQueryRepository for InMemoryFailedQueryRepository {
    async fn save(&self, record: &FailedQuery) -> Result<()> {
        let mut records = self.records()?;
        if records.contains_key(&record.id) {
            return Err(AgentError::Storage(format!("Duplicate failed query id {}", record.id)));
        }
        records.insert(record.id.clone(), record.clone());
        Ok(())
    }

    async fn find(&self, id: &str) -> Result<Option<FailedQuery>> {
        Ok(self.records()?.get(id).cloned())
    }

    async fn update(&self, record: &FailedQuery) -> Result<()> {
        let mut records = self.records()?;
        match records.get_mut(&record.id) {
            Some(existing) => {
                *existing = record.clone();
                Ok(())
            }
            None => Err(AgentError::NotFound(format!("Failed query {}", record.id))),
        }
    }

    async fn update_if_status(
        &self,
        record: &FailedQuery,
        expected: FailedQueryStatus,
    ) -> Result<bool> {
        let mut records = self.records()?;
        match records.get_mut(&record.id) {
            Some(existing) if existing.status == expected => {
                *existing = record.clone();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn list(
        &self,
        status: StatusFilter,
        offset: usize,
        limit: usize,
    ) -> Result<(Vec<FailedQuery>, usize)> {
        let records = self.records()?;
        let mut matching: Vec<FailedQuery> = records
            .values()
            .filter(|q| status.matches(q.status))
            .cloned()
            .collect();
        matching.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(a.id.cmp(&b.id)));
        let total = matching.len();
        let page = matching.into_iter().skip(offset).take(limit).collect();
        Ok((page, total))
    }

    async fn delete(&self, id: &str) -> Result<bool> {
        Ok(self.records()?.remove(id).is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::learning::failed_query::FailedQueryAttempt;
    use tempfile::TempDir;

    fn record(query: &str) -> FailedQuery {
        FailedQuery::pending(
            query,
            "select * from orders",
            "Table 'shop.orders' doesn't exist",
            Some("ER_NO_SUCH_TABLE".to_string()),
            vec![FailedQueryAttempt {
                attempt_number: 1,
                corrected_sql: "select * from orders".to_string(),
                error_message: "Table 'shop.orders' doesn't exist".to_string(),
                timestamp: Utc::now(),
            }],
        )
    }

    #[tokio::test]
    async fn sqlite_save_find_update() {
        let temp_dir = TempDir::new().unwrap();
        let repo = SqliteFailedQueryRepository::open(temp_dir.path()).unwrap();

        let original = record("monthly revenue");
        repo.save(&original).await.unwrap();

        let found = repo.find(&original.id).await.unwrap().unwrap();
        assert_eq!(found.original_query, "monthly revenue");
        assert_eq!(found.attempts.len(), 1);
        assert_eq!(found.error_code.as_deref(), Some("ER_NO_SUCH_TABLE"));

        let resolved = found.resolve("select * from orders_tbl", Some("admin".to_string()), None).unwrap();
        repo.update(&resolved).await.unwrap();
        let reloaded = repo.find(&original.id).await.unwrap().unwrap();
        assert_eq!(reloaded.status, FailedQueryStatus::Resolved);
        assert_eq!(reloaded.resolved_by.as_deref(), Some("admin"));
        assert!(repo.find("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn sqlite_list_filters_and_paginates() {
        let repo = SqliteFailedQueryRepository::in_memory().unwrap();
        for i in 0..5 {
            repo.save(&record(&format!("q{}", i))).await.unwrap();
        }
        let ignored = record("ignored one").ignore(None).unwrap();
        repo.save(&ignored).await.unwrap();

        let (page, total) = repo.list(StatusFilter::All, 0, 4).await.unwrap();
        assert_eq!(total, 6);
        assert_eq!(page.len(), 4);

        let (page, total) = repo
            .list(StatusFilter::Only(FailedQueryStatus::Ignored), 0, 10)
            .await
            .unwrap();
        assert_eq!(total, 1);
        assert_eq!(page[0].original_query, "ignored one");

        assert!(repo.delete(&ignored.id).await.unwrap());
        assert!(!repo.delete(&ignored.id).await.unwrap());
    }

    async fn second_transition_loses(repo: &dyn FailedQueryRepository) {
        let original = record("weekly orders");
        repo.save(&original).await.unwrap();

        let resolved = original.clone().resolve("select 1", None, None).unwrap();
        let ignored = original.ignore(None).unwrap();
        assert!(repo
            .update_if_status(&resolved, FailedQueryStatus::Pending)
            .await
            .unwrap());
        assert!(!repo
            .update_if_status(&ignored, FailedQueryStatus::Pending)
            .await
            .unwrap());

        let stored = repo.find(&resolved.id).await.unwrap().unwrap();
        assert_eq!(stored.status, FailedQueryStatus::Resolved);
        assert!(!repo
            .update_if_status(&record("never saved"), FailedQueryStatus::Pending)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn conditional_update_only_leaves_pending_once() {
        second_transition_loses(&SqliteFailedQueryRepository::in_memory().unwrap()).await;
        second_transition_loses(&InMemoryFailedQueryRepository::new()).await;
    }

    #[tokio::test]
    async fn update_of_unknown_record_is_not_found() {
        let repo = InMemoryFailedQueryRepository::new();
        let err = repo.update(&record("ghost")).await.unwrap_err();
        assert!(matches!(err, AgentError::NotFound(_)));
    }
}
