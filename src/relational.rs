//! SQLite relational store
//!
//! Statements run on the blocking pool so a capability timeout can fire while
//! SQLite is still working. Store rejections keep SQLite's message verbatim
//! and gain a short code derived from it.

use crate::capabilities::{QueryRows, RelationalStore, Row};
use crate::error::{AgentError, Result};
use async_trait::async_trait;
use rusqlite::types::ValueRef;
use rusqlite::{Connection, OpenFlags};
use serde_json::Value;
use std::path::Path;
use std::sync::{Arc, Mutex};

pub struct SqliteRelationalStore {
    db: Arc<Mutex<Connection>>,
}

impl SqliteRelationalStore {
    /// Open an existing database read-only.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let db = Connection::open_with_flags(
            path.as_ref(),
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .map_err(|e| {
            AgentError::Storage(format!(
                "Failed to open database {}: {}",
                path.as_ref().display(),
                e
            ))
        })?;
        Ok(Self::from_connection(db))
    }

    pub fn from_connection(db: Connection) -> Self {
        Self {
            db: Arc::new(Mutex::new(db)),
        }
    }
}

/// Short, stable code for a SQLite failure, keyed on the message the way
/// operators read it.
pub fn classify_error(err: &rusqlite::Error) -> Option<String> {
    let message = err.to_string().to_lowercase();
    let code = if message.contains("no such table") {
        "NO_SUCH_TABLE".to_string()
    } else if message.contains("no such column") {
        "NO_SUCH_COLUMN".to_string()
    } else if message.contains("ambiguous column") {
        "AMBIGUOUS_COLUMN".to_string()
    } else if message.contains("syntax error") || message.contains("incomplete input") {
        "SYNTAX_ERROR".to_string()
    } else if message.contains("misuse of aggregate") {
        "MISUSE_OF_AGGREGATE".to_string()
    } else if let Some(code) = err.sqlite_error_code() {
        format!("SQLITE_{:?}", code).to_uppercase()
    } else {
        return None;
    };
    Some(code)
}

fn to_json(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::from(i),
        ValueRef::Real(f) => serde_json::Number::from_f64(f)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        ValueRef::Text(t) => Value::String(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(b) => Value::String(format!("<{} bytes>", b.len())),
    }
}

fn run_query(db: &Connection, sql: &str) -> std::result::Result<QueryRows, rusqlite::Error> {
    let mut stmt = db.prepare(sql)?;
    let columns: Vec<String> = stmt.column_names().iter().map(|c| c.to_string()).collect();
    let mut rows = stmt.query([])?;
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        let mut record = Row::new();
        for (idx, name) in columns.iter().enumerate() {
            record.insert(name.clone(), to_json(row.get_ref(idx)?));
        }
        out.push(record);
    }
    Ok(QueryRows { columns, rows: out })
}

#[async_trait]
impl RelationalStore for SqliteRelationalStore {
    async fn query(&self, sql: &str) -> Result<QueryRows> {
        let db = self.db.clone();
        let sql = sql.to_string();
        tokio::task::spawn_blocking(move || {
            let db = db
                .lock()
                .map_err(|_| AgentError::Storage("Relational store lock poisoned".to_string()))?;
            run_query(&db, &sql).map_err(|e| AgentError::Execution {
                code: classify_error(&e),
                message: e.to_string(),
            })
        })
        .await
        .map_err(|e| AgentError::Storage(format!("Query task failed: {}", e)))?
    }
}
