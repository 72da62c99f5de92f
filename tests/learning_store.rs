//! Failed-query lifecycle and learned-example memory.

mod common;

use async_trait::async_trait;
use common::{harness, Harness, LetterEmbedder, ScriptedGeneration, ScriptedStore};
use serde_json::json;
use sql_insight_agent::capabilities::{FailedQueryRepository, VectorStore};
use sql_insight_agent::learning::{
    ExampleMemory, FailedQuery, FailedQueryStatus, InMemoryFailedQueryRepository, LearnOutcome,
    ListFilter, QueryLearningStore, StatusFilter,
};
use sql_insight_agent::tools::SqlExecutionTool;
use sql_insight_agent::vector_store::InMemoryVectorStore;
use sql_insight_agent::{ErrorKind, Result};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

const FIXED_SQL: &str = "SELECT store_id, SUM(amount) AS revenue FROM orders_tbl GROUP BY store_id";

async fn pending(h: &Harness, question: &str) -> String {
    let record = FailedQuery::pending(
        question,
        "SELECT store_id, SUM(amount) FROM orders GROUP BY store_id",
        "Table 'sales.orders' doesn't exist",
        Some("ER_NO_SUCH_TABLE".to_string()),
        Vec::new(),
    );
    h.service.failed_queries().record_failure(&record).await.unwrap()
}

fn with_fixed_sql(h: &Harness) {
    h.store
        .rows(FIXED_SQL, json!([{ "store_id": 1, "revenue": 1200.5 }]));
}

#[tokio::test]
async fn resolve_learns_and_closes_the_record() {
    let h = harness();
    with_fixed_sql(&h);
    let id = pending(&h, "revenue per store").await;
    let store = h.service.failed_queries();

    let resolved = store
        .resolve(&id, FIXED_SQL, Some("analyst".to_string()), Some("table renamed".to_string()))
        .await
        .unwrap();

    assert_eq!(resolved.status, FailedQueryStatus::Resolved);
    assert_eq!(resolved.resolved_sql.as_deref(), Some(FIXED_SQL));
    assert_eq!(resolved.resolved_by.as_deref(), Some("analyst"));
    assert!(resolved.resolved_at.is_some());
    assert_eq!(store.get(&id).await.unwrap().status, FailedQueryStatus::Resolved);

    let examples = store.examples().retrieve("revenue per store", 1).await.unwrap();
    assert_eq!(examples.len(), 1);
    assert_eq!(examples[0].corrected_sql, FIXED_SQL);
    assert_eq!(
        examples[0].description.as_deref(),
        Some("Answers: revenue per store")
    );
}

#[tokio::test]
async fn only_pending_records_transition() {
    let h = harness();
    with_fixed_sql(&h);
    let id = pending(&h, "revenue per store").await;
    let store = h.service.failed_queries();

    store.resolve(&id, FIXED_SQL, None, None).await.unwrap();

    let again = store.resolve(&id, FIXED_SQL, None, None).await.unwrap_err();
    assert_eq!(again.kind(), ErrorKind::InvalidState);
    let ignore = store.ignore(&id, None).await.unwrap_err();
    assert_eq!(ignore.kind(), ErrorKind::InvalidState);
    assert_eq!(h.examples.len().await.unwrap(), 1);

    let other = pending(&h, "orders per region").await;
    store.ignore(&other, Some("not our data".to_string())).await.unwrap();
    let err = store.resolve(&other, FIXED_SQL, None, None).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidState);
}

#[tokio::test]
async fn resolution_sql_must_run_cleanly() {
    let h = harness();
    let id = pending(&h, "revenue per store").await;
    let store = h.service.failed_queries();

    let err = store
        .resolve(&id, "DROP TABLE orders_tbl", None, None)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::SecurityViolation);

    let err = store
        .resolve(&id, "SELECT revenue FROM nowhere", None, None)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ExecutionError);

    assert_eq!(store.get(&id).await.unwrap().status, FailedQueryStatus::Pending);
    assert_eq!(h.examples.len().await.unwrap(), 0);
}

#[tokio::test]
async fn unknown_ids_are_not_found() {
    let h = harness();
    let store = h.service.failed_queries();
    let id = "3f1f7a4e-0000-0000-0000-000000000000";

    assert_eq!(store.get(id).await.unwrap_err().kind(), ErrorKind::NotFound);
    assert_eq!(
        store.resolve(id, FIXED_SQL, None, None).await.unwrap_err().kind(),
        ErrorKind::NotFound
    );
    assert_eq!(store.ignore(id, None).await.unwrap_err().kind(), ErrorKind::NotFound);
    assert_eq!(
        store.update_notes(id, None).await.unwrap_err().kind(),
        ErrorKind::NotFound
    );
    assert_eq!(store.delete(id).await.unwrap_err().kind(), ErrorKind::NotFound);
}

#[tokio::test]
async fn notes_change_in_any_status_and_delete_removes() {
    let h = harness();
    let id = pending(&h, "revenue per store").await;
    let store = h.service.failed_queries();

    store.ignore(&id, Some("duplicate ticket".to_string())).await.unwrap();
    let updated = store
        .update_notes(&id, Some("duplicate of the March ticket".to_string()))
        .await
        .unwrap();
    assert_eq!(updated.status, FailedQueryStatus::Ignored);
    assert_eq!(updated.notes.as_deref(), Some("duplicate of the March ticket"));

    let cleared = store.update_notes(&id, None).await.unwrap();
    assert!(cleared.notes.is_none());

    store.delete(&id).await.unwrap();
    assert_eq!(store.get(&id).await.unwrap_err().kind(), ErrorKind::NotFound);
}

#[tokio::test]
async fn list_pages_and_filters() {
    let h = harness();
    let store = h.service.failed_queries();
    let mut ids = Vec::new();
    for i in 0..12 {
        ids.push(pending(&h, &format!("question number {}", i)).await);
    }
    store.ignore(&ids[0], None).await.unwrap();
    store.ignore(&ids[1], None).await.unwrap();

    let page = store
        .list(ListFilter {
            status: StatusFilter::All,
            page: 3,
            limit: 5,
        })
        .await
        .unwrap();
    assert_eq!(page.total, 12);
    assert_eq!(page.total_pages, 3);
    assert_eq!(page.data.len(), 2);

    let pending_page = store
        .list(ListFilter {
            status: StatusFilter::Only(FailedQueryStatus::Pending),
            page: 1,
            limit: 20,
        })
        .await
        .unwrap();
    assert_eq!(pending_page.total, 10);
    assert!(pending_page
        .data
        .iter()
        .all(|r| r.status == FailedQueryStatus::Pending));

    let beyond = store
        .list(ListFilter {
            status: StatusFilter::All,
            page: 9,
            limit: 5,
        })
        .await
        .unwrap();
    assert!(beyond.data.is_empty());
    assert_eq!(beyond.total, 12);
}

#[tokio::test]
async fn non_positive_page_or_limit_is_rejected() {
    let h = harness();
    let store = h.service.failed_queries();
    for (page, limit) in [(0, 10), (1, 0), (-1, 10), (1, -5)] {
        let err = store
            .list(ListFilter {
                status: StatusFilter::All,
                page,
                limit,
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    }
}

#[tokio::test]
async fn out_of_range_pages_are_rejected() {
    let h = harness();
    let store = h.service.failed_queries();
    pending(&h, "revenue per store").await;

    let err = store
        .list(ListFilter {
            status: StatusFilter::All,
            page: i64::MAX,
            limit: 10,
        })
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);

    let everything = store
        .list(ListFilter {
            status: StatusFilter::All,
            page: 1,
            limit: i64::MAX,
        })
        .await
        .unwrap();
    assert_eq!(everything.data.len(), 1);
    assert_eq!(everything.total_pages, 1);
}

#[tokio::test]
async fn equivalent_pairs_are_stored_once() {
    let h = harness();
    let store = h.service.failed_queries();

    let first = store.learn_verified("revenue per store", FIXED_SQL).await.unwrap();
    assert!(first.is_stored());

    let reformatted = format!("  {};", FIXED_SQL.to_lowercase());
    let second = store
        .learn_verified("revenue per store", &reformatted)
        .await
        .unwrap();
    assert!(matches!(second, LearnOutcome::Duplicate(_)));
    assert_eq!(h.examples.len().await.unwrap(), 1);
    assert_eq!(
        store
            .find_duplicates("revenue per store", FIXED_SQL)
            .await
            .unwrap()
            .len(),
        1
    );

    // Same question, different SQL is a new example.
    let third = store
        .learn_verified("revenue per store", "SELECT SUM(amount) FROM orders_tbl")
        .await
        .unwrap();
    assert!(third.is_stored());
    assert_eq!(h.examples.len().await.unwrap(), 2);
}

/// Serves the first copy it read of each record, like a second process that
/// loaded the record before another one closed it.
struct StaleReads {
    inner: InMemoryFailedQueryRepository,
    seen: Mutex<HashMap<String, FailedQuery>>,
}

#[async_trait]
impl FailedQueryRepository for StaleReads {
    async fn save(&self, record: &FailedQuery) -> Result<()> {
        self.inner.save(record).await
    }

    async fn find(&self, id: &str) -> Result<Option<FailedQuery>> {
        if let Some(record) = self.seen.lock().unwrap().get(id) {
            return Ok(Some(record.clone()));
        }
        let found = self.inner.find(id).await?;
        if let Some(record) = &found {
            self.seen.lock().unwrap().insert(id.to_string(), record.clone());
        }
        Ok(found)
    }

    async fn update(&self, record: &FailedQuery) -> Result<()> {
        self.inner.update(record).await
    }

    async fn update_if_status(
        &self,
        record: &FailedQuery,
        expected: FailedQueryStatus,
    ) -> Result<bool> {
        self.inner.update_if_status(record, expected).await
    }

    async fn list(
        &self,
        status: StatusFilter,
        offset: usize,
        limit: usize,
    ) -> Result<(Vec<FailedQuery>, usize)> {
        self.inner.list(status, offset, limit).await
    }

    async fn delete(&self, id: &str) -> Result<bool> {
        self.inner.delete(id).await
    }
}

#[tokio::test]
async fn a_record_closed_meanwhile_is_not_closed_twice() {
    let timeout = Duration::from_secs(5);
    let store = ScriptedStore::new();
    store.rows(FIXED_SQL, json!([{ "store_id": 1, "revenue": 1200.5 }]));
    let repository = Arc::new(StaleReads {
        inner: InMemoryFailedQueryRepository::new(),
        seen: Mutex::new(HashMap::new()),
    });
    let learning = QueryLearningStore::new(
        repository.clone(),
        Arc::new(ExampleMemory::new(
            Arc::new(LetterEmbedder),
            Arc::new(InMemoryVectorStore::new()),
            timeout,
            0.95,
        )),
        Arc::new(SqlExecutionTool::new(store, timeout)),
        ScriptedGeneration::new(),
        timeout,
    );

    let record = FailedQuery::pending(
        "revenue per store",
        "SELECT store_id, SUM(amount) FROM orders GROUP BY store_id",
        "Table 'sales.orders' doesn't exist",
        None,
        Vec::new(),
    );
    let id = learning.record_failure(&record).await.unwrap();

    learning
        .ignore(&id, Some("closed elsewhere".to_string()))
        .await
        .unwrap();
    // The stale copy still says pending, so only the write can catch it.
    let err = learning
        .resolve(&id, FIXED_SQL, Some("analyst".to_string()), None)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidState);

    let stored = repository.inner.find(&id).await.unwrap().unwrap();
    assert_eq!(stored.status, FailedQueryStatus::Ignored);
    assert!(stored.resolved_sql.is_none());

    let err = learning.ignore(&id, None).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidState);
}
