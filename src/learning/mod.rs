//! Failed-query learning: records, persistence, learned examples and the
//! store that ties them together.

pub mod examples;
pub mod failed_query;
pub mod repository;
pub mod store;

pub use examples::{format_for_prompt, ExampleMatch, ExampleMemory, LearnOutcome, LearnedExample};
pub use failed_query::{
    FailedQuery, FailedQueryAttempt, FailedQueryStatus, ListFilter, Page, StatusFilter,
};
pub use repository::{InMemoryFailedQueryRepository, SqliteFailedQueryRepository};
pub use store::QueryLearningStore;
