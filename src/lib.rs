pub mod agent;
pub mod capabilities;
pub mod clarification;
pub mod config;
pub mod correction;
pub mod embedding;
pub mod error;
pub mod indexing;
pub mod learning;
pub mod llm;
pub mod relational;
pub mod service;
pub mod tools;
pub mod vector_store;

pub use agent::{CancelFlag, QueryOptions, QueryResolution};
pub use config::AgentConfig;
pub use error::{AgentError, ErrorKind, Result};
pub use service::{Capabilities, InsightService};
