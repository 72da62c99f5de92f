use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AgentError {
    #[error("Security violation: {0}")]
    SecurityViolation(String),

    /// The store rejected a well-formed SELECT. Code and message are kept verbatim.
    #[error("Execution error{}: {message}", code.as_ref().map(|c| format!(" ({})", c)).unwrap_or_default())]
    Execution {
        code: Option<String>,
        message: String,
    },

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("{capability} timed out after {timeout_ms}ms")]
    CapabilityTimeout {
        capability: String,
        timeout_ms: u64,
    },

    #[error("LLM error: {0}")]
    Llm(String),

    #[error("Embedding error: {0}")]
    Embedding(String),

    #[error("Vector store error: {0}")]
    VectorStore(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<rusqlite::Error> for AgentError {
    fn from(err: rusqlite::Error) -> Self {
        AgentError::Storage(err.to_string())
    }
}

/// Stable taxonomy tag, used in observations and serialized responses.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    SecurityViolation,
    ExecutionError,
    StorageError,
    InvalidState,
    NotFound,
    InvalidArgument,
    CapabilityTimeout,
    CapabilityFailure,
}

impl AgentError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            AgentError::SecurityViolation(_) => ErrorKind::SecurityViolation,
            AgentError::Execution { .. } => ErrorKind::ExecutionError,
            AgentError::Storage(_) | AgentError::Io(_) => ErrorKind::StorageError,
            AgentError::InvalidState(_) => ErrorKind::InvalidState,
            AgentError::NotFound(_) => ErrorKind::NotFound,
            AgentError::InvalidArgument(_) => ErrorKind::InvalidArgument,
            AgentError::CapabilityTimeout { .. } => ErrorKind::CapabilityTimeout,
            AgentError::Llm(_)
            | AgentError::Embedding(_)
            | AgentError::VectorStore(_)
            | AgentError::Json(_) => ErrorKind::CapabilityFailure,
        }
    }

    pub fn is_security_violation(&self) -> bool {
        matches!(self, AgentError::SecurityViolation(_))
    }
}

pub type Result<T> = std::result::Result<T, AgentError>;
