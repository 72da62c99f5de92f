//! Agent configuration
//!
//! Read from the process environment (optionally seeded from a `.env` file by
//! the binary). Every knob has a default so tests can use `AgentConfig::default()`.

use crate::error::{AgentError, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    pub api_key: Option<String>,
    pub model: String,
    pub base_url: String,
    pub embedding_model: String,
    pub database_path: PathBuf,
    pub learning_path: PathBuf,
    pub max_correction_attempts: u32,
    pub max_agent_steps: u32,
    pub capability_timeout_secs: u64,
    pub search_top_k: usize,
    pub search_min_score: f32,
    pub dedup_similarity: f32,
    pub rag_top_k: usize,
    pub auto_apply_defaults: bool,
    /// Learn from SQL that succeeded on its first execution too.
    pub learn_first_try_successes: bool,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            model: "gpt-4o-mini".to_string(),
            base_url: "https://api.openai.com/v1".to_string(),
            embedding_model: "text-embedding-3-small".to_string(),
            database_path: PathBuf::from("data/sales.db"),
            learning_path: PathBuf::from("data/learning"),
            max_correction_attempts: 5,
            max_agent_steps: 6,
            capability_timeout_secs: 30,
            search_top_k: 10,
            search_min_score: 0.3,
            dedup_similarity: 0.95,
            rag_top_k: 5,
            auto_apply_defaults: false,
            learn_first_try_successes: false,
        }
    }
}

impl AgentConfig {
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();
        let config = Self {
            api_key: std::env::var("OPENAI_API_KEY").ok().filter(|k| !k.is_empty()),
            model: std::env::var("OPENAI_MODEL").unwrap_or(defaults.model),
            base_url: std::env::var("OPENAI_BASE_URL").unwrap_or(defaults.base_url),
            embedding_model: std::env::var("OPENAI_EMBEDDING_MODEL")
                .unwrap_or(defaults.embedding_model),
            database_path: std::env::var("INSIGHT_DATABASE_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.database_path),
            learning_path: std::env::var("INSIGHT_LEARNING_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.learning_path),
            max_correction_attempts: env_or(
                "INSIGHT_MAX_CORRECTION_ATTEMPTS",
                defaults.max_correction_attempts,
            )?,
            max_agent_steps: env_or("INSIGHT_MAX_AGENT_STEPS", defaults.max_agent_steps)?,
            capability_timeout_secs: env_or(
                "INSIGHT_CAPABILITY_TIMEOUT_SECS",
                defaults.capability_timeout_secs,
            )?,
            search_top_k: env_or("INSIGHT_SEARCH_TOP_K", defaults.search_top_k)?,
            search_min_score: env_or("INSIGHT_SEARCH_MIN_SCORE", defaults.search_min_score)?,
            dedup_similarity: env_or("INSIGHT_DEDUP_SIMILARITY", defaults.dedup_similarity)?,
            rag_top_k: env_or("INSIGHT_RAG_TOP_K", defaults.rag_top_k)?,
            auto_apply_defaults: env_or(
                "INSIGHT_AUTO_APPLY_DEFAULTS",
                defaults.auto_apply_defaults,
            )?,
            learn_first_try_successes: env_or(
                "INSIGHT_LEARN_FIRST_TRY_SUCCESSES",
                defaults.learn_first_try_successes,
            )?,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_correction_attempts == 0 {
            return Err(AgentError::InvalidArgument(
                "max_correction_attempts must be positive".to_string(),
            ));
        }
        if self.max_agent_steps == 0 {
            return Err(AgentError::InvalidArgument(
                "max_agent_steps must be positive".to_string(),
            ));
        }
        if self.search_top_k == 0 {
            return Err(AgentError::InvalidArgument(
                "search_top_k must be positive".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.dedup_similarity) {
            return Err(AgentError::InvalidArgument(format!(
                "dedup_similarity must be within [0, 1], got {}",
                self.dedup_similarity
            )));
        }
        Ok(())
    }

    pub fn capability_timeout(&self) -> Duration {
        Duration::from_secs(self.capability_timeout_secs)
    }
}

fn env_or<T: FromStr>(key: &str, default: T) -> Result<T> {
    match std::env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => raw.trim().parse::<T>().map_err(|_| {
            AgentError::InvalidArgument(format!("{} has an invalid value: '{}'", key, raw))
        }),
        _ => Ok(default),
    }
}
