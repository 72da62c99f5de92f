//! Embeddings client
//!
//! OpenAI-compatible `/embeddings` endpoint behind `EmbeddingProvider`.

use crate::capabilities::EmbeddingProvider;
use crate::config::AgentConfig;
use crate::error::{AgentError, Result};
use async_trait::async_trait;
use serde_json::Value;

pub struct OpenAiEmbedder {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    model: String, // e.g., "text-embedding-3-small"
}

impl OpenAiEmbedder {
    pub fn new(api_key: String, base_url: String, model: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key,
            base_url: base_url.trim_end_matches('/').to_string(),
            model,
        }
    }

    pub fn from_config(config: &AgentConfig) -> Result<Self> {
        let api_key = config
            .api_key
            .clone()
            .ok_or_else(|| AgentError::InvalidArgument("OPENAI_API_KEY is not set".to_string()))?;
        Ok(Self::new(api_key, config.base_url.clone(), config.embedding_model.clone()))
    }
}

/// Pull the first vector out of an `/embeddings` response body.
fn parse_embedding(response_json: &Value) -> Result<Vec<f32>> {
    let data = response_json
        .get("data")
        .and_then(|d| d.as_array())
        .and_then(|arr| arr.first())
        .ok_or_else(|| AgentError::Embedding("No embedding data in response".to_string()))?;

    let embedding: Vec<f32> = data
        .get("embedding")
        .and_then(|e| e.as_array())
        .ok_or_else(|| AgentError::Embedding("No embedding vector in response".to_string()))?
        .iter()
        .filter_map(|v| v.as_f64().map(|f| f as f32))
        .collect();

    if embedding.is_empty() {
        return Err(AgentError::Embedding("Empty embedding vector".to_string()));
    }
    Ok(embedding)
}

#[async_trait]
impl EmbeddingProvider for OpenAiEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let body = serde_json::json!({
            "model": self.model,
            "input": text,
        });

        let response = self
            .client
            .post(format!("{}/embeddings", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| AgentError::Embedding(format!("Embedding API call failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(AgentError::Embedding(format!(
                "Embedding API error ({}): {}",
                status, error_text
            )));
        }

        let response_json: Value = response
            .json()
            .await
            .map_err(|e| AgentError::Embedding(format!("Failed to parse embedding response: {}", e)))?;

        parse_embedding(&response_json)
    }
}
