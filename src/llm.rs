use crate::agent::contracts::{AgentAction, Observation};
use crate::agent::decision::parse_decision;
use crate::agent::synthesis::{parse_synthesis, SynthesizedAnswer};
use crate::capabilities::{CorrectionRequest, GenerationCapability, SqlGenerationContext};
use crate::clarification::ClarificationSection;
use crate::config::AgentConfig;
use crate::error::{AgentError, Result};
use crate::learning::format_for_prompt;
use crate::tools::tool_catalogue;
use async_trait::async_trait;
use lazy_static::lazy_static;
use regex::Regex;
use tracing::{debug, warn};

lazy_static! {
    static ref CODE_FENCE: Regex = Regex::new(r"(?s)^\s*```[a-zA-Z]*\s*(.*?)\s*```\s*$").unwrap();
}

/// Observation payloads are cut to this many characters inside prompts.
const OBSERVATION_PROMPT_CHARS: usize = 2000;

const DEFAULT_SCHEMA: &str = "- products (id, name, description, category, market, price, created_at)
- sales (id, product_id, store_id, quantity, total_amount, sale_date)
- stores (id, name, location, created_at)";

/// Strip a surrounding markdown code fence, if any.
pub fn clean_response(response: &str) -> String {
    match CODE_FENCE.captures(response) {
        Some(caps) => caps.get(1).map(|m| m.as_str().trim().to_string()).unwrap_or_default(),
        None => response.trim().to_string(),
    }
}

fn render_observations(observations: &[Observation]) -> String {
    if observations.is_empty() {
        return "(none yet)".to_string();
    }
    observations
        .iter()
        .map(|o| {
            let mut payload = o.payload.to_string();
            if payload.len() > OBSERVATION_PROMPT_CHARS {
                let cut = (0..=OBSERVATION_PROMPT_CHARS)
                    .rev()
                    .find(|i| payload.is_char_boundary(*i))
                    .unwrap_or(0);
                payload.truncate(cut);
                payload.push_str("...");
            }
            format!(
                "Step {} [{}] input: {}\n{} {}",
                o.step,
                o.tool,
                o.input,
                if o.success { "OK" } else { "FAILED" },
                payload
            )
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

#[derive(Clone)]
pub struct LlmClient {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    model: String,
    schema: String,
}

impl LlmClient {
    pub fn new(api_key: String, model: String, base_url: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key,
            base_url: base_url.trim_end_matches('/').to_string(),
            model,
            schema: DEFAULT_SCHEMA.to_string(),
        }
    }

    pub fn from_config(config: &AgentConfig) -> Result<Self> {
        let api_key = config
            .api_key
            .clone()
            .ok_or_else(|| AgentError::InvalidArgument("OPENAI_API_KEY is not set".to_string()))?;
        Ok(Self::new(api_key, config.model.clone(), config.base_url.clone()))
    }

    /// Replace the schema summary used in SQL prompts.
    pub fn with_schema(mut self, schema: impl Into<String>) -> Self {
        let schema = schema.into();
        if !schema.trim().is_empty() {
            self.schema = schema;
        }
        self
    }

    pub async fn call_llm(&self, system: &str, prompt: &str, max_tokens: u32) -> Result<String> {
        let mut body = serde_json::json!({
            "model": self.model,
            "messages": [
                {"role": "system", "content": system},
                {"role": "user", "content": prompt}
            ],
            "temperature": 0.1,
        });

        // Reasoning models only accept max_completion_tokens
        if self.model.starts_with("gpt-5") || self.model.starts_with("o1") || self.model.starts_with("o3") {
            body["max_completion_tokens"] = serde_json::json!(max_tokens * 4);
        } else {
            body["max_tokens"] = serde_json::json!(max_tokens);
        }

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| AgentError::Llm(format!("LLM API call failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(AgentError::Llm(format!("LLM API error ({}): {}", status, error_text)));
        }

        let response_json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| AgentError::Llm(format!("Failed to parse LLM response: {}", e)))?;

        if let Some(error) = response_json.get("error") {
            return Err(AgentError::Llm(format!("LLM API error: {}", error)));
        }

        let choice = response_json
            .get("choices")
            .and_then(|c| c.as_array())
            .and_then(|c| c.first())
            .ok_or_else(|| AgentError::Llm("Empty choices array in LLM response".to_string()))?;

        match choice.get("finish_reason").and_then(|r| r.as_str()) {
            Some("length") => warn!("LLM response was truncated due to length limit"),
            Some("content_filter") => {
                return Err(AgentError::Llm("LLM response was filtered by content policy".to_string()))
            }
            _ => {}
        }

        let content = choice["message"]["content"]
            .as_str()
            .ok_or_else(|| AgentError::Llm("No content in LLM response".to_string()))?;
        if content.trim().is_empty() {
            return Err(AgentError::Llm("Empty content in LLM response".to_string()));
        }
        debug!("LLM returned {} chars", content.len());
        Ok(content.to_string())
    }

    async fn call_json(&self, prompt: &str) -> Result<String> {
        let response = self
            .call_llm("Return JSON only, no text.", prompt, 800)
            .await?;
        Ok(clean_response(&response))
    }

    async fn call_sql(&self, prompt: &str) -> Result<String> {
        let response = self
            .call_llm(
                "You write a single read-only SQLite SELECT statement. Output SQL only, no explanation, no markdown.",
                prompt,
                800,
            )
            .await?;
        let sql = clean_response(&response);
        if sql.is_empty() {
            return Err(AgentError::Llm("Model returned no SQL".to_string()));
        }
        Ok(sql)
    }
}

#[async_trait]
impl GenerationCapability for LlmClient {
    async fn analyze_clarification(&self, query: &str) -> Result<ClarificationSection> {
        let prompt = format!(
            r#"Decide whether this analytics question needs more information before SQL can be written.

Tables:
{schema}

Ask only about these axes, and only when the question leaves them open:
- period: sales/revenue asked without a time range
- limit: "top"/"best" asked without a count
- filter: product or store listing that is too broad
- grouping: a trend asked without a time unit (daily/weekly/monthly)
- category: product category left open where it matters
- order: ranking asked without a direction

Format:
{{"needsClarification": true|false, "reason": "short reason", "questions": [{{"type": "period|limit|filter|grouping|category|order", "question": "...", "options": ["..."], "default": "one of options"}}]}}

Question: "{query}""#,
            schema = self.schema,
            query = query
        );
        let response = self.call_json(&prompt).await?;
        serde_json::from_str(&response)
            .map_err(|e| AgentError::Llm(format!("Failed to parse clarification verdict: {}", e)))
    }

    async fn generate_sql(&self, query: &str, context: &SqlGenerationContext) -> Result<String> {
        let examples = format_for_prompt(&context.examples);
        let prompt = format!(
            r#"Write one SQLite SELECT statement answering the question.

Tables:
{schema}

{examples}

Observations so far:
{observations}

Question: "{query}""#,
            schema = self.schema,
            examples = if examples.is_empty() { "(no verified examples)".to_string() } else { examples },
            observations = render_observations(&context.observations),
            query = query
        );
        self.call_sql(&prompt).await
    }

    async fn correct_sql(&self, request: &CorrectionRequest) -> Result<String> {
        let history = request
            .prior_attempts
            .iter()
            .map(|a| {
                format!(
                    "- attempt {}: {} => {}",
                    a.attempt_number,
                    if a.corrected_sql.is_empty() { "(no SQL)" } else { a.corrected_sql.as_str() },
                    a.error_message
                )
            })
            .collect::<Vec<_>>()
            .join("\n");

        let prompt = format!(
            r#"Fix the failed SQL so it runs and answers the question.

Question: "{query}"
Failed SQL: {sql}
Error{code}: {error}
Attempt: {attempt}/{max}

Earlier attempts:
{history}

Tables:
{schema}

Check table and column names against the schema, join keys, and GROUP BY for aggregates. Output only the corrected SQL."#,
            query = request.original_query,
            sql = request.failed_sql,
            code = request
                .error_code
                .as_ref()
                .map(|c| format!(" ({})", c))
                .unwrap_or_default(),
            error = request.error_message,
            attempt = request.attempt_number,
            max = request.max_attempts,
            history = if history.is_empty() { "(none)".to_string() } else { history },
            schema = self.schema
        );
        self.call_sql(&prompt).await
    }

    async fn choose_action(&self, query: &str, observations: &[Observation]) -> Result<AgentAction> {
        let prompt = format!(
            r#"You answer business questions about a retail sales database using tools.

Tools:
{tools}

Question: "{query}"

Observations so far:
{observations}

Pick the next step. Use "finish" once the observations answer the question.
Format: {{"action": "sql_executor|semantic_search|finish", "input": "tool input", "reason": "short reason"}}"#,
            tools = tool_catalogue(),
            query = query,
            observations = render_observations(observations)
        );
        let response = self.call_json(&prompt).await?;
        parse_decision(&response, query)
    }

    async fn synthesize_answer(
        &self,
        query: &str,
        observations: &[Observation],
    ) -> Result<SynthesizedAnswer> {
        let prompt = format!(
            r#"Answer the question from the observations. Quote concrete numbers and names from the data, and say plainly when the data does not answer it.

Question: "{query}"

Observations:
{observations}

Format:
{{"answer": "2-4 sentence answer",
 "insights": {{"summary": "...", "keyFindings": ["..."], "comparison": "optional", "trend": "optional", "anomaly": "optional", "recommendation": "optional"}},
 "visualization": {{"type": "chart|table|both", "chartType": "bar|line|pie", "reason": "..."}},
 "followUps": [{{"text": "...", "category": "deep_dive|comparison|expansion|action", "autoQuery": "..."}}]}}

Use bar for comparisons, line for trends over time and pie for shares. Suggest at most 5 follow-ups. Leave out insights and visualization when no rows were returned."#,
            query = query,
            observations = render_observations(observations)
        );
        let response = self
            .call_llm("You are a concise retail data analyst. Return JSON only.", &prompt, 1200)
            .await?;
        Ok(parse_synthesis(&response))
    }

    async fn describe_sql(&self, query: &str, sql: &str) -> Result<String> {
        let prompt = format!(
            "Describe in one sentence (under 15 words) what this SQL returns.\n\nQuestion: {}\nSQL: {}",
            query, sql
        );
        let response = self
            .call_llm("Output the description only.", &prompt, 100)
            .await?;
        Ok(response.trim().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::ToolName;
    use serde_json::json;

    #[test]
    fn strips_code_fences() {
        assert_eq!(clean_response("```sql\nselect 1\n```"), "select 1");
        assert_eq!(clean_response("```json\n{\"a\": 1}\n```"), "{\"a\": 1}");
        assert_eq!(clean_response("  select 2  "), "select 2");
    }

    #[test]
    fn long_observations_are_cut() {
        let observation = Observation {
            step: 1,
            tool: ToolName::SqlExecutor,
            input: "all sales".to_string(),
            success: true,
            payload: json!({ "rows": "x".repeat(5000) }),
        };
        let rendered = render_observations(&[observation]);
        assert!(rendered.len() < 2200);
        assert!(rendered.contains("[sql_executor]"));
        assert!(rendered.ends_with("..."));
    }

    #[test]
    fn schema_override_ignores_blank() {
        let client = LlmClient::new("k".into(), "m".into(), "http://localhost/".into()).with_schema("  ");
        assert!(client.schema.contains("products"));
        assert_eq!(client.base_url, "http://localhost");
    }
}
