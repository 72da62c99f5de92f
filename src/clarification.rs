//! Clarification Analyzer
//!
//! Decides whether a raw question is answerable as-is or under-specified along
//! one of six axes (period, limit, filter, grouping, category, order). The
//! model's verdict is normalized so every produced question keeps its default
//! among its options. Model failures fail open: the pipeline proceeds without
//! clarification and the failure is only logged.

use crate::capabilities::{with_timeout, GenerationCapability};
use crate::error::{AgentError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ClarificationType {
    Period,
    Limit,
    Filter,
    Grouping,
    Category,
    Order,
}

impl ClarificationType {
    pub const ALL: [ClarificationType; 6] = [
        ClarificationType::Period,
        ClarificationType::Limit,
        ClarificationType::Filter,
        ClarificationType::Grouping,
        ClarificationType::Category,
        ClarificationType::Order,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ClarificationType::Period => "period",
            ClarificationType::Limit => "limit",
            ClarificationType::Filter => "filter",
            ClarificationType::Grouping => "grouping",
            ClarificationType::Category => "category",
            ClarificationType::Order => "order",
        }
    }

    /// Filters and categories can be answered with free text, so an empty
    /// option list is an open question rather than a malformed one.
    pub fn permits_free_text(&self) -> bool {
        matches!(self, ClarificationType::Filter | ClarificationType::Category)
    }
}

impl fmt::Display for ClarificationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ClarificationType {
    type Err = AgentError;

    fn from_str(s: &str) -> Result<Self> {
        ClarificationType::ALL
            .iter()
            .find(|t| t.as_str().eq_ignore_ascii_case(s.trim()))
            .copied()
            .ok_or_else(|| AgentError::InvalidArgument(format!("Unknown clarification type '{}'", s)))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClarificationQuestion {
    #[serde(rename = "type")]
    pub kind: ClarificationType,
    pub question: String,
    #[serde(default)]
    pub options: Vec<String>,
    #[serde(default)]
    pub default: String,
}

impl ClarificationQuestion {
    pub fn is_open(&self) -> bool {
        self.options.is_empty()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct ClarificationSection {
    pub needs_clarification: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default)]
    pub questions: Vec<ClarificationQuestion>,
}

impl ClarificationSection {
    pub fn proceed() -> Self {
        Self::default()
    }

    /// Defaults of every closed question, keyed by axis.
    pub fn defaults(&self) -> HashMap<ClarificationType, String> {
        self.questions
            .iter()
            .filter(|q| !q.is_open())
            .map(|q| (q.kind, q.default.clone()))
            .collect()
    }

    /// Enforce `default ∈ options`. Closed questions with a foreign default
    /// fall back to their first option; open questions are only kept for
    /// free-text axes and carry an empty default. A section that needs
    /// clarification but keeps no question proceeds instead.
    pub fn normalized(self) -> Self {
        let questions: Vec<ClarificationQuestion> = self
            .questions
            .into_iter()
            .filter_map(normalize_question)
            .collect();

        if self.needs_clarification && questions.is_empty() {
            warn!("Clarification requested without usable questions, proceeding");
            return Self {
                needs_clarification: false,
                reason: self.reason,
                questions,
            };
        }

        Self {
            needs_clarification: self.needs_clarification,
            reason: self.reason,
            questions: if self.needs_clarification { questions } else { Vec::new() },
        }
    }
}

fn normalize_question(mut question: ClarificationQuestion) -> Option<ClarificationQuestion> {
    question.question = question.question.trim().to_string();
    if question.question.is_empty() {
        return None;
    }

    let mut seen = std::collections::HashSet::new();
    question.options = question
        .options
        .into_iter()
        .map(|o| o.trim().to_string())
        .filter(|o| !o.is_empty() && seen.insert(o.clone()))
        .collect();

    if question.options.is_empty() {
        if !question.kind.permits_free_text() {
            return None;
        }
        question.default = String::new();
        return Some(question);
    }

    let default = question.default.trim().to_string();
    question.default = if question.options.contains(&default) {
        default
    } else {
        question.options[0].clone()
    };
    Some(question)
}

/// Append chosen answers to the question so SQL generation sees them.
pub fn apply_answers(query: &str, answers: &HashMap<ClarificationType, String>) -> String {
    if answers.is_empty() {
        return query.to_string();
    }
    let mut parts: Vec<(ClarificationType, &String)> =
        answers.iter().map(|(k, v)| (*k, v)).collect();
    parts.sort_by_key(|(k, _)| ClarificationType::ALL.iter().position(|t| t == k));
    let suffix = parts
        .iter()
        .map(|(k, v)| format!("{}: {}", k, v))
        .collect::<Vec<_>>()
        .join("; ");
    format!("{} ({})", query.trim(), suffix)
}

pub struct ClarificationAnalyzer {
    generation: Arc<dyn GenerationCapability>,
    timeout: Duration,
}

impl ClarificationAnalyzer {
    pub fn new(generation: Arc<dyn GenerationCapability>, timeout: Duration) -> Self {
        Self { generation, timeout }
    }

    pub async fn analyze(&self, query: &str) -> ClarificationSection {
        let verdict = with_timeout(
            "clarification analysis",
            self.timeout,
            self.generation.analyze_clarification(query),
        )
        .await;

        match verdict {
            Ok(section) => {
                let section = section.normalized();
                if section.needs_clarification {
                    info!(
                        "Query needs clarification ({} question(s))",
                        section.questions.len()
                    );
                }
                section
            }
            Err(e) => {
                warn!(
                    error_kind = ?e.kind(),
                    "Clarification analysis failed, proceeding without clarification: {}",
                    e
                );
                ClarificationSection::proceed()
            }
        }
    }
}
