//! Answer synthesis parsing
//!
//! The model is asked for
//! `{"answer": ..., "insights": {...}, "visualization": {...}, "followUps": [...]}`.
//! Anything that does not parse into that shape is kept as a plain narrative
//! answer, so a chatty model still produces something usable.

use crate::llm::clean_response;
use serde::{Deserialize, Serialize};

/// Structured reading of the rows.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct Insights {
    pub summary: String,
    #[serde(default)]
    pub key_findings: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comparison: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trend: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub anomaly: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recommendation: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DisplayType {
    Chart,
    Table,
    Both,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ChartType {
    Bar,
    Line,
    Pie,
}

/// How the rows are best shown. `chart_type` is set whenever a chart is.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VisualizationHint {
    #[serde(rename = "type")]
    pub display: DisplayType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chart_type: Option<ChartType>,
    #[serde(default)]
    pub reason: String,
}

impl VisualizationHint {
    /// A chart without a chart type cannot be drawn; show the table instead.
    fn normalized(mut self) -> Self {
        match (self.display, self.chart_type) {
            (DisplayType::Table, Some(_)) => self.chart_type = None,
            (DisplayType::Chart | DisplayType::Both, None) => self.display = DisplayType::Table,
            _ => {}
        }
        self
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FollowUpCategory {
    DeepDive,
    Comparison,
    Expansion,
    Action,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FollowUpQuestion {
    pub text: String,
    pub category: FollowUpCategory,
    /// Ready-to-run question for the next agent run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auto_query: Option<String>,
}

pub const MAX_FOLLOW_UPS: usize = 5;

/// What `synthesize_answer` hands back to the orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct SynthesizedAnswer {
    pub answer: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub insights: Option<Insights>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub visualization: Option<VisualizationHint>,
    #[serde(default)]
    pub follow_ups: Vec<FollowUpQuestion>,
}

impl SynthesizedAnswer {
    pub fn narrative(text: impl Into<String>) -> Self {
        Self {
            answer: text.into(),
            ..Self::default()
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawSynthesis {
    #[serde(default)]
    answer: Option<String>,
    #[serde(default)]
    insights: Option<Insights>,
    #[serde(default)]
    visualization: Option<VisualizationHint>,
    #[serde(default)]
    follow_ups: Vec<FollowUpQuestion>,
}

pub fn parse_synthesis(raw: &str) -> SynthesizedAnswer {
    let cleaned = clean_response(raw);
    let parsed = match serde_json::from_str::<RawSynthesis>(&cleaned) {
        Ok(parsed) => parsed,
        Err(_) => return SynthesizedAnswer::narrative(raw.trim()),
    };

    let answer = parsed
        .answer
        .filter(|a| !a.trim().is_empty())
        .or_else(|| {
            parsed
                .insights
                .as_ref()
                .map(|i| i.summary.clone())
                .filter(|s| !s.trim().is_empty())
        });
    let Some(answer) = answer else {
        return SynthesizedAnswer::narrative(raw.trim());
    };

    let mut follow_ups: Vec<FollowUpQuestion> = parsed
        .follow_ups
        .into_iter()
        .filter(|f| !f.text.trim().is_empty())
        .collect();
    follow_ups.truncate(MAX_FOLLOW_UPS);

    SynthesizedAnswer {
        answer: answer.trim().to_string(),
        insights: parsed.insights,
        visualization: parsed.visualization.map(VisualizationHint::normalized),
        follow_ups,
    }
}
