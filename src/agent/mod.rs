pub mod contracts;
pub mod decision;
pub mod orchestrator;
pub mod synthesis;

pub use contracts::{
    AgentAction, AgentAnswer, CancelFlag, ManualResolution, Observation, QueryOptions,
    QueryResolution, TraceEvent, TraceEventType,
};
pub use orchestrator::{AgentOrchestrator, OrchestratorSettings};
pub use synthesis::{
    parse_synthesis, ChartType, DisplayType, FollowUpCategory, FollowUpQuestion, Insights,
    SynthesizedAnswer, VisualizationHint,
};
