pub mod config;
pub mod error;
pub mod metrics;
pub mod types;

pub use config::KobzarConfig;
pub use error::{KobzarError, Result};
pub use types::{
    AnalystSnapshot, ContextBundle, Enrichment, EventSource, GateDepth, GateTarget, GateVerdict,
    InboundEvent, Intent, MessageUid, PlanTask, PlanningJob, TaskAction, ToneHint, ToolOutput,
    ToolStatus, TriageJob,
};
