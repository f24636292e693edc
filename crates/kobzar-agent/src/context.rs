//! Shared context handed to every stream worker.

use std::sync::Arc;
use std::time::Duration;

use kobzar_core::config::{AgentIdentity, KobzarConfig};
use kobzar_graph::{GraphStore, ThoughtLogger};
use kobzar_llm::Switchboard;

use crate::assembler::PromptAssembler;

/// Per-stage tunables lifted out of the full config.
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub agent: AgentIdentity,
    /// Cheap local model driving the Gatekeeper.
    pub gatekeeper_model: String,
    /// Remote model for Thinker, Analyst and Researcher calls.
    pub thinker_model: String,
    pub responder_model: String,
    pub history_k: usize,
    pub task_timeout: Duration,
}

impl PipelineSettings {
    pub fn from_config(config: &KobzarConfig) -> Self {
        Self {
            agent: config.agent.clone(),
            gatekeeper_model: config.gatekeeper.model.clone(),
            thinker_model: config.thinker.model.clone(),
            responder_model: config.responder.model.clone(),
            history_k: config.thinker.history_k,
            task_timeout: Duration::from_secs(config.coordinator.task_timeout_seconds),
        }
    }
}

/// Everything a stage needs: the store, the LLM switchboard, the prompt
/// assembler, the thought log, and the settings. One instance per process,
/// shared by every worker via Arc.
pub struct PipelineContext {
    pub store: Arc<GraphStore>,
    pub switchboard: Arc<Switchboard>,
    pub assembler: Arc<PromptAssembler>,
    pub thoughts: ThoughtLogger,
    pub settings: PipelineSettings,
}
