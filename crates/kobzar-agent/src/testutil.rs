//! Shared doubles for stage tests: a scripted LLM provider and a context
//! factory over the mock graph backend.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use kobzar_core::config::AgentIdentity;
use kobzar_graph::{GraphStore, MockBackend, ThoughtLogger};
use kobzar_llm::{ChatRequest, ChatResponse, LlmProvider, ProviderError, Switchboard};

use crate::assembler::PromptAssembler;
use crate::context::{PipelineContext, PipelineSettings};

pub(crate) enum Outcome {
    /// Always return this content.
    Ok(&'static str),
    /// Return these contents in order, repeating the last one.
    Seq(Vec<&'static str>),
    Retryable,
    Fatal,
}

pub(crate) struct ScriptedProvider {
    name: &'static str,
    outcome: Outcome,
    calls: AtomicU32,
    pub systems: Mutex<Vec<String>>,
}

impl ScriptedProvider {
    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LlmProvider for ScriptedProvider {
    fn name(&self) -> &str {
        self.name
    }

    async fn send(&self, req: &ChatRequest) -> Result<ChatResponse, ProviderError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) as usize;
        self.systems.lock().unwrap().push(req.system.clone());
        match &self.outcome {
            Outcome::Ok(content) => Ok(ChatResponse {
                content: content.to_string(),
                model: req.model.clone(),
            }),
            Outcome::Seq(contents) => {
                let content = contents
                    .get(call)
                    .or_else(|| contents.last())
                    .copied()
                    .unwrap_or_default();
                Ok(ChatResponse {
                    content: content.to_string(),
                    model: req.model.clone(),
                })
            }
            Outcome::Retryable => Err(ProviderError::RateLimited { retry_after_ms: 10 }),
            Outcome::Fatal => Err(ProviderError::Auth("scripted failure".into())),
        }
    }
}

pub(crate) fn scripted(name: &'static str, outcome: Outcome) -> Arc<ScriptedProvider> {
    Arc::new(ScriptedProvider {
        name,
        outcome,
        calls: AtomicU32::new(0),
        systems: Mutex::new(Vec::new()),
    })
}

pub(crate) fn test_agent() -> AgentIdentity {
    AgentIdentity {
        telegram_id: 999,
        name: "Кобзар".to_string(),
    }
}

pub(crate) fn ctx_with(
    backend: Arc<MockBackend>,
    providers: Vec<Arc<ScriptedProvider>>,
) -> Arc<PipelineContext> {
    let providers: Vec<Arc<dyn LlmProvider>> = providers
        .into_iter()
        .map(|p| p as Arc<dyn LlmProvider>)
        .collect();
    let store = Arc::new(GraphStore::new(
        backend.clone(),
        "PrimaryMemory",
        test_agent(),
    ));
    let assembler = Arc::new(PromptAssembler::new(
        store.clone(),
        Duration::from_secs(60),
    ));
    Arc::new(PipelineContext {
        store,
        switchboard: Arc::new(Switchboard::new(providers, Duration::from_secs(30))),
        assembler,
        thoughts: ThoughtLogger::spawn(backend, "ThoughtLog".to_string()),
        settings: PipelineSettings {
            agent: test_agent(),
            gatekeeper_model: "test-gate".to_string(),
            thinker_model: "test-think".to_string(),
            responder_model: "test-respond".to_string(),
            history_k: 5,
            task_timeout: Duration::from_millis(200),
        },
    })
}
