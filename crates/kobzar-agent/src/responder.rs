//! Persona-layered reply generation and emission.
//!
//! Wraps the ContextBundle in the Responder persona, sends the reply out
//! through the transport sink, and hands back a loopback event so the
//! agent's own message is persisted symmetrically with everyone else's.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{info, warn};

use kobzar_core::metrics;
use kobzar_core::types::{
    ChatKind, ContextBundle, EventSource, GateTarget, InboundEvent, ToneHint,
};
use kobzar_llm::ChatRequest;

use crate::assembler::with_context;
use crate::context::PipelineContext;
use crate::defaults::{roles, tasks};
use crate::error::Result;

/// Transport boundary for outbound replies. Returns the platform-assigned
/// message id so the loopback event carries the real uid.
#[async_trait]
pub trait OutboundSink: Send + Sync {
    async fn deliver(&self, chat_id: i64, text: &str) -> std::result::Result<i64, String>;
}

/// Fallback reply when generation fails for a directly-addressed message.
const APOLOGY: &str = "Перепрошую, щось пішло не так — не можу зараз відповісти до пуття.";

pub struct Responder {
    ctx: Arc<PipelineContext>,
    sink: Arc<dyn OutboundSink>,
}

impl Responder {
    pub fn new(ctx: Arc<PipelineContext>, sink: Arc<dyn OutboundSink>) -> Self {
        Self { ctx, sink }
    }

    /// Generate and emit the reply for one bundle.
    ///
    /// Returns the agent-sourced loopback event to publish into `ingestion`,
    /// or `None` when nothing was sent (silent drop for non-direct messages
    /// whose generation failed).
    pub async fn respond(&self, bundle: ContextBundle) -> Result<Option<InboundEvent>> {
        let chat_id = bundle.snapshot.chat_id();

        let text = match self.compose(&bundle).await {
            Some(text) if !text.trim().is_empty() => text,
            _ => {
                if bundle.snapshot.gate.target == GateTarget::Direct {
                    metrics::incr(metrics::names::REPLIES_APOLOGIZED_TOTAL);
                    APOLOGY.to_string()
                } else {
                    info!(uid = %bundle.snapshot.msg_uid, "reply generation failed, dropping silently");
                    return Ok(None);
                }
            }
        };

        let message_id = match self.sink.deliver(chat_id, &text).await {
            Ok(id) => id,
            Err(reason) => {
                warn!(chat_id, %reason, "outbound delivery failed");
                return Ok(None);
            }
        };

        metrics::incr(metrics::names::REPLIES_SENT_TOTAL);
        info!(chat_id, message_id, "reply sent");

        // Symmetric history: the agent's own message flows back through the
        // Scribe. The chat node already exists, so the placeholder kind on
        // this event never reaches the graph.
        Ok(Some(InboundEvent {
            chat_id,
            message_id,
            source: EventSource::Agent,
            sender_id: self.ctx.settings.agent.telegram_id,
            sender_name: Some(self.ctx.settings.agent.name.clone()),
            username: None,
            chat_kind: ChatKind::Private,
            chat_title: None,
            text,
            timestamp: Utc::now().timestamp() as f64,
            media: None,
        }))
    }

    async fn compose(&self, bundle: &ContextBundle) -> Option<String> {
        let template = self
            .ctx
            .assembler
            .assemble(roles::RESPONDER, Some(tasks::COMPOSE_REPLY))
            .await;

        let message = self
            .ctx
            .store
            .message_by_uid(bundle.snapshot.msg_uid)
            .await
            .ok()
            .flatten();
        let question_block = message
            .map(|m| format!("{}: {}", m.author, m.text))
            .unwrap_or_default();

        let outputs_block = bundle
            .outputs
            .iter()
            .map(|o| format!("[{} #{} {:?}] {}", o.action, o.task_id, o.status, o.content))
            .collect::<Vec<_>>()
            .join("\n");

        let tone_line = match bundle.snapshot.gate.tone_hint {
            ToneHint::Humor => "Тон: легкий, з гумором.",
            ToneHint::Serious => "Тон: серйозний і стриманий.",
            ToneHint::Neutral => "Тон: нейтральний.",
        };
        let agent_line = format!("Тебе звати {}.", self.ctx.settings.agent.name);

        let system = with_context(
            &template,
            &[
                ("ПРО ТЕБЕ", &agent_line),
                ("ТОН", tone_line),
                ("ОПОВІДЬ", &bundle.snapshot.narrative),
                ("РЕЗУЛЬТАТИ ІНСТРУМЕНТІВ", &outputs_block),
            ],
        );

        let req = ChatRequest::new(
            &self.ctx.settings.responder_model,
            system,
            format!("Повідомлення, на яке відповідаєш:\n{question_block}"),
        );

        match self.ctx.switchboard.call(&req).await {
            Ok(reply) => Some(reply.content),
            Err(e) => {
                warn!(uid = %bundle.snapshot.msg_uid, error = %e, "reply generation failed");
                None
            }
        }
    }
}
