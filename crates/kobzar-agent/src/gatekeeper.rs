//! Fast triage — the cheap local half of the hybrid cognitive loop.
//!
//! Classifies every persisted message before any expensive model is allowed
//! near it. Media messages and explicit mentions are decided in code; only
//! the ambiguous middle goes to the small model.

use std::sync::Arc;

use tracing::{debug, warn};

use kobzar_core::metrics;
use kobzar_core::types::{GateTarget, GateVerdict, MessageUid};
use kobzar_graph::StoredMessage;
use kobzar_llm::{strip_fences, ChatRequest};

use crate::assembler::with_context;
use crate::context::PipelineContext;
use crate::defaults::{roles, tasks};
use crate::error::{Result, StageError};

pub struct Gatekeeper {
    ctx: Arc<PipelineContext>,
}

impl Gatekeeper {
    pub fn new(ctx: Arc<PipelineContext>) -> Self {
        Self { ctx }
    }

    /// Produce the verdict for one persisted message.
    ///
    /// Output is guaranteed schema-valid: a malformed classification is
    /// retried once with a stricter reminder, then collapsed to
    /// `NOBODY`/`SKIP`.
    pub async fn triage(&self, uid: MessageUid) -> Result<(GateVerdict, StoredMessage)> {
        let message = self
            .ctx
            .store
            .message_by_uid(uid)
            .await?
            .ok_or_else(|| StageError::Missing(format!("message {uid} not in graph")))?;

        // The agent's own loopback messages are history, not conversation.
        if message.from_agent {
            return Ok((GateVerdict::skip(), message));
        }

        // Hardware triggers: stickers, voice, images force a direct quick
        // reply regardless of any caption text.
        if message.media.is_some() {
            debug!(%uid, media = ?message.media, "media message, forcing direct quick reply");
            return Ok((GateVerdict::forced_direct(), message));
        }

        let history = self
            .ctx
            .store
            .recent_messages(uid.chat_id, self.ctx.settings.history_k)
            .await
            .unwrap_or_default();

        let template = self
            .ctx
            .assembler
            .assemble(roles::GATEKEEPER, Some(tasks::TRIAGE))
            .await;
        let history_block = format_history(&history);
        let agent_line = format!("Агента звати {}.", self.ctx.settings.agent.name);

        for attempt in 0..2 {
            let mut system = with_context(
                &template,
                &[
                    ("АГЕНТ", &agent_line),
                    ("ОСТАННІ ПОВІДОМЛЕННЯ", &history_block),
                ],
            );
            if attempt == 1 {
                system.push_str(
                    "\n\nУВАГА: попередня відповідь не була валідним JSON. \
                     Поверни рівно один JSON-об'єкт і нічого більше.",
                );
            }

            let req = ChatRequest::new(
                &self.ctx.settings.gatekeeper_model,
                system,
                format!("Повідомлення від {}: {}", message.author, message.text),
            );

            let reply = match self.ctx.switchboard.call(&req).await {
                Ok(reply) => reply,
                Err(e) => {
                    warn!(%uid, error = %e, "gatekeeper call failed, skipping message");
                    break;
                }
            };

            match serde_json::from_str::<GateVerdict>(strip_fences(&reply.content)) {
                Ok(mut verdict) => {
                    if mentions_agent(&message.text, &self.ctx.settings.agent.name)
                        && verdict.target != GateTarget::Direct
                    {
                        debug!(%uid, "agent named explicitly, forcing DIRECT");
                        verdict.target = GateTarget::Direct;
                    }
                    debug!(%uid, ?verdict, provider = %reply.provider, "gate verdict");
                    return Ok((verdict, message));
                }
                Err(e) => {
                    warn!(%uid, attempt, error = %e, "gate verdict failed validation");
                }
            }
        }

        metrics::incr(metrics::names::GATE_MALFORMED_TOTAL);
        Ok((GateVerdict::skip(), message))
    }
}

/// Case-insensitive check whether the text names the agent.
fn mentions_agent(text: &str, agent_name: &str) -> bool {
    if agent_name.is_empty() {
        return false;
    }
    text.to_lowercase().contains(&agent_name.to_lowercase())
}

/// `[HH:MM] author: text` lines, oldest first.
pub(crate) fn format_history(history: &[StoredMessage]) -> String {
    history
        .iter()
        .map(|m| {
            let hm = chrono::DateTime::from_timestamp(m.created_at, 0)
                .map(|dt| dt.format("%H:%M").to_string())
                .unwrap_or_default();
            format!("[{hm}] {}: {}", m.author, m.text)
        })
        .collect::<Vec<_>>()
        .join("\n")
}
