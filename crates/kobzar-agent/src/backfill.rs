//! Reprocess persisted messages through the Thinker.
//!
//! Used by the `backfill` CLI command after prompt or model changes: walks
//! every chat, re-analyzes the most recent user messages and applies the
//! enrichment directly (no bus round-trip, no replies).

use std::sync::Arc;

use tracing::{info, warn};

use crate::context::PipelineContext;
use crate::error::Result;
use crate::thinker::Thinker;

/// Re-enrich up to `per_chat` recent messages in every known chat.
/// Returns how many messages produced a non-empty enrichment.
pub async fn backfill(ctx: Arc<PipelineContext>, per_chat: usize) -> Result<u64> {
    let thinker = Thinker::new(ctx.clone());
    let chats = ctx.store.all_chat_ids().await?;
    info!(chats = chats.len(), per_chat, "backfill started");

    let mut enriched: u64 = 0;
    for chat_id in chats {
        let messages = match ctx.store.recent_messages(chat_id, per_chat).await {
            Ok(messages) => messages,
            Err(e) => {
                warn!(chat_id, error = %e, "skipping chat, history read failed");
                continue;
            }
        };

        for message in messages {
            if message.from_agent {
                continue;
            }
            match thinker.analyze(message.uid).await {
                Ok(enrichment)
                    if !enrichment.topics.is_empty() || !enrichment.entities.is_empty() =>
                {
                    if let Err(e) = ctx.store.enrich(&enrichment).await {
                        warn!(uid = %message.uid, error = %e, "backfill enrichment write failed");
                        continue;
                    }
                    enriched += 1;
                }
                Ok(_) => {}
                Err(e) => warn!(uid = %message.uid, error = %e, "backfill analysis failed"),
            }
        }
    }

    info!(enriched, "backfill complete");
    Ok(enriched)
}
