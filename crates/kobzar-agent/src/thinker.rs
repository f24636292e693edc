//! Semantic enrichment — topics, entities, and the situational narrative.
//!
//! Every raw prompt/response pair is persisted into the ThoughtLog graph
//! through the fire-and-forget logger; the reasoning trail never blocks the
//! pipeline and never touches PrimaryMemory analytics.

use std::sync::Arc;

use serde::Deserialize;
use tracing::{debug, warn};

use kobzar_core::types::{Enrichment, EntityKind, EntityTag, MessageUid, TopicTag};
use kobzar_llm::{strip_fences, ChatRequest};

use crate::assembler::with_context;
use crate::context::PipelineContext;
use crate::defaults::{roles, tasks};
use crate::error::{Result, StageError};
use crate::gatekeeper::format_history;

pub struct Thinker {
    ctx: Arc<PipelineContext>,
}

/// What the model actually returns; `msg_uid` is advisory and replaced by the
/// authoritative uid from the job.
#[derive(Debug, Deserialize)]
struct ThinkerDraft {
    #[serde(default)]
    #[allow(dead_code)]
    msg_uid: Option<String>,
    #[serde(default)]
    topics: Vec<TopicTag>,
    #[serde(default)]
    entities: Vec<EntityTag>,
    narrative: String,
}

impl Thinker {
    pub fn new(ctx: Arc<PipelineContext>) -> Self {
        Self { ctx }
    }

    /// Analyze one message in context. Validation failures retry once with a
    /// stricter reminder; a second failure yields an empty enrichment so the
    /// plan still executes.
    pub async fn analyze(&self, uid: MessageUid) -> Result<Enrichment> {
        let message = self
            .ctx
            .store
            .message_by_uid(uid)
            .await?
            .ok_or_else(|| StageError::Missing(format!("message {uid} not in graph")))?;

        let history = self
            .ctx
            .store
            .recent_messages(uid.chat_id, self.ctx.settings.history_k)
            .await
            .unwrap_or_default();
        let topics = self.ctx.store.active_topics(50).await.unwrap_or_default();

        let template = self
            .ctx
            .assembler
            .assemble(roles::THINKER, Some(tasks::SEMANTIC_ANALYSIS))
            .await;

        let topics_block = topics
            .iter()
            .map(|t| format!("- {}", t.title))
            .collect::<Vec<_>>()
            .join("\n");
        let kinds_block = EntityKind::ALL
            .iter()
            .map(|k| k.as_str())
            .collect::<Vec<_>>()
            .join(", ");
        let history_block = format_history(&history);

        for attempt in 0..2 {
            let mut system = with_context(
                &template,
                &[
                    ("ІСТОРІЯ", &history_block),
                    ("АКТИВНІ ТЕМИ", &topics_block),
                    ("ТИПИ СУТНОСТЕЙ", &kinds_block),
                ],
            );
            if attempt == 1 {
                system.push_str(
                    "\n\nУВАГА: попередня відповідь не пройшла перевірку формату. \
                     Поверни рівно один JSON-об'єкт за вказаною схемою.",
                );
            }

            let user = format!("msg_uid: {uid}\nПовідомлення від {}: {}", message.author, message.text);
            let req = ChatRequest::new(&self.ctx.settings.thinker_model, system, user);

            let reply = match self.ctx.switchboard.call(&req).await {
                Ok(reply) => reply,
                Err(e) => {
                    warn!(%uid, error = %e, "thinker call failed, emitting empty enrichment");
                    return Ok(Enrichment::empty(uid));
                }
            };

            // Reasoning trail, isolated in ThoughtLog.
            self.ctx.thoughts.log(
                &req.messages.first().map(|m| m.content.clone()).unwrap_or_default(),
                &reply.content,
                &self.ctx.settings.thinker_model,
            );

            match serde_json::from_str::<ThinkerDraft>(strip_fences(&reply.content)) {
                Ok(draft) => {
                    let enrichment = Enrichment {
                        msg_uid: uid,
                        topics: draft.topics,
                        entities: draft.entities,
                        narrative: draft.narrative,
                    };
                    debug!(
                        %uid,
                        topics = enrichment.topics.len(),
                        entities = enrichment.entities.len(),
                        "thinker enrichment ready"
                    );

                    if !enrichment.narrative.is_empty() {
                        let store = self.ctx.store.clone();
                        let narrative = enrichment.narrative.clone();
                        let model = self.ctx.settings.thinker_model.clone();
                        tokio::spawn(async move {
                            if let Err(e) = store.record_thought(&narrative, &model).await {
                                warn!(error = %e, "thought snapshot write failed");
                            }
                        });
                    }

                    return Ok(enrichment);
                }
                Err(e) => {
                    warn!(%uid, attempt, error = %e, "thinker output failed validation");
                }
            }
        }

        Ok(Enrichment::empty(uid))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{ctx_with, scripted, Outcome};
    use kobzar_graph::{MockBackend, ResultSet, Scalar};

    fn script_message(backend: &MockBackend, uid: &str, text: &str) {
        backend.script(
            &format!("MATCH (m:Message {{uid: '{uid}'}})"),
            ResultSet::table(
                &["m.uid", "m.text", "m.created_at", "u.name", "a.name", "m.media"],
                vec![vec![
                    Scalar::Text(uid.into()),
                    Scalar::Text(text.into()),
                    Scalar::Int(1_738_670_000),
                    Scalar::Text("Bohdan".into()),
                    Scalar::Null,
                    Scalar::Null,
                ]],
            ),
        );
    }

    const GOOD: &str = r#"{"msg_uid":"1:100","topics":[{"title":"Docker","is_new":true}],"entities":[{"name":"Docker","type":"Technology"}],"narrative":"Говорять про розгортання."}"#;

    #[tokio::test]
    async fn valid_output_becomes_enrichment() {
        let backend = Arc::new(MockBackend::new());
        script_message(&backend, "1:100", "як розгорнути docker?");
        let provider = scripted("ok", Outcome::Ok(GOOD));
        let ctx = ctx_with(backend.clone(), vec![provider]);
        let thinker = Thinker::new(ctx);

        let enrichment = thinker.analyze("1:100".parse().unwrap()).await.unwrap();
        assert_eq!(enrichment.msg_uid, "1:100".parse().unwrap());
        assert_eq!(enrichment.topics[0].title, "Docker");
        assert_eq!(enrichment.entities[0].kind, EntityKind::Technology);
        assert!(!enrichment.narrative.is_empty());

        // Prompt/response pair lands in the ThoughtLog graph.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(!backend.executed_on("ThoughtLog").is_empty());
    }

    #[tokio::test]
    async fn malformed_output_retries_once_with_reminder() {
        let backend = Arc::new(MockBackend::new());
        script_message(&backend, "1:100", "docker?");
        let provider = scripted("flaky", Outcome::Seq(vec!["topics: Docker", GOOD]));
        let ctx = ctx_with(backend, vec![provider.clone()]);
        let thinker = Thinker::new(ctx);

        let enrichment = thinker.analyze("1:100".parse().unwrap()).await.unwrap();
        assert_eq!(enrichment.topics.len(), 1);
        assert_eq!(provider.calls(), 2);
        // The retry carried the stricter reminder.
        let systems = provider.systems.lock().unwrap();
        assert!(systems[1].contains("УВАГА"));
        assert!(!systems[0].contains("УВАГА"));
    }

    #[tokio::test]
    async fn two_failures_yield_empty_enrichment() {
        let backend = Arc::new(MockBackend::new());
        script_message(&backend, "1:100", "docker?");
        let provider = scripted("junk", Outcome::Ok("ще раз не json"));
        let ctx = ctx_with(backend, vec![provider.clone()]);
        let thinker = Thinker::new(ctx);

        let enrichment = thinker.analyze("1:100".parse().unwrap()).await.unwrap();
        assert!(enrichment.topics.is_empty());
        assert!(enrichment.narrative.is_empty());
        assert_eq!(provider.calls(), 2);
    }

    #[tokio::test]
    async fn unknown_entity_kind_fails_validation() {
        let backend = Arc::new(MockBackend::new());
        script_message(&backend, "1:100", "hm");
        let bad = r#"{"topics":[],"entities":[{"name":"X","type":"Galaxy"}],"narrative":"n"}"#;
        let provider = scripted("strict", Outcome::Ok(bad));
        let ctx = ctx_with(backend, vec![provider.clone()]);
        let thinker = Thinker::new(ctx);

        let enrichment = thinker.analyze("1:100".parse().unwrap()).await.unwrap();
        assert!(enrichment.entities.is_empty());
        assert_eq!(provider.calls(), 2);
    }
}
