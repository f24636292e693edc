//! Agentic retrieval against PrimaryMemory.
//!
//! The model writes the Cypher; this module decides whether it runs. Queries
//! must be read-only and bounded, and get at most one refinement iteration
//! when the first result set comes back empty.

use std::sync::Arc;

use tracing::{debug, warn};

use kobzar_core::metrics;
use kobzar_llm::{strip_fences, ChatRequest};

use kobzar_graph::query::validate_research_query;
use kobzar_graph::ResultSet;

use crate::assembler::with_context;
use crate::context::PipelineContext;
use crate::defaults::{roles, tasks};
use crate::error::{Result, StageError};

/// Total query iterations (initial + one refinement).
const MAX_ITERATIONS: usize = 2;

pub struct Researcher {
    ctx: Arc<PipelineContext>,
}

impl Researcher {
    pub fn new(ctx: Arc<PipelineContext>) -> Self {
        Self { ctx }
    }

    /// Answer `question` from the graph. Returns a natural-language summary,
    /// or [`StageError::Rejected`] when the generated query fails validation
    /// (the task is marked rejected, nothing is executed).
    pub async fn investigate(&self, question: &str) -> Result<String> {
        let template = self
            .ctx
            .assembler
            .assemble(roles::RESEARCHER, Some(tasks::GRAPH_SEARCH))
            .await;
        let schema = self.ctx.store.schema_summary();

        for iteration in 0..MAX_ITERATIONS {
            let refine_note = if iteration > 0 {
                "Попередній запит не знайшов нічого. Спробуй інший шлях по графу."
            } else {
                ""
            };
            let system = with_context(
                &template,
                &[("СХЕМА ГРАФА", schema), ("УТОЧНЕННЯ", refine_note)],
            );

            let req = ChatRequest::new(
                &self.ctx.settings.thinker_model,
                system,
                format!("Питання: {question}"),
            );
            let reply = self.ctx.switchboard.call(&req).await?;
            let raw_query = strip_fences(&reply.content).to_string();

            let validated = match validate_research_query(&raw_query) {
                Ok(q) => q,
                Err(e) => {
                    metrics::incr(metrics::names::RESEARCH_REJECTED_TOTAL);
                    warn!(query = %raw_query, error = %e, "generated query rejected");
                    return Err(StageError::Rejected(e.to_string()));
                }
            };

            debug!(iteration, query = %validated, "executing research query");
            let rows = self.ctx.store.research(&validated).await?;
            if !rows.is_empty() {
                return self.summarize(question, &rows).await;
            }
        }

        // Both iterations came back empty — say so rather than invent.
        Ok("У графі пам'яті нічого не знайшлося з цього питання.".to_string())
    }

    async fn summarize(&self, question: &str, rows: &ResultSet) -> Result<String> {
        let table = format_rows(rows);
        let req = ChatRequest::new(
            &self.ctx.settings.thinker_model,
            "Перекажи результати запиту до графа пам'яті одним-двома реченнями українською. \
             Без вигадок: лише те, що є в рядках.",
            format!("Питання: {question}\n\nРезультати:\n{table}"),
        );
        match self.ctx.switchboard.call(&req).await {
            Ok(reply) => Ok(reply.content),
            // A failed summary is not a failed search — fall back to the raw rows.
            Err(e) => {
                warn!(error = %e, "summary call failed, returning raw rows");
                Ok(table)
            }
        }
    }
}

/// Render a result set as `col=value` lines for the summarizer.
fn format_rows(rows: &ResultSet) -> String {
    rows.rows
        .iter()
        .map(|row| {
            row.iter()
                .enumerate()
                .map(|(i, cell)| {
                    let column = rows.columns.get(i).map(String::as_str).unwrap_or("?");
                    let value = match cell {
                        kobzar_graph::Scalar::Text(s) => s.clone(),
                        kobzar_graph::Scalar::Int(n) => n.to_string(),
                        kobzar_graph::Scalar::Float(f) => f.to_string(),
                        kobzar_graph::Scalar::Bool(b) => b.to_string(),
                        kobzar_graph::Scalar::Null => "null".to_string(),
                    };
                    format!("{column}={value}")
                })
                .collect::<Vec<_>>()
                .join(", ")
        })
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{ctx_with, scripted, Outcome};
    use kobzar_graph::{MockBackend, Scalar};

    #[tokio::test]
    async fn read_only_query_executes_and_summarizes() {
        let backend = Arc::new(MockBackend::new());
        backend.script(
            "MATCH (m:Message)",
            ResultSet::table(
                &["m.text"],
                vec![vec![Scalar::Text("останнє повідомлення".into())]],
            ),
        );
        let provider = scripted(
            "ok",
            Outcome::Seq(vec![
                "MATCH (m:Message) RETURN m.text ORDER BY m.created_at DESC LIMIT 1",
                "Останнє повідомлення — про розгортання.",
            ]),
        );
        let ctx = ctx_with(backend.clone(), vec![provider]);
        let researcher = Researcher::new(ctx);

        let summary = researcher.investigate("який останній день?").await.unwrap();
        assert_eq!(summary, "Останнє повідомлення — про розгортання.");

        // The executed query got through validation untouched (had a LIMIT).
        let executed = backend.executed_on("PrimaryMemory");
        assert!(executed
            .iter()
            .any(|q| q.contains("RETURN m.text") && q.contains("LIMIT 1")));
    }

    #[tokio::test]
    async fn write_query_is_rejected_without_execution() {
        let backend = Arc::new(MockBackend::new());
        let provider = scripted(
            "evil",
            Outcome::Ok("MERGE (t:Topic {title:'hack'}) RETURN t.title"),
        );
        let ctx = ctx_with(backend.clone(), vec![provider]);
        let researcher = Researcher::new(ctx);

        let before = metrics::get(metrics::names::RESEARCH_REJECTED_TOTAL);
        let err = researcher.investigate("x").await.unwrap_err();
        assert!(matches!(err, StageError::Rejected(_)));
        assert_eq!(metrics::get(metrics::names::RESEARCH_REJECTED_TOTAL), before + 1);

        // Nothing but the (never-run) query validation happened: the mock saw
        // no MERGE statement.
        assert!(backend
            .executed_on("PrimaryMemory")
            .iter()
            .all(|q| !q.contains("MERGE")));
    }

    #[tokio::test]
    async fn empty_result_gets_one_refinement() {
        let backend = Arc::new(MockBackend::new());
        // No scripts: every query returns an empty result set.
        let provider = scripted(
            "persistent",
            Outcome::Ok("MATCH (t:Topic) RETURN t.title LIMIT 5"),
        );
        let ctx = ctx_with(backend.clone(), vec![provider.clone()]);
        let researcher = Researcher::new(ctx);

        let summary = researcher.investigate("про що говорили?").await.unwrap();
        assert!(summary.contains("нічого не знайшлося"));
        // Two query-writing calls, no summarize call.
        assert_eq!(provider.calls(), 2);
        let research_runs = backend
            .executed_on("PrimaryMemory")
            .iter()
            .filter(|q| q.contains("RETURN t.title"))
            .count();
        assert_eq!(research_runs, 2);
    }
}
