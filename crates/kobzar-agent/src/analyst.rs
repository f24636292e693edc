//! Intent classification and plan formulation.
//!
//! The model proposes a task DAG; validation is a first-class step, not an
//! afterthought. Anything that fails validation twice collapses to the
//! apology fallback plan so the user still gets an answer.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde::Deserialize;
use tracing::{debug, warn};

use kobzar_core::metrics;
use kobzar_core::types::{AnalystSnapshot, Intent, PlanTask, PlanningJob, TaskAction};
use kobzar_llm::{strip_fences, ChatRequest};

use crate::assembler::with_context;
use crate::context::PipelineContext;
use crate::defaults::{roles, tasks};
use crate::error::Result;

pub struct Analyst {
    ctx: Arc<PipelineContext>,
}

#[derive(Debug, Deserialize)]
struct PlanDraft {
    intent: Intent,
    #[serde(default)]
    tasks: Vec<PlanTask>,
}

impl Analyst {
    pub fn new(ctx: Arc<PipelineContext>) -> Self {
        Self { ctx }
    }

    /// Turn a planning job into an executable snapshot. One retry on an
    /// invalid plan, then the apology fallback.
    pub async fn plan(&self, job: PlanningJob) -> Result<AnalystSnapshot> {
        let template = self
            .ctx
            .assembler
            .assemble(roles::ANALYST, Some(tasks::FORMULATE_PLAN))
            .await;

        let message = self
            .ctx
            .store
            .message_by_uid(job.message_uid)
            .await
            .ok()
            .flatten();
        let message_text = message.map(|m| m.text).unwrap_or_default();

        let verdict_line = format!(
            "target={:?}, depth={:?}, tone={:?}",
            job.gate_decision.target, job.gate_decision.required_depth, job.gate_decision.tone_hint
        );

        let mut issue: Option<String> = None;
        for attempt in 0..2 {
            let mut system = with_context(
                &template,
                &[
                    ("ВЕРДИКТ ВАРТОВОГО", &verdict_line),
                    ("ОПОВІДЬ", &job.narrative),
                ],
            );
            if let Some(problem) = &issue {
                system.push_str(&format!(
                    "\n\nУВАГА: попередній план відхилено ({problem}). Склади валідний план."
                ));
            }

            let req = ChatRequest::new(
                &self.ctx.settings.thinker_model,
                system,
                format!("Повідомлення: {message_text}"),
            )
            .with_schema(plan_schema());

            let reply = match self.ctx.switchboard.call(&req).await {
                Ok(reply) => reply,
                Err(e) => {
                    warn!(uid = %job.message_uid, error = %e, "analyst call failed, using fallback plan");
                    break;
                }
            };

            match serde_json::from_str::<PlanDraft>(strip_fences(&reply.content)) {
                Ok(draft) => match validate_plan(&draft.tasks) {
                    Ok(()) => {
                        debug!(
                            uid = %job.message_uid,
                            intent = ?draft.intent,
                            tasks = draft.tasks.len(),
                            "plan accepted"
                        );
                        return Ok(AnalystSnapshot {
                            msg_uid: job.message_uid,
                            intent: draft.intent,
                            tasks: draft.tasks,
                            gate: job.gate_decision,
                            narrative: job.narrative.clone(),
                        });
                    }
                    Err(problem) => {
                        warn!(uid = %job.message_uid, attempt, %problem, "plan failed validation");
                        issue = Some(problem);
                    }
                },
                Err(e) => {
                    warn!(uid = %job.message_uid, attempt, error = %e, "plan is not valid JSON");
                    issue = Some(e.to_string());
                }
            }
        }

        metrics::incr(metrics::names::PLANS_INVALID_TOTAL);
        Ok(fallback_plan(job))
    }
}

/// JSON Schema handed to the Switchboard for early structural enforcement.
/// Semantic validation (DAG shape, reply leaf) still happens in
/// [`validate_plan`].
fn plan_schema() -> serde_json::Value {
    serde_json::json!({
        "type": "object",
        "required": ["intent", "tasks"],
        "properties": {
            "intent": { "type": "string" },
            "tasks": {
                "type": "array",
                "items": {
                    "type": "object",
                    "required": ["id", "action"],
                }
            }
        }
    })
}

/// Structural plan validation: unique ids, resolvable dependencies, acyclic,
/// and at least one `reply` leaf (a reply no other task depends on).
pub fn validate_plan(tasks: &[PlanTask]) -> std::result::Result<(), String> {
    if tasks.is_empty() {
        return Err("empty plan".to_string());
    }

    let mut ids = HashSet::new();
    for task in tasks {
        if !ids.insert(task.id) {
            return Err(format!("duplicate task id {}", task.id));
        }
    }

    for task in tasks {
        for dep in &task.depends_on {
            if !ids.contains(dep) {
                return Err(format!("task {} depends on unknown id {dep}", task.id));
            }
            if *dep == task.id {
                return Err(format!("task {} depends on itself", task.id));
            }
        }
    }

    // Kahn's algorithm: a leftover task means a cycle.
    let mut indegree: HashMap<u32, usize> =
        tasks.iter().map(|t| (t.id, t.depends_on.len())).collect();
    let mut queue: Vec<u32> = indegree
        .iter()
        .filter(|(_, d)| **d == 0)
        .map(|(id, _)| *id)
        .collect();
    let mut visited = 0;
    while let Some(id) = queue.pop() {
        visited += 1;
        for task in tasks {
            if task.depends_on.contains(&id) {
                let d = indegree.get_mut(&task.id).expect("id present");
                *d -= 1;
                if *d == 0 {
                    queue.push(task.id);
                }
            }
        }
    }
    if visited != tasks.len() {
        return Err("plan contains a dependency cycle".to_string());
    }

    let depended_on: HashSet<u32> = tasks.iter().flat_map(|t| t.depends_on.iter().copied()).collect();
    let has_reply_leaf = tasks
        .iter()
        .any(|t| t.action == TaskAction::Reply && !depended_on.contains(&t.id));
    if !has_reply_leaf {
        return Err("plan has no reply leaf".to_string());
    }

    Ok(())
}

/// The safe default when planning fails: apologize, nothing else.
pub fn fallback_plan(job: PlanningJob) -> AnalystSnapshot {
    AnalystSnapshot {
        msg_uid: job.message_uid,
        intent: Intent::SmallTalk,
        tasks: vec![PlanTask {
            id: 1,
            action: TaskAction::Reply,
            args: serde_json::json!({ "style": "apology" }),
            depends_on: Vec::new(),
        }],
        gate: job.gate_decision,
        narrative: job.narrative,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{ctx_with, scripted, Outcome};
    use kobzar_core::types::GateVerdict;
    use kobzar_graph::MockBackend;

    fn task(id: u32, action: TaskAction, deps: &[u32]) -> PlanTask {
        PlanTask {
            id,
            action,
            args: serde_json::Value::Null,
            depends_on: deps.to_vec(),
        }
    }

    fn job() -> PlanningJob {
        PlanningJob {
            message_uid: "1:100".parse().unwrap(),
            narrative: "розмова про docker".into(),
            gate_decision: GateVerdict::forced_direct(),
        }
    }

    #[test]
    fn accepts_search_then_reply() {
        let tasks = vec![
            task(1, TaskAction::SearchGraph, &[]),
            task(2, TaskAction::Reply, &[1]),
        ];
        assert!(validate_plan(&tasks).is_ok());
    }

    #[test]
    fn rejects_cycles() {
        let tasks = vec![
            task(1, TaskAction::SearchGraph, &[2]),
            task(2, TaskAction::Reply, &[1]),
        ];
        assert!(validate_plan(&tasks).unwrap_err().contains("cycle"));
    }

    #[test]
    fn rejects_unknown_dependency() {
        let tasks = vec![task(1, TaskAction::Reply, &[7])];
        assert!(validate_plan(&tasks).unwrap_err().contains("unknown id"));
    }

    #[test]
    fn rejects_plan_without_reply_leaf() {
        let tasks = vec![task(1, TaskAction::SearchGraph, &[])];
        assert!(validate_plan(&tasks).unwrap_err().contains("reply leaf"));

        // A reply that something depends on is not a leaf.
        let tasks = vec![
            task(1, TaskAction::Reply, &[]),
            task(2, TaskAction::RememberFact, &[1]),
        ];
        assert!(validate_plan(&tasks).is_err());
    }

    #[test]
    fn rejects_duplicate_ids_and_empty_plans() {
        assert!(validate_plan(&[]).is_err());
        let tasks = vec![task(1, TaskAction::Reply, &[]), task(1, TaskAction::Reply, &[])];
        assert!(validate_plan(&tasks).unwrap_err().contains("duplicate"));
    }

    const GOOD_PLAN: &str = r#"{"intent":"QUESTION","tasks":[
        {"id":1,"action":"search_graph","args":{"question":"який останній день?"}},
        {"id":2,"action":"reply","depends_on":[1]}
    ]}"#;

    #[tokio::test]
    async fn valid_plan_becomes_snapshot() {
        let backend = Arc::new(MockBackend::new());
        let ctx = ctx_with(backend, vec![scripted("ok", Outcome::Ok(GOOD_PLAN))]);
        let analyst = Analyst::new(ctx);

        let snapshot = analyst.plan(job()).await.unwrap();
        assert_eq!(snapshot.intent, Intent::Question);
        assert_eq!(snapshot.tasks.len(), 2);
        assert_eq!(snapshot.tasks[0].action, TaskAction::SearchGraph);
    }

    #[tokio::test]
    async fn unknown_action_retries_then_falls_back() {
        let backend = Arc::new(MockBackend::new());
        // `launch_missiles` is not in the closed action set: serde rejects it.
        let bad = r#"{"intent":"COMMAND","tasks":[{"id":1,"action":"launch_missiles"}]}"#;
        let provider = scripted("bad", Outcome::Ok(bad));
        let ctx = ctx_with(backend, vec![provider.clone()]);
        let analyst = Analyst::new(ctx);

        let before = metrics::get(metrics::names::PLANS_INVALID_TOTAL);
        let snapshot = analyst.plan(job()).await.unwrap();
        assert_eq!(provider.calls(), 2);
        assert_eq!(metrics::get(metrics::names::PLANS_INVALID_TOTAL), before + 1);

        // Fallback: single apology reply.
        assert_eq!(snapshot.tasks.len(), 1);
        assert_eq!(snapshot.tasks[0].action, TaskAction::Reply);
        assert_eq!(snapshot.tasks[0].args["style"], "apology");
    }

    #[tokio::test]
    async fn invalid_then_valid_plan_succeeds_on_retry() {
        let backend = Arc::new(MockBackend::new());
        let cyclic = r#"{"intent":"QUESTION","tasks":[
            {"id":1,"action":"search_graph","depends_on":[2]},
            {"id":2,"action":"reply","depends_on":[1]}
        ]}"#;
        let provider = scripted("flaky", Outcome::Seq(vec![cyclic, GOOD_PLAN]));
        let ctx = ctx_with(backend, vec![provider.clone()]);
        let analyst = Analyst::new(ctx);

        let snapshot = analyst.plan(job()).await.unwrap();
        assert_eq!(snapshot.tasks.len(), 2);
        assert_eq!(provider.calls(), 2);
    }
}
