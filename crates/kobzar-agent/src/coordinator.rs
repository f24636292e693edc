//! Plan execution: DAG scheduling, soft deadlines, mid-stream interruption,
//! and the WORKING_ON lifecycle.
//!
//! One plan runs per chat at a time. A newer snapshot for the same chat
//! cancels the in-flight one cooperatively; already-committed graph writes
//! stand. Individual task timeouts never fail the plan — the task's output
//! becomes an empty result that downstream tasks still see.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use kobzar_core::metrics;
use kobzar_core::types::{
    AnalystSnapshot, ContextBundle, MessageUid, PlanTask, TaskAction, ToolOutput, ToolStatus,
};

use crate::context::PipelineContext;
use crate::error::StageError;
use crate::researcher::Researcher;

/// External web retrieval boundary. The scraping service lives outside this
/// process; `None` (no service wired) makes `search_web` tasks fail softly.
#[async_trait]
pub trait WebSearch: Send + Sync {
    async fn search(&self, query: &str) -> Result<String, String>;
}

struct ActivePlan {
    uid: MessageUid,
    token: CancellationToken,
}

enum TaskRun {
    Finished(ToolOutput),
    TimedOut(u32, TaskAction),
    Cancelled,
}

pub struct Coordinator {
    ctx: Arc<PipelineContext>,
    researcher: Arc<Researcher>,
    web: Option<Arc<dyn WebSearch>>,
    /// chat_id → in-flight plan. Insertion supersedes (cancels) the previous.
    active: DashMap<i64, ActivePlan>,
    /// Which plan currently owns the agent-wide WORKING_ON edge.
    lock_owner: tokio::sync::Mutex<Option<MessageUid>>,
}

impl Coordinator {
    pub fn new(ctx: Arc<PipelineContext>, web: Option<Arc<dyn WebSearch>>) -> Arc<Self> {
        Arc::new(Self {
            researcher: Arc::new(Researcher::new(ctx.clone())),
            ctx,
            web,
            active: DashMap::new(),
            lock_owner: tokio::sync::Mutex::new(None),
        })
    }

    /// Execute one snapshot to completion, supersession, or interruption.
    ///
    /// Returns `None` when the plan was superseded — only the newest plan's
    /// reply may reach the Responder.
    pub async fn execute(self: &Arc<Self>, snapshot: AnalystSnapshot) -> Option<ContextBundle> {
        let chat_id = snapshot.chat_id();
        let uid = snapshot.msg_uid;
        let token = CancellationToken::new();
        let started_at = Utc::now().timestamp();

        // Initial: take the chat slot, cancelling whoever held it.
        if let Some(prev) = self.active.insert(
            chat_id,
            ActivePlan {
                uid,
                token: token.clone(),
            },
        ) {
            info!(chat_id, old = %prev.uid, new = %uid, "superseding in-flight plan");
            prev.token.cancel();
        }

        // Acquire the agent-wide lock: the newer intent replaces the Task node.
        if let Err(e) = self
            .ctx
            .store
            .set_working_on(&format!("відповідь на повідомлення {uid}"))
            .await
        {
            warn!(%uid, error = %e, "failed to record WORKING_ON");
        }
        *self.lock_owner.lock().await = Some(uid);

        let outputs = self.run_plan(&snapshot, &token, started_at).await;

        match outputs {
            Some(outputs) => {
                // Terminal.
                self.release(chat_id, uid).await;
                Some(ContextBundle { snapshot, outputs })
            }
            None => {
                // Cancelled or superseded mid-run.
                self.release(chat_id, uid).await;
                None
            }
        }
    }

    /// Drop the chat slot and the WORKING_ON edge — but only if this plan
    /// still owns them. A superseding plan has already replaced both.
    async fn release(&self, chat_id: i64, uid: MessageUid) {
        let owns_slot = self
            .active
            .get(&chat_id)
            .map(|p| p.uid == uid)
            .unwrap_or(false);
        if owns_slot {
            self.active.remove(&chat_id);
        }

        let mut owner = self.lock_owner.lock().await;
        if *owner == Some(uid) {
            *owner = None;
            drop(owner);
            if let Err(e) = self.ctx.store.clear_working_on().await {
                warn!(%uid, error = %e, "failed to clear WORKING_ON");
            }
        }
    }

    /// Running + MidCheck. Returns the tool outputs, or `None` when the plan
    /// must not reach the Responder.
    async fn run_plan(
        self: &Arc<Self>,
        snapshot: &AnalystSnapshot,
        token: &CancellationToken,
        started_at: i64,
    ) -> Option<Vec<ToolOutput>> {
        // Reply tasks are the Responder's; they satisfy dependencies as-is.
        let mut done: HashSet<u32> = snapshot
            .tasks
            .iter()
            .filter(|t| t.action == TaskAction::Reply)
            .map(|t| t.id)
            .collect();
        let mut outputs: BTreeMap<u32, ToolOutput> = BTreeMap::new();

        loop {
            if token.is_cancelled() {
                debug!(uid = %snapshot.msg_uid, "plan cancelled between waves");
                return None;
            }

            let ready: Vec<PlanTask> = snapshot
                .tasks
                .iter()
                .filter(|t| {
                    t.action != TaskAction::Reply
                        && !done.contains(&t.id)
                        && t.depends_on.iter().all(|d| done.contains(d))
                })
                .cloned()
                .collect();
            if ready.is_empty() {
                break;
            }

            // Independent leaves run in parallel.
            let mut wave = JoinSet::new();
            for task in ready {
                let this = Arc::clone(self);
                let snapshot = snapshot.clone();
                let dep_context = task
                    .depends_on
                    .iter()
                    .filter_map(|d| outputs.get(d))
                    .map(|o| o.content.clone())
                    .collect::<Vec<_>>()
                    .join("\n");
                let token = token.clone();
                let timeout = this.ctx.settings.task_timeout;
                wave.spawn(async move {
                    tokio::select! {
                        _ = token.cancelled() => TaskRun::Cancelled,
                        finished = tokio::time::timeout(
                            timeout,
                            this.run_task(&task, &snapshot, &dep_context),
                        ) => match finished {
                            Ok(output) => TaskRun::Finished(output),
                            Err(_) => TaskRun::TimedOut(task.id, task.action),
                        },
                    }
                });
            }

            let mut cancelled = false;
            while let Some(joined) = wave.join_next().await {
                match joined {
                    Ok(TaskRun::Finished(output)) => {
                        done.insert(output.task_id);
                        outputs.insert(output.task_id, output);
                    }
                    Ok(TaskRun::TimedOut(task_id, action)) => {
                        // Soft deadline: the plan goes on with an empty result.
                        metrics::incr(metrics::names::TASKS_TIMED_OUT_TOTAL);
                        warn!(uid = %snapshot.msg_uid, task_id, %action, "task timed out");
                        done.insert(task_id);
                        outputs.insert(
                            task_id,
                            ToolOutput::empty(task_id, action, ToolStatus::TimedOut),
                        );
                    }
                    Ok(TaskRun::Cancelled) => cancelled = true,
                    Err(e) => {
                        warn!(uid = %snapshot.msg_uid, error = %e, "task join failed");
                    }
                }
            }
            if cancelled {
                return None;
            }
        }

        // MidCheck: a user message in this chat since the plan started means
        // a newer plan is on its way — its reply wins, ours is dropped.
        match self
            .ctx
            .store
            .messages_since(snapshot.chat_id(), started_at)
            .await
        {
            Ok(newer) if newer.iter().any(|u| *u != snapshot.msg_uid) => {
                info!(uid = %snapshot.msg_uid, "late-arriving input detected, dropping plan");
                return None;
            }
            Ok(_) => {}
            Err(e) => {
                warn!(uid = %snapshot.msg_uid, error = %e, "midcheck poll failed, finalizing anyway");
            }
        }

        // Finalizing.
        Some(outputs.into_values().collect())
    }

    async fn run_task(
        &self,
        task: &PlanTask,
        snapshot: &AnalystSnapshot,
        dep_context: &str,
    ) -> ToolOutput {
        match task.action {
            TaskAction::SearchGraph => {
                let question = string_arg(&task.args, &["question", "query"])
                    .unwrap_or_else(|| snapshot.narrative.clone());
                let question = if dep_context.is_empty() {
                    question
                } else {
                    format!("{question}\n\nВідомо з попередніх кроків:\n{dep_context}")
                };
                match self.researcher.investigate(&question).await {
                    Ok(summary) => ToolOutput::done(task.id, task.action, summary),
                    Err(StageError::Rejected(reason)) => {
                        warn!(task_id = task.id, %reason, "research query rejected");
                        ToolOutput::empty(task.id, task.action, ToolStatus::Rejected)
                    }
                    Err(e) => {
                        warn!(task_id = task.id, error = %e, "graph search failed");
                        ToolOutput::empty(task.id, task.action, ToolStatus::Failed)
                    }
                }
            }
            TaskAction::SearchWeb => {
                let query = string_arg(&task.args, &["query", "question"])
                    .unwrap_or_else(|| snapshot.narrative.clone());
                match &self.web {
                    Some(web) => match web.search(&query).await {
                        Ok(found) => ToolOutput::done(task.id, task.action, found),
                        Err(reason) => {
                            warn!(task_id = task.id, %reason, "web search failed");
                            ToolOutput::empty(task.id, task.action, ToolStatus::Failed)
                        }
                    },
                    None => {
                        debug!(task_id = task.id, "no web search service wired");
                        ToolOutput::empty(task.id, task.action, ToolStatus::Failed)
                    }
                }
            }
            TaskAction::FetchUserProfile => {
                let Some(telegram_id) = task.args.get("telegram_id").and_then(|v| v.as_i64())
                else {
                    return ToolOutput::empty(task.id, task.action, ToolStatus::Failed);
                };
                match self.ctx.store.user_profile(telegram_id).await {
                    Ok(Some(user)) => ToolOutput::done(
                        task.id,
                        task.action,
                        format!(
                            "Ім'я: {}{}. Повідомлень у пам'яті: {}.",
                            user.name,
                            user.username
                                .map(|u| format!(" (@{u})"))
                                .unwrap_or_default(),
                            user.message_count
                        ),
                    ),
                    Ok(None) => ToolOutput::done(
                        task.id,
                        task.action,
                        "Такого користувача в пам'яті немає.".to_string(),
                    ),
                    Err(e) => {
                        warn!(task_id = task.id, error = %e, "profile fetch failed");
                        ToolOutput::empty(task.id, task.action, ToolStatus::Failed)
                    }
                }
            }
            TaskAction::RememberFact => {
                let name = string_arg(&task.args, &["name", "subject"]);
                let detail = string_arg(&task.args, &["fact", "detail", "content"]);
                match (name, detail) {
                    (Some(name), Some(detail)) => {
                        match self.ctx.store.remember_fact(&name, &detail).await {
                            Ok(()) => ToolOutput::done(task.id, task.action, "Запам'ятав."),
                            Err(e) => {
                                warn!(task_id = task.id, error = %e, "remember_fact failed");
                                ToolOutput::empty(task.id, task.action, ToolStatus::Failed)
                            }
                        }
                    }
                    _ => ToolOutput::empty(task.id, task.action, ToolStatus::Failed),
                }
            }
            // Filtered out before scheduling.
            TaskAction::Reply => ToolOutput::empty(task.id, task.action, ToolStatus::Done),
        }
    }
}

fn string_arg(args: &serde_json::Value, keys: &[&str]) -> Option<String> {
    keys.iter()
        .find_map(|k| args.get(k).and_then(|v| v.as_str()))
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{ctx_with, scripted, Outcome};
    use kobzar_core::types::{GateVerdict, Intent};
    use kobzar_graph::{MockBackend, ResultSet, Scalar};
    use std::time::Duration;

    fn snapshot(uid: &str, tasks: Vec<PlanTask>) -> AnalystSnapshot {
        AnalystSnapshot {
            msg_uid: uid.parse().unwrap(),
            intent: Intent::Question,
            tasks,
            gate: GateVerdict::forced_direct(),
            narrative: "щось відбувається".into(),
        }
    }

    fn task(id: u32, action: TaskAction, args: serde_json::Value, deps: &[u32]) -> PlanTask {
        PlanTask {
            id,
            action,
            args,
            depends_on: deps.to_vec(),
        }
    }

    struct SlowWeb(Duration);

    #[async_trait]
    impl WebSearch for SlowWeb {
        async fn search(&self, _query: &str) -> Result<String, String> {
            tokio::time::sleep(self.0).await;
            Ok("знайшов щось у вебі".to_string())
        }
    }

    #[tokio::test]
    async fn plan_executes_and_cleans_working_on() {
        let backend = Arc::new(MockBackend::new());
        let ctx = ctx_with(backend.clone(), vec![scripted("idle", Outcome::Fatal)]);
        let coordinator = Coordinator::new(ctx, None);

        let plan = snapshot(
            "1:100",
            vec![
                task(
                    1,
                    TaskAction::RememberFact,
                    serde_json::json!({"name": "deploy", "fact": "радять docker compose"}),
                    &[],
                ),
                task(2, TaskAction::Reply, serde_json::Value::Null, &[1]),
            ],
        );
        let bundle = coordinator.execute(plan).await.expect("bundle");

        assert_eq!(bundle.outputs.len(), 1);
        assert_eq!(bundle.outputs[0].status, ToolStatus::Done);

        let queries = backend.executed_on("PrimaryMemory");
        assert!(queries.iter().any(|q| q.contains("WORKING_ON")));
        // Lock acquired, then released at Terminal.
        assert!(queries
            .iter()
            .any(|q| q.contains("[:WORKING_ON]->(t:Task) DETACH DELETE t")));
        assert!(queries
            .iter()
            .any(|q| q.contains("MERGE (e:Entity {name: 'deploy'})")));
    }

    #[tokio::test]
    async fn task_timeout_does_not_fail_the_plan() {
        let backend = Arc::new(MockBackend::new());
        let ctx = ctx_with(backend, vec![scripted("idle", Outcome::Fatal)]);
        // Web search sleeps past the 200ms test deadline.
        let coordinator = Coordinator::new(
            ctx,
            Some(Arc::new(SlowWeb(Duration::from_secs(5))) as Arc<dyn WebSearch>),
        );

        let before = metrics::get(metrics::names::TASKS_TIMED_OUT_TOTAL);
        let plan = snapshot(
            "1:100",
            vec![
                task(1, TaskAction::SearchWeb, serde_json::json!({"query": "x"}), &[]),
                task(2, TaskAction::Reply, serde_json::Value::Null, &[1]),
            ],
        );
        let bundle = coordinator.execute(plan).await.expect("bundle");

        assert_eq!(bundle.outputs.len(), 1);
        assert_eq!(bundle.outputs[0].status, ToolStatus::TimedOut);
        assert!(bundle.outputs[0].content.is_empty());
        assert_eq!(metrics::get(metrics::names::TASKS_TIMED_OUT_TOTAL), before + 1);
    }

    #[tokio::test]
    async fn newer_snapshot_supersedes_the_running_plan() {
        let backend = Arc::new(MockBackend::new());
        let ctx = ctx_with(backend, vec![scripted("idle", Outcome::Fatal)]);
        let coordinator = Coordinator::new(
            ctx,
            Some(Arc::new(SlowWeb(Duration::from_millis(120))) as Arc<dyn WebSearch>),
        );

        // P1 busy with a slow web task (inside the 200ms deadline).
        let p1 = snapshot(
            "1:100",
            vec![
                task(1, TaskAction::SearchWeb, serde_json::json!({"query": "a"}), &[]),
                task(2, TaskAction::Reply, serde_json::Value::Null, &[1]),
            ],
        );
        let c1 = coordinator.clone();
        let running = tokio::spawn(async move { c1.execute(p1).await });

        tokio::time::sleep(Duration::from_millis(30)).await;

        // P2 for the same chat arrives mid-flight.
        let p2 = snapshot(
            "1:101",
            vec![task(1, TaskAction::Reply, serde_json::Value::Null, &[])],
        );
        let b2 = coordinator.execute(p2).await;

        assert!(b2.is_some(), "newest plan completes");
        assert!(running.await.unwrap().is_none(), "superseded plan yields nothing");
    }

    #[tokio::test]
    async fn midcheck_drops_the_plan_when_new_input_arrived() {
        let backend = Arc::new(MockBackend::new());
        backend.script(
            "WHERE m.created_at >=",
            ResultSet::table(&["m.uid"], vec![vec![Scalar::Text("1:105".into())]]),
        );
        let ctx = ctx_with(backend.clone(), vec![scripted("idle", Outcome::Fatal)]);
        let coordinator = Coordinator::new(ctx, None);

        let plan = snapshot(
            "1:100",
            vec![task(1, TaskAction::Reply, serde_json::Value::Null, &[])],
        );
        assert!(coordinator.execute(plan).await.is_none());

        // WORKING_ON still cleaned up on the dropped path.
        let queries = backend.executed_on("PrimaryMemory");
        assert!(queries
            .iter()
            .any(|q| q.contains("[:WORKING_ON]->(t:Task) DETACH DELETE t")));
    }

    #[tokio::test]
    async fn dependent_task_sees_dependency_output() {
        let backend = Arc::new(MockBackend::new());
        backend.script(
            "MATCH (u:User {telegram_id: 42})",
            ResultSet::table(
                &["u.name", "u.username", "count(m)"],
                vec![vec![
                    Scalar::Text("Bohdan".into()),
                    Scalar::Text("bohdan".into()),
                    Scalar::Int(17),
                ]],
            ),
        );
        let ctx = ctx_with(backend, vec![scripted("idle", Outcome::Fatal)]);
        let coordinator = Coordinator::new(ctx, None);

        let plan = snapshot(
            "1:100",
            vec![
                task(
                    1,
                    TaskAction::FetchUserProfile,
                    serde_json::json!({"telegram_id": 42}),
                    &[],
                ),
                task(
                    2,
                    TaskAction::RememberFact,
                    serde_json::json!({"name": "bohdan", "fact": "активний співрозмовник"}),
                    &[1],
                ),
                task(3, TaskAction::Reply, serde_json::Value::Null, &[2]),
            ],
        );
        let bundle = coordinator.execute(plan).await.expect("bundle");
        assert_eq!(bundle.outputs.len(), 2);
        assert!(bundle.outputs[0].content.contains("Bohdan"));
        assert_eq!(bundle.outputs[1].status, ToolStatus::Done);
    }
}
