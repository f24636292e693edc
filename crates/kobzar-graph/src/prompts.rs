//! The prompt-assembly subgraph: Role → Task → Protocol/Instruction → Rule.
//!
//! Reads return a [`RoleBundle`] the assembler renders into a system prompt;
//! writes (seeding) are idempotent MERGEs and bump the store's prompt
//! generation so cached prompts are invalidated.

use tracing::info;

use crate::error::{GraphError, Result};
use crate::query::lit;
use crate::store::GraphStore;

/// Everything the assembler needs for one `(role, task)` pair.
#[derive(Debug, Clone, PartialEq)]
pub struct RoleBundle {
    pub role_name: String,
    pub role_description: String,
    pub task_name: String,
    pub task_description: String,
    /// Instruction contents, ordered by instruction name.
    pub instructions: Vec<String>,
    /// Rule contents, stable-sorted by rule name.
    pub rules: Vec<String>,
}

/// Seed data for one Role subtree. The daemon's `seed-prompts` command and
/// the assembler's static fallback share these structures.
#[derive(Debug, Clone)]
pub struct RoleSeed {
    pub name: &'static str,
    /// Ukrainian — all natural-language prompt content is uk.
    pub description: &'static str,
    pub tasks: Vec<TaskSeed>,
}

#[derive(Debug, Clone)]
pub struct TaskSeed {
    pub name: &'static str,
    pub description: &'static str,
    /// Protocol name grouping the instructions; `None` links Task-FOLLOWS->Instruction directly.
    pub protocol: Option<&'static str>,
    pub instructions: Vec<InstructionSeed>,
}

#[derive(Debug, Clone)]
pub struct InstructionSeed {
    pub name: &'static str,
    pub content: &'static str,
    pub rules: Vec<RuleSeed>,
}

#[derive(Debug, Clone)]
pub struct RuleSeed {
    pub name: &'static str,
    pub content: &'static str,
}

impl GraphStore {
    /// Fetch the subgraph for `(role, task?)`.
    ///
    /// Returns `Ok(None)` when the Role node doesn't exist (the assembler
    /// falls back to its static default). A missing `task` name picks the
    /// single responsible Task; several candidates without a name is an
    /// [`GraphError::Ambiguous`].
    pub async fn fetch_role_bundle(
        &self,
        role: &str,
        task: Option<&str>,
    ) -> Result<Option<RoleBundle>> {
        let role_lit = lit(role);
        let rs = self
            .backend()
            .execute(
                self.graph_name(),
                &format!("MATCH (r:Role {{name: {role_lit}}}) RETURN r.name, r.description"),
            )
            .await?;
        let Some(role_row) = rs.rows.first() else {
            return Ok(None);
        };
        let role_description = role_row
            .get(1)
            .and_then(|s| s.as_str())
            .unwrap_or_default()
            .to_string();

        let tasks = self
            .backend()
            .execute(
                self.graph_name(),
                &format!(
                    "MATCH (:Role {{name: {role_lit}}})-[:RESPONSIBLE_FOR]->(t:Task) \
                     RETURN t.name, t.description ORDER BY t.name"
                ),
            )
            .await?;

        let (task_name, task_description) = match task {
            Some(wanted) => tasks
                .rows
                .iter()
                .find(|r| r.first().and_then(|s| s.as_str()) == Some(wanted))
                .map(|r| row_pair(r))
                .ok_or_else(|| GraphError::NotFound(format!("task '{wanted}' of role '{role}'")))?,
            None => match tasks.rows.len() {
                0 => return Err(GraphError::NotFound(format!("role '{role}' has no tasks"))),
                1 => row_pair(&tasks.rows[0]),
                n => {
                    return Err(GraphError::Ambiguous(format!(
                        "role '{role}' has {n} tasks, task name required"
                    )))
                }
            },
        };

        let task_lit = lit(&task_name);
        let instructions_rs = self
            .backend()
            .execute(
                self.graph_name(),
                &format!(
                    "MATCH (t:Task {{name: {task_lit}}}) \
                     OPTIONAL MATCH (t)-[:FOLLOWS_PROTOCOL]->(:Protocol)-[:COMPOSED_OF]->(pi:Instruction) \
                     OPTIONAL MATCH (t)-[:FOLLOWS]->(di:Instruction) \
                     RETURN pi.name, pi.content, di.name, di.content"
                ),
            )
            .await?;

        // Either column pair may be populated; collect both, order by name.
        let mut named: Vec<(String, String)> = Vec::new();
        for row in &instructions_rs.rows {
            for offset in [0, 2] {
                if let (Some(name), Some(content)) = (
                    row.get(offset).and_then(|s| s.as_str()),
                    row.get(offset + 1).and_then(|s| s.as_str()),
                ) {
                    let pair = (name.to_string(), content.to_string());
                    if !named.contains(&pair) {
                        named.push(pair);
                    }
                }
            }
        }
        named.sort();

        let mut rules: Vec<(String, String)> = Vec::new();
        for (instruction_name, _) in &named {
            let rs = self
                .backend()
                .execute(
                    self.graph_name(),
                    &format!(
                        "MATCH (:Instruction {{name: {}}})-[:ENFORCES]->(ru:Rule) \
                         RETURN ru.name, ru.content ORDER BY ru.name",
                        lit(instruction_name)
                    ),
                )
                .await?;
            for row in &rs.rows {
                let pair = row_pair(row);
                if !rules.contains(&pair) {
                    rules.push(pair);
                }
            }
        }
        rules.sort();

        Ok(Some(RoleBundle {
            role_name: role.to_string(),
            role_description,
            task_name,
            task_description,
            instructions: named.into_iter().map(|(_, content)| content).collect(),
            rules: rules.into_iter().map(|(_, content)| content).collect(),
        }))
    }

    /// Write the default prompt atoms into the graph. Every statement is a
    /// MERGE — re-seeding is a no-op. Bumps the prompt generation.
    pub async fn seed_prompts(&self, seeds: &[RoleSeed]) -> Result<()> {
        for role in seeds {
            let role_lit = lit(role.name);
            self.backend()
                .execute(
                    self.graph_name(),
                    &format!(
                        "MERGE (r:Role {{name: {role_lit}}}) \
                         SET r.description = {}, r.language = 'uk' \
                         MERGE (a:Agent {{telegram_id: {}}}) \
                         ON CREATE SET a.name = {} \
                         MERGE (a)-[:PLAYS_ROLE]->(r)",
                        lit(role.description),
                        self.agent().telegram_id,
                        lit(&self.agent().name),
                    ),
                )
                .await?;

            for task in &role.tasks {
                let task_lit = lit(task.name);
                self.backend()
                    .execute(
                        self.graph_name(),
                        &format!(
                            "MATCH (r:Role {{name: {role_lit}}}) \
                             MERGE (t:Task {{name: {task_lit}}}) \
                             SET t.description = {}, t.language = 'uk' \
                             MERGE (r)-[:RESPONSIBLE_FOR]->(t)",
                            lit(task.description),
                        ),
                    )
                    .await?;

                for instruction in &task.instructions {
                    let instr_lit = lit(instruction.name);
                    let link = match task.protocol {
                        Some(protocol) => format!(
                            "MATCH (t:Task {{name: {task_lit}}}) \
                             MERGE (p:Protocol {{name: {proto}}}) \
                             SET p.language = 'uk' \
                             MERGE (t)-[:FOLLOWS_PROTOCOL]->(p) \
                             MERGE (i:Instruction {{name: {instr_lit}}}) \
                             SET i.content = {content}, i.language = 'uk' \
                             MERGE (p)-[:COMPOSED_OF]->(i)",
                            proto = lit(protocol),
                            content = lit(instruction.content),
                        ),
                        None => format!(
                            "MATCH (t:Task {{name: {task_lit}}}) \
                             MERGE (i:Instruction {{name: {instr_lit}}}) \
                             SET i.content = {content}, i.language = 'uk' \
                             MERGE (t)-[:FOLLOWS]->(i)",
                            content = lit(instruction.content),
                        ),
                    };
                    self.backend().execute(self.graph_name(), &link).await?;

                    for rule in &instruction.rules {
                        self.backend()
                            .execute(
                                self.graph_name(),
                                &format!(
                                    "MATCH (i:Instruction {{name: {instr_lit}}}) \
                                     MERGE (ru:Rule {{name: {}}}) \
                                     SET ru.content = {}, ru.language = 'uk' \
                                     MERGE (i)-[:ENFORCES]->(ru)",
                                    lit(rule.name),
                                    lit(rule.content),
                                ),
                            )
                            .await?;
                    }
                }
            }
        }

        self.bump_prompt_generation();
        info!(roles = seeds.len(), "prompt subgraph seeded");
        Ok(())
    }
}

fn row_pair(row: &[crate::value::Scalar]) -> (String, String) {
    (
        row.first()
            .and_then(|s| s.as_str())
            .unwrap_or_default()
            .to_string(),
        row.get(1)
            .and_then(|s| s.as_str())
            .unwrap_or_default()
            .to_string(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MockBackend;
    use crate::value::{ResultSet, Scalar};
    use kobzar_core::config::AgentIdentity;
    use std::sync::Arc;

    fn store(backend: Arc<MockBackend>) -> GraphStore {
        GraphStore::new(
            backend,
            "PrimaryMemory",
            AgentIdentity {
                telegram_id: 999,
                name: "Кобзар".into(),
            },
        )
    }

    fn text(s: &str) -> Scalar {
        Scalar::Text(s.into())
    }

    #[tokio::test]
    async fn missing_role_is_none() {
        let backend = Arc::new(MockBackend::new());
        let s = store(backend);
        assert!(s.fetch_role_bundle("Gatekeeper", None).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn bundle_is_assembled_and_sorted() {
        let backend = Arc::new(MockBackend::new());
        backend.script(
            "MATCH (r:Role {name: 'Thinker'})",
            ResultSet::table(
                &["r.name", "r.description"],
                vec![vec![text("Thinker"), text("Аналітик розмови")]],
            ),
        );
        backend.script(
            "[:RESPONSIBLE_FOR]->(t:Task)",
            ResultSet::table(
                &["t.name", "t.description"],
                vec![vec![text("SemanticAnalysis"), text("Семантичний аналіз")]],
            ),
        );
        backend.script(
            "OPTIONAL MATCH (t)-[:FOLLOWS_PROTOCOL]",
            ResultSet::table(
                &["pi.name", "pi.content", "di.name", "di.content"],
                vec![
                    vec![Scalar::Null, Scalar::Null, text("B-format"), text("Відповідай JSON")],
                    vec![Scalar::Null, Scalar::Null, text("A-analyse"), text("Аналізуй тему")],
                ],
            ),
        );
        backend.script(
            "[:ENFORCES]->(ru:Rule)",
            ResultSet::table(
                &["ru.name", "ru.content"],
                vec![vec![text("R1"), text("Без вигадок")]],
            ),
        );

        let s = store(backend);
        let bundle = s
            .fetch_role_bundle("Thinker", None)
            .await
            .unwrap()
            .expect("bundle");

        assert_eq!(bundle.task_name, "SemanticAnalysis");
        // Ordered by instruction name: A-analyse before B-format.
        assert_eq!(bundle.instructions, vec!["Аналізуй тему", "Відповідай JSON"]);
        assert_eq!(bundle.rules, vec!["Без вигадок"]);
    }

    #[tokio::test]
    async fn ambiguous_tasks_require_a_name() {
        let backend = Arc::new(MockBackend::new());
        backend.script(
            "MATCH (r:Role {name: 'Responder'})",
            ResultSet::table(&["r.name", "r.description"], vec![vec![text("Responder"), text("x")]]),
        );
        backend.script(
            "[:RESPONSIBLE_FOR]->(t:Task)",
            ResultSet::table(
                &["t.name", "t.description"],
                vec![
                    vec![text("ComposeReply"), text("a")],
                    vec![text("Summarize"), text("b")],
                ],
            ),
        );
        let s = store(backend);
        assert!(matches!(
            s.fetch_role_bundle("Responder", None).await,
            Err(GraphError::Ambiguous(_))
        ));
        let bundle = s
            .fetch_role_bundle("Responder", Some("ComposeReply"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(bundle.task_description, "a");
    }

    #[tokio::test]
    async fn seeding_merges_and_bumps_generation() {
        let backend = Arc::new(MockBackend::new());
        let s = store(backend.clone());
        let before = s.prompt_generation();

        let seeds = vec![RoleSeed {
            name: "Gatekeeper",
            description: "Вартовий потоку повідомлень",
            tasks: vec![TaskSeed {
                name: "Triage",
                description: "Швидка класифікація",
                protocol: Some("ClassifyMessage"),
                instructions: vec![InstructionSeed {
                    name: "JSONFormat",
                    content: "Відповідай лише валідним JSON",
                    rules: vec![RuleSeed {
                        name: "IdentityTarget",
                        content: "Визнач адресата",
                    }],
                }],
            }],
        }];
        s.seed_prompts(&seeds).await.unwrap();

        assert_eq!(s.prompt_generation(), before + 1);
        let queries = backend.executed_on("PrimaryMemory");
        assert!(queries.iter().any(|q| q.contains("MERGE (r:Role {name: 'Gatekeeper'})")));
        assert!(queries.iter().any(|q| q.contains("MERGE (t)-[:FOLLOWS_PROTOCOL]->(p)")));
        assert!(queries.iter().any(|q| q.contains("MERGE (i)-[:ENFORCES]->(ru)")));
        // Idempotent: all writes are MERGE/SET, no CREATE.
        assert!(queries.iter().all(|q| !q.contains("CREATE (")));
    }
}
