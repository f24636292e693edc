//! Statically compiled prompt atoms — the bootstrap content.
//!
//! The graph is authoritative: `seed-prompts` writes exactly these atoms into
//! the prompt subgraph, and the assembler renders from the graph when it can.
//! When the subgraph is empty (fresh deployment) the assembler renders the
//! same atoms from here, so both paths produce identical prompts.
//!
//! All natural-language content is Ukrainian; identifiers stay English.

use kobzar_graph::{InstructionSeed, RoleBundle, RoleSeed, RuleSeed, TaskSeed};

/// Canonical role names used across the pipeline.
pub mod roles {
    pub const GATEKEEPER: &str = "Gatekeeper";
    pub const THINKER: &str = "Thinker";
    pub const ANALYST: &str = "Analyst";
    pub const RESPONDER: &str = "Responder";
    pub const RESEARCHER: &str = "Researcher";
}

/// Canonical task names.
pub mod tasks {
    pub const TRIAGE: &str = "Triage";
    pub const SEMANTIC_ANALYSIS: &str = "SemanticAnalysis";
    pub const FORMULATE_PLAN: &str = "FormulatePlan";
    pub const COMPOSE_REPLY: &str = "ComposeReply";
    pub const GRAPH_SEARCH: &str = "GraphSearch";
}

/// The full default prompt subgraph.
pub fn prompt_seeds() -> Vec<RoleSeed> {
    vec![
        RoleSeed {
            name: roles::GATEKEEPER,
            description: "Вартовий вхідного потоку повідомлень. Швидко й дешево вирішує, \
                          чи стосується повідомлення агента і якої глибини обробки воно потребує.",
            tasks: vec![TaskSeed {
                name: tasks::TRIAGE,
                description: "Класифікуй повідомлення: адресат, потрібна глибина аналізу, тон відповіді.",
                protocol: Some("ClassifyMessage"),
                instructions: vec![InstructionSeed {
                    name: "TriageSteps",
                    content: "Прочитай повідомлення та останні репліки розмови. Визнач, кому воно \
                              адресоване, чи потрібна відповідь і яким тоном її давати.",
                    rules: vec![
                        RuleSeed {
                            name: "AssessDepth",
                            content: "QUICK_REPLY — для привітань і простих реплік. DEEP_ANALYSIS — \
                                      для запитань, що потребують пам'яті чи пошуку. SKIP — коли \
                                      відповідати не треба.",
                        },
                        RuleSeed {
                            name: "IdentityTarget",
                            content: "Якщо в тексті прямо названо агента — адресат DIRECT. Якщо \
                                      звертаються до іншого користувача — OTHER_USER. Загальна \
                                      розмова — CONTEXTUAL, шум без адресата — NOBODY.",
                        },
                        RuleSeed {
                            name: "JSONFormat",
                            content: "Відповідай лише одним JSON-об'єктом \
                                      {\"target\": ..., \"required_depth\": ..., \"tone_hint\": ...} \
                                      без пояснень і без markdown.",
                        },
                    ],
                }],
            }],
        },
        RoleSeed {
            name: roles::THINKER,
            description: "Аналітик розмови. Виділяє теми та сутності й веде коротку розповідь \
                          про те, що відбувається в чаті.",
            tasks: vec![TaskSeed {
                name: tasks::SEMANTIC_ANALYSIS,
                description: "Проаналізуй повідомлення в контексті останніх реплік та активних тем.",
                protocol: None,
                instructions: vec![InstructionSeed {
                    name: "ThinkerJSONFormat",
                    content: "Відповідай одним JSON-об'єктом: {\"msg_uid\": \"...\", \
                              \"topics\": [{\"title\": \"...\", \"is_new\": true}], \
                              \"entities\": [{\"name\": \"...\", \"type\": \"...\"}], \
                              \"narrative\": \"...\"}.",
                    rules: vec![RuleSeed {
                        name: "ThinkerAnalysisRules",
                        content: "Теми називай коротко, в називному відмінку. Тип сутності — один із \
                                  Technology, Person, Concept, Tool. narrative — одне-два речення \
                                  українською про поточну ситуацію в розмові.",
                    }],
                }],
            }],
        },
        RoleSeed {
            name: roles::ANALYST,
            description: "Планувальник. Перетворює намір співрозмовника на виконуваний план задач.",
            tasks: vec![TaskSeed {
                name: tasks::FORMULATE_PLAN,
                description: "Визнач намір повідомлення і склади план дій для відповіді.",
                protocol: None,
                instructions: vec![InstructionSeed {
                    name: "PlanJSONFormat",
                    content: "Відповідай одним JSON-об'єктом: {\"intent\": \"...\", \
                              \"tasks\": [{\"id\": 1, \"action\": \"...\", \"args\": {}, \
                              \"depends_on\": []}]}.",
                    rules: vec![
                        RuleSeed {
                            name: "ClosedActionSet",
                            content: "Дозволені дії: reply, search_graph, search_web, \
                                      fetch_user_profile, remember_fact. Інших дій не існує.",
                        },
                        RuleSeed {
                            name: "PlanShape",
                            content: "План — ациклічний граф. Фінальною дією завжди є reply. \
                                      depends_on може посилатися лише на наявні id.",
                        },
                    ],
                }],
            }],
        },
        RoleSeed {
            name: roles::RESPONDER,
            description: "Співрозмовник у чаті. Формулює фінальну відповідь від імені агента.",
            tasks: vec![TaskSeed {
                name: tasks::COMPOSE_REPLY,
                description: "Сформулюй відповідь на основі плану та результатів інструментів.",
                protocol: None,
                instructions: vec![InstructionSeed {
                    name: "PersonaProtocol",
                    content: "Пиши українською. Коротко, по суті, без канцеляриту. Тримайся \
                              вказаного тону: HUMOR — легко і дотепно, SERIOUS — стримано, \
                              NEUTRAL — звичайна розмова.",
                    rules: vec![RuleSeed {
                        name: "StayInCharacter",
                        content: "Не згадуй внутрішні інструменти, плани чи запити до графа. \
                                  Відповідай як жива людина, а не як система.",
                    }],
                }],
            }],
        },
        RoleSeed {
            name: roles::RESEARCHER,
            description: "Дослідник графа пам'яті. Формулює запити до графа і переказує знайдене \
                          людською мовою.",
            tasks: vec![TaskSeed {
                name: tasks::GRAPH_SEARCH,
                description: "Склади один запит Cypher до графа PrimaryMemory за наведеною схемою.",
                protocol: None,
                instructions: vec![InstructionSeed {
                    name: "QueryFormat",
                    content: "Поверни лише текст запиту без пояснень і без markdown. Запит має \
                              лише читати дані: MATCH, WHERE, RETURN, ORDER BY, LIMIT.",
                    rules: vec![RuleSeed {
                        name: "ReadOnlyRule",
                        content: "Жодних CREATE, MERGE, DELETE, SET, DETACH чи REMOVE. Завжди \
                                  додавай LIMIT не більше 50.",
                    }],
                }],
            }],
        },
    ]
}

/// Render the static default bundle for `(role, task?)`, or `None` for an
/// unknown role. The bundle goes through the same renderer as graph-resident
/// prompts, so fallback output is byte-identical to a freshly seeded graph.
pub fn static_bundle(role: &str, task: Option<&str>) -> Option<RoleBundle> {
    let seeds = prompt_seeds();
    let role_seed = seeds.into_iter().find(|r| r.name == role)?;
    let task_seed = match task {
        Some(wanted) => role_seed.tasks.into_iter().find(|t| t.name == wanted)?,
        None => {
            if role_seed.tasks.len() == 1 {
                role_seed.tasks.into_iter().next()?
            } else {
                return None;
            }
        }
    };

    let mut instructions: Vec<(String, String)> = task_seed
        .instructions
        .iter()
        .map(|i| (i.name.to_string(), i.content.to_string()))
        .collect();
    instructions.sort();

    let mut rules: Vec<(String, String)> = task_seed
        .instructions
        .iter()
        .flat_map(|i| i.rules.iter())
        .map(|r| (r.name.to_string(), r.content.to_string()))
        .collect();
    rules.sort();
    rules.dedup();

    Some(RoleBundle {
        role_name: role_seed.name.to_string(),
        role_description: role_seed.description.to_string(),
        task_name: task_seed.name.to_string(),
        task_description: task_seed.description.to_string(),
        instructions: instructions.into_iter().map(|(_, c)| c).collect(),
        rules: rules.into_iter().map(|(_, c)| c).collect(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_pipeline_role_has_a_default() {
        for role in [
            roles::GATEKEEPER,
            roles::THINKER,
            roles::ANALYST,
            roles::RESPONDER,
            roles::RESEARCHER,
        ] {
            assert!(static_bundle(role, None).is_some(), "missing default for {role}");
        }
        assert!(static_bundle("Jester", None).is_none());
    }

    #[test]
    fn gatekeeper_rules_are_sorted_by_name() {
        let bundle = static_bundle(roles::GATEKEEPER, Some(tasks::TRIAGE)).unwrap();
        // AssessDepth < IdentityTarget < JSONFormat
        assert!(bundle.rules[0].starts_with("QUICK_REPLY"));
        assert!(bundle.rules[1].starts_with("Якщо в тексті"));
        assert!(bundle.rules[2].starts_with("Відповідай лише одним JSON"));
    }

    #[test]
    fn content_is_ukrainian() {
        for seed in prompt_seeds() {
            assert!(
                seed.description.chars().any(|c| ('\u{0400}'..='\u{04FF}').contains(&c)),
                "role {} description is not Ukrainian",
                seed.name
            );
        }
    }
}
