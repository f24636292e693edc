//! Materializes system prompts from the graph-resident prompt subgraph.
//!
//! Templates are cached by `(role, task)` with a short TTL and invalidated
//! whenever the store's prompt generation moves (any prompt-subgraph write).
//! A missing role or an empty subgraph falls back to the statically compiled
//! defaults — same renderer, same bytes.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tracing::warn;

use kobzar_core::metrics;
use kobzar_graph::{GraphStore, RoleBundle};

use crate::defaults;

struct CachedPrompt {
    text: String,
    built_at: Instant,
    generation: u64,
}

pub struct PromptAssembler {
    store: Arc<GraphStore>,
    ttl: Duration,
    cache: DashMap<(String, String), CachedPrompt>,
}

impl PromptAssembler {
    pub fn new(store: Arc<GraphStore>, ttl: Duration) -> Self {
        Self {
            store,
            ttl,
            cache: DashMap::new(),
        }
    }

    /// Return the system-prompt template for `(role, task)`.
    ///
    /// Never fails: subgraph misses and graph errors fall back to the static
    /// default for the role (counted in `prompt_fallback_total`). Identical
    /// `(role, task, graph state)` yields byte-identical prompts within the
    /// TTL.
    pub async fn assemble(&self, role: &str, task: Option<&str>) -> String {
        let key = (role.to_string(), task.unwrap_or("").to_string());
        let generation = self.store.prompt_generation();

        if let Some(cached) = self.cache.get(&key) {
            if cached.generation == generation && cached.built_at.elapsed() < self.ttl {
                return cached.text.clone();
            }
        }

        let bundle = match self.store.fetch_role_bundle(role, task).await {
            Ok(Some(bundle)) => bundle,
            Ok(None) => {
                metrics::incr(metrics::names::PROMPT_FALLBACK_TOTAL);
                warn!(role, "role missing from prompt subgraph, using static default");
                match defaults::static_bundle(role, task) {
                    Some(bundle) => bundle,
                    None => {
                        warn!(role, "no static default either, assembling bare prompt");
                        return format!("ROLE: {role}");
                    }
                }
            }
            Err(e) => {
                metrics::incr(metrics::names::PROMPT_FALLBACK_TOTAL);
                warn!(role, error = %e, "prompt subgraph read failed, using static default");
                match defaults::static_bundle(role, task) {
                    Some(bundle) => bundle,
                    None => return format!("ROLE: {role}"),
                }
            }
        };

        let text = render_bundle(&bundle);
        self.cache.insert(
            key,
            CachedPrompt {
                text: text.clone(),
                built_at: Instant::now(),
                generation,
            },
        );
        text
    }
}

/// The fixed prompt template. Both graph-resident and static bundles go
/// through here, so the two sources are indistinguishable downstream.
pub fn render_bundle(bundle: &RoleBundle) -> String {
    let mut out = String::new();
    out.push_str("ROLE: ");
    out.push_str(&bundle.role_description);
    out.push_str("\nTASK: ");
    out.push_str(&bundle.task_description);
    if !bundle.instructions.is_empty() {
        out.push_str("\nPROTOCOL:");
        for instruction in &bundle.instructions {
            out.push_str("\n  - ");
            out.push_str(instruction);
        }
    }
    if !bundle.rules.is_empty() {
        out.push_str("\nRULES:");
        for rule in &bundle.rules {
            out.push_str("\n  * ");
            out.push_str(rule);
        }
    }
    out
}

/// Append caller-provided runtime context (history, narrative, RAG snippets)
/// below the template. Sections with empty bodies are dropped.
pub fn with_context(template: &str, sections: &[(&str, &str)]) -> String {
    let mut out = template.to_string();
    for (label, body) in sections {
        if body.trim().is_empty() {
            continue;
        }
        out.push_str("\n\n");
        out.push_str(label);
        out.push_str(":\n");
        out.push_str(body.trim());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use kobzar_core::config::AgentIdentity;
    use kobzar_graph::{MockBackend, ResultSet, Scalar};

    fn store(backend: Arc<MockBackend>) -> Arc<GraphStore> {
        Arc::new(GraphStore::new(
            backend,
            "PrimaryMemory",
            AgentIdentity {
                telegram_id: 999,
                name: "Кобзар".into(),
            },
        ))
    }

    fn text(s: &str) -> Scalar {
        Scalar::Text(s.into())
    }

    fn script_thinker_role(backend: &MockBackend, description: &str) {
        backend.script(
            "MATCH (r:Role {name: 'Thinker'})",
            ResultSet::table(
                &["r.name", "r.description"],
                vec![vec![text("Thinker"), text(description)]],
            ),
        );
        backend.script(
            "[:RESPONSIBLE_FOR]->(t:Task)",
            ResultSet::table(
                &["t.name", "t.description"],
                vec![vec![text("SemanticAnalysis"), text("Аналізуй")]],
            ),
        );
    }

    #[tokio::test]
    async fn renders_the_fixed_template() {
        let bundle = RoleBundle {
            role_name: "Thinker".into(),
            role_description: "Аналітик".into(),
            task_name: "SemanticAnalysis".into(),
            task_description: "Аналізуй повідомлення".into(),
            instructions: vec!["Крок перший".into(), "Крок другий".into()],
            rules: vec!["Без вигадок".into()],
        };
        let prompt = render_bundle(&bundle);
        assert_eq!(
            prompt,
            "ROLE: Аналітик\nTASK: Аналізуй повідомлення\nPROTOCOL:\n  - Крок перший\n  - Крок другий\nRULES:\n  * Без вигадок"
        );
    }

    #[tokio::test]
    async fn empty_subgraph_falls_back_to_static_default() {
        let backend = Arc::new(MockBackend::new());
        let assembler = PromptAssembler::new(store(backend), Duration::from_secs(60));

        let before = metrics::get(metrics::names::PROMPT_FALLBACK_TOTAL);
        let prompt = assembler.assemble(defaults::roles::GATEKEEPER, None).await;

        assert!(prompt.starts_with("ROLE: Вартовий"));
        assert!(prompt.contains("RULES:"));
        assert!(metrics::get(metrics::names::PROMPT_FALLBACK_TOTAL) > before);
    }

    #[tokio::test]
    async fn cache_returns_identical_bytes_within_ttl() {
        let backend = Arc::new(MockBackend::new());
        script_thinker_role(&backend, "Аналітик розмови");
        let assembler = PromptAssembler::new(store(backend.clone()), Duration::from_secs(60));

        let first = assembler.assemble("Thinker", None).await;
        let queries_after_first = backend.executed().len();
        let second = assembler.assemble("Thinker", None).await;

        assert_eq!(first, second);
        // Second call was served from cache — no new graph reads.
        assert_eq!(backend.executed().len(), queries_after_first);
    }

    #[tokio::test]
    async fn cache_expires_after_ttl() {
        let backend = Arc::new(MockBackend::new());
        script_thinker_role(&backend, "Аналітик розмови");
        let assembler = PromptAssembler::new(store(backend.clone()), Duration::from_millis(20));

        assembler.assemble("Thinker", None).await;
        let after_first = backend.executed().len();

        tokio::time::sleep(Duration::from_millis(40)).await;
        assembler.assemble("Thinker", None).await;
        assert!(backend.executed().len() > after_first);
    }

    #[tokio::test]
    async fn prompt_generation_bump_invalidates_cache() {
        let backend = Arc::new(MockBackend::new());
        script_thinker_role(&backend, "Аналітик розмови");
        let graph_store = store(backend.clone());
        let assembler =
            PromptAssembler::new(graph_store.clone(), Duration::from_secs(3600));

        assembler.assemble("Thinker", None).await;
        let after_first = backend.executed().len();

        // A prompt-subgraph write bumps the generation.
        graph_store.seed_prompts(&[]).await.unwrap();

        assembler.assemble("Thinker", None).await;
        assert!(backend.executed().len() > after_first);
    }

    #[test]
    fn runtime_context_is_appended_below() {
        let out = with_context("ROLE: x", &[("ІСТОРІЯ", "a: привіт"), ("ПОРОЖНЄ", "  ")]);
        assert!(out.starts_with("ROLE: x\n\nІСТОРІЯ:\na: привіт"));
        assert!(!out.contains("ПОРОЖНЄ"));
    }
}
