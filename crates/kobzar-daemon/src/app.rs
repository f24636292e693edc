//! Process wiring: graph client, providers, streams, transport, shutdown.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use kobzar_agent::{defaults, OutboundSink, PipelineContext, PipelineSettings, PromptAssembler};
use kobzar_bus::StreamBus;
use kobzar_core::metrics;
use kobzar_core::KobzarConfig;
use kobzar_graph::{GraphBackend, GraphClient, GraphStore, ThoughtLogger};
use kobzar_llm::{CliProvider, LlmProvider, OpenAiCompatProvider, Switchboard};
use kobzar_telegram::{TelegramAdapter, TelegramSink};

pub const EXIT_CONFIG: u8 = 2;
pub const EXIT_GRAPH: u8 = 3;
pub const EXIT_NO_PROVIDERS: u8 = 4;

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("graph unreachable: {0}")]
    Graph(String),

    #[error("no LLM providers available — check providers.order and credentials")]
    NoProviders,

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl AppError {
    pub fn exit_code(&self) -> u8 {
        match self {
            AppError::Graph(_) => EXIT_GRAPH,
            AppError::NoProviders => EXIT_NO_PROVIDERS,
            AppError::Other(_) => 1,
        }
    }
}

/// Connect to the graph engine, failing fast with exit code 3 semantics.
async fn connect_graph(config: &KobzarConfig) -> Result<Arc<dyn GraphBackend>, AppError> {
    let client = GraphClient::connect(&config.graph.host, config.graph.port)
        .await
        .map_err(|e| AppError::Graph(e.to_string()))?;
    Ok(Arc::new(client))
}

/// Build the provider list in the configured order. Entries without
/// credentials are skipped with a warning; an empty result is exit code 4.
fn build_providers(config: &KobzarConfig) -> Result<Vec<Arc<dyn LlmProvider>>, AppError> {
    let mut providers: Vec<Arc<dyn LlmProvider>> = Vec::new();

    for name in &config.providers.order {
        match name.as_str() {
            "cli_gemini" => {
                let cli = config.providers.cli.clone().unwrap_or_default();
                providers.push(Arc::new(CliProvider::new("cli_gemini", cli.command)));
            }
            "openai_compatible" => match &config.providers.openai {
                Some(openai) => {
                    providers.push(Arc::new(OpenAiCompatProvider::new(
                        "openai_compatible",
                        openai.api_key.clone(),
                        openai.base_url.clone(),
                    )));
                }
                None => warn!("openai_compatible listed but [providers.openai] is missing, skipping"),
            },
            other => warn!(provider = other, "unknown provider name in providers.order, skipping"),
        }
    }

    if providers.is_empty() {
        return Err(AppError::NoProviders);
    }
    Ok(providers)
}

async fn build_context(config: &KobzarConfig) -> Result<Arc<PipelineContext>, AppError> {
    let backend = connect_graph(config).await?;
    backend
        .ping(&config.graph.primary_name)
        .await
        .map_err(|e| AppError::Graph(e.to_string()))?;

    let providers = build_providers(config)?;
    info!(
        providers = ?config.providers.order,
        "switchboard order configured"
    );

    let store = Arc::new(GraphStore::new(
        backend.clone(),
        config.graph.primary_name.clone(),
        config.agent.clone(),
    ));
    let assembler = Arc::new(PromptAssembler::new(
        store.clone(),
        Duration::from_secs(config.prompt.cache_ttl_seconds),
    ));

    Ok(Arc::new(PipelineContext {
        store,
        switchboard: Arc::new(Switchboard::new(
            providers,
            Duration::from_secs(config.providers.cooldown_seconds),
        )),
        assembler,
        thoughts: ThoughtLogger::spawn(backend, config.graph.thoughtlog_name.clone()),
        settings: PipelineSettings::from_config(config),
    }))
}

/// Sink used when no Telegram transport is configured: replies are logged
/// and given synthetic message ids so the loopback still works.
struct LogSink {
    next_id: std::sync::atomic::AtomicI64,
}

#[async_trait]
impl OutboundSink for LogSink {
    async fn deliver(&self, chat_id: i64, text: &str) -> Result<i64, String> {
        info!(chat_id, text, "outbound reply (no transport configured)");
        Ok(self
            .next_id
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst))
    }
}

/// `serve`: run every stream until SIGINT.
pub async fn serve(config: KobzarConfig) -> Result<(), AppError> {
    let ctx = build_context(&config).await?;
    let bus = Arc::new(StreamBus::new(&config.streams));
    let shutdown = CancellationToken::new();

    let telegram = config
        .telegram
        .as_ref()
        .map(|tg| TelegramAdapter::new(tg, bus.clone()));

    let sink: Arc<dyn OutboundSink> = match &telegram {
        Some(adapter) => Arc::new(TelegramSink::new(adapter.bot())),
        None => {
            warn!("no [telegram] config — replies will only be logged");
            Arc::new(LogSink {
                next_id: std::sync::atomic::AtomicI64::new(1_000_000),
            })
        }
    };

    let handles = kobzar_agent::spawn_streams(
        ctx,
        bus.clone(),
        sink,
        None,
        &config.streams,
        shutdown.clone(),
    );

    if let Some(adapter) = telegram {
        tokio::spawn(adapter.run());
    }

    info!("kobzar serving — Ctrl-C to stop");
    let _ = tokio::signal::ctrl_c().await;
    info!("shutting down, draining streams");

    shutdown.cancel();
    bus.close_all();
    for handle in handles {
        let _ = handle.await;
    }
    metrics::log_snapshot();
    Ok(())
}

/// `backfill`: reprocess persisted messages through the Thinker.
pub async fn backfill(config: KobzarConfig, per_chat: usize) -> Result<(), AppError> {
    let ctx = build_context(&config).await?;
    let enriched = kobzar_agent::backfill::backfill(ctx, per_chat)
        .await
        .map_err(|e| AppError::Other(anyhow::anyhow!(e.to_string())))?;
    info!(enriched, "backfill finished");
    Ok(())
}

/// `graph-ping`: health-check both logical graphs.
pub async fn graph_ping(config: KobzarConfig) -> Result<(), AppError> {
    let backend = connect_graph(&config).await?;
    for graph in [&config.graph.primary_name, &config.graph.thoughtlog_name] {
        backend
            .ping(graph)
            .await
            .map_err(|e| AppError::Graph(format!("{graph}: {e}")))?;
        info!(graph, "graph reachable");
    }
    Ok(())
}

/// `seed-prompts`: make the graph authoritative for prompt assembly.
pub async fn seed_prompts(config: KobzarConfig) -> Result<(), AppError> {
    let backend = connect_graph(&config).await?;
    let store = GraphStore::new(
        backend,
        config.graph.primary_name.clone(),
        config.agent.clone(),
    );
    store
        .seed_prompts(&defaults::prompt_seeds())
        .await
        .map_err(|e| AppError::Graph(e.to_string()))?;
    info!("default prompt atoms seeded");
    Ok(())
}
