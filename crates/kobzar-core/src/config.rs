use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

/// Top-level config (kobzar.toml + KOBZAR_* env overrides).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KobzarConfig {
    #[serde(default)]
    pub graph: GraphConfig,
    pub agent: AgentIdentity,
    #[serde(default)]
    pub providers: ProvidersConfig,
    #[serde(default)]
    pub streams: StreamsConfig,
    #[serde(default)]
    pub gatekeeper: GatekeeperConfig,
    #[serde(default)]
    pub thinker: ThinkerConfig,
    #[serde(default)]
    pub coordinator: CoordinatorConfig,
    #[serde(default)]
    pub responder: ResponderConfig,
    #[serde(default)]
    pub prompt: PromptConfig,
    pub telegram: Option<TelegramConfig>,
    pub embedding: Option<EmbeddingConfig>,
}

/// Graph endpoint and logical graph names.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphConfig {
    #[serde(default = "default_graph_host")]
    pub host: String,
    #[serde(default = "default_graph_port")]
    pub port: u16,
    #[serde(default = "default_primary_name")]
    pub primary_name: String,
    #[serde(default = "default_thoughtlog_name")]
    pub thoughtlog_name: String,
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            host: default_graph_host(),
            port: default_graph_port(),
            primary_name: default_primary_name(),
            thoughtlog_name: default_thoughtlog_name(),
        }
    }
}

/// Process-wide Agent identity. Required — the agent must know who it is
/// before it can tell its own messages from everyone else's.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentIdentity {
    pub telegram_id: i64,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvidersConfig {
    /// Ordered list of provider names to try. First is primary.
    #[serde(default = "default_provider_order")]
    pub order: Vec<String>,
    /// Unhealthy-provider cooldown in seconds.
    #[serde(default = "default_cooldown_seconds")]
    pub cooldown_seconds: u64,
    pub cli: Option<CliProviderConfig>,
    pub openai: Option<OpenAiCompatConfig>,
}

impl Default for ProvidersConfig {
    fn default() -> Self {
        Self {
            order: default_provider_order(),
            cooldown_seconds: default_cooldown_seconds(),
            cli: None,
            openai: None,
        }
    }
}

/// CLI-driven provider: spawns a process, prompt on stdin, completion on stdout.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CliProviderConfig {
    #[serde(default = "default_cli_command")]
    pub command: String,
    #[serde(default = "default_cli_model")]
    pub model: String,
}

impl Default for CliProviderConfig {
    fn default() -> Self {
        Self {
            command: default_cli_command(),
            model: default_cli_model(),
        }
    }
}

/// OpenAI-style chat completions endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenAiCompatConfig {
    pub api_key: String,
    #[serde(default = "default_openai_base_url")]
    pub base_url: String,
    #[serde(default = "default_openai_model")]
    pub model: String,
}

/// Worker count and queue capacity for a single stream.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct StreamConfig {
    pub workers: usize,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

impl StreamConfig {
    fn new(workers: usize) -> Self {
        Self {
            workers,
            queue_capacity: default_queue_capacity(),
        }
    }
}

/// Per-stream tuning. Scribe stays single-worker so the per-chat chronology
/// lock is barely contended; Coordinator is capped at 8 concurrent chats.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamsConfig {
    #[serde(default = "default_scribe_stream")]
    pub scribe: StreamConfig,
    #[serde(default = "default_gatekeeper_stream")]
    pub gatekeeper: StreamConfig,
    #[serde(default = "default_thinker_stream")]
    pub thinker: StreamConfig,
    #[serde(default = "default_analyst_stream")]
    pub analyst: StreamConfig,
    #[serde(default = "default_coordinator_stream")]
    pub coordinator: StreamConfig,
    #[serde(default = "default_responder_stream")]
    pub responder: StreamConfig,
}

impl Default for StreamsConfig {
    fn default() -> Self {
        Self {
            scribe: default_scribe_stream(),
            gatekeeper: default_gatekeeper_stream(),
            thinker: default_thinker_stream(),
            analyst: default_analyst_stream(),
            coordinator: default_coordinator_stream(),
            responder: default_responder_stream(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatekeeperConfig {
    /// Identifier of the cheap local model used for triage.
    #[serde(default = "default_gatekeeper_model")]
    pub model: String,
}

impl Default for GatekeeperConfig {
    fn default() -> Self {
        Self {
            model: default_gatekeeper_model(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThinkerConfig {
    /// Number of prior messages included as context.
    #[serde(default = "default_history_k")]
    pub history_k: usize,
    #[serde(default = "default_thinker_model")]
    pub model: String,
}

impl Default for ThinkerConfig {
    fn default() -> Self {
        Self {
            history_k: default_history_k(),
            model: default_thinker_model(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    /// Per-task soft deadline in seconds.
    #[serde(default = "default_task_timeout")]
    pub task_timeout_seconds: u64,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            task_timeout_seconds: default_task_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponderConfig {
    #[serde(default = "default_responder_model")]
    pub model: String,
}

impl Default for ResponderConfig {
    fn default() -> Self {
        Self {
            model: default_responder_model(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptConfig {
    /// Assembler cache TTL in seconds.
    #[serde(default = "default_prompt_cache_ttl")]
    pub cache_ttl_seconds: u64,
}

impl Default for PromptConfig {
    fn default() -> Self {
        Self {
            cache_ttl_seconds: default_prompt_cache_ttl(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelegramConfig {
    pub bot_token: String,
}

/// Optional external embedding service. The core never calls it — the entry
/// exists so operators can keep one config file for the whole deployment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    pub base_url: String,
}

fn default_graph_host() -> String {
    "127.0.0.1".to_string()
}
fn default_graph_port() -> u16 {
    6379
}
fn default_primary_name() -> String {
    "PrimaryMemory".to_string()
}
fn default_thoughtlog_name() -> String {
    "ThoughtLog".to_string()
}
fn default_provider_order() -> Vec<String> {
    vec!["cli_gemini".to_string(), "openai_compatible".to_string()]
}
fn default_cooldown_seconds() -> u64 {
    30
}
fn default_cli_command() -> String {
    "gemini".to_string()
}
fn default_cli_model() -> String {
    "gemini-2.0-flash".to_string()
}
fn default_openai_base_url() -> String {
    "https://api.openai.com".to_string()
}
fn default_openai_model() -> String {
    "gpt-4o-mini".to_string()
}
fn default_queue_capacity() -> usize {
    64
}
fn default_scribe_stream() -> StreamConfig {
    StreamConfig::new(1)
}
fn default_gatekeeper_stream() -> StreamConfig {
    StreamConfig::new(2)
}
fn default_thinker_stream() -> StreamConfig {
    StreamConfig::new(2)
}
fn default_analyst_stream() -> StreamConfig {
    StreamConfig::new(2)
}
fn default_coordinator_stream() -> StreamConfig {
    StreamConfig::new(8)
}
fn default_responder_stream() -> StreamConfig {
    StreamConfig::new(2)
}
fn default_gatekeeper_model() -> String {
    "qwen2.5:3b".to_string()
}
fn default_thinker_model() -> String {
    "gemini-2.0-flash".to_string()
}
fn default_responder_model() -> String {
    "gemini-2.0-flash".to_string()
}
fn default_history_k() -> usize {
    10
}
fn default_task_timeout() -> u64 {
    30
}
fn default_prompt_cache_ttl() -> u64 {
    60
}

impl KobzarConfig {
    /// Load config from a TOML file with KOBZAR_* env var overrides.
    ///
    /// Checks in order:
    ///   1. Explicit path argument
    ///   2. ./kobzar.toml
    ///   3. ~/.kobzar/kobzar.toml
    pub fn load(config_path: Option<&str>) -> crate::error::Result<Self> {
        let path = config_path.map(String::from).unwrap_or_else(resolve_path);

        let config: KobzarConfig = Figment::new()
            .merge(Toml::file(&path))
            .merge(Env::prefixed("KOBZAR_").split("_"))
            .extract()
            .map_err(|e| crate::error::KobzarError::Config(e.to_string()))?;

        Ok(config)
    }
}

fn resolve_path() -> String {
    if std::path::Path::new("kobzar.toml").exists() {
        return "kobzar.toml".to_string();
    }
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{home}/.kobzar/kobzar.toml")
}
