use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing::error;

mod app;

#[derive(Parser)]
#[command(name = "kobzar", about = "Telegram chat observer with a graph-backed memory")]
struct Cli {
    /// Path to kobzar.toml (default: ./kobzar.toml, then ~/.kobzar/kobzar.toml)
    #[arg(long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start all stream workers and the Telegram adapter.
    Serve,
    /// Reprocess persisted messages through the Thinker.
    Backfill {
        /// How many recent messages to re-analyze per chat.
        #[arg(long, default_value_t = 50)]
        per_chat: usize,
    },
    /// Health-check both logical graphs.
    GraphPing,
    /// Write the default prompt atoms into the prompt subgraph (idempotent).
    SeedPrompts,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "kobzar=info".into()),
        )
        .init();

    let cli = Cli::parse();

    // Config problems are fatal before anything else runs (exit code 2).
    let config = match kobzar_core::KobzarConfig::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            error!("config load failed: {e}");
            return ExitCode::from(app::EXIT_CONFIG);
        }
    };

    let result = match cli.command {
        Command::Serve => app::serve(config).await,
        Command::Backfill { per_chat } => app::backfill(config, per_chat).await,
        Command::GraphPing => app::graph_ping(config).await,
        Command::SeedPrompts => app::seed_prompts(config).await,
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            ExitCode::from(e.exit_code())
        }
    }
}
