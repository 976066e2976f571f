use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use sb_bus::{EventMetadata, EventPayload};
use sb_domain::config::Config;
use sb_gateway::{api, bootstrap};
use sb_providers::{EchoProvider, LlmProvider};

#[derive(Parser)]
#[command(name = "switchboard", about = "Agent-core runtime server", version)]
struct Cli {
    /// Path to the configuration file.
    #[arg(long, default_value = "config.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the server (default when no subcommand is given).
    Serve,
    /// Print the resolved configuration and exit.
    Config,
    /// Print the version and exit.
    Version,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        None | Some(Command::Serve) => {
            init_tracing();
            let config = Config::load(&cli.config)
                .with_context(|| format!("loading {}", cli.config.display()))?;
            run_server(Arc::new(config)).await
        }
        Some(Command::Config) => {
            let config = Config::load(&cli.config)?;
            println!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }
        Some(Command::Version) => {
            println!("switchboard {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

/// Initialize structured JSON tracing (only for the `serve` command).
fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,sb_gateway=debug")),
        )
        .json()
        .init();
}

/// Start the gateway server with the given configuration.
async fn run_server(config: Arc<Config>) -> anyhow::Result<()> {
    tracing::info!("Switchboard starting");

    // Concrete LLM integrations live outside the core; without one wired in
    // the server runs against the deterministic echo provider.
    let provider: Arc<dyn LlmProvider> = Arc::new(EchoProvider);
    tracing::warn!(provider = provider.provider_id(), "no LLM provider configured, using echo");

    let state = bootstrap::build_state(config.clone(), provider)?;

    let app = api::router(state.clone()).with_state(state.clone());

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    tracing::info!(addr = %addr, "listening");

    let shutdown_state = state.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown requested");
            // Closes every open SSE stream.
            shutdown_state
                .bus
                .publish(EventPayload::ApplicationExit {}, EventMetadata::default());
        })
        .await?;

    // Drain queued persistence writes before exiting.
    if let Err(e) = state.sessions.flush() {
        tracing::warn!(error = %e, "final flush failed");
    }
    tracing::info!("Switchboard stopped");
    Ok(())
}
