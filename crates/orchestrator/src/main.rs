//! notebookd CLI entry point.
//!
//! Starts the kernel gateway under the orchestrator and bridges the client
//! channels over stdin/stdout as length-prefixed JSON frames. Logs go to
//! stderr.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use log::{info, warn};
use orchestrator::bridge::serve;
use orchestrator::{default_config_path, Orchestrator, OrchestratorConfig};

#[derive(Parser, Debug)]
#[command(name = "notebookd")]
#[command(about = "Kernel gateway supervisor and relay for notebook clients")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Log level
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Config file (default: ~/.config/notebookd/config.json)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Gateway executable
    #[arg(long, global = true)]
    gateway_command: Option<String>,

    /// Gateway working directory
    #[arg(long, global = true)]
    gateway_cwd: Option<PathBuf>,

    /// Milliseconds to wait at each shutdown step
    #[arg(long, global = true)]
    shutdown_grace_ms: Option<u64>,
}

#[derive(Subcommand, Debug, Default)]
enum Commands {
    /// Run the orchestrator (default if no command specified)
    #[default]
    Run,

    /// Print the effective configuration as JSON
    Config,
}

impl Cli {
    /// Apply command-line overrides on top of the loaded config.
    fn apply(&self, config: &mut OrchestratorConfig) {
        if let Some(ref command) = self.gateway_command {
            config.gateway.command = command.clone();
        }
        if let Some(ref cwd) = self.gateway_cwd {
            config.gateway.cwd = Some(cwd.clone());
        }
        if let Some(grace) = self.shutdown_grace_ms {
            config.shutdown_grace_ms = grace;
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&cli.log_level))
        .init();

    let config_path = cli.config.clone().unwrap_or_else(default_config_path);
    let mut config = OrchestratorConfig::load(&config_path)?;
    cli.apply(&mut config);

    match cli.command.unwrap_or_default() {
        Commands::Run => run(config, config_path).await,
        Commands::Config => {
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
    }
}

async fn run(config: OrchestratorConfig, config_path: PathBuf) -> anyhow::Result<()> {
    info!("notebookd starting...");
    info!("Configuration:");
    info!("  Config file: {:?}", config_path);
    info!("  Gateway: {} {:?}", config.gateway.command, config.gateway.args);
    info!("  Shutdown grace: {:?}", config.shutdown_grace());

    let orchestrator = Orchestrator::new(config);
    let outcome = serve(
        orchestrator,
        tokio::io::stdin(),
        tokio::io::stdout(),
        shutdown_signal(),
    )
    .await?;
    info!("notebookd exiting ({:?})", outcome);
    Ok(())
}

/// Resolves on ctrl-c, or SIGTERM on unix.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
                return;
            }
            Err(e) => warn!("Failed to install SIGTERM handler: {}", e),
        }
    }
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for ctrl-c: {}", e);
        std::future::pending::<()>().await;
    }
}
