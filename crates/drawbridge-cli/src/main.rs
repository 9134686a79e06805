mod logging;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::info;

use drawbridge_core::config::Config;
use drawbridge_engine::EngineState;
use drawbridge_supervisor::{ChildEngineProcess, HealthProbe, HttpHealthProbe, Supervisor};

#[derive(Parser)]
#[command(name = "drawbridge", version, about = "Live canvas engine and its supervisor")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file path
    #[arg(short, long, global = true)]
    config: Option<String>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the canvas engine (HTTP API and viewer WebSocket)
    Engine {
        /// Bind host
        #[arg(long)]
        host: Option<String>,

        /// Bind port
        #[arg(short, long)]
        port: Option<u16>,
    },
    /// Launch the engine as a child process and keep it healthy
    Supervise,
    /// Probe the engine once and print its health
    Status,
    /// Config management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Show the effective config
    Show,
    /// Get a config value by dotted key
    Get { key: String },
    /// Check the config for problems
    Validate,
}

impl Cli {
    fn config_path(&self) -> PathBuf {
        self.config
            .as_deref()
            .map(PathBuf::from)
            .unwrap_or_else(Config::config_path)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config_path = cli.config_path();
    let config = Config::load_with_env(&config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;

    logging::init(config.logging.as_ref(), cli.verbose);

    match cli.command {
        Commands::Engine { host, port } => run_engine(config, host, port).await,
        Commands::Supervise => run_supervisor(config, &config_path).await,
        Commands::Status => show_status(&config).await,
        Commands::Config { action } => run_config(&config, action),
    }
}

async fn run_engine(
    mut config: Config,
    host: Option<String>,
    port: Option<u16>,
) -> anyhow::Result<()> {
    if let Some(host) = host {
        config.server.host = host;
    }
    if let Some(port) = port {
        config.server.port = port;
    }
    let state = Arc::new(EngineState::new(Arc::new(config)));
    drawbridge_engine::start_engine(state).await
}

/// The configured engine command, or this binary's own `engine` subcommand.
fn engine_process(config: &Config, config_path: &Path) -> anyhow::Result<ChildEngineProcess> {
    if let Some(command) = &config.engine.command {
        return Ok(ChildEngineProcess::new(command.clone(), config.engine.args.clone()));
    }
    let exe = std::env::current_exe().context("cannot locate the drawbridge binary")?;
    let mut args = vec![
        "--config".to_string(),
        config_path.display().to_string(),
        "engine".to_string(),
    ];
    args.extend(config.engine.args.iter().cloned());
    Ok(ChildEngineProcess::new(exe.display().to_string(), args))
}

async fn run_supervisor(config: Config, config_path: &Path) -> anyhow::Result<()> {
    let process = engine_process(&config, config_path)?;
    info!(command = %process.command_line(), url = %config.engine_url(), "Supervising canvas engine");

    let probe = Arc::new(HttpHealthProbe::new(
        &config.engine_url(),
        config.supervisor.probe_timeout(),
    )?);
    let supervisor = Supervisor::new(&config, probe, Box::new(process));
    supervisor.launch().await?;
    if !config.engine.auto_start {
        info!("Auto-start disabled, engine starts on first use");
    }

    let shutdown = drawbridge_engine::server::shutdown_signal();
    tokio::pin!(shutdown);
    let mut status_rx = supervisor.watch_status();
    let mut last_state = status_rx.borrow_and_update().state;
    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            changed = status_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                let status = status_rx.borrow_and_update().clone();
                if status.state != last_state {
                    info!(
                        state = %status.state,
                        pid = ?status.pid,
                        total_restarts = status.total_restarts,
                        last_error = status.last_error.as_deref().unwrap_or("-"),
                        "Engine state changed"
                    );
                    last_state = status.state;
                }
            }
        }
    }

    info!("Shutting down supervisor");
    let report = supervisor.report();
    supervisor.shutdown().await?;
    info!(
        report = %serde_json::to_string(&report)?,
        "Supervisor stopped"
    );
    Ok(())
}

async fn show_status(config: &Config) -> anyhow::Result<()> {
    let probe = HttpHealthProbe::new(&config.engine_url(), config.supervisor.probe_timeout())?;
    match probe.probe().await {
        Ok(health) => {
            println!("{}", serde_json::to_string_pretty(&health)?);
            Ok(())
        }
        Err(e) => {
            eprintln!("Engine at {} is not reachable: {e}", probe.url());
            std::process::exit(1);
        }
    }
}

fn run_config(config: &Config, action: ConfigAction) -> anyhow::Result<()> {
    match action {
        ConfigAction::Show => {
            println!("{}", serde_json::to_string_pretty(config)?);
        }
        ConfigAction::Get { key } => match config.get_path(&key) {
            Some(value) => println!("{}", serde_json::to_string_pretty(&value)?),
            None => anyhow::bail!("Config key not found: {key}"),
        },
        ConfigAction::Validate => {
            let (warnings, errors) = config.validate();
            for warning in &warnings {
                println!("warning: {warning}");
            }
            for error in &errors {
                println!("error: {error}");
            }
            if !errors.is_empty() {
                anyhow::bail!("config has {} error(s)", errors.len());
            }
            println!("Config OK");
        }
    }
    Ok(())
}
