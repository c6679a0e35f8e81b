//! medic CLI — entry point for the resurrection arbiter service.
//!
//! Wires the stream listener, decision engine, resurrector, outcome store,
//! and HTTP surface together and runs the pipeline until shutdown.

mod commands;

use clap::Parser;
use medic_core::config::{ExecutorKind, StreamKind};
use medic_core::engine::DecisionEngine;
use medic_core::error::MedicError;
use medic_core::gateway::{self, GatewayState};
use medic_core::orchestrator::{ApprovalService, Orchestrator, PipelineCounters};
use medic_core::pending::PendingQueue;
use medic_core::resurrector::{ContainerResurrector, DryRunResurrector, Resurrect};
use medic_core::runtime::DockerCli;
use medic_core::siem::{HttpSiemClient, NoopSiemClient, SiemClient};
use medic_core::store::OutcomeStore;
use medic_core::stream::{KillStream, MockListener, RedisStreamListener};
use medic_core::types::OperatingMode;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Event cadence for the mock listener.
const MOCK_INTERVAL: Duration = Duration::from_secs(5);

/// medic: autonomous resurrection arbiter
#[derive(Parser, Debug)]
#[command(name = "medic", version, about, long_about = None)]
struct Cli {
    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Operating mode override: observer or live
    #[arg(long)]
    mode: Option<String>,

    /// Use the mock listener and the dry-run resurrector
    #[arg(long)]
    mock: bool,

    /// Increase verbosity (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Suppress non-essential output
    #[arg(short, long)]
    quiet: bool,

    /// Subcommand
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Manage configuration
    Config {
        #[command(subcommand)]
        action: commands::ConfigAction,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    // Load .env file if present
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    // Set up tracing before anything else.
    let filter = match cli.verbose {
        0 if cli.quiet => "error",
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let builder = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .with_target(false);
    if std::env::var("MEDIC_LOG_FORMAT").as_deref() == Ok("json") {
        builder.json().init();
    } else {
        builder.init();
    }

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{err}");
            eprintln!("medic: {err}");
            ExitCode::from(exit_code_for(&err))
        }
    }
}

/// 0 normal shutdown, 2 configuration invalid, 3 outcome store unrecoverable.
fn exit_code_for(err: &MedicError) -> u8 {
    match err {
        MedicError::Config(_) => 2,
        MedicError::Store(store_err) if store_err.is_fatal() => 3,
        _ => 1,
    }
}

async fn run(cli: Cli) -> Result<(), MedicError> {
    // `config init` must work before a config file exists.
    if let Some(Commands::Config {
        action: commands::ConfigAction::Init,
    }) = &cli.command
    {
        return commands::handle_config(
            commands::ConfigAction::Init,
            cli.config.as_deref(),
            &medic_core::MedicConfig::default(),
        );
    }

    let mut config = medic_core::load_config(cli.config.as_deref())?;

    if let Some(command) = cli.command {
        let Commands::Config { action } = command;
        return commands::handle_config(action, cli.config.as_deref(), &config);
    }

    // Apply CLI overrides.
    if let Some(mode) = &cli.mode {
        let mode: OperatingMode = mode
            .parse()
            .map_err(|message| medic_core::error::ConfigError::Invalid { message })?;
        config.mode = match mode {
            OperatingMode::Observer => medic_core::config::Mode::Observer,
            OperatingMode::Live => medic_core::config::Mode::Live,
        };
    }
    if cli.mock {
        config.stream.kind = StreamKind::Mock;
        config.resurrection.executor = ExecutorKind::DryRun;
    }

    let mode: OperatingMode = config.mode.into();
    info!(
        %mode,
        stream = ?config.stream.kind,
        executor = ?config.resurrection.executor,
        "medic starting"
    );

    let store = OutcomeStore::open(config.storage.path.clone()).await?;
    let engine = DecisionEngine::new(&config, mode)?;
    let confidence_bar = engine.confidence_bar();

    let siem: Arc<dyn SiemClient> = if config.siem.enabled {
        match HttpSiemClient::from_env(&config.siem) {
            Some(client) => Arc::new(client),
            None => Arc::new(NoopSiemClient),
        }
    } else {
        Arc::new(NoopSiemClient)
    };

    let resurrector: Arc<dyn Resurrect> = match config.resurrection.executor {
        ExecutorKind::Container => Arc::new(ContainerResurrector::new(
            Arc::new(DockerCli),
            &config.resurrection,
        )),
        ExecutorKind::DryRun => Arc::new(DryRunResurrector),
    };

    let listener: Box<dyn KillStream> = match config.stream.kind {
        StreamKind::Durable => {
            let consumer = config
                .stream
                .consumer_name
                .clone()
                .unwrap_or_else(|| format!("medic-{}", std::process::id()));
            Box::new(RedisStreamListener::connect(
                &config.stream.endpoint,
                &config.stream.topic,
                &config.stream.consumer_group,
                &consumer,
            )?)
        }
        StreamKind::Mock => Box::new(MockListener::rotating(MOCK_INTERVAL)),
    };

    let pending = Arc::new(PendingQueue::new());
    let counters = Arc::new(PipelineCounters::default());
    let approvals = Arc::new(ApprovalService::new(
        store.clone(),
        resurrector.clone(),
        pending.clone(),
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    spawn_signal_handler(shutdown_tx);

    // HTTP surface runs beside the pipeline on the same runtime.
    let state = GatewayState {
        store: store.clone(),
        pending: pending.clone(),
        approvals,
        counters: counters.clone(),
        confidence_bar,
        mode,
        started_at: chrono::Utc::now(),
        stats_window_days: config.calibration.window_days,
    };
    let app = gateway::router(state);
    let listen_addr = config.http.listen.clone();
    let tcp = tokio::net::TcpListener::bind(&listen_addr).await?;
    info!(listen = %listen_addr, "HTTP surface listening");
    let mut http_shutdown = shutdown_rx.clone();
    let server = tokio::spawn(async move {
        let shutdown = async move {
            let _ = http_shutdown.changed().await;
        };
        if let Err(err) = axum::serve(tcp, app).with_graceful_shutdown(shutdown).await {
            warn!(error = %err, "HTTP surface exited with error");
        }
    });

    let orchestrator = Orchestrator::new(
        listener,
        siem,
        engine,
        store,
        resurrector,
        pending,
        counters,
        config.calibration.window_days,
        Duration::from_secs(config.calibration.interval_hours * 3600),
        config.decision.rekill_window_minutes,
        shutdown_rx,
    );
    let result = orchestrator.run().await;

    server.abort();
    info!("medic stopped");
    result
}


fn spawn_signal_handler(shutdown_tx: watch::Sender<bool>) {
    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            let mut term =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                    .expect("failed to install SIGTERM handler");
            tokio::select! {
                _ = ctrl_c => {}
                _ = term.recv() => {}
            }
        }
        #[cfg(not(unix))]
        {
            let _ = ctrl_c.await;
        }
        info!("shutdown signal received");
        let _ = shutdown_tx.send(true);
    });
}
