// SPDX-License-Identifier: Apache-2.0

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Args, Parser, Subcommand, ValueEnum};
use gethostname::gethostname;
use tokio::select;
use tokio::signal::unix::{signal, Signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_bunyan_formatter::{BunyanFormattingLayer, JsonStorageLayer};
use tracing_log::LogTracer;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{EnvFilter, Registry};

use logship::bounded_channel::bounded;
use logship::config::Config;
use logship::coordination::{Coordination, ZkClientConfig, ZkCoordinator};
use logship::exporters::kafka::KafkaOutputBuilder;
use logship::exporters::BoxError;
use logship::tail::manager::{EngineEvent, Manager, ManagerConfig};
use logship::tail::position::PositionFile;

const ENGINE_EVENT_QUEUE_SIZE: usize = 16;

#[derive(Debug, Parser)]
#[command(name = "logship", about = "Ship local log files to Apache Kafka")]
struct Arguments {
    /// Log level for the daemon's own diagnostics
    #[arg(long, global = true, env = "LOGSHIP_LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Log format
    #[arg(
        value_enum,
        long,
        global = true,
        env = "LOGSHIP_LOG_FORMAT",
        default_value = "text"
    )]
    log_format: LogFormatArg,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Print the version
    Version,

    /// Run the shipper
    Start(Box<AgentRun>),
}

#[derive(Debug, Args, Clone)]
struct AgentRun {
    /// Startup config file
    #[arg(long, env = "LOGSHIP_CONFIG", default_value = "/etc/logship/logship.conf")]
    config: PathBuf,

    /// Override the hostname used for the per-host coordination paths
    #[arg(long, env = "LOGSHIP_HOSTNAME")]
    hostname: Option<String>,
}

#[derive(Copy, Clone, PartialEq, Eq, Debug, ValueEnum)]
enum LogFormatArg {
    Text,
    Json,
}

fn get_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

fn main() -> ExitCode {
    let opt = Arguments::parse();

    match opt.command {
        Some(Commands::Version) => {
            println!("{}", get_version())
        }
        Some(Commands::Start(agent)) => {
            // Config problems go to stderr: logging is not up yet, and per
            // the startup contract they are fatal.
            let config = match Config::from_file(&agent.config) {
                Ok(config) => config,
                Err(e) => {
                    eprintln!("ERROR: {}", e);
                    return ExitCode::from(1);
                }
            };

            let _logger = setup_logging(&opt.log_level, &opt.log_format);

            match run_agent(agent, config) {
                Ok(_) => {}
                Err(e) => {
                    error!(error = ?e, "Failed to run agent.");
                    return ExitCode::from(1);
                }
            }
        }
        _ => {
            // it shouldn't be possible to get here since we mark a subcommand as
            // required
            error!("Must specify a command");
            return ExitCode::from(2);
        }
    }

    ExitCode::SUCCESS
}

#[tokio::main]
async fn run_agent(agent: Box<AgentRun>, config: Config) -> Result<(), BoxError> {
    info!(
        config = %agent.config.display(),
        zk_urls = %config.zk_urls,
        "Starting logship.",
    );

    // The position store must be usable before anything tails.
    let positions = PositionFile::open(&config.pos_path)
        .map_err(|e| -> BoxError { format!("cannot open position store: {}", e).into() })?;

    let hostname = match agent.hostname.clone() {
        Some(hostname) => hostname,
        None => gethostname().to_string_lossy().to_string(),
    };

    let (engine_tx, engine_rx) = bounded::<EngineEvent>(ENGINE_EVENT_QUEUE_SIZE);

    let coordinator = Arc::new(ZkCoordinator::start(
        ZkClientConfig {
            zk_urls: config.zk_urls.clone(),
            refresh_interval: config.refresh_interval,
            hostname,
        },
        engine_tx,
    ));

    let manager = Manager::new(
        ManagerConfig {
            refresh_interval: config.refresh_interval,
            upload_interval: config.zookeeper_upload_interval,
            stat_silent_max_ms: config.stat_silent_max_ms,
            line_max_bytes: config.line_max_bytes as usize,
        },
        positions,
        coordinator.clone() as Arc<dyn Coordination>,
        Arc::new(KafkaOutputBuilder {
            retries: config.message_send_max_retries,
        }),
    );

    let cancel = CancellationToken::new();
    let engine_cancel = cancel.clone();
    let engine_handle = std::thread::Builder::new()
        .name("tail-engine".to_string())
        .spawn(move || manager.run(engine_rx, engine_cancel))?;

    signal_wait().await;
    info!("Received shutdown signal, stopping");

    // Watchers drain and close first, then the session goes away (retiring
    // the ephemeral liveness node), then producers have already flushed.
    cancel.cancel();
    if engine_handle.join().is_err() {
        error!("tail engine panicked during shutdown");
    }
    coordinator.close();

    info!("Shutdown complete");
    Ok(())
}

async fn signal_wait() {
    let mut sig_term = sig(SignalKind::terminate());
    let mut sig_int = sig(SignalKind::interrupt());

    select! {
        _ = sig_term.recv() => {},
        _ = sig_int.recv() => {},
    }
}

fn sig(kind: SignalKind) -> Signal {
    signal(kind).unwrap()
}

type LoggerGuard = tracing_appender::non_blocking::WorkerGuard;

fn setup_logging(log_level: &str, log_format: &LogFormatArg) -> std::io::Result<LoggerGuard> {
    LogTracer::init().expect("Unable to setup log tracer!");

    let (non_blocking_writer, guard) = tracing_appender::non_blocking(std::io::stdout());

    if *log_format == LogFormatArg::Json {
        let app_name = format!("{}-{}", env!("CARGO_PKG_NAME"), get_version());
        let bunyan_formatting_layer = BunyanFormattingLayer::new(app_name, non_blocking_writer);

        let subscriber = Registry::default()
            .with(EnvFilter::new(log_level))
            .with(JsonStorageLayer)
            .with(bunyan_formatting_layer);
        tracing::subscriber::set_global_default(subscriber).unwrap();
    } else {
        // Create a formatting layer that writes to the file
        let file_layer = tracing_subscriber::fmt::layer()
            .with_writer(non_blocking_writer)
            .with_target(false)
            .with_level(true)
            .compact();

        let subscriber = Registry::default()
            .with(EnvFilter::new(log_level))
            .with(file_layer);
        tracing::subscriber::set_global_default(subscriber).unwrap();
    }
    Ok(guard)
}
