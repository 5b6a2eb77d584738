//! Fieldlink - MQTT field gateway
//!
//! Usage:
//!   fieldlink [OPTIONS]
//!
//! Options:
//!   -c, --config <FILE>    Configuration file path
//!   -w, --ws-bind <ADDR>   WebSocket bind address (default: 0.0.0.0:8000)
//!   -b, --broker <ADDR>    MQTT broker address (default: localhost:1883)
//!   -l, --log-level        Log level (error, warn, info, debug, trace)
//!   -h, --help             Print help

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use fieldlink::config::Config;
use fieldlink::gateway::Gateway;
use fieldlink::ingress::{run_dispatcher, IngressAdapter, MessageBus};
use fieldlink::persistence;
use fieldlink::transport::WsServer;

/// How long shutdown waits for the MQTT client thread
const MQTT_JOIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Log level for CLI
#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogLevel {
    /// Only errors
    Error,
    /// Warnings and errors
    Warn,
    /// Informational messages
    Info,
    /// Debug messages
    Debug,
    /// Trace messages (very verbose)
    Trace,
}

impl LogLevel {
    fn as_str(self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

/// Fieldlink - MQTT field gateway
#[derive(Parser, Debug)]
#[command(name = "fieldlink")]
#[command(author = "Fieldlink Contributors")]
#[command(version)]
#[command(about = "Edge gateway bridging MQTT field devices to live WebSocket clients")]
struct Args {
    /// Configuration file path (TOML format)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// WebSocket bind address
    #[arg(short, long)]
    ws_bind: Option<SocketAddr>,

    /// MQTT broker address (host:port)
    #[arg(short, long)]
    broker: Option<String>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(short, long, value_enum)]
    log_level: Option<LogLevel>,
}

// One cooperative scheduler drives dispatch, caching, sweeps and sockets;
// only the MQTT client loop runs on a thread of its own
#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => match Config::load(path) {
            Ok(cfg) => cfg,
            Err(e) => {
                eprintln!("Error loading config file: {}", e);
                std::process::exit(1);
            }
        },
        None => Config::from_env()?,
    };

    // RUST_LOG wins, then the CLI, then the config file
    let level = args
        .log_level
        .map(LogLevel::as_str)
        .unwrap_or(config.log.level.as_str());
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    if let Some(path) = &args.config {
        info!("Loaded configuration from {:?}", path);
    }

    // CLI args override file config
    if let Err(e) = config.apply_overrides(args.ws_bind, args.broker) {
        error!("Invalid command-line override: {}", e);
        std::process::exit(1);
    }

    info!("Starting Fieldlink gateway");
    info!("  Gateway: {} (farm {})", config.gateway.id, config.gateway.farm_id);
    info!("  Broker: {}", config.mqtt.address);
    info!(
        "  WebSocket: {} (path: {})",
        config.server.ws_bind, config.server.ws_path
    );
    if config.liveness.enabled {
        info!(
            "  Liveness: every {:?}, grace {:?}",
            config.liveness.interval, config.liveness.grace
        );
    } else {
        info!("  Liveness: disabled");
    }

    let store = persistence::open_store(&config.persistence)?;
    let (adapter, events) = IngressAdapter::start(&config)?;
    let bus: Arc<dyn MessageBus> = adapter.clone();

    let gateway = Arc::new(Gateway::new(&config, bus, Arc::clone(&store)));
    gateway.install_handlers();

    let shutdown = CancellationToken::new();

    let dispatcher = tokio::spawn(run_dispatcher(
        Arc::clone(&adapter),
        Arc::clone(gateway.registry()),
        events,
        shutdown.clone(),
    ));

    let sweeper = if config.liveness.enabled {
        Some(gateway.spawn_liveness_sweeper(shutdown.clone()))
    } else {
        None
    };

    let server = WsServer::bind(config.server.ws_bind, Arc::clone(&gateway), &config.server).await?;
    let server = tokio::spawn(server.run(shutdown.clone()));

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");

    shutdown.cancel();
    adapter.stop();
    gateway.connections().close_all();

    let _ = server.await;
    let _ = dispatcher.await;
    if let Some(sweeper) = sweeper {
        let _ = sweeper.await;
    }

    // The dispatcher dropped the event receiver, so the client thread cannot
    // block on a full channel
    if let Some(event_thread) = adapter.take_event_thread() {
        let waited = tokio::time::timeout(MQTT_JOIN_TIMEOUT, async {
            while !event_thread.is_finished() {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await;
        if waited.is_err() {
            warn!("MQTT thread did not stop within {:?}", MQTT_JOIN_TIMEOUT);
        } else if event_thread.join().is_err() {
            error!("MQTT thread panicked");
        } else {
            debug!("MQTT thread joined");
        }
    }

    if let Err(e) = store.close().await {
        error!("Failed to close store: {}", e);
    }

    info!("Fieldlink stopped");
    Ok(())
}
