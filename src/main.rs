use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, ValueEnum};
use tokio_util::task::TaskTracker;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use whip_vision::config::{AppConfig, ConfigStore};
use whip_vision::inference::{
    AnomalyClasses, Detector, HttpDetector, InferenceScheduler, SchedulerSettings,
};
use whip_vision::state::AppState;
use whip_vision::stream::{Overlay, PreviewEncoder};
use whip_vision::web;
use whip_vision::webrtc::WebRtcTransport;

/// Log level for the application
#[derive(Debug, Clone, Copy, Default, ValueEnum)]
enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Verbose,
    Debug,
    Trace,
}

/// whip-vision command line arguments
#[derive(Parser, Debug)]
#[command(name = "whip-vision")]
#[command(version, about = "WHIP ingest server with object detection and annotated MJPEG preview", long_about = None)]
struct CliArgs {
    /// Listen address (overrides config)
    #[arg(short = 'a', long, value_name = "ADDRESS")]
    address: Option<String>,

    /// HTTP port (overrides config)
    #[arg(short = 'p', long, value_name = "PORT")]
    port: Option<u16>,

    /// Data directory path (default: ./whip-vision-data)
    #[arg(short = 'd', long, value_name = "DIR")]
    data_dir: Option<PathBuf>,

    /// Detector service endpoint (overrides config)
    #[arg(long, value_name = "URL")]
    detector_url: Option<String>,

    /// Class label treated as an anomaly; repeat for several (overrides config)
    #[arg(long = "anomaly-class", value_name = "LABEL")]
    anomaly_classes: Vec<String>,

    /// Log level (error, warn, info, verbose, debug, trace)
    #[arg(short = 'l', long, value_name = "LEVEL", default_value = "info")]
    log_level: LogLevel,

    /// Increase verbosity (-v for verbose, -vv for debug, -vvv for trace)
    #[arg(short = 'v', long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn main() -> anyhow::Result<()> {
    let args = CliArgs::parse();
    init_logging(args.log_level, args.verbose);

    tracing::info!("Starting whip-vision v{}", env!("CARGO_PKG_VERSION"));

    // CLI arg takes precedence
    let data_dir = args.data_dir.clone().unwrap_or_else(get_data_dir);
    tracing::info!("Data directory: {}", data_dir.display());

    // The runtime is sized from the config, so load it on a throwaway runtime first
    let config_store = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?
        .block_on(async {
            tokio::fs::create_dir_all(&data_dir).await?;
            ConfigStore::new(&data_dir.join("config.json")).await
        })?;

    let mut config = (*config_store.get()).clone();
    apply_cli_overrides(&mut config, &args);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(config.runtime.worker_threads.max(1))
        .max_blocking_threads(config.runtime.max_blocking_threads.max(1))
        .thread_name("whip-vision")
        .enable_all()
        .build()?;

    let shutdown_timeout = config.runtime.shutdown_timeout();
    let result = runtime.block_on(run(config_store, config, data_dir));
    // Detector or encoder jobs still on the blocking pool must not hold up exit
    runtime.shutdown_timeout(shutdown_timeout);

    tracing::info!("Server shutdown complete");
    result
}

/// Apply CLI argument overrides to config (only if explicitly specified)
fn apply_cli_overrides(config: &mut AppConfig, args: &CliArgs) {
    if let Some(ref addr) = args.address {
        config.web.bind_address = addr.clone();
    }
    if let Some(port) = args.port {
        config.web.http_port = port;
    }
    if let Some(ref url) = args.detector_url {
        config.detector.endpoint = url.clone();
    }
    if !args.anomaly_classes.is_empty() {
        config.inference.anomaly_classes = args.anomaly_classes.clone();
    }
}

async fn run(config_store: ConfigStore, config: AppConfig, data_dir: PathBuf) -> anyhow::Result<()> {
    let transport = Arc::new(WebRtcTransport::new(config.webrtc.clone()));
    let state = AppState::new(config_store, transport);

    // Detector
    let detector: Arc<dyn Detector> = Arc::new(
        HttpDetector::new(&config.detector).context("Failed to create detector")?,
    );
    let classes = AnomalyClasses::new(&config.inference.anomaly_classes);
    tracing::info!("Anomaly classes: {:?}", classes.labels());

    // Background loops
    let background = TaskTracker::new();

    let scheduler = InferenceScheduler::new(
        state.frames.clone(),
        state.results.clone(),
        state.stats.clone(),
        state.gate.clone(),
        detector,
        classes,
        SchedulerSettings::from_config(&config.inference, &data_dir),
    );
    background.spawn(scheduler.run(state.shutdown.child_token()));

    if config.preview.enabled {
        let overlay = Overlay::load(config.preview.font_path.as_deref());
        let encoder = PreviewEncoder::new(
            state.frames.clone(),
            state.results.clone(),
            state.preview.clone(),
            overlay,
            &config.preview,
        );
        background.spawn(encoder.run(state.shutdown.child_token()));
    } else {
        tracing::info!("Preview encoder disabled");
    }
    background.close();

    // HTTP server
    let ip: IpAddr = config
        .web
        .bind_address
        .parse()
        .with_context(|| format!("Invalid bind address: {}", config.web.bind_address))?;
    let addr = SocketAddr::new(ip, config.web.http_port);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    tracing::info!("Starting HTTP server on {} (WHIP endpoint /whip)", addr);

    let signal_token = state.shutdown.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        tracing::info!("Shutdown signal received");
        signal_token.cancel();
    });

    let app = web::create_router(state.clone());
    let server_token = state.shutdown.clone();
    let server = axum::serve(listener, app)
        .with_graceful_shutdown(async move { server_token.cancelled().await });
    if let Err(e) = server.await {
        tracing::error!("HTTP server error: {}", e);
    }

    state.shutdown.cancel();
    cleanup(&state, &background, config.runtime.shutdown_timeout()).await;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

/// Close sessions, stop capture and drain background loops, each bounded by `timeout`
async fn cleanup(state: &AppState, background: &TaskTracker, timeout: Duration) {
    if tokio::time::timeout(timeout, state.sessions.close_all())
        .await
        .is_err()
    {
        tracing::warn!("Timed out closing WHIP sessions");
    }

    if tokio::time::timeout(timeout, state.ingest.shutdown())
        .await
        .is_err()
    {
        tracing::warn!("Timed out stopping capture");
    }

    if tokio::time::timeout(timeout, background.wait())
        .await
        .is_err()
    {
        tracing::warn!("Timed out waiting for background tasks");
    }
}

/// Initialize logging with tracing
fn init_logging(level: LogLevel, verbose_count: u8) {
    // Verbose count overrides log level
    let effective_level = match verbose_count {
        0 => level,
        1 => LogLevel::Verbose,
        2 => LogLevel::Debug,
        _ => LogLevel::Trace,
    };

    let filter = match effective_level {
        LogLevel::Error => "whip_vision=error,tower_http=error",
        LogLevel::Warn => "whip_vision=warn,tower_http=warn",
        LogLevel::Info => "whip_vision=info,tower_http=info",
        LogLevel::Verbose => "whip_vision=debug,tower_http=info",
        LogLevel::Debug => "whip_vision=debug,tower_http=debug",
        LogLevel::Trace => "whip_vision=trace,tower_http=debug,webrtc=debug",
    };

    // Environment variable takes highest priority
    let env_filter =
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into());

    if let Err(err) = tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init()
    {
        eprintln!("failed to initialize tracing: {}", err);
    }
}

/// Get the data directory
fn get_data_dir() -> PathBuf {
    // Check environment variable first
    if let Ok(path) = std::env::var("WHIP_VISION_DATA_DIR") {
        return PathBuf::from(path);
    }

    PathBuf::from("./whip-vision-data")
}
