//! CamGate server binary
//!
//! Entry point for the MJPEG-to-WebRTC gateway service.
//!
//! # Usage
//!
//! ```bash
//! # Bridge a camera feed, no analysis
//! cargo run --bin camgate-server -- --source-url http://camera.local/stream
//!
//! # Forward frames to a vision API
//! CAMGATE_ANALYSIS_KEY=sk-... cargo run --bin camgate-server -- \
//!   --source-url http://camera.local/stream \
//!   --analysis \
//!   --analysis-prompt "Describe any people in view"
//! ```

use anyhow::Result;
use clap::Parser;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::broadcast;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use camgate::analysis::AnalysisWorker;
use camgate::config::{AnalysisWireFormat, Config};
use camgate::media::{CameraSource, FrameRelay};
use camgate::peer::PeerManager;
use camgate::signaling::{build_router, AppState};

/// MJPEG camera to WebRTC gateway
#[derive(Parser, Debug)]
#[command(name = "camgate-server", version, about, long_about = None)]
struct Args {
    /// MJPEG source URL (multipart/x-mixed-replace)
    #[arg(long, env = "CAMGATE_SOURCE_URL")]
    source_url: Option<String>,

    /// Host to bind the HTTP server to
    #[arg(long, default_value = "0.0.0.0", env = "CAMGATE_HOST")]
    host: String,

    /// HTTP listen port
    #[arg(long, default_value_t = 8080, env = "CAMGATE_PORT")]
    port: u16,

    /// Nominal source frame rate
    #[arg(long, default_value_t = 30, env = "CAMGATE_FPS")]
    fps: u32,

    /// STUN servers (comma-separated)
    #[arg(long, value_delimiter = ',', env = "CAMGATE_STUN_SERVERS")]
    stun_servers: Option<Vec<String>>,

    /// Maximum concurrent peer connections
    #[arg(long, default_value_t = 16, env = "CAMGATE_MAX_CONNECTIONS")]
    max_connections: usize,

    /// Enable frame analysis submission
    #[arg(long, default_value_t = false, env = "CAMGATE_ANALYSIS")]
    analysis: bool,

    /// Analysis collaborator endpoint
    #[arg(long, env = "CAMGATE_ANALYSIS_ENDPOINT")]
    analysis_endpoint: Option<String>,

    /// Analysis API key
    #[arg(long, env = "CAMGATE_ANALYSIS_KEY", hide_env_values = true)]
    analysis_key: Option<String>,

    /// Analysis model identifier
    #[arg(long, env = "CAMGATE_ANALYSIS_MODEL")]
    analysis_model: Option<String>,

    /// Prompt sent alongside each frame
    #[arg(long, env = "CAMGATE_ANALYSIS_PROMPT")]
    analysis_prompt: Option<String>,

    /// Analysis wire format: chat-completions, raw-jpeg
    #[arg(long, default_value = "chat-completions", env = "CAMGATE_ANALYSIS_FORMAT")]
    analysis_format: WireFormatArg,
}

/// Wire format CLI argument wrapper
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
enum WireFormatArg {
    /// JSON chat payload carrying the image as a base64 data URL
    ChatCompletions,
    /// Binary JPEG POST with the prompt in a request header
    RawJpeg,
}

impl From<WireFormatArg> for AnalysisWireFormat {
    fn from(arg: WireFormatArg) -> Self {
        match arg {
            WireFormatArg::ChatCompletions => AnalysisWireFormat::ChatCompletions,
            WireFormatArg::RawJpeg => AnalysisWireFormat::RawJpeg,
        }
    }
}

/// Build a Config from CLI arguments, starting from defaults
fn build_config(args: &Args) -> Config {
    let mut config = Config::default();

    if let Some(url) = &args.source_url {
        config.source.url = url.clone();
    }
    config.server.host = args.host.clone();
    config.server.port = args.port;
    config.source.fps = args.fps;
    if let Some(stun) = &args.stun_servers {
        config.media.stun_servers = stun.clone();
    }
    config.media.max_connections = args.max_connections;

    config.analysis.enabled = args.analysis;
    if let Some(endpoint) = &args.analysis_endpoint {
        config.analysis.endpoint = endpoint.clone();
    }
    if let Some(key) = &args.analysis_key {
        config.analysis.api_key = key.clone();
    }
    if let Some(model) = &args.analysis_model {
        config.analysis.model = model.clone();
    }
    if let Some(prompt) = &args.analysis_prompt {
        config.analysis.prompt = prompt.clone();
    }
    config.analysis.format = args.analysis_format.into();

    config
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    let config = build_config(&args);
    config.validate()?;

    info!(
        version = camgate::version(),
        source = %config.source.url,
        port = config.server.port,
        max_connections = config.media.max_connections,
        analysis = config.analysis.enabled,
        "Starting CamGate"
    );

    // Connect to the camera before accepting any viewers
    let camera = CameraSource::connect(&config.source).await?;
    info!("MJPEG source connected");

    let relay = FrameRelay::spawn(camera, config.media.relay_capacity);

    // Analysis worker, only when configured
    let (analysis_handle, analysis_task) = if config.analysis.enabled {
        let (handle, task) = AnalysisWorker::spawn(&config.analysis)?;
        (Some(handle), Some(task))
    } else {
        (None, None)
    };

    let manager = Arc::new(PeerManager::new(
        config.media.clone(),
        Arc::clone(&relay),
        analysis_handle,
    ));

    // Create shutdown signal channel
    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    // Spawn connection event dispatch loop
    let dispatch_handle = {
        let manager = Arc::clone(&manager);
        let shutdown_rx = shutdown_tx.subscribe();
        tokio::spawn(async move {
            manager.run(shutdown_rx).await;
        })
    };

    // Build HTTP signaling router
    let state = AppState::new(Arc::clone(&manager));
    let router = build_router(state);

    let bind_addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = TcpListener::bind(&bind_addr).await?;
    info!("HTTP signaling listening on {}", bind_addr);

    // Run the HTTP server with graceful shutdown on SIGTERM/SIGINT
    let shutdown_tx_clone = shutdown_tx.clone();
    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            info!("Shutdown signal received, closing connections...");
            let _ = shutdown_tx_clone.send(());
        })
        .await?;

    // Tear down in dependency order: peers first, then the shared feed
    let _ = shutdown_tx.send(());
    manager.shutdown().await;
    relay.close().await;
    let _ = dispatch_handle.await;
    if let Some(task) = analysis_task {
        task.abort();
        let _ = task.await;
    }

    info!("CamGate shutdown complete");
    Ok(())
}

/// Wait for shutdown signal (SIGTERM or SIGINT)
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
