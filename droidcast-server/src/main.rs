//! droidcast server entry point.
//!
//! ```text
//! droidcast-server                  Serve using droidcast.toml (or defaults)
//! droidcast-server --config <path>  Load a custom config TOML
//! droidcast-server --device <id>    Start streaming this adb serial at launch
//! droidcast-server --gen-config     Write default config to stdout
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use droidcast_core::{AdbDevice, CaptureEngine};
use droidcast_server::config::ServerConfig;
use droidcast_server::routes;

// ── CLI ──────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(name = "droidcast-server", about = "Android screen streaming server")]
struct Cli {
    /// Path to configuration TOML file.
    #[arg(short, long, default_value = "droidcast.toml")]
    config: PathBuf,

    /// adb serial to stream at startup (overrides `[device] device_id`).
    #[arg(short, long)]
    device: Option<String>,

    /// Print the default configuration to stdout and exit.
    #[arg(long)]
    gen_config: bool,
}

// ── Main ─────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // --gen-config: dump defaults and exit.
    if cli.gen_config {
        println!("{}", ServerConfig::default().to_toml()?);
        return Ok(());
    }

    let mut config = ServerConfig::load(&cli.config);
    if let Some(device) = cli.device {
        config.device.device_id = device;
    }

    // Init tracing.
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("droidcast-server v{}", env!("CARGO_PKG_VERSION"));
    info!("adb: {}", config.engine.adb_path.display());
    info!(
        "stream: quality {} / max width {} / {} fps",
        config.stream.quality, config.stream.max_width, config.stream.fps
    );

    let device = Arc::new(AdbDevice::new(&config.engine));
    let engine = Arc::new(CaptureEngine::with_settings(
        device,
        config.engine.clone(),
        config.stream,
    ));

    if let Some(id) = config.startup_device() {
        if let Err(e) = engine.start_streaming(id).await {
            warn!("could not start streaming {id}: {e}");
        }
    }

    let listener = TcpListener::bind(config.network.bind).await?;
    info!("listening on http://{}", listener.local_addr()?);

    // Open MJPEG bodies and push loops must end before graceful shutdown
    // can complete.
    let stopping = engine.clone();
    axum::serve(listener, routes::router(engine))
        .with_graceful_shutdown(async move {
            tokio::signal::ctrl_c().await.ok();
            info!("Ctrl-C received, shutting down");
            stopping.stop_streaming().await;
            stopping.push_hub().disconnect_all();
        })
        .await?;

    Ok(())
}
