use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use kernel_channel::KernelManager;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::prelude::*;

use kernel_bridge::app::{AppState, build_router};
use kernel_bridge::config::{self, BridgeConfig, FileConfig, ServerConfig};
use kernel_bridge::metrics::BridgeMetrics;
use kernel_bridge::surface::BridgeContext;

#[derive(Parser)]
#[command(name = "kernel-bridge")]
#[command(about = "Jupyter transport bridge for local and remote kernels")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Configuration directory (defaults to the platform config dir)
    #[arg(long, global = true)]
    config_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the bridge server in the foreground
    Serve(ServeArgs),

    /// Print the resolved configuration as TOML
    Config,
}

#[derive(Parser, Default)]
struct ServeArgs {
    /// Port for the web server (overrides config)
    #[arg(short, long)]
    port: Option<u16>,

    /// Host to bind to (overrides config)
    #[arg(short = 'b', long)]
    host: Option<String>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config_dir = cli.config_dir.unwrap_or_else(config::default_config_dir);
    let file_config: FileConfig = config::load_config(&config_dir)
        .extract()
        .with_context(|| format!("Invalid configuration in {}", config_dir.display()))?;

    match cli.command {
        Some(Commands::Config) => {
            let text = toml::to_string_pretty(&file_config)
                .context("Failed to render configuration")?;
            print!("{}", text);
            Ok(())
        }
        Some(Commands::Serve(args)) => run_server(args, file_config).await,
        None => run_server(ServeArgs::default(), file_config).await,
    }
}

async fn run_server(args: ServeArgs, file_config: FileConfig) -> Result<()> {
    // Setup logging
    let default_directive = if args.debug {
        "kernel_bridge=debug,kernel_channel=debug,tower_http=debug,info"
    } else {
        "kernel_bridge=info,kernel_channel=info,tower_http=info,warn"
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_directive));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(env_filter)
        .init();

    info!("Starting Kernel Bridge");

    let mut server_config = ServerConfig::from_file(&file_config.server);
    if let Some(host) = args.host {
        server_config.host = host;
    }
    if let Some(port) = args.port {
        server_config.port = port;
    }
    let bridge_config = BridgeConfig::from_file(&file_config);
    info!(
        "Bridge config: local_marker={}, event_channel_capacity={}, remote_connect_timeout={:?}",
        bridge_config.local_marker,
        bridge_config.event_channel_capacity,
        bridge_config.remote_connect_timeout
    );
    match &bridge_config.default_kernel {
        Some(spec) => info!("Default kernel command: {} {:?}", spec.command, spec.args),
        None => info!("No default kernel command configured ([kernel] command)"),
    }

    let kernels = KernelManager::new();
    let metrics = Arc::new(BridgeMetrics::new());
    let bridge = BridgeContext::new(kernels.clone(), bridge_config, metrics);
    let app = build_router(AppState { bridge });

    let addr = server_config.socket_addr()?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    let actual_addr = listener.local_addr()?;

    info!("Kernel Bridge listening on http://{}", actual_addr);
    info!("API endpoints:");
    info!("  GET    /api/bridge              - Bridge WebSocket (one per UI surface)");
    info!("  GET    /api/local-kernels       - List local kernels");
    info!("  POST   /api/local-kernels       - Launch a local kernel");
    info!("  DELETE /api/local-kernels/:id   - Shut down a local kernel");

    let shutdown_signal = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
        info!("Received shutdown signal, cleaning up...");
    };

    let server_result = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal)
        .await
        .context("Server error");

    info!("Stopping local kernels...");
    let stopped = kernels.shutdown_all().await;
    info!("Stopped {} kernels", stopped);

    info!("Shutdown complete");
    server_result
}
