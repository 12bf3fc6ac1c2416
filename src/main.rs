//! Agent Canvas Server
//!
//! Runs interactive coding agents in pseudo-terminals and streams their output
//! to canvas clients over WebSocket.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::signal;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use agent_canvas::agent::SessionRegistry;
use agent_canvas::config::Settings;
use agent_canvas::layout::{LayoutStore, LayoutWriter, PersistedLayout};
use agent_canvas::pty::PtyAdapter;
use agent_canvas::server::{ServerConfig, WebSocketServer};

/// Agent Canvas Server
///
/// Session orchestration for concurrent interactive agents
#[derive(Parser, Debug)]
#[command(name = "agent-canvas")]
#[command(version, about, long_about = None)]
struct Args {
    /// Port to listen on
    #[arg(short, long, default_value_t = 9000)]
    port: u16,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Bind address
    #[arg(long, default_value = "127.0.0.1")]
    bind: String,

    /// Project directory holding settings and the saved canvas layout
    #[arg(short, long, default_value = ".")]
    dir: PathBuf,

    /// Write the effective settings to the project directory and exit
    #[arg(long)]
    write_config: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize logging
    let log_level = if args.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };

    FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .compact()
        .init();

    info!("Agent Canvas v{}", env!("CARGO_PKG_VERSION"));

    let project_dir = args
        .dir
        .canonicalize()
        .with_context(|| format!("Project directory not found: {}", args.dir.display()))?;

    let settings = match Settings::load(&project_dir) {
        Ok(settings) => settings,
        Err(e) => {
            warn!("Failed to load settings, using defaults: {}", e);
            Settings::default()
        }
    };

    if args.write_config {
        settings.save(&project_dir)?;
        info!("Settings written to {}", Settings::state_dir(&project_dir).display());
        return Ok(());
    }

    info!(
        "Project {} with {} configured agents",
        project_dir.display(),
        settings.agents.len()
    );

    // Saved layout
    let store = LayoutStore::for_project(&project_dir, settings.layout.grid_size);
    let saved = match store.load_layout() {
        Ok(layout) => layout,
        Err(e) => {
            warn!("Failed to load layout from {}: {}", store.path().display(), e);
            PersistedLayout::default()
        }
    };

    let writer = LayoutWriter::spawn(
        Arc::new(store),
        PersistedLayout::default(),
        settings.layout.debounce(),
    );

    let registry = Arc::new(SessionRegistry::new(
        Arc::new(PtyAdapter::new()),
        settings,
        Some(writer.clone()),
    ));

    registry.restore(saved).await;

    // Create and start the WebSocket server
    let config = ServerConfig::new(args.bind, args.port, project_dir);
    let server = Arc::new(WebSocketServer::new(config, Arc::clone(&registry)));
    let server_handle = Arc::clone(&server);

    // Spawn shutdown signal handler
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("Initiating graceful shutdown...");
        server_handle.shutdown();
    });

    // Run the server
    server.run().await?;

    registry.shutdown_all().await;
    if !writer.flush().await {
        warn!("Final layout write failed");
    }

    info!("Server shutdown complete");
    Ok(())
}

/// Wait for shutdown signal (SIGTERM or SIGINT)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received SIGINT (Ctrl+C)");
        }
        _ = terminate => {
            info!("Received SIGTERM");
        }
    }
}
