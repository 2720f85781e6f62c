use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use picshelf::{telemetry, web, AppContext};
use shelfconf::ShelfConfig;
use tokio_util::sync::CancellationToken;

/// The picshelf image upload server
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Config file to load instead of ./picshelf.toml
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Directory for the registry database and filesystem backends
    #[arg(short, long)]
    state_dir: Option<PathBuf>,

    /// Address to bind
    #[arg(long)]
    host: Option<String>,

    /// Port to listen on
    #[arg(short, long)]
    port: Option<u16>,

    /// Print the effective configuration as TOML and exit
    #[arg(long)]
    print_config: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let (mut config, sources) = ShelfConfig::load_with_sources_from(cli.config.as_deref())
        .context("Failed to load configuration")?;

    // CLI flags win over files and environment
    if let Some(state_dir) = cli.state_dir {
        config.paths.state_dir = state_dir;
    }
    if let Some(host) = cli.host {
        config.bind.host = host;
    }
    if let Some(port) = cli.port {
        config.bind.http_port = port;
    }

    if cli.print_config {
        print!("{}", config.to_toml());
        return Ok(());
    }

    telemetry::init(&config.telemetry.log_level).context("Failed to initialize logging")?;

    for file in &sources.files {
        tracing::info!("📄 Loaded config: {}", file.display());
    }
    if !sources.env_overrides.is_empty() {
        tracing::info!("   Environment overrides: {}", sources.env_overrides.join(", "));
    }

    std::fs::create_dir_all(&config.paths.state_dir).context("Failed to create state directory")?;
    tracing::info!("Using state directory: {}", config.paths.state_dir.display());

    let app = AppContext::from_config(&config)?;
    let app_router = web::router(web::WebState::new(app));

    let addr = format!("{}:{}", config.bind.host, config.bind.http_port);
    let bind_addr: std::net::SocketAddr = addr.parse().context("Failed to parse bind address")?;
    let listener = tokio::net::TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("Failed to bind {bind_addr}"))?;

    tracing::info!("🖼️  picshelf starting on http://{}", addr);
    tracing::info!("   Upload: POST http://{}/images?name=<file>", addr);
    tracing::info!("   Gallery: GET http://{}/images", addr);
    tracing::info!("   Cleanup: POST http://{}/cleanup", addr);
    tracing::info!("   Health: GET http://{}/health", addr);

    let shutdown_token = CancellationToken::new();
    let shutdown_token_srv = shutdown_token.clone();
    let server = axum::serve(listener, app_router).with_graceful_shutdown(async move {
        shutdown_token_srv.cancelled().await;
        tracing::info!("Server shutdown signal received");
    });

    let server_handle = tokio::spawn(async move {
        if let Err(e) = server.await {
            tracing::error!("Server shutdown with error: {:?}", e);
        }
    });

    tracing::info!("📚 Server ready.");

    // Handle both SIGINT (Ctrl+C) and SIGTERM (systemd, containers)
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Received SIGINT (Ctrl+C), shutting down gracefully...");
        }
        result = sigterm() => {
            result?;
            tracing::info!("Received SIGTERM, shutting down gracefully...");
        }
    }
    shutdown_token.cancel();

    server_handle.await.context("Server task panicked")?;
    tracing::info!("Shutdown complete");
    Ok(())
}

#[cfg(unix)]
async fn sigterm() -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = signal(SignalKind::terminate()).context("Failed to setup SIGTERM handler")?;
    sigterm.recv().await;
    Ok(())
}

#[cfg(not(unix))]
async fn sigterm() -> Result<()> {
    std::future::pending::<()>().await;
    Ok(())
}
