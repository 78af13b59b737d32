use scriptgate::config::Config;
use scriptgate::handler::HandlerSettings;
use scriptgate::pool::HandlerPool;
use scriptgate::process::Launcher;
use scriptgate::proxy::ProxyServer;
use scriptgate::{PKG_NAME, VERSION};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("scriptgate=debug".parse().expect("valid log directive")),
        )
        .init();

    // Load configuration
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("scriptgate.toml"));

    let config = if config_path.exists() {
        let config = Config::load(&config_path).map_err(|e| {
            error!(path = %config_path.display(), error = %e, "Failed to load configuration");
            e
        })?;
        info!(path = %config_path.display(), "Configuration loaded");
        config
    } else {
        warn!(path = %config_path.display(), "Configuration file not found, using defaults");
        Config::default()
    };

    print_startup_banner(&config);

    let bind_addr: SocketAddr = format!("{}:{}", config.server.bind, config.server.port)
        .parse()
        .map_err(|e| {
            error!(bind = %config.server.bind, port = config.server.port, error = %e, "Invalid bind address");
            anyhow::anyhow!("Invalid bind address: {}", e)
        })?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let launcher = Launcher::new(config.interpreter.clone());
    let pool = HandlerPool::new(
        launcher,
        HandlerSettings::from(&config.handler),
        &config.pool,
    );

    let server = ProxyServer::new(bind_addr, Arc::clone(&pool), shutdown_rx);
    let server_handle = tokio::spawn(async move {
        if let Err(e) = server.run().await {
            error!(error = %e, "Server error");
        }
    });

    // Wait for shutdown signal (Ctrl+C or SIGTERM)
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received SIGINT (Ctrl+C), shutting down...");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("Received Ctrl+C, shutting down...");
    }

    // Signal shutdown
    let _ = shutdown_tx.send(true);

    info!("Stopping queued handlers...");
    pool.shutdown().await;

    let _ = tokio::time::timeout(Duration::from_secs(5), server_handle).await;

    let stats = pool.stats();
    info!(
        handlers_started = stats.get_handlers_started(),
        handlers_served = stats.get_handlers_served(),
        launch_failures = stats.get_launch_failures(),
        handlers_discarded = stats.get_handlers_discarded(),
        "Shutdown complete"
    );
    Ok(())
}

fn print_startup_banner(config: &Config) {
    info!(name = PKG_NAME, version = VERSION, "Starting script gateway");
    info!(
        bind = %config.server.bind,
        port = config.server.port,
        "Server configuration"
    );
    info!(
        program = %config.interpreter.program,
        document_root = %config.interpreter.document_root.display(),
        router = ?config.interpreter.router,
        base_port = config.interpreter.base_port,
        max_port = config.interpreter.max_port,
        startup_grace_ms = config.interpreter.startup_grace_ms,
        "Interpreter settings"
    );
    info!(
        timeout_ms = config.handler.timeout_ms,
        ignore = ?config.handler.ignore,
        "Request handling settings"
    );
    info!(
        capacity = config.pool.capacity,
        retry_backoff_ms = config.pool.retry_backoff_ms,
        "Handler pool settings"
    );
}
