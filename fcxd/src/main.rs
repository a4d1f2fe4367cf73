use anyhow::Result;
use clap::Parser;
use fcx_core::{RequestHandler, Spawned};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

use fcxd::listener::Listener;
use fcxd::router::Router;

#[derive(Parser)]
#[command(name = "fcxd", about = "FastCGI application endpoint")]
struct Cli {
    /// Path to configuration file.
    #[arg(short, long)]
    config: PathBuf,

    /// Listen address (TCP "host:port" or "unix:///path").
    /// Overrides the config file's `listen` field when provided.
    #[arg(short, long)]
    listen: Option<String>,

    /// Maximum concurrent connections. Overrides config.
    #[arg(short = 'm', long)]
    max_connections: Option<usize>,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut cfg = fcxd::config::load_config(&cli.config)?;
    if let Some(listen) = cli.listen {
        cfg.listen = listen;
    }
    if let Some(max) = cli.max_connections {
        cfg.max_connections = max;
    }
    cfg.validate()?;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&cfg.log_level)),
        )
        .init();

    let router = Router::new(&cfg)?;
    let handler: Arc<dyn RequestHandler> = Arc::new(Spawned::new(router));

    let listener = Listener::bind(&cfg.listen).await?;
    info!(
        listen = %listener.local_addr()?,
        handlers = cfg.handlers.len(),
        max_connections = cfg.max_connections,
        "fcxd listening"
    );

    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for shutdown signal");
            std::future::pending::<()>().await;
        }
        info!("shutdown requested");
    };
    listener
        .serve(handler, cfg.connection_config(), cfg.max_connections, shutdown)
        .await
}
