//! gittp - git smart HTTP server with push hooks.

use anyhow::Context;
use clap::Parser;
use gittp_server::{
    api::{create_router, AppState},
    observability::{init_logging, LogFormat},
    Config, GitServer,
};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

/// gittp - serve git repositories over smart HTTP
#[derive(Parser, Debug)]
#[command(name = "gittp")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to a YAML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Port to listen on (all interfaces)
    #[arg(long)]
    port: Option<u16>,

    /// Full listen address; takes precedence over --port
    #[arg(long)]
    listen: Option<SocketAddr>,

    /// Directory where pushed repositories are stored
    #[arg(long)]
    path: Option<PathBuf>,

    /// Only allow pushing to master
    #[arg(long)]
    masteronly: bool,

    /// Create repositories on first push
    #[arg(long)]
    autocreate: bool,

    /// Enable debug logging
    #[arg(long)]
    debug: bool,

    /// Log format (pretty or json)
    #[arg(long)]
    log_format: Option<String>,

    /// Deadline for a single git process, in seconds
    #[arg(long)]
    timeout: Option<u64>,
}

impl Args {
    /// Applies command line flags over the file configuration.
    fn apply(self, mut config: Config) -> Config {
        if let Some(port) = self.port {
            config.listen.set_port(port);
        }
        if let Some(listen) = self.listen {
            config.listen = listen;
        }
        if let Some(path) = self.path {
            config.path = path;
        }
        if let Some(format) = self.log_format {
            config.log_format = format;
        }
        if let Some(timeout) = self.timeout {
            config.command_timeout_secs = timeout;
        }
        config.master_only |= self.masteronly;
        config.auto_create |= self.autocreate;
        config.debug |= self.debug;
        config
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let file_config = match &args.config {
        Some(path) => Config::from_file(path)?,
        None => Config::default(),
    };
    let config = args.apply(file_config);

    init_logging(
        config.effective_log_level(),
        LogFormat::parse(&config.log_format),
    );

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "Starting gittp");

    let server_config = config.server_config()?;
    tracing::info!(
        listen = %config.listen,
        path = %server_config.storage_root.display(),
        auto_create = config.auto_create,
        master_only = config.master_only,
        timeout_secs = config.command_timeout_secs,
        "Server configuration"
    );

    let server = GitServer::new(server_config, Arc::new(config.git_backend()));
    let app = create_router(AppState::new(server, config.max_body_bytes));

    let listener = tokio::net::TcpListener::bind(config.listen)
        .await
        .with_context(|| format!("binding {}", config.listen))?;

    tracing::info!(addr = %config.listen, "Listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    tracing::info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Could not listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}
