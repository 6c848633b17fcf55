// src/main.rs
//! Cillow broker binary.

use anyhow::Result;
use clap::Parser;
use cillow::interpreter::hooks::{self, prebuilt};
use cillow::{Server, ServerConfig};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "cillow", version, about = "Code-execution broker")]
struct Args {
    /// Address to bind the request socket to.
    #[arg(long)]
    host: Option<String>,

    /// Port to bind the request socket to.
    #[arg(long)]
    port: Option<u16>,

    /// Maximum total interpreter processes.
    #[arg(long)]
    max_interpreters: Option<usize>,

    /// Maximum interpreter processes per client.
    #[arg(long)]
    interpreters_per_client: Option<usize>,

    /// Number of dispatcher tasks.
    #[arg(long)]
    dispatchers: Option<usize>,

    /// Maximum request queue size.
    #[arg(long)]
    queue_size: Option<usize>,
}

impl Args {
    fn into_config(self) -> ServerConfig {
        let mut config = ServerConfig::from_env();
        if let Some(host) = self.host {
            config.host = host;
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(n) = self.max_interpreters {
            config.max_interpreters = n;
        }
        if let Some(n) = self.interpreters_per_client {
            config.interpreters_per_client = n;
        }
        if let Some(n) = self.dispatchers {
            config.dispatchers = n;
        }
        if let Some(n) = self.queue_size {
            config.queue_size = n;
        }
        config.normalize()
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    info!("starting cillow broker v{}", cillow::VERSION);

    // Capture hooks every worker inherits: textual output, matplotlib
    // figures, and Pillow images.
    hooks::add_hooks(prebuilt::default_hooks());

    let args = Args::parse();
    let server = Server::bind(args.into_config()).await?;

    let shutdown = server.shutdown_token();
    tokio::spawn(async move {
        wait_for_signal().await;
        info!("received interrupt, shutting down");
        shutdown.cancel();
    });

    server.run().await?;
    Ok(())
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut term = match signal(SignalKind::terminate()) {
        Ok(term) => term,
        Err(_) => {
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = term.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
