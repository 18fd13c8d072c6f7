//! # lookout
//!
//! Lookout server binary: loads settings, wires the delivery pipeline to the
//! agent-status service, and serves viewers until Ctrl-C.

#![deny(unsafe_code)]

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use lookout_server::collaborators::HttpServiceClient;
use lookout_server::{LookoutServer, Pipeline};
use lookout_settings::LookoutSettings;
use tokio_util::sync::CancellationToken;

/// Lookout delivery server.
#[derive(Parser, Debug)]
#[command(name = "lookout", about = "Priority-tiered agent activity delivery server")]
struct Cli {
    /// Settings file (defaults to `~/.lookout/settings.json`).
    #[arg(long)]
    settings: Option<PathBuf>,

    /// Host to bind (overrides settings).
    #[arg(long)]
    host: Option<String>,

    /// Port to bind, 0 for auto-assign (overrides settings).
    #[arg(long)]
    port: Option<u16>,

    /// Log filter directive (overrides settings; `RUST_LOG` still wins).
    #[arg(long)]
    log_level: Option<String>,

    /// Emit JSON log lines.
    #[arg(long)]
    json_logs: bool,
}

impl Cli {
    fn load_settings(&self) -> Result<LookoutSettings> {
        let mut settings = match &self.settings {
            Some(path) => lookout_settings::load_settings_from_path(path)
                .with_context(|| format!("Failed to load settings from {}", path.display()))?,
            None => lookout_settings::load_settings().context("Failed to load settings")?,
        };
        if let Some(host) = &self.host {
            settings.server.host.clone_from(host);
        }
        if let Some(port) = self.port {
            settings.server.port = port;
        }
        if let Some(level) = &self.log_level {
            settings.logging.level.clone_from(level);
        }
        if self.json_logs {
            settings.logging.json = true;
        }
        Ok(settings)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = cli.load_settings()?;
    lookout_core::logging::init(&settings.logging.level, settings.logging.json);

    let metrics = match lookout_server::metrics::install_recorder() {
        Ok(handle) => Some(handle),
        Err(e) => {
            tracing::warn!(error = %e, "prometheus recorder unavailable, /metrics disabled");
            None
        }
    };

    let client = Arc::new(
        HttpServiceClient::new(&settings.collaborator)
            .context("Failed to build agent-status service client")?,
    );
    let pipeline = Arc::new(Pipeline::new(&settings, client.clone(), client));
    let _ = pipeline.start();

    let server = LookoutServer::new(settings.server.clone(), Arc::clone(&pipeline), metrics);
    let stop = CancellationToken::new();
    let (addr, handle) = server
        .listen(stop.clone())
        .await
        .context("Failed to bind server")?;
    tracing::info!("Lookout listening on http://{addr} (viewers at ws://{addr}/ws)");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;

    tracing::info!("Shutting down...");
    stop.cancel();
    let _ = handle.await;
    pipeline.shutdown().await;

    tracing::info!("Shutdown complete");
    Ok(())
}
