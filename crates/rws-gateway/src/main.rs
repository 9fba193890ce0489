//! # rws-gateway
//!
//! Remote `WebSocket` scripting gateway: loads settings, installs logging and
//! metrics, registers the demo objects and serves until Ctrl-C.

#![deny(unsafe_code)]

mod demo;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use rws_core::RwsContext;
use rws_server::shutdown::wait_for_signal;
use rws_server::{RwsServer, ServerConfig};
use rws_settings::{LogLevel, RwsSettings};

/// Remote `WebSocket` scripting gateway.
#[derive(Parser, Debug)]
#[command(name = "rws-gateway", about = "Remote WebSocket scripting gateway")]
struct Cli {
    /// Settings file (defaults to `~/.rws/settings.json`).
    #[arg(long)]
    settings: Option<PathBuf>,

    /// Host to bind (overrides settings).
    #[arg(long)]
    host: Option<String>,

    /// Port to bind (overrides settings).
    #[arg(long)]
    port: Option<u16>,

    /// Log level (overrides settings; `RUST_LOG` still wins).
    #[arg(long)]
    log_level: Option<String>,

    /// Emit logs as JSON lines.
    #[arg(long)]
    json_logs: bool,

    /// Start without the demo objects.
    #[arg(long)]
    no_demo: bool,
}

impl Cli {
    fn load_settings(&self) -> Result<RwsSettings> {
        let path = self
            .settings
            .clone()
            .unwrap_or_else(rws_settings::settings_path);
        let mut settings = rws_settings::load_settings_from_path(&path)
            .with_context(|| format!("Failed to load settings from {}", path.display()))?;

        if let Some(host) = &self.host {
            settings.server.host.clone_from(host);
        }
        if let Some(port) = self.port {
            settings.server.port = port;
        }
        if let Some(level) = &self.log_level {
            settings.logging.level = LogLevel::parse(level)
                .with_context(|| format!("Unknown log level '{level}'"))?;
        }
        settings.validate().context("Invalid settings")?;
        Ok(settings)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = cli.load_settings()?;

    let level = settings.logging.level.as_filter_str();
    if cli.json_logs || settings.logging.json {
        rws_core::logging::init_json_subscriber(level);
    } else {
        rws_core::logging::init_subscriber(level);
    }

    let metrics = match rws_server::metrics::install_recorder() {
        Ok(handle) => Some(handle),
        Err(e) => {
            tracing::warn!(error = %e, "metrics disabled");
            None
        }
    };

    let context = RwsContext::with_builtins();
    if !cli.no_demo {
        let _room = demo::register(&context).context("Failed to register demo objects")?;
    }

    let mut server = RwsServer::new(ServerConfig::from_settings(&settings.server), context);
    if let Some(handle) = metrics {
        server = server.with_metrics(handle);
    }

    let (addr, handle) = server.listen().await.context("Failed to bind server")?;
    tracing::info!(
        objects = server.context().registry().object_names().len(),
        "rws gateway listening on http://{addr} (ws://{addr}/ws)"
    );

    wait_for_signal(server.shutdown().token()).await;

    tracing::info!("Shutting down...");
    server.shutdown().track(handle);
    server.shutdown().graceful_shutdown(None).await;
    tracing::info!("Shutdown complete");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cli(args: &[&str]) -> Cli {
        Cli::parse_from(std::iter::once("rws-gateway").chain(args.iter().copied()))
    }

    #[test]
    fn cli_overrides_settings_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, r#"{"server": {"port": 4000, "host": "0.0.0.0"}}"#).unwrap();
        let path = path.to_string_lossy().into_owned();

        let settings = cli(&["--settings", &path, "--port", "5000", "--log-level", "debug"])
            .load_settings()
            .unwrap();
        assert_eq!(settings.server.port, 5000);
        assert_eq!(settings.server.host, "0.0.0.0");
        assert_eq!(settings.logging.level, LogLevel::Debug);
    }

    #[test]
    fn unknown_log_level_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing.json").to_string_lossy().into_owned();
        let err = cli(&["--settings", &path, "--log-level", "loud"])
            .load_settings()
            .unwrap_err();
        assert!(err.to_string().contains("loud"));
    }

    #[test]
    fn flags_parse() {
        let parsed = cli(&["--json-logs", "--no-demo", "--host", "::1"]);
        assert!(parsed.json_logs);
        assert!(parsed.no_demo);
        assert_eq!(parsed.host.as_deref(), Some("::1"));
        assert!(parsed.settings.is_none());
    }
}
