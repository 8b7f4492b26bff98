//! # tagrelay
//!
//! Tag relay server binary: loads settings, wires the relay and the
//! HTTP/WebSocket server together, and shuts down cleanly on Ctrl-C.

#![deny(unsafe_code)]

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tagrelay_core::logging::{LogFormat, init_subscriber};
use tagrelay_relay::{Relay, RelayConfig};
use tagrelay_server::{RelayServer, ServerConfig};
use tagrelay_settings::RelaySettings;

/// Real-time tag event relay.
#[derive(Parser, Debug)]
#[command(name = "tagrelay", version, about = "Real-time tag event relay")]
struct Cli {
    /// Host to bind (overrides settings).
    #[arg(long)]
    host: Option<String>,

    /// Port to bind, 0 for auto-assign (overrides settings).
    #[arg(long)]
    port: Option<u16>,

    /// Settings file (default `~/.tagrelay/settings.json`).
    #[arg(long)]
    settings: Option<PathBuf>,

    /// Log level or `EnvFilter` directive (overrides settings).
    #[arg(long)]
    log_level: Option<String>,

    /// Emit logs as JSON lines.
    #[arg(long)]
    log_json: bool,
}

impl Cli {
    /// Load settings from the chosen file, then apply CLI overrides.
    fn load_settings(&self) -> Result<RelaySettings> {
        let path = self
            .settings
            .clone()
            .unwrap_or_else(tagrelay_settings::settings_path);
        let mut settings = tagrelay_settings::load_settings_from_path(&path)
            .with_context(|| format!("Failed to load settings from {}", path.display()))?;
        self.apply(&mut settings);
        Ok(settings)
    }

    fn apply(&self, settings: &mut RelaySettings) {
        if let Some(host) = &self.host {
            settings.server.host.clone_from(host);
        }
        if let Some(port) = self.port {
            settings.server.port = port;
        }
        if let Some(level) = &self.log_level {
            settings.logging.level.clone_from(level);
        }
        if self.log_json {
            settings.logging.json = true;
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = cli.load_settings()?;

    let format = if settings.logging.json {
        LogFormat::Json
    } else {
        LogFormat::Compact
    };
    init_subscriber(&settings.logging.level, format);
    tracing::info!(
        version = tagrelay_core::constants::VERSION,
        "starting tag relay"
    );

    let metrics_handle = match tagrelay_server::metrics::install_recorder() {
        Ok(handle) => Some(handle),
        Err(e) => {
            tracing::warn!(error = %e, "metrics recorder not installed, /metrics disabled");
            None
        }
    };

    let verifier = tagrelay_auth::verifier_from_settings(&settings.auth);
    let relay = Arc::new(Relay::new(RelayConfig::from_settings(&settings), verifier));
    let config = ServerConfig::from_settings(&settings);
    let shutdown_timeout = config.shutdown_timeout;

    let server = RelayServer::new(config, Arc::clone(&relay), metrics_handle);
    let (addr, server_handle) = server
        .listen()
        .await
        .with_context(|| format!("Failed to bind {}", server.config().bind_addr()))?;
    let sweeper = relay.spawn_sweeper(server.shutdown().token());

    tracing::info!(%addr, "tag relay ready");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;

    tracing::info!("Shutting down...");
    let report = server
        .shutdown()
        .graceful_shutdown(&relay, vec![server_handle, sweeper], shutdown_timeout)
        .await;
    tracing::info!(
        closed_connections = report.closed_connections,
        timed_out = report.timed_out,
        "Shutdown complete"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_defaults_defer_to_settings() {
        let cli = Cli::parse_from(["tagrelay"]);
        assert!(cli.host.is_none());
        assert!(cli.port.is_none());
        assert!(cli.settings.is_none());
        assert!(!cli.log_json);

        let mut settings = RelaySettings::default();
        cli.apply(&mut settings);
        assert_eq!(settings.server.port, 8080);
        assert_eq!(settings.logging.level, "info");
    }

    #[test]
    fn cli_overrides_settings() {
        let cli = Cli::parse_from([
            "tagrelay",
            "--host",
            "127.0.0.1",
            "--port",
            "9000",
            "--log-level",
            "debug",
            "--log-json",
        ]);
        let mut settings = RelaySettings::default();
        cli.apply(&mut settings);
        assert_eq!(settings.server.host, "127.0.0.1");
        assert_eq!(settings.server.port, 9000);
        assert_eq!(settings.logging.level, "debug");
        assert!(settings.logging.json);
    }

    #[test]
    fn cli_rejects_invalid_port() {
        assert!(Cli::try_parse_from(["tagrelay", "--port", "70000"]).is_err());
    }

    #[test]
    fn load_settings_from_custom_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("relay.json");
        std::fs::write(&path, r#"{"relay": {"queueCapacity": 32}, "server": {"port": 7000}}"#)
            .unwrap();

        let cli = Cli::parse_from([
            "tagrelay",
            "--settings",
            path.to_str().unwrap(),
            "--port",
            "7001",
        ]);
        let settings = cli.load_settings().unwrap();
        assert_eq!(settings.relay.queue_capacity, 32);
        assert_eq!(settings.server.port, 7001);
    }

    #[test]
    fn load_settings_reports_bad_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("relay.json");
        std::fs::write(&path, "nope").unwrap();

        let cli = Cli::parse_from(["tagrelay", "--settings", path.to_str().unwrap()]);
        let err = cli.load_settings().unwrap_err();
        assert!(err.to_string().contains("Failed to load settings"));
    }

    #[tokio::test]
    async fn server_starts_and_stops() {
        let settings = RelaySettings::default();
        let relay = Arc::new(Relay::new(
            RelayConfig::from_settings(&settings),
            tagrelay_auth::verifier_from_settings(&settings.auth),
        ));
        let server = RelayServer::new(ServerConfig::default(), Arc::clone(&relay), None);
        let (_, handle) = server.listen().await.unwrap();
        let sweeper = relay.spawn_sweeper(server.shutdown().token());

        let report = server
            .shutdown()
            .graceful_shutdown(&relay, vec![handle, sweeper], std::time::Duration::from_secs(5))
            .await;
        assert!(!report.timed_out);
    }
}
