//! Command-line surface for the `mcp-gateway` binary (spec.md §6 "CLI
//! surface"). The gateway has no subcommands: invoking the binary starts
//! the proxy, management, and OAuth discovery surfaces together and runs
//! until `SIGTERM`/`SIGINT`.

pub mod error;

use std::io::IsTerminal;
use std::path::PathBuf;

use clap::Parser;

use crate::config::GatewayConfig;
use crate::error::{GatewayError, GatewayResult};
use crate::gateway;

/// mcp-gateway: an observability and control plane for Model Context Protocol traffic.
#[derive(Parser, Debug)]
#[command(name = "mcp-gateway", version, about = "Observability and control plane for Model Context Protocol traffic", author)]
pub struct Cli {
    /// Directory the storage backend persists its files under.
    #[arg(long, env = "MCP_GATEWAY_STORAGE_DIR", value_name = "PATH")]
    pub storage_dir: Option<PathBuf>,

    /// Port to bind the HTTP listener to.
    #[arg(long, env = "MCP_GATEWAY_PORT", value_name = "PORT", default_value_t = GatewayConfig::DEFAULT_PORT)]
    pub port: u16,

    /// Address to bind the HTTP listener to.
    #[arg(long, env = "MCP_GATEWAY_BIND", value_name = "ADDR", default_value = "127.0.0.1")]
    pub bind: String,

    /// Enable verbose logging (-v, -vv, -vvv for trace). Ignored if
    /// `MCP_GATEWAY_LOG` or `RUST_LOG` is already set.
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Disable colored output.
    #[arg(long)]
    pub no_color: bool,
}

impl Cli {
    /// Build the gateway from parsed arguments, bind the listener, and run
    /// until shutdown. Returns the exit code to use.
    pub async fn execute(self) -> GatewayResult<()> {
        if self.no_color || !std::io::stdout().is_terminal() {
            colored::control::set_override(false);
        }

        if self.verbose > 0 && std::env::var_os("MCP_GATEWAY_LOG").is_none() && std::env::var_os("RUST_LOG").is_none() {
            let level = match self.verbose {
                1 => "info",
                2 => "debug",
                _ => "trace",
            };
            // SAFETY: single-threaded startup, before any other thread reads
            // this variable.
            unsafe { std::env::set_var("MCP_GATEWAY_LOG", level) };
        }

        let storage_dir = self.storage_dir.clone().unwrap_or_else(GatewayConfig::default_storage_dir);
        let log_dir = storage_dir.join("logs");
        let _telemetry_guard = crate::telemetry::init(Some(&log_dir))
            .map_err(|e| GatewayError::configuration(format!("failed to initialize logging: {e}")))?;

        let auth_token = gateway::resolve_auth_token();
        let config = GatewayConfig {
            storage_dir,
            bind: self.bind,
            port: self.port,
            auth_token,
            isolated_session_cap: GatewayConfig::DEFAULT_ISOLATED_CAP,
            max_body_bytes: GatewayConfig::DEFAULT_MAX_BODY_BYTES,
        };

        let gateway = gateway::Gateway::init(config).await?;
        let addr = gateway.bind_addr()?;
        let public_url = format!("http://{addr}");
        let app = crate::router::build(gateway.clone(), public_url);

        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .map_err(|e| GatewayError::configuration(format!("failed to bind {addr}: {e}")))?;

        tracing::info!(%addr, "mcp-gateway listening");

        let result = axum::serve(listener, app).with_graceful_shutdown(shutdown_signal()).await;

        gateway.close().await;
        result.map_err(|e| GatewayError::configuration(format!("server error: {e}")))
    }
}

async fn shutdown_signal() {
    let ctrl_c = async { tokio::signal::ctrl_c().await.expect("failed to install SIGINT handler") };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_with_defaults() {
        let cli = Cli::try_parse_from(["mcp-gateway"]).unwrap();
        assert_eq!(cli.port, GatewayConfig::DEFAULT_PORT);
        assert_eq!(cli.bind, "127.0.0.1");
        assert_eq!(cli.verbose, 0);
    }

    #[test]
    fn parses_overridden_flags() {
        let cli = Cli::try_parse_from(["mcp-gateway", "--port", "4000", "--bind", "0.0.0.0", "-vv"]).unwrap();
        assert_eq!(cli.port, 4000);
        assert_eq!(cli.bind, "0.0.0.0");
        assert_eq!(cli.verbose, 2);
    }

    #[test]
    fn rejects_invalid_port() {
        let cli = Cli::try_parse_from(["mcp-gateway", "--port", "not-a-number"]);
        assert!(cli.is_err());
    }
}
