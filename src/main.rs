//! Intercepting forward proxy.
//!
//! ```text
//!                         ┌────────────────────────────────────────────────┐
//!                         │               INTERCEPTING PROXY               │
//!     Client              │  ┌──────────┐   ┌──────────┐   ┌────────────┐  │
//!     ────────────────────┼─▶│ listener │──▶│ dispatch │──▶│  pipeline  │──┼───▶ Upstream
//!                         │  └──────────┘   └────┬─────┘   │ req / resp │  │
//!                         │                      │ CONNECT └────────────┘  │
//!                         │                      ▼                         │
//!                         │          ┌─────────────────────────┐           │
//!                         │          │ relay  or  TLS intercept│───────────┼───▶ Upstream
//!                         │          └─────────────────────────┘           │
//!                         └────────────────────────────────────────────────┘
//! ```

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;

use intercepting_proxy::config::loader::load_config;
use intercepting_proxy::config::{LogFormat, ProxyConfig};
use intercepting_proxy::lifecycle::signals::spawn_signal_handler;
use intercepting_proxy::observability::{logging, metrics};
use intercepting_proxy::ProxyBuilder;

#[derive(Parser, Debug)]
#[command(name = "intercepting-proxy", version)]
#[command(about = "Forward proxy that can intercept and rewrite HTTP and HTTPS traffic")]
struct Cli {
    /// TOML configuration file. Defaults apply when omitted.
    #[arg(short, long, env = "PROXY_CONFIG")]
    config: Option<PathBuf>,

    /// Override `listener.bind_address`.
    #[arg(short, long, env = "PROXY_LISTEN")]
    listen: Option<String>,

    /// Override `observability.log_level`.
    #[arg(long, env = "PROXY_LOG_LEVEL")]
    log_level: Option<String>,

    /// Emit logs as JSON lines.
    #[arg(long)]
    json_logs: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => match load_config(path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("intercepting-proxy: {}: {e}", path.display());
                return ExitCode::FAILURE;
            }
        },
        None => ProxyConfig::default(),
    };
    if let Some(listen) = cli.listen {
        config.listener.bind_address = listen;
    }
    if let Some(level) = cli.log_level {
        config.observability.log_level = level;
    }
    if cli.json_logs {
        config.observability.log_format = LogFormat::Json;
    }

    logging::init(&config.observability);
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "intercepting-proxy starting");

    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse() {
            Ok(addr) => metrics::init_metrics(addr),
            Err(_) => tracing::error!(
                metrics_address = %config.observability.metrics_address,
                "Failed to parse metrics address"
            ),
        }
    }

    let server = match ProxyBuilder::new(config).bind().await {
        Ok(server) => server,
        Err(e) => {
            tracing::error!(error = %e, "Startup failed");
            return ExitCode::FAILURE;
        }
    };

    spawn_signal_handler(server.shutdown_handle());

    if let Err(e) = server.run().await {
        tracing::error!(error = %e, "Server stopped with error");
        return ExitCode::FAILURE;
    }

    tracing::info!("Shutdown complete");
    ExitCode::SUCCESS
}
