//! Model Gateway Daemon
//!
//! Long-running process that serves the gateway over a Unix socket.
//!
//! # Usage
//!
//! ```bash
//! # Start with the default config and socket
//! gateway-daemon
//!
//! # Custom socket and config file
//! gateway-daemon --socket-path /tmp/gateway.sock --config ./gateway.toml
//!
//! # Validate configuration and exit
//! gateway-daemon --check
//! ```
//!
//! # Signals
//!
//! - SIGTERM, SIGINT: graceful shutdown (in-flight requests are cancelled)

mod protocol;
mod server;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use gateway_core::backend::{OllamaInvoker, OpenAiCompatibleInvoker, ProviderRegistry};
use gateway_core::config::{
    default_config_path, load_config_from_path, ConfigOverrides, ProviderSettings,
};
use gateway_core::{Gateway, GatewayConfig};

use crate::server::{DaemonServer, ServerConfig};

/// Multi-tenant model gateway daemon
#[derive(Parser, Debug)]
#[command(name = "gateway-daemon")]
#[command(about = "Rate-limited, tier-aware routing to LLM providers")]
#[command(version)]
struct Args {
    /// Unix socket path
    #[arg(short, long, env = "GATEWAY_SOCKET")]
    socket_path: Option<PathBuf>,

    /// Config file path (default: ~/.config/model-gateway/gateway.toml)
    #[arg(short, long, env = "GATEWAY_CONFIG")]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info", env = "GATEWAY_LOG_LEVEL")]
    log_level: String,

    /// Per-attempt model timeout in milliseconds
    #[arg(long)]
    attempt_timeout_ms: Option<u64>,

    /// Maximum model attempts per request (1-3)
    #[arg(long)]
    max_attempts: Option<u32>,

    /// Maximum concurrent connections
    #[arg(long, default_value_t = 100)]
    max_connections: usize,

    /// Validate configuration, print a summary and exit
    #[arg(long)]
    check: bool,
}

impl Args {
    fn overrides(&self) -> ConfigOverrides {
        let mut overrides = ConfigOverrides::new();
        if let Some(path) = &self.socket_path {
            overrides = overrides.with_socket_path(path.clone());
        }
        if let Some(ms) = self.attempt_timeout_ms {
            overrides = overrides.with_attempt_timeout_ms(ms);
        }
        if let Some(attempts) = self.max_attempts {
            overrides = overrides.with_max_attempts(attempts);
        }
        overrides
    }
}

/// Default socket location: `$XDG_RUNTIME_DIR/model-gateway/gateway.sock`
fn default_socket_path() -> PathBuf {
    dirs::runtime_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("model-gateway")
        .join("gateway.sock")
}

/// Initialize logging
fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!("gateway_daemon={level},gateway_core={level}"))
    });

    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_target(true)
                .with_thread_ids(true)
                .with_file(true)
                .with_line_number(true),
        )
        .init();
}

/// Build one invoker per configured provider
fn build_registry(config: &GatewayConfig) -> Result<ProviderRegistry> {
    let mut registry = ProviderRegistry::new();
    for (name, settings) in &config.providers {
        registry = match settings {
            ProviderSettings::Ollama {
                host,
                port,
                request_timeout,
            } => {
                let invoker = OllamaInvoker::new(host.clone(), *port, *request_timeout)
                    .with_context(|| format!("failed to create provider '{name}'"))?;
                registry.with(name.clone(), Arc::new(invoker))
            }
            ProviderSettings::OpenaiCompatible {
                base_url,
                api_key_env,
                request_timeout,
            } => {
                let api_key = api_key_env
                    .as_deref()
                    .and_then(|var| std::env::var(var).ok());
                if api_key.is_none() {
                    warn!(provider = %name, "No API key found, requests will be unauthenticated");
                }
                let invoker = OpenAiCompatibleInvoker::new(
                    name.clone(),
                    base_url.clone(),
                    api_key,
                    *request_timeout,
                )
                .with_context(|| format!("failed to create provider '{name}'"))?;
                registry.with(name.clone(), Arc::new(invoker))
            }
        };
    }
    Ok(registry)
}

fn print_summary(config: &GatewayConfig, socket_path: &std::path::Path) {
    println!("Configuration OK ({})", config.source());
    if let Some(path) = &config.config_file_path {
        println!("  config file:  {}", path.display());
    }
    println!("  socket:       {}", socket_path.display());
    println!(
        "  executor:     {} attempt(s), {}ms per attempt",
        config.executor.max_attempts,
        config.executor.attempt_timeout.as_millis()
    );
    println!("  models:       {}", config.models.len());
    for (name, settings) in &config.providers {
        let target = match settings {
            ProviderSettings::Ollama { host, port, .. } => format!("{host}:{port}"),
            ProviderSettings::OpenaiCompatible { base_url, .. } => base_url.clone(),
        };
        println!("  provider:     {name} -> {target}");
    }
}

/// Cancel `shutdown` on SIGTERM or SIGINT
fn install_signal_handlers(shutdown: CancellationToken) -> Result<()> {
    let mut sigterm = signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("failed to install SIGINT handler")?;

    tokio::spawn(async move {
        tokio::select! {
            _ = sigterm.recv() => info!("Received SIGTERM, shutting down..."),
            _ = sigint.recv() => info!("Received SIGINT, shutting down..."),
        }
        shutdown.cancel();
    });
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args.log_level);

    let mut config = load_config_from_path(args.config.clone().or_else(default_config_path))
        .context("failed to load configuration")?;
    args.overrides().apply(&mut config);
    config.validate().context("invalid configuration")?;

    let socket_path = config.socket_path.clone().unwrap_or_else(default_socket_path);

    if args.check {
        print_summary(&config, &socket_path);
        return Ok(());
    }

    info!(
        version = env!("CARGO_PKG_VERSION"),
        source = %config.source(),
        socket = %socket_path.display(),
        "Starting model gateway daemon"
    );

    let registry = build_registry(&config)?;
    let gateway = Gateway::builder()
        .with_config(&config)
        .with_invoker(Arc::new(registry))
        .build()
        .context("failed to build gateway")?;

    let shutdown = CancellationToken::new();
    install_signal_handlers(shutdown.clone())?;

    let server = DaemonServer::new(
        socket_path,
        Arc::new(gateway),
        ServerConfig {
            max_connections: args.max_connections,
            ..ServerConfig::default()
        },
    );
    server.run(shutdown).await?;

    info!("Daemon stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_args_build_overrides() {
        let args = Args::parse_from([
            "gateway-daemon",
            "--socket-path",
            "/tmp/gw.sock",
            "--max-attempts",
            "2",
        ]);
        let mut config = GatewayConfig::default();
        args.overrides().apply(&mut config);

        assert_eq!(config.socket_path, Some(PathBuf::from("/tmp/gw.sock")));
        assert_eq!(config.executor.max_attempts, 2);
        assert_eq!(config.source().to_string(), "CLI");
    }

    #[test]
    fn test_default_socket_path_is_named() {
        assert!(default_socket_path().ends_with("model-gateway/gateway.sock"));
    }

    #[test]
    fn test_registry_has_every_default_provider() {
        let registry = build_registry(&GatewayConfig::default()).unwrap();
        for provider in ["ollama", "openai", "anthropic"] {
            assert!(registry.contains(provider), "missing {provider}");
        }
    }
}
