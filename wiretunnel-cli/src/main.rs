//! WireTunnel CLI
//!
//! Runs the HTTP and SOCKS5 proxies over a tunnel.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::builder::BoolishValueParser;
use clap::{Args, Parser, Subcommand};
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use wiretunnel_engine::{Config, HostTunnel, Overrides, ProxyEngine};

/// Time given to the servers to stop after a shutdown signal
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// WireTunnel - HTTP and SOCKS5 proxy over a point-to-point tunnel
#[derive(Parser)]
#[command(name = "wiretunnel")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, env = "WIRETUNNEL_CONFIG", default_value = "wiretunnel.toml")]
    config: PathBuf,

    /// Log level (error, warn, info, debug, trace); overrides the config file
    #[arg(short, long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the proxy servers
    Run(RunArgs),

    /// Generate a sample configuration file
    GenConfig {
        /// Output path for the configuration file
        #[arg(short, long, default_value = "wiretunnel.toml")]
        output: PathBuf,
    },
}

/// Settings that take precedence over the configuration file
#[derive(Args)]
struct RunArgs {
    /// HTTP server address, '0' to disable
    #[arg(long, env = "HTTP_ADDR")]
    http_addr: Option<String>,

    /// HTTP proxy username
    #[arg(long, env = "HTTP_USER")]
    http_user: Option<String>,

    /// HTTP proxy password
    #[arg(long, env = "HTTP_PASS", hide_env_values = true)]
    http_pass: Option<String>,

    /// SOCKS5 server address, '0' to disable
    #[arg(long, env = "SOCKS5_ADDR")]
    socks5_addr: Option<String>,

    /// SOCKS5 proxy username
    #[arg(long, env = "SOCKS5_USER")]
    socks5_user: Option<String>,

    /// SOCKS5 proxy password
    #[arg(long, env = "SOCKS5_PASS", hide_env_values = true)]
    socks5_pass: Option<String>,

    /// Comma-separated CIDRs and addresses that bypass the tunnel
    #[arg(long, env = "BYPASS_LIST")]
    bypass: Option<String>,

    /// Send DNS queries over the host network
    #[arg(long, env = "LOCAL_DNS", value_parser = BoolishValueParser::new())]
    local_dns: Option<bool>,
}

impl From<RunArgs> for Overrides {
    fn from(args: RunArgs) -> Self {
        Self {
            http_addr: args.http_addr,
            http_user: args.http_user,
            http_pass: args.http_pass,
            socks5_addr: args.socks5_addr,
            socks5_user: args.socks5_user,
            socks5_pass: args.socks5_pass,
            bypass: args.bypass,
            local_dns: args.local_dns,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run(args) => run(cli.config, cli.log_level, args.into()).await,
        Commands::GenConfig { output } => {
            init_logging(cli.log_level.as_deref().unwrap_or("info"));
            generate_config(output)
        }
    }
}

fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

async fn run(config_path: PathBuf, log_level: Option<String>, overrides: Overrides) -> Result<()> {
    let config = Config::load_with_overrides(&config_path, &overrides)
        .with_context(|| format!("Failed to load configuration from {:?}", config_path))?;

    init_logging(log_level.as_deref().unwrap_or(&config.log_level));
    info!("WireTunnel v{}", env!("CARGO_PKG_VERSION"));
    info!("Configuration loaded from {:?}", config_path);

    let tunnel = Arc::new(HostTunnel::new(config.tunnel.dns.clone()));
    let mut engine = ProxyEngine::new(config, tunnel).context("Failed to create proxy engine")?;

    // Create shutdown handle before moving engine into task
    let shutdown_tx = engine.create_shutdown_handle();

    let mut engine_handle = tokio::spawn(async move { engine.start().await });

    tokio::select! {
        result = wait_for_shutdown() => result?,
        joined = &mut engine_handle => {
            let result = joined.context("Proxy engine task failed")?;
            return result.context("Proxy engine stopped");
        }
    }

    info!("Shutting down...");

    // Signal graceful shutdown
    let _ = shutdown_tx.send(());

    match tokio::time::timeout(SHUTDOWN_GRACE, engine_handle).await {
        Ok(Ok(Ok(()))) => {}
        Ok(Ok(Err(e))) => error!("Proxy engine error: {}", e),
        Ok(Err(e)) => error!("Proxy engine task failed: {}", e),
        Err(_) => error!("Proxy engine did not stop within {:?}", SHUTDOWN_GRACE),
    }

    Ok(())
}

fn generate_config(output: PathBuf) -> Result<()> {
    let sample = Config::sample();

    std::fs::write(&output, sample)
        .with_context(|| format!("Failed to write configuration to {:?}", output))?;

    info!("Generated sample configuration at {:?}", output);
    println!("Sample configuration written to {:?}", output);
    println!("\nEdit the tunnel DNS servers and listen addresses before running.");

    Ok(())
}

async fn wait_for_shutdown() -> Result<()> {
    #[cfg(unix)]
    {
        let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())
            .context("Failed to register SIGTERM handler")?;
        let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())
            .context("Failed to register SIGINT handler")?;

        tokio::select! {
            _ = sigterm.recv() => {
                info!("Received SIGTERM");
            }
            _ = sigint.recv() => {
                info!("Received SIGINT");
            }
        }
    }

    #[cfg(not(unix))]
    {
        signal::ctrl_c()
            .await
            .context("Failed to listen for Ctrl+C")?;
        info!("Received Ctrl+C");
    }

    Ok(())
}
