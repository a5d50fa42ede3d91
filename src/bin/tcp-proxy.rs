//! tcp-proxy
//!
//! Forwards local ports to a remote host:
//! - Direct, or through a SOCKS5/HTTP CONNECT proxy
//! - Optional global rate limit
//! - Optional tap of either direction to a file or stdout

use anyhow::{Context, Result};
use clap::error::ErrorKind;
use clap::{CommandFactory, Parser};
use std::time::Duration;
use tcp_proxy::{
    config::{PortMapping, RelayConfig, DEFAULT_BIND_ADDRESS},
    limit::RateLimiter,
    proxy::{ConnectOptions, Dialer, DEFAULT_CONNECT_TIMEOUT},
    tee::TeeSinks,
    version, Relay,
};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Forward local TCP ports to a remote host, optionally through a proxy
#[derive(Parser, Debug)]
#[command(name = "tcp-proxy")]
#[command(about = "Forward local TCP ports to a remote host, optionally through a proxy")]
#[command(disable_version_flag = true)]
struct Args {
    /// Remote host to forward to
    #[arg(value_name = "REMOTE_HOST")]
    remote: Option<String>,

    /// Port mappings as [LOCAL_PORT:]REMOTE_PORT
    #[arg(value_name = "PORTS")]
    ports: Vec<String>,

    /// Address to listen on
    #[arg(long, default_value = DEFAULT_BIND_ADDRESS)]
    address: String,

    /// Upstream proxy URL (socks5://, http://); defaults to ALL_PROXY
    #[arg(short = 'x', long, default_value = "")]
    proxy: String,

    /// Aggregate rate limit per second, e.g. 1MB
    #[arg(long, default_value = "")]
    rate_limit: String,

    /// Log byte counts as raw integers
    #[arg(long)]
    raw_bytes: bool,

    /// Copy sent bytes to this file ("-" for stdout)
    #[arg(long, default_value = "")]
    tee_sen: String,

    /// Copy received bytes to this file ("-" for stdout)
    #[arg(long, default_value = "")]
    tee_rec: String,

    /// HTTP CONNECT handshake timeout in seconds
    #[arg(long, value_name = "SECS", default_value_t = DEFAULT_CONNECT_TIMEOUT.as_secs())]
    connect_timeout: u64,

    /// User-Agent for HTTP CONNECT requests
    #[arg(long)]
    user_agent: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Print version and exit
    #[arg(short = 'v', long)]
    version: bool,
}

/// Parse the positional arguments, exiting with a usage error on failure
fn port_mappings(args: &Args) -> Vec<PortMapping> {
    let mut cmd = Args::command();

    let remote = match (&args.remote, args.ports.is_empty()) {
        (Some(remote), false) => remote,
        _ => {
            let received = args.remote.iter().count() + args.ports.len();
            cmd.error(
                ErrorKind::WrongNumberOfValues,
                format!("expected REMOTE_HOST and at least one port mapping, received {} argument(s)", received),
            )
            .exit();
        }
    };

    args.ports
        .iter()
        .map(|spec| {
            PortMapping::parse(&args.address, remote, spec)
                .unwrap_or_else(|e| cmd.error(ErrorKind::ValueValidation, e).exit())
        })
        .collect()
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.version {
        println!("Version:{}", version::version_with_date());
        return Ok(());
    }

    // Initialize logging, away from stdout which may carry tee output
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(EnvFilter::try_new(&args.log_level).context("Invalid log level")?)
        .init();

    let mappings = port_mappings(&args);

    let options = ConnectOptions {
        user_agent: args.user_agent.clone(),
        credentials: None,
        timeout: Duration::from_secs(args.connect_timeout),
    };
    let dialer = Dialer::from_proxy_spec(&args.proxy, &options).context("Invalid --proxy")?;
    info!("tcp-proxy v{} dialing {}", tcp_proxy::VERSION, dialer);

    let mut config = RelayConfig::new(mappings)
        .with_dialer(dialer)
        .with_raw_bytes(args.raw_bytes);

    if !args.rate_limit.is_empty() {
        let limiter = RateLimiter::from_rate_str(&args.rate_limit).context("Invalid --rate-limit")?;
        info!("Rate limit: {} bytes/s", limiter.rate());
        config = config.with_rate_limiter(limiter);
    }

    let tee = TeeSinks::open(&args.tee_sen, &args.tee_rec).context("Failed to open tee output")?;
    config = config.with_tee(tee.clone());

    let relay = Relay::new(config);
    let mapping_count = relay.mappings().len();

    let exit_code = tokio::select! {
        failures = relay.run() => {
            error!("All {} listener(s) stopped, {} failed", mapping_count, failures.len());
            1
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down...");
            0
        }
    };

    if let Err(e) = tee.shutdown().await {
        error!("Failed to close tee output: {}", e);
    }

    if exit_code != 0 {
        std::process::exit(exit_code);
    }
    Ok(())
}
