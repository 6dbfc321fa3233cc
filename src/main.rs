//! holepunch - punch a direct UDP or TCP path to a peer behind NAT

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::error::ErrorKind;
use clap::Parser;
use tokio::io::BufReader;
use tracing::{info, Level};
use tracing_subscriber::EnvFilter;

use holepunch::config::load_config;
use holepunch::network::{PunchMode, StunServer};
use holepunch::{PunchRequest, SessionController, SessionOutcome};

/// Longest accepted `--window`, one day
const MAX_WINDOW_SECS: u64 = 86_400;

#[derive(Parser, Debug)]
#[command(name = "holepunch")]
#[command(about = "Punch a direct UDP or TCP path to a peer behind NAT")]
#[command(version)]
struct Cli {
    /// Local port to punch from
    local_port: u16,

    /// Peer's external IP address
    peer_ip: IpAddr,

    /// Peer's external port
    peer_port: u16,

    /// Use TCP simultaneous open instead of UDP
    #[arg(long)]
    tcp: bool,

    /// Also punch the ports around the peer's port, more often
    #[arg(long)]
    aggressive: bool,

    /// Classify the NAT before punching
    #[arg(long)]
    classify: bool,

    /// Wait for Enter before punching
    #[arg(long)]
    wait_for_peer: bool,

    /// Skip STUN address discovery
    #[arg(long)]
    no_discovery: bool,

    /// STUN server (host:port), may be repeated
    #[arg(long = "stun-server", env = "HOLEPUNCH_STUN_SERVERS", value_delimiter = ',')]
    stun_servers: Vec<StunServer>,

    /// UDP discovery window in seconds
    #[arg(long, value_parser = clap::value_parser!(u64).range(1..=MAX_WINDOW_SECS))]
    window: Option<u64>,

    /// Configuration file (TOML)
    #[arg(short, long, env = "HOLEPUNCH_CONFIG")]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

fn setup_logging(verbose: bool) {
    let level = if verbose { Level::DEBUG } else { Level::INFO };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.as_str().to_lowercase()));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();
}

fn parse_args() -> Cli {
    match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let _ = e.print();
            let code = match e.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => 0,
                _ => 1,
            };
            std::process::exit(code);
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = parse_args();
    setup_logging(cli.verbose);

    let mut config = load_config(cli.config.as_deref()).context("Failed to load configuration")?;
    if !cli.stun_servers.is_empty() {
        config.stun_servers = cli.stun_servers.clone();
    }
    if cli.aggressive {
        config.punch.aggressive = true;
    }
    if let Some(window) = cli.window {
        let window_ms = window.saturating_mul(1_000);
        config.punch.discovery_window_ms = window_ms;
        config.punch.aggressive_window_ms = window_ms;
    }
    config.validate().context("Invalid configuration")?;

    let mode = if cli.tcp { PunchMode::Tcp } else { PunchMode::Udp };
    let request = PunchRequest {
        local_port: cli.local_port,
        peer_addr: SocketAddr::new(cli.peer_ip, cli.peer_port),
        mode,
        classify: cli.classify,
        wait_for_peer: cli.wait_for_peer,
        skip_discovery: cli.no_discovery,
    };
    info!("Starting {} session: {:?}", mode, request);

    let controller = SessionController::new(config);
    let outcome = controller
        .run(&request, BufReader::new(tokio::io::stdin()))
        .await
        .context("Session failed")?;

    match outcome {
        SessionOutcome::Completed | SessionOutcome::Declined => Ok(()),
        SessionOutcome::Failed(reason) => anyhow::bail!("No direct path to peer: {}", reason),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Result<Cli, clap::Error> {
        Cli::try_parse_from(std::iter::once("holepunch").chain(args.iter().copied()))
    }

    #[test]
    fn test_parse_positional_and_flags() {
        let cli = parse(&["9000", "203.0.113.5", "40000", "--tcp", "--window", "5"]).unwrap();
        assert_eq!(cli.local_port, 9000);
        assert_eq!(cli.peer_port, 40000);
        assert!(cli.tcp);
        assert_eq!(cli.window, Some(5));
    }

    #[test]
    fn test_window_out_of_range_rejected() {
        assert!(parse(&["9000", "203.0.113.5", "40000", "--window", "0"]).is_err());
        let huge = u64::MAX.to_string();
        assert!(parse(&["9000", "203.0.113.5", "40000", "--window", &huge]).is_err());
        assert!(parse(&["9000", "203.0.113.5", "40000", "--window", "86400"]).is_ok());
    }

    #[test]
    fn test_missing_peer_is_error() {
        assert!(parse(&["9000"]).is_err());
    }
}
