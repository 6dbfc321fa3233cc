//! Minimal STUN server for testing hole punching
//!
//! Answers binding requests with the address each request came from, or
//! with a fixed mapping to simulate a particular NAT.
//!
//! Run with:
//!   cargo run --bin stun-server -- --port 3478
//!
//! Environment variables:
//!   STUN_PORT - Port to listen on (default: 3478)
//!   RUST_LOG - Log level (default: info)

use std::net::{IpAddr, SocketAddr, SocketAddrV4};

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, Level};
use tracing_subscriber::EnvFilter;

use holepunch::network::{CancelFlag, StunResponder};
use holepunch::MappedAddress;

/// Minimal STUN binding server
#[derive(Parser, Debug)]
#[command(name = "stun-server")]
#[command(about = "Minimal STUN binding server for hole punching tests")]
struct Args {
    /// Port to listen on
    #[arg(short, long, default_value = "3478", env = "STUN_PORT")]
    port: u16,

    /// Host to bind to
    #[arg(long, default_value = "0.0.0.0")]
    host: IpAddr,

    /// Report this address to every client instead of its source
    #[arg(long)]
    mapped: Option<SocketAddrV4>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let level = if args.verbose { Level::TRACE } else { Level::INFO };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.as_str().to_lowercase()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();

    let addr = SocketAddr::new(args.host, args.port);
    let mut responder = StunResponder::bind(addr).with_context(|| format!("Failed to bind {}", addr))?;
    if let Some(mapped) = args.mapped {
        info!("Reporting fixed mapping {}", mapped);
        responder = responder.with_fixed_mapping(MappedAddress::from(mapped));
    }
    info!("STUN server listening on {}", responder.local_addr());

    let cancel = CancelFlag::new();
    let handle = responder.spawn(cancel.clone());

    tokio::signal::ctrl_c().await?;
    info!("Shutting down...");
    cancel.cancel();

    let answered = handle.await?;
    info!("Final stats: answered={}", answered);
    Ok(())
}
