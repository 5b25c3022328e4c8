// Copyright (c) 2026 ALAS Technology. MIT License.
// See LICENSE for details.

//! # Gatenet Node
//!
//! Entry point for the `gatenet-node` binary. Parses CLI arguments,
//! initializes logging, bootstraps the node, serves metrics and waits for a
//! signal to shut everything down cleanly.
//!
//! - `run`     — start the node
//! - `init`    — create the state directory and a node key
//! - `version` — print build version information

mod cli;
mod logging;
mod metrics;

use anyhow::{bail, Context, Result};
use clap::Parser;
use libp2p::Multiaddr;
use std::future::IntoFuture;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;

use gatenet_protocol::config;
use gatenet_protocol::{bootstrap, NodeConfig, NodeIdentity, PeerAddrInfo};

use cli::{Commands, GatenetNodeCli};
use logging::LogFormat;
use metrics::NodeMetrics;

/// Node key file name inside the state directory.
const NODE_KEY_FILE: &str = "node.key";

/// How often the metrics sampler polls the node.
const METRICS_SAMPLE_INTERVAL: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> Result<()> {
    let cli = GatenetNodeCli::parse();

    match cli.command {
        Commands::Run(args) => run_node(args).await,
        Commands::Init(args) => init_node(args),
        Commands::Version => {
            print_version();
            Ok(())
        }
    }
}

/// Bootstraps the node and keeps it up until SIGINT/SIGTERM.
async fn run_node(args: cli::RunArgs) -> Result<()> {
    logging::init_logging(
        "gatenet_node=info,gatenet_protocol=info",
        LogFormat::from_str_lossy(&args.log_format),
    )?;

    let key_material = load_key(args.node_key.as_deref(), &args.state_dir)?;
    let bootstrap_peers = parse_seeds(&args.bootstrap_peers)?;

    tracing::info!(
        network = %args.network,
        state_dir = %args.state_dir.display(),
        seeds = bootstrap_peers.len(),
        metrics_port = args.metrics_port,
        "starting gatenet-node"
    );

    let node_config = NodeConfig {
        key_material,
        listen_addrs: args.listen_addrs,
        external_addr: args.external_addr.unwrap_or_else(Multiaddr::empty),
        state_dir: args.state_dir,
        network_id: args.network,
        bootstrap_peers,
        nat_port_map: !args.no_nat,
        ..NodeConfig::default()
    };

    let node = bootstrap(node_config)
        .await
        .context("failed to bootstrap node")?;

    println!("peer id : {}", node.peer_id());
    for addr in node.addrs() {
        println!("address : {addr}/p2p/{}", node.peer_id());
    }

    // --- Metrics ---
    let node_metrics = Arc::new(NodeMetrics::new().context("failed to register metrics")?);
    let metrics_router = axum::Router::new()
        .route("/metrics", axum::routing::get(metrics::metrics_handler))
        .with_state(Arc::clone(&node_metrics));
    let metrics_addr = format!("0.0.0.0:{}", args.metrics_port);
    let metrics_listener = tokio::net::TcpListener::bind(&metrics_addr)
        .await
        .with_context(|| format!("failed to bind metrics listener on {}", metrics_addr))?;
    tracing::info!("Metrics server listening on {}", metrics_addr);

    let mut sample = tokio::time::interval(METRICS_SAMPLE_INTERVAL);

    // --- Serve ---
    let server = axum::serve(metrics_listener, metrics_router).into_future();
    tokio::pin!(server);
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            res = &mut server => {
                if let Err(e) = res {
                    tracing::error!("Metrics server error: {}", e);
                }
                break;
            }
            _ = &mut shutdown => {
                tracing::info!("shutdown signal received");
                break;
            }
            _ = sample.tick() => node_metrics.sample(&node).await,
        }
    }

    node.shutdown().await.context("failed to close stores")?;
    tracing::info!("gatenet-node stopped");
    Ok(())
}

/// Creates the state directory and writes a fresh node key.
fn init_node(args: cli::InitArgs) -> Result<()> {
    logging::init_logging("gatenet_node=info", LogFormat::Pretty)?;

    let state_dir = &args.state_dir;
    std::fs::create_dir_all(state_dir)
        .with_context(|| format!("failed to create state directory: {}", state_dir.display()))?;

    let key_path = state_dir.join(NODE_KEY_FILE);
    if key_path.exists() && !args.force {
        bail!(
            "{} already exists, pass --force to replace it",
            key_path.display()
        );
    }

    let identity = NodeIdentity::generate();
    let encoded = identity.to_protobuf_encoding()?;
    std::fs::write(&key_path, hex::encode(encoded))
        .with_context(|| format!("failed to write node key to {}", key_path.display()))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&key_path, std::fs::Permissions::from_mode(0o600))?;
    }

    tracing::info!(peer_id = %identity.peer_id(), key_path = %key_path.display(), "node key generated");

    println!("Node initialized successfully.");
    println!("  State directory : {}", state_dir.display());
    println!("  Node key        : {}", key_path.display());
    println!("  Peer id         : {}", identity.peer_id());

    Ok(())
}

/// Key material from the flag, or from the key file in the state dir.
///
/// Only checks that the hex decodes; bootstrap decides whether the bytes
/// are a usable key.
fn load_key(flag: Option<&str>, state_dir: &Path) -> Result<Vec<u8>> {
    let encoded = match flag {
        Some(hex_key) => hex_key.to_string(),
        None => {
            let key_path = state_dir.join(NODE_KEY_FILE);
            std::fs::read_to_string(&key_path).with_context(|| {
                format!(
                    "no node key at {} (run `gatenet-node init` first)",
                    key_path.display()
                )
            })?
        }
    };
    hex::decode(encoded.trim()).context("node key is not valid hex")
}

fn parse_seeds(addrs: &[Multiaddr]) -> Result<Vec<PeerAddrInfo>> {
    addrs
        .iter()
        .map(|addr| {
            PeerAddrInfo::from_p2p_multiaddr(addr)
                .with_context(|| format!("bootstrap address {addr} has no /p2p/<peer id> suffix"))
        })
        .collect()
}

fn print_version() {
    println!("gatenet-node {}", env!("CARGO_PKG_VERSION"));
    println!("protocol     {}", config::IDENTIFY_PROTOCOL_VERSION);
    println!("user agent   {}", config::USER_AGENT);
}

/// Waits for SIGINT (Ctrl+C) or SIGTERM, whichever comes first.
///
/// If a handler can't be installed, that signal is simply never delivered.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!("failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
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
    fn key_file_round_trips_through_init_format() {
        let dir = tempfile::tempdir().unwrap();
        let identity = NodeIdentity::generate();
        std::fs::write(
            dir.path().join(NODE_KEY_FILE),
            format!("{}\n", hex::encode(identity.to_protobuf_encoding().unwrap())),
        )
        .unwrap();

        let material = load_key(None, dir.path()).unwrap();
        let loaded = NodeIdentity::from_key_material(&material).unwrap();
        assert_eq!(loaded.peer_id(), identity.peer_id());
    }

    #[test]
    fn missing_key_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load_key(None, dir.path()).is_err());
        assert!(load_key(Some("zz"), dir.path()).is_err());
    }

    #[test]
    fn seeds_need_a_peer_id() {
        let peer = libp2p::PeerId::random();
        let good: Multiaddr = format!("/ip4/10.0.0.1/tcp/4001/p2p/{peer}").parse().unwrap();
        let bad: Multiaddr = "/ip4/10.0.0.1/tcp/4001".parse().unwrap();

        let seeds = parse_seeds(std::slice::from_ref(&good)).unwrap();
        assert_eq!(seeds[0].peer_id, peer);
        assert!(parse_seeds(&[good, bad]).is_err());
    }
}
