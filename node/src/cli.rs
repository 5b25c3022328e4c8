//! # CLI Interface
//!
//! Defines the command-line argument structure for `gatenet-node` using
//! `clap` derive. Three subcommands: `run`, `init` and `version`.
//!
//! Every `run` flag can also come from a `GATENET_*` environment variable,
//! which is how the container images configure it.

use clap::{Parser, Subcommand};
use libp2p::Multiaddr;
use std::path::PathBuf;

/// Gatenet node.
///
/// Joins a private Gatenet network, keeps a persistent address book and
/// serves both DHT tiers. Exposes Prometheus metrics.
#[derive(Parser, Debug)]
#[command(
    name = "gatenet-node",
    about = "Gatenet private-network node",
    version,
    propagate_version = true
)]
pub struct GatenetNodeCli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start the node.
    Run(RunArgs),
    /// Create the state directory and a fresh node key.
    Init(InitArgs),
    /// Print version information and exit.
    Version,
}

/// Arguments for the `run` subcommand.
#[derive(Parser, Debug)]
pub struct RunArgs {
    /// State directory holding the node key, peerstore and DHT records.
    #[arg(long, short = 'd', env = "GATENET_STATE_DIR", default_value = ".gatenet")]
    pub state_dir: PathBuf,

    /// Network id. Nodes only ever talk to nodes with the same id.
    #[arg(long, short = 'n', env = "GATENET_NETWORK", default_value = "testnet")]
    pub network: String,

    /// Addresses to listen on. Repeat the flag for more than one.
    #[arg(
        long = "listen",
        env = "GATENET_LISTEN",
        value_delimiter = ',',
        default_value = "/ip4/0.0.0.0/tcp/4001"
    )]
    pub listen_addrs: Vec<Multiaddr>,

    /// Publicly reachable address to advertise next to the listen addresses.
    #[arg(long, env = "GATENET_EXTERNAL_ADDR")]
    pub external_addr: Option<Multiaddr>,

    /// Seed peers, as full multiaddrs ending in `/p2p/<peer id>`.
    #[arg(long = "bootstrap", env = "GATENET_BOOTSTRAP", value_delimiter = ',')]
    pub bootstrap_peers: Vec<Multiaddr>,

    /// Disable UPnP port mapping.
    #[arg(long, env = "GATENET_NO_NAT")]
    pub no_nat: bool,

    /// Hex-encoded node key. Read from `<state-dir>/node.key` when omitted.
    ///
    /// **Never pass this flag in production.** It ends up in shell history.
    #[arg(long, env = "GATENET_NODE_KEY", hide_env_values = true)]
    pub node_key: Option<String>,

    /// Port for the Prometheus metrics endpoint.
    #[arg(long, env = "GATENET_METRICS_PORT", default_value_t = 9742)]
    pub metrics_port: u16,

    /// Log format: `pretty` or `json`.
    #[arg(long, env = "GATENET_LOG_FORMAT", default_value = "pretty")]
    pub log_format: String,
}

/// Arguments for the `init` subcommand.
#[derive(Parser, Debug)]
pub struct InitArgs {
    /// State directory to initialize.
    #[arg(long, short = 'd', env = "GATENET_STATE_DIR", default_value = ".gatenet")]
    pub state_dir: PathBuf,

    /// Overwrite an existing node key.
    #[arg(long)]
    pub force: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn verify_cli_structure() {
        GatenetNodeCli::command().debug_assert();
    }

    #[test]
    fn run_parses_multiaddr_lists() {
        let cli = GatenetNodeCli::try_parse_from([
            "gatenet-node",
            "run",
            "--listen",
            "/ip4/127.0.0.1/tcp/0,/ip6/::1/tcp/0",
            "--external-addr",
            "/ip4/1.2.3.4/tcp/9000",
            "--no-nat",
        ])
        .unwrap();

        let Commands::Run(args) = cli.command else {
            panic!("expected run");
        };
        assert_eq!(args.listen_addrs.len(), 2);
        assert!(args.external_addr.is_some());
        assert!(args.no_nat);
        assert!(args.bootstrap_peers.is_empty());
    }

    #[test]
    fn bad_multiaddr_is_rejected() {
        let parsed = GatenetNodeCli::try_parse_from(["gatenet-node", "run", "--listen", "nonsense"]);
        assert!(parsed.is_err());
    }
}
