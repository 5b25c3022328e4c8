// Copyright (c) 2026 ALAS Technology. MIT License.
// See LICENSE for details.

//! # Gatenet Protocol — Node Bootstrap Library
//!
//! Gatenet nodes find each other over libp2p, inside a private network that
//! only nodes agreeing on the same network id can join. This crate does the
//! unglamorous part: it turns a private key and a state directory into a
//! running, reachable, routable node.
//!
//! ## Architecture
//!
//! - **crypto** — Node identity from key material, private-network key from
//!   the rendezvous string. One hash, zero creativity.
//! - **storage** — Two sled databases: the peerstore and the DHT records.
//!   They survive restarts. That's the whole point.
//! - **network** — Transport, dual LAN/WAN Kademlia, address filtering and
//!   the [`bootstrap`] orchestrator that wires it all together.
//! - **config** — Protocol names, directory names, timeouts and watermarks.
//!
//! ## Quick Start
//!
//! ```no_run
//! # async fn run() -> Result<(), gatenet_protocol::BootstrapError> {
//! use gatenet_protocol::{bootstrap, NodeConfig, NodeIdentity};
//!
//! let config = NodeConfig {
//!     key_material: NodeIdentity::generate().to_protobuf_encoding()?,
//!     listen_addrs: vec!["/ip4/0.0.0.0/tcp/4001".parse().expect("valid multiaddr")],
//!     network_id: "testnet".into(),
//!     ..NodeConfig::default()
//! };
//! let node = bootstrap(config).await?;
//! println!("up as {} on {:?}", node.peer_id(), node.addrs());
//! # Ok(()) }
//! ```
//!
//! ## Design Philosophy
//!
//! 1. Bootstrap is all or nothing. Half-started nodes are worse than none.
//! 2. Nothing secret is ever logged. Fingerprints only.
//! 3. The swarm has one owner. Everyone else sends it messages.

pub mod config;
pub mod crypto;
pub mod network;
pub mod storage;

pub use crypto::{rendezvous_string, InvalidKeyError, NodeIdentity, PrivateNetworkKey};
pub use network::{bootstrap, BootstrapError, NodeConfig, NodeHandle};
pub use storage::{PeerAddrInfo, StorageUnavailableError, StoreOptions};
