//! # Network Module
//!
//! Everything between "here are some keys" and "here is a node other nodes
//! can find". There is no consensus, no gossip, no mempool in here. Just
//! transport, routing and the glue between them.
//!
//! ## Architecture
//!
//! ```text
//! bootstrap.rs  — NodeConfig in, NodeHandle out. The orchestrator.
//! host.rs       — Transport stack + swarm construction, HostHandle
//! driver.rs     — The swarm event loop (one task per node)
//! dual.rs       — LAN + WAN Kademlia, built inside the host constructor
//! routing.rs    — RoutingHandle and in-flight query bookkeeping
//! validator.rs  — Record validation, namespaced, logged, counted
//! filter.rs     — Mutable CIDR deny/accept rules, enforced per connection
//! connmgr.rs    — Watermark-based connection trimming
//! ```
//!
//! ## Design Decisions
//!
//! - The swarm is owned by exactly one task ([`driver`]). Everybody else
//!   talks to it through bounded `mpsc` channels and gets answers back on
//!   `oneshot`s. No locks around the swarm, ever.
//! - The routing layer is constructed *inside* host construction, because
//!   it needs the host's peer id and command channel. Its handle escapes
//!   through a one-shot channel that [`bootstrap`] races against the
//!   construction result.
//! - The address filter is shared state behind a `parking_lot::RwLock`.
//!   Reads happen on every connection attempt and writes happen when an
//!   operator says so, which is approximately never.
//! - Both DHT tiers share the same record validator. LAN records are kept
//!   in their own sled tree so a coffee-shop DHT can't pollute the WAN one.

pub mod bootstrap;
pub mod connmgr;
mod driver;
pub mod dual;
pub mod filter;
pub mod host;
pub mod routing;
pub mod validator;

pub use bootstrap::{
    bootstrap, AlreadyAttached, BootstrapError, DiscoveryService, NodeConfig, NodeHandle,
    NodeServices, PubsubService,
};
pub use connmgr::{ConnManager, ConnManagerConfig};
pub use dual::{DualDht, DualRouting, DualRoutingBootstrap, RoutingInitError, RoutingOptions};
pub use filter::{AddressFilter, FilterAction, FilterRule};
pub use host::{
    ConnectError, HostConfig, HostContext, HostError, HostHandle, Muxer, RoutingConstructor,
    TransportConstructionError,
};
pub use routing::{RoutingError, RoutingHandle, RoutingTableSize, Tier};
pub use validator::{
    NamespacedValidator, PublicKeyValidator, RecordValidator, ValidationError, Validator,
    ValidatorSnapshot,
};
