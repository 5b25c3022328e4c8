//! # Dual DHT Bootstrap
//!
//! Two Kademlia tables, one swarm:
//!
//! | Tier | Protocol                  | Store tree    | Seeded with      |
//! |------|---------------------------|---------------|------------------|
//! | LAN  | `/gatenet/lan/kad/1.0.0`  | `records/lan` | identify results |
//! | WAN  | `/gatenet/kad/1.0.0`      | `records/wan` | bootstrap peers  |
//!
//! The tables are built *inside* host construction: the host hands the
//! routing constructor a [`HostContext`] and takes back the behaviour to
//! plug into its swarm. Whoever started the bootstrap never sees that
//! return value, so the constructor also publishes a [`RoutingHandle`] on a
//! one-shot channel the moment construction succeeds.
//!
//! ```text
//!   bootstrap()                    host::construct()
//!       │                                │
//!       │                      spawn_blocking(routing ctor)
//!       │                                │ build lan + wan
//!       │◀──────── oneshot(RoutingHandle)┤
//!       │                                ▼
//!       │                          swarm + driver
//! ```
//!
//! If construction fails, the sender is dropped unsent and the error
//! travels back through host construction instead. Nothing is retried.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use libp2p::kad::{self, Mode};
use libp2p::multiaddr::Protocol;
use libp2p::swarm::NetworkBehaviour;
use libp2p::{Multiaddr, PeerId, StreamProtocol};
use sled::Db;
use tokio::sync::oneshot;
use tracing::{debug, info, warn, Span};

use super::host::{HostContext, RoutingConstructor};
use super::routing::{RoutingHandle, Tier};
use super::validator::RecordValidator;
use crate::config;
use crate::storage::{PeerAddrInfo, SledRecordStore};

/// Sled tree names inside `dht-v0`.
pub const LAN_RECORDS_TREE: &str = "records/lan";
pub const WAN_RECORDS_TREE: &str = "records/wan";

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum RoutingInitError {
    #[error("cannot open dht store tree '{tree}': {source}")]
    Store {
        tree: &'static str,
        #[source]
        source: sled::Error,
    },

    #[error("invalid routing protocol name '{0}'")]
    InvalidProtocol(String),

    #[error("invalid bootstrap peer {peer}: {reason}")]
    InvalidSeed { peer: PeerId, reason: String },

    #[error("routing constructor did not complete: {0}")]
    Aborted(String),
}

// ---------------------------------------------------------------------------
// Behaviour
// ---------------------------------------------------------------------------

/// The LAN and WAN tables, side by side in one behaviour.
#[derive(NetworkBehaviour)]
pub struct DualDht {
    pub lan: kad::Behaviour<SledRecordStore>,
    pub wan: kad::Behaviour<SledRecordStore>,
}

impl DualDht {
    pub fn tier_mut(&mut self, tier: Tier) -> &mut kad::Behaviour<SledRecordStore> {
        match tier {
            Tier::Lan => &mut self.lan,
            Tier::Wan => &mut self.wan,
        }
    }

    /// Routes an address to the tier it belongs in and records it there.
    pub fn add_address(&mut self, peer: &PeerId, addr: Multiaddr) -> Tier {
        let tier = tier_for(&addr);
        self.tier_mut(tier).add_address(peer, addr);
        tier
    }
}

/// What the routing constructor hands back to the host.
pub struct DualRouting {
    pub behaviour: DualDht,
    pub validator: Arc<RecordValidator>,
}

// ---------------------------------------------------------------------------
// Address Classification
// ---------------------------------------------------------------------------

/// Whether an address points at the local network (loopback, RFC 1918,
/// link-local, unique-local IPv6). Non-IP addresses count as wide-area.
pub fn is_lan_addr(addr: &Multiaddr) -> bool {
    addr.iter()
        .find_map(|proto| match proto {
            Protocol::Ip4(ip) => Some(IpAddr::V4(ip)),
            Protocol::Ip6(ip) => Some(IpAddr::V6(ip)),
            _ => None,
        })
        .map(|ip| match ip {
            IpAddr::V4(v4) => v4.is_private() || v4.is_loopback() || v4.is_link_local(),
            IpAddr::V6(v6) => {
                let first = v6.segments()[0];
                v6.is_loopback() || (first & 0xfe00) == 0xfc00 || (first & 0xffc0) == 0xfe80
            }
        })
        .unwrap_or(false)
}

pub fn tier_for(addr: &Multiaddr) -> Tier {
    if is_lan_addr(addr) {
        Tier::Lan
    } else {
        Tier::Wan
    }
}

// ---------------------------------------------------------------------------
// Options & Constructor
// ---------------------------------------------------------------------------

/// Inputs to the dual DHT.
#[derive(Clone)]
pub struct RoutingOptions {
    /// Protocol prefix, `gatenet` unless you're running a private fork.
    pub protocol_prefix: String,
    /// WAN seeds.
    pub bootstrap_peers: Vec<PeerAddrInfo>,
    /// The `dht-v0` database.
    pub store: Db,
    /// Parent span for the record validator's logs.
    pub span: Span,
    pub query_timeout: Duration,
}

impl RoutingOptions {
    pub fn new(store: Db, bootstrap_peers: Vec<PeerAddrInfo>, span: Span) -> Self {
        Self {
            protocol_prefix: config::PROTOCOL_PREFIX.to_string(),
            bootstrap_peers,
            store,
            span,
            query_timeout: config::DHT_QUERY_TIMEOUT,
        }
    }
}

/// The routing constructor plus its handoff sender.
pub struct DualRoutingBootstrap {
    options: RoutingOptions,
    handoff: oneshot::Sender<RoutingHandle>,
}

impl DualRoutingBootstrap {
    pub fn new(options: RoutingOptions, handoff: oneshot::Sender<RoutingHandle>) -> Self {
        Self { options, handoff }
    }

    /// Boxes this up as the host's routing constructor.
    pub fn into_constructor(self) -> RoutingConstructor {
        Box::new(move |ctx| self.construct(ctx))
    }

    /// Builds both tiers and publishes the routing handle.
    ///
    /// Runs on a blocking thread (sled tree opens touch the disk).
    pub fn construct(self, ctx: HostContext) -> Result<DualRouting, RoutingInitError> {
        let Self { options, handoff } = self;
        let local = ctx.local_peer_id;

        let mut seeds = Vec::with_capacity(options.bootstrap_peers.len());
        for seed in &options.bootstrap_peers {
            if let Some(addrs) = usable_seed_addrs(seed, &local)? {
                seeds.push((seed.peer_id, addrs));
            }
        }

        let validator = Arc::new(RecordValidator::standard(tracing::debug_span!(
            parent: &options.span,
            "dht_validator"
        )));

        let mut lan = build_tier(&options, local, Tier::Lan)?;
        let mut wan = build_tier(&options, local, Tier::Wan)?;

        // Nobody on the LAN is going to confirm an external address for us,
        // so don't wait for one before answering queries.
        lan.set_mode(Some(Mode::Server));

        for (peer, addrs) in &seeds {
            for addr in addrs {
                wan.add_address(peer, addr.clone());
            }
        }
        if !seeds.is_empty() {
            if let Err(e) = wan.bootstrap() {
                warn!(error = %e, "initial wan bootstrap not started");
            }
        }

        let handle = RoutingHandle::new(ctx.routing_commands, Arc::clone(&validator));
        if handoff.send(handle).is_err() {
            debug!("routing handoff receiver gone before construction finished");
        }

        info!(
            seeds = seeds.len(),
            skipped = options.bootstrap_peers.len() - seeds.len(),
            prefix = %options.protocol_prefix,
            "dual dht constructed"
        );

        Ok(DualRouting {
            behaviour: DualDht { lan, wan },
            validator,
        })
    }
}

/// The dialable addresses of a bootstrap peer, or `None` if the entry is
/// skipped.
///
/// Our own entry and entries without addresses are skipped, so every node
/// can be handed the same seed list. An address whose `/p2p` suffix names
/// some other peer is a configuration error.
fn usable_seed_addrs(
    seed: &PeerAddrInfo,
    local: &PeerId,
) -> Result<Option<Vec<Multiaddr>>, RoutingInitError> {
    if seed.peer_id == *local {
        debug!(peer = %seed.peer_id, "skipping bootstrap peer: it is this node");
        return Ok(None);
    }

    let mut addrs = Vec::with_capacity(seed.addrs.len());
    for addr in &seed.addrs {
        match addr.iter().last() {
            Some(Protocol::P2p(id)) if id != seed.peer_id => {
                return Err(RoutingInitError::InvalidSeed {
                    peer: seed.peer_id,
                    reason: format!("address {addr} names peer {id}"),
                });
            }
            None => {}
            _ => addrs.push(addr.clone()),
        }
    }

    if addrs.is_empty() {
        warn!(peer = %seed.peer_id, "skipping bootstrap peer without addresses");
        return Ok(None);
    }
    Ok(Some(addrs))
}

fn build_tier(
    options: &RoutingOptions,
    local: PeerId,
    tier: Tier,
) -> Result<kad::Behaviour<SledRecordStore>, RoutingInitError> {
    let (tree_name, lan) = match tier {
        Tier::Lan => (LAN_RECORDS_TREE, true),
        Tier::Wan => (WAN_RECORDS_TREE, false),
    };

    let prefix = &options.protocol_prefix;
    let protocol_name = config::kad_protocol(prefix, lan);
    if prefix.is_empty() || prefix.contains(|c: char| c == '/' || c.is_whitespace()) {
        return Err(RoutingInitError::InvalidProtocol(protocol_name));
    }
    let protocol = StreamProtocol::try_from_owned(protocol_name.clone())
        .map_err(|_| RoutingInitError::InvalidProtocol(protocol_name))?;

    let tree = options
        .store
        .open_tree(tree_name)
        .map_err(|source| RoutingInitError::Store {
            tree: tree_name,
            source,
        })?;
    let store = SledRecordStore::new(local, tree);

    let mut cfg = kad::Config::default();
    cfg.set_protocol_names(vec![protocol]);
    // Every inbound record goes through the validator before it's stored.
    cfg.set_record_filtering(kad::StoreInserts::FilterBoth);
    cfg.set_query_timeout(options.query_timeout);

    Ok(kad::Behaviour::with_config(local, store, cfg))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
