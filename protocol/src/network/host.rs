//! # Host Construction
//!
//! Turns an identity plus a [`HostConfig`] into a running libp2p swarm and
//! a [`HostHandle`] to talk to it.
//!
//! ## Transport Stack
//!
//! ```text
//! TCP (nodelay)
//!  └─ pnet        pre-shared key derived from the rendezvous string
//!      └─ noise   authenticated encryption, keyed by the node identity
//!          └─ yamux
//! ```
//!
//! A peer without the right pre-shared key can't even complete the noise
//! handshake, so everything above pnet only ever sees members of the same
//! network.
//!
//! ## Behaviours
//!
//! | Field      | Purpose                                              |
//! |------------|------------------------------------------------------|
//! | `filter`   | address filter, denies blocked connections early     |
//! | `identify` | user agent, listen addrs, feeds peerstore + DHT      |
//! | `nat`      | UPnP port mapping, optional                          |
//! | `dht`      | LAN + WAN Kademlia, built by the routing constructor |
//!
//! Order matters for `filter`: the derive polls connection hooks in field
//! order, so it gets to say no before anyone else spends effort.
//!
//! ## Construction Order
//!
//! 1. Build the transport (fails on bad key material for noise).
//! 2. Run the routing constructor on a blocking task. It returns the DHT
//!    behaviour and publishes its own handle on the side.
//! 3. Assemble the swarm, start listening, register the external address.
//! 4. Spawn the swarm task.
//!
//! A failure at any step drops everything built so far.

use std::sync::Arc;

use libp2p::core::muxing::StreamMuxerBox;
use libp2p::core::transport::Boxed;
use libp2p::core::upgrade;
use libp2p::identity::Keypair;
use libp2p::pnet::PnetConfig;
use libp2p::swarm::behaviour::toggle::Toggle;
use libp2p::swarm::{self, NetworkBehaviour, Swarm};
use libp2p::{identify, noise, tcp, upnp, yamux, Multiaddr, PeerId, Transport};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{info, Instrument, Span};

use super::connmgr::{ConnManager, ConnManagerConfig};
use super::driver::SwarmDriver;
use super::dual::{DualDht, DualRouting, RoutingInitError};
use super::filter::{AddressFilter, FilterBehaviour};
use super::routing::RoutingCommand;
use crate::config;
use crate::crypto::{NodeIdentity, PrivateNetworkKey};
use crate::storage::PeerStore;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum TransportConstructionError {
    #[error("invalid host configuration: {0}")]
    InvalidConfig(String),

    #[error("circuit relay is not supported")]
    RelayUnsupported,

    #[error("no listen addresses configured")]
    NoListenAddrs,

    #[error("noise setup failed: {0}")]
    Noise(String),

    #[error("cannot listen on {addr}: {reason}")]
    Listen { addr: Multiaddr, reason: String },
}

/// Why host construction failed.
#[derive(Debug, thiserror::Error)]
pub enum HostError {
    #[error(transparent)]
    Transport(#[from] TransportConstructionError),

    #[error(transparent)]
    Routing(#[from] RoutingInitError),
}

/// Failure of a [`HostHandle::connect`] call.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConnectError {
    #[error("the node's swarm task has stopped")]
    NodeStopped,

    #[error("dial failed: {0}")]
    Dial(String),
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Stream multiplexer. Yamux is the only one we ship.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Muxer {
    #[default]
    Yamux,
}

/// What the routing constructor gets to see of the host under construction.
pub struct HostContext {
    pub local_peer_id: PeerId,
    pub(crate) routing_commands: mpsc::Sender<RoutingCommand>,
}

/// Builds the DHT behaviour. Evaluated exactly once, on a blocking task,
/// during host construction.
pub type RoutingConstructor =
    Box<dyn FnOnce(HostContext) -> Result<DualRouting, RoutingInitError> + Send>;

/// Everything host construction needs beyond the identity.
pub struct HostConfig {
    pub listen_addrs: Vec<Multiaddr>,
    /// Appended to every address set we report. `None` reports listen
    /// addresses only.
    pub external_addr: Option<Multiaddr>,
    pub muxer: Muxer,
    /// Must stay `false`.
    pub enable_relay: bool,
    pub conn_manager: ConnManagerConfig,
    pub nat_port_map: bool,
    pub filter: AddressFilter,
    pub psk: PrivateNetworkKey,
    pub user_agent: String,
    pub peerstore: PeerStore,
    pub routing: RoutingConstructor,
    pub span: Span,
}

impl HostConfig {
    /// Checked once, before anything is constructed.
    pub fn validate(&self) -> Result<(), TransportConstructionError> {
        if self.enable_relay {
            return Err(TransportConstructionError::RelayUnsupported);
        }
        if self.listen_addrs.is_empty() {
            return Err(TransportConstructionError::NoListenAddrs);
        }
        if self.user_agent.is_empty() {
            return Err(TransportConstructionError::InvalidConfig(
                "user agent must not be empty".into(),
            ));
        }
        self.conn_manager
            .validate()
            .map_err(TransportConstructionError::InvalidConfig)
    }
}

// ---------------------------------------------------------------------------
// Behaviour & Transport
// ---------------------------------------------------------------------------

#[derive(NetworkBehaviour)]
pub struct NodeBehaviour {
    pub filter: FilterBehaviour,
    pub identify: identify::Behaviour,
    pub nat: Toggle<upnp::tokio::Behaviour>,
    pub dht: DualDht,
}

/// TCP → pnet → noise → yamux.
pub fn build_transport(
    keypair: &Keypair,
    psk: &PrivateNetworkKey,
) -> Result<Boxed<(PeerId, StreamMuxerBox)>, TransportConstructionError> {
    let psk = psk.to_psk();
    let noise =
        noise::Config::new(keypair).map_err(|e| TransportConstructionError::Noise(e.to_string()))?;

    Ok(tcp::tokio::Transport::new(tcp::Config::default().nodelay(true))
        .and_then(move |socket, _| PnetConfig::new(psk).handshake(socket))
        .upgrade(upgrade::Version::V1Lazy)
        .authenticate(noise)
        .multiplex(yamux::Config::default())
        .timeout(config::TRANSPORT_TIMEOUT)
        .boxed())
}

/// Listen addresses with the external address appended (once).
pub fn advertised_addrs(listen: &[Multiaddr], external: Option<&Multiaddr>) -> Vec<Multiaddr> {
    let mut addrs = listen.to_vec();
    if let Some(external) = external {
        if !addrs.contains(external) {
            addrs.push(external.clone());
        }
    }
    addrs
}

// ---------------------------------------------------------------------------
// Construction
// ---------------------------------------------------------------------------

/// A running host: the handle plus the swarm task it talks to.
pub struct Host {
    pub handle: HostHandle,
    pub task: JoinHandle<()>,
}

/// Builds and starts the host. See the module docs for the order of events.
pub async fn construct(identity: &NodeIdentity, config: HostConfig) -> Result<Host, HostError> {
    let HostConfig {
        listen_addrs,
        external_addr,
        muxer: _,
        enable_relay: _,
        conn_manager,
        nat_port_map,
        filter,
        psk,
        user_agent,
        peerstore,
        routing,
        span,
    } = config;

    let keypair = identity.keypair().clone();
    let peer_id = identity.peer_id();

    let transport = build_transport(&keypair, &psk)?;

    let (routing_tx, routing_rx) = mpsc::channel(config::COMMAND_CHANNEL_CAPACITY);
    let ctx = HostContext {
        local_peer_id: peer_id,
        routing_commands: routing_tx,
    };
    let DualRouting {
        behaviour: dht,
        validator,
    } = tokio::task::spawn_blocking(move || routing(ctx))
        .await
        .map_err(|e| RoutingInitError::Aborted(e.to_string()))??;

    let identify = identify::Behaviour::new(
        identify::Config::new(config::IDENTIFY_PROTOCOL_VERSION.to_string(), keypair.public())
            .with_agent_version(user_agent),
    );
    let behaviour = NodeBehaviour {
        filter: FilterBehaviour::new(filter),
        identify,
        nat: Toggle::from(nat_port_map.then(upnp::tokio::Behaviour::default)),
        dht,
    };

    let mut swarm = Swarm::new(
        transport,
        behaviour,
        peer_id,
        swarm::Config::with_tokio_executor()
            .with_idle_connection_timeout(config::IDLE_CONNECTION_TIMEOUT),
    );

    for addr in &listen_addrs {
        swarm
            .listen_on(addr.clone())
            .map_err(|e| TransportConstructionError::Listen {
                addr: addr.clone(),
                reason: e.to_string(),
            })?;
    }
    if let Some(external) = &external_addr {
        swarm.add_external_address(external.clone());
    }

    let listening = Arc::new(RwLock::new(Vec::new()));
    let (host_tx, host_rx) = mpsc::channel(config::COMMAND_CHANNEL_CAPACITY);

    let driver = SwarmDriver::new(
        swarm,
        host_rx,
        routing_rx,
        ConnManager::new(conn_manager),
        validator,
        peerstore,
        Arc::clone(&listening),
    );
    let task = tokio::spawn(driver.run().instrument(span));

    info!(
        %peer_id,
        listen = ?listen_addrs,
        external = ?external_addr,
        nat = nat_port_map,
        "host constructed"
    );

    Ok(Host {
        handle: HostHandle {
            peer_id,
            listening,
            external_addr,
            commands: host_tx,
        },
        task,
    })
}

// ---------------------------------------------------------------------------
// HostHandle
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub(crate) enum HostCommand {
    Connect {
        addr: Multiaddr,
        respond: oneshot::Sender<Result<PeerId, ConnectError>>,
    },
    ConnectedPeers {
        respond: oneshot::Sender<Vec<PeerId>>,
    },
    Disconnect {
        peer: PeerId,
        respond: oneshot::Sender<bool>,
    },
    Shutdown,
}

/// Cloneable handle to the running host.
#[derive(Clone)]
pub struct HostHandle {
    peer_id: PeerId,
    listening: Arc<RwLock<Vec<Multiaddr>>>,
    external_addr: Option<Multiaddr>,
    commands: mpsc::Sender<HostCommand>,
}

impl HostHandle {
    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    /// Addresses the swarm is actually listening on right now.
    pub fn listen_addrs(&self) -> Vec<Multiaddr> {
        self.listening.read().clone()
    }

    pub fn external_addr(&self) -> Option<&Multiaddr> {
        self.external_addr.as_ref()
    }

    /// Addresses we advertise: listen addresses plus the external one.
    pub fn addrs(&self) -> Vec<Multiaddr> {
        advertised_addrs(&self.listening.read(), self.external_addr.as_ref())
    }

    /// Dials `addr` and resolves to the remote peer id once a connection is
    /// up. Fails if the dial is refused (filter, bad address) or the
    /// transport upgrade fails (wrong network, unreachable).
    pub async fn connect(&self, addr: Multiaddr) -> Result<PeerId, ConnectError> {
        let (respond, rx) = oneshot::channel();
        self.commands
            .send(HostCommand::Connect { addr, respond })
            .await
            .map_err(|_| ConnectError::NodeStopped)?;
        rx.await.map_err(|_| ConnectError::NodeStopped)?
    }

    pub async fn connected_peers(&self) -> Vec<PeerId> {
        let (respond, rx) = oneshot::channel();
        if self
            .commands
            .send(HostCommand::ConnectedPeers { respond })
            .await
            .is_err()
        {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    /// Closes every connection to `peer`. Returns whether there were any.
    pub async fn disconnect(&self, peer: PeerId) -> bool {
        let (respond, rx) = oneshot::channel();
        if self
            .commands
            .send(HostCommand::Disconnect { peer, respond })
            .await
            .is_err()
        {
            return false;
        }
        rx.await.unwrap_or(false)
    }

    /// Asks the swarm task to stop. Await the task's `JoinHandle` to know
    /// when it has.
    pub async fn shutdown(&self) {
        let _ = self.commands.send(HostCommand::Shutdown).await;
    }

    pub fn is_running(&self) -> bool {
        !self.commands.is_closed()
    }
}

impl std::fmt::Debug for HostHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostHandle")
            .field("peer_id", &self.peer_id)
            .field("addrs", &self.addrs())
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::dual::{DualRoutingBootstrap, RoutingOptions};
    use crate::storage::db::{open_db, StoreOptions};

    fn addr(s: &str) -> Multiaddr {
        s.parse().unwrap()
    }

    fn failing_constructor() -> RoutingConstructor {
        Box::new(|_| Err(RoutingInitError::InvalidProtocol("nope".into())))
    }

    fn test_config(dir: &std::path::Path, routing: RoutingConstructor) -> HostConfig {
        let peerstore_db = open_db(&dir.join("peerstore"), &StoreOptions::default()).unwrap();
        HostConfig {
            listen_addrs: vec![addr("/ip4/127.0.0.1/tcp/0")],
            external_addr: Some(addr("/ip4/1.2.3.4/tcp/9000")),
            muxer: Muxer::Yamux,
            enable_relay: false,
            conn_manager: ConnManagerConfig::default(),
            nat_port_map: false,
            filter: AddressFilter::new(),
            psk: PrivateNetworkKey::for_network("testnet"),
            user_agent: config::USER_AGENT.to_string(),
            peerstore: PeerStore::new(peerstore_db).unwrap(),
            routing,
            span: Span::none(),
        }
    }

    #[test]
    fn advertised_addrs_append_external_once() {
        let listen = vec![addr("/ip4/127.0.0.1/tcp/4001")];
        let external = addr("/ip4/1.2.3.4/tcp/9000");

        let addrs = advertised_addrs(&listen, Some(&external));
        assert_eq!(addrs, vec![listen[0].clone(), external.clone()]);

        let already = vec![external.clone()];
        assert_eq!(advertised_addrs(&already, Some(&external)), already);
        assert_eq!(advertised_addrs(&listen, None), listen);
    }

    #[test]
    fn relay_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = test_config(dir.path(), failing_constructor());
        cfg.enable_relay = true;
        assert!(matches!(
            cfg.validate(),
            Err(TransportConstructionError::RelayUnsupported)
        ));
    }

    #[test]
    fn empty_listen_set_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = test_config(dir.path(), failing_constructor());
        cfg.listen_addrs.clear();
        assert!(matches!(
            cfg.validate(),
            Err(TransportConstructionError::NoListenAddrs)
        ));
    }

    #[test]
    fn bad_watermarks_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = test_config(dir.path(), failing_constructor());
        cfg.conn_manager.low_watermark = cfg.conn_manager.high_watermark;
        assert!(matches!(
            cfg.validate(),
            Err(TransportConstructionError::InvalidConfig(_))
        ));
    }

    #[test]
    fn transport_builds_for_any_network_key() {
        let identity = NodeIdentity::generate();
        assert!(build_transport(identity.keypair(), &PrivateNetworkKey::derive("")).is_ok());
    }

    #[tokio::test]
    async fn routing_failure_surfaces_through_construction() {
        let dir = tempfile::tempdir().unwrap();
        let identity = NodeIdentity::generate();
        let cfg = test_config(dir.path(), failing_constructor());

        let err = construct(&identity, cfg).await.err().expect("must fail");
        assert!(matches!(
            err,
            HostError::Routing(RoutingInitError::InvalidProtocol(_))
        ));
    }

    #[tokio::test]
    async fn unusable_listen_address_is_a_transport_error() {
        let dir = tempfile::tempdir().unwrap();
        let identity = NodeIdentity::generate();
        let dht = open_db(&dir.path().join("dht"), &StoreOptions::default()).unwrap();
        let (tx, _rx) = oneshot::channel();
        let routing = DualRoutingBootstrap::new(RoutingOptions::new(dht, Vec::new(), Span::none()), tx)
            .into_constructor();

        let mut cfg = test_config(dir.path(), routing);
        // TCP can't listen on a UDP address.
        cfg.listen_addrs = vec![addr("/ip4/127.0.0.1/udp/0")];

        let err = construct(&identity, cfg).await.err().expect("must fail");
        assert!(matches!(
            err,
            HostError::Transport(TransportConstructionError::Listen { .. })
        ));
    }

    #[tokio::test]
    async fn constructed_host_reports_external_address() {
        let dir = tempfile::tempdir().unwrap();
        let identity = NodeIdentity::generate();
        let dht = open_db(&dir.path().join("dht"), &StoreOptions::default()).unwrap();
        let (tx, rx) = oneshot::channel();
        let routing = DualRoutingBootstrap::new(RoutingOptions::new(dht, Vec::new(), Span::none()), tx)
            .into_constructor();

        let host = construct(&identity, test_config(dir.path(), routing))
            .await
            .expect("construct");
        let routing = rx.await.expect("handoff");

        assert_eq!(host.handle.peer_id(), identity.peer_id());
        assert!(host.handle.addrs().contains(&addr("/ip4/1.2.3.4/tcp/9000")));
        assert!(host.handle.connected_peers().await.is_empty());
        assert_eq!(routing.routing_table_size().await.unwrap().total(), 0);

        host.handle.shutdown().await;
        host.task.await.unwrap();
        assert!(!host.handle.is_running());
        assert!(routing.is_stopped());
    }
}
