//! # Node Bootstrap
//!
//! [`bootstrap`] is the front door: key material and a few addresses in, a
//! running [`NodeHandle`] out.
//!
//! ## Sequence
//!
//! ```text
//! 1. identity        key material → NodeIdentity          (InvalidKey)
//! 2. stores          peerstore-v0/, dht-v0/                (StorageUnavailable)
//! 3. network key     rendezvous string → BLAKE2b-256 → PSK
//! 4. filter          empty AddressFilter
//! 5. host config     validated once                        (TransportConstruction)
//! 6. construction ─┬─ routing ctor on a blocking task      (RoutingInit)
//!                  └─ oneshot(RoutingHandle) ◀── raced ──▶ construction result
//! 7. NodeHandle      discovery / pubsub / discovered peers left empty
//! ```
//!
//! Step 6 is the interesting one. The routing handle only exists as a side
//! effect of host construction, so we wait on two things at once: the
//! handoff channel and the construction future. A construction error wins
//! immediately. A handoff that closes without a value means the routing
//! constructor failed, and the construction error says why.
//!
//! There is no timeout in here. Wrap the call in `tokio::time::timeout` if
//! you need one.

use std::path::PathBuf;

use libp2p::{Multiaddr, PeerId};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{info, info_span, warn, Span};

use super::connmgr::ConnManagerConfig;
use super::dual::{DualRoutingBootstrap, RoutingInitError, RoutingOptions};
use super::filter::AddressFilter;
use super::host::{self, HostConfig, HostError, HostHandle, Muxer, TransportConstructionError};
use super::routing::{RoutingError, RoutingHandle};
use super::validator::ValidatorSnapshot;
use crate::config;
use crate::crypto::{rendezvous_string, InvalidKeyError, NodeIdentity, PrivateNetworkKey};
use crate::storage::{DbError, PeerAddrInfo, PeerStore, StateStores, StorageUnavailableError, StoreOptions};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum BootstrapError {
    #[error("invalid key material: {0}")]
    InvalidKey(#[from] InvalidKeyError),

    #[error(transparent)]
    StorageUnavailable(#[from] StorageUnavailableError),

    #[error("routing construction failed: {0}")]
    RoutingInit(#[from] RoutingInitError),

    #[error("transport construction failed: {0}")]
    TransportConstruction(#[from] TransportConstructionError),

    #[error("routing handle was never delivered")]
    RoutingHandoffDropped,
}

impl From<HostError> for BootstrapError {
    fn from(err: HostError) -> Self {
        match err {
            HostError::Transport(e) => BootstrapError::TransportConstruction(e),
            HostError::Routing(e) => BootstrapError::RoutingInit(e),
        }
    }
}

/// Services were already attached to this node.
#[derive(Debug, thiserror::Error)]
#[error("services are already attached to this node")]
pub struct AlreadyAttached;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Everything [`bootstrap`] needs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Private key material: libp2p protobuf encoding or a raw 32-byte
    /// Ed25519 secret. Never serialized; load it from a key file.
    #[serde(skip)]
    pub key_material: Vec<u8>,
    pub listen_addrs: Vec<Multiaddr>,
    /// Advertised in addition to the listen addresses. Ignored when empty.
    pub external_addr: Multiaddr,
    pub state_dir: PathBuf,
    pub network_id: String,
    pub bootstrap_peers: Vec<PeerAddrInfo>,
    /// UPnP port mapping.
    pub nat_port_map: bool,
    pub store: StoreOptions,
    pub conn_manager: ConnManagerConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            key_material: Vec::new(),
            listen_addrs: Vec::new(),
            external_addr: Multiaddr::empty(),
            state_dir: PathBuf::from(".gatenet"),
            network_id: "testnet".to_string(),
            bootstrap_peers: Vec::new(),
            nat_port_map: true,
            store: StoreOptions::default(),
            conn_manager: ConnManagerConfig::default(),
        }
    }
}

// ---------------------------------------------------------------------------
// Late-bound Services
// ---------------------------------------------------------------------------

/// Peer discovery (mDNS or similar). Provided by a layer above this crate.
pub trait DiscoveryService: Send + Sync {
    fn shutdown(&self);
}

/// Publish/subscribe messaging. Provided by a layer above this crate.
pub trait PubsubService: Send + Sync {
    fn shutdown(&self);
}

/// The optional services, attached together, once.
pub struct NodeServices {
    pub discovery: Box<dyn DiscoveryService>,
    pub pubsub: Box<dyn PubsubService>,
    pub discovered_peers: mpsc::Receiver<PeerAddrInfo>,
}

// ---------------------------------------------------------------------------
// NodeHandle
// ---------------------------------------------------------------------------

/// A bootstrapped node.
///
/// Discovery, pubsub and the discovered-peers channel start out empty. Until
/// [`NodeHandle::attach_services`] runs the node is "not advertising" and
/// the accessors return `None`.
pub struct NodeHandle {
    peer_id: PeerId,
    host: HostHandle,
    routing: RoutingHandle,
    peerstore: PeerStore,
    filter: AddressFilter,
    rendezvous: String,
    span: Span,
    stores: StateStores,
    driver: JoinHandle<()>,
    discovery: Option<Box<dyn DiscoveryService>>,
    pubsub: Option<Box<dyn PubsubService>>,
    discovered_peers: Option<mpsc::Receiver<PeerAddrInfo>>,
}

impl NodeHandle {
    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    pub fn host(&self) -> &HostHandle {
        &self.host
    }

    pub fn routing(&self) -> &RoutingHandle {
        &self.routing
    }

    pub fn peerstore(&self) -> &PeerStore {
        &self.peerstore
    }

    /// The live filter. Rules added here apply to the next connection
    /// attempt.
    pub fn filter(&self) -> &AddressFilter {
        &self.filter
    }

    pub fn rendezvous(&self) -> &str {
        &self.rendezvous
    }

    pub fn span(&self) -> &Span {
        &self.span
    }

    /// Addresses we advertise: listen addresses plus the external one.
    pub fn addrs(&self) -> Vec<Multiaddr> {
        self.host.addrs()
    }

    pub fn validator_stats(&self) -> ValidatorSnapshot {
        self.routing.validator_stats()
    }

    // -- optional services --------------------------------------------------

    /// Populates the optional services. Only the first call succeeds.
    pub fn attach_services(&mut self, services: NodeServices) -> Result<(), AlreadyAttached> {
        if self.is_advertising() {
            return Err(AlreadyAttached);
        }
        self.discovery = Some(services.discovery);
        self.pubsub = Some(services.pubsub);
        self.discovered_peers = Some(services.discovered_peers);
        self.span.in_scope(|| info!("discovery and pubsub attached"));
        Ok(())
    }

    pub fn is_advertising(&self) -> bool {
        self.discovery.is_some()
    }

    pub fn discovery(&self) -> Option<&dyn DiscoveryService> {
        self.discovery.as_deref()
    }

    pub fn pubsub(&self) -> Option<&dyn PubsubService> {
        self.pubsub.as_deref()
    }

    pub fn discovered_peers(&mut self) -> Option<&mut mpsc::Receiver<PeerAddrInfo>> {
        self.discovered_peers.as_mut()
    }

    // -- lookups --------------------------------------------------------------

    /// Everything we can find out about `peer`: whatever the peerstore
    /// already knows, after a DHT walk towards it.
    pub async fn find_peer(&self, peer: PeerId) -> Result<PeerAddrInfo, RoutingError> {
        let closest = self.routing.closest_peers(peer).await?;
        let addrs = self
            .peerstore
            .addrs(&peer)
            .map_err(|e| RoutingError::Store(e.to_string()))?;
        if addrs.is_empty() && !closest.contains(&peer) {
            return Err(RoutingError::NotFound);
        }
        Ok(PeerAddrInfo::new(peer, addrs))
    }

    // -- teardown -------------------------------------------------------------

    /// Stops the swarm, shuts down attached services, then flushes and
    /// releases both stores.
    pub async fn shutdown(self) -> Result<(), DbError> {
        let NodeHandle {
            host,
            span,
            stores,
            driver,
            discovery,
            pubsub,
            peerstore,
            ..
        } = self;

        host.shutdown().await;
        if let Err(e) = driver.await {
            span.in_scope(|| warn!(error = %e, "swarm task ended abnormally"));
        }
        if let Some(discovery) = discovery {
            discovery.shutdown();
        }
        if let Some(pubsub) = pubsub {
            pubsub.shutdown();
        }

        peerstore.flush()?;
        drop(peerstore);
        stores.close()?;
        span.in_scope(|| info!("node shut down"));
        Ok(())
    }
}

impl std::fmt::Debug for NodeHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeHandle")
            .field("peer_id", &self.peer_id)
            .field("rendezvous", &self.rendezvous)
            .field("advertising", &self.is_advertising())
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Bootstrap
// ---------------------------------------------------------------------------

/// Brings a node up. All or nothing: on error, everything opened so far has
/// been released by the time this returns.
pub async fn bootstrap(config: NodeConfig) -> Result<NodeHandle, BootstrapError> {
    let identity = NodeIdentity::from_key_material(&config.key_material)?;
    let peer_id = identity.peer_id();
    let rendezvous = rendezvous_string(&config.network_id);

    let span = info_span!("node", %peer_id, network = %config.network_id);
    span.in_scope(|| info!(state_dir = %config.state_dir.display(), "bootstrapping node"));

    let stores = StateStores::open(&config.state_dir, &config.store)?;

    let dbs = (stores.peerstore_db().clone(), stores.dht_db().clone());
    match assemble(identity, config, rendezvous, dbs, span.clone()).await {
        Ok(parts) => Ok(parts.into_handle(stores)),
        Err(e) => {
            span.in_scope(|| warn!(error = %e, "bootstrap failed, releasing stores"));
            if let Err(close_err) = stores.close() {
                span.in_scope(|| warn!(error = %close_err, "store close after failed bootstrap"));
            }
            Err(e)
        }
    }
}

struct Assembled {
    peer_id: PeerId,
    host: HostHandle,
    driver: JoinHandle<()>,
    routing: RoutingHandle,
    peerstore: PeerStore,
    filter: AddressFilter,
    rendezvous: String,
    span: Span,
}

impl Assembled {
    fn into_handle(self, stores: StateStores) -> NodeHandle {
        self.span.in_scope(|| {
            info!(
                addrs = ?self.host.addrs(),
                rendezvous = %self.rendezvous,
                "node ready"
            )
        });
        NodeHandle {
            peer_id: self.peer_id,
            host: self.host,
            routing: self.routing,
            peerstore: self.peerstore,
            filter: self.filter,
            rendezvous: self.rendezvous,
            span: self.span,
            stores,
            driver: self.driver,
            discovery: None,
            pubsub: None,
            discovered_peers: None,
        }
    }
}

async fn assemble(
    identity: NodeIdentity,
    config: NodeConfig,
    rendezvous: String,
    dbs: (sled::Db, sled::Db),
    span: Span,
) -> Result<Assembled, BootstrapError> {
    let (peerstore_db, dht_db) = dbs;
    let peer_id = identity.peer_id();

    let peerstore = PeerStore::new(peerstore_db).map_err(|e| StorageUnavailableError {
        path: config.state_dir.join(config::PEERSTORE_DIR),
        reason: e.to_string(),
    })?;

    let psk = PrivateNetworkKey::derive(&rendezvous);
    span.in_scope(|| info!(psk = %psk.fingerprint(), "private network key derived"));

    let filter = AddressFilter::new();

    let (handoff_tx, handoff_rx) = oneshot::channel();
    let routing = DualRoutingBootstrap::new(
        RoutingOptions::new(dht_db, config.bootstrap_peers.clone(), span.clone()),
        handoff_tx,
    );

    let external_addr = (!config.external_addr.is_empty()).then(|| config.external_addr.clone());
    let host_config = HostConfig {
        listen_addrs: config.listen_addrs.clone(),
        external_addr,
        muxer: Muxer::Yamux,
        enable_relay: false,
        conn_manager: config.conn_manager.clone(),
        nat_port_map: config.nat_port_map,
        filter: filter.clone(),
        psk,
        user_agent: config::USER_AGENT.to_string(),
        peerstore: peerstore.clone(),
        routing: routing.into_constructor(),
        span: span.clone(),
    };
    host_config.validate()?;

    let construction = host::construct(&identity, host_config);
    tokio::pin!(construction);
    let mut handoff = handoff_rx;

    let (host, routing) = tokio::select! {
        biased;

        built = &mut construction => {
            let host = built?;
            let routing = handoff.await.map_err(|_| BootstrapError::RoutingHandoffDropped)?;
            (host, routing)
        }
        received = &mut handoff => match received {
            Ok(routing) => (construction.await?, routing),
            Err(_) => {
                // Constructor gave up without a handle. Its error is the
                // useful one.
                construction.await?;
                return Err(BootstrapError::RoutingHandoffDropped);
            }
        },
    };

    Ok(Assembled {
        peer_id,
        host: host.handle,
        driver: host.task,
        routing,
        peerstore,
        filter,
        rendezvous,
        span,
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
