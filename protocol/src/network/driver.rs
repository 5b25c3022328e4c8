//! # Swarm Driver
//!
//! The one task that owns the swarm. Everything else (host handle, routing
//! handle, the connection manager's trim timer, the WAN refresh timer)
//! reaches it through this loop:
//!
//! ```text
//! loop select {
//!   swarm event        → bookkeeping, identify → peerstore/DHT, kad → queries
//!   host command       → dial / list / disconnect / shutdown
//!   routing command    → start kad queries on one or both tiers
//!   trim tick          → close connections above the high watermark
//!   refresh tick       → re-bootstrap the WAN tier
//! }
//! ```
//!
//! Nothing in here blocks. sled writes are fast enough to do inline, and
//! kad queries are started here but answered later, from swarm events.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use futures::StreamExt;
use libp2p::kad::store::RecordStore;
use libp2p::kad::{self, QueryId, QueryResult};
use libp2p::swarm::dial_opts::DialOpts;
use libp2p::swarm::{ConnectionId, SwarmEvent};
use libp2p::{identify, upnp, Multiaddr, PeerId, Swarm};
use parking_lot::RwLock;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval_at, Instant as TokioInstant};
use tracing::{debug, info, warn};

use super::connmgr::ConnManager;
use super::dual::{DualDhtEvent, LAN_RECORDS_TREE, WAN_RECORDS_TREE};
use super::host::{ConnectError, HostCommand, NodeBehaviour, NodeBehaviourEvent};
use super::routing::{
    Pending, PendingQueries, Progress, RoutingCommand, RoutingError, RoutingTableSize, Tier,
};
use super::validator::{RecordValidator, Validator};
use crate::config;
use crate::storage::PeerStore;

const TIERS: [Tier; 2] = [Tier::Lan, Tier::Wan];

pub(crate) struct SwarmDriver {
    swarm: Swarm<NodeBehaviour>,
    host_commands: mpsc::Receiver<HostCommand>,
    routing_commands: mpsc::Receiver<RoutingCommand>,
    connections: ConnManager,
    queries: PendingQueries<QueryId>,
    dials: HashMap<ConnectionId, oneshot::Sender<Result<PeerId, ConnectError>>>,
    validator: Arc<RecordValidator>,
    peerstore: PeerStore,
    listening: Arc<RwLock<Vec<Multiaddr>>>,
}

impl SwarmDriver {
    pub(crate) fn new(
        swarm: Swarm<NodeBehaviour>,
        host_commands: mpsc::Receiver<HostCommand>,
        routing_commands: mpsc::Receiver<RoutingCommand>,
        connections: ConnManager,
        validator: Arc<RecordValidator>,
        peerstore: PeerStore,
        listening: Arc<RwLock<Vec<Multiaddr>>>,
    ) -> Self {
        Self {
            swarm,
            host_commands,
            routing_commands,
            connections,
            queries: PendingQueries::new(),
            dials: HashMap::new(),
            validator,
            peerstore,
            listening,
        }
    }

    /// Runs until a shutdown command arrives or every host handle is gone.
    pub(crate) async fn run(mut self) {
        let start = TokioInstant::now();
        let mut trim = interval_at(start + config::CONN_TRIM_INTERVAL, config::CONN_TRIM_INTERVAL);
        let mut refresh =
            interval_at(start + config::DHT_REFRESH_INTERVAL, config::DHT_REFRESH_INTERVAL);

        loop {
            tokio::select! {
                event = self.swarm.select_next_some() => self.on_swarm_event(event),
                command = self.host_commands.recv() => match command {
                    Some(HostCommand::Shutdown) | None => break,
                    Some(command) => self.on_host_command(command),
                },
                Some(command) = self.routing_commands.recv() => self.on_routing_command(command),
                _ = trim.tick() => self.trim_connections(),
                _ = refresh.tick() => self.refresh_wan(),
            }
        }

        self.queries.drain(RoutingError::NodeStopped);
        for (_, respond) in self.dials.drain() {
            let _ = respond.send(Err(ConnectError::NodeStopped));
        }
        if let Err(e) = self.peerstore.flush() {
            warn!(error = %e, "peerstore flush on shutdown failed");
        }
        info!(
            connections = self.connections.len(),
            "swarm task stopped"
        );
    }

    // -----------------------------------------------------------------------
    // Swarm Events
    // -----------------------------------------------------------------------

    fn on_swarm_event(&mut self, event: SwarmEvent<NodeBehaviourEvent>) {
        match event {
            SwarmEvent::Behaviour(NodeBehaviourEvent::Filter(never)) => match never {},
            SwarmEvent::Behaviour(NodeBehaviourEvent::Identify(event)) => self.on_identify(event),
            SwarmEvent::Behaviour(NodeBehaviourEvent::Nat(event)) => on_nat(event),
            SwarmEvent::Behaviour(NodeBehaviourEvent::Dht(DualDhtEvent::Lan(event))) => {
                self.on_kad(Tier::Lan, event)
            }
            SwarmEvent::Behaviour(NodeBehaviourEvent::Dht(DualDhtEvent::Wan(event))) => {
                self.on_kad(Tier::Wan, event)
            }
            SwarmEvent::NewListenAddr { address, .. } => {
                info!(%address, "listening");
                let mut listening = self.listening.write();
                if !listening.contains(&address) {
                    listening.push(address);
                }
            }
            SwarmEvent::ExpiredListenAddr { address, .. } => {
                debug!(%address, "listen address expired");
                self.listening.write().retain(|a| *a != address);
            }
            SwarmEvent::ConnectionEstablished {
                peer_id,
                connection_id,
                endpoint,
                ..
            } => {
                self.connections.track(connection_id, peer_id, Instant::now());
                if endpoint.is_dialer() {
                    let addr = endpoint.get_remote_address().clone();
                    if let Err(e) = self.peerstore.add_addrs(&peer_id, &[addr]) {
                        warn!(%peer_id, error = %e, "peerstore write failed");
                    }
                }
                if let Some(respond) = self.dials.remove(&connection_id) {
                    let _ = respond.send(Ok(peer_id));
                }
                debug!(%peer_id, connections = self.connections.len(), "connection established");
            }
            SwarmEvent::ConnectionClosed {
                peer_id,
                connection_id,
                cause,
                ..
            } => {
                self.connections.untrack(&connection_id);
                debug!(%peer_id, cause = ?cause, "connection closed");
            }
            SwarmEvent::OutgoingConnectionError {
                connection_id,
                peer_id,
                error,
            } => {
                debug!(peer = ?peer_id, error = %error, "outgoing connection failed");
                if let Some(respond) = self.dials.remove(&connection_id) {
                    let _ = respond.send(Err(ConnectError::Dial(error.to_string())));
                }
            }
            SwarmEvent::IncomingConnectionError {
                send_back_addr,
                error,
                ..
            } => {
                debug!(remote = %send_back_addr, error = %error, "incoming connection failed");
            }
            SwarmEvent::ExternalAddrConfirmed { address } => {
                info!(%address, "external address confirmed");
            }
            _ => {}
        }
    }

    fn on_identify(&mut self, event: identify::Event) {
        let identify::Event::Received { peer_id, info, .. } = event else {
            return;
        };

        if let Err(e) = self.peerstore.add_addrs(&peer_id, &info.listen_addrs) {
            warn!(%peer_id, error = %e, "peerstore write failed");
        }
        for (name, value) in [
            ("agent_version", &info.agent_version),
            ("protocol_version", &info.protocol_version),
        ] {
            if let Err(e) = self.peerstore.put_metadata(&peer_id, name, value.as_bytes()) {
                warn!(%peer_id, error = %e, "peerstore metadata write failed");
            }
        }

        if info.protocol_version != config::IDENTIFY_PROTOCOL_VERSION {
            debug!(
                %peer_id,
                protocol = %info.protocol_version,
                "peer speaks a different protocol version, keeping it out of the dht"
            );
            return;
        }

        let dht = &mut self.swarm.behaviour_mut().dht;
        for addr in info.listen_addrs {
            let tier = dht.add_address(&peer_id, addr);
            debug!(%peer_id, ?tier, "address added from identify");
        }
        debug!(%peer_id, agent = %info.agent_version, "peer identified");
    }

    fn on_kad(&mut self, tier: Tier, event: kad::Event) {
        match event {
            kad::Event::InboundRequest { request } => self.on_inbound_request(tier, request),
            kad::Event::OutboundQueryProgressed {
                id, result, step, ..
            } => {
                let progress = progress_of(result);
                self.queries
                    .progress(tier, id, progress, step.last, self.validator.as_ref());
            }
            kad::Event::RoutingUpdated {
                peer, is_new_peer, ..
            } => {
                if is_new_peer {
                    debug!(%peer, ?tier, "routing table updated");
                }
            }
            kad::Event::ModeChanged { new_mode } => {
                info!(?tier, mode = %new_mode, "dht mode changed");
            }
            _ => {}
        }
    }

    /// With `StoreInserts::FilterBoth`, kad hands inbound writes to us
    /// instead of storing them. Validate, then store.
    fn on_inbound_request(&mut self, tier: Tier, request: kad::InboundRequest) {
        let store_tree = match tier {
            Tier::Lan => LAN_RECORDS_TREE,
            Tier::Wan => WAN_RECORDS_TREE,
        };

        match request {
            kad::InboundRequest::PutRecord {
                source,
                record: Some(record),
                ..
            } => {
                if let Err(e) = self.validator.validate(&record.key.to_vec(), &record.value) {
                    debug!(%source, ?tier, error = %e, "inbound record rejected");
                    return;
                }
                let store = self.swarm.behaviour_mut().dht.tier_mut(tier).store_mut();
                if let Err(e) = store.put(record) {
                    warn!(%source, tree = store_tree, error = %e, "inbound record not stored");
                }
            }
            kad::InboundRequest::AddProvider {
                record: Some(record),
            } => {
                let store = self.swarm.behaviour_mut().dht.tier_mut(tier).store_mut();
                if let Err(e) = store.add_provider(record) {
                    debug!(?tier, error = %e, "provider record not stored");
                }
            }
            _ => {}
        }
    }

    // -----------------------------------------------------------------------
    // Commands
    // -----------------------------------------------------------------------

    fn on_host_command(&mut self, command: HostCommand) {
        match command {
            HostCommand::Connect { addr, respond } => {
                let opts = DialOpts::unknown_peer_id().address(addr.clone()).build();
                let connection_id = opts.connection_id();
                match self.swarm.dial(opts) {
                    Ok(()) => {
                        self.dials.insert(connection_id, respond);
                    }
                    Err(e) => {
                        debug!(%addr, error = %e, "dial refused");
                        let _ = respond.send(Err(ConnectError::Dial(e.to_string())));
                    }
                }
            }
            HostCommand::ConnectedPeers { respond } => {
                let _ = respond.send(self.swarm.connected_peers().copied().collect());
            }
            HostCommand::Disconnect { peer, respond } => {
                let _ = respond.send(self.swarm.disconnect_peer_id(peer).is_ok());
            }
            // Handled by the run loop.
            HostCommand::Shutdown => {}
        }
    }

    fn on_routing_command(&mut self, command: RoutingCommand) {
        let dht = &mut self.swarm.behaviour_mut().dht;

        match command {
            RoutingCommand::Bootstrap { respond } => {
                let queries = TIERS
                    .into_iter()
                    .filter_map(|tier| dht.tier_mut(tier).bootstrap().ok().map(|id| (tier, id)))
                    .collect();
                self.queries.register(queries, Pending::ack(respond));
            }
            RoutingCommand::AddAddress {
                peer,
                addr,
                respond,
            } => {
                let _ = respond.send(dht.add_address(&peer, addr));
            }
            RoutingCommand::ClosestPeers { peer, respond } => {
                let queries = TIERS
                    .into_iter()
                    .map(|tier| (tier, dht.tier_mut(tier).get_closest_peers(peer)))
                    .collect();
                self.queries.register(
                    queries,
                    Pending::ClosestPeers {
                        peers: Vec::new(),
                        respond,
                    },
                );
            }
            RoutingCommand::Provide { key, respond } => {
                let mut queries = Vec::new();
                let mut store_error = None;
                for tier in TIERS {
                    match dht.tier_mut(tier).start_providing(key.clone()) {
                        Ok(id) => queries.push((tier, id)),
                        Err(e) => store_error = Some(e.to_string()),
                    }
                }
                match store_error {
                    Some(e) if queries.is_empty() => {
                        let _ = respond.send(Err(RoutingError::Store(e)));
                    }
                    _ => self.queries.register(queries, Pending::ack(respond)),
                }
            }
            RoutingCommand::Providers { key, respond } => {
                let queries = TIERS
                    .into_iter()
                    .map(|tier| (tier, dht.tier_mut(tier).get_providers(key.clone())))
                    .collect();
                self.queries.register(
                    queries,
                    Pending::Providers {
                        providers: Default::default(),
                        respond,
                    },
                );
            }
            RoutingCommand::PutRecord {
                key,
                value,
                respond,
            } => {
                let record = kad::Record::new(key, value);
                match dht.wan.put_record(record, kad::Quorum::One) {
                    Ok(id) => self
                        .queries
                        .register(vec![(Tier::Wan, id)], Pending::ack(respond)),
                    Err(e) => {
                        let _ = respond.send(Err(RoutingError::Store(e.to_string())));
                    }
                }
            }
            RoutingCommand::GetRecord { key, respond } => {
                let queries = TIERS
                    .into_iter()
                    .map(|tier| (tier, dht.tier_mut(tier).get_record(key.clone())))
                    .collect();
                self.queries.register(
                    queries,
                    Pending::GetRecord {
                        key: key.to_vec(),
                        candidates: Vec::new(),
                        respond,
                    },
                );
            }
            RoutingCommand::TableSize { respond } => {
                let _ = respond.send(RoutingTableSize {
                    lan: table_size(&mut dht.lan),
                    wan: table_size(&mut dht.wan),
                });
            }
        }
    }

    // -----------------------------------------------------------------------
    // Timers
    // -----------------------------------------------------------------------

    fn trim_connections(&mut self) {
        let victims = self.connections.trim_candidates(Instant::now());
        if victims.is_empty() {
            return;
        }
        info!(
            connections = self.connections.len(),
            closing = victims.len(),
            "above high watermark, trimming connections"
        );
        for id in victims {
            self.swarm.close_connection(id);
        }
    }

    fn refresh_wan(&mut self) {
        let wan = &mut self.swarm.behaviour_mut().dht.wan;
        if table_size(wan) == 0 {
            return;
        }
        match wan.bootstrap() {
            Ok(_) => debug!("wan routing table refresh started"),
            Err(e) => debug!(error = %e, "wan refresh skipped"),
        }
    }
}

fn table_size<S: RecordStore + Send + 'static>(dht: &mut kad::Behaviour<S>) -> usize {
    dht.kbuckets().map(|bucket| bucket.num_entries()).sum()
}

fn progress_of(result: QueryResult) -> Progress {
    match result {
        QueryResult::Bootstrap(Ok(_)) => Progress::Done,
        QueryResult::Bootstrap(Err(e)) => Progress::Failed(e.to_string()),

        QueryResult::GetClosestPeers(Ok(ok)) => Progress::Peers(ok.peers),
        // A timed-out lookup still tells us who it got to.
        QueryResult::GetClosestPeers(Err(kad::GetClosestPeersError::Timeout { peers, .. })) => {
            Progress::Peers(peers)
        }

        QueryResult::GetProviders(Ok(kad::GetProvidersOk::FoundProviders {
            providers, ..
        })) => Progress::Providers(providers),
        QueryResult::GetProviders(Ok(_)) => Progress::Done,
        QueryResult::GetProviders(Err(e)) => Progress::Failed(e.to_string()),

        QueryResult::GetRecord(Ok(kad::GetRecordOk::FoundRecord(found))) => {
            Progress::Record(found.record.value)
        }
        QueryResult::GetRecord(Ok(_)) => Progress::Done,
        QueryResult::GetRecord(Err(e)) => Progress::Failed(e.to_string()),

        QueryResult::StartProviding(Ok(_)) => Progress::Done,
        QueryResult::StartProviding(Err(e)) => Progress::Failed(e.to_string()),

        QueryResult::PutRecord(Ok(_)) => Progress::Done,
        QueryResult::PutRecord(Err(e)) => Progress::Failed(e.to_string()),

        // kad's own republishing; nobody is waiting on these.
        _ => Progress::Done,
    }
}

fn on_nat(event: upnp::Event) {
    match event {
        upnp::Event::NewExternalAddr(addr) => info!(%addr, "upnp port mapping established"),
        upnp::Event::ExpiredExternalAddr(addr) => info!(%addr, "upnp port mapping expired"),
        upnp::Event::GatewayNotFound => debug!("no upnp gateway found"),
        upnp::Event::NonRoutableGateway => warn!("upnp gateway is not publicly routable"),
        #[allow(unreachable_patterns)]
        _ => {}
    }
}
