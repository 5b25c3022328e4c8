//! # Routing Handle
//!
//! The dual DHT lives inside the swarm, and the swarm lives inside one
//! spawned task. Everyone else talks to it through a [`RoutingHandle`]:
//! a cloneable sender of [`RoutingCommand`]s, each carrying a `oneshot`
//! responder the swarm task answers once the query finishes.
//!
//! ```text
//!  RoutingHandle ──mpsc──▶ swarm task ──▶ lan.kad / wan.kad
//!        ▲                     │
//!        └──────oneshot────────┘   (after both tiers report back)
//! ```
//!
//! Lookups fan out to both tiers and the answers are merged. Writes
//! (`put_record`) go to the WAN tier only: LAN records are whatever the
//! local network tells us, we don't publish into it.

use std::collections::{HashMap, HashSet};
use std::hash::Hash;
use std::sync::Arc;

use libp2p::kad::RecordKey;
use libp2p::{Multiaddr, PeerId};
use tokio::sync::{mpsc, oneshot};

use super::validator::{RecordValidator, ValidationError, Validator, ValidatorSnapshot};

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Which half of the dual DHT.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Tier {
    Lan,
    Wan,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RoutingError {
    #[error("the node's swarm task has stopped")]
    NodeStopped,

    #[error("no known peers in either routing table")]
    NoKnownPeers,

    #[error("record not found")]
    NotFound,

    #[error("record rejected: {0}")]
    Invalid(#[from] ValidationError),

    #[error("local record store: {0}")]
    Store(String),

    #[error("dht query failed: {0}")]
    Query(String),
}

/// Routing table sizes, per tier.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RoutingTableSize {
    pub lan: usize,
    pub wan: usize,
}

impl RoutingTableSize {
    pub fn total(&self) -> usize {
        self.lan + self.wan
    }
}

pub(crate) type Responder<T> = oneshot::Sender<Result<T, RoutingError>>;

/// Requests understood by the swarm task.
#[derive(Debug)]
pub(crate) enum RoutingCommand {
    Bootstrap {
        respond: Responder<()>,
    },
    AddAddress {
        peer: PeerId,
        addr: Multiaddr,
        respond: oneshot::Sender<Tier>,
    },
    ClosestPeers {
        peer: PeerId,
        respond: Responder<Vec<PeerId>>,
    },
    Provide {
        key: RecordKey,
        respond: Responder<()>,
    },
    Providers {
        key: RecordKey,
        respond: Responder<HashSet<PeerId>>,
    },
    PutRecord {
        key: RecordKey,
        value: Vec<u8>,
        respond: Responder<()>,
    },
    GetRecord {
        key: RecordKey,
        respond: Responder<Vec<u8>>,
    },
    TableSize {
        respond: oneshot::Sender<RoutingTableSize>,
    },
}

// ---------------------------------------------------------------------------
// RoutingHandle
// ---------------------------------------------------------------------------

/// Command handle to the node's dual DHT.
///
/// Created once, inside the routing constructor, and valid for as long as
/// the node runs. After shutdown every call fails with
/// [`RoutingError::NodeStopped`].
#[derive(Clone)]
pub struct RoutingHandle {
    commands: mpsc::Sender<RoutingCommand>,
    validator: Arc<RecordValidator>,
}

impl RoutingHandle {
    pub(crate) fn new(commands: mpsc::Sender<RoutingCommand>, validator: Arc<RecordValidator>) -> Self {
        Self {
            commands,
            validator,
        }
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(Responder<T>) -> RoutingCommand,
    ) -> Result<T, RoutingError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(make(tx))
            .await
            .map_err(|_| RoutingError::NodeStopped)?;
        rx.await.map_err(|_| RoutingError::NodeStopped)?
    }

    /// Re-runs the bootstrap query on every tier that knows at least one
    /// peer. Fails with `NoKnownPeers` if neither does.
    pub async fn bootstrap(&self) -> Result<(), RoutingError> {
        self.request(|respond| RoutingCommand::Bootstrap { respond })
            .await
    }

    /// Adds an address for `peer`. Private addresses land in the LAN tier,
    /// everything else in the WAN tier; the chosen tier is returned.
    pub async fn add_address(&self, peer: PeerId, addr: Multiaddr) -> Result<Tier, RoutingError> {
        let (respond, rx) = oneshot::channel();
        self.commands
            .send(RoutingCommand::AddAddress {
                peer,
                addr,
                respond,
            })
            .await
            .map_err(|_| RoutingError::NodeStopped)?;
        rx.await.map_err(|_| RoutingError::NodeStopped)
    }

    /// Peers closest to `peer`, merged across both tiers.
    pub async fn closest_peers(&self, peer: PeerId) -> Result<Vec<PeerId>, RoutingError> {
        self.request(|respond| RoutingCommand::ClosestPeers { peer, respond })
            .await
    }

    /// Announces this node as a provider of `key`.
    pub async fn provide(&self, key: &[u8]) -> Result<(), RoutingError> {
        let key = RecordKey::new(&key);
        self.request(|respond| RoutingCommand::Provide { key, respond })
            .await
    }

    /// Providers of `key` known to either tier.
    pub async fn providers(&self, key: &[u8]) -> Result<HashSet<PeerId>, RoutingError> {
        let key = RecordKey::new(&key);
        self.request(|respond| RoutingCommand::Providers { key, respond })
            .await
    }

    /// Publishes a record to the WAN tier. Validated locally first, so a
    /// record the network would reject never leaves this node.
    pub async fn put_record(&self, key: &[u8], value: Vec<u8>) -> Result<(), RoutingError> {
        self.validator.validate(key, &value)?;
        let key = RecordKey::new(&key);
        self.request(|respond| RoutingCommand::PutRecord {
            key,
            value,
            respond,
        })
        .await
    }

    /// Looks a record up in both tiers and returns the best valid candidate.
    pub async fn get_record(&self, key: &[u8]) -> Result<Vec<u8>, RoutingError> {
        let key = RecordKey::new(&key);
        self.request(|respond| RoutingCommand::GetRecord { key, respond })
            .await
    }

    pub async fn routing_table_size(&self) -> Result<RoutingTableSize, RoutingError> {
        let (respond, rx) = oneshot::channel();
        self.commands
            .send(RoutingCommand::TableSize { respond })
            .await
            .map_err(|_| RoutingError::NodeStopped)?;
        rx.await.map_err(|_| RoutingError::NodeStopped)
    }

    /// Validation counters, for metrics.
    pub fn validator_stats(&self) -> ValidatorSnapshot {
        self.validator.stats()
    }

    pub fn is_stopped(&self) -> bool {
        self.commands.is_closed()
    }
}

impl std::fmt::Debug for RoutingHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoutingHandle")
            .field("stopped", &self.commands.is_closed())
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Pending Query Bookkeeping
// ---------------------------------------------------------------------------

/// What a tier reported for one step of a query.
#[derive(Debug)]
pub(crate) enum Progress {
    Peers(Vec<PeerId>),
    Providers(HashSet<PeerId>),
    Record(Vec<u8>),
    Done,
    Failed(String),
}

/// Accumulated state of one caller request, across tiers.
#[derive(Debug)]
pub(crate) enum Pending {
    /// Bootstrap, provide, put: succeeds if any tier succeeds.
    Ack {
        succeeded: bool,
        error: Option<String>,
        respond: Responder<()>,
    },
    ClosestPeers {
        peers: Vec<PeerId>,
        respond: Responder<Vec<PeerId>>,
    },
    Providers {
        providers: HashSet<PeerId>,
        respond: Responder<HashSet<PeerId>>,
    },
    GetRecord {
        key: Vec<u8>,
        candidates: Vec<Vec<u8>>,
        respond: Responder<Vec<u8>>,
    },
}

impl Pending {
    pub(crate) fn ack(respond: Responder<()>) -> Self {
        Pending::Ack {
            succeeded: false,
            error: None,
            respond,
        }
    }

    fn absorb(&mut self, progress: Progress) {
        match (self, progress) {
            (Pending::Ack { succeeded, .. }, Progress::Done) => *succeeded = true,
            (Pending::Ack { error, .. }, Progress::Failed(e)) => *error = Some(e),
            (Pending::ClosestPeers { peers, .. }, Progress::Peers(found)) => {
                for peer in found {
                    if !peers.contains(&peer) {
                        peers.push(peer);
                    }
                }
            }
            (Pending::Providers { providers, .. }, Progress::Providers(found)) => {
                providers.extend(found)
            }
            (Pending::GetRecord { candidates, .. }, Progress::Record(value)) => {
                if !candidates.contains(&value) {
                    candidates.push(value);
                }
            }
            // Lookups tolerate per-tier failures; the merged answer is
            // whatever the other tier found.
            _ => {}
        }
    }

    /// Answers the caller.
    fn finish(self, validator: &dyn Validator) {
        match self {
            Pending::Ack {
                succeeded,
                error,
                respond,
            } => {
                let result = if succeeded {
                    Ok(())
                } else {
                    Err(RoutingError::Query(
                        error.unwrap_or_else(|| "no tier completed the query".into()),
                    ))
                };
                let _ = respond.send(result);
            }
            Pending::ClosestPeers { peers, respond } => {
                let _ = respond.send(Ok(peers));
            }
            Pending::Providers { providers, respond } => {
                let _ = respond.send(Ok(providers));
            }
            Pending::GetRecord {
                key,
                candidates,
                respond,
            } => {
                let _ = respond.send(best_record(validator, &key, candidates));
            }
        }
    }

    /// Answers the caller with an error without waiting for any tier.
    pub(crate) fn fail(self, error: RoutingError) {
        match self {
            Pending::Ack { respond, .. } => {
                let _ = respond.send(Err(error));
            }
            Pending::ClosestPeers { respond, .. } => {
                let _ = respond.send(Err(error));
            }
            Pending::Providers { respond, .. } => {
                let _ = respond.send(Err(error));
            }
            Pending::GetRecord { respond, .. } => {
                let _ = respond.send(Err(error));
            }
        }
    }
}

/// Validates every candidate and lets the validator pick among survivors.
fn best_record(
    validator: &dyn Validator,
    key: &[u8],
    candidates: Vec<Vec<u8>>,
) -> Result<Vec<u8>, RoutingError> {
    if candidates.is_empty() {
        return Err(RoutingError::NotFound);
    }

    let mut last_rejection = None;
    let mut valid = Vec::with_capacity(candidates.len());
    for value in candidates {
        match validator.validate(key, &value) {
            Ok(()) => valid.push(value),
            Err(e) => last_rejection = Some(e),
        }
    }

    if valid.is_empty() {
        return Err(last_rejection
            .map(RoutingError::Invalid)
            .unwrap_or(RoutingError::NotFound));
    }

    let index = validator.select(key, &valid)?;
    valid
        .into_iter()
        .nth(index)
        .ok_or(RoutingError::Invalid(ValidationError::NoCandidates))
}

struct Request {
    outstanding: usize,
    pending: Pending,
}

/// Maps in-flight kad queries (one per tier) back to caller requests.
///
/// Generic over the query id so the merge logic can be tested without a
/// running swarm.
pub(crate) struct PendingQueries<Q> {
    next_request: u64,
    by_query: HashMap<(Tier, Q), u64>,
    requests: HashMap<u64, Request>,
}

impl<Q: Copy + Eq + Hash> PendingQueries<Q> {
    pub(crate) fn new() -> Self {
        Self {
            next_request: 0,
            by_query: HashMap::new(),
            requests: HashMap::new(),
        }
    }

    /// Registers a request waiting on `queries`. With no queries at all
    /// the caller is told `NoKnownPeers` straight away.
    pub(crate) fn register(&mut self, queries: Vec<(Tier, Q)>, pending: Pending) {
        if queries.is_empty() {
            pending.fail(RoutingError::NoKnownPeers);
            return;
        }

        let request = self.next_request;
        self.next_request += 1;
        for query in &queries {
            self.by_query.insert(*query, request);
        }
        self.requests.insert(
            request,
            Request {
                outstanding: queries.len(),
                pending,
            },
        );
    }

    /// Feeds one query step. Returns `false` for queries we didn't start
    /// (kad's own periodic republishing, for instance).
    pub(crate) fn progress(
        &mut self,
        tier: Tier,
        query: Q,
        progress: Progress,
        last: bool,
        validator: &dyn Validator,
    ) -> bool {
        let Some(&request) = self.by_query.get(&(tier, query)) else {
            return false;
        };
        let Some(entry) = self.requests.get_mut(&request) else {
            return false;
        };

        entry.pending.absorb(progress);
        if !last {
            return true;
        }

        self.by_query.remove(&(tier, query));
        entry.outstanding -= 1;
        if entry.outstanding == 0 {
            if let Some(done) = self.requests.remove(&request) {
                done.pending.finish(validator);
            }
        }
        true
    }

    pub(crate) fn len(&self) -> usize {
        self.requests.len()
    }

    /// Fails everything still in flight. Used on shutdown.
    pub(crate) fn drain(&mut self, error: RoutingError) {
        self.by_query.clear();
        for (_, request) in self.requests.drain() {
            request.pending.fail(error.clone());
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use libp2p::identity::Keypair;

    fn validator() -> RecordValidator {
        RecordValidator::standard(tracing::Span::none())
    }

    fn pk_record(keypair: &Keypair) -> (Vec<u8>, Vec<u8>) {
        let mut key = b"/pk/".to_vec();
        key.extend_from_slice(&keypair.public().to_peer_id().to_bytes());
        (key, keypair.public().encode_protobuf())
    }

    #[test]
    fn ack_succeeds_if_any_tier_succeeds() {
        let v = validator();
        let mut pending = PendingQueries::<u32>::new();
        let (tx, mut rx) = oneshot::channel();
        pending.register(vec![(Tier::Lan, 1), (Tier::Wan, 2)], Pending::ack(tx));

        assert!(pending.progress(Tier::Lan, 1, Progress::Failed("timeout".into()), true, &v));
        assert!(rx.try_recv().is_err(), "still waiting on the wan tier");

        assert!(pending.progress(Tier::Wan, 2, Progress::Done, true, &v));
        assert_eq!(rx.try_recv().unwrap(), Ok(()));
        assert_eq!(pending.len(), 0);
    }

    #[test]
    fn ack_reports_last_error_when_every_tier_fails() {
        let v = validator();
        let mut pending = PendingQueries::<u32>::new();
        let (tx, mut rx) = oneshot::channel();
        pending.register(vec![(Tier::Wan, 9)], Pending::ack(tx));

        pending.progress(Tier::Wan, 9, Progress::Failed("quorum failed".into()), true, &v);
        assert_eq!(
            rx.try_recv().unwrap(),
            Err(RoutingError::Query("quorum failed".into()))
        );
    }

    #[test]
    fn no_queries_means_no_known_peers() {
        let mut pending = PendingQueries::<u32>::new();
        let (tx, mut rx) = oneshot::channel();
        pending.register(Vec::new(), Pending::ack(tx));

        assert_eq!(rx.try_recv().unwrap(), Err(RoutingError::NoKnownPeers));
        assert_eq!(pending.len(), 0);
    }

    #[test]
    fn closest_peers_are_merged_and_deduplicated() {
        let v = validator();
        let mut pending = PendingQueries::<u32>::new();
        let (tx, mut rx) = oneshot::channel();
        pending.register(
            vec![(Tier::Lan, 1), (Tier::Wan, 1)],
            Pending::ClosestPeers {
                peers: Vec::new(),
                respond: tx,
            },
        );

        let (a, b, c) = (PeerId::random(), PeerId::random(), PeerId::random());
        pending.progress(Tier::Lan, 1, Progress::Peers(vec![a, b]), true, &v);
        pending.progress(Tier::Wan, 1, Progress::Peers(vec![b, c]), true, &v);

        assert_eq!(rx.try_recv().unwrap(), Ok(vec![a, b, c]));
    }

    #[test]
    fn intermediate_steps_do_not_finish_the_request() {
        let v = validator();
        let mut pending = PendingQueries::<u32>::new();
        let (tx, mut rx) = oneshot::channel();
        pending.register(
            vec![(Tier::Wan, 4)],
            Pending::Providers {
                providers: HashSet::new(),
                respond: tx,
            },
        );

        let (a, b) = (PeerId::random(), PeerId::random());
        pending.progress(Tier::Wan, 4, Progress::Providers([a].into()), false, &v);
        assert!(rx.try_recv().is_err());
        pending.progress(Tier::Wan, 4, Progress::Providers([b].into()), true, &v);

        assert_eq!(rx.try_recv().unwrap(), Ok([a, b].into()));
    }

    #[test]
    fn get_record_picks_a_valid_candidate() {
        let v = validator();
        let keypair = Keypair::generate_ed25519();
        let (key, value) = pk_record(&keypair);

        let mut pending = PendingQueries::<u32>::new();
        let (tx, mut rx) = oneshot::channel();
        pending.register(
            vec![(Tier::Lan, 1), (Tier::Wan, 2)],
            Pending::GetRecord {
                key,
                candidates: Vec::new(),
                respond: tx,
            },
        );

        // LAN hands us garbage, WAN hands us the real key.
        pending.progress(Tier::Lan, 1, Progress::Record(b"forged".to_vec()), true, &v);
        pending.progress(Tier::Wan, 2, Progress::Record(value.clone()), true, &v);

        assert_eq!(rx.try_recv().unwrap(), Ok(value));
    }

    #[test]
    fn get_record_with_only_invalid_candidates_is_rejected() {
        let v = validator();
        let keypair = Keypair::generate_ed25519();
        let (key, _) = pk_record(&keypair);

        let mut pending = PendingQueries::<u32>::new();
        let (tx, mut rx) = oneshot::channel();
        pending.register(
            vec![(Tier::Wan, 1)],
            Pending::GetRecord {
                key,
                candidates: Vec::new(),
                respond: tx,
            },
        );
        pending.progress(Tier::Wan, 1, Progress::Record(b"forged".to_vec()), true, &v);

        assert!(matches!(
            rx.try_recv().unwrap(),
            Err(RoutingError::Invalid(_))
        ));
    }

    #[test]
    fn get_record_with_nothing_found() {
        let v = validator();
        let mut pending = PendingQueries::<u32>::new();
        let (tx, mut rx) = oneshot::channel();
        pending.register(
            vec![(Tier::Wan, 1)],
            Pending::GetRecord {
                key: b"/pk/nobody".to_vec(),
                candidates: Vec::new(),
                respond: tx,
            },
        );
        pending.progress(Tier::Wan, 1, Progress::Failed("not found".into()), true, &v);

        assert_eq!(rx.try_recv().unwrap(), Err(RoutingError::NotFound));
    }

    #[test]
    fn unknown_queries_are_ignored() {
        let v = validator();
        let mut pending = PendingQueries::<u32>::new();
        assert!(!pending.progress(Tier::Wan, 42, Progress::Done, true, &v));
    }

    #[test]
    fn drain_fails_everything_in_flight() {
        let mut pending = PendingQueries::<u32>::new();
        let (tx, mut rx) = oneshot::channel();
        pending.register(vec![(Tier::Wan, 1)], Pending::ack(tx));

        pending.drain(RoutingError::NodeStopped);
        assert_eq!(rx.try_recv().unwrap(), Err(RoutingError::NodeStopped));
        assert_eq!(pending.len(), 0);
    }

    #[tokio::test]
    async fn handle_reports_stopped_node() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let handle = RoutingHandle::new(tx, Arc::new(validator()));

        assert!(handle.is_stopped());
        assert_eq!(handle.bootstrap().await, Err(RoutingError::NodeStopped));
        assert_eq!(
            handle.routing_table_size().await,
            Err(RoutingError::NodeStopped)
        );
    }

    #[tokio::test]
    async fn put_record_validates_before_sending() {
        let (tx, mut rx) = mpsc::channel(1);
        let handle = RoutingHandle::new(tx, Arc::new(validator()));

        let err = handle
            .put_record(b"/ipns/name", b"value".to_vec())
            .await
            .unwrap_err();
        assert_eq!(
            err,
            RoutingError::Invalid(ValidationError::UnknownNamespace("ipns".into()))
        );
        assert!(rx.try_recv().is_err(), "nothing reached the swarm task");
        assert_eq!(handle.validator_stats().validate_rejections, 1);
    }
}
