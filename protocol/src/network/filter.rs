//! # Address Filter
//!
//! A mutable set of IP-range rules enforced on every connection attempt,
//! inbound and outbound. The node creates it empty during bootstrap and
//! hands a clone to the caller, who can tighten it at runtime without
//! touching the swarm.
//!
//! ## Matching
//!
//! Rules are checked in insertion order and the **last** matching rule
//! wins. If nothing matches, the default action applies (`Accept` unless
//! someone changed it). Addresses without an IP component (`/dns/...`,
//! `/memory/...`) are never blocked. We have nothing to match them against.
//!
//! ```text
//! rules:   10.0.0.0/8 Deny,  10.1.0.0/16 Accept
//! 10.1.2.3 → Accept   (last match)
//! 10.2.0.1 → Deny
//! 8.8.8.8  → default
//! ```
//!
//! ## Enforcement
//!
//! [`FilterBehaviour`] is a zero-protocol `NetworkBehaviour` sitting in
//! front of everything else in the swarm. It denies connections in the
//! pending and established hooks, so a blocked peer never gets as far as a
//! stream negotiation.

use std::convert::Infallible;
use std::net::IpAddr;
use std::sync::Arc;
use std::task::{Context, Poll};

use ipnet::IpNet;
use libp2p::core::Endpoint;
use libp2p::multiaddr::Protocol;
use libp2p::swarm::{
    dummy, ConnectionDenied, ConnectionId, FromSwarm, NetworkBehaviour, THandler,
    THandlerInEvent, THandlerOutEvent, ToSwarm,
};
use libp2p::{Multiaddr, PeerId};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::debug;

// ---------------------------------------------------------------------------
// Rules
// ---------------------------------------------------------------------------

/// What to do with an address that matches a rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FilterAction {
    Accept,
    Deny,
}

/// One IP range and its verdict.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterRule {
    pub net: IpNet,
    pub action: FilterAction,
}

/// The plain (unshared) rule set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterSet {
    rules: Vec<FilterRule>,
    default_action: FilterAction,
}

impl Default for FilterSet {
    fn default() -> Self {
        Self {
            rules: Vec::new(),
            default_action: FilterAction::Accept,
        }
    }
}

impl FilterSet {
    /// Adds a rule. Re-adding an existing range updates its action in
    /// place rather than appending a duplicate.
    pub fn add(&mut self, net: IpNet, action: FilterAction) {
        match self.rules.iter_mut().find(|rule| rule.net == net) {
            Some(existing) => existing.action = action,
            None => self.rules.push(FilterRule { net, action }),
        }
    }

    /// Removes the rule for exactly `net`. Returns whether one existed.
    pub fn remove(&mut self, net: &IpNet) -> bool {
        let before = self.rules.len();
        self.rules.retain(|rule| rule.net != *net);
        self.rules.len() != before
    }

    pub fn set_default_action(&mut self, action: FilterAction) {
        self.default_action = action;
    }

    pub fn default_action(&self) -> FilterAction {
        self.default_action
    }

    pub fn rules(&self) -> &[FilterRule] {
        &self.rules
    }

    /// Verdict for a bare IP.
    pub fn action_for(&self, ip: IpAddr) -> FilterAction {
        self.rules
            .iter()
            .rev()
            .find(|rule| rule.net.contains(&ip))
            .map(|rule| rule.action)
            .unwrap_or(self.default_action)
    }

    /// Whether a multiaddr is blocked. Non-IP addresses never are.
    pub fn is_blocked(&self, addr: &Multiaddr) -> bool {
        match ip_of(addr) {
            Some(ip) => self.action_for(ip) == FilterAction::Deny,
            None => false,
        }
    }
}

/// First IP component of a multiaddr, if it has one.
fn ip_of(addr: &Multiaddr) -> Option<IpAddr> {
    addr.iter().find_map(|proto| match proto {
        Protocol::Ip4(ip) => Some(IpAddr::V4(ip)),
        Protocol::Ip6(ip) => Some(IpAddr::V6(ip)),
        _ => None,
    })
}

// ---------------------------------------------------------------------------
// Shared Handle
// ---------------------------------------------------------------------------

/// Shared, mutable address filter.
///
/// Every clone sees the same rules. The lock keeps concurrent mutation
/// memory-safe; if two callers race to add conflicting rules, whoever
/// writes last wins, same as with any other shared setting.
#[derive(Debug, Clone, Default)]
pub struct AddressFilter {
    inner: Arc<RwLock<FilterSet>>,
}

impl AddressFilter {
    /// An empty filter: no rules, default `Accept`.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_filter(&self, net: IpNet, action: FilterAction) {
        debug!(%net, ?action, "address filter rule added");
        self.inner.write().add(net, action);
    }

    pub fn remove_filter(&self, net: &IpNet) -> bool {
        self.inner.write().remove(net)
    }

    pub fn set_default_action(&self, action: FilterAction) {
        self.inner.write().set_default_action(action);
    }

    pub fn default_action(&self) -> FilterAction {
        self.inner.read().default_action()
    }

    /// Snapshot of the current rules, in match order.
    pub fn rules(&self) -> Vec<FilterRule> {
        self.inner.read().rules().to_vec()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().rules().is_empty()
    }

    pub fn is_blocked(&self, addr: &Multiaddr) -> bool {
        self.inner.read().is_blocked(addr)
    }
}

// ---------------------------------------------------------------------------
// Swarm Enforcement
// ---------------------------------------------------------------------------

/// Reason attached to a denied connection.
#[derive(Debug, thiserror::Error)]
#[error("address {0} is blocked by the address filter")]
pub struct AddressBlocked(pub Multiaddr);

/// Gatekeeper behaviour. Speaks no protocol, only says no.
pub struct FilterBehaviour {
    filter: AddressFilter,
}

impl FilterBehaviour {
    pub fn new(filter: AddressFilter) -> Self {
        Self { filter }
    }

    fn check(&self, addr: &Multiaddr) -> Result<(), ConnectionDenied> {
        if self.filter.is_blocked(addr) {
            debug!(%addr, "connection denied by address filter");
            return Err(ConnectionDenied::new(AddressBlocked(addr.clone())));
        }
        Ok(())
    }
}

impl NetworkBehaviour for FilterBehaviour {
    type ConnectionHandler = dummy::ConnectionHandler;
    type ToSwarm = Infallible;

    fn handle_pending_inbound_connection(
        &mut self,
        _connection_id: ConnectionId,
        _local_addr: &Multiaddr,
        remote_addr: &Multiaddr,
    ) -> Result<(), ConnectionDenied> {
        self.check(remote_addr)
    }

    fn handle_established_inbound_connection(
        &mut self,
        _connection_id: ConnectionId,
        _peer: PeerId,
        _local_addr: &Multiaddr,
        remote_addr: &Multiaddr,
    ) -> Result<THandler<Self>, ConnectionDenied> {
        self.check(remote_addr)?;
        Ok(dummy::ConnectionHandler)
    }

    fn handle_pending_outbound_connection(
        &mut self,
        _connection_id: ConnectionId,
        _maybe_peer: Option<PeerId>,
        addresses: &[Multiaddr],
        _effective_role: Endpoint,
    ) -> Result<Vec<Multiaddr>, ConnectionDenied> {
        // Only refuse up front when nothing is dialable; partially blocked
        // address sets are caught per-address once a connection lands.
        if let Some(first) = addresses.first() {
            if addresses.iter().all(|addr| self.filter.is_blocked(addr)) {
                return Err(ConnectionDenied::new(AddressBlocked(first.clone())));
            }
        }
        Ok(Vec::new())
    }

    fn handle_established_outbound_connection(
        &mut self,
        _connection_id: ConnectionId,
        _peer: PeerId,
        addr: &Multiaddr,
        _role_override: Endpoint,
    ) -> Result<THandler<Self>, ConnectionDenied> {
        self.check(addr)?;
        Ok(dummy::ConnectionHandler)
    }

    fn on_swarm_event(&mut self, _event: FromSwarm) {}

    fn on_connection_handler_event(
        &mut self,
        _peer_id: PeerId,
        _connection_id: ConnectionId,
        _event: THandlerOutEvent<Self>,
    ) {
    }

    fn poll(&mut self, _cx: &mut Context<'_>) -> Poll<ToSwarm<Self::ToSwarm, THandlerInEvent<Self>>> {
        Poll::Pending
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
