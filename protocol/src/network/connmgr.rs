//! # Connection Manager
//!
//! Watermark-based connection trimming. Nothing fancy:
//!
//! - at or below `high_watermark` connections, leave everything alone;
//! - above it, close connections until we're back at `low_watermark`;
//! - never close a connection younger than `grace_period`.
//!
//! The manager itself is plain bookkeeping. It doesn't own the swarm; the
//! swarm task feeds it open/close notifications and periodically asks which
//! connections to drop. That keeps it trivially testable without a network.
//!
//! Among eligible connections the youngest go first. Long-lived connections
//! tend to be the ones holding our routing table together.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use libp2p::swarm::ConnectionId;
use libp2p::PeerId;
use serde::{Deserialize, Serialize};

use crate::config;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnManagerConfig {
    /// Trimming stops at this many connections.
    pub low_watermark: usize,
    /// Trimming starts above this many connections.
    pub high_watermark: usize,
    /// Connections younger than this are never trimmed.
    pub grace_period: Duration,
}

impl Default for ConnManagerConfig {
    fn default() -> Self {
        Self {
            low_watermark: config::CONN_LOW_WATERMARK,
            high_watermark: config::CONN_HIGH_WATERMARK,
            grace_period: config::CONN_GRACE_PERIOD,
        }
    }
}

impl ConnManagerConfig {
    /// Watermarks must be ordered, otherwise the trimmer would fight itself.
    pub fn validate(&self) -> Result<(), String> {
        if self.low_watermark >= self.high_watermark {
            return Err(format!(
                "connection manager low watermark ({}) must be below high watermark ({})",
                self.low_watermark, self.high_watermark
            ));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// ConnManager
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct TrackedConnection {
    peer: PeerId,
    opened: Instant,
}

#[derive(Debug)]
pub struct ConnManager {
    config: ConnManagerConfig,
    connections: HashMap<ConnectionId, TrackedConnection>,
}

impl ConnManager {
    pub fn new(config: ConnManagerConfig) -> Self {
        Self {
            config,
            connections: HashMap::new(),
        }
    }

    pub fn config(&self) -> &ConnManagerConfig {
        &self.config
    }

    pub fn track(&mut self, id: ConnectionId, peer: PeerId, opened: Instant) {
        self.connections.insert(id, TrackedConnection { peer, opened });
    }

    pub fn untrack(&mut self, id: &ConnectionId) {
        self.connections.remove(id);
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Peer on the other end of a tracked connection.
    pub fn peer_of(&self, id: &ConnectionId) -> Option<PeerId> {
        self.connections.get(id).map(|c| c.peer)
    }

    /// Connections to close right now, youngest eligible first.
    ///
    /// Empty unless we're above the high watermark. May return fewer than
    /// needed to reach the low watermark if too many connections are still
    /// inside their grace period.
    pub fn trim_candidates(&self, now: Instant) -> Vec<ConnectionId> {
        let count = self.connections.len();
        if count <= self.config.high_watermark {
            return Vec::new();
        }
        let excess = count - self.config.low_watermark;

        let mut eligible: Vec<(&ConnectionId, &TrackedConnection)> = self
            .connections
            .iter()
            .filter(|(_, c)| now.saturating_duration_since(c.opened) >= self.config.grace_period)
            .collect();
        eligible.sort_by(|a, b| b.1.opened.cmp(&a.1.opened));

        eligible.into_iter().take(excess).map(|(id, _)| *id).collect()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
