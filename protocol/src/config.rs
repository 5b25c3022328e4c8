//! # Protocol Configuration & Constants
//!
//! Every magic number in Gatenet lives here. If you're hardcoding a constant
//! somewhere else, you're doing it wrong and you owe the team coffee.
//!
//! Several of these values are part of the network's identity: change the
//! protocol prefix or the rendezvous version and your node silently derives
//! a different private network key, which means it can no longer talk to
//! anyone. Choose wisely, then leave them alone.

use std::time::Duration;

// ---------------------------------------------------------------------------
// Protocol Identity
// ---------------------------------------------------------------------------

/// Prefix shared by every protocol id this node speaks.
pub const PROTOCOL_PREFIX: &str = "gatenet";

/// Rendezvous version. Part of the private network key derivation, so a
/// bump here partitions the network. On purpose.
pub const RENDEZVOUS_VERSION: &str = "0.0.1";

/// Protocol version advertised through identify.
pub const IDENTIFY_PROTOCOL_VERSION: &str = "/gatenet/0.0.1";

/// User agent advertised through identify. Helps operators figure out who
/// is running what when they stare at peer lists at 3am.
pub const USER_AGENT: &str = concat!("gatenet/", env!("CARGO_PKG_VERSION"));

/// Kademlia protocol for the wide-area tier.
pub const WAN_KAD_PROTOCOL: &str = "/gatenet/kad/1.0.0";

/// Kademlia protocol for the local-network tier. Distinct from the WAN
/// protocol so the two tables never mix.
pub const LAN_KAD_PROTOCOL: &str = "/gatenet/lan/kad/1.0.0";

/// Builds a tier-specific Kademlia protocol name from a custom prefix.
pub fn kad_protocol(prefix: &str, lan: bool) -> String {
    if lan {
        format!("/{prefix}/lan/kad/1.0.0")
    } else {
        format!("/{prefix}/kad/1.0.0")
    }
}

// ---------------------------------------------------------------------------
// Storage
// ---------------------------------------------------------------------------

/// Directory (under the state dir) holding the peer address book.
pub const PEERSTORE_DIR: &str = "peerstore-v0";

/// Directory (under the state dir) holding DHT records.
pub const DHT_STORE_DIR: &str = "dht-v0";

/// Default sled page cache, per store. 64 MiB is plenty for an address book.
pub const DEFAULT_STORE_CACHE_BYTES: u64 = 64 * 1024 * 1024;

/// Default background flush interval. Writes younger than this can be lost
/// on a crash; `flush()` and `close()` are always durable.
pub const DEFAULT_FLUSH_EVERY_MS: u64 = 500;

// ---------------------------------------------------------------------------
// Connection Management
// ---------------------------------------------------------------------------

/// Low watermark. Trimming stops once we're back down to this many
/// connections.
pub const CONN_LOW_WATERMARK: usize = 25;

/// High watermark. Trimming kicks in above this many connections.
pub const CONN_HIGH_WATERMARK: usize = 250;

/// Grace period. Connections younger than this are never trimmed, so a
/// freshly dialed peer gets a chance to prove itself useful.
pub const CONN_GRACE_PERIOD: Duration = Duration::from_secs(30);

/// How often the swarm task checks the watermarks.
pub const CONN_TRIM_INTERVAL: Duration = Duration::from_secs(10);

/// Connections with no open streams are closed after this long. The
/// connection manager handles the busy ones.
pub const IDLE_CONNECTION_TIMEOUT: Duration = Duration::from_secs(60);

/// Transport upgrade timeout (pnet + noise + yamux negotiation).
pub const TRANSPORT_TIMEOUT: Duration = Duration::from_secs(20);

// ---------------------------------------------------------------------------
// Routing
// ---------------------------------------------------------------------------

/// How often the WAN tier re-runs its bootstrap query.
pub const DHT_REFRESH_INTERVAL: Duration = Duration::from_secs(300);

/// Per-query timeout for both DHT tiers.
pub const DHT_QUERY_TIMEOUT: Duration = Duration::from_secs(60);

/// Capacity of the command channels between handles and the swarm task.
pub const COMMAND_CHANNEL_CAPACITY: usize = 64;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn watermarks_are_ordered() {
        // If low >= high, the trimmer would oscillate forever.
        assert!(CONN_LOW_WATERMARK < CONN_HIGH_WATERMARK);
        assert!(CONN_TRIM_INTERVAL < CONN_GRACE_PERIOD);
    }

    #[test]
    fn kad_protocols_match_prefix_builder() {
        assert_eq!(kad_protocol(PROTOCOL_PREFIX, false), WAN_KAD_PROTOCOL);
        assert_eq!(kad_protocol(PROTOCOL_PREFIX, true), LAN_KAD_PROTOCOL);
        assert_ne!(WAN_KAD_PROTOCOL, LAN_KAD_PROTOCOL);
    }

    #[test]
    fn store_dirs_are_distinct() {
        assert_ne!(PEERSTORE_DIR, DHT_STORE_DIR);
    }

    #[test]
    fn user_agent_names_the_crate() {
        assert!(USER_AGENT.starts_with("gatenet/"));
    }
}
