//! # Peer Address Book
//!
//! Persistent mapping from `PeerId` to the addresses we know for it, plus a
//! small metadata side-table (agent version, protocol version — whatever
//! identify tells us).
//!
//! ## Tree Layout
//!
//! | Tree       | Key                               | Value                  |
//! |------------|-----------------------------------|------------------------|
//! | `addrs`    | `peer_id` bytes                   | `bincode(PeerRecord)`  |
//! | `metadata` | `peer_id` bytes ++ `0x00` ++ name | raw bytes              |
//!
//! Multiaddrs are stored in their binary encoding rather than as strings.
//! It's what the wire uses and it round-trips exactly.

use libp2p::{Multiaddr, PeerId};
use serde::{Deserialize, Serialize};
use sled::{Db, Tree};
use std::time::{SystemTime, UNIX_EPOCH};

use super::db::{DbError, DbResult};

// ---------------------------------------------------------------------------
// Peer Records
// ---------------------------------------------------------------------------

/// A peer plus the addresses it can be reached at.
///
/// Also the shape of bootstrap peer entries handed to the node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerAddrInfo {
    pub peer_id: PeerId,
    pub addrs: Vec<Multiaddr>,
}

impl PeerAddrInfo {
    pub fn new(peer_id: PeerId, addrs: Vec<Multiaddr>) -> Self {
        Self { peer_id, addrs }
    }

    /// Parses a `/…/p2p/<peer-id>` multiaddr into peer + transport address.
    ///
    /// Returns `None` if the address doesn't end in a `/p2p` component.
    pub fn from_p2p_multiaddr(addr: &Multiaddr) -> Option<Self> {
        let mut transport = addr.clone();
        match transport.pop() {
            Some(libp2p::multiaddr::Protocol::P2p(peer_id)) => Some(Self {
                peer_id,
                addrs: vec![transport],
            }),
            _ => None,
        }
    }
}

/// What we persist per peer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerRecord {
    /// Binary-encoded multiaddrs, deduplicated, in insertion order.
    pub addrs: Vec<Vec<u8>>,
    /// Last time anything about this peer was written (Unix ms).
    pub last_seen_ms: u64,
}

impl PeerRecord {
    /// Decodes the stored addresses, skipping anything that no longer parses.
    pub fn multiaddrs(&self) -> Vec<Multiaddr> {
        self.addrs
            .iter()
            .filter_map(|bytes| Multiaddr::try_from(bytes.clone()).ok())
            .collect()
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

// ---------------------------------------------------------------------------
// PeerStore
// ---------------------------------------------------------------------------

/// Persistent peer address book.
///
/// Cheap to clone; all clones share the same sled trees. sled handles the
/// concurrency, so no extra locking here.
#[derive(Debug, Clone)]
pub struct PeerStore {
    db: Db,
    addrs: Tree,
    metadata: Tree,
}

impl PeerStore {
    /// Layers the address book on top of an open peerstore database.
    pub fn new(db: Db) -> DbResult<Self> {
        let addrs = db.open_tree("addrs")?;
        let metadata = db.open_tree("metadata")?;
        Ok(Self {
            db,
            addrs,
            metadata,
        })
    }

    /// Retrieve the full record for a peer.
    pub fn get(&self, peer: &PeerId) -> DbResult<Option<PeerRecord>> {
        match self.addrs.get(peer.to_bytes())? {
            Some(bytes) => {
                let record: PeerRecord = bincode::deserialize(&bytes)
                    .map_err(|e| DbError::Serialization(e.to_string()))?;
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    /// Overwrite the record for a peer.
    pub fn put(&self, peer: &PeerId, record: &PeerRecord) -> DbResult<()> {
        let bytes =
            bincode::serialize(record).map_err(|e| DbError::Serialization(e.to_string()))?;
        self.addrs.insert(peer.to_bytes(), bytes)?;
        Ok(())
    }

    /// Known addresses for a peer. Empty if we've never heard of it.
    pub fn addrs(&self, peer: &PeerId) -> DbResult<Vec<Multiaddr>> {
        Ok(self
            .get(peer)?
            .map(|record| record.multiaddrs())
            .unwrap_or_default())
    }

    /// Merge new addresses into a peer's record. Duplicates are ignored.
    pub fn add_addrs(&self, peer: &PeerId, addrs: &[Multiaddr]) -> DbResult<()> {
        let mut record = self.get(peer)?.unwrap_or_default();
        for addr in addrs {
            let encoded = addr.to_vec();
            if !record.addrs.contains(&encoded) {
                record.addrs.push(encoded);
            }
        }
        record.last_seen_ms = now_ms();
        self.put(peer, &record)
    }

    /// Replace a peer's addresses wholesale.
    pub fn set_addrs(&self, peer: &PeerId, addrs: &[Multiaddr]) -> DbResult<()> {
        let record = PeerRecord {
            addrs: addrs.iter().map(|a| a.to_vec()).collect(),
            last_seen_ms: now_ms(),
        };
        self.put(peer, &record)
    }

    /// Forget a peer entirely, metadata included.
    pub fn remove(&self, peer: &PeerId) -> DbResult<()> {
        self.addrs.remove(peer.to_bytes())?;
        for entry in self.metadata.scan_prefix(metadata_prefix(peer)) {
            let (key, _) = entry?;
            self.metadata.remove(key)?;
        }
        Ok(())
    }

    /// Every peer with an address record.
    pub fn peers(&self) -> DbResult<Vec<PeerId>> {
        let mut peers = Vec::with_capacity(self.addrs.len());
        for entry in self.addrs.iter() {
            let (key, _) = entry?;
            let peer = PeerId::from_bytes(&key)
                .map_err(|e| DbError::Corrupt(format!("peer id: {e}")))?;
            peers.push(peer);
        }
        Ok(peers)
    }

    /// Number of peers with an address record.
    pub fn len(&self) -> usize {
        self.addrs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.addrs.is_empty()
    }

    // -- Metadata -----------------------------------------------------------

    /// Store a named metadata value for a peer.
    pub fn put_metadata(&self, peer: &PeerId, name: &str, value: &[u8]) -> DbResult<()> {
        self.metadata.insert(metadata_key(peer, name), value)?;
        Ok(())
    }

    /// Fetch a named metadata value for a peer.
    pub fn metadata(&self, peer: &PeerId, name: &str) -> DbResult<Option<Vec<u8>>> {
        Ok(self
            .metadata
            .get(metadata_key(peer, name))?
            .map(|v| v.to_vec()))
    }

    /// Force a flush of pending writes to disk.
    pub fn flush(&self) -> DbResult<()> {
        self.db.flush()?;
        Ok(())
    }
}

fn metadata_prefix(peer: &PeerId) -> Vec<u8> {
    let mut key = peer.to_bytes();
    key.push(0);
    key
}

fn metadata_key(peer: &PeerId, name: &str) -> Vec<u8> {
    let mut key = metadata_prefix(peer);
    key.extend_from_slice(name.as_bytes());
    key
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::db::{open_db, StoreOptions};

    fn temp_store() -> (tempfile::TempDir, PeerStore) {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = open_db(dir.path(), &StoreOptions::default()).expect("open");
        (dir, PeerStore::new(db).expect("peerstore"))
    }

    fn addr(s: &str) -> Multiaddr {
        s.parse().expect("valid multiaddr")
    }

    #[test]
    fn unknown_peer_has_no_addresses() {
        let (_dir, store) = temp_store();
        let peer = PeerId::random();
        assert!(store.get(&peer).unwrap().is_none());
        assert!(store.addrs(&peer).unwrap().is_empty());
        assert!(store.is_empty());
    }

    #[test]
    fn add_addrs_merges_and_deduplicates() {
        let (_dir, store) = temp_store();
        let peer = PeerId::random();

        store
            .add_addrs(&peer, &[addr("/ip4/10.0.0.1/tcp/4001")])
            .unwrap();
        store
            .add_addrs(
                &peer,
                &[
                    addr("/ip4/10.0.0.1/tcp/4001"),
                    addr("/ip4/1.2.3.4/tcp/4001"),
                ],
            )
            .unwrap();

        let addrs = store.addrs(&peer).unwrap();
        assert_eq!(
            addrs,
            vec![addr("/ip4/10.0.0.1/tcp/4001"), addr("/ip4/1.2.3.4/tcp/4001")]
        );
        assert!(store.get(&peer).unwrap().unwrap().last_seen_ms > 0);
    }

    #[test]
    fn set_addrs_replaces() {
        let (_dir, store) = temp_store();
        let peer = PeerId::random();

        store
            .add_addrs(&peer, &[addr("/ip4/10.0.0.1/tcp/4001")])
            .unwrap();
        store
            .set_addrs(&peer, &[addr("/ip4/10.0.0.2/tcp/4001")])
            .unwrap();

        assert_eq!(
            store.addrs(&peer).unwrap(),
            vec![addr("/ip4/10.0.0.2/tcp/4001")]
        );
    }

    #[test]
    fn peers_lists_every_record() {
        let (_dir, store) = temp_store();
        let a = PeerId::random();
        let b = PeerId::random();
        store.add_addrs(&a, &[addr("/ip4/1.1.1.1/tcp/1")]).unwrap();
        store.add_addrs(&b, &[addr("/ip4/2.2.2.2/tcp/2")]).unwrap();

        let mut peers = store.peers().unwrap();
        peers.sort();
        let mut expected = vec![a, b];
        expected.sort();
        assert_eq!(peers, expected);
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn remove_drops_addresses_and_metadata() {
        let (_dir, store) = temp_store();
        let peer = PeerId::random();
        let other = PeerId::random();

        store.add_addrs(&peer, &[addr("/ip4/1.1.1.1/tcp/1")]).unwrap();
        store.put_metadata(&peer, "agent", b"gatenet/0.1.0").unwrap();
        store.put_metadata(&other, "agent", b"someone-else").unwrap();

        store.remove(&peer).unwrap();

        assert!(store.get(&peer).unwrap().is_none());
        assert!(store.metadata(&peer, "agent").unwrap().is_none());
        assert_eq!(
            store.metadata(&other, "agent").unwrap().as_deref(),
            Some(&b"someone-else"[..])
        );
    }

    #[test]
    fn records_survive_reopen() {
        let dir = tempfile::tempdir().expect("tempdir");
        let peer = PeerId::random();

        {
            let db = open_db(dir.path(), &StoreOptions::default()).unwrap();
            let store = PeerStore::new(db).unwrap();
            store
                .add_addrs(&peer, &[addr("/ip4/1.2.3.4/tcp/9000")])
                .unwrap();
            store.put_metadata(&peer, "agent", b"gatenet").unwrap();
            store.flush().unwrap();
        }

        let db = open_db(dir.path(), &StoreOptions::default()).unwrap();
        let store = PeerStore::new(db).unwrap();
        assert_eq!(
            store.addrs(&peer).unwrap(),
            vec![addr("/ip4/1.2.3.4/tcp/9000")]
        );
        assert_eq!(
            store.metadata(&peer, "agent").unwrap().as_deref(),
            Some(&b"gatenet"[..])
        );
    }

    #[test]
    fn p2p_multiaddr_parsing() {
        let peer = PeerId::random();
        let full: Multiaddr = format!("/ip4/1.2.3.4/tcp/9000/p2p/{peer}").parse().unwrap();

        let info = PeerAddrInfo::from_p2p_multiaddr(&full).expect("has /p2p");
        assert_eq!(info.peer_id, peer);
        assert_eq!(info.addrs, vec![addr("/ip4/1.2.3.4/tcp/9000")]);

        assert!(PeerAddrInfo::from_p2p_multiaddr(&addr("/ip4/1.2.3.4/tcp/9000")).is_none());
    }
}
