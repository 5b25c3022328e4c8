//! # DHT Record Store
//!
//! A `libp2p-kad` [`RecordStore`] backed by a sled tree, so the records this
//! node holds for the network survive restarts.
//!
//! Provider records stay in memory (a [`MemoryStore`]). They're re-announced
//! periodically by their owners and go stale quickly, so persisting them
//! would mostly mean persisting garbage.
//!
//! Each DHT tier gets its own tree (`records/lan`, `records/wan`) inside the
//! shared `dht-v0` database, so the two tables can't overwrite each other.
//!
//! ## Expiry
//!
//! `Record::expires` is an `Instant`, which means nothing across a process
//! restart. We persist the remaining lifetime as a wall-clock deadline and
//! convert back on read; records whose deadline has passed are treated as
//! absent and cleaned up lazily.

use libp2p::kad::store::{self, MemoryStore, RecordStore};
use libp2p::kad::{ProviderRecord, Record, RecordKey};
use libp2p::PeerId;
use serde::{Deserialize, Serialize};
use sled::Tree;
use std::borrow::Cow;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tracing::warn;

/// Largest value we're willing to store. Matches the kad default.
pub const MAX_RECORD_VALUE_BYTES: usize = 65 * 1024;

/// Largest number of records per tier.
pub const MAX_RECORDS: usize = 1024;

/// On-disk shape of a record.
#[derive(Debug, Serialize, Deserialize)]
struct StoredRecord {
    value: Vec<u8>,
    publisher: Option<Vec<u8>>,
    /// Wall-clock expiry (Unix ms), if any.
    expires_at_ms: Option<u64>,
}

fn unix_ms(at: SystemTime) -> u64 {
    at.duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as u64
}

impl StoredRecord {
    fn from_record(record: &Record) -> Self {
        let expires_at_ms = record.expires.map(|deadline| {
            let remaining = deadline.saturating_duration_since(Instant::now());
            unix_ms(SystemTime::now() + remaining)
        });
        Self {
            value: record.value.clone(),
            publisher: record.publisher.map(|p| p.to_bytes()),
            expires_at_ms,
        }
    }

    fn is_expired(&self, now_ms: u64) -> bool {
        matches!(self.expires_at_ms, Some(deadline) if deadline <= now_ms)
    }

    fn into_record(self, key: RecordKey) -> Record {
        let now_ms = unix_ms(SystemTime::now());
        let expires = self
            .expires_at_ms
            .map(|deadline| Instant::now() + Duration::from_millis(deadline.saturating_sub(now_ms)));
        Record {
            key,
            value: self.value,
            publisher: self
                .publisher
                .and_then(|bytes| PeerId::from_bytes(&bytes).ok()),
            expires,
        }
    }
}

/// Persistent record store for one DHT tier.
pub struct SledRecordStore {
    records: Tree,
    /// Entries in `records`. Counted once at open, then kept in step with
    /// every insert and remove.
    count: AtomicUsize,
    max_records: usize,
    providers: MemoryStore,
}

impl SledRecordStore {
    /// Wraps a sled tree. Provider records are kept in memory for
    /// `local_peer_id`.
    pub fn new(local_peer_id: PeerId, records: Tree) -> Self {
        Self::with_max_records(local_peer_id, records, MAX_RECORDS)
    }

    pub fn with_max_records(local_peer_id: PeerId, records: Tree, max_records: usize) -> Self {
        let count = AtomicUsize::new(records.len());
        Self {
            records,
            count,
            max_records,
            providers: MemoryStore::new(local_peer_id),
        }
    }

    /// Number of records persisted for this tier.
    pub fn len(&self) -> usize {
        self.count.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn delete(&self, key: &RecordKey) {
        match self.records.remove(key.to_vec()) {
            Ok(Some(_)) => {
                self.count.fetch_sub(1, Ordering::Relaxed);
            }
            Ok(None) => {}
            Err(e) => warn!(error = %e, "dht record remove failed"),
        }
    }

    fn load(&self, key: &RecordKey) -> Option<StoredRecord> {
        let bytes = match self.records.get(key.to_vec()) {
            Ok(Some(bytes)) => bytes,
            Ok(None) => return None,
            Err(e) => {
                warn!(error = %e, "dht record read failed");
                return None;
            }
        };
        match bincode::deserialize::<StoredRecord>(&bytes) {
            Ok(stored) => Some(stored),
            Err(e) => {
                warn!(error = %e, "dropping undecodable dht record");
                self.delete(key);
                None
            }
        }
    }
}

/// kad's store error has no I/O variant. A record that can't be encoded or
/// written is reported as [`store::Error::MaxRecords`]: the store could not
/// take it, and kad must not count it as held.
impl RecordStore for SledRecordStore {
    type RecordsIter<'a> = std::vec::IntoIter<Cow<'a, Record>>;
    type ProvidedIter<'a> = std::vec::IntoIter<Cow<'a, ProviderRecord>>;

    fn get(&self, k: &RecordKey) -> Option<Cow<'_, Record>> {
        let stored = self.load(k)?;
        if stored.is_expired(unix_ms(SystemTime::now())) {
            self.delete(k);
            return None;
        }
        Some(Cow::Owned(stored.into_record(k.clone())))
    }

    fn put(&mut self, r: Record) -> store::Result<()> {
        if r.value.len() >= MAX_RECORD_VALUE_BYTES {
            return Err(store::Error::ValueTooLarge);
        }

        let exists = matches!(self.records.contains_key(r.key.to_vec()), Ok(true));
        if !exists && self.len() >= self.max_records {
            return Err(store::Error::MaxRecords);
        }

        let bytes = bincode::serialize(&StoredRecord::from_record(&r)).map_err(|e| {
            warn!(error = %e, "dht record encode failed");
            store::Error::MaxRecords
        })?;
        let previous = self.records.insert(r.key.to_vec(), bytes).map_err(|e| {
            warn!(error = %e, "dht record write failed");
            store::Error::MaxRecords
        })?;
        if previous.is_none() {
            self.count.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }

    fn remove(&mut self, k: &RecordKey) {
        self.delete(k);
    }

    fn records(&self) -> Self::RecordsIter<'_> {
        let now_ms = unix_ms(SystemTime::now());
        self.records
            .iter()
            .filter_map(|entry| entry.ok())
            .filter_map(|(key, bytes)| {
                let stored: StoredRecord = bincode::deserialize(&bytes).ok()?;
                if stored.is_expired(now_ms) {
                    return None;
                }
                Some(Cow::Owned(stored.into_record(RecordKey::from(key.to_vec()))))
            })
            .collect::<Vec<_>>()
            .into_iter()
    }

    fn add_provider(&mut self, record: ProviderRecord) -> store::Result<()> {
        self.providers.add_provider(record)
    }

    fn providers(&self, key: &RecordKey) -> Vec<ProviderRecord> {
        self.providers.providers(key)
    }

    fn provided(&self) -> Self::ProvidedIter<'_> {
        self.providers.provided().collect::<Vec<_>>().into_iter()
    }

    fn remove_provider(&mut self, k: &RecordKey, p: &PeerId) {
        self.providers.remove_provider(k, p)
    }
}
