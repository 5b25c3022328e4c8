//! # StateStores — Persistent Storage Engine
//!
//! The persistence layer for a Gatenet node, built on sled's embedded
//! key-value store. All on-disk data flows through this module.
//!
//! ## Directory Layout
//!
//! Two independent sled databases live under the caller's state directory:
//!
//! | Directory       | Owner                 | Trees                           |
//! |-----------------|-----------------------|---------------------------------|
//! | `peerstore-v0/` | peer address book     | `addrs`, `metadata`             |
//! | `dht-v0/`       | DHT record store      | `records/lan`, `records/wan`    |
//!
//! Separate databases (not just separate trees) so the two subsystems can
//! never collide on keys, and so each can be flushed and released by its
//! owner independently.
//!
//! ## Durability
//!
//! sled buffers writes in memory and flushes in the background every
//! `flush_every_ms`. Anything written since the last flush can be lost on a
//! crash. `close()` flushes before releasing the handle, so a clean shutdown
//! never loses data. Reopening an existing directory resumes prior state —
//! sled never truncates on open.

use serde::{Deserialize, Serialize};
use sled::{Db, Tree};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::config;

// ---------------------------------------------------------------------------
// Error Type
// ---------------------------------------------------------------------------

/// A persistent store could not be opened or created.
#[derive(Debug, thiserror::Error)]
#[error("storage unavailable at {path}: {reason}")]
pub struct StorageUnavailableError {
    /// The directory we tried to open.
    pub path: PathBuf,
    /// What went wrong, from sled or the filesystem.
    pub reason: String,
}

/// Errors from operations on an already-open store.
#[derive(Debug, thiserror::Error)]
pub enum DbError {
    #[error("sled error: {0}")]
    Sled(#[from] sled::Error),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("corrupt entry: {0}")]
    Corrupt(String),
}

pub type DbResult<T> = Result<T, DbError>;

// ---------------------------------------------------------------------------
// Options
// ---------------------------------------------------------------------------

/// sled's space/throughput trade-off, mirrored so it can live in config.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StoreMode {
    /// Smaller files, more compaction work.
    LowSpace,
    /// Faster writes, bigger files.
    HighThroughput,
}

impl From<StoreMode> for sled::Mode {
    fn from(mode: StoreMode) -> Self {
        match mode {
            StoreMode::LowSpace => sled::Mode::LowSpace,
            StoreMode::HighThroughput => sled::Mode::HighThroughput,
        }
    }
}

/// Options applied to both stores.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreOptions {
    /// Page cache size in bytes. Trades memory for read latency.
    pub cache_capacity: u64,
    /// Background flush interval. `None` means only explicit flushes are
    /// durable.
    pub flush_every_ms: Option<u64>,
    /// Space vs. throughput.
    pub mode: StoreMode,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            cache_capacity: config::DEFAULT_STORE_CACHE_BYTES,
            flush_every_ms: Some(config::DEFAULT_FLUSH_EVERY_MS),
            mode: StoreMode::LowSpace,
        }
    }
}

/// Opens a single sled database at `path` with `options`.
///
/// If the directory doesn't exist, sled creates it. If it does, the
/// existing data is available immediately.
pub fn open_db(path: &Path, options: &StoreOptions) -> Result<Db, StorageUnavailableError> {
    sled::Config::new()
        .path(path)
        .cache_capacity(options.cache_capacity)
        .flush_every_ms(options.flush_every_ms)
        .mode(options.mode.into())
        .open()
        .map_err(|e| StorageUnavailableError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
}

// ---------------------------------------------------------------------------
// StateStores
// ---------------------------------------------------------------------------

/// The node's two persistent stores.
///
/// Cloning a sled `Db` is cheap (it's an `Arc`), but the file lock is only
/// released once *every* clone is gone. Hand clones to exactly one owner
/// each and call [`StateStores::close`] on teardown.
#[derive(Debug)]
pub struct StateStores {
    root: PathBuf,
    peerstore: Db,
    dht: Db,
}

impl StateStores {
    /// Opens (or creates) both stores under `state_dir`.
    pub fn open<P: AsRef<Path>>(
        state_dir: P,
        options: &StoreOptions,
    ) -> Result<Self, StorageUnavailableError> {
        let root = state_dir.as_ref().to_path_buf();

        let peerstore_path = root.join(config::PEERSTORE_DIR);
        let peerstore = open_db(&peerstore_path, options)?;
        debug!(path = %peerstore_path.display(), "peerstore opened");

        let dht_path = root.join(config::DHT_STORE_DIR);
        let dht = open_db(&dht_path, options)?;
        debug!(path = %dht_path.display(), "dht store opened");

        info!(
            state_dir = %root.display(),
            resumed = peerstore.was_recovered() && dht.was_recovered(),
            "persistent stores ready"
        );

        Ok(Self {
            root,
            peerstore,
            dht,
        })
    }

    /// The state directory both stores live under.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// The peer address-book database.
    pub fn peerstore_db(&self) -> &Db {
        &self.peerstore
    }

    /// The DHT record database.
    pub fn dht_db(&self) -> &Db {
        &self.dht
    }

    /// Opens a named tree in the DHT database. Created if missing.
    pub fn dht_tree(&self, name: &str) -> DbResult<Tree> {
        Ok(self.dht.open_tree(name)?)
    }

    /// Force a flush of both stores.
    ///
    /// Blocks until all data is durable on the underlying storage device.
    pub fn flush(&self) -> DbResult<()> {
        self.peerstore.flush()?;
        self.dht.flush()?;
        Ok(())
    }

    /// Flushes both stores and releases this handle.
    ///
    /// The on-disk lock is released once the last clone held by the
    /// peerstore and DHT layers is dropped as well.
    pub fn close(self) -> DbResult<()> {
        self.flush()?;
        info!(state_dir = %self.root.display(), "persistent stores closed");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
