//! # Storage Module
//!
//! Everything a Gatenet node keeps on disk between restarts.
//!
//! ## Architecture
//!
//! ```text
//! db.rs        — opens the two sled databases under the state directory
//! peerstore.rs — peer address book (+ identify metadata)
//! records.rs   — persistent kad RecordStore, one tree per DHT tier
//! ```
//!
//! ## Data Flow
//!
//! ```text
//!            StateStores::open(state_dir)
//!               ↓                    ↓
//!         peerstore-v0/           dht-v0/
//!               ↓                 ↓      ↓
//!          PeerStore      records/lan  records/wan
//!                              ↓            ↓
//!                         SledRecordStore (per tier)
//! ```
//!
//! ## Design Decisions
//!
//! 1. **Two databases, not two trees.** The address book and the DHT are
//!    owned by different subsystems and must never collide on keys.
//! 2. **Bincode for on-disk serialization.** Compact, fast, deterministic.
//! 3. **Multiaddrs stored binary.** Exactly what the wire uses.

pub mod db;
pub mod peerstore;
pub mod records;

pub use db::{DbError, StateStores, StorageUnavailableError, StoreMode, StoreOptions};
pub use peerstore::{PeerAddrInfo, PeerRecord, PeerStore};
pub use records::SledRecordStore;
