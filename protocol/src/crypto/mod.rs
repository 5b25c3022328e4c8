//! # Cryptographic Primitives for Gatenet
//!
//! Two jobs, both deliberately boring:
//!
//! - **keys** — turn private key material into a node identity (`PeerId`).
//! - **pnet** — turn a public network id into the pre-shared key that gates
//!   transport connections.
//!
//! ## A note on "rolling your own crypto"
//!
//! We don't. Signatures and identities come from `libp2p-identity`, the
//! pnet handshake from `libp2p-pnet`, and the key derivation is one
//! BLAKE2b call. If you're tempted to get creative in here, please
//! reconsider. Then reconsider again.

pub mod keys;
pub mod pnet;

pub use keys::{InvalidKeyError, NodeIdentity};
pub use pnet::{rendezvous_string, PrivateNetworkKey};
