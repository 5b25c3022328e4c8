//! # Private Network Key Derivation
//!
//! Every Gatenet network is gated by a pre-shared key. Nodes that don't
//! hold the key can open a TCP socket to us, but the pnet handshake turns
//! everything after that into noise (the bad kind).
//!
//! The key is not distributed out of band. It is derived from the public
//! rendezvous string:
//!
//! ```text
//! rendezvous = "/gatenet/0.0.1/<network_id>"
//! key        = BLAKE2b-256(rendezvous)
//! ```
//!
//! So anyone who knows the network id can join — the gate keeps *other*
//! networks out, it is not an access control list. Independently started
//! nodes converge on the same key without any coordination.
//!
//! BLAKE2b-256 (not BLAKE3, not SHA-256) because existing deployments
//! derived their keys that way, and a different hash means a different
//! network.

use blake2::digest::consts::U32;
use blake2::{Blake2b, Digest};
use libp2p::pnet::PreSharedKey;
use std::fmt;

use crate::config;

type Blake2b256 = Blake2b<U32>;

/// Length of the derived key in bytes.
pub const PRIVATE_NETWORK_KEY_LENGTH: usize = 32;

/// Builds the rendezvous string for a network id.
///
/// Also used by discovery collaborators for topic naming, so the format is
/// effectively public API.
pub fn rendezvous_string(network_id: &str) -> String {
    format!(
        "/{}/{}/{}",
        config::PROTOCOL_PREFIX,
        config::RENDEZVOUS_VERSION,
        network_id
    )
}

/// A 32-byte transport gating secret.
///
/// Never persisted, never logged. `Debug` shows a fingerprint only.
#[derive(Clone, PartialEq, Eq)]
pub struct PrivateNetworkKey([u8; PRIVATE_NETWORK_KEY_LENGTH]);

impl PrivateNetworkKey {
    /// Derives the key from a rendezvous string. Total and deterministic.
    pub fn derive(rendezvous: &str) -> Self {
        let mut hasher = Blake2b256::new();
        hasher.update(rendezvous.as_bytes());
        let digest = hasher.finalize();

        let mut key = [0u8; PRIVATE_NETWORK_KEY_LENGTH];
        key.copy_from_slice(&digest);
        Self(key)
    }

    /// Shorthand for `derive(&rendezvous_string(network_id))`.
    pub fn for_network(network_id: &str) -> Self {
        Self::derive(&rendezvous_string(network_id))
    }

    /// Raw key bytes.
    pub fn as_bytes(&self) -> &[u8; PRIVATE_NETWORK_KEY_LENGTH] {
        &self.0
    }

    /// The libp2p pre-shared key fed to the pnet handshake.
    pub fn to_psk(&self) -> PreSharedKey {
        PreSharedKey::new(self.0)
    }

    /// Fingerprint of the key, safe to log. Two nodes with the same
    /// fingerprint are on the same network.
    pub fn fingerprint(&self) -> String {
        self.to_psk().fingerprint().to_string()
    }
}

impl fmt::Debug for PrivateNetworkKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("PrivateNetworkKey")
            .field(&self.fingerprint())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn rendezvous_string_format() {
        assert_eq!(rendezvous_string("testnet"), "/gatenet/0.0.1/testnet");
        assert_eq!(rendezvous_string(""), "/gatenet/0.0.1/");
    }

    #[test]
    fn derivation_is_deterministic() {
        let a = PrivateNetworkKey::for_network("testnet");
        let b = PrivateNetworkKey::for_network("testnet");
        assert_eq!(a, b);
        assert_eq!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn different_networks_get_different_keys() {
        let testnet = PrivateNetworkKey::for_network("testnet");
        let othernet = PrivateNetworkKey::for_network("othernet");
        assert_ne!(testnet, othernet);
    }

    #[test]
    fn no_collisions_across_many_network_ids() {
        let mut seen = HashSet::new();
        for i in 0..10_000 {
            let key = PrivateNetworkKey::for_network(&format!("net-{i}"));
            assert!(seen.insert(*key.as_bytes()), "collision at net-{i}");
        }
    }

    #[test]
    fn key_is_blake2b_256_of_rendezvous() {
        let rendezvous = rendezvous_string("testnet");
        let expected = Blake2b256::digest(rendezvous.as_bytes());
        assert_eq!(
            PrivateNetworkKey::derive(&rendezvous).as_bytes().as_slice(),
            expected.as_slice()
        );
    }

    #[test]
    fn debug_shows_fingerprint_not_key() {
        let key = PrivateNetworkKey::for_network("testnet");
        let rendered = format!("{key:?}");
        assert!(!rendered.contains(&hex::encode(key.as_bytes())));
        assert!(rendered.contains(&key.fingerprint()));
    }
}
