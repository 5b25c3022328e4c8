//! # Node Identity
//!
//! Derives the node's `PeerId` from private key material.
//!
//! Two input formats are accepted, because operators have strong opinions:
//!
//! - libp2p protobuf-encoded private keys (what other libp2p stacks write
//!   to disk), any key type the `libp2p-identity` build supports;
//! - raw 32-byte Ed25519 secrets (what `gatenet-node init` writes).
//!
//! ## Security considerations
//!
//! - The keypair never leaves this module by value. The transport layer
//!   borrows it through a crate-private accessor.
//! - Key bytes are never logged. If you add logging to this module,
//!   you will be asked to leave.

use libp2p::identity::{Keypair, PublicKey};
use libp2p::PeerId;
use std::fmt;
use thiserror::Error;

/// Length of a raw Ed25519 secret.
pub const ED25519_SECRET_LENGTH: usize = 32;

/// The supplied key material is not a usable private key.
/// Messages never include any of the key bytes.
#[derive(Debug, Error)]
pub enum InvalidKeyError {
    #[error("key material is empty")]
    Empty,

    #[error("key material is not valid hex")]
    NotHex,

    #[error("key material is neither a protobuf private key nor a 32-byte ed25519 secret")]
    Malformed,
}

/// The node's cryptographic identity: a private keypair plus the `PeerId`
/// derived from its public half.
///
/// Created once at bootstrap and kept for the node's lifetime. Not `Clone`:
/// the private key has exactly one owner.
pub struct NodeIdentity {
    keypair: Keypair,
    peer_id: PeerId,
}

impl NodeIdentity {
    /// Generates a fresh Ed25519 identity from the OS RNG.
    pub fn generate() -> Self {
        Self::from_keypair(Keypair::generate_ed25519())
    }

    /// Derives an identity from private key material.
    ///
    /// Tries the protobuf encoding first, then falls back to a raw Ed25519
    /// secret if the input is exactly 32 bytes.
    pub fn from_key_material(material: &[u8]) -> Result<Self, InvalidKeyError> {
        if material.is_empty() {
            return Err(InvalidKeyError::Empty);
        }

        if let Ok(keypair) = Keypair::from_protobuf_encoding(material) {
            return Ok(Self::from_keypair(keypair));
        }

        if material.len() == ED25519_SECRET_LENGTH {
            let mut secret = [0u8; ED25519_SECRET_LENGTH];
            secret.copy_from_slice(material);
            let keypair =
                Keypair::ed25519_from_bytes(secret).map_err(|_| InvalidKeyError::Malformed)?;
            return Ok(Self::from_keypair(keypair));
        }

        Err(InvalidKeyError::Malformed)
    }

    /// Derives an identity from hex-encoded key material.
    ///
    /// Convenience for CLI flags and env vars. Please don't put raw hex keys
    /// in shell history in production.
    pub fn from_hex(hex_str: &str) -> Result<Self, InvalidKeyError> {
        let trimmed = hex_str.trim();
        if trimmed.is_empty() {
            return Err(InvalidKeyError::Empty);
        }
        let bytes = hex::decode(trimmed).map_err(|_| InvalidKeyError::NotHex)?;
        Self::from_key_material(&bytes)
    }

    fn from_keypair(keypair: Keypair) -> Self {
        let peer_id = keypair.public().to_peer_id();
        Self { keypair, peer_id }
    }

    /// The canonical node identifier.
    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    /// The public half of the identity. Safe to share.
    pub fn public(&self) -> PublicKey {
        self.keypair.public()
    }

    /// Exports the private key in libp2p protobuf encoding.
    ///
    /// **Handle with extreme care.** Only the `init` command should ever
    /// need this, to write the key file.
    pub fn to_protobuf_encoding(&self) -> Result<Vec<u8>, InvalidKeyError> {
        self.keypair
            .to_protobuf_encoding()
            .map_err(|_| InvalidKeyError::Malformed)
    }

    /// Borrowed by the transport and identify layers.
    pub(crate) fn keypair(&self) -> &Keypair {
        &self.keypair
    }
}

impl fmt::Debug for NodeIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeIdentity")
            .field("peer_id", &self.peer_id)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derivation_is_deterministic() {
        let original = NodeIdentity::generate();
        let encoded = original.to_protobuf_encoding().unwrap();

        let first = NodeIdentity::from_key_material(&encoded).unwrap();
        let second = NodeIdentity::from_key_material(&encoded).unwrap();

        assert_eq!(first.peer_id(), second.peer_id());
        assert_eq!(first.peer_id(), original.peer_id());
    }

    #[test]
    fn raw_ed25519_secret_is_accepted() {
        let secret = [7u8; ED25519_SECRET_LENGTH];
        let a = NodeIdentity::from_key_material(&secret).unwrap();
        let b = NodeIdentity::from_key_material(&secret).unwrap();
        assert_eq!(a.peer_id(), b.peer_id());
        assert_eq!(a.public().to_peer_id(), a.peer_id());
    }

    #[test]
    fn different_secrets_give_different_ids() {
        let a = NodeIdentity::from_key_material(&[1u8; 32]).unwrap();
        let b = NodeIdentity::from_key_material(&[2u8; 32]).unwrap();
        assert_ne!(a.peer_id(), b.peer_id());
    }

    #[test]
    fn hex_round_trip_matches_bytes() {
        let secret = [0x42u8; 32];
        let from_bytes = NodeIdentity::from_key_material(&secret).unwrap();
        let from_hex = NodeIdentity::from_hex(&hex::encode(secret)).unwrap();
        assert_eq!(from_bytes.peer_id(), from_hex.peer_id());
    }

    #[test]
    fn malformed_material_is_rejected() {
        assert!(matches!(
            NodeIdentity::from_key_material(&[]),
            Err(InvalidKeyError::Empty)
        ));
        assert!(matches!(
            NodeIdentity::from_key_material(b"definitely not a key"),
            Err(InvalidKeyError::Malformed)
        ));
        assert!(matches!(
            NodeIdentity::from_hex("zz-not-hex"),
            Err(InvalidKeyError::NotHex)
        ));
    }

    #[test]
    fn debug_does_not_leak_key() {
        let identity = NodeIdentity::from_key_material(&[9u8; 32]).unwrap();
        let rendered = format!("{identity:?}");
        assert!(rendered.contains(&identity.peer_id().to_string()));
        assert!(!rendered.contains(&hex::encode([9u8; 32])));
    }
}
