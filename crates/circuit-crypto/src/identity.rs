//! Ed25519 identity keys.
//!
//! A peer's ID is the SHA-256 digest of its Ed25519 public key. This
//! keeps the ID opaque and fixed-size while binding it to the key that
//! signs reservation vouchers.
//!
//! # Example
//!
//! ```
//! use circuit_crypto::identity::IdentityKeypair;
//!
//! let keypair = IdentityKeypair::generate();
//! let peer_id = keypair.peer_id();
//!
//! let signature = keypair.sign(b"challenge");
//! assert!(keypair.public().verify(b"challenge", &signature));
//! assert_eq!(keypair.public().peer_id(), peer_id);
//! ```

use circuit_core::peer::PeerId;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use sha2::{Digest, Sha256};
use zeroize::Zeroize;

/// Ed25519 identity keypair.
///
/// Contains both the signing key (private) and verifying key (public).
pub struct IdentityKeypair {
    signing_key: SigningKey,
}

impl IdentityKeypair {
    /// Generate a new random keypair using the OS CSPRNG.
    pub fn generate() -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        Self { signing_key }
    }

    /// Create from raw signing key bytes, zeroizing the input.
    pub fn from_bytes(bytes: &mut [u8; 32]) -> Self {
        let signing_key = SigningKey::from_bytes(bytes);
        bytes.zeroize();
        Self { signing_key }
    }

    /// The peer ID derived from the public key.
    pub fn peer_id(&self) -> PeerId {
        peer_id_of(&self.signing_key.verifying_key())
    }

    /// The public half of this identity.
    pub fn public(&self) -> PublicIdentity {
        PublicIdentity { verifying_key: self.signing_key.verifying_key() }
    }

    /// The public key bytes.
    pub fn public_key_bytes(&self) -> [u8; 32] {
        *self.signing_key.verifying_key().as_bytes()
    }

    /// Sign a message with this identity.
    pub fn sign(&self, message: &[u8]) -> [u8; 64] {
        self.signing_key.sign(message).to_bytes()
    }
}

/// Public identity (verifying key only).
///
/// Used when you only need to verify signatures, not create them.
#[derive(Clone)]
pub struct PublicIdentity {
    verifying_key: VerifyingKey,
}

impl PublicIdentity {
    /// Create from raw public key bytes.
    pub fn from_bytes(bytes: &[u8; 32]) -> Option<Self> {
        let verifying_key = VerifyingKey::from_bytes(bytes).ok()?;
        Some(Self { verifying_key })
    }

    /// The peer ID derived from this key.
    pub fn peer_id(&self) -> PeerId {
        peer_id_of(&self.verifying_key)
    }

    /// Verify a signature over `message`.
    pub fn verify(&self, message: &[u8], signature: &[u8]) -> bool {
        let sig = match Signature::from_slice(signature) {
            Ok(s) => s,
            Err(_) => return false,
        };
        self.verifying_key.verify(message, &sig).is_ok()
    }
}

fn peer_id_of(key: &VerifyingKey) -> PeerId {
    let digest = Sha256::digest(key.as_bytes());
    PeerId::from_bytes(digest.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_verify() {
        let keypair = IdentityKeypair::generate();
        let message = b"hello circuit";

        let signature = keypair.sign(message);
        assert!(keypair.public().verify(message, &signature));
        assert!(!keypair.public().verify(b"wrong message", &signature));
    }

    #[test]
    fn peer_id_is_stable() {
        let keypair = IdentityKeypair::generate();
        assert_eq!(keypair.peer_id(), keypair.public().peer_id());

        let restored = PublicIdentity::from_bytes(&keypair.public_key_bytes()).unwrap();
        assert_eq!(restored.peer_id(), keypair.peer_id());
    }

    #[test]
    fn distinct_keys_distinct_ids() {
        let a = IdentityKeypair::generate();
        let b = IdentityKeypair::generate();
        assert_ne!(a.peer_id(), b.peer_id());
    }

    #[test]
    fn keypair_bytes_roundtrip() {
        let keypair = IdentityKeypair::generate();
        let public = keypair.public_key_bytes();

        let mut seed = keypair.signing_key.to_bytes();
        let restored = IdentityKeypair::from_bytes(&mut seed);
        assert_eq!(restored.public_key_bytes(), public);
        assert_eq!(seed, [0u8; 32]);
    }
}
