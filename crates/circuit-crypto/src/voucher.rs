//! Signed reservation vouchers.
//!
//! A voucher binds a relay, a reserving peer, and an expiration time
//! under the relay's signature. The canonical byte form is
//!
//! ```text
//! uvarint(|relay|) ‖ relay ‖ uvarint(|peer|) ‖ peer ‖ uvarint(expire_unix)
//! ```
//!
//! and the signed blob is the ASCII tag `libp2p-relay-rsvp:` followed by
//! that form. The marshaled form appends the raw signature; a
//! deserialized voucher takes the remainder of the buffer as its
//! signature and does **not** validate it.

use circuit_core::codec::{get_uvarint, put_uvarint};
use circuit_core::peer::PeerId;
use thiserror::Error;

use crate::identity::{IdentityKeypair, PublicIdentity};

const SIGNING_TAG: &[u8] = b"libp2p-relay-rsvp:";

/// Voucher errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum VoucherError {
    #[error("missing signature")]
    MissingSignature,

    #[error("signature verification failed")]
    VerifyFailed,

    #[error("signing key does not match the voucher's relay")]
    WrongKey,

    #[error("truncated voucher bytes")]
    Truncated,

    #[error("invalid peer ID in voucher")]
    InvalidPeerId,
}

/// A reservation voucher: the relay's signed statement that `peer` holds
/// a relay slot until `expiration`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReservationVoucher {
    /// The peer providing relay service.
    pub relay: PeerId,
    /// The peer receiving relay service through `relay`.
    pub peer: PeerId,
    /// Expiration as unix seconds.
    pub expiration: u64,
    signature: Option<Vec<u8>>,
}

impl ReservationVoucher {
    /// An unsigned voucher.
    pub fn new(relay: PeerId, peer: PeerId, expiration: u64) -> Self {
        Self { relay, peer, expiration, signature: None }
    }

    pub fn is_signed(&self) -> bool {
        self.signature.is_some()
    }

    fn canonical_bytes(&self) -> Vec<u8> {
        let relay = self.relay.as_bytes();
        let peer = self.peer.as_bytes();

        let mut buf = Vec::with_capacity(relay.len() + peer.len() + 16);
        put_uvarint(&mut buf, relay.len() as u64);
        buf.extend_from_slice(relay);
        put_uvarint(&mut buf, peer.len() as u64);
        buf.extend_from_slice(peer);
        put_uvarint(&mut buf, self.expiration);
        buf
    }

    fn signed_blob(&self) -> Vec<u8> {
        let body = self.canonical_bytes();
        let mut blob = Vec::with_capacity(SIGNING_TAG.len() + body.len());
        blob.extend_from_slice(SIGNING_TAG);
        blob.extend_from_slice(&body);
        blob
    }

    /// Sign the voucher with the relay's key. A no-op when a signature is
    /// already present.
    pub fn sign(&mut self, keypair: &IdentityKeypair) -> Result<(), VoucherError> {
        if self.signature.is_some() {
            return Ok(());
        }
        if keypair.peer_id() != self.relay {
            return Err(VoucherError::WrongKey);
        }

        let sig = keypair.sign(&self.signed_blob());
        self.signature = Some(sig.to_vec());
        Ok(())
    }

    /// Verify the signature against the relay's public key.
    pub fn verify(&self, public: &PublicIdentity) -> Result<(), VoucherError> {
        let sig = self.signature.as_deref().ok_or(VoucherError::MissingSignature)?;
        if public.verify(&self.signed_blob(), sig) {
            Ok(())
        } else {
            Err(VoucherError::VerifyFailed)
        }
    }

    /// Serialize: canonical bytes followed by the raw signature.
    pub fn marshal(&self) -> Result<Vec<u8>, VoucherError> {
        let sig = self.signature.as_deref().ok_or(VoucherError::MissingSignature)?;

        let mut out = self.canonical_bytes();
        out.extend_from_slice(sig);
        Ok(out)
    }

    /// Deserialize. The remainder of the buffer after the three
    /// length-prefixed fields becomes the signature, unvalidated.
    pub fn unmarshal(blob: &[u8]) -> Result<Self, VoucherError> {
        let mut rest = blob;

        let mut read_id = |rest: &mut &[u8]| -> Result<PeerId, VoucherError> {
            let (len, n) = get_uvarint(rest).ok_or(VoucherError::Truncated)?;
            *rest = &rest[n..];
            let len = len as usize;
            if len > rest.len() {
                return Err(VoucherError::Truncated);
            }
            let id = PeerId::from_slice(&rest[..len]).map_err(|_| VoucherError::InvalidPeerId)?;
            *rest = &rest[len..];
            Ok(id)
        };

        let relay = read_id(&mut rest)?;
        let peer = read_id(&mut rest)?;

        let (expiration, n) = get_uvarint(rest).ok_or(VoucherError::Truncated)?;
        rest = &rest[n..];

        if rest.is_empty() {
            return Err(VoucherError::Truncated);
        }

        Ok(Self { relay, peer, expiration, signature: Some(rest.to_vec()) })
    }
}
