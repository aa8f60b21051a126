//! Peer identifiers and peer address records.
//!
//! A **PeerId** is the 32-byte SHA-256 digest of a peer's Ed25519 public
//! key. It is treated as opaque bytes everywhere in this workspace;
//! equality is byte equality. The human-readable form is base58.

use std::fmt;

use multiaddr::{Multiaddr, Protocol};
use multihash::Multihash;
use thiserror::Error;

/// Multihash code for SHA2-256, the digest that carries a peer ID inside
/// a `/p2p/<id>` multiaddr component.
const MH_SHA2_256: u64 = 0x12;

/// Errors produced when decoding peer identifiers.
#[derive(Debug, Error)]
pub enum PeerIdError {
    #[error("invalid peer ID length: expected {expected} bytes, got {got}")]
    InvalidLength { expected: usize, got: usize },

    #[error("invalid base58 encoding")]
    InvalidBase58,

    #[error("unsupported multihash code: 0x{0:02x}")]
    UnsupportedMultihash(u64),
}

/// Opaque cryptographic peer identifier.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId([u8; Self::SIZE]);

impl PeerId {
    /// Length of a peer ID in bytes.
    pub const SIZE: usize = 32;

    /// Create a peer ID from raw digest bytes.
    pub fn from_bytes(bytes: [u8; Self::SIZE]) -> Self {
        Self(bytes)
    }

    /// Create a peer ID from a byte slice of exactly [`PeerId::SIZE`] bytes.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, PeerIdError> {
        let arr: [u8; Self::SIZE] =
            bytes
                .try_into()
                .map_err(|_| PeerIdError::InvalidLength {
                    expected: Self::SIZE,
                    got: bytes.len(),
                })?;
        Ok(Self(arr))
    }

    /// Raw digest bytes.
    pub fn as_bytes(&self) -> &[u8; Self::SIZE] {
        &self.0
    }

    /// Parse a peer ID from its base58 string form.
    pub fn from_base58(s: &str) -> Result<Self, PeerIdError> {
        let bytes = bs58::decode(s)
            .into_vec()
            .map_err(|_| PeerIdError::InvalidBase58)?;
        Self::from_slice(&bytes)
    }

    /// Base58 string form.
    pub fn to_base58(&self) -> String {
        bs58::encode(&self.0).into_string()
    }

    /// Wrap the ID as the multihash payload of a `/p2p/<id>` component.
    pub fn to_multihash(&self) -> Multihash<64> {
        // 32-byte digest always fits the 64-byte allocation.
        Multihash::wrap(MH_SHA2_256, &self.0).expect("digest fits multihash")
    }

    /// Recover a peer ID from the multihash payload of a `/p2p/<id>` component.
    pub fn from_multihash(mh: &Multihash<64>) -> Result<Self, PeerIdError> {
        if mh.code() != MH_SHA2_256 {
            return Err(PeerIdError::UnsupportedMultihash(mh.code()));
        }
        Self::from_slice(mh.digest())
    }

    /// Convert to the `multiaddr`/`libp2p-identity` `PeerId` used by
    /// [`Protocol::P2p`] multiaddr components.
    pub fn to_multiaddr_peer_id(&self) -> multiaddr::PeerId {
        multiaddr::PeerId::try_from(self.to_multihash())
            .expect("sha2-256 multihash is a valid multiaddr PeerId")
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_base58())
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({})", self.to_base58())
    }
}

/// A peer together with its known addresses.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AddrInfo {
    pub id: PeerId,
    pub addrs: Vec<Multiaddr>,
}

impl AddrInfo {
    /// An address record with no known addresses.
    pub fn new(id: PeerId) -> Self {
        Self { id, addrs: Vec::new() }
    }

    pub fn with_addrs(id: PeerId, addrs: Vec<Multiaddr>) -> Self {
        Self { id, addrs }
    }

    /// Parse an `AddrInfo` from a multiaddr ending in `/p2p/<id>`.
    ///
    /// The transport prefix (if any) becomes the peer's sole known address.
    pub fn from_p2p_addr(addr: &Multiaddr) -> Result<Self, PeerIdError> {
        let mut transport = Multiaddr::empty();
        let mut id = None;

        for proto in addr.iter() {
            match proto {
                Protocol::P2p(mh) => {
                    id = Some(PeerId::from_multihash(mh.as_ref())?);
                    // /p2p must terminate the address
                    break;
                }
                other => transport.push(other),
            }
        }

        let id = id.ok_or(PeerIdError::InvalidLength {
            expected: PeerId::SIZE,
            got: 0,
        })?;

        let addrs = if transport.is_empty() { Vec::new() } else { vec![transport] };
        Ok(Self { id, addrs })
    }

    /// The peer's addresses with the `/p2p/<id>` suffix appended.
    pub fn p2p_addrs(&self) -> Vec<Multiaddr> {
        self.addrs
            .iter()
            .map(|a| a.clone().with(Protocol::P2p(self.id.to_multiaddr_peer_id())))
            .collect()
    }
}
