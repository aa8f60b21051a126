//! Wire messages for the circuit-relay protocols.
//!
//! Every frame on the wire is a length-delimited protobuf (see
//! [`crate::codec`]). The v2 protocol speaks [`HopMessage`] on the hop
//! side and [`StopMessage`] on the stop side; the legacy v1 protocol
//! speaks [`CircuitRelay`] in both directions.

use multiaddr::Multiaddr;
use thiserror::Error;

use crate::peer::{AddrInfo, PeerId};

/// v2 status codes, carried in `HopMessage`/`StopMessage` STATUS frames.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum Status {
    Ok = 100,
    ReservationRefused = 200,
    ResourceLimitExceeded = 201,
    PermissionDenied = 202,
    ConnectionFailed = 203,
    NoReservation = 204,
    MalformedMessage = 400,
    UnexpectedMessage = 401,
}

/// Message exchanged on the hop protocol.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct HopMessage {
    #[prost(enumeration = "hop_message::Type", optional, tag = "1")]
    pub r#type: Option<i32>,
    #[prost(message, optional, tag = "2")]
    pub peer: Option<Peer>,
    #[prost(message, optional, tag = "3")]
    pub reservation: Option<Reservation>,
    #[prost(message, optional, tag = "4")]
    pub limit: Option<Limit>,
    #[prost(enumeration = "Status", optional, tag = "5")]
    pub status: Option<i32>,
}

pub mod hop_message {
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
    #[repr(i32)]
    pub enum Type {
        Reserve = 0,
        Connect = 1,
        Status = 2,
    }
}

impl HopMessage {
    pub fn reserve() -> Self {
        Self { r#type: Some(hop_message::Type::Reserve as i32), ..Default::default() }
    }

    pub fn connect(peer: Peer) -> Self {
        Self {
            r#type: Some(hop_message::Type::Connect as i32),
            peer: Some(peer),
            ..Default::default()
        }
    }

    pub fn with_status(status: Status) -> Self {
        Self {
            r#type: Some(hop_message::Type::Status as i32),
            status: Some(status as i32),
            ..Default::default()
        }
    }

    pub fn msg_type(&self) -> Option<hop_message::Type> {
        self.r#type.and_then(|v| hop_message::Type::try_from(v).ok())
    }

    pub fn status_code(&self) -> Option<Status> {
        self.status.and_then(|v| Status::try_from(v).ok())
    }
}

/// Message exchanged on the stop protocol.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct StopMessage {
    #[prost(enumeration = "stop_message::Type", optional, tag = "1")]
    pub r#type: Option<i32>,
    #[prost(message, optional, tag = "2")]
    pub peer: Option<Peer>,
    #[prost(message, optional, tag = "3")]
    pub limit: Option<Limit>,
    #[prost(enumeration = "Status", optional, tag = "4")]
    pub status: Option<i32>,
}

pub mod stop_message {
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
    #[repr(i32)]
    pub enum Type {
        Connect = 0,
        Status = 1,
    }
}

impl StopMessage {
    pub fn connect(peer: Peer) -> Self {
        Self {
            r#type: Some(stop_message::Type::Connect as i32),
            peer: Some(peer),
            ..Default::default()
        }
    }

    pub fn with_status(status: Status) -> Self {
        Self {
            r#type: Some(stop_message::Type::Status as i32),
            status: Some(status as i32),
            ..Default::default()
        }
    }

    pub fn msg_type(&self) -> Option<stop_message::Type> {
        self.r#type.and_then(|v| stop_message::Type::try_from(v).ok())
    }

    pub fn status_code(&self) -> Option<Status> {
        self.status.and_then(|v| Status::try_from(v).ok())
    }
}

/// A peer record: raw ID bytes plus raw multiaddr bytes.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Peer {
    #[prost(bytes = "vec", tag = "1")]
    pub id: Vec<u8>,
    #[prost(bytes = "vec", repeated, tag = "2")]
    pub addrs: Vec<Vec<u8>>,
}

/// Reservation info returned by the relay.
///
/// Two wire forms of the expiry coexist: an absolute `expire` unix
/// timestamp and a relative `ttl` in seconds. Readers must accept both;
/// this implementation emits `ttl`.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Reservation {
    #[prost(uint64, optional, tag = "1")]
    pub expire: Option<u64>,
    #[prost(uint32, optional, tag = "2")]
    pub ttl: Option<u32>,
    #[prost(message, optional, tag = "3")]
    pub relay: Option<Peer>,
    #[prost(bytes = "vec", repeated, tag = "4")]
    pub addrs: Vec<Vec<u8>>,
    #[prost(bytes = "vec", optional, tag = "5")]
    pub voucher: Option<Vec<u8>>,
}

/// Circuit caps advertised by the relay.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Limit {
    /// Wall-time cap in seconds.
    #[prost(uint32, optional, tag = "1")]
    pub duration: Option<u32>,
    /// Byte cap per direction.
    #[prost(uint64, optional, tag = "2")]
    pub data: Option<u64>,
}

/// Legacy v1 message, kept wire-compatible for interop.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CircuitRelay {
    #[prost(enumeration = "circuit_relay::Type", optional, tag = "1")]
    pub r#type: Option<i32>,
    #[prost(message, optional, tag = "2")]
    pub src_peer: Option<Peer>,
    #[prost(message, optional, tag = "3")]
    pub dst_peer: Option<Peer>,
    #[prost(enumeration = "circuit_relay::Status", optional, tag = "4")]
    pub code: Option<i32>,
}

pub mod circuit_relay {
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
    #[repr(i32)]
    pub enum Type {
        Hop = 1,
        Stop = 2,
        Status = 3,
        CanHop = 4,
    }

    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
    #[repr(i32)]
    pub enum Status {
        Success = 100,
        HopSrcAddrTooLong = 220,
        HopDstAddrTooLong = 221,
        HopSrcMultiaddrInvalid = 250,
        HopDstMultiaddrInvalid = 251,
        HopNoConnToDst = 260,
        HopCantDialDst = 261,
        HopCantOpenDstStream = 262,
        HopCantSpeakRelay = 270,
        HopCantRelayToSelf = 280,
        StopSrcMultiaddrInvalid = 350,
        StopDstMultiaddrInvalid = 351,
        StopRelayRefused = 390,
        MalformedMessage = 400,
    }
}

impl CircuitRelay {
    pub fn hop(src: Peer, dst: Peer) -> Self {
        Self {
            r#type: Some(circuit_relay::Type::Hop as i32),
            src_peer: Some(src),
            dst_peer: Some(dst),
            code: None,
        }
    }

    pub fn status(code: circuit_relay::Status) -> Self {
        Self {
            r#type: Some(circuit_relay::Type::Status as i32),
            src_peer: None,
            dst_peer: None,
            code: Some(code as i32),
        }
    }

    pub fn msg_type(&self) -> Option<circuit_relay::Type> {
        self.r#type.and_then(|v| circuit_relay::Type::try_from(v).ok())
    }

    pub fn status_code(&self) -> Option<circuit_relay::Status> {
        self.code.and_then(|v| circuit_relay::Status::try_from(v).ok())
    }
}

/// Error converting a wire [`Peer`] into an [`AddrInfo`].
#[derive(Debug, Error)]
pub enum PeerConvError {
    #[error("missing peer record")]
    MissingPeer,

    #[error("invalid peer ID in peer record")]
    InvalidId(#[from] crate::peer::PeerIdError),
}

/// Decode a wire peer record, dropping any unparseable addresses.
pub fn peer_to_addr_info(p: Option<&Peer>) -> Result<AddrInfo, PeerConvError> {
    let p = p.ok_or(PeerConvError::MissingPeer)?;
    let id = PeerId::from_slice(&p.id)?;

    let mut addrs = Vec::with_capacity(p.addrs.len());
    for bytes in &p.addrs {
        if let Ok(a) = Multiaddr::try_from(bytes.clone()) {
            addrs.push(a);
        }
    }

    Ok(AddrInfo { id, addrs })
}

/// Encode an [`AddrInfo`] as a wire peer record.
pub fn addr_info_to_peer(info: &AddrInfo) -> Peer {
    let mut addrs = Vec::with_capacity(info.addrs.len());
    for addr in &info.addrs {
        addrs.push(addr.to_vec());
    }

    Peer { id: info.id.as_bytes().to_vec(), addrs }
}
