//! Client-side error taxonomy.
//!
//! Wire-level refusals carry the status enum so that callers can branch
//! on it; [`Error::status`] folds the legacy v1 codes into the same
//! taxonomy.

use circuit_core::codec::CodecError;
use circuit_core::host::HostError;
use circuit_core::peer::PeerIdError;
use circuit_core::proto::{circuit_relay, Status};
use multiaddr::Multiaddr;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("{0} is not a relay address")]
    NotRelayAddr(Multiaddr),

    #[error("can't dial a p2p-circuit without specifying a relay: {0}")]
    NoRelaySpecified(Multiaddr),

    #[error("error parsing relay multiaddr: {0}")]
    InvalidRelayAddr(#[from] PeerIdError),

    #[error("error opening hop stream to relay: {0}")]
    Host(#[from] HostError),

    #[error("framing error: {0}")]
    Codec(#[from] CodecError),

    #[error("unexpected relay response; not a status message")]
    UnexpectedResponse,

    #[error("unexpected stream protocol: {0}")]
    UnexpectedProtocol(&'static str),

    #[error("error opening relay circuit: {0:?}")]
    CircuitFailed(Status),

    #[error("error opening relay circuit: {0:?}")]
    CircuitFailedV1(circuit_relay::Status),

    #[error("reservation failed: {0:?}")]
    ReservationFailed(Status),

    #[error("missing reservation info")]
    MissingReservation,

    #[error("listener closed")]
    ListenerClosed,

    #[error("operation timed out")]
    Timeout,
}

impl Error {
    /// The v2 status behind this error, with legacy v1 codes mapped onto
    /// the same taxonomy. `None` for local errors.
    pub fn status(&self) -> Option<Status> {
        match self {
            Error::CircuitFailed(status) | Error::ReservationFailed(status) => Some(*status),
            Error::CircuitFailedV1(code) => Some(map_v1_status(*code)),
            _ => None,
        }
    }

    /// The raw v1 code, when the failure came from a v1 relay.
    pub fn v1_status(&self) -> Option<circuit_relay::Status> {
        match self {
            Error::CircuitFailedV1(code) => Some(*code),
            _ => None,
        }
    }
}

fn map_v1_status(code: circuit_relay::Status) -> Status {
    use circuit_relay::Status as V1;

    match code {
        V1::Success => Status::Ok,
        V1::HopCantSpeakRelay | V1::HopCantRelayToSelf => Status::PermissionDenied,
        V1::HopNoConnToDst => Status::NoReservation,
        V1::HopCantDialDst | V1::HopCantOpenDstStream | V1::StopRelayRefused => {
            Status::ConnectionFailed
        }
        V1::HopSrcAddrTooLong
        | V1::HopDstAddrTooLong
        | V1::HopSrcMultiaddrInvalid
        | V1::HopDstMultiaddrInvalid
        | V1::StopSrcMultiaddrInvalid
        | V1::StopDstMultiaddrInvalid
        | V1::MalformedMessage => Status::MalformedMessage,
    }
}
