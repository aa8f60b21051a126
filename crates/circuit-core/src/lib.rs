#![forbid(unsafe_code)]

//! Core types for the p2p circuit-relay protocol: peer identifiers,
//! circuit addresses, wire messages, framing, and the host abstraction
//! that both the relay and the client sides are written against.

pub mod addr;
pub mod codec;
pub mod host;
pub mod peer;
pub mod proto;

#[cfg(feature = "testing")]
pub mod testing;

pub use addr::{circuit_addr, is_relay_addr, multiaddr_to_ip, split_circuit};
pub use peer::{AddrInfo, PeerId, PeerIdError};

/// Protocol identifier of the legacy v1 relay protocol.
pub const PROTO_V1: &str = "/libp2p/circuit/relay/0.1.0";

/// Protocol identifier of the v2 hop (relay) side.
pub const PROTO_V2_HOP: &str = "/libp2p/circuit/relay/0.2.0/hop";

/// Protocol identifier of the v2 stop (client) side.
pub const PROTO_V2_STOP: &str = "/libp2p/circuit/relay/0.2.0/stop";

/// Multiaddr protocol code of the `p2p-circuit` component.
pub const P_CIRCUIT: u32 = 290;
