//! Relay resource policy.

use std::time::Duration;

/// Caps applied to each relayed circuit.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RelayLimit {
    /// Wall-time cap for the whole circuit.
    pub duration: Duration,
    /// Byte cap per direction.
    pub data: u64,
}

impl Default for RelayLimit {
    fn default() -> Self {
        Self { duration: Duration::from_secs(60), data: 128 * 1024 }
    }
}

/// Server-side policy knobs for the relay.
#[derive(Clone, Debug)]
pub struct Resources {
    /// Per-circuit caps; `None` relays until EOF.
    pub limit: Option<RelayLimit>,

    /// How long a reservation lasts.
    pub reservation_ttl: Duration,
    /// Minimum interval between reservation refreshes by one peer.
    pub reservation_refresh_ttl: Duration,

    /// Cap on concurrently live reservations.
    pub max_reservations: usize,
    /// Cap on live circuits per peer, counted on both ends.
    pub max_circuits: u32,

    /// Reservation-rate caps enforced by the constraints engine.
    pub max_reservations_per_peer: usize,
    pub max_reservations_per_ip: usize,
    pub max_reservations_per_asn: usize,

    /// Size of each splice copy buffer.
    pub buffer_size: usize,
}

impl Default for Resources {
    fn default() -> Self {
        Self {
            limit: Some(RelayLimit::default()),
            reservation_ttl: Duration::from_secs(60 * 60),
            reservation_refresh_ttl: Duration::from_secs(15 * 60),
            max_reservations: 128,
            max_circuits: 16,
            max_reservations_per_peer: 4,
            max_reservations_per_ip: 8,
            max_reservations_per_asn: 32,
            buffer_size: 2048,
        }
    }
}

impl Resources {
    /// Policy with no per-circuit caps.
    pub fn unlimited() -> Self {
        Self { limit: None, ..Self::default() }
    }
}
