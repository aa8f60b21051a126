#![forbid(unsafe_code)]

//! The hop side of the circuit-relay protocol.
//!
//! A relay accepts HOP streams from peers: destinations **reserve** a
//! slot so that they can receive relayed circuits, and sources
//! **connect** through the relay to a reserved destination. Granted
//! circuits are spliced byte-for-byte in both directions, optionally
//! capped in wall time and bytes.

pub mod acl;
pub mod constraints;
pub mod filter;
pub mod pool;
pub mod relay;
pub mod resources;

pub use acl::Acl;
pub use constraints::{AsnLookup, AsnTable, ConstraintError, Constraints};
pub use filter::PeerFilter;
pub use relay::{Relay, RelayConfig, SetupError, RESERVATION_TAG, RESERVATION_TAG_WEIGHT};
pub use resources::{RelayLimit, Resources};
