#![forbid(unsafe_code)]

//! The stop/client side of the circuit-relay protocol.
//!
//! A client reserves a slot at a relay, listens for incoming relayed
//! circuits, and dials other peers through relays. Dialing offers the
//! v2 hop protocol with a fallback to the legacy v1 protocol; the stop
//! handlers accept both versions of incoming circuits.

pub mod client;
pub mod conn;
mod dial;
pub mod error;
mod handlers;
pub mod listen;
pub mod reservation;
pub mod transport;

pub use client::{Client, HOP_TAG};
pub use conn::{Conn, ConnStat};
pub use error::Error;
pub use listen::Listener;
pub use reservation::Reservation;
pub use transport::{RelayTransport, UpgradedListener};
