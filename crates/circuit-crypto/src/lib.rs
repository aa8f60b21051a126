#![forbid(unsafe_code)]

//! Cryptographic primitives for the circuit-relay workspace: Ed25519
//! identity keypairs and signed reservation vouchers.

pub mod identity;
pub mod voucher;

pub use identity::{IdentityKeypair, PublicIdentity};
pub use voucher::{ReservationVoucher, VoucherError};
