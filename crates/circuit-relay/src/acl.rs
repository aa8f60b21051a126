//! Access control over reservations and circuits.

use circuit_core::peer::PeerId;
use multiaddr::Multiaddr;

/// Relay access-control predicates. An absent ACL allows everything.
pub trait Acl: Send + Sync + 'static {
    /// May `peer`, observed at `addr`, reserve a relay slot?
    fn allow_reserve(&self, peer: &PeerId, addr: &Multiaddr) -> bool;

    /// May `src`, observed at `src_addr`, open a circuit to `dest`?
    fn allow_connect(&self, src: &PeerId, src_addr: &Multiaddr, dest: &PeerId) -> bool;
}

/// ACL that permits everything; useful as a combinator identity.
pub struct AllowAll;

impl Acl for AllowAll {
    fn allow_reserve(&self, _peer: &PeerId, _addr: &Multiaddr) -> bool {
        true
    }

    fn allow_connect(&self, _src: &PeerId, _src_addr: &Multiaddr, _dest: &PeerId) -> bool {
        true
    }
}

/// ACL that denies everything.
pub struct DenyAll;

impl Acl for DenyAll {
    fn allow_reserve(&self, _peer: &PeerId, _addr: &Multiaddr) -> bool {
        false
    }

    fn allow_connect(&self, _src: &PeerId, _src_addr: &Multiaddr, _dest: &PeerId) -> bool {
        false
    }
}
