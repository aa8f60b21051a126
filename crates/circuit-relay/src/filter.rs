//! Acceptor algebra and the peer allow-list filter.
//!
//! ACLs compose: [`and`], [`or`] and [`not`] combine whole ACLs, while
//! [`merge`] builds one from an inbound half (reservations and circuit
//! sources) and an outbound half (circuit destinations).

use std::collections::HashSet;
use std::sync::{Arc, RwLock};

use circuit_core::peer::PeerId;
use multiaddr::Multiaddr;

use crate::acl::Acl;

struct And(Arc<dyn Acl>, Arc<dyn Acl>);

impl Acl for And {
    fn allow_reserve(&self, peer: &PeerId, addr: &Multiaddr) -> bool {
        self.0.allow_reserve(peer, addr) && self.1.allow_reserve(peer, addr)
    }

    fn allow_connect(&self, src: &PeerId, src_addr: &Multiaddr, dest: &PeerId) -> bool {
        self.0.allow_connect(src, src_addr, dest) && self.1.allow_connect(src, src_addr, dest)
    }
}

struct Or(Arc<dyn Acl>, Arc<dyn Acl>);

impl Acl for Or {
    fn allow_reserve(&self, peer: &PeerId, addr: &Multiaddr) -> bool {
        self.0.allow_reserve(peer, addr) || self.1.allow_reserve(peer, addr)
    }

    fn allow_connect(&self, src: &PeerId, src_addr: &Multiaddr, dest: &PeerId) -> bool {
        self.0.allow_connect(src, src_addr, dest) || self.1.allow_connect(src, src_addr, dest)
    }
}

struct Not(Arc<dyn Acl>);

impl Acl for Not {
    fn allow_reserve(&self, peer: &PeerId, addr: &Multiaddr) -> bool {
        !self.0.allow_reserve(peer, addr)
    }

    fn allow_connect(&self, src: &PeerId, src_addr: &Multiaddr, dest: &PeerId) -> bool {
        !self.0.allow_connect(src, src_addr, dest)
    }
}

struct Merge {
    inbound: Arc<dyn Acl>,
    outbound: Arc<dyn Acl>,
}

impl Acl for Merge {
    fn allow_reserve(&self, peer: &PeerId, addr: &Multiaddr) -> bool {
        self.inbound.allow_reserve(peer, addr)
    }

    fn allow_connect(&self, src: &PeerId, src_addr: &Multiaddr, dest: &PeerId) -> bool {
        self.inbound.allow_reserve(src, src_addr) && self.outbound.allow_connect(src, src_addr, dest)
    }
}

/// Both ACLs must allow.
pub fn and(a: Arc<dyn Acl>, b: Arc<dyn Acl>) -> Arc<dyn Acl> {
    Arc::new(And(a, b))
}

/// Either ACL may allow.
pub fn or(a: Arc<dyn Acl>, b: Arc<dyn Acl>) -> Arc<dyn Acl> {
    Arc::new(Or(a, b))
}

/// Invert an ACL.
pub fn not(a: Arc<dyn Acl>) -> Arc<dyn Acl> {
    Arc::new(Not(a))
}

/// Combine an inbound half (who may reserve / act as circuit source)
/// with an outbound half (which destinations may be reached).
pub fn merge(inbound: Arc<dyn Acl>, outbound: Arc<dyn Acl>) -> Arc<dyn Acl> {
    Arc::new(Merge { inbound, outbound })
}

/// Thread-safe allow-list of peer IDs, usable directly as an ACL.
///
/// A peer on the list may reserve and may appear on either end of a
/// circuit. The list can be edited while the relay is running; removing
/// a peer does not kill its live circuits.
pub struct PeerFilter {
    allowed: RwLock<HashSet<PeerId>>,
}

impl PeerFilter {
    pub fn new() -> Self {
        Self { allowed: RwLock::new(HashSet::new()) }
    }

    /// A filter seeded with the given peers.
    pub fn with_peers(peers: impl IntoIterator<Item = PeerId>) -> Self {
        Self { allowed: RwLock::new(peers.into_iter().collect()) }
    }

    pub fn allow(&self, peer: PeerId) {
        self.allowed.write().unwrap().insert(peer);
    }

    pub fn unallow(&self, peer: &PeerId) {
        self.allowed.write().unwrap().remove(peer);
    }

    pub fn allow_many(&self, peers: impl IntoIterator<Item = PeerId>) {
        let mut allowed = self.allowed.write().unwrap();
        allowed.extend(peers);
    }

    pub fn unallow_many<'a>(&self, peers: impl IntoIterator<Item = &'a PeerId>) {
        let mut allowed = self.allowed.write().unwrap();
        for peer in peers {
            allowed.remove(peer);
        }
    }

    pub fn is_allowed(&self, peer: &PeerId) -> bool {
        self.allowed.read().unwrap().contains(peer)
    }
}

impl Default for PeerFilter {
    fn default() -> Self {
        Self::new()
    }
}

impl Acl for PeerFilter {
    fn allow_reserve(&self, peer: &PeerId, _addr: &Multiaddr) -> bool {
        self.is_allowed(peer)
    }

    fn allow_connect(&self, src: &PeerId, _src_addr: &Multiaddr, dest: &PeerId) -> bool {
        self.is_allowed(src) && self.is_allowed(dest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acl::{AllowAll, DenyAll};

    fn id(seed: u8) -> PeerId {
        PeerId::from_bytes([seed; 32])
    }

    fn addr() -> Multiaddr {
        "/ip4/127.0.0.1/tcp/4001".parse().unwrap()
    }

    fn reserve_allowed(acl: &dyn Acl) -> bool {
        acl.allow_reserve(&id(1), &addr())
    }

    #[test]
    fn combinator_truth_tables() {
        let yes: Arc<dyn Acl> = Arc::new(AllowAll);
        let no: Arc<dyn Acl> = Arc::new(DenyAll);

        assert!(reserve_allowed(&*and(yes.clone(), yes.clone())));
        assert!(!reserve_allowed(&*and(yes.clone(), no.clone())));

        assert!(reserve_allowed(&*or(no.clone(), yes.clone())));
        assert!(!reserve_allowed(&*or(no.clone(), no.clone())));

        assert!(reserve_allowed(&*not(no.clone())));
        assert!(!reserve_allowed(&*not(yes.clone())));
    }

    #[test]
    fn merge_splits_directions() {
        let inbound: Arc<dyn Acl> = Arc::new(PeerFilter::with_peers([id(1)]));
        let outbound: Arc<dyn Acl> = Arc::new(PeerFilter::with_peers([id(1), id(2)]));
        let acl = merge(inbound, outbound);

        assert!(acl.allow_reserve(&id(1), &addr()));
        assert!(!acl.allow_reserve(&id(2), &addr()));

        // src must pass the inbound half, dest the outbound half.
        assert!(acl.allow_connect(&id(1), &addr(), &id(2)));
        assert!(!acl.allow_connect(&id(2), &addr(), &id(1)));
    }

    #[test]
    fn peer_filter_add_remove() {
        let filter = PeerFilter::new();
        assert!(!filter.is_allowed(&id(1)));

        filter.allow_many([id(1), id(2), id(3)]);
        assert!(filter.is_allowed(&id(2)));

        filter.unallow(&id(2));
        assert!(!filter.is_allowed(&id(2)));

        filter.unallow_many([&id(1), &id(3)]);
        assert!(!filter.is_allowed(&id(1)));
        assert!(!filter.is_allowed(&id(3)));
    }

    #[test]
    fn peer_filter_as_acl() {
        let filter = PeerFilter::with_peers([id(1), id(2)]);

        assert!(filter.allow_connect(&id(1), &addr(), &id(2)));
        assert!(!filter.allow_connect(&id(1), &addr(), &id(3)));
    }
}
