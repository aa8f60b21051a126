//! Reservation constraints.
//!
//! Tracks admitted reservations along four dimensions (total, per peer,
//! per IP, per ASN) as time-stamped events that expire after
//! [`VALIDITY`]. The relay consults the engine on every reservation
//! request and removes a peer's events when it disconnects.
//!
//! The engine is not thread-safe by itself; the relay holds its own
//! mutex across the decision and the commit.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv6Addr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use circuit_core::addr::multiaddr_to_ip;
use circuit_core::peer::PeerId;
use multiaddr::Multiaddr;
use thiserror::Error;

use crate::resources::Resources;

/// How long an admitted reservation counts against the caps.
pub const VALIDITY: Duration = Duration::from_secs(30 * 60);

/// Reservation admission errors.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ConstraintError {
    #[error("too many reservations")]
    TooManyReservations,

    #[error("too many reservations for peer")]
    TooManyReservationsForPeer,

    #[error("too many peers in IP address")]
    TooManyPeersInIp,

    #[error("too many peers in ASN")]
    TooManyPeersInAsn,

    #[error("no IP address associated with peer")]
    NoIp,
}

/// External ASN lookup, keyed by IPv6 prefix. `None` means the address
/// is untracked and does not count against any ASN.
pub trait AsnLookup: Send + Sync + 'static {
    fn asn_for_ipv6(&self, ip: Ipv6Addr) -> Option<String>;
}

/// Static prefix table implementing [`AsnLookup`].
#[derive(Default)]
pub struct AsnTable {
    entries: Vec<(u128, u128, String)>,
}

impl AsnTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Map every address under `prefix`/`prefix_len` to `asn`.
    pub fn insert(&mut self, prefix: Ipv6Addr, prefix_len: u8, asn: impl Into<String>) {
        let mask = if prefix_len == 0 { 0 } else { u128::MAX << (128 - u32::from(prefix_len)) };
        self.entries.push((u128::from(prefix) & mask, mask, asn.into()));
    }
}

impl AsnLookup for AsnTable {
    fn asn_for_ipv6(&self, ip: Ipv6Addr) -> Option<String> {
        let ip = u128::from(ip);
        self.entries
            .iter()
            .find(|(prefix, mask, _)| ip & mask == *prefix)
            .map(|(_, _, asn)| asn.clone())
    }
}

/// Identifier of one admitted reservation event, used for rollback.
pub type EventId = u64;

struct EventLocation {
    peer: PeerId,
    ip: IpAddr,
    asn: Option<String>,
}

/// The four-dimensional reservation counter.
pub struct Constraints {
    max_reservations: usize,
    max_per_peer: usize,
    max_per_ip: usize,
    max_per_asn: usize,
    asn_lookup: Option<Arc<dyn AsnLookup>>,

    next_id: EventId,
    total: HashMap<EventId, Instant>,
    peers: HashMap<PeerId, HashMap<EventId, Instant>>,
    ips: HashMap<IpAddr, HashMap<EventId, Instant>>,
    asns: HashMap<String, HashMap<EventId, Instant>>,
    locations: HashMap<EventId, EventLocation>,
}

impl Constraints {
    pub fn new(rc: &Resources) -> Self {
        Self {
            max_reservations: rc.max_reservations,
            max_per_peer: rc.max_reservations_per_peer,
            max_per_ip: rc.max_reservations_per_ip,
            max_per_asn: rc.max_reservations_per_asn,
            asn_lookup: None,
            next_id: 0,
            total: HashMap::new(),
            peers: HashMap::new(),
            ips: HashMap::new(),
            asns: HashMap::new(),
            locations: HashMap::new(),
        }
    }

    pub fn with_asn_lookup(rc: &Resources, lookup: Arc<dyn AsnLookup>) -> Self {
        Self { asn_lookup: Some(lookup), ..Self::new(rc) }
    }

    /// Admit a reservation for `peer` observed at `addr`, returning the
    /// event ID for a later precise rollback.
    pub fn add_reservation(
        &mut self,
        peer: PeerId,
        addr: &Multiaddr,
    ) -> Result<EventId, ConstraintError> {
        self.add_at(peer, addr, Instant::now())
    }

    /// Remove every event admitted for `peer`.
    pub fn remove_reservation(&mut self, peer: &PeerId) {
        let Some(events) = self.peers.remove(peer) else { return };
        for id in events.into_keys() {
            self.remove_located(id);
        }
    }

    /// Remove one admitted event (reservation rollback).
    pub fn remove_event(&mut self, id: EventId) {
        self.remove_located(id);
    }

    /// Events currently counted in the total dimension.
    pub fn active(&self) -> usize {
        self.total.len()
    }

    fn add_at(
        &mut self,
        peer: PeerId,
        addr: &Multiaddr,
        now: Instant,
    ) -> Result<EventId, ConstraintError> {
        self.gc_at(now);

        if self.total.len() >= self.max_reservations {
            return Err(ConstraintError::TooManyReservations);
        }

        let ip = multiaddr_to_ip(addr).ok_or(ConstraintError::NoIp)?;

        if self.peers.get(&peer).map(HashMap::len).unwrap_or(0) >= self.max_per_peer {
            return Err(ConstraintError::TooManyReservationsForPeer);
        }

        if self.ips.get(&ip).map(HashMap::len).unwrap_or(0) >= self.max_per_ip {
            return Err(ConstraintError::TooManyPeersInIp);
        }

        let asn = match ip {
            IpAddr::V6(v6) => self.asn_lookup.as_ref().and_then(|l| l.asn_for_ipv6(v6)),
            IpAddr::V4(_) => None,
        };
        if let Some(asn) = &asn {
            if self.asns.get(asn).map(HashMap::len).unwrap_or(0) >= self.max_per_asn {
                return Err(ConstraintError::TooManyPeersInAsn);
            }
        }

        let id = self.next_id;
        self.next_id += 1;

        self.total.insert(id, now);
        self.peers.entry(peer).or_default().insert(id, now);
        self.ips.entry(ip).or_default().insert(id, now);
        if let Some(asn) = &asn {
            self.asns.entry(asn.clone()).or_default().insert(id, now);
        }
        self.locations.insert(id, EventLocation { peer, ip, asn });

        Ok(id)
    }

    fn remove_located(&mut self, id: EventId) {
        let Some(loc) = self.locations.remove(&id) else { return };
        self.total.remove(&id);

        if let Some(events) = self.peers.get_mut(&loc.peer) {
            events.remove(&id);
            if events.is_empty() {
                self.peers.remove(&loc.peer);
            }
        }
        if let Some(events) = self.ips.get_mut(&loc.ip) {
            events.remove(&id);
            if events.is_empty() {
                self.ips.remove(&loc.ip);
            }
        }
        if let Some(asn) = loc.asn {
            if let Some(events) = self.asns.get_mut(&asn) {
                events.remove(&id);
                if events.is_empty() {
                    self.asns.remove(&asn);
                }
            }
        }
    }

    fn gc_at(&mut self, now: Instant) {
        let expired: Vec<EventId> = self
            .total
            .iter()
            .filter(|(_, stamp)| **stamp + VALIDITY <= now)
            .map(|(id, _)| *id)
            .collect();

        for id in expired {
            self.remove_located(id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(seed: u8) -> PeerId {
        PeerId::from_bytes([seed; 32])
    }

    fn v4_addr(ip: &str) -> Multiaddr {
        format!("/ip4/{ip}/tcp/1234").parse().unwrap()
    }

    fn v6_addr(ip: &str) -> Multiaddr {
        format!("/ip6/{ip}/tcp/1234").parse().unwrap()
    }

    fn engine(per_ip: usize, per_asn: usize) -> Constraints {
        let rc = Resources {
            max_reservations_per_ip: per_ip,
            max_reservations_per_asn: per_asn,
            ..Resources::default()
        };
        let mut table = AsnTable::new();
        table.insert("2001:200::".parse().unwrap(), 32, "AS2500");
        Constraints::with_asn_lookup(&rc, Arc::new(table))
    }

    #[test]
    fn ip_and_asn_constraints() {
        let mut c = engine(1, 2);

        c.add_reservation(id(1), &v4_addr("1.2.3.4")).unwrap();
        assert_eq!(
            c.add_reservation(id(2), &v4_addr("1.2.3.4")),
            Err(ConstraintError::TooManyPeersInIp)
        );

        c.remove_reservation(&id(1));
        c.add_reservation(id(2), &v4_addr("1.2.3.4")).unwrap();

        c.add_reservation(id(3), &v6_addr("2001:200::1")).unwrap();
        c.add_reservation(id(4), &v6_addr("2001:200::2")).unwrap();
        assert_eq!(
            c.add_reservation(id(5), &v6_addr("2001:200::3")),
            Err(ConstraintError::TooManyPeersInAsn)
        );

        c.remove_reservation(&id(4));
        c.add_reservation(id(5), &v6_addr("2001:200::3")).unwrap();
    }

    #[test]
    fn untracked_ipv6_skips_the_asn_dimension() {
        let mut c = engine(8, 1);

        // 2001:db8:: is not in the table; the ASN cap never applies.
        c.add_reservation(id(1), &v6_addr("2001:db8::1")).unwrap();
        c.add_reservation(id(2), &v6_addr("2001:db8::2")).unwrap();
    }

    #[test]
    fn address_without_ip_is_rejected() {
        let mut c = engine(8, 8);
        let addr: Multiaddr = "/dns4/example.com/tcp/1234".parse().unwrap();
        assert_eq!(c.add_reservation(id(1), &addr), Err(ConstraintError::NoIp));
    }

    #[test]
    fn total_cap_applies_first() {
        let rc = Resources { max_reservations: 2, ..Resources::default() };
        let mut c = Constraints::new(&rc);

        c.add_reservation(id(1), &v4_addr("10.0.0.1")).unwrap();
        c.add_reservation(id(2), &v4_addr("10.0.0.2")).unwrap();
        assert_eq!(
            c.add_reservation(id(3), &v4_addr("10.0.0.3")),
            Err(ConstraintError::TooManyReservations)
        );
    }

    #[test]
    fn per_peer_cap() {
        let rc = Resources { max_reservations_per_peer: 2, ..Resources::default() };
        let mut c = Constraints::new(&rc);

        c.add_reservation(id(1), &v4_addr("10.0.0.1")).unwrap();
        c.add_reservation(id(1), &v4_addr("10.0.0.2")).unwrap();
        assert_eq!(
            c.add_reservation(id(1), &v4_addr("10.0.0.3")),
            Err(ConstraintError::TooManyReservationsForPeer)
        );
    }

    #[test]
    fn events_expire_after_the_validity_window() {
        let rc = Resources { max_reservations_per_ip: 1, ..Resources::default() };
        let mut c = Constraints::new(&rc);

        let t0 = Instant::now();
        c.add_at(id(1), &v4_addr("1.2.3.4"), t0).unwrap();
        assert_eq!(
            c.add_at(id(2), &v4_addr("1.2.3.4"), t0 + Duration::from_secs(60)),
            Err(ConstraintError::TooManyPeersInIp)
        );

        // Past the window, the slot opens up again.
        c.add_at(id(2), &v4_addr("1.2.3.4"), t0 + VALIDITY + Duration::from_secs(1)).unwrap();
        assert_eq!(c.active(), 1);
    }

    #[test]
    fn rollback_removes_one_event() {
        let rc = Resources { max_reservations_per_ip: 1, ..Resources::default() };
        let mut c = Constraints::new(&rc);

        let event = c.add_reservation(id(1), &v4_addr("1.2.3.4")).unwrap();
        c.remove_event(event);

        c.add_reservation(id(2), &v4_addr("1.2.3.4")).unwrap();
        assert_eq!(c.active(), 1);
    }
}
