//! Circuit-address helpers.
//!
//! A relayed address has the shape `/…/p2p/<relay>/p2p-circuit/p2p/<dest>`;
//! the `p2p-circuit` component (code 290) marks the relay split.

use std::net::IpAddr;

use multiaddr::{Multiaddr, Protocol};

/// The bare `/p2p-circuit` address, used as the symbolic listen address.
pub fn circuit_addr() -> Multiaddr {
    Multiaddr::empty().with(Protocol::P2pCircuit)
}

/// Whether the address contains a `p2p-circuit` component.
pub fn is_relay_addr(addr: &Multiaddr) -> bool {
    addr.iter().any(|p| matches!(p, Protocol::P2pCircuit))
}

/// Split `/a/p2p-circuit/b` into `(/a, /b)` at the first `p2p-circuit`
/// component. Returns `None` when the address has no such component;
/// either side of the split may be empty.
pub fn split_circuit(addr: &Multiaddr) -> Option<(Multiaddr, Multiaddr)> {
    if !is_relay_addr(addr) {
        return None;
    }

    let mut prefix = Multiaddr::empty();
    let mut suffix = Multiaddr::empty();
    let mut seen_circuit = false;

    for proto in addr.iter() {
        if matches!(proto, Protocol::P2pCircuit) && !seen_circuit {
            seen_circuit = true;
            continue;
        }
        if seen_circuit {
            suffix.push(proto);
        } else {
            prefix.push(proto);
        }
    }

    Some((prefix, suffix))
}

/// Extract the IPv4/IPv6 address, if the multiaddr starts with one.
pub fn multiaddr_to_ip(addr: &Multiaddr) -> Option<IpAddr> {
    addr.iter().find_map(|p| match p {
        Protocol::Ip4(ip) => Some(IpAddr::V4(ip)),
        Protocol::Ip6(ip) => Some(IpAddr::V6(ip)),
        _ => None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::PeerId;

    fn p2p(seed: u8) -> Protocol<'static> {
        Protocol::P2p(PeerId::from_bytes([seed; 32]).to_multihash())
    }

    #[test]
    fn detects_relay_addrs() {
        let plain: Multiaddr = "/ip4/1.2.3.4/tcp/4001".parse().unwrap();
        assert!(!is_relay_addr(&plain));
        assert!(is_relay_addr(&plain.with(Protocol::P2pCircuit)));
    }

    #[test]
    fn splits_at_circuit_component() {
        let addr = Multiaddr::empty()
            .with(Protocol::Ip4([1, 2, 3, 4].into()))
            .with(Protocol::Tcp(4001))
            .with(p2p(1))
            .with(Protocol::P2pCircuit)
            .with(p2p(2));

        let (relay, dest) = split_circuit(&addr).unwrap();
        assert_eq!(relay, "/ip4/1.2.3.4/tcp/4001".parse::<Multiaddr>().unwrap().with(p2p(1)));
        assert_eq!(dest, Multiaddr::empty().with(p2p(2)));
    }

    #[test]
    fn split_without_circuit_is_none() {
        let addr: Multiaddr = "/ip4/1.2.3.4/tcp/4001".parse().unwrap();
        assert!(split_circuit(&addr).is_none());
    }

    #[test]
    fn split_with_leading_circuit_has_empty_prefix() {
        let addr = Multiaddr::empty().with(Protocol::P2pCircuit).with(p2p(2));
        let (relay, dest) = split_circuit(&addr).unwrap();
        assert!(relay.is_empty());
        assert!(!dest.is_empty());
    }

    #[test]
    fn extracts_ips() {
        let v4: Multiaddr = "/ip4/10.0.0.1/tcp/1".parse().unwrap();
        let v6: Multiaddr = "/ip6/2001:200::1/tcp/1".parse().unwrap();
        let none: Multiaddr = "/dns4/example.com/tcp/1".parse().unwrap();

        assert_eq!(multiaddr_to_ip(&v4), Some("10.0.0.1".parse().unwrap()));
        assert_eq!(multiaddr_to_ip(&v6), Some("2001:200::1".parse().unwrap()));
        assert_eq!(multiaddr_to_ip(&none), None);
    }
}
