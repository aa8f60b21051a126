//! Transport adapter.
//!
//! Exposes circuit addresses to the host's dialer/listener contract: the
//! transport dials `/…/p2p/<relay>/p2p-circuit/p2p/<dest>` addresses and
//! upgrades accepted circuits through the host's upgrader. This is a
//! proxy transport; the addresses it handles name another peer's
//! transport, not this one's.

use std::sync::Arc;

use multiaddr::Multiaddr;

use circuit_core::addr::{is_relay_addr, split_circuit};
use circuit_core::host::MuxStream;
use circuit_core::peer::AddrInfo;
use circuit_core::P_CIRCUIT;

use crate::client::ClientInner;
use crate::error::Error;
use crate::listen::Listener;

/// The relay transport.
pub struct RelayTransport {
    inner: Arc<ClientInner>,
}

impl RelayTransport {
    pub(crate) fn new(inner: Arc<ClientInner>) -> Self {
        Self { inner }
    }

    /// A dialable address is one containing a `p2p-circuit` component.
    pub fn can_dial(&self, addr: &Multiaddr) -> bool {
        is_relay_addr(addr)
    }

    /// Multiaddr protocol codes handled by this transport.
    pub fn protocols(&self) -> &'static [u32] {
        &[P_CIRCUIT]
    }

    /// Circuit addresses name a destination reached through another
    /// peer; this transport is a proxy.
    pub fn proxy(&self) -> bool {
        true
    }

    /// Dial a full circuit address and upgrade the outbound connection.
    pub async fn dial(&self, addr: &Multiaddr) -> Result<Box<dyn MuxStream>, Error> {
        let (_, destaddr) =
            split_circuit(addr).ok_or_else(|| Error::NotRelayAddr(addr.clone()))?;
        let dest = AddrInfo::from_p2p_addr(&destaddr)?;

        let conn = self.inner.dial(addr, dest.id).await?;
        let upgraded =
            self.inner.upgrader.upgrade_outbound(Box::new(conn), dest.id).await?;
        Ok(upgraded)
    }

    /// Listen on the circuit address, upgrading accepted circuits.
    pub fn listen(&self, addr: &Multiaddr) -> Result<UpgradedListener, Error> {
        if !is_relay_addr(addr) {
            return Err(Error::NotRelayAddr(addr.clone()));
        }
        Ok(UpgradedListener {
            listener: Listener::new(self.inner.clone()),
            inner: self.inner.clone(),
        })
    }
}

/// A circuit listener whose accepted connections pass through the
/// host's upgrader.
pub struct UpgradedListener {
    listener: Listener,
    inner: Arc<ClientInner>,
}

impl UpgradedListener {
    pub async fn accept(&self) -> Result<Box<dyn MuxStream>, Error> {
        let conn = self.listener.accept().await?;
        let upgraded = self.inner.upgrader.upgrade_inbound(Box::new(conn)).await?;
        Ok(upgraded)
    }

    pub fn multiaddr(&self) -> Multiaddr {
        self.listener.multiaddr()
    }
}
