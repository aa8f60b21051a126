//! Relayed connections.
//!
//! A [`Conn`] wraps the hop/stop stream once the circuit is established.
//! It keeps a back-reference to the client so that closing the circuit
//! releases the per-relay hop count; the reference carries no ownership.

use std::fmt;
use std::io;
use std::pin::Pin;
use std::sync::Weak;
use std::task::{Context, Poll};
use std::time::Duration;

use multiaddr::{Multiaddr, Protocol};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use circuit_core::host::{MuxStream, ProtocolId, Resetter};
use circuit_core::peer::{AddrInfo, PeerId};

use crate::client::ClientInner;

/// Connection metadata; a transient connection is one the relay may cap.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ConnStat {
    pub transient: bool,
    pub limit_duration: Option<Duration>,
    pub limit_data: Option<u64>,
}

/// A live relayed connection to `remote` through `relay`.
pub struct Conn {
    stream: Option<Box<dyn MuxStream>>,
    remote: AddrInfo,
    relay: PeerId,
    stat: ConnStat,
    client: Weak<ClientInner>,
}

impl fmt::Debug for Conn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Conn")
            .field("remote", &self.remote)
            .field("relay", &self.relay)
            .field("stat", &self.stat)
            .finish_non_exhaustive()
    }
}

impl Conn {
    pub(crate) fn new(
        stream: Box<dyn MuxStream>,
        remote: AddrInfo,
        relay: PeerId,
        stat: ConnStat,
        client: Weak<ClientInner>,
    ) -> Self {
        if let Some(inner) = client.upgrade() {
            inner.tag_hop(&relay);
        }
        Self { stream: Some(stream), remote, relay, stat, client }
    }

    /// The destination (dialed) or source (accepted) peer.
    pub fn remote(&self) -> &AddrInfo {
        &self.remote
    }

    /// The relay carrying this circuit.
    pub fn relay(&self) -> PeerId {
        self.relay
    }

    pub fn stat(&self) -> ConnStat {
        self.stat
    }

    /// Hard-close the circuit, discarding unread data.
    pub fn close(&mut self) {
        if let Some(stream) = self.stream.take() {
            stream.resetter().reset();
        }
    }

    pub(crate) fn into_stream(mut self) -> Option<Box<dyn MuxStream>> {
        self.stream.take()
    }

    fn stream_mut(&mut self) -> io::Result<&mut Box<dyn MuxStream>> {
        self.stream.as_mut().ok_or_else(|| io::ErrorKind::NotConnected.into())
    }
}

impl Drop for Conn {
    fn drop(&mut self) {
        if let Some(inner) = self.client.upgrade() {
            inner.untag_hop(&self.relay);
        }
    }
}

impl AsyncRead for Conn {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut().stream_mut() {
            Ok(stream) => Pin::new(stream).poll_read(cx, buf),
            Err(err) => Poll::Ready(Err(err)),
        }
    }
}

impl AsyncWrite for Conn {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut().stream_mut() {
            Ok(stream) => Pin::new(stream).poll_write(cx, data),
            Err(err) => Poll::Ready(Err(err)),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut().stream_mut() {
            Ok(stream) => Pin::new(stream).poll_flush(cx),
            Err(err) => Poll::Ready(Err(err)),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut().stream_mut() {
            Ok(stream) => Pin::new(stream).poll_shutdown(cx),
            Err(err) => Poll::Ready(Err(err)),
        }
    }
}

impl MuxStream for Conn {
    fn remote_peer(&self) -> PeerId {
        self.remote.id
    }

    /// The relay-side address of the circuit:
    /// `<relay transport>/p2p/<relay>/p2p-circuit`.
    fn remote_addr(&self) -> Multiaddr {
        let base = self
            .stream
            .as_ref()
            .map(|s| s.remote_addr())
            .unwrap_or_else(Multiaddr::empty);
        base.with(Protocol::P2p(self.relay.to_multiaddr_peer_id())).with(Protocol::P2pCircuit)
    }

    fn protocol(&self) -> ProtocolId {
        self.stream.as_ref().map(|s| s.protocol()).unwrap_or_default()
    }

    fn resetter(&self) -> Resetter {
        match self.stream.as_ref() {
            Some(stream) => stream.resetter(),
            None => Resetter::new(|| {}),
        }
    }
}
