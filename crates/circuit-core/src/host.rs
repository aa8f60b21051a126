//! Host abstraction.
//!
//! The overlay host (identity, multiplexed streams, peer store,
//! connection manager, transport upgrader) is an external collaborator.
//! These traits are the seam the relay and client are written against;
//! production hosts implement them over a real swarm, and
//! [`crate::testing`] provides an in-memory implementation.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use multiaddr::Multiaddr;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::broadcast;

use crate::peer::PeerId;

/// Identifier of a stream protocol, e.g. `/libp2p/circuit/relay/0.2.0/hop`.
pub type ProtocolId = &'static str;

/// Errors surfaced by host operations.
#[derive(Debug, Error)]
pub enum HostError {
    #[error("peer {0} is not connected")]
    NotConnected(PeerId),

    #[error("unknown peer {0}")]
    UnknownPeer(PeerId),

    #[error("none of the offered protocols is supported: {0:?}")]
    NegotiationFailed(Vec<ProtocolId>),

    #[error("dial timed out")]
    Timeout,

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Connection lifecycle notifications.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PeerEvent {
    Connected(PeerId),
    Disconnected(PeerId),
}

/// Hard-close handle for a stream.
///
/// Cloneable so that both splice directions can abort the pair; resetting
/// discards buffered unread data on both sides.
#[derive(Clone)]
pub struct Resetter(Arc<dyn Fn() + Send + Sync>);

impl Resetter {
    pub fn new(f: impl Fn() + Send + Sync + 'static) -> Self {
        Self(Arc::new(f))
    }

    pub fn reset(&self) {
        (self.0)()
    }
}

impl std::fmt::Debug for Resetter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Resetter")
    }
}

/// One negotiated, bidirectional stream of a multiplexed connection.
///
/// `AsyncWrite::shutdown` is the write half-close; [`MuxStream::resetter`]
/// hands out the hard-close handle.
pub trait MuxStream: AsyncRead + AsyncWrite + Send + Unpin {
    /// The peer on the other end.
    fn remote_peer(&self) -> PeerId;

    /// Observed address of the remote end of the underlying connection.
    fn remote_addr(&self) -> Multiaddr;

    /// The negotiated protocol.
    fn protocol(&self) -> ProtocolId;

    /// Handle that resets the stream: both directions are torn down and
    /// unread data is discarded.
    fn resetter(&self) -> Resetter;
}

/// Handler invoked for each accepted stream of a registered protocol.
/// The host runs every invocation on its own task.
#[async_trait]
pub trait StreamHandler: Send + Sync + 'static {
    async fn handle(&self, stream: Box<dyn MuxStream>);
}

/// Options for opening an outbound stream.
#[derive(Clone, Copy, Debug, Default)]
pub struct DialOpts {
    /// Only reuse an existing connection; never dial the peer.
    pub no_dial: bool,
}

/// The overlay host: identity, streams, peer store, connection manager.
#[async_trait]
pub trait Host: Send + Sync + 'static {
    /// This host's peer ID.
    fn id(&self) -> PeerId;

    /// The host's public listen addresses.
    fn addrs(&self) -> Vec<Multiaddr>;

    /// Open a stream to `peer`, negotiating one of `protocols` in
    /// preference order.
    async fn new_stream(
        &self,
        peer: &PeerId,
        protocols: &[ProtocolId],
        opts: DialOpts,
    ) -> Result<Box<dyn MuxStream>, HostError>;

    /// Register the handler for an inbound protocol.
    fn set_stream_handler(&self, protocol: ProtocolId, handler: Arc<dyn StreamHandler>);

    /// Remove a previously registered handler.
    fn remove_stream_handler(&self, protocol: ProtocolId);

    /// Record addresses for a peer in the peer store.
    fn add_addrs(&self, peer: &PeerId, addrs: &[Multiaddr], ttl: Duration);

    /// Whether there is a live connection to `peer`.
    fn is_connected(&self, peer: &PeerId) -> bool;

    /// Pin the connection to `peer` in the connection manager.
    fn tag_peer(&self, peer: &PeerId, tag: &'static str, weight: u32);

    /// Drop a pin set by [`Host::tag_peer`].
    fn untag_peer(&self, peer: &PeerId, tag: &'static str);

    /// Subscribe to connect/disconnect notifications.
    fn subscribe_peer_events(&self) -> broadcast::Receiver<PeerEvent>;
}

/// Transport upgrader: promotes a raw relayed stream into a secure,
/// multiplexed connection. Implementations belong to the host; this
/// workspace only threads the upgrader through the listener path.
#[async_trait]
pub trait Upgrader: Send + Sync + 'static {
    async fn upgrade_inbound(
        &self,
        conn: Box<dyn MuxStream>,
    ) -> Result<Box<dyn MuxStream>, HostError>;

    async fn upgrade_outbound(
        &self,
        conn: Box<dyn MuxStream>,
        remote: PeerId,
    ) -> Result<Box<dyn MuxStream>, HostError>;
}

/// Peer-store TTL used for addresses learned from dial requests.
pub const TEMP_ADDR_TTL: Duration = Duration::from_secs(2 * 60);
