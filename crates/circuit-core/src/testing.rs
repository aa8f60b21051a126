//! In-memory host for exercising the relay protocols without a network.
//!
//! [`MemoryNetwork`] wires [`MemoryHost`]s together; streams are backed
//! by in-process pipes with real half-close and reset semantics (a reset
//! discards buffered unread data and fails subsequent reads and writes
//! with `ConnectionReset`).

use std::collections::{HashMap, VecDeque};
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::task::{Context, Poll, Waker};
use std::time::Duration;

use async_trait::async_trait;
use multiaddr::{Multiaddr, Protocol};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::broadcast;
use tracing::debug;

use crate::host::{
    DialOpts, Host, HostError, MuxStream, PeerEvent, ProtocolId, Resetter, StreamHandler, Upgrader,
};
use crate::peer::PeerId;

/// One direction of an in-memory stream.
struct Pipe {
    inner: Mutex<PipeInner>,
}

struct PipeInner {
    buf: VecDeque<u8>,
    /// Writer half-closed: readers drain the buffer, then see EOF.
    closed: bool,
    /// Hard reset: reads and writes fail immediately, buffer discarded.
    reset: bool,
    /// Reader end dropped: writes fail with `BrokenPipe`.
    reader_gone: bool,
    read_waker: Option<Waker>,
}

impl Pipe {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(PipeInner {
                buf: VecDeque::new(),
                closed: false,
                reset: false,
                reader_gone: false,
                read_waker: None,
            }),
        })
    }

    fn reset(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.reset = true;
        inner.buf.clear();
        if let Some(w) = inner.read_waker.take() {
            w.wake();
        }
    }
}

/// An in-memory [`MuxStream`].
pub struct MemoryStream {
    read: Arc<Pipe>,
    write: Arc<Pipe>,
    remote_peer: PeerId,
    remote_addr: Multiaddr,
    protocol: ProtocolId,
}

impl MemoryStream {
    /// A connected pair of streams, for tests that drive both ends directly.
    pub fn pair(
        a_peer: PeerId,
        a_addr: Multiaddr,
        b_peer: PeerId,
        b_addr: Multiaddr,
        protocol: ProtocolId,
    ) -> (MemoryStream, MemoryStream) {
        let ab = Pipe::new();
        let ba = Pipe::new();

        let a = MemoryStream {
            read: ba.clone(),
            write: ab.clone(),
            remote_peer: b_peer,
            remote_addr: b_addr,
            protocol,
        };
        let b = MemoryStream {
            read: ab,
            write: ba,
            remote_peer: a_peer,
            remote_addr: a_addr,
            protocol,
        };
        (a, b)
    }
}

impl AsyncRead for MemoryStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        out: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let mut inner = self.read.inner.lock().unwrap();

        if inner.reset {
            return Poll::Ready(Err(io::ErrorKind::ConnectionReset.into()));
        }
        if !inner.buf.is_empty() {
            let n = out.remaining().min(inner.buf.len());
            let chunk: Vec<u8> = inner.buf.drain(..n).collect();
            out.put_slice(&chunk);
            return Poll::Ready(Ok(()));
        }
        if inner.closed {
            return Poll::Ready(Ok(()));
        }

        inner.read_waker = Some(cx.waker().clone());
        Poll::Pending
    }
}

impl AsyncWrite for MemoryStream {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<io::Result<usize>> {
        let mut inner = self.write.inner.lock().unwrap();

        if inner.reset {
            return Poll::Ready(Err(io::ErrorKind::ConnectionReset.into()));
        }
        if inner.closed || inner.reader_gone {
            return Poll::Ready(Err(io::ErrorKind::BrokenPipe.into()));
        }

        inner.buf.extend(data);
        if let Some(w) = inner.read_waker.take() {
            w.wake();
        }
        Poll::Ready(Ok(data.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let mut inner = self.write.inner.lock().unwrap();
        inner.closed = true;
        if let Some(w) = inner.read_waker.take() {
            w.wake();
        }
        Poll::Ready(Ok(()))
    }
}

impl MuxStream for MemoryStream {
    fn remote_peer(&self) -> PeerId {
        self.remote_peer
    }

    fn remote_addr(&self) -> Multiaddr {
        self.remote_addr.clone()
    }

    fn protocol(&self) -> ProtocolId {
        self.protocol
    }

    fn resetter(&self) -> Resetter {
        let read = self.read.clone();
        let write = self.write.clone();
        Resetter::new(move || {
            read.reset();
            write.reset();
        })
    }
}

impl Drop for MemoryStream {
    fn drop(&mut self) {
        // EOF for the peer's reader, BrokenPipe for the peer's writer.
        {
            let mut inner = self.write.inner.lock().unwrap();
            inner.closed = true;
            if let Some(w) = inner.read_waker.take() {
                w.wake();
            }
        }
        let mut inner = self.read.inner.lock().unwrap();
        inner.reader_gone = true;
    }
}

struct HostState {
    handlers: HashMap<ProtocolId, Arc<dyn StreamHandler>>,
    /// Connected peer -> the address we observe for it.
    connected: HashMap<PeerId, Multiaddr>,
    peerstore: HashMap<PeerId, Vec<Multiaddr>>,
    tags: HashMap<PeerId, HashMap<&'static str, u32>>,
}

/// In-memory host attached to a [`MemoryNetwork`].
pub struct MemoryHost {
    id: PeerId,
    addr: Multiaddr,
    network: Weak<MemoryNetwork>,
    state: Mutex<HostState>,
    events: broadcast::Sender<PeerEvent>,
}

impl MemoryHost {
    /// Protocols this host currently has handlers for, in no particular order.
    pub fn handled_protocols(&self) -> Vec<ProtocolId> {
        self.state.lock().unwrap().handlers.keys().copied().collect()
    }

    /// Current weight of a connection-manager tag, if set.
    pub fn tag_weight(&self, peer: &PeerId, tag: &'static str) -> Option<u32> {
        self.state
            .lock()
            .unwrap()
            .tags
            .get(peer)
            .and_then(|t| t.get(tag))
            .copied()
    }

    fn select_protocol(&self, offered: &[ProtocolId]) -> Option<ProtocolId> {
        let state = self.state.lock().unwrap();
        offered.iter().copied().find(|p| state.handlers.contains_key(p))
    }

    fn handler_for(&self, protocol: ProtocolId) -> Option<Arc<dyn StreamHandler>> {
        self.state.lock().unwrap().handlers.get(protocol).cloned()
    }
}

#[async_trait]
impl Host for MemoryHost {
    fn id(&self) -> PeerId {
        self.id
    }

    fn addrs(&self) -> Vec<Multiaddr> {
        vec![self.addr.clone()]
    }

    async fn new_stream(
        &self,
        peer: &PeerId,
        protocols: &[ProtocolId],
        opts: DialOpts,
    ) -> Result<Box<dyn MuxStream>, HostError> {
        let network = self.network.upgrade().ok_or(HostError::UnknownPeer(*peer))?;

        if !self.is_connected(peer) {
            if opts.no_dial {
                return Err(HostError::NotConnected(*peer));
            }
            let known = !self
                .state
                .lock()
                .unwrap()
                .peerstore
                .get(peer)
                .map(|a| a.is_empty())
                .unwrap_or(true);
            if !known {
                return Err(HostError::UnknownPeer(*peer));
            }
            let target = network.get(peer).ok_or(HostError::UnknownPeer(*peer))?;
            let this = network.get(&self.id).ok_or(HostError::UnknownPeer(self.id))?;
            MemoryNetwork::connect(&this, &target).await;
        }

        let target = network.get(peer).ok_or(HostError::UnknownPeer(*peer))?;
        let protocol = target
            .select_protocol(protocols)
            .ok_or_else(|| HostError::NegotiationFailed(protocols.to_vec()))?;
        let handler = target
            .handler_for(protocol)
            .ok_or_else(|| HostError::NegotiationFailed(protocols.to_vec()))?;

        let (local, remote) =
            MemoryStream::pair(self.id, self.addr.clone(), target.id, target.addr.clone(), protocol);

        debug!("new {protocol} stream {} -> {}", self.id, target.id);
        tokio::spawn(async move {
            handler.handle(Box::new(remote)).await;
        });

        Ok(Box::new(local))
    }

    fn set_stream_handler(&self, protocol: ProtocolId, handler: Arc<dyn StreamHandler>) {
        self.state.lock().unwrap().handlers.insert(protocol, handler);
    }

    fn remove_stream_handler(&self, protocol: ProtocolId) {
        self.state.lock().unwrap().handlers.remove(protocol);
    }

    fn add_addrs(&self, peer: &PeerId, addrs: &[Multiaddr], _ttl: Duration) {
        let mut state = self.state.lock().unwrap();
        let known = state.peerstore.entry(*peer).or_default();
        for addr in addrs {
            if !known.contains(addr) {
                known.push(addr.clone());
            }
        }
    }

    fn is_connected(&self, peer: &PeerId) -> bool {
        self.state.lock().unwrap().connected.contains_key(peer)
    }

    fn tag_peer(&self, peer: &PeerId, tag: &'static str, weight: u32) {
        self.state
            .lock()
            .unwrap()
            .tags
            .entry(*peer)
            .or_default()
            .insert(tag, weight);
    }

    fn untag_peer(&self, peer: &PeerId, tag: &'static str) {
        let mut state = self.state.lock().unwrap();
        if let Some(tags) = state.tags.get_mut(peer) {
            tags.remove(tag);
            if tags.is_empty() {
                state.tags.remove(peer);
            }
        }
    }

    fn subscribe_peer_events(&self) -> broadcast::Receiver<PeerEvent> {
        self.events.subscribe()
    }
}

/// Registry wiring memory hosts together.
pub struct MemoryNetwork {
    hosts: Mutex<HashMap<PeerId, Weak<MemoryHost>>>,
    next_ip: AtomicU8,
}

impl MemoryNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self { hosts: Mutex::new(HashMap::new()), next_ip: AtomicU8::new(1) })
    }

    /// Create a host with an auto-assigned loopback address.
    pub fn add_host(self: &Arc<Self>, id: PeerId) -> Arc<MemoryHost> {
        let n = self.next_ip.fetch_add(1, Ordering::Relaxed);
        let addr = Multiaddr::empty()
            .with(Protocol::Ip4([127, 0, 0, n].into()))
            .with(Protocol::Tcp(4001));
        self.add_host_with_addr(id, addr)
    }

    /// Create a host with an explicit listen address.
    pub fn add_host_with_addr(self: &Arc<Self>, id: PeerId, addr: Multiaddr) -> Arc<MemoryHost> {
        let (events, _) = broadcast::channel(64);
        let host = Arc::new(MemoryHost {
            id,
            addr,
            network: Arc::downgrade(self),
            state: Mutex::new(HostState {
                handlers: HashMap::new(),
                connected: HashMap::new(),
                peerstore: HashMap::new(),
                tags: HashMap::new(),
            }),
            events,
        });
        self.hosts.lock().unwrap().insert(id, Arc::downgrade(&host));
        host
    }

    fn get(&self, id: &PeerId) -> Option<Arc<MemoryHost>> {
        self.hosts.lock().unwrap().get(id).and_then(Weak::upgrade)
    }

    /// Connect two hosts, notifying both sides.
    pub async fn connect(a: &Arc<MemoryHost>, b: &Arc<MemoryHost>) {
        debug!("connecting {} <-> {}", a.id, b.id);
        a.state.lock().unwrap().connected.insert(b.id, b.addr.clone());
        b.state.lock().unwrap().connected.insert(a.id, a.addr.clone());
        let _ = a.events.send(PeerEvent::Connected(b.id));
        let _ = b.events.send(PeerEvent::Connected(a.id));
    }

    /// Tear down the connection between two hosts, notifying both sides.
    pub async fn disconnect(a: &Arc<MemoryHost>, b: &Arc<MemoryHost>) {
        debug!("disconnecting {} <-> {}", a.id, b.id);
        a.state.lock().unwrap().connected.remove(&b.id);
        b.state.lock().unwrap().connected.remove(&a.id);
        let _ = a.events.send(PeerEvent::Disconnected(b.id));
        let _ = b.events.send(PeerEvent::Disconnected(a.id));
    }
}

/// Pass-through upgrader for tests.
pub struct PlainUpgrader;

#[async_trait]
impl Upgrader for PlainUpgrader {
    async fn upgrade_inbound(
        &self,
        conn: Box<dyn MuxStream>,
    ) -> Result<Box<dyn MuxStream>, HostError> {
        Ok(conn)
    }

    async fn upgrade_outbound(
        &self,
        conn: Box<dyn MuxStream>,
        _remote: PeerId,
    ) -> Result<Box<dyn MuxStream>, HostError> {
        Ok(conn)
    }
}
