//! The circuit client: reservation holder, relay dialer, and stop-side
//! acceptor.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use tokio::sync::{mpsc, oneshot};

use circuit_core::host::{Host, Upgrader};
use circuit_core::peer::PeerId;
use circuit_core::{PROTO_V1, PROTO_V2_STOP};

use crate::conn::Conn;
use crate::handlers::{StopHandlerV1, StopHandlerV2};
use crate::listen::Listener;
use crate::transport::RelayTransport;

/// Connection-manager tag keeping relays with live circuits pinned.
pub const HOP_TAG: &str = "relay-hop-stream";

/// Which response framing an accepted circuit still owes the relay.
pub(crate) enum AcceptProto {
    V1,
    V2,
}

/// A circuit delivered by a stop handler, waiting for [`Listener::accept`].
pub(crate) struct Accept {
    pub(crate) conn: Conn,
    pub(crate) proto: AcceptProto,
}

/// One in-flight `accept()` call, waiting for a circuit.
pub(crate) type AcceptSlot = oneshot::Sender<Accept>;

pub(crate) struct ClientInner {
    pub(crate) host: Arc<dyn Host>,
    pub(crate) upgrader: Arc<dyn Upgrader>,
    /// Rendezvous with the listener: handlers hand circuits to waiting
    /// `accept()` calls; nothing is buffered.
    pub(crate) waiters_tx: mpsc::UnboundedSender<AcceptSlot>,
    pub(crate) waiters_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<AcceptSlot>>,
    hop_count: Mutex<HashMap<PeerId, u32>>,
    this: Weak<ClientInner>,
}

impl ClientInner {
    pub(crate) fn weak(&self) -> Weak<ClientInner> {
        self.this.clone()
    }

    /// Count a live circuit against `relay`, pinning its connection.
    pub(crate) fn tag_hop(&self, relay: &PeerId) {
        let mut counts = self.hop_count.lock().unwrap();
        let count = counts.entry(*relay).or_insert(0);
        *count += 1;
        self.host.tag_peer(relay, HOP_TAG, *count);
    }

    /// Release one circuit against `relay`; the pin goes away with the
    /// last circuit.
    pub(crate) fn untag_hop(&self, relay: &PeerId) {
        let mut counts = self.hop_count.lock().unwrap();
        match counts.get_mut(relay) {
            Some(count) if *count > 1 => {
                *count -= 1;
                self.host.tag_peer(relay, HOP_TAG, *count);
            }
            Some(_) => {
                counts.remove(relay);
                self.host.untag_peer(relay, HOP_TAG);
            }
            None => {}
        }
    }

    pub(crate) fn hops(&self, relay: &PeerId) -> u32 {
        self.hop_count.lock().unwrap().get(relay).copied().unwrap_or(0)
    }
}

/// The stop/client side of the circuit relay.
pub struct Client {
    pub(crate) inner: Arc<ClientInner>,
}

impl Client {
    /// Attach a client to a host. Call [`Client::start`] to begin
    /// accepting incoming circuits.
    pub fn new(host: Arc<dyn Host>, upgrader: Arc<dyn Upgrader>) -> Self {
        let (waiters_tx, waiters_rx) = mpsc::unbounded_channel();

        let inner = Arc::new_cyclic(|this| ClientInner {
            host,
            upgrader,
            waiters_tx,
            waiters_rx: tokio::sync::Mutex::new(waiters_rx),
            hop_count: Mutex::new(HashMap::new()),
            this: this.clone(),
        });

        Self { inner }
    }

    /// Register the stop-protocol stream handlers (v1 and v2).
    pub fn start(&self) {
        self.inner
            .host
            .set_stream_handler(PROTO_V1, Arc::new(StopHandlerV1(self.inner.clone())));
        self.inner
            .host
            .set_stream_handler(PROTO_V2_STOP, Arc::new(StopHandlerV2(self.inner.clone())));
    }

    /// Remove the stop-protocol handlers.
    pub fn close(&self) {
        self.inner.host.remove_stream_handler(PROTO_V1);
        self.inner.host.remove_stream_handler(PROTO_V2_STOP);
    }

    /// The listener surfacing incoming relayed circuits.
    pub fn listener(&self) -> Listener {
        Listener::new(self.inner.clone())
    }

    /// The transport adapter exposing circuit addresses to the host's
    /// dialer/listener contract.
    pub fn transport(&self) -> RelayTransport {
        RelayTransport::new(self.inner.clone())
    }

    /// Live circuit count through `relay`.
    pub fn hop_count(&self, relay: &PeerId) -> u32 {
        self.inner.hops(relay)
    }
}
