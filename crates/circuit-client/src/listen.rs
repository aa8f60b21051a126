//! Listener for incoming relayed circuits.

use std::sync::Arc;

use multiaddr::Multiaddr;
use tracing::info;

use circuit_core::addr::circuit_addr;
use circuit_core::codec::write_delimited;
use circuit_core::proto::{circuit_relay, CircuitRelay, Status, StopMessage};

use crate::client::{AcceptProto, ClientInner};
use crate::conn::Conn;
use crate::error::Error;

/// Accepts circuits delivered by the stop handlers.
///
/// Accepting writes the deferred success response back to the relay, so
/// the source only observes an open circuit once the application took it.
pub struct Listener {
    inner: Arc<ClientInner>,
}

impl Listener {
    pub(crate) fn new(inner: Arc<ClientInner>) -> Self {
        Self { inner }
    }

    /// Wait for the next incoming circuit.
    pub async fn accept(&self) -> Result<Conn, Error> {
        let (slot, pending) = tokio::sync::oneshot::channel();
        self.inner.waiters_tx.send(slot).map_err(|_| Error::ListenerClosed)?;
        let accept = pending.await.map_err(|_| Error::ListenerClosed)?;

        let mut conn = accept.conn;
        match accept.proto {
            AcceptProto::V1 => {
                write_delimited(&mut conn, &CircuitRelay::status(circuit_relay::Status::Success))
                    .await?
            }
            AcceptProto::V2 => {
                write_delimited(&mut conn, &StopMessage::with_status(Status::Ok)).await?
            }
        }

        info!("accepted relay connection from: {}", conn.remote().id);
        Ok(conn)
    }

    /// The symbolic listen address.
    pub fn multiaddr(&self) -> Multiaddr {
        circuit_addr()
    }
}
