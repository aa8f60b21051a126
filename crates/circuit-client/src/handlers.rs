//! Stop-side stream handlers.
//!
//! The v1 and v2 handlers share semantics: verify the destination is
//! this host, then offer the circuit to the listener. A circuit not
//! accepted within [`ACCEPT_TIMEOUT`] is refused back to the relay. The
//! v1 handler also answers HOP and CAN_HOP: this node relays nothing,
//! so both get `HOP_CANT_SPEAK_RELAY`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::time::timeout;
use tracing::{debug, info};

use circuit_core::codec::{read_delimited, write_delimited};
use circuit_core::host::{MuxStream, StreamHandler};
use circuit_core::proto::{
    circuit_relay, peer_to_addr_info, stop_message, CircuitRelay, Status, StopMessage,
};

use crate::client::{Accept, AcceptProto, ClientInner};
use crate::conn::{Conn, ConnStat};

pub(crate) const STREAM_TIMEOUT: Duration = Duration::from_secs(60);
pub(crate) const ACCEPT_TIMEOUT: Duration = Duration::from_secs(10);

/// Offer a circuit to a waiting `accept()` call. Nothing is buffered:
/// if no accept is in flight within [`ACCEPT_TIMEOUT`], the circuit
/// comes back for refusal.
async fn offer(inner: &ClientInner, mut accept: Accept) -> Result<(), Accept> {
    let deadline = tokio::time::Instant::now() + ACCEPT_TIMEOUT;

    loop {
        let slot = tokio::time::timeout_at(deadline, async {
            let mut waiters = inner.waiters_rx.lock().await;
            waiters.recv().await
        })
        .await;

        match slot {
            Ok(Some(slot)) => match slot.send(accept) {
                Ok(()) => return Ok(()),
                // that accept() call went away; try the next
                Err(returned) => accept = returned,
            },
            Ok(None) | Err(_) => return Err(accept),
        }
    }
}

async fn write_v2_status(mut stream: Box<dyn MuxStream>, status: Status) {
    debug!("stop protocol error: {status:?} ({})", status as i32);
    if write_delimited(&mut stream, &StopMessage::with_status(status)).await.is_err() {
        stream.resetter().reset();
    } else {
        let _ = stream.shutdown().await;
    }
}

async fn write_v1_status(mut stream: Box<dyn MuxStream>, code: circuit_relay::Status) {
    debug!("circuit protocol error: {code:?} ({})", code as i32);
    if write_delimited(&mut stream, &CircuitRelay::status(code)).await.is_err() {
        stream.resetter().reset();
    } else {
        let _ = stream.shutdown().await;
    }
}

pub(crate) struct StopHandlerV2(pub(crate) Arc<ClientInner>);

#[async_trait]
impl StreamHandler for StopHandlerV2 {
    async fn handle(&self, mut stream: Box<dyn MuxStream>) {
        let inner = &self.0;

        let msg: StopMessage = match timeout(STREAM_TIMEOUT, read_delimited(&mut stream)).await {
            Ok(Ok(msg)) => msg,
            _ => {
                write_v2_status(stream, Status::MalformedMessage).await;
                return;
            }
        };

        if msg.msg_type() != Some(stop_message::Type::Connect) {
            write_v2_status(stream, Status::UnexpectedMessage).await;
            return;
        }

        let src = match peer_to_addr_info(msg.peer.as_ref()) {
            Ok(src) => src,
            Err(_) => {
                write_v2_status(stream, Status::MalformedMessage).await;
                return;
            }
        };

        info!("incoming relay connection from: {}", src.id);

        let mut stat = ConnStat::default();
        if let Some(limit) = &msg.limit {
            stat.transient = true;
            stat.limit_duration =
                limit.duration.map(|secs| Duration::from_secs(u64::from(secs)));
            stat.limit_data = limit.data;
        }

        let relay = stream.remote_peer();
        let conn = Conn::new(stream, src, relay, stat, inner.weak());
        let accept = Accept { conn, proto: AcceptProto::V2 };

        if let Err(accept) = offer(inner.as_ref(), accept).await {
            debug!("incoming relay connection not accepted; refusing");
            if let Some(stream) = accept.conn.into_stream() {
                write_v2_status(stream, Status::ConnectionFailed).await;
            }
        }
    }
}

pub(crate) struct StopHandlerV1(pub(crate) Arc<ClientInner>);

#[async_trait]
impl StreamHandler for StopHandlerV1 {
    async fn handle(&self, mut stream: Box<dyn MuxStream>) {
        let inner = &self.0;
        debug!("new relay stream from: {}", stream.remote_peer());

        let msg: CircuitRelay = match timeout(STREAM_TIMEOUT, read_delimited(&mut stream)).await {
            Ok(Ok(msg)) => msg,
            _ => {
                write_v1_status(stream, circuit_relay::Status::MalformedMessage).await;
                return;
            }
        };

        match msg.msg_type() {
            Some(circuit_relay::Type::Stop) => {}
            Some(circuit_relay::Type::Hop) | Some(circuit_relay::Type::CanHop) => {
                write_v1_status(stream, circuit_relay::Status::HopCantSpeakRelay).await;
                return;
            }
            _ => {
                debug!("unexpected relay handshake message");
                write_v1_status(stream, circuit_relay::Status::MalformedMessage).await;
                return;
            }
        }

        let src = match peer_to_addr_info(msg.src_peer.as_ref()) {
            Ok(src) => src,
            Err(_) => {
                write_v1_status(stream, circuit_relay::Status::StopSrcMultiaddrInvalid).await;
                return;
            }
        };

        match peer_to_addr_info(msg.dst_peer.as_ref()) {
            Ok(dst) if dst.id == inner.host.id() => {}
            _ => {
                write_v1_status(stream, circuit_relay::Status::StopDstMultiaddrInvalid).await;
                return;
            }
        }

        info!("incoming relay connection from: {}", src.id);

        let relay = stream.remote_peer();
        let conn = Conn::new(stream, src, relay, ConnStat::default(), inner.weak());
        let accept = Accept { conn, proto: AcceptProto::V1 };

        if let Err(accept) = offer(inner.as_ref(), accept).await {
            debug!("incoming relay connection not accepted; refusing");
            if let Some(stream) = accept.conn.into_stream() {
                write_v1_status(stream, circuit_relay::Status::StopRelayRefused).await;
            }
        }
    }
}
