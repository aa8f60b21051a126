//! The relay (hop) engine.
//!
//! Lifecycle of a HOP stream:
//!
//! ```text
//! INIT --read frame (1 min)--> RESERVE | CONNECT
//! RESERVE: ACL -> refresh throttle -> caps/constraints -> commit -> OK
//! CONNECT: ACL -> reservation check -> circuit counters -> STOP
//!          handshake to dest (30 s open, 1 min handshake) -> OK -> splice
//! ```
//!
//! All protocol violations are answered on the wire as a STATUS frame
//! and logged locally at debug level; they are never surfaced as errors.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
// reservation expiry is measured on the tokio clock
use tokio::time::{timeout, Instant};
use tracing::{debug, info, warn};

use circuit_core::codec::{read_delimited, write_delimited};
use circuit_core::host::{DialOpts, Host, MuxStream, PeerEvent, Resetter, StreamHandler};
use circuit_core::peer::{AddrInfo, PeerId};
use circuit_core::proto::{
    addr_info_to_peer, hop_message, peer_to_addr_info, stop_message, HopMessage, Limit,
    Reservation, Status, StopMessage,
};
use circuit_core::{PROTO_V2_HOP, PROTO_V2_STOP};
use circuit_crypto::identity::IdentityKeypair;
use circuit_crypto::voucher::ReservationVoucher;

use crate::acl::Acl;
use crate::constraints::{AsnLookup, Constraints};
use crate::pool::CopyBufferPool;
use crate::resources::{RelayLimit, Resources};

/// Connection-manager tag pinning reserved peers' connections.
pub const RESERVATION_TAG: &str = "relay-reservation";
pub const RESERVATION_TAG_WEIGHT: u32 = 10;

const STREAM_TIMEOUT: Duration = Duration::from_secs(60);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const GC_INTERVAL: Duration = Duration::from_secs(60);
const MAX_POOLED_BUFFERS: usize = 64;

/// Relay construction errors.
#[derive(Debug, Error)]
pub enum SetupError {
    #[error("voucher signing key does not match the host identity")]
    KeyMismatch,
}

/// Constructor options for [`Relay`].
pub struct RelayConfig {
    pub resources: Resources,
    /// Access control; absent means allow everything.
    pub acl: Option<Arc<dyn Acl>>,
    /// Signs reservation vouchers. Must match the host identity; when
    /// absent, reservations carry no voucher.
    pub keypair: Option<Arc<IdentityKeypair>>,
    /// ASN lookup for the per-ASN reservation constraint.
    pub asn_lookup: Option<Arc<dyn AsnLookup>>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self { resources: Resources::default(), acl: None, keypair: None, asn_lookup: None }
    }
}

impl RelayConfig {
    pub fn with_resources(mut self, resources: Resources) -> Self {
        self.resources = resources;
        self
    }

    pub fn with_limit(mut self, limit: Option<RelayLimit>) -> Self {
        self.resources.limit = limit;
        self
    }

    pub fn with_acl(mut self, acl: Arc<dyn Acl>) -> Self {
        self.acl = Some(acl);
        self
    }

    pub fn with_keypair(mut self, keypair: Arc<IdentityKeypair>) -> Self {
        self.keypair = Some(keypair);
        self
    }

    pub fn with_asn_lookup(mut self, lookup: Arc<dyn AsnLookup>) -> Self {
        self.asn_lookup = Some(lookup);
        self
    }
}

struct State {
    rsvp: HashMap<PeerId, Instant>,
    refresh: HashMap<PeerId, Instant>,
    conns: HashMap<PeerId, u32>,
    constraints: Constraints,
}

impl State {
    fn add_conn(&mut self, peer: &PeerId, max: u32) -> bool {
        let count = self.conns.entry(*peer).or_insert(0);
        if *count >= max {
            return false;
        }
        *count += 1;
        true
    }

    fn rm_conn(&mut self, peer: &PeerId) {
        if let Some(count) = self.conns.get_mut(peer) {
            *count = count.saturating_sub(1);
        }
    }
}

struct Inner {
    host: Arc<dyn Host>,
    rc: Resources,
    acl: Option<Arc<dyn Acl>>,
    keypair: Option<Arc<IdentityKeypair>>,
    state: Mutex<State>,
    pool: CopyBufferPool,
    closed: AtomicBool,
}

/// The hop-side relay service.
pub struct Relay {
    inner: Arc<Inner>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Relay {
    /// A relay with default resources and no ACL.
    pub fn new(host: Arc<dyn Host>) -> Result<Self, SetupError> {
        Self::with_config(host, RelayConfig::default())
    }

    pub fn with_config(host: Arc<dyn Host>, config: RelayConfig) -> Result<Self, SetupError> {
        if let Some(keypair) = &config.keypair {
            if keypair.peer_id() != host.id() {
                return Err(SetupError::KeyMismatch);
            }
        }

        let constraints = match &config.asn_lookup {
            Some(lookup) => Constraints::with_asn_lookup(&config.resources, lookup.clone()),
            None => Constraints::new(&config.resources),
        };

        let inner = Arc::new(Inner {
            rc: config.resources.clone(),
            acl: config.acl,
            keypair: config.keypair,
            state: Mutex::new(State {
                rsvp: HashMap::new(),
                refresh: HashMap::new(),
                conns: HashMap::new(),
                constraints,
            }),
            pool: CopyBufferPool::new(config.resources.buffer_size, MAX_POOLED_BUFFERS),
            closed: AtomicBool::new(false),
            host: host.clone(),
        });

        host.set_stream_handler(PROTO_V2_HOP, Arc::new(HopHandler(inner.clone())));

        let gc_inner = inner.clone();
        let gc_task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(GC_INTERVAL);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                gc_inner.gc();
            }
        });

        let ev_inner = inner.clone();
        let mut events = host.subscribe_peer_events();
        let ev_task = tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(PeerEvent::Disconnected(peer)) => ev_inner.peer_disconnected(&peer),
                    Ok(PeerEvent::Connected(_)) => {}
                    Err(RecvError::Lagged(_)) => continue,
                    Err(RecvError::Closed) => break,
                }
            }
        });

        Ok(Self { inner, tasks: Mutex::new(vec![gc_task, ev_task]) })
    }

    /// Stop serving: remove the stream handler, stop background tasks,
    /// and drop all reservations. Idempotent.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.host.remove_stream_handler(PROTO_V2_HOP);

        for task in self.tasks.lock().unwrap().drain(..) {
            task.abort();
        }

        let peers: Vec<PeerId> = {
            let mut state = self.inner.state.lock().unwrap();
            state.refresh.clear();
            state.rsvp.drain().map(|(p, _)| p).collect()
        };
        for peer in peers {
            self.inner.host.untag_peer(&peer, RESERVATION_TAG);
        }
        info!("relay closed");
    }

    /// Number of live reservations.
    pub fn reservation_count(&self) -> usize {
        self.inner.state.lock().unwrap().rsvp.len()
    }

    /// Whether `peer` currently holds a reservation.
    pub fn is_reserved(&self, peer: &PeerId) -> bool {
        self.inner.state.lock().unwrap().rsvp.contains_key(peer)
    }

    /// Live circuit count for `peer` (counted on both circuit ends).
    pub fn circuit_count(&self, peer: &PeerId) -> u32 {
        self.inner.state.lock().unwrap().conns.get(peer).copied().unwrap_or(0)
    }
}

impl Drop for Relay {
    fn drop(&mut self) {
        self.close();
    }
}

struct HopHandler(Arc<Inner>);

#[async_trait]
impl StreamHandler for HopHandler {
    async fn handle(&self, stream: Box<dyn MuxStream>) {
        if self.0.closed.load(Ordering::SeqCst) {
            stream.resetter().reset();
            return;
        }
        self.0.clone().handle_hop(stream).await;
    }
}

impl Inner {
    async fn handle_hop(self: Arc<Self>, mut stream: Box<dyn MuxStream>) {
        info!("new relay stream from: {}", stream.remote_peer());

        let msg: HopMessage =
            match timeout(STREAM_TIMEOUT, read_delimited(&mut stream)).await {
                Ok(Ok(msg)) => msg,
                _ => {
                    self.handle_error(stream, Status::MalformedMessage).await;
                    return;
                }
            };

        match msg.msg_type() {
            Some(hop_message::Type::Reserve) => self.handle_reserve(stream).await,
            Some(hop_message::Type::Connect) => self.handle_connect(stream, msg).await,
            _ => self.handle_error(stream, Status::UnexpectedMessage).await,
        }
    }

    async fn handle_reserve(self: Arc<Self>, mut stream: Box<dyn MuxStream>) {
        let peer = stream.remote_peer();
        let addr = stream.remote_addr();

        if let Some(acl) = &self.acl {
            if !acl.allow_reserve(&peer, &addr) {
                debug!("refusing relay reservation for {peer}; permission denied");
                self.handle_error(stream, Status::PermissionDenied).await;
                return;
            }
        }

        let now = Instant::now();
        enum ReserveOutcome {
            Event(crate::constraints::EventId),
            Refused,
            TooManyReservations,
            ConstraintError(crate::constraints::ConstraintError),
        }

        let outcome = {
            let mut state = self.state.lock().unwrap();

            if let Some(refresh) = state.refresh.get(&peer).copied() {
                if refresh > now {
                    // peer is refreshing too fast; push the throttle out
                    state.refresh.insert(peer, refresh + self.rc.reservation_refresh_ttl);
                    ReserveOutcome::Refused
                } else if state.rsvp.len() >= self.rc.max_reservations {
                    ReserveOutcome::TooManyReservations
                } else {
                    match state.constraints.add_reservation(peer, &addr) {
                        Ok(event) => {
                            state.rsvp.insert(peer, now + self.rc.reservation_ttl);
                            state.refresh.insert(peer, now + self.rc.reservation_refresh_ttl);
                            ReserveOutcome::Event(event)
                        }
                        Err(err) => ReserveOutcome::ConstraintError(err),
                    }
                }
            } else if state.rsvp.len() >= self.rc.max_reservations {
                ReserveOutcome::TooManyReservations
            } else {
                match state.constraints.add_reservation(peer, &addr) {
                    Ok(event) => {
                        state.rsvp.insert(peer, now + self.rc.reservation_ttl);
                        state.refresh.insert(peer, now + self.rc.reservation_refresh_ttl);
                        ReserveOutcome::Event(event)
                    }
                    Err(err) => ReserveOutcome::ConstraintError(err),
                }
            }
        };

        let event = match outcome {
            ReserveOutcome::Event(event) => event,
            ReserveOutcome::Refused => {
                debug!("refusing relay reservation for {peer}; refreshing too fast");
                self.handle_error(stream, Status::ReservationRefused).await;
                return;
            }
            ReserveOutcome::TooManyReservations => {
                debug!("refusing relay reservation for {peer}; too many reservations");
                self.handle_error(stream, Status::ResourceLimitExceeded).await;
                return;
            }
            ReserveOutcome::ConstraintError(err) => {
                debug!("refusing relay reservation for {peer}; {err}");
                self.handle_error(stream, Status::ResourceLimitExceeded).await;
                return;
            }
        };

        self.host.tag_peer(&peer, RESERVATION_TAG, RESERVATION_TAG_WEIGHT);
        debug!("reserving relay slot for {peer}");

        let response = HopMessage {
            r#type: Some(hop_message::Type::Status as i32),
            status: Some(Status::Ok as i32),
            reservation: Some(self.make_reservation(peer)),
            limit: self.make_limit(),
            peer: None,
        };

        if write_delimited(&mut stream, &response).await.is_err() {
            stream.resetter().reset();
            debug!("error writing reservation response; retracting reservation for {peer}");
            {
                let mut state = self.state.lock().unwrap();
                state.rsvp.remove(&peer);
                state.constraints.remove_event(event);
            }
            self.host.untag_peer(&peer, RESERVATION_TAG);
            return;
        }

        let _ = stream.shutdown().await;
    }

    async fn handle_connect(self: Arc<Self>, mut stream: Box<dyn MuxStream>, msg: HopMessage) {
        let src = stream.remote_peer();
        let src_addr = stream.remote_addr();

        let dest = match peer_to_addr_info(msg.peer.as_ref()) {
            Ok(dest) => dest,
            Err(_) => {
                self.handle_error(stream, Status::MalformedMessage).await;
                return;
            }
        };

        if let Some(acl) = &self.acl {
            if !acl.allow_connect(&src, &src_addr, &dest.id) {
                debug!("refusing connection from {src} to {}; permission denied", dest.id);
                self.handle_error(stream, Status::PermissionDenied).await;
                return;
            }
        }

        enum ConnectOutcome {
            Ok,
            NoReservation,
            TooManyCircuitsFromSrc,
            TooManyCircuitsToDest,
        }

        let connect_outcome = {
            let mut state = self.state.lock().unwrap();

            if !state.rsvp.contains_key(&dest.id) {
                ConnectOutcome::NoReservation
            } else if !state.add_conn(&src, self.rc.max_circuits) {
                ConnectOutcome::TooManyCircuitsFromSrc
            } else if !state.add_conn(&dest.id, self.rc.max_circuits) {
                state.rm_conn(&src);
                ConnectOutcome::TooManyCircuitsToDest
            } else {
                ConnectOutcome::Ok
            }
        };

        match connect_outcome {
            ConnectOutcome::Ok => {}
            ConnectOutcome::NoReservation => {
                debug!("refusing connection from {src} to {}; no reservation", dest.id);
                self.handle_error(stream, Status::NoReservation).await;
                return;
            }
            ConnectOutcome::TooManyCircuitsFromSrc => {
                debug!("refusing connection from {src}; too many circuits");
                self.handle_error(stream, Status::ResourceLimitExceeded).await;
                return;
            }
            ConnectOutcome::TooManyCircuitsToDest => {
                debug!("refusing connection to {}; too many circuits", dest.id);
                self.handle_error(stream, Status::ResourceLimitExceeded).await;
                return;
            }
        }

        let mut stop = match timeout(
            CONNECT_TIMEOUT,
            self.host.new_stream(&dest.id, &[PROTO_V2_STOP], DialOpts { no_dial: true }),
        )
        .await
        {
            Ok(Ok(stop)) => stop,
            Ok(Err(err)) => {
                debug!("error opening relay stream to {}: {err}", dest.id);
                self.release_circuit(&src, &dest.id);
                self.handle_error(stream, Status::ConnectionFailed).await;
                return;
            }
            Err(_) => {
                debug!("timed out opening relay stream to {}", dest.id);
                self.release_circuit(&src, &dest.id);
                self.handle_error(stream, Status::ConnectionFailed).await;
                return;
            }
        };

        let handshake = timeout(STREAM_TIMEOUT, async {
            let connect = StopMessage::connect(addr_info_to_peer(&AddrInfo::with_addrs(
                src,
                vec![src_addr.clone()],
            )));
            write_delimited(&mut stop, &connect).await?;
            read_delimited::<StopMessage, _>(&mut stop).await
        })
        .await;

        let accepted = match handshake {
            Ok(Ok(reply)) => {
                reply.msg_type() == Some(stop_message::Type::Status)
                    && reply.status_code() == Some(Status::Ok)
            }
            _ => false,
        };
        if !accepted {
            debug!("stop handshake with {} failed", dest.id);
            stop.resetter().reset();
            self.release_circuit(&src, &dest.id);
            self.handle_error(stream, Status::ConnectionFailed).await;
            return;
        }

        let response = HopMessage {
            r#type: Some(hop_message::Type::Status as i32),
            status: Some(Status::Ok as i32),
            limit: self.make_limit(),
            reservation: None,
            peer: None,
        };
        if write_delimited(&mut stream, &response).await.is_err() {
            debug!("error writing relay response to {src}");
            stream.resetter().reset();
            stop.resetter().reset();
            self.release_circuit(&src, &dest.id);
            return;
        }

        info!("relaying connection between {src} and {}", dest.id);
        self.splice(stream, stop, src, dest.id);
    }

    async fn handle_error(&self, mut stream: Box<dyn MuxStream>, status: Status) {
        warn!("relay error: {status:?} ({})", status as i32);
        let msg = HopMessage::with_status(status);
        if write_delimited(&mut stream, &msg).await.is_err() {
            stream.resetter().reset();
        } else {
            let _ = stream.shutdown().await;
        }
    }

    fn make_reservation(&self, peer: PeerId) -> Reservation {
        let info = AddrInfo::with_addrs(self.host.id(), self.host.addrs());

        let voucher = self.keypair.as_ref().and_then(|keypair| {
            let expire = SystemTime::now() + self.rc.reservation_ttl;
            let expire = expire.duration_since(UNIX_EPOCH).unwrap_or_default().as_secs();
            let mut voucher = ReservationVoucher::new(self.host.id(), peer, expire);
            voucher.sign(keypair).ok()?;
            voucher.marshal().ok()
        });

        Reservation {
            expire: None,
            ttl: Some(self.rc.reservation_ttl.as_secs() as u32),
            relay: Some(addr_info_to_peer(&info)),
            addrs: Vec::new(),
            voucher,
        }
    }

    fn make_limit(&self) -> Option<Limit> {
        self.rc.limit.as_ref().map(|limit| Limit {
            duration: Some(limit.duration.as_secs() as u32),
            data: Some(limit.data),
        })
    }

    fn release_circuit(&self, src: &PeerId, dest: &PeerId) {
        let mut state = self.state.lock().unwrap();
        state.rm_conn(src);
        state.rm_conn(dest);
    }

    fn splice(
        self: Arc<Self>,
        src: Box<dyn MuxStream>,
        dest: Box<dyn MuxStream>,
        src_id: PeerId,
        dest_id: PeerId,
    ) {
        let limit = self.rc.limit.clone();
        let deadline = limit.as_ref().map(|l| Instant::now() + l.duration);
        let src_reset = src.resetter();
        let dest_reset = dest.resetter();

        let (src_read, src_write) = tokio::io::split(src);
        let (dest_read, dest_write) = tokio::io::split(dest);

        // Both directions share the counter; the last one to finish
        // releases the circuit.
        let pending = Arc::new(AtomicUsize::new(2));

        for (read, write) in [
            (Box::new(src_read) as Box<dyn AsyncRead + Send + Unpin>,
             Box::new(dest_write) as Box<dyn AsyncWrite + Send + Unpin>),
            (Box::new(dest_read) as Box<dyn AsyncRead + Send + Unpin>,
             Box::new(src_write) as Box<dyn AsyncWrite + Send + Unpin>),
        ] {
            let inner = self.clone();
            let limit = limit.clone();
            let resets = (src_reset.clone(), dest_reset.clone());
            let pending = pending.clone();

            tokio::spawn(async move {
                let copied = inner.copy_direction(read, write, limit, deadline, resets).await;
                if pending.fetch_sub(1, Ordering::SeqCst) == 1 {
                    inner.release_circuit(&src_id, &dest_id);
                    debug!("circuit between {src_id} and {dest_id} closed ({copied} bytes last leg)");
                }
            });
        }
    }

    async fn copy_direction(
        &self,
        mut read: Box<dyn AsyncRead + Send + Unpin>,
        mut write: Box<dyn AsyncWrite + Send + Unpin>,
        limit: Option<RelayLimit>,
        deadline: Option<Instant>,
        (src_reset, dest_reset): (Resetter, Resetter),
    ) -> u64 {
        let mut buf = self.pool.acquire();
        let cap = limit.map(|l| l.data);

        let outcome = match deadline {
            Some(deadline) => {
                match tokio::time::timeout_at(deadline, copy_capped(&mut read, &mut write, &mut buf, cap))
                    .await
                {
                    Ok(outcome) => outcome,
                    Err(_) => CopyOutcome::Failed(0),
                }
            }
            None => copy_capped(&mut read, &mut write, &mut buf, cap).await,
        };

        self.pool.release(buf);

        match outcome {
            CopyOutcome::Eof(copied) => {
                // Half-close our write side; the read side stops with us.
                let _ = write.shutdown().await;
                copied
            }
            CopyOutcome::Failed(copied) => {
                src_reset.reset();
                dest_reset.reset();
                copied
            }
        }
    }

    fn gc(&self) {
        let now = Instant::now();
        let expired: Vec<PeerId> = {
            let mut state = self.state.lock().unwrap();

            let mut expired = Vec::new();
            state.rsvp.retain(|peer, expiry| {
                if *expiry <= now {
                    expired.push(*peer);
                    false
                } else {
                    true
                }
            });

            let State { rsvp, refresh, conns, .. } = &mut *state;
            refresh.retain(|peer, throttle| rsvp.contains_key(peer) || *throttle > now);
            conns.retain(|_, count| *count > 0);

            expired
        };

        for peer in expired {
            self.host.untag_peer(&peer, RESERVATION_TAG);
            debug!("relay reservation for {peer} expired");
        }
    }

    fn peer_disconnected(&self, peer: &PeerId) {
        if self.host.is_connected(peer) {
            return;
        }

        let removed = {
            let mut state = self.state.lock().unwrap();
            let removed = state.rsvp.remove(peer).is_some();
            if removed {
                state.refresh.remove(peer);
                state.constraints.remove_reservation(peer);
            }
            removed
        };

        if removed {
            self.host.untag_peer(peer, RESERVATION_TAG);
            debug!("removed relay reservation for disconnected peer {peer}");
        }
    }
}

enum CopyOutcome {
    /// Source reached a clean EOF (possibly exactly at the byte cap).
    Eof(u64),
    /// Read/write error, or data beyond the byte cap.
    Failed(u64),
}

async fn copy_capped<R, W>(
    read: &mut R,
    write: &mut W,
    buf: &mut [u8],
    cap: Option<u64>,
) -> CopyOutcome
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut copied: u64 = 0;

    loop {
        let want = match cap {
            Some(cap) if copied == cap => {
                // Probe one byte past the cap: data there means the
                // source exceeded its budget.
                let mut probe = [0u8; 1];
                return match read.read(&mut probe).await {
                    Ok(0) => CopyOutcome::Eof(copied),
                    _ => CopyOutcome::Failed(copied),
                };
            }
            Some(cap) => buf.len().min((cap - copied) as usize),
            None => buf.len(),
        };

        let n = match read.read(&mut buf[..want]).await {
            Ok(0) => return CopyOutcome::Eof(copied),
            Ok(n) => n,
            Err(_) => return CopyOutcome::Failed(copied),
        };

        if write.write_all(&buf[..n]).await.is_err() {
            return CopyOutcome::Failed(copied);
        }
        if write.flush().await.is_err() {
            return CopyOutcome::Failed(copied);
        }
        copied += n as u64;
    }
}
