//! Relay engine tests, driving the hop protocol over the in-memory host.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use circuit_core::codec::{read_delimited, write_delimited};
use circuit_core::host::{DialOpts, Host, MuxStream, StreamHandler};
use circuit_core::peer::PeerId;
use circuit_core::proto::{
    addr_info_to_peer, hop_message, peer_to_addr_info, stop_message, HopMessage, Status,
    StopMessage,
};
use circuit_core::testing::{MemoryHost, MemoryNetwork};
use circuit_core::{AddrInfo, PROTO_V2_HOP, PROTO_V2_STOP};
use circuit_crypto::identity::IdentityKeypair;
use circuit_crypto::voucher::ReservationVoucher;
use circuit_relay::acl::DenyAll;
use circuit_relay::{Relay, RelayConfig, Resources, RESERVATION_TAG};

fn id(seed: u8) -> PeerId {
    PeerId::from_bytes([seed; 32])
}

async fn reserve(host: &Arc<MemoryHost>, relay: PeerId) -> HopMessage {
    let mut stream = host
        .new_stream(&relay, &[PROTO_V2_HOP], DialOpts::default())
        .await
        .expect("open hop stream");

    write_delimited(&mut stream, &HopMessage::reserve()).await.unwrap();
    read_delimited(&mut stream).await.expect("reservation response")
}

async fn connect(host: &Arc<MemoryHost>, relay: PeerId, dest: PeerId) -> (Box<dyn MuxStream>, HopMessage) {
    let mut stream = host
        .new_stream(&relay, &[PROTO_V2_HOP], DialOpts::default())
        .await
        .expect("open hop stream");

    let msg = HopMessage::connect(addr_info_to_peer(&AddrInfo::new(dest)));
    write_delimited(&mut stream, &msg).await.unwrap();
    let reply = read_delimited(&mut stream).await.expect("connect response");
    (stream, reply)
}

/// Stop-side handler that accepts every circuit and echoes its bytes.
struct EchoStop;

#[async_trait]
impl StreamHandler for EchoStop {
    async fn handle(&self, mut stream: Box<dyn MuxStream>) {
        let msg: StopMessage = read_delimited(&mut stream).await.unwrap();
        assert_eq!(msg.msg_type(), Some(stop_message::Type::Connect));

        write_delimited(&mut stream, &StopMessage::with_status(Status::Ok)).await.unwrap();

        let mut buf = [0u8; 256];
        loop {
            match stream.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if stream.write_all(&buf[..n]).await.is_err() {
                        break;
                    }
                }
            }
        }
        let _ = stream.shutdown().await;
    }
}

#[tokio::test]
async fn reserve_grants_a_slot() {
    let net = MemoryNetwork::new();
    let r = net.add_host(id(1));
    let p = net.add_host(id(2));
    MemoryNetwork::connect(&r, &p).await;

    let relay = Relay::new(r.clone() as Arc<dyn Host>).unwrap();

    let reply = reserve(&p, r.id()).await;
    assert_eq!(reply.msg_type(), Some(hop_message::Type::Status));
    assert_eq!(reply.status_code(), Some(Status::Ok));

    let rsvp = reply.reservation.expect("reservation info");
    assert_eq!(rsvp.ttl, Some(60 * 60));
    let relay_info = peer_to_addr_info(rsvp.relay.as_ref()).unwrap();
    assert_eq!(relay_info.id, r.id());
    assert!(!relay_info.addrs.is_empty());

    // default resources carry a limit
    assert!(reply.limit.is_some());

    assert!(relay.is_reserved(&p.id()));
    assert_eq!(relay.reservation_count(), 1);
    assert_eq!(r.tag_weight(&p.id(), RESERVATION_TAG), Some(10));
}

#[tokio::test]
async fn reservation_carries_a_verifiable_voucher() {
    let keypair = Arc::new(IdentityKeypair::generate());
    let net = MemoryNetwork::new();
    let r = net.add_host(keypair.peer_id());
    let p = net.add_host(id(2));
    MemoryNetwork::connect(&r, &p).await;

    let _relay = Relay::with_config(
        r.clone() as Arc<dyn Host>,
        RelayConfig::default().with_keypair(keypair.clone()),
    )
    .unwrap();

    let reply = reserve(&p, r.id()).await;
    assert_eq!(reply.status_code(), Some(Status::Ok));

    let blob = reply.reservation.unwrap().voucher.expect("voucher bytes");
    let voucher = ReservationVoucher::unmarshal(&blob).unwrap();
    voucher.verify(&keypair.public()).unwrap();
    assert_eq!(voucher.relay, r.id());
    assert_eq!(voucher.peer, p.id());
}

#[tokio::test]
async fn voucher_key_must_match_host() {
    let net = MemoryNetwork::new();
    let r = net.add_host(id(1));

    let foreign = Arc::new(IdentityKeypair::generate());
    let err = Relay::with_config(
        r as Arc<dyn Host>,
        RelayConfig::default().with_keypair(foreign),
    );
    assert!(err.is_err());
}

#[tokio::test]
async fn refreshing_too_fast_is_refused() {
    let net = MemoryNetwork::new();
    let r = net.add_host(id(1));
    let p = net.add_host(id(2));
    MemoryNetwork::connect(&r, &p).await;

    let relay = Relay::new(r.clone() as Arc<dyn Host>).unwrap();

    assert_eq!(reserve(&p, r.id()).await.status_code(), Some(Status::Ok));
    assert_eq!(
        reserve(&p, r.id()).await.status_code(),
        Some(Status::ReservationRefused)
    );

    // the reservation itself is untouched
    assert!(relay.is_reserved(&p.id()));
}

#[tokio::test]
async fn acl_denies_reservations() {
    let net = MemoryNetwork::new();
    let r = net.add_host(id(1));
    let p = net.add_host(id(2));
    MemoryNetwork::connect(&r, &p).await;

    let _relay = Relay::with_config(
        r.clone() as Arc<dyn Host>,
        RelayConfig::default().with_acl(Arc::new(DenyAll)),
    )
    .unwrap();

    assert_eq!(
        reserve(&p, r.id()).await.status_code(),
        Some(Status::PermissionDenied)
    );
}

#[tokio::test]
async fn reservation_table_is_capped() {
    let net = MemoryNetwork::new();
    let r = net.add_host(id(1));
    let p1 = net.add_host(id(2));
    let p2 = net.add_host(id(3));
    MemoryNetwork::connect(&r, &p1).await;
    MemoryNetwork::connect(&r, &p2).await;

    let _relay = Relay::with_config(
        r.clone() as Arc<dyn Host>,
        RelayConfig::default()
            .with_resources(Resources { max_reservations: 1, ..Resources::default() }),
    )
    .unwrap();

    assert_eq!(reserve(&p1, r.id()).await.status_code(), Some(Status::Ok));
    assert_eq!(
        reserve(&p2, r.id()).await.status_code(),
        Some(Status::ResourceLimitExceeded)
    );
}

#[tokio::test]
async fn connect_requires_a_reservation() {
    let net = MemoryNetwork::new();
    let r = net.add_host(id(1));
    let a = net.add_host(id(2));
    MemoryNetwork::connect(&r, &a).await;

    let _relay = Relay::new(r.clone() as Arc<dyn Host>).unwrap();

    let (_stream, reply) = connect(&a, r.id(), id(9)).await;
    assert_eq!(reply.status_code(), Some(Status::NoReservation));
}

#[tokio::test]
async fn unexpected_first_message_is_rejected() {
    let net = MemoryNetwork::new();
    let r = net.add_host(id(1));
    let a = net.add_host(id(2));
    MemoryNetwork::connect(&r, &a).await;

    let _relay = Relay::new(r.clone() as Arc<dyn Host>).unwrap();

    let mut stream = a
        .new_stream(&r.id(), &[PROTO_V2_HOP], DialOpts::default())
        .await
        .unwrap();
    write_delimited(&mut stream, &HopMessage::with_status(Status::Ok)).await.unwrap();

    let reply: HopMessage = read_delimited(&mut stream).await.unwrap();
    assert_eq!(reply.status_code(), Some(Status::UnexpectedMessage));
}

#[tokio::test]
async fn connect_splices_bytes_both_ways() {
    let net = MemoryNetwork::new();
    let r = net.add_host(id(1));
    let a = net.add_host(id(2));
    let b = net.add_host(id(3));
    MemoryNetwork::connect(&r, &a).await;
    MemoryNetwork::connect(&r, &b).await;

    let relay = Relay::with_config(
        r.clone() as Arc<dyn Host>,
        RelayConfig::default().with_resources(Resources::unlimited()),
    )
    .unwrap();

    b.set_stream_handler(PROTO_V2_STOP, Arc::new(EchoStop));
    assert_eq!(reserve(&b, r.id()).await.status_code(), Some(Status::Ok));

    let (mut stream, reply) = connect(&a, r.id(), b.id()).await;
    assert_eq!(reply.status_code(), Some(Status::Ok));
    assert_eq!(relay.circuit_count(&a.id()), 1);
    assert_eq!(relay.circuit_count(&b.id()), 1);

    stream.write_all(b"relay works!").await.unwrap();
    let mut echo = [0u8; 12];
    stream.read_exact(&mut echo).await.unwrap();
    assert_eq!(&echo, b"relay works!");
}

#[tokio::test]
async fn circuits_per_peer_are_capped() {
    let net = MemoryNetwork::new();
    let r = net.add_host(id(1));
    let a = net.add_host(id(2));
    let b = net.add_host(id(3));
    MemoryNetwork::connect(&r, &a).await;
    MemoryNetwork::connect(&r, &b).await;

    let _relay = Relay::with_config(
        r.clone() as Arc<dyn Host>,
        RelayConfig::default().with_resources(Resources {
            max_circuits: 1,
            limit: None,
            ..Resources::default()
        }),
    )
    .unwrap();

    b.set_stream_handler(PROTO_V2_STOP, Arc::new(EchoStop));
    assert_eq!(reserve(&b, r.id()).await.status_code(), Some(Status::Ok));

    let (_live, reply) = connect(&a, r.id(), b.id()).await;
    assert_eq!(reply.status_code(), Some(Status::Ok));

    let (_refused, reply) = connect(&a, r.id(), b.id()).await;
    assert_eq!(reply.status_code(), Some(Status::ResourceLimitExceeded));
}

#[tokio::test]
async fn connect_fails_without_stop_handler() {
    let net = MemoryNetwork::new();
    let r = net.add_host(id(1));
    let a = net.add_host(id(2));
    let b = net.add_host(id(3));
    MemoryNetwork::connect(&r, &a).await;
    MemoryNetwork::connect(&r, &b).await;

    let relay = Relay::new(r.clone() as Arc<dyn Host>).unwrap();

    // b reserves but never installs a stop handler
    assert_eq!(reserve(&b, r.id()).await.status_code(), Some(Status::Ok));

    let (_stream, reply) = connect(&a, r.id(), b.id()).await;
    assert_eq!(reply.status_code(), Some(Status::ConnectionFailed));

    // the failed attempt released its circuit counters
    assert_eq!(relay.circuit_count(&a.id()), 0);
    assert_eq!(relay.circuit_count(&b.id()), 0);
}

#[tokio::test(start_paused = true)]
async fn reservations_expire_through_gc() {
    let net = MemoryNetwork::new();
    let r = net.add_host(id(1));
    let p = net.add_host(id(2));
    MemoryNetwork::connect(&r, &p).await;

    let relay = Relay::with_config(
        r.clone() as Arc<dyn Host>,
        RelayConfig::default().with_resources(Resources {
            reservation_ttl: Duration::from_secs(1),
            ..Resources::default()
        }),
    )
    .unwrap();

    assert_eq!(reserve(&p, r.id()).await.status_code(), Some(Status::Ok));
    assert!(relay.is_reserved(&p.id()));

    // past the TTL and the next GC sweep
    tokio::time::sleep(Duration::from_secs(90)).await;
    assert!(!relay.is_reserved(&p.id()));
    assert_eq!(r.tag_weight(&p.id(), RESERVATION_TAG), None);
}

#[tokio::test]
async fn disconnect_drops_the_reservation() {
    let net = MemoryNetwork::new();
    let r = net.add_host(id(1));
    let p = net.add_host(id(2));
    MemoryNetwork::connect(&r, &p).await;

    let relay = Relay::new(r.clone() as Arc<dyn Host>).unwrap();

    assert_eq!(reserve(&p, r.id()).await.status_code(), Some(Status::Ok));
    MemoryNetwork::disconnect(&r, &p).await;

    // let the notification task run
    for _ in 0..20 {
        tokio::task::yield_now().await;
        if !relay.is_reserved(&p.id()) {
            break;
        }
    }
    assert!(!relay.is_reserved(&p.id()));
}

#[tokio::test]
async fn close_clears_reservations_and_handler() {
    let net = MemoryNetwork::new();
    let r = net.add_host(id(1));
    let p = net.add_host(id(2));
    MemoryNetwork::connect(&r, &p).await;

    let relay = Relay::new(r.clone() as Arc<dyn Host>).unwrap();
    assert_eq!(reserve(&p, r.id()).await.status_code(), Some(Status::Ok));

    relay.close();
    assert_eq!(relay.reservation_count(), 0);
    assert_eq!(r.tag_weight(&p.id(), RESERVATION_TAG), None);

    let err = p
        .new_stream(&r.id(), &[PROTO_V2_HOP], DialOpts::default())
        .await;
    assert!(err.is_err());
}
