//! End-to-end tests: three hosts A–R–B over the in-memory network, with
//! the relay engine on R and clients on A and B.

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use multiaddr::{Multiaddr, Protocol};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use circuit_client::{Client, Error};
use circuit_core::codec::{read_delimited, write_delimited};
use circuit_core::host::{DialOpts, Host};
use circuit_core::peer::{AddrInfo, PeerId};
use circuit_core::proto::circuit_relay as pbv1;
use circuit_core::proto::{addr_info_to_peer, CircuitRelay, Status, StopMessage};
use circuit_core::testing::{MemoryHost, MemoryNetwork, PlainUpgrader};
use circuit_core::{PROTO_V1, PROTO_V2_STOP};
use circuit_crypto::identity::IdentityKeypair;
use circuit_relay::{Relay, RelayConfig, RelayLimit, Resources};

struct Node {
    host: Arc<MemoryHost>,
    client: Client,
}

/// Log level comes from `RUST_LOG`; handy when a scenario misbehaves.
fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

fn make_node(net: &Arc<MemoryNetwork>) -> Node {
    init_logging();
    let keypair = IdentityKeypair::generate();
    let host = net.add_host(keypair.peer_id());
    let client = Client::new(host.clone() as Arc<dyn Host>, Arc::new(PlainUpgrader));
    Node { host, client }
}

fn circuit_addr_via(relay: PeerId, dest: PeerId) -> Multiaddr {
    Multiaddr::empty()
        .with(Protocol::P2p(relay.to_multiaddr_peer_id()))
        .with(Protocol::P2pCircuit)
        .with(Protocol::P2p(dest.to_multiaddr_peer_id()))
}

/// A–R–B, relay on R, clients started on A and B, B holding a
/// reservation and a pending accept.
async fn relay_topology(resources: Resources) -> (Node, Relay, Node, Node) {
    let net = MemoryNetwork::new();
    let a = make_node(&net);
    let r = make_node(&net);
    let b = make_node(&net);

    MemoryNetwork::connect(&a.host, &r.host).await;
    MemoryNetwork::connect(&r.host, &b.host).await;

    let relay = Relay::with_config(
        r.host.clone() as Arc<dyn Host>,
        RelayConfig::default().with_resources(resources),
    )
    .unwrap();

    b.client.start();

    let rinfo = AddrInfo::with_addrs(r.host.id(), r.host.addrs());
    let rsvp = b.client.reserve(&rinfo).await.unwrap();
    assert_eq!(rsvp.relay.id, r.host.id());
    assert!(rsvp.expiration > SystemTime::now());

    (a, relay, r, b)
}

#[tokio::test]
async fn basic_relay() {
    let (a, _relay, r, b) = relay_topology(Resources::default()).await;

    let listener = b.client.listener();
    let accept = tokio::spawn(async move { listener.accept().await });

    let raddr = circuit_addr_via(r.host.id(), b.host.id());
    let mut conn_a = a.client.dial(&raddr, b.host.id()).await.unwrap();

    // default resources carry a limit, so the circuit is transient
    assert!(conn_a.stat().transient);

    let mut conn_b = accept.await.unwrap().unwrap();
    assert_eq!(conn_b.remote().id, a.host.id());

    let msg = b"relay works!";
    conn_a.write_all(msg).await.unwrap();

    let mut got = [0u8; 12];
    conn_b.read_exact(&mut got).await.unwrap();
    assert_eq!(&got, msg);

    // circuits pin the relay connection on both ends
    assert_eq!(a.client.hop_count(&r.host.id()), 1);
    assert_eq!(b.client.hop_count(&r.host.id()), 1);

    drop(conn_a);
    assert_eq!(a.client.hop_count(&r.host.id()), 0);
}

#[tokio::test]
async fn reservation_voucher_verifies_against_the_relay_key() {
    let net = MemoryNetwork::new();
    let b = make_node(&net);

    let relay_keypair = Arc::new(IdentityKeypair::generate());
    let r = net.add_host(relay_keypair.peer_id());
    MemoryNetwork::connect(&r, &b.host).await;

    let _relay = Relay::with_config(
        r.clone() as Arc<dyn Host>,
        RelayConfig::default().with_keypair(relay_keypair.clone()),
    )
    .unwrap();

    let rinfo = AddrInfo::with_addrs(r.id(), r.addrs());
    let rsvp = b.client.reserve(&rinfo).await.unwrap();

    let voucher = rsvp.voucher.expect("relay issues vouchers when it has a key");
    voucher.verify(&relay_keypair.public()).unwrap();
    assert_eq!(voucher.relay, r.id());
    assert_eq!(voucher.peer, b.host.id());
}

#[tokio::test]
async fn dialing_through_a_non_relay_fails_with_cant_speak_relay() {
    let net = MemoryNetwork::new();
    let a = make_node(&net);
    let r = make_node(&net);
    let b = make_node(&net);

    MemoryNetwork::connect(&a.host, &r.host).await;
    MemoryNetwork::connect(&r.host, &b.host).await;

    // R runs only a client: it answers v1 HOP with HOP_CANT_SPEAK_RELAY
    r.client.start();

    let raddr = circuit_addr_via(r.host.id(), b.host.id());
    let err = a.client.dial(&raddr, b.host.id()).await.unwrap_err();

    assert_eq!(err.v1_status(), Some(pbv1::Status::HopCantSpeakRelay));
    assert_eq!(err.status(), Some(Status::PermissionDenied));
}

#[tokio::test]
async fn dialing_an_unreserved_destination_fails() {
    let net = MemoryNetwork::new();
    let a = make_node(&net);
    let r = make_node(&net);
    let b = make_node(&net);

    // A–R only; B never connected to R and never reserved
    MemoryNetwork::connect(&a.host, &r.host).await;

    let _relay = Relay::new(r.host.clone() as Arc<dyn Host>).unwrap();

    let raddr = circuit_addr_via(r.host.id(), b.host.id());
    let err = a.client.dial(&raddr, b.host.id()).await.unwrap_err();
    assert_eq!(err.status(), Some(Status::NoReservation));
}

#[tokio::test]
async fn dialing_without_a_relay_is_rejected() {
    let net = MemoryNetwork::new();
    let a = make_node(&net);
    let dest = PeerId::from_bytes([9; 32]);

    let bare = Multiaddr::empty()
        .with(Protocol::P2pCircuit)
        .with(Protocol::P2p(dest.to_multiaddr_peer_id()));
    let err = a.client.dial(&bare, dest).await.unwrap_err();
    assert!(matches!(err, Error::NoRelaySpecified(_)));

    let plain: Multiaddr = "/ip4/1.2.3.4/tcp/4001".parse().unwrap();
    let err = a.client.dial(&plain, dest).await.unwrap_err();
    assert!(matches!(err, Error::NotRelayAddr(_)));
}

#[tokio::test]
async fn data_limit_resets_the_circuit() {
    let resources = Resources {
        limit: Some(RelayLimit { duration: Duration::from_secs(30), data: 4096 }),
        ..Resources::default()
    };
    let (a, _relay, r, b) = relay_topology(resources).await;

    let listener = b.client.listener();
    let accept = tokio::spawn(async move { listener.accept().await });

    let raddr = circuit_addr_via(r.host.id(), b.host.id());
    let mut conn_a = a.client.dial(&raddr, b.host.id()).await.unwrap();
    let mut conn_b = accept.await.unwrap().unwrap();

    // within the cap: bytes flow
    conn_a.write_all(&[0xaa; 1024]).await.unwrap();
    let mut got = [0u8; 1024];
    conn_b.read_exact(&mut got).await.unwrap();

    // 4096 more bytes exceed the cap; the relay resets both halves and
    // undelivered bytes are discarded
    conn_a.write_all(&[0xbb; 4096]).await.unwrap();

    let mut buf = [0u8; 4096];
    let err = loop {
        match conn_b.read(&mut buf).await {
            Ok(0) => panic!("expected reset, got EOF"),
            Ok(_) => continue,
            Err(err) => break err,
        }
    };
    assert_eq!(err.kind(), std::io::ErrorKind::ConnectionReset);
}

#[tokio::test(start_paused = true)]
async fn time_limit_resets_the_circuit() {
    let resources = Resources {
        limit: Some(RelayLimit { duration: Duration::from_secs(1), data: 1 << 30 }),
        ..Resources::default()
    };
    let (a, _relay, r, b) = relay_topology(resources).await;

    let listener = b.client.listener();
    let accept = tokio::spawn(async move { listener.accept().await });

    let raddr = circuit_addr_via(r.host.id(), b.host.id());
    let mut conn_a = a.client.dial(&raddr, b.host.id()).await.unwrap();
    let mut conn_b = accept.await.unwrap().unwrap();

    tokio::time::sleep(Duration::from_secs(2)).await;

    let err = conn_a.write_all(b"should be closed").await.unwrap_err();
    assert_eq!(err.kind(), std::io::ErrorKind::ConnectionReset);

    let mut buf = [0u8; 16];
    let err = conn_b.read(&mut buf).await.unwrap_err();
    assert_eq!(err.kind(), std::io::ErrorKind::ConnectionReset);
}

#[tokio::test]
async fn client_accepts_legacy_v1_circuits() {
    let net = MemoryNetwork::new();
    let legacy = make_node(&net);
    let b = make_node(&net);
    MemoryNetwork::connect(&legacy.host, &b.host).await;

    b.client.start();
    let listener = b.client.listener();
    let accept = tokio::spawn(async move { listener.accept().await });

    let src = AddrInfo::with_addrs(
        PeerId::from_bytes([7; 32]),
        vec!["/ip4/10.0.0.7/tcp/4001".parse().unwrap()],
    );

    let mut stream = legacy
        .host
        .new_stream(&b.host.id(), &[PROTO_V1], DialOpts::default())
        .await
        .unwrap();

    let stop = CircuitRelay {
        r#type: Some(pbv1::Type::Stop as i32),
        src_peer: Some(addr_info_to_peer(&src)),
        dst_peer: Some(addr_info_to_peer(&AddrInfo::new(b.host.id()))),
        code: None,
    };
    write_delimited(&mut stream, &stop).await.unwrap();

    let reply: CircuitRelay = read_delimited(&mut stream).await.unwrap();
    assert_eq!(reply.status_code(), Some(pbv1::Status::Success));

    let mut conn_b = accept.await.unwrap().unwrap();
    assert_eq!(conn_b.remote().id, src.id);

    stream.write_all(b"hello v1").await.unwrap();
    let mut got = [0u8; 8];
    conn_b.read_exact(&mut got).await.unwrap();
    assert_eq!(&got, b"hello v1");
}

#[tokio::test]
async fn v1_stop_for_the_wrong_destination_is_rejected() {
    let net = MemoryNetwork::new();
    let legacy = make_node(&net);
    let b = make_node(&net);
    MemoryNetwork::connect(&legacy.host, &b.host).await;

    b.client.start();

    let mut stream = legacy
        .host
        .new_stream(&b.host.id(), &[PROTO_V1], DialOpts::default())
        .await
        .unwrap();

    let stop = CircuitRelay {
        r#type: Some(pbv1::Type::Stop as i32),
        src_peer: Some(addr_info_to_peer(&AddrInfo::new(PeerId::from_bytes([7; 32])))),
        dst_peer: Some(addr_info_to_peer(&AddrInfo::new(PeerId::from_bytes([8; 32])))),
        code: None,
    };
    write_delimited(&mut stream, &stop).await.unwrap();

    let reply: CircuitRelay = read_delimited(&mut stream).await.unwrap();
    assert_eq!(
        reply.status_code(),
        Some(pbv1::Status::StopDstMultiaddrInvalid)
    );
}

#[tokio::test(start_paused = true)]
async fn unaccepted_circuits_are_refused_after_the_accept_timeout() {
    let net = MemoryNetwork::new();
    let relay_side = make_node(&net);
    let b = make_node(&net);
    MemoryNetwork::connect(&relay_side.host, &b.host).await;

    // client started, but nobody calls accept()
    b.client.start();

    let mut stream = relay_side
        .host
        .new_stream(&b.host.id(), &[PROTO_V2_STOP], DialOpts::default())
        .await
        .unwrap();

    let connect = StopMessage::connect(addr_info_to_peer(&AddrInfo::new(
        PeerId::from_bytes([7; 32]),
    )));
    write_delimited(&mut stream, &connect).await.unwrap();

    let reply: StopMessage = read_delimited(&mut stream).await.unwrap();
    assert_eq!(reply.status_code(), Some(Status::ConnectionFailed));
}

#[tokio::test]
async fn transport_dials_and_listens_through_the_upgrader() {
    let (a, _relay, r, b) = relay_topology(Resources::default()).await;

    let transport_a = a.client.transport();
    let raddr = circuit_addr_via(r.host.id(), b.host.id());

    assert!(transport_a.can_dial(&raddr));
    assert!(!transport_a.can_dial(&"/ip4/1.2.3.4/tcp/1".parse().unwrap()));
    assert!(transport_a.proxy());
    assert_eq!(transport_a.protocols(), &[circuit_core::P_CIRCUIT]);

    let transport_b = b.client.transport();
    let listener = transport_b.listen(&circuit_core::circuit_addr()).unwrap();
    let accept = tokio::spawn(async move { listener.accept().await });

    let mut out = transport_a.dial(&raddr).await.unwrap();
    let mut inbound = accept.await.unwrap().unwrap();

    out.write_all(b"upgraded").await.unwrap();
    let mut got = [0u8; 8];
    inbound.read_exact(&mut got).await.unwrap();
    assert_eq!(&got, b"upgraded");
}
