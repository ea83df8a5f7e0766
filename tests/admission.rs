//! Connection admission: limits, handshake deadline and first-packet rules.

mod common;

use common::{test_options, wait_for, RunningBroker, TestClient, IO_TIMEOUT};
use fluxmq::audit;
use fluxmq::config::Options;
use fluxmq::mqtt::protocol::{Frame, LegacyConnAck, ProtocolVersion};
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;

const POLL: Duration = Duration::from_millis(20);

#[tokio::test(flavor = "multi_thread")]
async fn max_connections_refuses_the_excess() {
    let running = RunningBroker::start(Options {
        max_connections: 2,
        ..test_options()
    })
    .await;
    let broker = running.broker.clone();

    let mut first = TestClient::connect(running.addr, ProtocolVersion::V3_1_1).await;
    let mut second = TestClient::connect(running.addr, ProtocolVersion::V3_1_1).await;
    assert!(wait_for(IO_TIMEOUT, POLL, || broker.session_count() == 2).await);

    let mut third = TestClient::connect(running.addr, ProtocolVersion::V3_1_1).await;
    assert!(third.until_closed().await.is_empty(), "refused socket gets no frames");
    assert_eq!(broker.session_count(), 2);
    assert_eq!(broker.total_accepted(), 2);
    assert!(audit::snapshot()
        .iter()
        .any(|e| e.event_type == "connection_refused"));

    // Admitted sessions are unaffected by the refusal.
    assert_eq!(first.handshake("first", 30).await.reason, LegacyConnAck::ACCEPTED);
    assert_eq!(second.handshake("second", 30).await.reason, LegacyConnAck::ACCEPTED);

    // A slot frees up once a session leaves.
    drop(first);
    assert!(wait_for(IO_TIMEOUT, POLL, || broker.session_count() == 1).await);
    let mut fourth = TestClient::connect(running.addr, ProtocolVersion::V3_1_1).await;
    assert_eq!(fourth.handshake("fourth", 30).await.reason, LegacyConnAck::ACCEPTED);
    assert_eq!(broker.total_accepted(), 3);

    running.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn unlimited_when_max_connections_is_zero() {
    let running = RunningBroker::start(test_options()).await;
    let mut clients = Vec::new();
    for i in 0..8 {
        let mut client = TestClient::connect(running.addr, ProtocolVersion::V5).await;
        client.handshake(&format!("c{i}"), 30).await;
        clients.push(client);
    }
    assert_eq!(running.broker.session_count(), 8);
    running.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn silent_connection_hits_the_handshake_deadline() {
    let running = RunningBroker::start(Options {
        handshake_timeout_ms: 200,
        ..test_options()
    })
    .await;
    let broker = running.broker.clone();
    let mut client = TestClient::connect(running.addr, ProtocolVersion::V3_1_1).await;
    assert!(client.until_closed().await.is_empty());
    assert!(wait_for(IO_TIMEOUT, POLL, || broker.session_count() == 0).await);
    running.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn first_packet_must_be_connect() {
    let running = RunningBroker::start(test_options()).await;
    let mut client = TestClient::connect(running.addr, ProtocolVersion::V3_1_1).await;
    client.send(&Frame::PingReq).await;
    assert!(client.until_closed().await.is_empty());
    running.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn unknown_protocol_level_gets_a_refusal_connack() {
    let running = RunningBroker::start(test_options()).await;
    let mut client = TestClient::connect(running.addr, ProtocolVersion::V3_1_1).await;
    let connect = [
        0x10, 13, 0x00, 0x04, b'M', b'Q', b'T', b'T', 9, 0x02, 0x00, 0x3c, 0x00, 0x01, b'x',
    ];
    client.send_raw(&connect).await;
    let frames = client.until_closed().await;
    match frames.as_slice() {
        [Frame::ConnAck(ack)] => assert_eq!(ack.reason, LegacyConnAck::UNACCEPTABLE_PROTOCOL),
        other => panic!("expected a single CONNACK, got {other:?}"),
    }
    running.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn oversized_packet_closes_the_session() {
    let running = RunningBroker::start(Options {
        max_payload: 64,
        ..test_options()
    })
    .await;
    let mut client = TestClient::connect(running.addr, ProtocolVersion::V3_1_1).await;
    client.handshake("big", 30).await;
    // PUBLISH header announcing 200 bytes; the body never needs to arrive.
    client.send_raw(&[0x30, 0xC8, 0x01]).await;
    assert!(client.until_closed().await.is_empty());
    running.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn concurrent_connects_respect_max_connections() {
    let running = RunningBroker::start(Options {
        max_connections: 2,
        handshake_timeout_ms: 10_000,
        ..test_options()
    })
    .await;
    let broker = running.broker.clone();
    let addr = running.addr;

    // Each task reports whether its socket is still open after a grace period, and keeps the
    // stream alive until the end of the test.
    let attempts: Vec<_> = (0..10)
        .map(|_| {
            tokio::spawn(async move {
                let mut stream = TcpStream::connect(addr).await.expect("tcp connect");
                let mut byte = [0u8; 1];
                let open = matches!(
                    tokio::time::timeout(Duration::from_secs(1), stream.read(&mut byte)).await,
                    Err(_)
                );
                (open, stream)
            })
        })
        .collect();
    let mut streams = Vec::new();
    let mut open = 0;
    for attempt in attempts {
        let (is_open, stream) = attempt.await.expect("connect task joins");
        if is_open {
            open += 1;
        }
        streams.push(stream);
    }

    assert_eq!(open, 2, "exactly max_connections sockets stay open");
    assert_eq!(broker.session_count(), 2);
    assert_eq!(broker.total_accepted(), 2);

    drop(streams);
    running.stop().await;
}
