//! Shutdown: idempotence, concurrent callers and session teardown.

mod common;

use common::{test_options, RunningBroker, TestClient, IO_TIMEOUT};
use fluxmq::broker::{Broker, BrokerError};
use fluxmq::mqtt::protocol::{Frame, ProtocolVersion, ReasonCodes};
use std::time::Duration;
use tokio::net::TcpStream;

#[tokio::test(flavor = "multi_thread")]
async fn shutdown_closes_every_session() {
    let running = RunningBroker::start(test_options()).await;
    let broker = running.broker.clone();

    let mut legacy = TestClient::connect(running.addr, ProtocolVersion::V3_1_1).await;
    legacy.handshake("legacy", 30).await;
    legacy.subscribe(1, &["a/#"]).await;
    let mut modern = TestClient::connect(running.addr, ProtocolVersion::V5).await;
    modern.handshake("modern", 30).await;
    assert_eq!(broker.session_count(), 2);

    let (a, b) = (broker.clone(), broker.clone());
    tokio::join!(a.shutdown(), b.shutdown());
    assert_eq!(broker.session_count(), 0);
    assert_eq!(broker.subscription_count(), 0);
    assert!(!broker.is_running());

    assert!(legacy.until_closed().await.is_empty());
    match modern.until_closed().await.as_slice() {
        [Frame::Disconnect(disconnect)] => {
            assert_eq!(disconnect.reason, ReasonCodes::SERVER_SHUTTING_DOWN)
        }
        other => panic!("expected DISCONNECT before close, got {other:?}"),
    }

    // A third call returns at once.
    tokio::time::timeout(IO_TIMEOUT, broker.shutdown())
        .await
        .expect("repeated shutdown returns");
    running.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn no_admissions_after_shutdown() {
    let running = RunningBroker::start(test_options()).await;
    let broker = running.broker.clone();
    let addr = running.addr;
    running.stop().await;

    assert!(matches!(broker.start().await, Err(BrokerError::ShuttingDown)));
    assert!(
        tokio::net::TcpStream::connect(addr).await.is_err(),
        "listener is closed after shutdown"
    );
    assert_eq!(broker.session_count(), 0);
    assert_eq!(broker.total_accepted(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn done_resolves_for_every_waiter() {
    let running = RunningBroker::start(test_options()).await;
    let broker: Broker = running.broker.clone();
    let waiter = {
        let broker = broker.clone();
        tokio::spawn(async move { broker.done().await })
    };
    running.stop().await;
    tokio::time::timeout(IO_TIMEOUT, waiter)
        .await
        .expect("done resolves")
        .expect("waiter joins");
}

#[tokio::test(flavor = "multi_thread")]
async fn abandoned_shutdown_still_completes() {
    let running = RunningBroker::start(test_options()).await;
    let broker = running.broker.clone();
    let mut client = TestClient::connect(running.addr, ProtocolVersion::V3_1_1).await;
    client.handshake("lingering", 30).await;

    // Poll the first shutdown once, then drop it.
    tokio::select! {
        biased;
        _ = broker.shutdown() => {}
        _ = std::future::ready(()) => {}
    }

    tokio::time::timeout(IO_TIMEOUT, broker.done())
        .await
        .expect("drain finishes without its caller");
    assert_eq!(broker.session_count(), 0);
    assert!(client.until_closed().await.is_empty());
    tokio::time::timeout(IO_TIMEOUT, broker.shutdown())
        .await
        .expect("later shutdown returns");
    running.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn shutdown_during_a_connect_flood_leaves_no_sessions() {
    for _ in 0..10 {
        let running = RunningBroker::start(test_options()).await;
        let broker = running.broker.clone();
        let addr = running.addr;
        let flood: Vec<_> = (0..50)
            .map(|_| {
                tokio::spawn(async move {
                    if let Ok(stream) = TcpStream::connect(addr).await {
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        drop(stream);
                    }
                })
            })
            .collect();

        tokio::time::sleep(Duration::from_millis(5)).await;
        running.stop().await;
        assert_eq!(broker.session_count(), 0);
        assert!(!broker.is_running());

        for task in flood {
            task.await.expect("connect task joins");
        }
        assert_eq!(broker.session_count(), 0);
    }
}
