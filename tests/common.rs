//! Common test harness utilities for integration tests.
//!
//! - Starting a broker on an ephemeral loopback port
//! - A minimal MQTT client built on the crate's own codec
//! - Bounded polling instead of wall-clock sleeps

// Not all test files use all helpers; silence dead_code warnings for unused exports.
#![allow(dead_code)]

use bytes::BytesMut;
use fluxmq::broker::{Broker, BrokerError};
use fluxmq::config::{Options, MAX_PAYLOAD_LIMIT};
use fluxmq::mqtt::protocol::{
    decode_frame, encode_frame, ConnAckPacket, ConnectPacket, ConnectProperties, Frame,
    ProtocolVersion, PublishPacket, Qos, SubAckPacket, SubscribePacket, SubscriptionRequest,
};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;

pub const IO_TIMEOUT: Duration = Duration::from_secs(5);

/// Loopback options with an ephemeral port.
pub fn test_options() -> Options {
    Options {
        host: "127.0.0.1".into(),
        port: 0,
        handshake_timeout_ms: 2_000,
        ..Options::default()
    }
}

pub struct RunningBroker {
    pub broker: Broker,
    pub addr: SocketAddr,
    handle: JoinHandle<Result<(), BrokerError>>,
}

impl RunningBroker {
    pub async fn start(opts: Options) -> Self {
        let broker = Broker::create(opts).expect("valid options");
        let runner = broker.clone();
        let handle = tokio::spawn(async move { runner.start().await });
        assert!(
            broker.ready_for_connections(IO_TIMEOUT).await,
            "broker should accept connections within timeout"
        );
        let addr = broker.local_addr().expect("listener bound");
        Self {
            broker,
            addr,
            handle,
        }
    }

    pub async fn stop(self) {
        self.broker.shutdown().await;
        self.handle
            .await
            .expect("start task joins")
            .expect("start returns cleanly");
    }
}

/// Wait for a condition with bounded timeout, polling at intervals.
pub async fn wait_for<F>(timeout: Duration, interval: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let start = std::time::Instant::now();
    while start.elapsed() < timeout {
        if condition() {
            return true;
        }
        tokio::time::sleep(interval).await;
    }
    condition()
}

pub fn connect_packet(proto: ProtocolVersion, client_id: &str, keep_alive: u16) -> ConnectPacket {
    ConnectPacket {
        protocol: proto,
        client_id: client_id.into(),
        keep_alive,
        clean_start: true,
        will: None,
        username: None,
        password: None,
        properties: ConnectProperties::default(),
    }
}

pub fn publish_packet(topic: &str, payload: &[u8], qos: Qos, packet_id: Option<u16>) -> PublishPacket {
    PublishPacket {
        topic: topic.into(),
        payload: bytes::Bytes::copy_from_slice(payload),
        qos,
        packet_id,
        dup: false,
        retain: false,
        subscription_identifier: None,
    }
}

/// Raw MQTT client speaking through the broker's codec.
pub struct TestClient {
    stream: TcpStream,
    buf: BytesMut,
    pub proto: ProtocolVersion,
}

impl TestClient {
    pub async fn connect(addr: SocketAddr, proto: ProtocolVersion) -> Self {
        let stream = TcpStream::connect(addr).await.expect("tcp connect");
        Self {
            stream,
            buf: BytesMut::new(),
            proto,
        }
    }

    pub async fn send(&mut self, frame: &Frame) {
        let mut out = BytesMut::new();
        encode_frame(frame, self.proto, &mut out).expect("encode");
        self.send_raw(&out).await;
    }

    pub async fn send_raw(&mut self, bytes: &[u8]) {
        // The broker may already have closed the socket; tests observe that through `recv`.
        let _ = self.stream.write_all(bytes).await;
    }

    /// Next frame from the broker, or `None` once it closed the connection.
    pub async fn recv(&mut self) -> Option<Frame> {
        tokio::time::timeout(IO_TIMEOUT, self.read_frame())
            .await
            .expect("broker should answer within timeout")
    }

    async fn read_frame(&mut self) -> Option<Frame> {
        loop {
            if let Some((frame, used)) = decode_frame(&self.buf, Some(self.proto), MAX_PAYLOAD_LIMIT)
                .expect("broker sends well-formed frames")
            {
                let _ = self.buf.split_to(used);
                return Some(frame);
            }
            match self.stream.read_buf(&mut self.buf).await {
                Ok(0) | Err(_) => return None,
                Ok(_) => {}
            }
        }
    }

    /// Drain frames until the broker closes the socket; returns what arrived before the close.
    pub async fn until_closed(&mut self) -> Vec<Frame> {
        let mut frames = Vec::new();
        while let Some(frame) = self.recv().await {
            frames.push(frame);
        }
        frames
    }

    pub async fn handshake(&mut self, client_id: &str, keep_alive: u16) -> ConnAckPacket {
        let connect = connect_packet(self.proto, client_id, keep_alive);
        self.handshake_with(connect).await
    }

    pub async fn handshake_with(&mut self, connect: ConnectPacket) -> ConnAckPacket {
        self.send(&Frame::Connect(connect)).await;
        match self.recv().await {
            Some(Frame::ConnAck(ack)) => ack,
            other => panic!("expected CONNACK, got {other:?}"),
        }
    }

    pub async fn subscribe(&mut self, packet_id: u16, filters: &[&str]) -> SubAckPacket {
        self.send(&Frame::Subscribe(SubscribePacket {
            packet_id,
            filters: filters
                .iter()
                .map(|f| SubscriptionRequest::new(*f, Qos::AtMostOnce))
                .collect(),
            subscription_identifier: None,
        }))
        .await;
        match self.recv().await {
            Some(Frame::SubAck(ack)) => ack,
            other => panic!("expected SUBACK, got {other:?}"),
        }
    }

    /// Next frame, which must be a PUBLISH.
    pub async fn expect_publish(&mut self) -> PublishPacket {
        match self.recv().await {
            Some(Frame::Publish(publish)) => publish,
            other => panic!("expected PUBLISH, got {other:?}"),
        }
    }
}
