//! Per-connection session: lifecycle state machine plus the task that owns one socket.
//!
//! A session task multiplexes four event sources with `tokio::select!`: the broker's
//! cancellation token, socket reads, the bounded outbound queue fed by fan-out, and the
//! handshake/keepalive deadline. Writes are encoded into a buffer and flushed under the
//! configured write deadline; missing it marks the session a slow consumer.

use crate::audit;
use crate::broker::{Broker, ServerInfo};
use crate::messaging::{mqtt_topic_matches, parse_shared_filter, validate_filter, validate_topic};
use crate::mqtt::permissions::PermissionCache;
use crate::mqtt::protocol::{
    decode_frame, encode_frame, map_reason, Ack, CodecError, ConnAckPacket, ConnAckProperties,
    ConnectPacket, DisconnectPacket, Frame, InternalCode, LegacyConnAck, ProtocolVersion,
    PublishPacket, Qos, ReasonCodes, SubAckPacket, SubscribePacket, UnsubAckPacket,
    UnsubscribePacket, SUBACK_FAILURE,
};
use crate::mqtt::subscriptions::SubscriptionId;
use crate::security::{Action, SecurityError, SessionIdentity};
use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufWriter};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{sleep_until, timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Topic the server info document is published on.
pub const SERVER_INFO_TOPIC: &str = "$SYS/broker/info";

const READ_BUFFER_CAPACITY: usize = 4 * 1024;
const MIN_KEEPALIVE_GRACE: Duration = Duration::from_secs(1);
/// MQTT 5 reason code for a PUBREL naming an unknown packet id.
const PACKET_ID_NOT_FOUND: u8 = 0x92;

/// Lifecycle phase. Phases only move forward.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum SessionPhase {
    #[default]
    Connecting,
    AwaitingHandshake,
    Active,
    Closing,
    Closed,
}

impl SessionPhase {
    /// Move to `next` if it lies ahead of the current phase.
    pub fn advance(&mut self, next: SessionPhase) -> bool {
        if next > *self {
            *self = next;
            true
        } else {
            false
        }
    }
}

/// What to do with a server info update that arrives at a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InfoDelivery {
    Immediate,
    Deferred,
}

/// Monotonic lifecycle flags; set once, cleared only by [`SessionFlags::reset`] at close.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionFlags {
    handshake_received: bool,
    first_keepalive_ack_sent: bool,
    info_updated_before_ack: bool,
}

impl SessionFlags {
    pub fn mark_handshake_received(&mut self) {
        self.handshake_received = true;
    }

    /// Record a PINGRESP. Returns true exactly once: on the first ack, when an info update
    /// arrived earlier and is still waiting to be flushed.
    pub fn mark_first_keepalive_ack(&mut self) -> bool {
        if self.first_keepalive_ack_sent {
            return false;
        }
        self.first_keepalive_ack_sent = true;
        self.info_updated_before_ack
    }

    pub fn note_info_update(&mut self) -> InfoDelivery {
        if self.first_keepalive_ack_sent {
            InfoDelivery::Immediate
        } else {
            self.info_updated_before_ack = true;
            InfoDelivery::Deferred
        }
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }

    pub fn handshake_received(&self) -> bool {
        self.handshake_received
    }

    pub fn first_keepalive_ack_sent(&self) -> bool {
        self.first_keepalive_ack_sent
    }

    pub fn info_updated_before_ack(&self) -> bool {
        self.info_updated_before_ack
    }
}

/// Why a session left the `Active` (or `AwaitingHandshake`) phase.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CloseReason {
    #[error("peer closed the connection")]
    PeerClosed,
    #[error("client sent DISCONNECT")]
    Disconnect,
    #[error("keepalive expired")]
    KeepaliveTimeout,
    #[error("no CONNECT within the handshake timeout")]
    HandshakeTimeout,
    #[error("slow consumer")]
    SlowConsumer,
    #[error("malformed packet: {0}")]
    MalformedPacket(CodecError),
    #[error("protocol error: {0}")]
    ProtocolError(String),
    #[error("authentication failed: {0}")]
    AuthFailed(SecurityError),
    #[error("server shutting down")]
    ServerShutdown,
    #[error("socket error: {0}")]
    Io(String),
}

impl CloseReason {
    /// Reasons worth a warning in the log; the rest are ordinary disconnects.
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            CloseReason::KeepaliveTimeout
                | CloseReason::HandshakeTimeout
                | CloseReason::SlowConsumer
                | CloseReason::MalformedPacket(_)
                | CloseReason::ProtocolError(_)
                | CloseReason::AuthFailed(_)
                | CloseReason::Io(_)
        )
    }
}

/// Message and byte counters, shared by sessions and the broker.
#[derive(Debug, Default)]
pub struct TrafficStats {
    msgs_in: AtomicU64,
    msgs_out: AtomicU64,
    bytes_in: AtomicU64,
    bytes_out: AtomicU64,
    slow_consumers: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TrafficSnapshot {
    pub msgs_in: u64,
    pub msgs_out: u64,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub slow_consumers: u64,
}

impl TrafficStats {
    pub fn record_msg_in(&self) {
        self.msgs_in.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_msg_out(&self) {
        self.msgs_out.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_bytes_in(&self, bytes: usize) {
        self.bytes_in.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_bytes_out(&self, bytes: usize) {
        self.bytes_out.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_slow_consumer(&self) {
        self.slow_consumers.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> TrafficSnapshot {
        TrafficSnapshot {
            msgs_in: self.msgs_in.load(Ordering::Relaxed),
            msgs_out: self.msgs_out.load(Ordering::Relaxed),
            bytes_in: self.bytes_in.load(Ordering::Relaxed),
            bytes_out: self.bytes_out.load(Ordering::Relaxed),
            slow_consumers: self.slow_consumers.load(Ordering::Relaxed),
        }
    }
}

/// Negotiated view of a session, readable by broker queries.
#[derive(Debug, Clone, Default)]
pub(crate) struct SessionMeta {
    pub(crate) client_id: Option<String>,
    pub(crate) username: Option<String>,
    pub(crate) protocol: Option<ProtocolVersion>,
    pub(crate) keep_alive: u16,
    pub(crate) clean_start: bool,
    pub(crate) phase: SessionPhase,
}

/// State shared between a session task and its handle in the broker map.
#[derive(Debug, Default)]
pub(crate) struct SessionShared {
    pub(crate) stats: TrafficStats,
    slow: AtomicBool,
    meta: Mutex<SessionMeta>,
}

impl SessionShared {
    /// Flag the session as a slow consumer; true only for the first caller.
    pub(crate) fn mark_slow(&self) -> bool {
        !self.slow.swap(true, Ordering::AcqRel)
    }

    pub(crate) fn is_slow(&self) -> bool {
        self.slow.load(Ordering::Acquire)
    }

    pub(crate) fn meta(&self) -> SessionMeta {
        self.meta.lock().clone()
    }

    fn set_phase(&self, phase: SessionPhase) {
        self.meta.lock().phase.advance(phase);
    }

    fn update_meta(&self, update: impl FnOnce(&mut SessionMeta)) {
        update(&mut self.meta.lock());
    }
}

/// Work pushed into a session's bounded outbound queue.
#[derive(Debug, Clone)]
pub(crate) enum Outbound {
    /// A routed publish, always delivered at QoS 0.
    Deliver {
        topic: String,
        payload: Bytes,
        identifier: Option<u32>,
    },
    ServerInfo(Arc<ServerInfo>),
}

/// Everything the broker hands a freshly registered session.
pub(crate) struct Registration {
    pub(crate) id: u64,
    pub(crate) peer: SocketAddr,
    pub(crate) shared: Arc<SessionShared>,
    pub(crate) cancel: CancellationToken,
    pub(crate) outbound_rx: mpsc::Receiver<Outbound>,
}

#[derive(Debug)]
struct SessionSubscription {
    id: SubscriptionId,
    filter: String,
}

type Step = Result<(), CloseReason>;

/// Drive one registered connection until it closes, then deregister it.
pub(crate) async fn serve(broker: Broker, registration: Registration, stream: TcpStream) {
    let Registration {
        id,
        peer,
        shared,
        cancel,
        mut outbound_rx,
    } = registration;
    if let Err(err) = stream.set_nodelay(true) {
        debug!(session_id = id, "set_nodelay failed: {err}");
    }
    let (mut reader, writer) = stream.into_split();
    let mut task = SessionTask::new(broker, id, peer, shared, cancel, writer);
    task.set_phase(SessionPhase::AwaitingHandshake);
    debug!(session_id = id, %peer, "session registered");
    let reason = task.drive(&mut reader, &mut outbound_rx).await;
    outbound_rx.close();
    task.close(reader, reason).await;
}

struct SessionTask {
    id: u64,
    peer: SocketAddr,
    broker: Broker,
    shared: Arc<SessionShared>,
    cancel: CancellationToken,
    phase: SessionPhase,
    flags: SessionFlags,
    protocol: Option<ProtocolVersion>,
    identity: Option<SessionIdentity>,
    keep_alive: u16,
    subscriptions: HashMap<String, SessionSubscription>,
    permissions: PermissionCache,
    inbound_qos2: HashSet<u16>,
    pending_info: Option<Arc<ServerInfo>>,
    started: Instant,
    last_activity: Instant,
    read_buf: BytesMut,
    write_buf: BytesMut,
    writer: BufWriter<OwnedWriteHalf>,
}

impl SessionTask {
    fn new(
        broker: Broker,
        id: u64,
        peer: SocketAddr,
        shared: Arc<SessionShared>,
        cancel: CancellationToken,
        writer: OwnedWriteHalf,
    ) -> Self {
        let permissions = PermissionCache::new(broker.options().permission_cache_capacity);
        let now = Instant::now();
        Self {
            id,
            peer,
            broker,
            shared,
            cancel,
            phase: SessionPhase::Connecting,
            flags: SessionFlags::default(),
            protocol: None,
            identity: None,
            keep_alive: 0,
            subscriptions: HashMap::new(),
            permissions,
            inbound_qos2: HashSet::new(),
            pending_info: None,
            started: now,
            last_activity: now,
            read_buf: BytesMut::with_capacity(READ_BUFFER_CAPACITY),
            write_buf: BytesMut::new(),
            writer: BufWriter::new(writer),
        }
    }

    fn set_phase(&mut self, next: SessionPhase) {
        if self.phase.advance(next) {
            self.shared.set_phase(next);
        }
    }

    fn client_id(&self) -> &str {
        self.identity
            .as_ref()
            .map_or("", |identity| identity.client_id.as_str())
    }

    /// Handshake deadline before CONNECT, keepalive deadline afterwards.
    fn deadline(&self) -> Option<Instant> {
        match self.phase {
            SessionPhase::Connecting | SessionPhase::AwaitingHandshake => {
                Some(self.started + self.broker.options().handshake_timeout())
            }
            SessionPhase::Active if self.keep_alive > 0 => {
                let grace = Duration::from_millis(u64::from(self.keep_alive) * 1_500)
                    .max(MIN_KEEPALIVE_GRACE);
                Some(self.last_activity + grace)
            }
            _ => None,
        }
    }

    async fn drive(
        &mut self,
        reader: &mut OwnedReadHalf,
        outbound_rx: &mut mpsc::Receiver<Outbound>,
    ) -> CloseReason {
        loop {
            let deadline = self.deadline();
            let step = tokio::select! {
                _ = self.cancel.cancelled() => Err(if self.shared.is_slow() {
                    CloseReason::SlowConsumer
                } else {
                    CloseReason::ServerShutdown
                }),
                read = reader.read_buf(&mut self.read_buf) => match read {
                    Ok(0) => Err(CloseReason::PeerClosed),
                    Ok(n) => self.on_bytes(n).await,
                    Err(err) if is_disconnect(&err) => Err(CloseReason::PeerClosed),
                    Err(err) => Err(CloseReason::Io(err.to_string())),
                },
                Some(out) = outbound_rx.recv() => self.on_outbound(out).await,
                _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    self.on_deadline()
                }
            };
            if let Err(reason) = step {
                return reason;
            }
        }
    }

    fn on_deadline(&self) -> Step {
        let Some(deadline) = self.deadline() else {
            return Ok(());
        };
        if Instant::now() < deadline {
            return Ok(());
        }
        match self.phase {
            SessionPhase::Active => Err(CloseReason::KeepaliveTimeout),
            _ => Err(CloseReason::HandshakeTimeout),
        }
    }

    async fn on_bytes(&mut self, n: usize) -> Step {
        self.shared.stats.record_bytes_in(n);
        self.broker.traffic().record_bytes_in(n);
        self.last_activity = Instant::now();
        let max_payload = self.broker.options().max_payload;
        loop {
            match decode_frame(&self.read_buf, self.protocol, max_payload) {
                Ok(None) => break,
                Ok(Some((frame, used))) => {
                    let _ = self.read_buf.split_to(used);
                    debug!(session_id = self.id, packet = frame.name(), "frame received");
                    self.on_frame(frame).await?;
                }
                Err(err) => return Err(CloseReason::MalformedPacket(err)),
            }
        }
        self.flush().await
    }

    async fn on_frame(&mut self, frame: Frame) -> Step {
        match frame {
            Frame::Connect(connect) => self.on_connect(connect).await,
            Frame::Publish(publish) => self.on_publish(publish),
            Frame::PubRel(ack) => self.on_pubrel(ack),
            Frame::PubAck(_) | Frame::PubRec(_) | Frame::PubComp(_) => Ok(()),
            Frame::Subscribe(subscribe) => self.on_subscribe(subscribe),
            Frame::Unsubscribe(unsubscribe) => self.on_unsubscribe(unsubscribe),
            Frame::PingReq => self.on_ping(),
            Frame::Disconnect(_) => Err(CloseReason::Disconnect),
            other @ (Frame::ConnAck(_) | Frame::SubAck(_) | Frame::UnsubAck(_) | Frame::PingResp) => {
                Err(CloseReason::ProtocolError(format!(
                    "{} is not accepted from clients",
                    other.name()
                )))
            }
        }
    }

    async fn on_connect(&mut self, connect: ConnectPacket) -> Step {
        let proto = connect.protocol;
        self.protocol = Some(proto);
        let peer = self.peer.to_string();

        if let Err(err) = self
            .broker
            .authenticator()
            .authorize_connect(connect.username.as_deref(), connect.password.as_deref())
        {
            let code = match err {
                SecurityError::MissingCredentials | SecurityError::BadCredentials => {
                    InternalCode::BadCredentials
                }
                SecurityError::InvalidToken | SecurityError::Unauthorized => {
                    InternalCode::NotAuthorized
                }
            };
            warn!(session_id = self.id, client_id = %connect.client_id, %peer, "connect rejected: {err}");
            audit::emit("connect_rejected", &connect.client_id, &peer, &err.to_string());
            self.send_connack(code, ConnAckProperties::default())?;
            self.flush().await?;
            return Err(CloseReason::AuthFailed(err));
        }

        let mut client_id = connect.client_id.clone();
        let mut assigned = None;
        if client_id.is_empty() {
            if proto == ProtocolVersion::V3_1 || !connect.clean_start {
                self.send_connack(InternalCode::IdentifierRejected, ConnAckProperties::default())?;
                self.flush().await?;
                return Err(CloseReason::ProtocolError(
                    "empty client identifier without clean start".into(),
                ));
            }
            client_id = format!("fluxmq-{}", Uuid::new_v4().simple());
            assigned = Some(client_id.clone());
        }

        let keep_alive = match connect.keep_alive {
            0 => self.broker.options().default_keep_alive_secs,
            requested => requested,
        };
        self.keep_alive = keep_alive;
        self.identity = Some(SessionIdentity {
            session_id: self.id,
            client_id: client_id.clone(),
            username: connect.username.clone(),
        });
        if connect.will.is_some() {
            debug!(session_id = self.id, "will message ignored");
        }
        self.flags.mark_handshake_received();
        self.set_phase(SessionPhase::Active);
        self.shared.update_meta(|meta| {
            meta.client_id = Some(client_id.clone());
            meta.username = connect.username.clone();
            meta.protocol = Some(proto);
            meta.keep_alive = keep_alive;
            meta.clean_start = connect.clean_start;
        });

        let mut properties = ConnAckProperties::default();
        if proto.is_v5() {
            let info = self.broker.info();
            if keep_alive != connect.keep_alive {
                properties.server_keep_alive = Some(keep_alive);
            }
            properties.assigned_client_identifier = assigned;
            properties.user_properties = vec![
                ("server_id".into(), info.server_id.clone()),
                ("max_payload".into(), info.max_payload.to_string()),
            ];
        }
        self.send_connack(InternalCode::Success, properties)?;
        info!(
            session_id = self.id,
            client_id = %client_id,
            %peer,
            protocol = ?proto,
            keep_alive,
            "session connected"
        );
        audit::emit("session_connected", &client_id, &peer, "handshake complete");
        Ok(())
    }

    fn send_connack(&mut self, code: InternalCode, properties: ConnAckProperties) -> Step {
        let proto = self.protocol.unwrap_or(ProtocolVersion::V3_1_1);
        self.send(&Frame::ConnAck(ConnAckPacket {
            session_present: false,
            reason: map_reason(proto, code),
            properties,
        }))
    }

    fn on_publish(&mut self, publish: PublishPacket) -> Step {
        let proto = self.protocol.unwrap_or(ProtocolVersion::V3_1_1);
        self.shared.stats.record_msg_in();
        self.broker.traffic().record_msg_in();
        if let Err(err) = validate_topic(&publish.topic) {
            return Err(CloseReason::ProtocolError(format!(
                "invalid publish topic {:?}: {err}",
                publish.topic
            )));
        }
        if let (Qos::ExactlyOnce, Some(id)) = (publish.qos, publish.packet_id) {
            if self.inbound_qos2.contains(&id) {
                debug!(session_id = self.id, packet_id = id, "QoS 2 retransmit acknowledged");
                return self.send(&Frame::PubRec(Ack::success(id)));
            }
        }

        let allowed = match &self.identity {
            Some(identity) => {
                self.permissions
                    .authorize(self.broker.policy(), identity, &publish.topic)
            }
            None => false,
        };
        if allowed {
            let targets = self.broker.registry().route(&publish.topic);
            self.broker
                .deliver(&targets, &publish.topic, &publish.payload);
        } else {
            warn!(
                session_id = self.id,
                client_id = %self.client_id(),
                topic = %publish.topic,
                "publish denied"
            );
        }

        let reason = if allowed {
            ReasonCodes::SUCCESS
        } else {
            map_reason(proto, InternalCode::NotAuthorized)
        };
        match (publish.qos, publish.packet_id) {
            (Qos::AtLeastOnce, Some(packet_id)) => {
                self.send(&Frame::PubAck(Ack { packet_id, reason }))
            }
            (Qos::ExactlyOnce, Some(packet_id)) => {
                if allowed || !proto.is_v5() {
                    self.inbound_qos2.insert(packet_id);
                }
                self.send(&Frame::PubRec(Ack { packet_id, reason }))
            }
            _ => Ok(()),
        }
    }

    fn on_pubrel(&mut self, ack: Ack) -> Step {
        let known = self.inbound_qos2.remove(&ack.packet_id);
        let v5 = self.protocol.is_some_and(ProtocolVersion::is_v5);
        let reason = if known || !v5 {
            ReasonCodes::SUCCESS
        } else {
            PACKET_ID_NOT_FOUND
        };
        self.send(&Frame::PubComp(Ack {
            packet_id: ack.packet_id,
            reason,
        }))
    }

    fn on_subscribe(&mut self, subscribe: SubscribePacket) -> Step {
        let mut return_codes = Vec::with_capacity(subscribe.filters.len());
        for request in &subscribe.filters {
            let code = self.subscribe_one(&request.filter, subscribe.subscription_identifier);
            return_codes.push(code);
        }
        self.send(&Frame::SubAck(SubAckPacket {
            packet_id: subscribe.packet_id,
            return_codes,
        }))
    }

    /// Register one filter and return its SUBACK code. Everything is granted at QoS 0.
    fn subscribe_one(&mut self, raw: &str, identifier: Option<u32>) -> u8 {
        let proto = self.protocol.unwrap_or(ProtocolVersion::V3_1_1);
        let failure = |code: InternalCode| {
            if proto.is_v5() {
                map_reason(proto, code)
            } else {
                SUBACK_FAILURE
            }
        };
        let (filter, group) = match parse_shared_filter(raw) {
            Ok(parsed) => parsed,
            Err(err) => {
                debug!(session_id = self.id, filter = raw, "bad shared filter: {err}");
                return failure(InternalCode::TopicInvalid);
            }
        };
        if let Err(err) = validate_filter(&filter) {
            debug!(session_id = self.id, filter = raw, "bad filter: {err}");
            return failure(InternalCode::TopicInvalid);
        }
        let Some(identity) = &self.identity else {
            return failure(InternalCode::NotAuthorized);
        };
        if !self
            .broker
            .policy()
            .evaluate(identity, &filter, Action::Subscribe)
        {
            warn!(session_id = self.id, client_id = %identity.client_id, filter = raw, "subscribe denied");
            return failure(InternalCode::NotAuthorized);
        }
        let registry = self.broker.registry();
        if let Some(previous) = self.subscriptions.remove(raw) {
            registry.unsubscribe(self.id, previous.id);
        }
        let id =
            registry.subscribe_with_identifier(self.id, &filter, group.as_deref(), 0, identifier);
        debug!(session_id = self.id, subscription_id = id, filter = raw, "subscribed");
        self.subscriptions
            .insert(raw.to_string(), SessionSubscription { id, filter });
        ReasonCodes::SUCCESS
    }

    fn on_unsubscribe(&mut self, unsubscribe: UnsubscribePacket) -> Step {
        let registry = self.broker.registry();
        let reason_codes = unsubscribe
            .filters
            .iter()
            .map(|raw| match self.subscriptions.remove(raw) {
                Some(subscription) => {
                    registry.unsubscribe(self.id, subscription.id);
                    ReasonCodes::SUCCESS
                }
                None => ReasonCodes::NO_SUBSCRIPTION_EXISTED,
            })
            .collect();
        self.send(&Frame::UnsubAck(UnsubAckPacket {
            packet_id: unsubscribe.packet_id,
            reason_codes,
        }))
    }

    fn on_ping(&mut self) -> Step {
        self.send(&Frame::PingResp)?;
        if self.flags.mark_first_keepalive_ack() {
            if let Some(info) = self.pending_info.take() {
                self.deliver_info(&info)?;
            }
        }
        Ok(())
    }

    async fn on_outbound(&mut self, out: Outbound) -> Step {
        match out {
            Outbound::Deliver {
                topic,
                payload,
                identifier,
            } => {
                if self.phase != SessionPhase::Active {
                    return Ok(());
                }
                self.send(&Frame::Publish(PublishPacket {
                    topic,
                    payload,
                    qos: Qos::AtMostOnce,
                    packet_id: None,
                    dup: false,
                    retain: false,
                    subscription_identifier: identifier,
                }))?;
            }
            Outbound::ServerInfo(info) => match self.flags.note_info_update() {
                InfoDelivery::Immediate => self.deliver_info(&info)?,
                InfoDelivery::Deferred => self.pending_info = Some(info),
            },
        }
        self.flush().await
    }

    /// Publish the info document if this session subscribed to a filter covering it.
    fn deliver_info(&mut self, info: &ServerInfo) -> Step {
        let interested = self
            .subscriptions
            .values()
            .any(|sub| mqtt_topic_matches(&sub.filter, SERVER_INFO_TOPIC));
        if !interested {
            return Ok(());
        }
        let payload = match serde_json::to_vec(info) {
            Ok(payload) => payload,
            Err(err) => {
                warn!(session_id = self.id, "server info not serializable: {err}");
                return Ok(());
            }
        };
        self.send(&Frame::Publish(PublishPacket {
            topic: SERVER_INFO_TOPIC.to_string(),
            payload: Bytes::from(payload),
            qos: Qos::AtMostOnce,
            packet_id: None,
            dup: false,
            retain: false,
            subscription_identifier: None,
        }))
    }

    /// Encode into the write buffer; [`Self::flush`] puts it on the wire.
    fn send(&mut self, frame: &Frame) -> Step {
        let proto = self.protocol.unwrap_or(ProtocolVersion::V3_1_1);
        encode_frame(frame, proto, &mut self.write_buf)
            .map_err(|err| CloseReason::ProtocolError(format!("encode {}: {err}", frame.name())))?;
        if matches!(frame, Frame::Publish(_)) {
            self.shared.stats.record_msg_out();
            self.broker.traffic().record_msg_out();
        }
        Ok(())
    }

    async fn flush(&mut self) -> Step {
        if self.write_buf.is_empty() {
            return Ok(());
        }
        let data = self.write_buf.split();
        let deadline = self.broker.options().write_deadline();
        let writer = &mut self.writer;
        let write = async {
            writer.write_all(&data).await?;
            writer.flush().await
        };
        match timeout(deadline, write).await {
            Ok(Ok(())) => {
                self.shared.stats.record_bytes_out(data.len());
                self.broker.traffic().record_bytes_out(data.len());
                Ok(())
            }
            Ok(Err(err)) if is_disconnect(&err) => Err(CloseReason::PeerClosed),
            Ok(Err(err)) => Err(CloseReason::Io(err.to_string())),
            Err(_) => {
                self.broker.record_slow_consumer(&self.shared);
                Err(CloseReason::SlowConsumer)
            }
        }
    }

    /// Best-effort goodbye: a refusal CONNACK or an MQTT 5 DISCONNECT, when the reason has one.
    async fn farewell(&mut self, reason: &CloseReason) {
        let frame = match (self.protocol, reason) {
            (None, CloseReason::MalformedPacket(CodecError::UnsupportedProtocol(_))) => {
                Some(Frame::ConnAck(ConnAckPacket {
                    session_present: false,
                    reason: LegacyConnAck::UNACCEPTABLE_PROTOCOL,
                    properties: ConnAckProperties::default(),
                }))
            }
            (Some(proto), _) if proto.is_v5() && self.phase == SessionPhase::Closing => {
                let code = match reason {
                    CloseReason::ServerShutdown => Some(InternalCode::ServerShuttingDown),
                    CloseReason::KeepaliveTimeout => Some(InternalCode::KeepAliveTimeout),
                    CloseReason::MalformedPacket(CodecError::PayloadTooLarge { .. }) => {
                        Some(InternalCode::PacketTooLarge)
                    }
                    CloseReason::MalformedPacket(CodecError::UnexpectedPacket(_))
                    | CloseReason::ProtocolError(_) => Some(InternalCode::ProtocolError),
                    CloseReason::MalformedPacket(_) => Some(InternalCode::MalformedPacket),
                    _ => None,
                };
                code.map(|code| {
                    Frame::Disconnect(DisconnectPacket {
                        reason: map_reason(proto, code),
                        reason_string: None,
                    })
                })
            }
            _ => None,
        };
        if matches!(reason, CloseReason::SlowConsumer | CloseReason::Io(_)) {
            return;
        }
        if let Some(frame) = frame {
            let _ = self.send(&frame);
        }
        if self.write_buf.is_empty() {
            return;
        }
        let data = self.write_buf.split();
        let deadline = self.broker.options().write_deadline();
        let writer = &mut self.writer;
        let _ = timeout(deadline, async {
            writer.write_all(&data).await?;
            writer.flush().await
        })
        .await;
    }

    async fn close(mut self, reader: OwnedReadHalf, reason: CloseReason) {
        self.set_phase(SessionPhase::Closing);
        self.farewell(&reason).await;
        if reason.is_failure() {
            warn!(
                session_id = self.id,
                client_id = %self.client_id(),
                peer = %self.peer,
                "session closed: {reason}"
            );
        } else {
            info!(
                session_id = self.id,
                client_id = %self.client_id(),
                peer = %self.peer,
                "session closed: {reason}"
            );
        }
        let (hits, misses) = self.permissions.counters();
        debug!(
            session_id = self.id,
            permission_hits = hits,
            permission_misses = misses,
            "permission cache"
        );
        let removed = self.broker.teardown(self.id, (reader, self.writer));
        debug!(session_id = self.id, subscriptions = removed, "session deregistered");
        self.flags.reset();
        self.shared.set_phase(SessionPhase::Closed);
    }
}

fn is_disconnect(err: &std::io::Error) -> bool {
    matches!(
        err.kind(),
        std::io::ErrorKind::UnexpectedEof
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::BrokenPipe
    )
}
