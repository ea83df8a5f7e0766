//! Broker core: session map, statistics, server info and shutdown orchestration.
//!
//! Lock order is fixed: the core state lock may be held while taking the subscription
//! registry lock, never the other way round. No lock is held across an `.await`.

use crate::audit;
use crate::config::Options;
use crate::listeners::run_admission_loop;
use crate::mqtt::protocol::ProtocolVersion;
use crate::mqtt::session::{
    self, Outbound, Registration, SessionPhase, SessionShared, TrafficSnapshot, TrafficStats,
};
use crate::mqtt::subscriptions::{RouteTarget, SubscriptionRegistry};
use crate::security::{AclPolicy, Authenticator, PolicyEvaluator};
use bytes::Bytes;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const READY_POLL_INTERVAL: Duration = Duration::from_millis(25);

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("invalid options: {0}")]
    InvalidOptions(String),
    #[error("broker is already running")]
    AlreadyRunning,
    #[error("broker is shutting down")]
    ShuttingDown,
    #[error("failed to bind listener on {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
}

/// Kind of peer behind an admitted connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ConnectionKind {
    Client,
    /// Reserved for cluster routes; refused at admission.
    Router,
}

/// Server description published on `$SYS/broker/info`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServerInfo {
    pub server_id: String,
    pub version: String,
    pub host: String,
    pub port: u16,
    pub max_payload: usize,
    pub auth_required: bool,
    pub connect_urls: Vec<String>,
}

/// Point-in-time view of one registered session.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub id: u64,
    pub kind: ConnectionKind,
    pub peer: SocketAddr,
    pub client_id: Option<String>,
    pub username: Option<String>,
    pub protocol: Option<ProtocolVersion>,
    pub keep_alive: u16,
    pub clean_start: bool,
    pub phase: SessionPhase,
    pub subscriptions: usize,
    pub connected_ms: u64,
    pub stats: TrafficSnapshot,
}

struct SessionHandle {
    kind: ConnectionKind,
    peer: SocketAddr,
    connected_at: Instant,
    cancel: CancellationToken,
    outbound: mpsc::Sender<Outbound>,
    shared: Arc<SessionShared>,
}

struct CoreState {
    running: bool,
    shutdown_started: bool,
    listener_addr: Option<SocketAddr>,
    sessions: HashMap<u64, SessionHandle>,
    next_id: u64,
    total_accepted: u64,
    info: Arc<ServerInfo>,
}

struct BrokerInner {
    options: Options,
    server_id: String,
    started_at: SystemTime,
    state: Mutex<CoreState>,
    registry: SubscriptionRegistry,
    authenticator: Authenticator,
    policy: Arc<dyn PolicyEvaluator>,
    stats: TrafficStats,
    shutdown: CancellationToken,
    tracker: TaskTracker,
    loop_exited: watch::Sender<bool>,
    stopped: watch::Sender<bool>,
}

/// Cloneable handle to one broker instance.
#[derive(Clone)]
pub struct Broker {
    inner: Arc<BrokerInner>,
}

impl std::fmt::Debug for Broker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Broker")
            .field("server_id", &self.inner.server_id)
            .field("sessions", &self.session_count())
            .finish()
    }
}

/// Signals the end of the admission loop however `start` returns.
struct LoopExitGuard<'a>(&'a watch::Sender<bool>);

impl Drop for LoopExitGuard<'_> {
    fn drop(&mut self) {
        self.0.send_replace(true);
    }
}

impl Broker {
    /// Build a broker from validated options with the ACL policy they describe.
    pub fn create(options: Options) -> Result<Self, BrokerError> {
        let policy: Arc<dyn PolicyEvaluator> = Arc::new(AclPolicy::new(options.acl.clone()));
        Self::create_with_policy(options, policy)
    }

    /// Build a broker that consults `policy` for publish and subscribe authorization.
    pub fn create_with_policy(
        options: Options,
        policy: Arc<dyn PolicyEvaluator>,
    ) -> Result<Self, BrokerError> {
        options
            .validate()
            .map_err(|err| BrokerError::InvalidOptions(format!("{err:#}")))?;
        let server_id = Uuid::new_v4().simple().to_string();
        let info = ServerInfo {
            server_id: server_id.clone(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            host: options.host.clone(),
            port: options.port,
            max_payload: options.max_payload,
            auth_required: options.auth.is_enabled(),
            connect_urls: Vec::new(),
        };
        let (loop_exited, _) = watch::channel(false);
        let (stopped, _) = watch::channel(false);
        Ok(Self {
            inner: Arc::new(BrokerInner {
                authenticator: Authenticator::new(options.auth.clone()),
                options,
                server_id,
                started_at: SystemTime::now(),
                state: Mutex::new(CoreState {
                    running: false,
                    shutdown_started: false,
                    listener_addr: None,
                    sessions: HashMap::new(),
                    next_id: 0,
                    total_accepted: 0,
                    info: Arc::new(info),
                }),
                registry: SubscriptionRegistry::default(),
                policy,
                stats: TrafficStats::default(),
                shutdown: CancellationToken::new(),
                tracker: TaskTracker::new(),
                loop_exited,
                stopped,
            }),
        })
    }

    /// Bind the listener and run the admission loop until shutdown is requested.
    pub async fn start(&self) -> Result<(), BrokerError> {
        {
            let mut state = self.inner.state.lock();
            if state.shutdown_started {
                return Err(BrokerError::ShuttingDown);
            }
            if state.running {
                return Err(BrokerError::AlreadyRunning);
            }
            state.running = true;
            self.inner.loop_exited.send_replace(false);
        }
        let _exit = LoopExitGuard(&self.inner.loop_exited);

        let addr = format!("{}:{}", self.inner.options.host, self.inner.options.port);
        let listener = match TcpListener::bind(&addr).await {
            Ok(listener) => listener,
            Err(source) => {
                error!(%addr, "failed to bind listener: {source}");
                self.inner.state.lock().running = false;
                return Err(BrokerError::Bind { addr, source });
            }
        };
        let local = listener.local_addr().ok();
        {
            let mut state = self.inner.state.lock();
            state.listener_addr = local;
            if let Some(local) = local {
                let mut info = (*state.info).clone();
                info.port = local.port();
                state.info = Arc::new(info);
            }
        }
        info!(
            server_id = %self.inner.server_id,
            version = env!("CARGO_PKG_VERSION"),
            addr = ?local,
            max_connections = self.inner.options.max_connections,
            "listening for client connections"
        );
        self.install_signal_handler();
        run_admission_loop(listener, self.clone(), self.inner.shutdown.clone()).await;
        debug!("admission loop exited");
        Ok(())
    }

    fn install_signal_handler(&self) {
        let broker = self.clone();
        let shutdown = self.inner.shutdown.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = shutdown.cancelled() => {}
                signal = tokio::signal::ctrl_c() => match signal {
                    Ok(()) => {
                        info!("interrupt received, shutting down");
                        broker.shutdown().await;
                    }
                    Err(err) => warn!("unable to listen for interrupt: {err}"),
                },
            }
        });
    }

    /// Stop accepting, close every session and wait for all session tasks.
    ///
    /// Idempotent; concurrent callers all return once the drain has finished. The drain runs
    /// on its own task, so dropping a caller's future does not leave it half done.
    pub async fn shutdown(&self) {
        let was_running = {
            let mut state = self.inner.state.lock();
            if state.shutdown_started {
                None
            } else {
                state.shutdown_started = true;
                Some(std::mem::replace(&mut state.running, false))
            }
        };
        if let Some(was_running) = was_running {
            let broker = self.clone();
            tokio::spawn(async move { broker.drain(was_running).await });
        }
        self.done().await;
    }

    async fn drain(&self, was_running: bool) {
        info!(server_id = %self.inner.server_id, "broker shutting down");
        self.inner.shutdown.cancel();
        if was_running {
            let mut loop_exited = self.inner.loop_exited.subscribe();
            let _ = loop_exited.wait_for(|exited| *exited).await;
        }
        self.inner.tracker.close();
        self.inner.tracker.wait().await;
        let stats = self.stats();
        info!(
            msgs_in = stats.msgs_in,
            msgs_out = stats.msgs_out,
            slow_consumers = stats.slow_consumers,
            "broker shutdown complete"
        );
        self.inner.stopped.send_replace(true);
    }

    /// Resolves once a shutdown has completed.
    pub async fn done(&self) {
        let mut stopped = self.inner.stopped.subscribe();
        let _ = stopped.wait_for(|stopped| *stopped).await;
    }

    /// Register an accepted connection and spawn its session task, or refuse it.
    pub fn admit(&self, stream: TcpStream, peer: SocketAddr, kind: ConnectionKind) {
        if kind == ConnectionKind::Router {
            warn!(%peer, "route connections are not supported, connection refused");
            audit::emit(
                "connection_refused",
                "",
                &peer.to_string(),
                "route connections are not supported",
            );
            return;
        }
        let registration = {
            let mut state = self.inner.state.lock();
            if !state.running {
                debug!(%peer, "not running, dropping connection");
                return;
            }
            let max = self.inner.options.max_connections;
            if max > 0 && state.sessions.len() >= max {
                drop(state);
                warn!(%peer, max_connections = max, "maximum connections exceeded, connection refused");
                audit::emit(
                    "connection_refused",
                    "",
                    &peer.to_string(),
                    "maximum connections exceeded",
                );
                return;
            }
            state.next_id += 1;
            state.total_accepted += 1;
            let id = state.next_id;
            let (outbound, outbound_rx) =
                mpsc::channel(self.inner.options.outbound_queue_capacity);
            let cancel = self.inner.shutdown.child_token();
            let shared = Arc::new(SessionShared::default());
            state.sessions.insert(
                id,
                SessionHandle {
                    kind,
                    peer,
                    connected_at: Instant::now(),
                    cancel: cancel.clone(),
                    outbound,
                    shared: Arc::clone(&shared),
                },
            );
            Registration {
                id,
                peer,
                shared,
                cancel,
                outbound_rx,
            }
        };
        debug!(session_id = registration.id, %peer, "connection admitted");
        self.inner
            .tracker
            .spawn(session::serve(self.clone(), registration, stream));
    }

    /// Remove a session from the map and the registry, closing its socket under the core lock.
    pub(crate) fn teardown<S>(&self, session_id: u64, socket: S) -> usize {
        let mut state = self.inner.state.lock();
        state.sessions.remove(&session_id);
        let removed = self.inner.registry.remove_session(session_id);
        drop(socket);
        drop(state);
        removed
    }

    /// Fan a routed publish out to the targets' outbound queues.
    pub(crate) fn deliver(&self, targets: &[RouteTarget], topic: &str, payload: &Bytes) {
        if targets.is_empty() {
            return;
        }
        let state = self.inner.state.lock();
        for target in targets {
            let Some(handle) = state.sessions.get(&target.session_id) else {
                continue;
            };
            let out = Outbound::Deliver {
                topic: topic.to_string(),
                payload: payload.clone(),
                identifier: target.identifier,
            };
            match handle.outbound.try_send(out) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    if self.record_slow_consumer(&handle.shared) {
                        handle.cancel.cancel();
                    }
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {}
            }
        }
    }

    /// Count a slow consumer once per session; true when this call made the verdict.
    pub(crate) fn record_slow_consumer(&self, shared: &SessionShared) -> bool {
        if !shared.mark_slow() {
            return false;
        }
        shared.stats.record_slow_consumer();
        self.inner.stats.record_slow_consumer();
        warn!(
            client_id = shared.meta().client_id.as_deref().unwrap_or(""),
            "slow consumer detected"
        );
        true
    }

    /// Replace the advertised connect URLs and notify every session.
    pub fn advertise_connect_urls(&self, urls: Vec<String>) {
        let mut state = self.inner.state.lock();
        let mut info = (*state.info).clone();
        info.connect_urls = urls;
        let info = Arc::new(info);
        state.info = Arc::clone(&info);
        for (id, handle) in &state.sessions {
            if let Err(err) = handle.outbound.try_send(Outbound::ServerInfo(Arc::clone(&info))) {
                debug!(session_id = id, "info update not queued: {err}");
            }
        }
    }

    pub fn session_count(&self) -> usize {
        self.inner.state.lock().sessions.len()
    }

    pub fn subscription_count(&self) -> usize {
        self.inner.registry.count()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.state.lock().listener_addr
    }

    pub fn total_accepted(&self) -> u64 {
        self.inner.state.lock().total_accepted
    }

    pub fn is_running(&self) -> bool {
        self.inner.state.lock().running
    }

    pub fn stats(&self) -> TrafficSnapshot {
        self.inner.stats.snapshot()
    }

    pub fn info(&self) -> Arc<ServerInfo> {
        Arc::clone(&self.inner.state.lock().info)
    }

    pub fn server_id(&self) -> &str {
        &self.inner.server_id
    }

    /// Seconds since the Unix epoch at which this broker was created.
    pub fn started_at(&self) -> u64 {
        self.inner
            .started_at
            .duration_since(UNIX_EPOCH)
            .map_or(0, |elapsed| elapsed.as_secs())
    }

    pub fn options(&self) -> &Options {
        &self.inner.options
    }

    pub fn registry(&self) -> &SubscriptionRegistry {
        &self.inner.registry
    }

    pub fn session_snapshots(&self) -> Vec<SessionSnapshot> {
        let state = self.inner.state.lock();
        let mut snapshots: Vec<SessionSnapshot> = state
            .sessions
            .iter()
            .map(|(id, handle)| {
                let meta = handle.shared.meta();
                SessionSnapshot {
                    id: *id,
                    kind: handle.kind,
                    peer: handle.peer,
                    client_id: meta.client_id,
                    username: meta.username,
                    protocol: meta.protocol,
                    keep_alive: meta.keep_alive,
                    clean_start: meta.clean_start,
                    phase: meta.phase,
                    subscriptions: self.inner.registry.count_for_session(*id),
                    connected_ms: handle.connected_at.elapsed().as_millis() as u64,
                    stats: handle.shared.stats.snapshot(),
                }
            })
            .collect();
        snapshots.sort_by_key(|snapshot| snapshot.id);
        snapshots
    }

    /// Poll until the listener is bound and accepting, or `wait` elapses.
    pub async fn ready_for_connections(&self, wait: Duration) -> bool {
        let deadline = Instant::now() + wait;
        loop {
            {
                let state = self.inner.state.lock();
                if state.running && state.listener_addr.is_some() {
                    return true;
                }
            }
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(READY_POLL_INTERVAL).await;
        }
    }

    pub(crate) fn authenticator(&self) -> &Authenticator {
        &self.inner.authenticator
    }

    pub(crate) fn policy(&self) -> &dyn PolicyEvaluator {
        self.inner.policy.as_ref()
    }

    pub(crate) fn traffic(&self) -> &TrafficStats {
        &self.inner.stats
    }
}
