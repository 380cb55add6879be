//! Bridge server lifecycle and per-connection pipeline.
//!
//! # Lifecycle
//!
//! ```text
//! BridgeServer::new(config)
//!       |
//!       v
//! BridgeServer::start() --> BridgeHandle
//!       |                       |
//!       v                       |
//! accept loop                   |
//!   +-- session task per conn   |
//!   +-- throughput sampler      v
//!       |               BridgeHandle::shutdown()
//!       v                       |
//! close all sessions <----------+
//! (reason: shutdown)
//! ```
//!
//! # Connection Pipeline
//!
//! ```text
//! accept -> trust filter -> authorizer -> admission -> handshake
//!        -> register session -> resolve -> upstream connect (backoff)
//!        -> CONNECT / direct -> REP 0x00 -> relay -> close + history
//! ```

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::events::BridgeEvent;
use crate::forward::{self, ForwardMode};
use crate::heartbeat::{ClientActivity, HeartbeatConfig};
use crate::registry::{DeviceSnapshot, Registry, Statistics, DEFAULT_HISTORY_LIMIT};
use crate::relay::{Relay, RelayConfig};
use crate::session::{CloseReason, Session, SessionSnapshot, SessionState};
use crate::socks5::{self, reply, TargetAddr};
use crate::trust::{is_trusted_source, AllowAll, PeerAuthorizer, TrustPolicy};
use crate::upstream::{BackoffPolicy, Reachability, UpstreamSupervisor, UpstreamTarget};
use crate::{BridgeError, Result};

/// Log target for trust and authorization decisions.
const SECURITY_TARGET: &str = "sockbridge::security";

const SAMPLE_INTERVAL: Duration = Duration::from_secs(1);
const DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Configuration for the bridge server.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Address the SOCKS5 listener binds to.
    /// Default: `0.0.0.0:9000`
    pub listen_addr: SocketAddr,

    /// Upstream HTTP debugging proxy host.
    /// Default: `localhost`
    pub upstream_host: String,

    /// Upstream HTTP debugging proxy port.
    /// Default: `8888`
    pub upstream_port: u16,

    /// Maximum concurrently admitted connections, handshaking included.
    /// Default: 100
    pub max_connections: usize,

    /// Close a forwarding session after this long without traffic.
    /// Default: 60 seconds
    pub idle_timeout: Duration,

    /// Deadline for the SOCKS5 greeting and request.
    /// Default: 10 seconds
    pub handshake_timeout: Duration,

    /// Per-attempt TCP connect timeout to the upstream proxy.
    /// Default: 5 seconds
    pub upstream_connect_timeout: Duration,

    /// Heartbeat schedule.
    pub heartbeat: HeartbeatConfig,

    /// Upstream retry schedule.
    pub backoff: BackoffPolicy,

    /// Relay buffer high watermark in bytes.
    /// Default: 64 KiB
    pub flow_high_watermark: usize,

    /// Relay buffer low watermark in bytes.
    /// Default: 32 KiB
    pub flow_low_watermark: usize,

    /// Source address policy.
    pub trust: TrustPolicy,

    /// Closed sessions kept in history.
    /// Default: 50
    pub history_limit: usize,

    /// Certificate fingerprint advertised for pairing, if any.
    pub fingerprint: Option<String>,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        let relay = RelayConfig::default();
        Self {
            listen_addr: "0.0.0.0:9000".parse().expect("hardcoded wildcard address"),
            upstream_host: "localhost".to_string(),
            upstream_port: 8888,
            max_connections: 100,
            idle_timeout: relay.idle_timeout,
            handshake_timeout: Duration::from_secs(10),
            upstream_connect_timeout: Duration::from_secs(5),
            heartbeat: relay.heartbeat,
            backoff: BackoffPolicy::default(),
            flow_high_watermark: relay.high_watermark,
            flow_low_watermark: relay.low_watermark,
            trust: TrustPolicy::default(),
            history_limit: DEFAULT_HISTORY_LIMIT,
            fingerprint: None,
        }
    }
}

impl BridgeConfig {
    /// Upstream `host:port`.
    pub fn upstream_authority(&self) -> String {
        UpstreamTarget::new(self.upstream_host.clone(), self.upstream_port).authority()
    }

    fn relay_config(&self) -> RelayConfig {
        RelayConfig {
            idle_timeout: self.idle_timeout,
            high_watermark: self.flow_high_watermark,
            low_watermark: self.flow_low_watermark,
            heartbeat: self.heartbeat.clone(),
        }
    }
}

/// What the discovery layer advertises about this bridge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Advertisement {
    pub port: u16,
    pub active: bool,
    pub fingerprint: Option<String>,
}

/// State shared by the accept loop and every session task.
pub(crate) struct Bridge {
    config: BridgeConfig,
    registry: Arc<Registry>,
    authorizer: Arc<dyn PeerAuthorizer>,
    upstream: UpstreamSupervisor,
}

impl Bridge {
    fn new(config: BridgeConfig, authorizer: Arc<dyn PeerAuthorizer>) -> Self {
        let registry = Arc::new(Registry::with_history_limit(
            config.max_connections,
            config.history_limit,
        ));
        let upstream = UpstreamSupervisor::new(
            Arc::new(UpstreamTarget::new(
                config.upstream_host.clone(),
                config.upstream_port,
            )),
            config.backoff.clone(),
            config.upstream_connect_timeout,
            Arc::clone(&registry),
        );
        Self {
            config,
            registry,
            authorizer,
            upstream,
        }
    }

    /// Serve one accepted connection from start to finish.
    pub(crate) async fn serve<S>(self: Arc<Self>, mut stream: S, peer: SocketAddr)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        if !is_trusted_source(peer.ip(), &self.config.trust) {
            warn!(target: SECURITY_TARGET, peer = %peer, "Rejected connection from untrusted source address");
            return;
        }
        if !self.authorizer.is_authorized(peer.ip()) {
            warn!(target: SECURITY_TARGET, peer = %peer, "Rejected connection from unauthorized peer");
            return;
        }

        let Some(_permit) = self.registry.try_admit() else {
            warn!(
                peer = %peer,
                ceiling = self.registry.ceiling(),
                "Connection ceiling reached, rejecting"
            );
            let rejected = tokio::time::timeout(
                self.config.handshake_timeout,
                socks5::reject(&mut stream, reply::GENERAL_FAILURE),
            )
            .await;
            if let Ok(Err(e)) = rejected {
                debug!(peer = %peer, error = %e, "Failed to send rejection");
            }
            return;
        };

        let target = match tokio::time::timeout(
            self.config.handshake_timeout,
            socks5::handshake(&mut stream),
        )
        .await
        {
            Ok(Ok(target)) => target,
            Ok(Err(e)) => {
                if let Some(code) = e.reply_code() {
                    // Best-effort: the client may already be gone.
                    socks5::send_reply(&mut stream, code).await.ok();
                }
                debug!(peer = %peer, error = %e, "SOCKS5 handshake failed");
                return;
            }
            Err(_) => {
                let e = BridgeError::HandshakeTimeout(self.config.handshake_timeout);
                debug!(peer = %peer, error = %e, "SOCKS5 handshake failed");
                return;
            }
        };

        let mut session = Session::new(peer, target);
        self.registry.open(&session);
        info!(
            session = %session.id(),
            peer = %peer,
            target_addr = %session.target(),
            "Session opened"
        );

        let reason = match self.forward(&mut session, stream).await {
            Ok(reason) => reason,
            Err(e) => {
                debug!(session = %session.id(), error = %e, "Session failed");
                e.close_reason()
            }
        };

        if reason == CloseReason::HeartbeatTimeout {
            warn!(session = %session.id(), peer = %peer, "Heartbeat timed out, closing session");
            self.registry.publish(BridgeEvent::HeartbeatTimeout {
                id: session.id(),
                source: peer,
            });
        }

        if let Err(e) = session.transition(SessionState::Closed) {
            debug!(session = %session.id(), error = %e, "Unexpected close transition");
        }
        let summary = session.summary(reason);
        info!(
            session = %summary.id,
            reason = %reason,
            bytes_sent = summary.bytes_sent,
            bytes_received = summary.bytes_received,
            duration_ms = summary.duration.as_millis() as u64,
            "Session closed"
        );
        self.registry.close(summary);
    }

    /// Resolve, reach the upstream proxy, reply to the client and relay.
    async fn forward<S>(&self, session: &mut Session, mut client: S) -> Result<CloseReason>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let target = session.target().clone();

        if let TargetAddr::Domain(..) = &target {
            if let Err(e) = socks5::resolve(&target).await {
                warn!(session = %session.id(), target_addr = %target, error = %e, "DNS resolution failed");
                socks5::send_reply(&mut client, reply::HOST_UNREACHABLE).await.ok();
                return Err(e);
            }
        }

        let mut upstream = match self.upstream.connect().await {
            Ok(stream) => stream,
            Err(e) => {
                warn!(session = %session.id(), error = %e, "Upstream proxy connection failed");
                socks5::send_reply(&mut client, reply::CONNECTION_REFUSED).await.ok();
                return Err(e);
            }
        };

        let mode = ForwardMode::for_port(target.port());
        let leftover = match mode {
            ForwardMode::Tunnel => {
                let tunnel = tokio::time::timeout(
                    self.config.upstream_connect_timeout,
                    forward::establish_tunnel(&mut upstream, &target),
                )
                .await
                .unwrap_or_else(|_| {
                    Err(BridgeError::TunnelRejected {
                        target: target.authority(),
                        status: "timed out waiting for CONNECT response".to_string(),
                    })
                });
                match tunnel {
                    Ok(leftover) => leftover,
                    Err(e) => {
                        warn!(session = %session.id(), target_addr = %target, error = %e, "Upstream tunnel failed");
                        let code = e.reply_code().unwrap_or(reply::GENERAL_FAILURE);
                        socks5::send_reply(&mut client, code).await.ok();
                        return Err(e);
                    }
                }
            }
            ForwardMode::Direct => Bytes::new(),
        };

        socks5::send_reply(&mut client, reply::SUCCEEDED).await?;
        session.transition(SessionState::Connected)?;
        self.registry.update(session);
        debug!(session = %session.id(), mode = ?mode, "Upstream established");

        if mode == ForwardMode::Direct {
            forward::prime_direct(
                &mut client,
                &mut upstream,
                &target,
                self.config.handshake_timeout,
                session.counters(),
            )
            .await?;
        }

        if let Some(reason) = session.close_signal().reason() {
            return Ok(reason);
        }

        session.transition(SessionState::Forwarding)?;
        self.registry.update(session);

        let relay = Relay {
            config: self.config.relay_config(),
            session: session.id(),
            source: session.source().ip(),
            counters: Arc::clone(session.counters()),
            close: session.close_signal().clone(),
            registry: Arc::clone(&self.registry),
        };
        Ok(relay.run(client, upstream, leftover).await)
    }
}

/// Accept connections until `shutdown` resolves, then close every session.
async fn accept_loop<F>(listener: TcpListener, bridge: Arc<Bridge>, shutdown: F) -> Result<()>
where
    F: std::future::Future<Output = ()>,
{
    let mut sessions = JoinSet::new();
    let mut sampler = tokio::time::interval(SAMPLE_INTERVAL);
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => break,

            _ = sampler.tick() => {
                bridge.registry.sample_throughput(tokio::time::Instant::now());
            }

            Some(_) = sessions.join_next(), if !sessions.is_empty() => {}

            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    // Best-effort: latency matters more than batching here.
                    let _ = stream.set_nodelay(true);
                    sessions.spawn(Arc::clone(&bridge).serve(stream, peer));
                }
                Err(e) => {
                    warn!(error = %e, "TCP accept error");
                }
            },
        }
    }

    drop(listener);
    let signalled = bridge.registry.close_all(CloseReason::Shutdown);
    info!(sessions = signalled, "Bridge shutting down");

    let drained = tokio::time::timeout(DRAIN_TIMEOUT, async {
        while sessions.join_next().await.is_some() {}
    })
    .await;
    if drained.is_err() {
        debug!(remaining = sessions.len(), "Aborting sessions still in progress");
        sessions.abort_all();
        while sessions.join_next().await.is_some() {}
    }
    Ok(())
}

/// Handle for controlling a running bridge.
pub struct BridgeHandle {
    shutdown_tx: Option<oneshot::Sender<()>>,
    join_handle: Option<tokio::task::JoinHandle<Result<()>>>,
    local_addr: SocketAddr,
    bridge: Arc<Bridge>,
}

impl BridgeHandle {
    /// Check if the accept loop is still running.
    pub fn is_running(&self) -> bool {
        self.join_handle
            .as_ref()
            .map(|h| !h.is_finished())
            .unwrap_or(false)
    }

    /// Address the listener is actually bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.bridge.registry
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BridgeEvent> {
        self.bridge.registry.subscribe()
    }

    pub fn statistics(&self) -> Statistics {
        self.bridge.registry.statistics()
    }

    pub fn sessions(&self) -> Vec<SessionSnapshot> {
        self.bridge.registry.sessions()
    }

    pub fn devices(&self) -> Vec<DeviceSnapshot> {
        self.bridge.registry.devices()
    }

    pub fn upstream_reachability(&self) -> Reachability {
        self.bridge.upstream.target().reachability()
    }

    /// Data for the discovery layer: port, active flag, fingerprint.
    pub fn advertisement(&self) -> Advertisement {
        Advertisement {
            port: self.local_addr.port(),
            active: self.is_running(),
            fingerprint: self.bridge.config.fingerprint.clone(),
        }
    }

    /// Client reports foreground/background; picks the heartbeat interval.
    pub fn set_client_activity(&self, client: std::net::IpAddr, activity: ClientActivity) {
        self.bridge.registry.set_client_activity(client, activity);
    }

    /// Attach a display name to a client address.
    pub fn set_device_name(&self, client: std::net::IpAddr, name: impl Into<String>) {
        self.bridge.registry.set_display_name(client, name);
    }

    /// Shut down gracefully.
    ///
    /// Stops accepting, closes every live session with reason `shutdown` and
    /// waits up to 2 seconds for the accept loop to finish.
    ///
    /// # Errors
    /// Currently infallible; always returns `Ok`.
    pub async fn shutdown(mut self) -> Result<()> {
        let signal_sent = match self.shutdown_tx.take() {
            Some(tx) => tx.send(()).is_ok(),
            None => false,
        };

        if let Some(handle) = self.join_handle.take() {
            if signal_sent {
                match tokio::time::timeout(Duration::from_secs(2), handle).await {
                    Ok(Ok(Err(e))) => debug!(error = %e, "Accept loop ended with error"),
                    Ok(_) => {}
                    Err(_) => debug!("Accept loop did not stop within 2s"),
                }
            } else {
                handle.abort();
            }
        }

        Ok(())
    }
}

/// SOCKS5 bridge server.
pub struct BridgeServer {
    config: BridgeConfig,
    bridge: Arc<Bridge>,
}

impl BridgeServer {
    /// Create a bridge server.
    ///
    /// # Errors
    /// * `BridgeError::Internal` - if the flow watermarks are inverted.
    pub fn new(config: BridgeConfig) -> Result<Self> {
        Self::with_authorizer(config, AllowAll)
    }

    /// Create a bridge server with a custom peer authorizer.
    pub fn with_authorizer<A>(config: BridgeConfig, authorizer: A) -> Result<Self>
    where
        A: PeerAuthorizer + 'static,
    {
        if config.flow_low_watermark >= config.flow_high_watermark {
            return Err(BridgeError::Internal(format!(
                "flow low watermark ({}) must be below high watermark ({})",
                config.flow_low_watermark, config.flow_high_watermark
            )));
        }
        let bridge = Arc::new(Bridge::new(config.clone(), Arc::new(authorizer)));
        Ok(Self { config, bridge })
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.bridge.registry
    }

    /// Subscribe to events before starting, so nothing is missed.
    pub fn subscribe(&self) -> broadcast::Receiver<BridgeEvent> {
        self.bridge.registry.subscribe()
    }

    async fn bind(&self) -> Result<TcpListener> {
        TcpListener::bind(self.config.listen_addr)
            .await
            .map_err(|e| BridgeError::Bind {
                addr: self.config.listen_addr,
                source: e,
            })
    }

    /// Bind and spawn the accept loop.
    ///
    /// # Errors
    /// * `BridgeError::Bind` - if the listen address cannot be bound.
    pub async fn start(self) -> Result<BridgeHandle> {
        let listener = self.bind().await?;
        let local_addr = listener.local_addr().map_err(|e| BridgeError::Bind {
            addr: self.config.listen_addr,
            source: e,
        })?;

        info!(
            listen = %local_addr,
            upstream = %self.config.upstream_authority(),
            max_connections = self.config.max_connections,
            heartbeat = self.config.heartbeat.enabled,
            "Bridge listening"
        );

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let bridge = Arc::clone(&self.bridge);
        let join_handle = tokio::spawn(accept_loop(listener, bridge, async move {
            let _ = shutdown_rx.await;
        }));

        Ok(BridgeHandle {
            shutdown_tx: Some(shutdown_tx),
            join_handle: Some(join_handle),
            local_addr,
            bridge: self.bridge,
        })
    }

    /// Bind and serve until the process exits.
    ///
    /// # Errors
    /// * `BridgeError::Bind` - if the listen address cannot be bound.
    pub async fn run(self) -> Result<()> {
        let listener = self.bind().await?;
        accept_loop(listener, self.bridge, std::future::pending()).await
    }
}
