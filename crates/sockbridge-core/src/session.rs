//! Per-connection session state.
//!
//! A [`Session`] is created once the CONNECT request has been parsed and is
//! owned by the task serving that connection. Other parties only ever see it
//! through cheap shared handles:
//!
//! - [`SessionCounters`]: byte counters and last-activity timestamp, updated
//!   by the relay tasks.
//! - [`CloseSignal`]: idempotent close trigger, fired by whichever task
//!   detects the end of the session first (EOF, idle timeout, heartbeat
//!   failure, shutdown).
//!
//! State only ever moves forward:
//!
//! ```text
//! Handshaking -> Connected -> Forwarding -> Closed
//!      |             |                      ^
//!      +-------------+----------------------+
//! ```

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Serialize, Serializer};
use tokio::sync::watch;
use tokio::time::Instant;

use crate::socks5::TargetAddr;
use crate::{BridgeError, Result};

/// Opaque session identifier, unique for the lifetime of the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(u64);

impl SessionId {
    /// Allocate the next identifier.
    ///
    /// The upper 32 bits hold the process start second so identifiers from
    /// consecutive runs do not collide in logs; the lower 32 bits count up.
    pub fn next() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        static EPOCH: std::sync::OnceLock<u64> = std::sync::OnceLock::new();

        let epoch = *EPOCH.get_or_init(|| {
            SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs() & 0xFFFF_FFFF)
                .unwrap_or(0)
        });
        let seq = COUNTER.fetch_add(1, Ordering::Relaxed) & 0xFFFF_FFFF;
        SessionId((epoch << 32) | seq)
    }

    /// Raw numeric value.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

impl Serialize for SessionId {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.collect_str(self)
    }
}

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Request parsed, upstream not yet established.
    Handshaking,
    /// Upstream established and success reply sent.
    Connected,
    /// Bytes are being relayed.
    Forwarding,
    /// Terminal.
    Closed,
}

impl SessionState {
    /// Returns `true` if moving to `next` keeps the lifecycle monotonic.
    pub fn can_transition_to(self, next: SessionState) -> bool {
        next > self
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Handshaking => "handshaking",
            SessionState::Connected => "connected",
            SessionState::Forwarding => "forwarding",
            SessionState::Closed => "closed",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    /// The client finished sending.
    ClientClosed,
    /// The upstream proxy finished sending.
    UpstreamClosed,
    /// No bytes in either direction for the idle timeout.
    IdleTimeout,
    /// Heartbeat probes went unanswered.
    HeartbeatTimeout,
    /// Malformed or unsupported SOCKS5 traffic.
    ProtocolError,
    /// Domain target could not be resolved.
    ResolutionFailed,
    /// Upstream proxy unreachable or refused the tunnel.
    UpstreamUnreachable,
    /// Read or write failure on either side.
    IoError,
    /// The bridge is shutting down.
    Shutdown,
    /// Bug or invariant violation.
    InternalError,
}

impl CloseReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            CloseReason::ClientClosed => "client_closed",
            CloseReason::UpstreamClosed => "upstream_closed",
            CloseReason::IdleTimeout => "idle_timeout",
            CloseReason::HeartbeatTimeout => "heartbeat_timeout",
            CloseReason::ProtocolError => "protocol_error",
            CloseReason::ResolutionFailed => "resolution_failed",
            CloseReason::UpstreamUnreachable => "upstream_unreachable",
            CloseReason::IoError => "io_error",
            CloseReason::Shutdown => "shutdown",
            CloseReason::InternalError => "internal_error",
        }
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Byte counters and activity clock shared by the relay tasks.
#[derive(Debug)]
pub struct SessionCounters {
    origin: Instant,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    last_activity_ms: AtomicU64,
}

impl SessionCounters {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            last_activity_ms: AtomicU64::new(0),
        }
    }

    /// Record bytes written to the upstream proxy (client to upstream).
    pub fn add_sent(&self, n: usize) {
        self.bytes_sent.fetch_add(n as u64, Ordering::Relaxed);
        self.touch();
    }

    /// Record bytes written to the client (upstream to client).
    pub fn add_received(&self, n: usize) {
        self.bytes_received.fetch_add(n as u64, Ordering::Relaxed);
        self.touch();
    }

    /// Mark the session as active now.
    pub fn touch(&self) {
        let elapsed = self.origin.elapsed().as_millis() as u64;
        self.last_activity_ms.fetch_max(elapsed, Ordering::Relaxed);
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent.load(Ordering::Relaxed)
    }

    pub fn bytes_received(&self) -> u64 {
        self.bytes_received.load(Ordering::Relaxed)
    }

    /// Instant of the last recorded activity.
    pub fn last_activity(&self) -> Instant {
        self.origin + Duration::from_millis(self.last_activity_ms.load(Ordering::Relaxed))
    }

    /// Time since the last recorded activity.
    pub fn idle_for(&self) -> Duration {
        Instant::now().saturating_duration_since(self.last_activity())
    }
}

impl Default for SessionCounters {
    fn default() -> Self {
        Self::new()
    }
}

/// Idempotent, first-reason-wins close trigger for a session.
#[derive(Debug, Clone)]
pub struct CloseSignal {
    tx: Arc<watch::Sender<Option<CloseReason>>>,
}

impl CloseSignal {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self { tx: Arc::new(tx) }
    }

    /// Request the session to close.
    ///
    /// Returns `true` if this call closed the session, `false` if it was
    /// already closed (the original reason is kept).
    pub fn close(&self, reason: CloseReason) -> bool {
        self.tx.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(reason);
            true
        })
    }

    /// Reason the session was closed with, if any.
    pub fn reason(&self) -> Option<CloseReason> {
        *self.tx.borrow()
    }

    pub fn is_closed(&self) -> bool {
        self.reason().is_some()
    }

    /// Wait until the session is closed and return the reason.
    pub async fn closed(&self) -> CloseReason {
        let mut rx = self.tx.subscribe();
        loop {
            if let Some(reason) = *rx.borrow_and_update() {
                return reason;
            }
            if rx.changed().await.is_err() {
                // Unreachable while `self` holds the sender.
                return CloseReason::InternalError;
            }
        }
    }
}

impl Default for CloseSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// One client connection through the bridge.
#[derive(Debug)]
pub struct Session {
    id: SessionId,
    source: SocketAddr,
    target: TargetAddr,
    state: SessionState,
    created_at: SystemTime,
    started: Instant,
    counters: Arc<SessionCounters>,
    close: CloseSignal,
}

impl Session {
    /// Create a session in the `Handshaking` state.
    pub fn new(source: SocketAddr, target: TargetAddr) -> Self {
        Self {
            id: SessionId::next(),
            source,
            target,
            state: SessionState::Handshaking,
            created_at: SystemTime::now(),
            started: Instant::now(),
            counters: Arc::new(SessionCounters::new()),
            close: CloseSignal::new(),
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn source(&self) -> SocketAddr {
        self.source
    }

    pub fn target(&self) -> &TargetAddr {
        &self.target
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn created_at(&self) -> SystemTime {
        self.created_at
    }

    pub fn counters(&self) -> &Arc<SessionCounters> {
        &self.counters
    }

    pub fn close_signal(&self) -> &CloseSignal {
        &self.close
    }

    /// Move the session forward.
    ///
    /// Re-entering the current state is a no-op; moving backwards fails.
    pub fn transition(&mut self, next: SessionState) -> Result<()> {
        if next == self.state {
            return Ok(());
        }
        if !self.state.can_transition_to(next) {
            return Err(BridgeError::InvalidTransition {
                from: self.state,
                to: next,
            });
        }
        tracing::trace!(session = %self.id, from = %self.state, to = %next, "Session transition");
        self.state = next;
        Ok(())
    }

    /// Point-in-time view for the registry.
    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            id: self.id,
            source: self.source,
            target: self.target.clone(),
            state: self.state,
            created_at: self.created_at,
            bytes_sent: self.counters.bytes_sent(),
            bytes_received: self.counters.bytes_received(),
            idle: self.counters.idle_for(),
        }
    }

    /// Final record for the history ring buffer.
    pub fn summary(&self, reason: CloseReason) -> SessionSummary {
        SessionSummary {
            id: self.id,
            source: self.source,
            target: self.target.clone(),
            created_at: self.created_at,
            closed_at: SystemTime::now(),
            duration: self.started.elapsed(),
            bytes_sent: self.counters.bytes_sent(),
            bytes_received: self.counters.bytes_received(),
            reason,
        }
    }
}

/// Point-in-time view of a live session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionSnapshot {
    pub id: SessionId,
    pub source: SocketAddr,
    pub target: TargetAddr,
    pub state: SessionState,
    #[serde(serialize_with = "serialize_unix_millis")]
    pub created_at: SystemTime,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    #[serde(serialize_with = "serialize_millis")]
    pub idle: Duration,
}

/// Record of a closed session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionSummary {
    pub id: SessionId,
    pub source: SocketAddr,
    pub target: TargetAddr,
    #[serde(serialize_with = "serialize_unix_millis")]
    pub created_at: SystemTime,
    #[serde(serialize_with = "serialize_unix_millis")]
    pub closed_at: SystemTime,
    #[serde(serialize_with = "serialize_millis")]
    pub duration: Duration,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub reason: CloseReason,
}

impl SessionSummary {
    /// Bytes in both directions.
    pub fn total_bytes(&self) -> u64 {
        self.bytes_sent + self.bytes_received
    }
}

pub(crate) fn serialize_unix_millis<S>(
    time: &SystemTime,
    serializer: S,
) -> std::result::Result<S::Ok, S::Error>
where
    S: Serializer,
{
    let millis = time
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0);
    serializer.serialize_u64(millis)
}

pub(crate) fn serialize_millis<S>(
    duration: &Duration,
    serializer: S,
) -> std::result::Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_u64(duration.as_millis() as u64)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn session() -> Session {
        Session::new(
            "192.168.1.20:50000".parse().unwrap(),
            TargetAddr::Domain("example.com".to_string(), 443),
        )
    }

    // ========================================================================
    // SessionId Tests
    // ========================================================================

    #[test]
    fn test_session_ids_unique() {
        let a = SessionId::next();
        let b = SessionId::next();
        assert_ne!(a, b);
        assert_eq!(a.to_string().len(), 16);
    }

    // ========================================================================
    // State Machine Tests
    // ========================================================================

    #[test]
    fn test_happy_path_transitions() {
        let mut s = session();
        assert_eq!(s.state(), SessionState::Handshaking);
        s.transition(SessionState::Connected).unwrap();
        s.transition(SessionState::Forwarding).unwrap();
        s.transition(SessionState::Closed).unwrap();
        assert_eq!(s.state(), SessionState::Closed);
    }

    #[test]
    fn test_any_state_may_close() {
        let mut s = session();
        s.transition(SessionState::Closed).unwrap();

        let mut s = session();
        s.transition(SessionState::Connected).unwrap();
        s.transition(SessionState::Closed).unwrap();
    }

    #[test]
    fn test_backwards_transition_rejected() {
        let mut s = session();
        s.transition(SessionState::Forwarding).unwrap();
        let err = s.transition(SessionState::Connected).unwrap_err();
        assert!(matches!(
            err,
            BridgeError::InvalidTransition {
                from: SessionState::Forwarding,
                to: SessionState::Connected
            }
        ));
        assert_eq!(s.state(), SessionState::Forwarding);
    }

    #[test]
    fn test_closed_is_terminal() {
        let mut s = session();
        s.transition(SessionState::Closed).unwrap();
        assert!(s.transition(SessionState::Forwarding).is_err());
        assert!(s.transition(SessionState::Handshaking).is_err());
        // Re-closing is a no-op.
        s.transition(SessionState::Closed).unwrap();
    }

    // ========================================================================
    // Counter Tests
    // ========================================================================

    #[tokio::test(start_paused = true)]
    async fn test_counters_track_bytes_and_activity() {
        let counters = SessionCounters::new();
        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(counters.idle_for() >= Duration::from_secs(5));

        counters.add_sent(100);
        counters.add_received(250);
        assert_eq!(counters.bytes_sent(), 100);
        assert_eq!(counters.bytes_received(), 250);
        assert!(counters.idle_for() < Duration::from_millis(1));

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(counters.idle_for(), Duration::from_secs(2));
    }

    // ========================================================================
    // CloseSignal Tests
    // ========================================================================

    #[tokio::test]
    async fn test_close_signal_first_reason_wins() {
        let signal = CloseSignal::new();
        assert!(!signal.is_closed());

        assert!(signal.close(CloseReason::IdleTimeout));
        assert!(!signal.close(CloseReason::ClientClosed));

        assert_eq!(signal.reason(), Some(CloseReason::IdleTimeout));
        assert_eq!(signal.closed().await, CloseReason::IdleTimeout);
    }

    #[tokio::test]
    async fn test_close_signal_wakes_waiter() {
        let signal = CloseSignal::new();
        let waiter = {
            let signal = signal.clone();
            tokio::spawn(async move { signal.closed().await })
        };
        tokio::task::yield_now().await;

        signal.close(CloseReason::HeartbeatTimeout);
        assert_eq!(waiter.await.unwrap(), CloseReason::HeartbeatTimeout);
    }

    // ========================================================================
    // Snapshot / Summary Tests
    // ========================================================================

    #[test]
    fn test_summary_carries_totals_and_reason() {
        let s = session();
        s.counters().add_sent(10);
        s.counters().add_received(32);

        let summary = s.summary(CloseReason::ClientClosed);
        assert_eq!(summary.id, s.id());
        assert_eq!(summary.total_bytes(), 42);
        assert_eq!(summary.reason, CloseReason::ClientClosed);
        assert!(summary.closed_at >= summary.created_at);
    }

    #[test]
    fn test_snapshot_serializes_to_json() {
        let s = session();
        let json = serde_json::to_value(s.snapshot()).unwrap();
        assert_eq!(json["target"], "example.com:443");
        assert_eq!(json["state"], "handshaking");
        assert_eq!(json["source"], "192.168.1.20:50000");
        assert!(json["created_at"].as_u64().unwrap() > 0);
    }
}
