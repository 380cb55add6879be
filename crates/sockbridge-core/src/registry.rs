//! Connection registry.
//!
//! The registry is the single owner of cross-session state:
//!
//! - the admission counter enforcing the concurrency ceiling,
//! - the table of live sessions and their shared counters,
//! - per-device aggregates keyed by client IP,
//! - cumulative statistics and the bounded history of closed sessions,
//! - the broadcast channel carrying [`BridgeEvent`]s.
//!
//! Sessions publish into it; nothing reads session internals directly.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::net::IpAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, SystemTime};

use serde::Serialize;
use tokio::sync::broadcast;
use tokio::time::Instant;

use crate::events::BridgeEvent;
use crate::heartbeat::ClientActivity;
use crate::session::{
    serialize_unix_millis, CloseReason, CloseSignal, Session, SessionCounters, SessionId,
    SessionSnapshot, SessionState, SessionSummary,
};
use crate::socks5::TargetAddr;

/// Number of closed sessions kept in history.
pub const DEFAULT_HISTORY_LIMIT: usize = 50;

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// RAII admission slot. Dropping it frees the slot.
#[derive(Debug)]
pub struct AdmissionPermit {
    active: Arc<AtomicUsize>,
}

impl Drop for AdmissionPermit {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Aggregate counters across all sessions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Statistics {
    /// Sessions registered since startup.
    pub total_sessions: u64,
    /// Sessions currently registered.
    pub active_sessions: usize,
    /// Bytes client to upstream, closed and live sessions.
    pub bytes_sent: u64,
    /// Bytes upstream to client, closed and live sessions.
    pub bytes_received: u64,
    /// Bytes per second over the last sampling window.
    pub throughput_bps: u64,
    /// Most recent closed sessions, oldest first.
    pub history: Vec<SessionSummary>,
}

impl Statistics {
    pub fn total_bytes(&self) -> u64 {
        self.bytes_sent + self.bytes_received
    }
}

/// Point-in-time view of one client device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceSnapshot {
    pub address: IpAddr,
    pub display_name: Option<String>,
    pub activity: ClientActivity,
    pub sessions: Vec<SessionId>,
    #[serde(serialize_with = "serialize_unix_millis")]
    pub first_seen: SystemTime,
    #[serde(serialize_with = "serialize_unix_millis")]
    pub last_seen: SystemTime,
    pub total_bytes: u64,
}

struct LiveEntry {
    source: std::net::SocketAddr,
    target: TargetAddr,
    state: SessionState,
    created_at: SystemTime,
    counters: Arc<SessionCounters>,
    close: CloseSignal,
}

impl LiveEntry {
    fn snapshot(&self, id: SessionId) -> SessionSnapshot {
        SessionSnapshot {
            id,
            source: self.source,
            target: self.target.clone(),
            state: self.state,
            created_at: self.created_at,
            bytes_sent: self.counters.bytes_sent(),
            bytes_received: self.counters.bytes_received(),
            idle: self.counters.idle_for(),
        }
    }
}

struct DeviceEntry {
    sessions: BTreeSet<SessionId>,
    first_seen: SystemTime,
    last_seen: SystemTime,
    closed_bytes: u64,
}

/// Settings reported by the client side, kept across device churn.
#[derive(Default)]
struct DeviceHints {
    display_name: Option<String>,
    activity: ClientActivity,
}

#[derive(Default)]
struct Throughput {
    last_sample: Option<(Instant, u64)>,
    bytes_per_second: u64,
}

struct RegistryInner {
    live: HashMap<SessionId, LiveEntry>,
    devices: HashMap<IpAddr, DeviceEntry>,
    hints: HashMap<IpAddr, DeviceHints>,
    history: VecDeque<SessionSummary>,
    history_limit: usize,
    total_sessions: u64,
    closed_sent: u64,
    closed_received: u64,
    throughput: Throughput,
    draining: bool,
}

impl RegistryInner {
    fn totals(&self) -> (u64, u64) {
        self.live.values().fold(
            (self.closed_sent, self.closed_received),
            |(sent, received), entry| {
                (
                    sent + entry.counters.bytes_sent(),
                    received + entry.counters.bytes_received(),
                )
            },
        )
    }
}

/// Registry of live and recently closed sessions.
pub struct Registry {
    ceiling: usize,
    admitted: Arc<AtomicUsize>,
    inner: RwLock<RegistryInner>,
    events: broadcast::Sender<BridgeEvent>,
}

impl Registry {
    /// Create a registry admitting at most `ceiling` concurrent connections.
    pub fn new(ceiling: usize) -> Self {
        Self::with_history_limit(ceiling, DEFAULT_HISTORY_LIMIT)
    }

    pub fn with_history_limit(ceiling: usize, history_limit: usize) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            ceiling,
            admitted: Arc::new(AtomicUsize::new(0)),
            inner: RwLock::new(RegistryInner {
                live: HashMap::new(),
                devices: HashMap::new(),
                hints: HashMap::new(),
                history: VecDeque::with_capacity(history_limit),
                history_limit,
                total_sessions: 0,
                closed_sent: 0,
                closed_received: 0,
                throughput: Throughput::default(),
                draining: false,
            }),
            events,
        }
    }

    pub fn ceiling(&self) -> usize {
        self.ceiling
    }

    /// Connections currently holding an admission slot.
    pub fn admitted(&self) -> usize {
        self.admitted.load(Ordering::Acquire)
    }

    /// Claim an admission slot, or `None` if the ceiling is reached.
    pub fn try_admit(&self) -> Option<AdmissionPermit> {
        let mut current = self.admitted.load(Ordering::Acquire);
        loop {
            if current >= self.ceiling {
                return None;
            }
            match self.admitted.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    return Some(AdmissionPermit {
                        active: Arc::clone(&self.admitted),
                    })
                }
                Err(observed) => current = observed,
            }
        }
    }

    /// Subscribe to bridge events.
    pub fn subscribe(&self) -> broadcast::Receiver<BridgeEvent> {
        self.events.subscribe()
    }

    /// Push an event to subscribers. Having none is not an error.
    pub fn publish(&self, event: BridgeEvent) {
        tracing::trace!(event = event.kind(), "Publishing bridge event");
        let _ = self.events.send(event);
    }

    /// Register a freshly created session.
    ///
    /// While the registry is draining the session is closed immediately with
    /// [`CloseReason::Shutdown`].
    pub fn open(&self, session: &Session) {
        let now = SystemTime::now();
        let source_ip = session.source().ip();
        {
            let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
            if inner.draining {
                session.close_signal().close(CloseReason::Shutdown);
            }
            inner.total_sessions += 1;
            inner.live.insert(
                session.id(),
                LiveEntry {
                    source: session.source(),
                    target: session.target().clone(),
                    state: session.state(),
                    created_at: session.created_at(),
                    counters: Arc::clone(session.counters()),
                    close: session.close_signal().clone(),
                },
            );
            let device = inner.devices.entry(source_ip).or_insert_with(|| DeviceEntry {
                sessions: BTreeSet::new(),
                first_seen: now,
                last_seen: now,
                closed_bytes: 0,
            });
            device.sessions.insert(session.id());
            device.last_seen = now;
        }

        self.publish(BridgeEvent::SessionOpened {
            id: session.id(),
            source: session.source(),
            target: session.target().clone(),
        });
    }

    /// Record a state change of a live session.
    pub fn update(&self, session: &Session) {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        if let Some(entry) = inner.live.get_mut(&session.id()) {
            entry.state = session.state();
        }
    }

    /// Retire a session: fold its bytes into the totals and append it to
    /// history, evicting the oldest record beyond the limit.
    pub fn close(&self, summary: SessionSummary) {
        {
            let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
            if inner.live.remove(&summary.id).is_none() {
                tracing::debug!(session = %summary.id, "Closing session that was never registered");
            }

            inner.closed_sent += summary.bytes_sent;
            inner.closed_received += summary.bytes_received;

            let source_ip = summary.source.ip();
            let remove_device = match inner.devices.get_mut(&source_ip) {
                Some(device) => {
                    device.sessions.remove(&summary.id);
                    device.closed_bytes += summary.total_bytes();
                    device.last_seen = summary.closed_at;
                    device.sessions.is_empty()
                }
                None => false,
            };
            if remove_device {
                inner.devices.remove(&source_ip);
            }

            if inner.history_limit > 0 {
                while inner.history.len() >= inner.history_limit {
                    inner.history.pop_front();
                }
                inner.history.push_back(summary.clone());
            }
        }

        self.publish(BridgeEvent::SessionClosed { summary });
    }

    /// Publish the current byte counters of a live session.
    pub fn report_bytes(&self, id: SessionId, bytes_sent: u64, bytes_received: u64) {
        self.publish(BridgeEvent::BytesUpdated {
            id,
            bytes_sent,
            bytes_received,
        });
    }

    /// Number of registered sessions.
    pub fn active_sessions(&self) -> usize {
        self.inner
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .live
            .len()
    }

    /// Snapshot of a single live session.
    pub fn session(&self, id: SessionId) -> Option<SessionSnapshot> {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        inner.live.get(&id).map(|entry| entry.snapshot(id))
    }

    /// Snapshots of all live sessions, oldest first.
    pub fn sessions(&self) -> Vec<SessionSnapshot> {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        let mut sessions: Vec<_> = inner
            .live
            .iter()
            .map(|(id, entry)| entry.snapshot(*id))
            .collect();
        sessions.sort_by_key(|s| (s.created_at, s.id));
        sessions
    }

    /// Closed sessions, oldest first.
    pub fn history(&self) -> Vec<SessionSummary> {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        inner.history.iter().cloned().collect()
    }

    /// Devices with at least one live session.
    pub fn devices(&self) -> Vec<DeviceSnapshot> {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        let mut devices: Vec<_> = inner
            .devices
            .iter()
            .map(|(address, device)| {
                let live_bytes: u64 = device
                    .sessions
                    .iter()
                    .filter_map(|id| inner.live.get(id))
                    .map(|e| e.counters.bytes_sent() + e.counters.bytes_received())
                    .sum();
                let hints = inner.hints.get(address);
                DeviceSnapshot {
                    address: *address,
                    display_name: hints.and_then(|h| h.display_name.clone()),
                    activity: hints.map(|h| h.activity).unwrap_or_default(),
                    sessions: device.sessions.iter().copied().collect(),
                    first_seen: device.first_seen,
                    last_seen: device.last_seen,
                    total_bytes: device.closed_bytes + live_bytes,
                }
            })
            .collect();
        devices.sort_by_key(|d| d.address);
        devices
    }

    /// Attach a human-readable name to a client address.
    pub fn set_display_name(&self, address: IpAddr, name: impl Into<String>) {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        inner.hints.entry(address).or_default().display_name = Some(name.into());
    }

    /// Record whether the client app is in the foreground or background.
    pub fn set_client_activity(&self, address: IpAddr, activity: ClientActivity) {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        inner.hints.entry(address).or_default().activity = activity;
    }

    /// Last reported activity for a client address (foreground if unknown).
    pub fn client_activity(&self, address: IpAddr) -> ClientActivity {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        inner
            .hints
            .get(&address)
            .map(|h| h.activity)
            .unwrap_or_default()
    }

    /// Update the throughput estimate from cumulative byte totals.
    pub fn sample_throughput(&self, now: Instant) {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        let (sent, received) = inner.totals();
        let total = sent + received;
        if let Some((at, previous)) = inner.throughput.last_sample {
            let elapsed = now.saturating_duration_since(at);
            if elapsed >= Duration::from_millis(1) {
                let delta = total.saturating_sub(previous);
                inner.throughput.bytes_per_second =
                    (delta as f64 / elapsed.as_secs_f64()).round() as u64;
            }
        }
        inner.throughput.last_sample = Some((now, total));
    }

    /// Aggregate statistics, including the history ring buffer.
    pub fn statistics(&self) -> Statistics {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        let (bytes_sent, bytes_received) = inner.totals();
        Statistics {
            total_sessions: inner.total_sessions,
            active_sessions: inner.live.len(),
            bytes_sent,
            bytes_received,
            throughput_bps: inner.throughput.bytes_per_second,
            history: inner.history.iter().cloned().collect(),
        }
    }

    /// Close every live session and refuse new ones. Returns how many were
    /// signalled.
    pub fn close_all(&self, reason: CloseReason) -> usize {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        inner.draining = true;
        inner
            .live
            .values()
            .filter(|entry| entry.close.close(reason))
            .count()
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("ceiling", &self.ceiling)
            .field("admitted", &self.admitted())
            .finish_non_exhaustive()
    }
}
