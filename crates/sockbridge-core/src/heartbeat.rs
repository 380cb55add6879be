//! Heartbeat liveness protocol.
//!
//! Once a session is forwarding, the bridge periodically injects a 3-byte
//! probe into the client-bound stream and expects a 2-byte ack back. Mobile
//! clients get suspended without closing their sockets; unanswered probes are
//! how the bridge notices.
//!
//! # Wire Format
//!
//! | Frame | Bytes | Direction |
//! |-------|-------|-----------|
//! | probe | `05 FF 00` | bridge to client |
//! | ack   | `05 00`    | client to bridge |
//!
//! # Schedule
//!
//! ```text
//! wait interval (30s foreground / 60s background)
//!   -> send probe, wait up to 5s for ack
//!        ack     -> reset failures, wait interval
//!        no ack  -> failures += 1
//!                     < 3 -> wait 10s, probe again
//!                     = 3 -> close session (HeartbeatTimeout)
//! ```
//!
//! Any client bytes read while a heartbeat is outstanding count as an answer; the
//! client's ack is still stripped when it arrives.
//!
//! The client side of the protocol ([`ProbeScanner`], [`LivenessTracker`],
//! [`respond_to_probes`]) lives here too so both ends agree on framing.

use std::io;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, watch, Notify};
use tokio::time::Instant;

use crate::session::{CloseReason, CloseSignal, SessionCounters};

/// Probe injected into the client-bound stream.
pub const PROBE: [u8; 3] = [0x05, 0xFF, 0x00];

/// Ack the client writes back.
pub const ACK: [u8; 2] = [0x05, 0x00];

/// Whether the client app is on screen, as reported by the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientActivity {
    #[default]
    Foreground,
    Background,
}

/// Heartbeat timing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeartbeatConfig {
    /// Send probes at all.
    pub enabled: bool,
    /// Probe interval while the client is in the foreground.
    pub active_interval: Duration,
    /// Probe interval while the client is in the background.
    pub background_interval: Duration,
    /// How long to wait for an ack.
    pub ack_timeout: Duration,
    /// Delay before re-probing after a missed ack.
    pub retry_spacing: Duration,
    /// Consecutive missed acks before the session is closed.
    pub max_failures: u32,
    /// Client side: how long without a probe before the bridge is presumed dead.
    pub liveness_timeout: Duration,
}

impl HeartbeatConfig {
    pub fn interval_for(&self, activity: ClientActivity) -> Duration {
        match activity {
            ClientActivity::Foreground => self.active_interval,
            ClientActivity::Background => self.background_interval,
        }
    }

    /// Longest an answering client can go quiet between two answers.
    pub fn answer_window(&self, activity: ClientActivity) -> Duration {
        self.interval_for(activity) + self.ack_timeout
    }
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            active_interval: Duration::from_secs(30),
            background_interval: Duration::from_secs(60),
            ack_timeout: Duration::from_secs(5),
            retry_spacing: Duration::from_secs(10),
            max_failures: 3,
            liveness_timeout: Duration::from_secs(90),
        }
    }
}

/// Where a session's heartbeat currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HeartbeatPhase {
    /// No probe sent yet.
    Idle,
    /// Probe sent, waiting for the ack.
    AwaitingAck,
    /// Last probe was acknowledged.
    Healthy,
    /// Last probe went unanswered; re-probing on the retry spacing.
    Retrying,
    /// Too many missed acks.
    Dead,
}

/// Per-session heartbeat bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeartbeatRecord {
    pub last_sent: Option<Instant>,
    pub last_received: Option<Instant>,
    pub consecutive_failures: u32,
    pub phase: HeartbeatPhase,
}

impl HeartbeatRecord {
    pub fn new() -> Self {
        Self {
            last_sent: None,
            last_received: None,
            consecutive_failures: 0,
            phase: HeartbeatPhase::Idle,
        }
    }

    pub fn record_sent(&mut self, now: Instant) {
        self.last_sent = Some(now);
        self.phase = HeartbeatPhase::AwaitingAck;
    }

    pub fn record_ack(&mut self, now: Instant) {
        self.last_received = Some(now);
        self.consecutive_failures = 0;
        self.phase = HeartbeatPhase::Healthy;
    }

    /// Count a missed ack and return the resulting phase.
    pub fn record_timeout(&mut self, max_failures: u32) -> HeartbeatPhase {
        self.consecutive_failures += 1;
        self.phase = if self.consecutive_failures >= max_failures {
            HeartbeatPhase::Dead
        } else {
            HeartbeatPhase::Retrying
        };
        self.phase
    }

    /// Delay before the next probe.
    pub fn next_delay(&self, config: &HeartbeatConfig, activity: ClientActivity) -> Duration {
        match self.phase {
            HeartbeatPhase::Retrying => config.retry_spacing,
            _ => config.interval_for(activity),
        }
    }
}

impl Default for HeartbeatRecord {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Bridge side
// ============================================================================

/// Ack rendezvous between the client reader and the supervisor.
///
/// Two things are tracked separately: whether the supervisor is still waiting
/// for proof of life, and how many acks the client still owes. Any client
/// bytes end the wait, but only an ack settles the debt, so an ack that
/// arrives after data is still stripped from the stream.
#[derive(Debug)]
pub(crate) struct AckWatch {
    awaiting: AtomicBool,
    owed: AtomicU32,
    acks: watch::Sender<u64>,
    settled: Notify,
}

impl AckWatch {
    pub(crate) fn new() -> Self {
        let (acks, _rx) = watch::channel(0);
        Self {
            awaiting: AtomicBool::new(false),
            owed: AtomicU32::new(0),
            acks,
            settled: Notify::new(),
        }
    }

    pub(crate) fn is_awaiting(&self) -> bool {
        self.awaiting.load(Ordering::Acquire)
    }

    /// Whether the client still owes an ack for a heartbeat already sent.
    pub(crate) fn expects_ack(&self) -> bool {
        self.owed.load(Ordering::Acquire) > 0
    }

    /// Start waiting for an ack; returns the baseline to wait past.
    pub(crate) fn arm(&self) -> u64 {
        let baseline = *self.acks.borrow();
        self.owed.fetch_add(1, Ordering::AcqRel);
        self.awaiting.store(true, Ordering::Release);
        baseline
    }

    pub(crate) fn disarm(&self) {
        self.awaiting.store(false, Ordering::Release);
        self.settled.notify_waiters();
    }

    /// Called by the client reader when it stripped an ack.
    pub(crate) fn consume_ack(&self) {
        let _ = self
            .owed
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |owed| owed.checked_sub(1));
        self.acknowledge();
    }

    /// Proof of life: an ack, or any other client bytes.
    pub(crate) fn acknowledge(&self) {
        if self.awaiting.swap(false, Ordering::AcqRel) {
            self.acks.send_modify(|count| *count += 1);
            self.settled.notify_waiters();
        }
    }

    pub(crate) async fn wait_past(&self, baseline: u64) {
        let mut rx = self.acks.subscribe();
        loop {
            if *rx.borrow_and_update() > baseline {
                return;
            }
            if rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }

    /// Resolves once no heartbeat is waiting on the client.
    pub(crate) async fn settled(&self) {
        loop {
            let notified = self.settled.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if !self.is_awaiting() {
                return;
            }
            notified.await;
        }
    }
}

/// Outcome of scanning one client read for an ack.
#[derive(Debug, PartialEq, Eq)]
pub(crate) struct AckScan {
    pub(crate) acked: bool,
    pub(crate) data: Bytes,
}

/// Strips acks from client reads.
///
/// An ack is only recognized while one is owed, either at the start of a read
/// or trailing the data in it. A lone `05` read while an ack is owed is held
/// back in case the `00` arrives in the next read.
#[derive(Debug, Default)]
pub(crate) struct AckScanner {
    pending: bool,
}

impl AckScanner {
    pub(crate) fn scan(&mut self, expecting: bool, chunk: Bytes) -> AckScan {
        if self.pending {
            self.pending = false;
            if chunk.first() == Some(&ACK[1]) {
                return AckScan {
                    acked: true,
                    data: chunk.slice(1..),
                };
            }
            let mut joined = BytesMut::with_capacity(chunk.len() + 1);
            joined.put_u8(ACK[0]);
            joined.extend_from_slice(&chunk);
            return AckScan {
                acked: false,
                data: joined.freeze(),
            };
        }

        if expecting {
            if chunk.starts_with(&ACK) {
                return AckScan {
                    acked: true,
                    data: chunk.slice(ACK.len()..),
                };
            }
            if chunk.len() > ACK.len() && chunk.ends_with(&ACK) {
                return AckScan {
                    acked: true,
                    data: chunk.slice(..chunk.len() - ACK.len()),
                };
            }
            if chunk.len() == 1 && chunk[0] == ACK[0] {
                self.pending = true;
                return AckScan {
                    acked: false,
                    data: Bytes::new(),
                };
            }
        }

        AckScan {
            acked: false,
            data: chunk,
        }
    }

    /// Release a held-back byte at end of stream.
    pub(crate) fn flush(&mut self) -> Option<Bytes> {
        if std::mem::take(&mut self.pending) {
            Some(Bytes::from_static(&ACK[..1]))
        } else {
            None
        }
    }
}

/// Run the probe schedule for one session until it closes.
///
/// Probes are handed to the client writer over `probes` so they never
/// interleave with a partially written data chunk.
pub(crate) async fn supervise<F>(
    config: HeartbeatConfig,
    activity: F,
    probes: mpsc::Sender<[u8; 3]>,
    acks: Arc<AckWatch>,
    counters: Arc<SessionCounters>,
    close: CloseSignal,
) -> HeartbeatRecord
where
    F: Fn() -> ClientActivity,
{
    let mut record = HeartbeatRecord::new();

    loop {
        let delay = record.next_delay(&config, activity());
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = close.closed() => return record,
        }

        let baseline = acks.arm();
        if probes.send(PROBE).await.is_err() {
            return record;
        }
        record.record_sent(Instant::now());

        let acked = tokio::select! {
            result = tokio::time::timeout(config.ack_timeout, acks.wait_past(baseline)) => result.is_ok(),
            _ = close.closed() => return record,
        };

        if acked {
            record.record_ack(Instant::now());
            counters.touch();
            tracing::trace!("Heartbeat acknowledged");
            continue;
        }

        acks.disarm();
        let phase = record.record_timeout(config.max_failures);
        tracing::debug!(
            failures = record.consecutive_failures,
            max = config.max_failures,
            "Heartbeat ack missed"
        );
        if phase == HeartbeatPhase::Dead {
            close.close(CloseReason::HeartbeatTimeout);
            return record;
        }
    }
}

// ============================================================================
// Client side
// ============================================================================

/// Result of scanning bridge-to-client bytes for probes.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct ProbeScan {
    /// Probes found (each needs an ack).
    pub probes: usize,
    /// Application bytes with probes removed.
    pub data: Vec<u8>,
}

/// Removes probe frames from the stream a client receives from the bridge.
///
/// Keeps up to two bytes between calls so probes split across reads are
/// still recognized.
#[derive(Debug, Default)]
pub struct ProbeScanner {
    held: Vec<u8>,
}

impl ProbeScanner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn scan(&mut self, input: &[u8]) -> ProbeScan {
        let mut buf = std::mem::take(&mut self.held);
        buf.extend_from_slice(input);

        let mut out = ProbeScan::default();
        let mut i = 0;
        while i < buf.len() {
            let rest = &buf[i..];
            if rest.starts_with(&PROBE) {
                out.probes += 1;
                i += PROBE.len();
                continue;
            }
            if rest.len() < PROBE.len() && PROBE.starts_with(rest) {
                self.held = rest.to_vec();
                break;
            }
            out.data.push(buf[i]);
            i += 1;
        }
        out
    }

    /// Bytes held back at end of stream.
    pub fn flush(&mut self) -> Option<Vec<u8>> {
        if self.held.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut self.held))
        }
    }
}

/// Client-side liveness clock: the bridge is presumed dead if no probe
/// arrives within the timeout.
#[derive(Debug, Clone)]
pub struct LivenessTracker {
    timeout: Duration,
    last_probe: Instant,
}

impl LivenessTracker {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            last_probe: Instant::now(),
        }
    }

    pub fn record_probe(&mut self) {
        self.last_probe = Instant::now();
    }

    pub fn deadline(&self) -> Instant {
        self.last_probe + self.timeout
    }

    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.deadline()
    }
}

/// Why [`respond_to_probes`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerVerdict {
    /// The bridge closed the stream.
    Closed,
    /// No probe arrived within the liveness timeout.
    Unresponsive,
}

/// Client-side loop: ack every probe, pass application bytes to `on_data`,
/// and give up when the bridge goes quiet for `liveness_timeout`.
pub async fn respond_to_probes<R, W, F>(
    reader: &mut R,
    writer: &mut W,
    liveness_timeout: Duration,
    mut on_data: F,
) -> io::Result<PeerVerdict>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
    F: FnMut(&[u8]),
{
    let mut scanner = ProbeScanner::new();
    let mut tracker = LivenessTracker::new(liveness_timeout);
    let mut buf = vec![0u8; 16 * 1024];

    loop {
        let n = match tokio::time::timeout_at(tracker.deadline(), reader.read(&mut buf)).await {
            Ok(read) => read?,
            Err(_) => return Ok(PeerVerdict::Unresponsive),
        };

        if n == 0 {
            if let Some(rest) = scanner.flush() {
                on_data(&rest);
            }
            return Ok(PeerVerdict::Closed);
        }

        let scan = scanner.scan(&buf[..n]);
        if scan.probes > 0 {
            for _ in 0..scan.probes {
                writer.write_all(&ACK).await?;
            }
            writer.flush().await?;
            tracker.record_probe();
        }
        if !scan.data.is_empty() {
            on_data(&scan.data);
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    // ========================================================================
    // Record Tests
    // ========================================================================

    #[test]
    fn test_record_failure_progression() {
        let mut record = HeartbeatRecord::new();
        assert_eq!(record.record_timeout(3), HeartbeatPhase::Retrying);
        assert_eq!(record.record_timeout(3), HeartbeatPhase::Retrying);
        assert_eq!(record.record_timeout(3), HeartbeatPhase::Dead);
        assert_eq!(record.consecutive_failures, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ack_resets_failures() {
        let mut record = HeartbeatRecord::new();
        record.record_timeout(3);
        record.record_timeout(3);
        record.record_ack(Instant::now());
        assert_eq!(record.consecutive_failures, 0);
        assert_eq!(record.phase, HeartbeatPhase::Healthy);
    }

    #[test]
    fn test_next_delay_by_phase_and_activity() {
        let config = HeartbeatConfig::default();
        let mut record = HeartbeatRecord::new();
        assert_eq!(
            record.next_delay(&config, ClientActivity::Foreground),
            Duration::from_secs(30)
        );
        assert_eq!(
            record.next_delay(&config, ClientActivity::Background),
            Duration::from_secs(60)
        );
        record.record_timeout(3);
        assert_eq!(
            record.next_delay(&config, ClientActivity::Background),
            Duration::from_secs(10)
        );
    }

    // ========================================================================
    // AckScanner Tests
    // ========================================================================

    #[test]
    fn test_ack_only_recognized_while_awaiting() {
        let mut scanner = AckScanner::default();
        let scan = scanner.scan(false, Bytes::from_static(&[0x05, 0x00, 0x41]));
        assert!(!scan.acked);
        assert_eq!(scan.data, Bytes::from_static(&[0x05, 0x00, 0x41]));
    }

    #[test]
    fn test_ack_stripped_from_front() {
        let mut scanner = AckScanner::default();
        let scan = scanner.scan(true, Bytes::from_static(&[0x05, 0x00, b'G', b'E', b'T']));
        assert!(scan.acked);
        assert_eq!(scan.data, Bytes::from_static(b"GET"));
    }

    #[test]
    fn test_ack_split_across_reads() {
        let mut scanner = AckScanner::default();
        let first = scanner.scan(true, Bytes::from_static(&[0x05]));
        assert!(!first.acked);
        assert!(first.data.is_empty());

        let second = scanner.scan(true, Bytes::from_static(&[0x00, b'x']));
        assert!(second.acked);
        assert_eq!(second.data, Bytes::from_static(b"x"));
    }

    #[test]
    fn test_held_byte_released_when_not_an_ack() {
        let mut scanner = AckScanner::default();
        scanner.scan(true, Bytes::from_static(&[0x05]));
        let scan = scanner.scan(true, Bytes::from_static(&[0x07, 0x08]));
        assert!(!scan.acked);
        assert_eq!(scan.data, Bytes::from_static(&[0x05, 0x07, 0x08]));
    }

    #[test]
    fn test_held_byte_flushed_at_eof() {
        let mut scanner = AckScanner::default();
        scanner.scan(true, Bytes::from_static(&[0x05]));
        assert_eq!(scanner.flush(), Some(Bytes::from_static(&[0x05])));
        assert_eq!(scanner.flush(), None);
    }

    #[test]
    fn test_ack_trailing_data_is_stripped() {
        let mut scanner = AckScanner::default();
        let scan = scanner.scan(true, Bytes::from_static(&[b'D', b'A', b'T', b'A', 0x05, 0x00]));
        assert!(scan.acked);
        assert_eq!(scan.data, Bytes::from_static(b"DATA"));
    }

    #[test]
    fn test_trailing_bytes_kept_when_no_ack_owed() {
        let mut scanner = AckScanner::default();
        let scan = scanner.scan(false, Bytes::from_static(&[b'x', 0x05, 0x00]));
        assert!(!scan.acked);
        assert_eq!(scan.data, Bytes::from_static(&[b'x', 0x05, 0x00]));
    }

    // ========================================================================
    // AckWatch Tests
    // ========================================================================

    #[tokio::test]
    async fn test_ack_watch_ignores_unsolicited_acks() {
        let watch = AckWatch::new();
        watch.acknowledge();
        let baseline = watch.arm();
        assert_eq!(baseline, 0);

        let waited =
            tokio::time::timeout(Duration::from_millis(20), watch.wait_past(baseline)).await;
        assert!(waited.is_err());

        watch.acknowledge();
        assert!(!watch.is_awaiting());
        watch.wait_past(baseline).await;
    }

    #[tokio::test]
    async fn test_data_ends_wait_but_ack_still_owed() {
        let watch = AckWatch::new();
        let baseline = watch.arm();
        assert!(watch.expects_ack());

        // Client bytes other than the ack.
        watch.acknowledge();
        watch.wait_past(baseline).await;
        assert!(!watch.is_awaiting());
        assert!(watch.expects_ack());

        watch.consume_ack();
        assert!(!watch.expects_ack());

        // Extra acks never underflow the debt.
        watch.consume_ack();
        assert!(!watch.expects_ack());
    }

    #[tokio::test(start_paused = true)]
    async fn test_settled_waits_for_the_outstanding_heartbeat() {
        let watch = Arc::new(AckWatch::new());
        watch.settled().await;

        watch.arm();
        let waiter = tokio::spawn({
            let watch = Arc::clone(&watch);
            async move { watch.settled().await }
        });
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(!waiter.is_finished());

        watch.disarm();
        waiter.await.unwrap();
    }

    #[test]
    fn test_answer_window_covers_interval_and_ack_wait() {
        let config = HeartbeatConfig::default();
        assert_eq!(
            config.answer_window(ClientActivity::Foreground),
            Duration::from_secs(35)
        );
        assert_eq!(
            config.answer_window(ClientActivity::Background),
            Duration::from_secs(65)
        );
    }

    // ========================================================================
    // Supervisor Tests
    // ========================================================================

    struct Harness {
        probes: mpsc::Receiver<[u8; 3]>,
        acks: Arc<AckWatch>,
        close: CloseSignal,
        task: tokio::task::JoinHandle<HeartbeatRecord>,
    }

    fn start(config: HeartbeatConfig, activity: ClientActivity) -> Harness {
        let (tx, probes) = mpsc::channel(4);
        let acks = Arc::new(AckWatch::new());
        let close = CloseSignal::new();
        let task = tokio::spawn(supervise(
            config,
            move || activity,
            tx,
            Arc::clone(&acks),
            Arc::new(SessionCounters::new()),
            close.clone(),
        ));
        Harness {
            probes,
            acks,
            close,
            task,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_unanswered_probes_close_session() {
        let start_at = Instant::now();
        let mut h = start(HeartbeatConfig::default(), ClientActivity::Foreground);

        let mut sent_at = Vec::new();
        for _ in 0..3 {
            let probe = h.probes.recv().await.unwrap();
            assert_eq!(probe, PROBE);
            sent_at.push(Instant::now() - start_at);
        }

        assert_eq!(h.close.closed().await, CloseReason::HeartbeatTimeout);
        let closed_at = Instant::now() - start_at;

        // First probe after the 30s interval, then 5s ack wait + 10s spacing.
        assert_eq!(sent_at[0], Duration::from_secs(30));
        assert_eq!(sent_at[1], Duration::from_secs(45));
        assert_eq!(sent_at[2], Duration::from_secs(60));
        assert_eq!(closed_at, Duration::from_secs(65));

        let record = h.task.await.unwrap();
        assert_eq!(record.phase, HeartbeatPhase::Dead);
        assert_eq!(record.consecutive_failures, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_answered_probes_keep_session_open() {
        let mut h = start(HeartbeatConfig::default(), ClientActivity::Foreground);

        for _ in 0..5 {
            h.probes.recv().await.unwrap();
            h.acks.acknowledge();
        }
        assert!(!h.close.is_closed());

        h.close.close(CloseReason::ClientClosed);
        let record = h.task.await.unwrap();
        assert_eq!(record.consecutive_failures, 0);
        assert!(record.last_received.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_background_uses_longer_interval() {
        let start_at = Instant::now();
        let mut h = start(HeartbeatConfig::default(), ClientActivity::Background);

        h.probes.recv().await.unwrap();
        assert_eq!(Instant::now() - start_at, Duration::from_secs(60));
        h.close.close(CloseReason::Shutdown);
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_recovery_resets_failure_count() {
        let mut h = start(HeartbeatConfig::default(), ClientActivity::Foreground);

        // Miss two, answer the third.
        h.probes.recv().await.unwrap();
        h.probes.recv().await.unwrap();
        h.probes.recv().await.unwrap();
        h.acks.acknowledge();

        // Two more misses are tolerated again.
        h.probes.recv().await.unwrap();
        h.probes.recv().await.unwrap();
        assert!(!h.close.is_closed());

        h.close.close(CloseReason::Shutdown);
        h.task.await.unwrap();
    }

    // ========================================================================
    // Client Side Tests
    // ========================================================================

    #[test]
    fn test_probe_scanner_strips_probes() {
        let mut scanner = ProbeScanner::new();
        let scan = scanner.scan(&[b'a', 0x05, 0xFF, 0x00, b'b']);
        assert_eq!(scan.probes, 1);
        assert_eq!(scan.data, b"ab");
    }

    #[test]
    fn test_probe_scanner_handles_split_probe() {
        let mut scanner = ProbeScanner::new();
        let first = scanner.scan(&[b'a', 0x05, 0xFF]);
        assert_eq!(first.probes, 0);
        assert_eq!(first.data, b"a");

        let second = scanner.scan(&[0x00, b'b']);
        assert_eq!(second.probes, 1);
        assert_eq!(second.data, b"b");
    }

    #[test]
    fn test_probe_scanner_releases_false_prefix() {
        let mut scanner = ProbeScanner::new();
        scanner.scan(&[0x05]);
        let scan = scanner.scan(&[0x01]);
        assert_eq!(scan.probes, 0);
        assert_eq!(scan.data, vec![0x05, 0x01]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_liveness_tracker_expiry() {
        let mut tracker = LivenessTracker::new(Duration::from_secs(90));
        tokio::time::advance(Duration::from_secs(89)).await;
        assert!(!tracker.is_expired());
        tracker.record_probe();
        tokio::time::advance(Duration::from_secs(89)).await;
        assert!(!tracker.is_expired());
        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(tracker.is_expired());
    }

    #[tokio::test(start_paused = true)]
    async fn test_respond_to_probes_acks_and_forwards_data() {
        let (mut bridge, client) = tokio::io::duplex(256);
        let (mut client_rd, mut client_wr) = tokio::io::split(client);

        let responder = tokio::spawn(async move {
            let mut received = Vec::new();
            let verdict = respond_to_probes(
                &mut client_rd,
                &mut client_wr,
                Duration::from_secs(90),
                |data| received.extend_from_slice(data),
            )
            .await
            .unwrap();
            (verdict, received)
        });

        bridge.write_all(b"hi").await.unwrap();
        bridge.write_all(&PROBE).await.unwrap();
        let mut ack = [0u8; 2];
        bridge.read_exact(&mut ack).await.unwrap();
        assert_eq!(ack, ACK);

        bridge.write_all(b"!").await.unwrap();
        drop(bridge);

        let (verdict, received) = responder.await.unwrap();
        assert_eq!(verdict, PeerVerdict::Closed);
        assert_eq!(received, b"hi!");
    }

    #[tokio::test(start_paused = true)]
    async fn test_respond_to_probes_detects_silent_bridge() {
        let (_bridge, client) = tokio::io::duplex(256);
        let (mut client_rd, mut client_wr) = tokio::io::split(client);

        let verdict = respond_to_probes(
            &mut client_rd,
            &mut client_wr,
            Duration::from_secs(90),
            |_| {},
        )
        .await
        .unwrap();
        assert_eq!(verdict, PeerVerdict::Unresponsive);
    }
}
