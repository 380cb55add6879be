//! Bidirectional relay between the client and the upstream proxy.
//!
//! Each direction is a reader task and a writer task joined by a
//! [`FlowBuffer`]:
//!
//! ```text
//! client rd --(ack scan)--> [outbound] --> upstream wr
//! client wr <--(probes)---- [inbound]  <-- upstream rd
//! ```
//!
//! Two more tasks run alongside: the heartbeat supervisor, which hands probes
//! to the client writer, and a monitor, which enforces the idle timeout and
//! reports byte counters. A session whose heartbeats are answered is never
//! idle. The first task to detect the end of the session
//! fires the [`CloseSignal`]; everything else is then torn down.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;

use crate::flow::{FlowBuffer, DEFAULT_HIGH_WATERMARK, DEFAULT_LOW_WATERMARK};
use crate::heartbeat::{self, AckScanner, AckWatch, HeartbeatConfig};
use crate::registry::Registry;
use crate::session::{CloseReason, CloseSignal, SessionCounters, SessionId};

const READ_CHUNK: usize = 16 * 1024;
const REPORT_INTERVAL: Duration = Duration::from_secs(1);

/// Relay tuning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayConfig {
    /// Close after this long without bytes in either direction.
    pub idle_timeout: Duration,
    pub high_watermark: usize,
    pub low_watermark: usize,
    pub heartbeat: HeartbeatConfig,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(60),
            high_watermark: DEFAULT_HIGH_WATERMARK,
            low_watermark: DEFAULT_LOW_WATERMARK,
            heartbeat: HeartbeatConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Direction {
    /// Client to upstream.
    Outbound,
    /// Upstream to client.
    Inbound,
}

impl Direction {
    fn record(self, counters: &SessionCounters, n: usize) {
        match self {
            Direction::Outbound => counters.add_sent(n),
            Direction::Inbound => counters.add_received(n),
        }
    }

    fn eof_reason(self) -> CloseReason {
        match self {
            Direction::Outbound => CloseReason::ClientClosed,
            Direction::Inbound => CloseReason::UpstreamClosed,
        }
    }
}

/// Everything a relay needs besides the two streams.
pub(crate) struct Relay {
    pub(crate) config: RelayConfig,
    pub(crate) session: SessionId,
    pub(crate) source: IpAddr,
    pub(crate) counters: Arc<SessionCounters>,
    pub(crate) close: CloseSignal,
    pub(crate) registry: Arc<Registry>,
}

impl Relay {
    /// Relay until the session closes and return why it closed.
    ///
    /// `initial_inbound` holds bytes the upstream already sent (for example
    /// after a CONNECT response head) and is delivered to the client first.
    pub(crate) async fn run<C, U>(
        self,
        client: C,
        upstream: U,
        initial_inbound: Bytes,
    ) -> CloseReason
    where
        C: AsyncRead + AsyncWrite + Send + 'static,
        U: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (client_rd, client_wr) = tokio::io::split(client);
        let (upstream_rd, upstream_wr) = tokio::io::split(upstream);

        let outbound = Arc::new(FlowBuffer::new(
            self.config.high_watermark,
            self.config.low_watermark,
        ));
        let inbound = Arc::new(FlowBuffer::new(
            self.config.high_watermark,
            self.config.low_watermark,
        ));
        inbound.push(initial_inbound);

        let acks = Arc::new(AckWatch::new());
        let (probe_tx, probe_rx) = mpsc::channel(4);

        let mut tasks = JoinSet::new();

        tasks.spawn(read_client(
            client_rd,
            Arc::clone(&outbound),
            Arc::clone(&acks),
            Arc::clone(&self.counters),
            self.close.clone(),
        ));
        tasks.spawn(drain(
            upstream_wr,
            Arc::clone(&outbound),
            Direction::Outbound,
            Arc::clone(&self.counters),
            self.close.clone(),
        ));
        tasks.spawn(read_upstream(
            upstream_rd,
            Arc::clone(&inbound),
            self.close.clone(),
        ));
        tasks.spawn(write_client(
            client_wr,
            Arc::clone(&inbound),
            probe_rx,
            Arc::clone(&self.counters),
            self.close.clone(),
        ));

        if self.config.heartbeat.enabled {
            let registry = Arc::clone(&self.registry);
            let source = self.source;
            let heartbeat = heartbeat::supervise(
                self.config.heartbeat.clone(),
                move || registry.client_activity(source),
                probe_tx,
                Arc::clone(&acks),
                Arc::clone(&self.counters),
                self.close.clone(),
            );
            tasks.spawn(async move {
                heartbeat.await;
            });
        } else {
            drop(probe_tx);
        }

        tasks.spawn(monitor(
            IdleWatch {
                idle_timeout: self.config.idle_timeout,
                heartbeat: self
                    .config
                    .heartbeat
                    .enabled
                    .then(|| self.config.heartbeat.clone()),
                acks: Arc::clone(&acks),
                source: self.source,
            },
            self.session,
            Arc::clone(&self.counters),
            self.close.clone(),
            Arc::clone(&self.registry),
        ));

        let reason = self.close.closed().await;

        outbound.close();
        inbound.close();
        tasks.abort_all();
        while tasks.join_next().await.is_some() {}

        reason
    }
}

/// Client reader: strips heartbeat acks and feeds the outbound buffer.
async fn read_client<R>(
    mut source: R,
    buffer: Arc<FlowBuffer>,
    acks: Arc<AckWatch>,
    counters: Arc<SessionCounters>,
    close: CloseSignal,
) where
    R: AsyncRead + Unpin,
{
    let mut scanner = AckScanner::default();
    let mut buf = vec![0u8; READ_CHUNK];

    loop {
        let Some(room) = buffer.reserve().await else {
            return;
        };
        let want = room.min(buf.len());
        match source.read(&mut buf[..want]).await {
            Ok(0) => {
                if let Some(held) = scanner.flush() {
                    buffer.push(held);
                }
                buffer.finish();
                return;
            }
            Ok(n) => {
                let scan = scanner.scan(acks.expects_ack(), Bytes::copy_from_slice(&buf[..n]));
                if scan.acked {
                    acks.consume_ack();
                    counters.touch();
                }
                if !scan.data.is_empty() {
                    acks.acknowledge();
                }
                buffer.push(scan.data);
            }
            Err(e) => {
                tracing::debug!(error = %e, "Client read failed");
                close.close(CloseReason::IoError);
                return;
            }
        }
    }
}

/// Upstream reader: feeds the inbound buffer.
async fn read_upstream<R>(mut source: R, buffer: Arc<FlowBuffer>, close: CloseSignal)
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; READ_CHUNK];

    loop {
        let Some(room) = buffer.reserve().await else {
            return;
        };
        let want = room.min(buf.len());
        match source.read(&mut buf[..want]).await {
            Ok(0) => {
                buffer.finish();
                return;
            }
            Ok(n) => buffer.push(Bytes::copy_from_slice(&buf[..n])),
            Err(e) => {
                tracing::debug!(error = %e, "Upstream read failed");
                close.close(CloseReason::IoError);
                return;
            }
        }
    }
}

/// Writer for one direction: drains the buffer into the sink, then shuts
/// the sink down and closes the session once the reader hit EOF.
async fn drain<W>(
    mut sink: W,
    buffer: Arc<FlowBuffer>,
    direction: Direction,
    counters: Arc<SessionCounters>,
    close: CloseSignal,
) where
    W: AsyncWrite + Unpin,
{
    while let Some(chunk) = buffer.pop().await {
        if let Err(e) = sink.write_all(&chunk).await {
            tracing::debug!(error = %e, ?direction, "Relay write failed");
            close.close(CloseReason::IoError);
            return;
        }
        direction.record(&counters, chunk.len());
    }
    // Best-effort half-close; the peer sees a reset if this fails.
    let _ = sink.shutdown().await;
    close.close(direction.eof_reason());
}

/// Client writer: like [`drain`], but interleaves heartbeat probes between
/// data chunks. Probes take priority.
async fn write_client<W>(
    mut sink: W,
    buffer: Arc<FlowBuffer>,
    mut probes: mpsc::Receiver<[u8; 3]>,
    counters: Arc<SessionCounters>,
    close: CloseSignal,
) where
    W: AsyncWrite + Unpin,
{
    loop {
        tokio::select! {
            biased;

            Some(probe) = probes.recv() => {
                let written = async {
                    sink.write_all(&probe).await?;
                    sink.flush().await
                }
                .await;
                if let Err(e) = written {
                    tracing::debug!(error = %e, "Heartbeat probe write failed");
                    close.close(CloseReason::IoError);
                    return;
                }
            }

            chunk = buffer.pop() => match chunk {
                Some(chunk) => {
                    if let Err(e) = sink.write_all(&chunk).await {
                        tracing::debug!(error = %e, "Client write failed");
                        close.close(CloseReason::IoError);
                        return;
                    }
                    Direction::Inbound.record(&counters, chunk.len());
                }
                None => {
                    // Best-effort half-close; the peer sees a reset if this fails.
                    let _ = sink.shutdown().await;
                    close.close(Direction::Inbound.eof_reason());
                    return;
                }
            },
        }
    }
}

/// What the idle timer needs to know about the heartbeat.
struct IdleWatch {
    idle_timeout: Duration,
    heartbeat: Option<HeartbeatConfig>,
    acks: Arc<AckWatch>,
    source: IpAddr,
}

impl IdleWatch {
    /// Quiet time allowed before closing. A heartbeating session always gets
    /// long enough for its next heartbeat to be answered.
    fn window(&self, registry: &Registry) -> Duration {
        match &self.heartbeat {
            Some(heartbeat) => {
                let activity = registry.client_activity(self.source);
                self.idle_timeout.max(heartbeat.answer_window(activity))
            }
            None => self.idle_timeout,
        }
    }
}

/// Idle timeout and byte reporting.
async fn monitor(
    idle: IdleWatch,
    session: SessionId,
    counters: Arc<SessionCounters>,
    close: CloseSignal,
    registry: Arc<Registry>,
) {
    let mut report =
        tokio::time::interval_at(tokio::time::Instant::now() + REPORT_INTERVAL, REPORT_INTERVAL);
    report.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut reported = (0u64, 0u64);
    let mut deferred = false;

    loop {
        let window = idle.window(&registry);
        let idle_deadline = counters.last_activity() + window;
        tokio::select! {
            _ = close.closed() => return,

            _ = tokio::time::sleep_until(idle_deadline), if !deferred => {
                if idle.acks.is_awaiting() {
                    // Let the outstanding heartbeat resolve first.
                    deferred = true;
                } else if counters.idle_for() >= window {
                    tracing::debug!(session = %session, "Session idle timeout");
                    close.close(CloseReason::IdleTimeout);
                    return;
                }
            }

            _ = idle.acks.settled(), if deferred => deferred = false,

            _ = report.tick() => {
                let current = (counters.bytes_sent(), counters.bytes_received());
                if current != reported {
                    registry.report_bytes(session, current.0, current.1);
                    reported = current;
                }
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::events::BridgeEvent;
    use crate::heartbeat::{ClientActivity, ACK, PROBE};
    use tokio::io::{duplex, DuplexStream};
    use tokio::task::JoinHandle;
    use tokio::time::Instant;

    struct Harness {
        client: DuplexStream,
        upstream: DuplexStream,
        counters: Arc<SessionCounters>,
        close: CloseSignal,
        registry: Arc<Registry>,
        task: JoinHandle<CloseReason>,
    }

    fn start(config: RelayConfig, pipe: usize) -> Harness {
        let (client, client_bridge) = duplex(pipe);
        let (upstream_bridge, upstream) = duplex(pipe);
        let counters = Arc::new(SessionCounters::new());
        let close = CloseSignal::new();
        let registry = Arc::new(Registry::new(10));

        let relay = Relay {
            config,
            session: SessionId::next(),
            source: "192.168.1.20".parse().unwrap(),
            counters: Arc::clone(&counters),
            close: close.clone(),
            registry: Arc::clone(&registry),
        };
        let task = tokio::spawn(relay.run(client_bridge, upstream_bridge, Bytes::new()));

        Harness {
            client,
            upstream,
            counters,
            close,
            registry,
            task,
        }
    }

    fn no_heartbeat() -> RelayConfig {
        RelayConfig {
            heartbeat: HeartbeatConfig {
                enabled: false,
                ..HeartbeatConfig::default()
            },
            ..RelayConfig::default()
        }
    }

    // ========================================================================
    // Data Flow Tests
    // ========================================================================

    #[tokio::test]
    async fn test_bytes_flow_both_ways_and_are_counted() {
        let mut h = start(no_heartbeat(), 4096);

        h.client.write_all(b"hello upstream").await.unwrap();
        let mut buf = [0u8; 14];
        h.upstream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello upstream");

        h.upstream.write_all(b"hello client").await.unwrap();
        let mut buf = [0u8; 12];
        h.client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello client");

        assert_eq!(h.counters.bytes_sent(), 14);
        assert_eq!(h.counters.bytes_received(), 12);

        h.close.close(CloseReason::Shutdown);
        assert_eq!(h.task.await.unwrap(), CloseReason::Shutdown);
    }

    #[tokio::test]
    async fn test_initial_inbound_delivered_first() {
        let (mut client, client_bridge) = duplex(1024);
        let (upstream_bridge, _upstream) = duplex(1024);
        let close = CloseSignal::new();
        let relay = Relay {
            config: no_heartbeat(),
            session: SessionId::next(),
            source: "192.168.1.20".parse().unwrap(),
            counters: Arc::new(SessionCounters::new()),
            close: close.clone(),
            registry: Arc::new(Registry::new(10)),
        };
        let task = tokio::spawn(relay.run(
            client_bridge,
            upstream_bridge,
            Bytes::from_static(b"early"),
        ));

        let mut buf = [0u8; 5];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"early");

        close.close(CloseReason::Shutdown);
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_client_eof_flushes_and_closes() {
        let mut h = start(no_heartbeat(), 4096);

        h.client.write_all(b"last words").await.unwrap();
        h.client.shutdown().await.unwrap();

        let mut received = Vec::new();
        h.upstream.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, b"last words");

        assert_eq!(h.task.await.unwrap(), CloseReason::ClientClosed);
    }

    #[tokio::test]
    async fn test_upstream_eof_closes_session() {
        let mut h = start(no_heartbeat(), 4096);

        h.upstream.write_all(b"bye").await.unwrap();
        h.upstream.shutdown().await.unwrap();

        let mut received = Vec::new();
        h.client.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, b"bye");

        assert_eq!(h.task.await.unwrap(), CloseReason::UpstreamClosed);
    }

    #[tokio::test]
    async fn test_large_transfer_under_backpressure() {
        let config = RelayConfig {
            high_watermark: 8 * 1024,
            low_watermark: 4 * 1024,
            ..no_heartbeat()
        };
        let mut h = start(config, 1024);
        let payload: Vec<u8> = (0..256 * 1024).map(|i| (i % 251) as u8).collect();

        let writer = {
            let payload = payload.clone();
            let mut client = h.client;
            tokio::spawn(async move {
                client.write_all(&payload).await.unwrap();
                client.shutdown().await.unwrap();
                client
            })
        };

        let mut received = Vec::new();
        h.upstream.read_to_end(&mut received).await.unwrap();
        assert_eq!(received.len(), payload.len());
        assert!(received == payload);

        writer.await.unwrap();
        assert_eq!(h.task.await.unwrap(), CloseReason::ClientClosed);
        assert_eq!(h.counters.bytes_sent(), payload.len() as u64);
    }

    // ========================================================================
    // Idle Timeout Tests
    // ========================================================================

    #[tokio::test(start_paused = true)]
    async fn test_idle_timeout_closes_session() {
        let start_at = Instant::now();
        let h = start(no_heartbeat(), 4096);

        assert_eq!(h.task.await.unwrap(), CloseReason::IdleTimeout);
        let elapsed = Instant::now() - start_at;
        assert!(elapsed >= Duration::from_secs(60));
        assert!(elapsed < Duration::from_secs(61));
        drop(h.client);
    }

    #[tokio::test(start_paused = true)]
    async fn test_activity_postpones_idle_timeout() {
        let start_at = Instant::now();
        let mut h = start(no_heartbeat(), 4096);

        tokio::time::sleep(Duration::from_secs(45)).await;
        h.client.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        h.upstream.read_exact(&mut buf).await.unwrap();

        assert_eq!(h.task.await.unwrap(), CloseReason::IdleTimeout);
        let elapsed = Instant::now() - start_at;
        assert!(elapsed >= Duration::from_secs(105));
        assert!(elapsed < Duration::from_secs(106));
    }

    // ========================================================================
    // Heartbeat Tests
    // ========================================================================

    #[tokio::test(start_paused = true)]
    async fn test_probe_injected_and_ack_stripped() {
        let mut h = start(RelayConfig::default(), 4096);

        let mut probe = [0u8; 3];
        h.client.read_exact(&mut probe).await.unwrap();
        assert_eq!(probe, PROBE);

        // Ack plus application bytes in one write; only the payload reaches upstream.
        h.client.write_all(&ACK).await.unwrap();
        h.client.write_all(b"data").await.unwrap();
        let mut buf = [0u8; 4];
        h.upstream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"data");
        assert_eq!(h.counters.bytes_sent(), 4);

        h.close.close(CloseReason::Shutdown);
        h.task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_unanswered_heartbeat_closes_session() {
        let config = RelayConfig {
            idle_timeout: Duration::from_secs(600),
            ..RelayConfig::default()
        };
        let start_at = Instant::now();
        let mut h = start(config, 4096);

        // Drain probes without answering.
        let client = tokio::spawn(async move {
            let mut seen = 0;
            let mut buf = [0u8; 64];
            while let Ok(n) = h.client.read(&mut buf).await {
                if n == 0 {
                    break;
                }
                seen += n / PROBE.len();
            }
            seen
        });

        assert_eq!(h.task.await.unwrap(), CloseReason::HeartbeatTimeout);
        assert_eq!(Instant::now() - start_at, Duration::from_secs(65));
        assert_eq!(client.await.unwrap(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_answered_heartbeat_keeps_idle_session_alive() {
        let config = RelayConfig {
            idle_timeout: Duration::from_secs(40),
            ..RelayConfig::default()
        };
        let mut h = start(config, 4096);

        // Acks count as activity, so answering every probe outlives the idle timeout.
        for _ in 0..4 {
            let mut probe = [0u8; 3];
            h.client.read_exact(&mut probe).await.unwrap();
            assert_eq!(probe, PROBE);
            h.client.write_all(&ACK).await.unwrap();
        }
        assert!(!h.close.is_closed());

        h.close.close(CloseReason::Shutdown);
        h.task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_background_client_answering_heartbeats_is_not_idle() {
        let mut h = start(RelayConfig::default(), 4096);
        h.registry
            .set_client_activity("192.168.1.20".parse().unwrap(), ClientActivity::Background);

        // Answer every heartbeat after a short round trip.
        let client = tokio::spawn(async move {
            let mut answered = 0;
            let mut heartbeat = [0u8; 3];
            while h.client.read_exact(&mut heartbeat).await.is_ok() {
                assert_eq!(heartbeat, PROBE);
                tokio::time::sleep(Duration::from_millis(50)).await;
                if h.client.write_all(&ACK).await.is_err() {
                    break;
                }
                answered += 1;
            }
            answered
        });

        tokio::time::sleep(Duration::from_secs(200)).await;
        assert_eq!(h.close.reason(), None);

        h.close.close(CloseReason::Shutdown);
        assert_eq!(h.task.await.unwrap(), CloseReason::Shutdown);
        assert!(client.await.unwrap() >= 3);
        assert_eq!(h.counters.bytes_sent(), 0);
        drop(h.upstream);
    }

    #[tokio::test(start_paused = true)]
    async fn test_background_client_going_silent_still_times_out() {
        let start_at = Instant::now();
        let h = start(
            RelayConfig {
                heartbeat: HeartbeatConfig {
                    max_failures: 10,
                    ..HeartbeatConfig::default()
                },
                ..RelayConfig::default()
            },
            4096,
        );
        h.registry
            .set_client_activity("192.168.1.20".parse().unwrap(), ClientActivity::Background);

        // Heartbeat at 60s goes unanswered; nothing else arrives.
        assert_eq!(h.task.await.unwrap(), CloseReason::IdleTimeout);
        assert_eq!(Instant::now() - start_at, Duration::from_secs(65));
        drop(h.client);
    }

    #[tokio::test(start_paused = true)]
    async fn test_uploading_client_with_ack_behind_data_stays_alive() {
        let h = start(RelayConfig::default(), 4096);
        let (mut client_rd, mut client_wr) = tokio::io::split(h.client);
        let owed = Arc::new(std::sync::atomic::AtomicUsize::new(0));

        let reader = tokio::spawn({
            let owed = Arc::clone(&owed);
            async move {
                let mut heartbeat = [0u8; 3];
                while client_rd.read_exact(&mut heartbeat).await.is_ok() {
                    assert_eq!(heartbeat, PROBE);
                    owed.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                }
            }
        });

        // Upload every second; owed acks ride at the end of the next write.
        let writer = tokio::spawn({
            let owed = Arc::clone(&owed);
            async move {
                let mut acks_sent = 0;
                loop {
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    let mut chunk = b"DATA".to_vec();
                    for _ in 0..owed.swap(0, std::sync::atomic::Ordering::SeqCst) {
                        chunk.extend_from_slice(&ACK);
                        acks_sent += 1;
                    }
                    if client_wr.write_all(&chunk).await.is_err() {
                        return acks_sent;
                    }
                }
            }
        });

        let mut upstream = h.upstream;
        let collector = tokio::spawn(async move {
            let mut received = Vec::new();
            let _ = upstream.read_to_end(&mut received).await;
            received
        });

        tokio::time::sleep(Duration::from_secs(100)).await;
        assert_eq!(h.close.reason(), None);

        h.close.close(CloseReason::Shutdown);
        assert_eq!(h.task.await.unwrap(), CloseReason::Shutdown);
        assert!(writer.await.unwrap() >= 3);
        reader.await.unwrap();

        let received = collector.await.unwrap();
        assert!(!received.is_empty());
        assert_eq!(received.len() % 4, 0);
        assert!(received.chunks(4).all(|chunk| chunk == b"DATA"));
    }

    // ========================================================================
    // Reporting Tests
    // ========================================================================

    #[tokio::test(start_paused = true)]
    async fn test_bytes_updated_reported_at_most_once_per_second() {
        let mut h = start(no_heartbeat(), 4096);
        let mut events = h.registry.subscribe();

        for _ in 0..5 {
            h.client.write_all(b"x").await.unwrap();
            let mut b = [0u8; 1];
            h.upstream.read_exact(&mut b).await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(1500)).await;

        let mut updates = 0;
        while let Ok(event) = events.try_recv() {
            if let BridgeEvent::BytesUpdated { bytes_sent, .. } = event {
                updates += 1;
                assert_eq!(bytes_sent, 5);
            }
        }
        assert_eq!(updates, 1);

        h.close.close(CloseReason::Shutdown);
        h.task.await.unwrap();
    }
}
