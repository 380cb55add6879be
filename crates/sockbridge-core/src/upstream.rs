//! Upstream debugging-proxy supervision.
//!
//! The bridge has exactly one upstream: the HTTP/HTTPS debugging proxy on
//! the same machine. Its health is tracked passively. Nothing polls it; every
//! forwarding attempt that fails to connect is retried with exponential
//! backoff, and the outcome updates the shared [`Reachability`].
//!
//! # Retry Schedule
//!
//! With the default policy (1s base, factor 2, 5 attempts, 20% jitter):
//!
//! | Attempt | Delay before it |
//! |---------|-----------------|
//! | 1 | none |
//! | 2 | 1s +/- 20% |
//! | 3 | 2s +/- 20% |
//! | 4 | 4s +/- 20% |
//! | 5 | 8s +/- 20% |
//!
//! If attempt 5 fails the client gets SOCKS5 reply `0x05`.

use std::future::Future;
use std::sync::{Arc, RwLock};
use std::time::{Duration, SystemTime};

use rand::Rng;
use tokio::net::TcpStream;

use crate::events::BridgeEvent;
use crate::registry::Registry;
use crate::{BridgeError, Result};

/// Exponential backoff parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    /// Delay before the first retry.
    pub base: Duration,
    /// Multiplier between consecutive retries.
    pub factor: u32,
    /// Connect attempts in total, the initial one included.
    pub max_attempts: u32,
    /// Relative jitter, e.g. `0.2` for +/- 20%.
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            factor: 2,
            max_attempts: 5,
            jitter: 0.2,
        }
    }
}

/// Retry counter producing jittered exponential delays.
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: BackoffPolicy,
    retries: u32,
}

impl Backoff {
    pub fn new(policy: BackoffPolicy) -> Self {
        Self { policy, retries: 0 }
    }

    /// Un-jittered delay before retry number `retry` (0-based).
    pub fn nominal_delay(&self, retry: u32) -> Duration {
        self.policy
            .base
            .saturating_mul(self.policy.factor.saturating_pow(retry))
    }

    /// Retries allowed after the initial attempt.
    pub fn max_retries(&self) -> u32 {
        self.policy.max_attempts.saturating_sub(1)
    }

    /// Delay before the next retry, or `None` once retries are exhausted.
    pub fn next_delay<R: Rng + ?Sized>(&mut self, rng: &mut R) -> Option<Duration> {
        if self.is_exhausted() {
            return None;
        }
        let nominal = self.nominal_delay(self.retries);
        self.retries += 1;

        let jitter = self.policy.jitter.clamp(0.0, 1.0);
        if jitter == 0.0 {
            return Some(nominal);
        }
        let scale = 1.0 + rng.gen_range(-jitter..=jitter);
        Some(nominal.mul_f64(scale))
    }

    /// Retries handed out so far.
    pub fn retries(&self) -> u32 {
        self.retries
    }

    pub fn is_exhausted(&self) -> bool {
        self.retries >= self.max_retries()
    }

    /// Start over after a success.
    pub fn reset(&mut self) {
        self.retries = 0;
    }
}

/// Last known health of the upstream proxy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reachability {
    /// No connection attempted yet.
    Unknown,
    /// The last attempt succeeded.
    Reachable { last_checked: SystemTime },
    /// The last attempt failed.
    Unreachable { reason: String, since: SystemTime },
}

impl Reachability {
    pub fn is_unreachable(&self) -> bool {
        matches!(self, Reachability::Unreachable { .. })
    }
}

/// The upstream proxy endpoint and its reachability.
#[derive(Debug)]
pub struct UpstreamTarget {
    host: String,
    port: u16,
    reachability: RwLock<Reachability>,
}

impl UpstreamTarget {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            reachability: RwLock::new(Reachability::Unknown),
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// `host:port`, bracketing IPv6 literals.
    pub fn authority(&self) -> String {
        if self.host.contains(':') && !self.host.starts_with('[') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    pub fn reachability(&self) -> Reachability {
        self.reachability
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Record a successful connect. Returns `true` if this recovers from
    /// an unreachable state.
    pub fn mark_reachable(&self) -> bool {
        let mut state = self.reachability.write().unwrap_or_else(|e| e.into_inner());
        let recovered = state.is_unreachable();
        *state = Reachability::Reachable {
            last_checked: SystemTime::now(),
        };
        recovered
    }

    /// Record a failed connect. Returns `true` if the upstream just became
    /// unreachable.
    pub fn mark_unreachable(&self, reason: impl Into<String>) -> bool {
        let mut state = self.reachability.write().unwrap_or_else(|e| e.into_inner());
        let reason = reason.into();
        match &mut *state {
            Reachability::Unreachable { reason: current, .. } => {
                *current = reason;
                false
            }
            _ => {
                *state = Reachability::Unreachable {
                    reason,
                    since: SystemTime::now(),
                };
                true
            }
        }
    }
}

/// Connects to the upstream proxy with retries and tracks its health.
#[derive(Debug, Clone)]
pub struct UpstreamSupervisor {
    target: Arc<UpstreamTarget>,
    policy: BackoffPolicy,
    connect_timeout: Duration,
    registry: Arc<Registry>,
}

impl UpstreamSupervisor {
    pub fn new(
        target: Arc<UpstreamTarget>,
        policy: BackoffPolicy,
        connect_timeout: Duration,
        registry: Arc<Registry>,
    ) -> Self {
        Self {
            target,
            policy,
            connect_timeout,
            registry,
        }
    }

    pub fn target(&self) -> &Arc<UpstreamTarget> {
        &self.target
    }

    /// Open a TCP connection to the upstream proxy, retrying per policy.
    pub async fn connect(&self) -> Result<TcpStream> {
        let authority = self.target.authority();
        let timeout = self.connect_timeout;
        self.connect_with(|| connect_once(authority.clone(), timeout))
            .await
    }

    /// Single attempt, no retries. Still updates reachability.
    pub async fn probe(&self) -> Result<()> {
        match connect_once(self.target.authority(), self.connect_timeout).await {
            Ok(_) => {
                self.record_success();
                Ok(())
            }
            Err(e) => {
                self.record_failure(&e);
                Err(BridgeError::UpstreamUnreachable {
                    upstream: self.target.authority(),
                    attempts: 1,
                    message: e.to_string(),
                })
            }
        }
    }

    /// Retry loop over an arbitrary connector.
    pub async fn connect_with<F, Fut, T>(&self, mut connector: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = std::io::Result<T>>,
    {
        let mut backoff = Backoff::new(self.policy.clone());
        let mut attempts = 0u32;

        loop {
            attempts += 1;
            match connector().await {
                Ok(stream) => {
                    backoff.reset();
                    self.record_success();
                    return Ok(stream);
                }
                Err(e) => {
                    self.record_failure(&e);

                    // ThreadRng is !Send; keep it out of the await below.
                    let delay = backoff.next_delay(&mut rand::thread_rng());
                    let Some(delay) = delay else {
                        tracing::warn!(
                            upstream = %self.target.authority(),
                            attempts,
                            error = %e,
                            "Upstream proxy unreachable, giving up"
                        );
                        return Err(BridgeError::UpstreamUnreachable {
                            upstream: self.target.authority(),
                            attempts,
                            message: e.to_string(),
                        });
                    };

                    tracing::debug!(
                        upstream = %self.target.authority(),
                        attempt = attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Upstream connect failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    fn record_success(&self) {
        if self.target.mark_reachable() {
            tracing::info!(upstream = %self.target.authority(), "Upstream proxy reachable again");
            self.registry.publish(BridgeEvent::UpstreamRecovered {
                upstream: self.target.authority(),
            });
        }
    }

    fn record_failure(&self, error: &std::io::Error) {
        if self.target.mark_unreachable(error.to_string()) {
            tracing::warn!(
                upstream = %self.target.authority(),
                error = %error,
                "Upstream proxy unreachable"
            );
            self.registry.publish(BridgeEvent::UpstreamUnreachable {
                upstream: self.target.authority(),
                reason: error.to_string(),
            });
        }
    }
}

async fn connect_once(authority: String, timeout: Duration) -> std::io::Result<TcpStream> {
    match tokio::time::timeout(timeout, TcpStream::connect(authority.as_str())).await {
        Ok(Ok(stream)) => {
            // Best-effort: latency matters more than batching for a debugging proxy.
            let _ = stream.set_nodelay(true);
            Ok(stream)
        }
        Ok(Err(e)) => Err(e),
        Err(_) => Err(std::io::Error::new(
            std::io::ErrorKind::TimedOut,
            "connection timed out",
        )),
    }
}
