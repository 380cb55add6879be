//! SOCKS5 to HTTP debugging-proxy bridge.
//!
//! `sockbridge-core` accepts SOCKS5 connections from a trusted mobile VPN
//! client on the local network and forwards each stream to a locally running
//! HTTP/HTTPS debugging proxy, while supervising every tunnel with a
//! heartbeat liveness protocol.
//!
//! # Architecture
//!
//! ```text
//! VPN client (LAN)
//!       |
//!       v
//! BridgeServer (0.0.0.0:9000)
//!       |
//!       +-- trust filter (private / link-local source?) --> silent drop
//!       +-- admission (concurrency ceiling)              --> REP 0x01
//!       +-- SOCKS5 handshake (greeting, CONNECT request)  --> REP 0x07/0x08
//!       +-- DNS resolution for domain targets             --> REP 0x04
//!       +-- UpstreamSupervisor (connect with backoff)     --> REP 0x05
//!       |
//!       v
//! Forwarding
//!       |
//!       +-- port 80   --> direct HTTP proxy request
//!       +-- otherwise --> HTTP CONNECT tunnel
//!       |
//!       v
//! Relay: client <-> FlowBuffer <-> upstream (64 KiB / 32 KiB hysteresis)
//!       +-- heartbeat probes 05 FF 00 / acks 05 00
//!       +-- idle timeout
//! ```
//!
//! Every state change is published to the [`Registry`], which owns the only
//! cross-session state (admission counter, statistics, history ring buffer)
//! and pushes [`BridgeEvent`]s to subscribers.
//!
//! # Usage
//!
//! ```ignore
//! use sockbridge_core::{BridgeConfig, BridgeServer};
//!
//! let server = BridgeServer::new(BridgeConfig::default())?;
//! let mut events = server.subscribe();
//! let handle = server.start().await?;
//! // ... later ...
//! handle.shutdown().await?;
//! ```

mod events;
mod flow;
mod forward;
mod heartbeat;
mod registry;
mod relay;
mod server;
mod session;
mod socks5;
mod trust;
mod upstream;

pub use events::BridgeEvent;
pub use flow::FlowBuffer;
pub use forward::{rewrite_request_head, ForwardMode};
pub use heartbeat::{
    respond_to_probes, ClientActivity, HeartbeatConfig, HeartbeatPhase, HeartbeatRecord,
    LivenessTracker, PeerVerdict, ProbeScanner, ACK, PROBE,
};
pub use registry::{AdmissionPermit, DeviceSnapshot, Registry, Statistics};
pub use relay::RelayConfig;
pub use server::{Advertisement, BridgeConfig, BridgeHandle, BridgeServer};
pub use session::{
    CloseReason, CloseSignal, Session, SessionCounters, SessionId, SessionSnapshot, SessionState,
    SessionSummary,
};
pub use socks5::{reply, TargetAddr};
pub use trust::{is_private_or_link_local, is_trusted_source, AllowAll, PeerAuthorizer, TrustPolicy};
pub use upstream::{Backoff, BackoffPolicy, Reachability, UpstreamSupervisor, UpstreamTarget};

use std::net::SocketAddr;
use std::time::Duration;

/// Result type for bridge operations.
pub type Result<T> = std::result::Result<T, BridgeError>;

/// Errors that can occur while bridging a connection.
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    /// Failed to bind the listening socket.
    #[error("Failed to bind to {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    /// Malformed or unsupported SOCKS5 frame.
    ///
    /// `reply` is the SOCKS5 reply code to send, if the protocol state
    /// still allows one.
    #[error("SOCKS5 protocol error: {message}")]
    Protocol { reply: Option<u8>, message: String },

    /// The client did not complete the handshake in time.
    #[error("SOCKS5 handshake timed out after {0:?}")]
    HandshakeTimeout(Duration),

    /// DNS resolution failed for a domain target.
    #[error("DNS resolution failed for {domain}: {message}")]
    DnsResolution { domain: String, message: String },

    /// The upstream debugging proxy could not be reached.
    #[error("Upstream proxy {upstream} unreachable after {attempts} attempt(s): {message}")]
    UpstreamUnreachable {
        upstream: String,
        attempts: u32,
        message: String,
    },

    /// The upstream proxy answered the CONNECT request with a non-2xx status.
    #[error("Upstream proxy refused tunnel to {target}: {status}")]
    TunnelRejected { target: String, status: String },

    /// A session state change that would move backwards.
    #[error("Illegal session transition from {from} to {to}")]
    InvalidTransition {
        from: SessionState,
        to: SessionState,
    },

    /// I/O error on either side of the bridge.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl BridgeError {
    /// Shorthand for a protocol error carrying a reply code.
    pub(crate) fn protocol(reply: Option<u8>, message: impl Into<String>) -> Self {
        BridgeError::Protocol {
            reply,
            message: message.into(),
        }
    }

    /// The SOCKS5 reply code this error maps to, if one can be sent.
    pub fn reply_code(&self) -> Option<u8> {
        match self {
            BridgeError::Protocol { reply, .. } => *reply,
            BridgeError::HandshakeTimeout(_) | BridgeError::Bind { .. } => None,
            BridgeError::DnsResolution { .. } => Some(reply::HOST_UNREACHABLE),
            BridgeError::UpstreamUnreachable { .. } | BridgeError::TunnelRejected { .. } => {
                Some(reply::CONNECTION_REFUSED)
            }
            BridgeError::InvalidTransition { .. }
            | BridgeError::Io(_)
            | BridgeError::Internal(_) => Some(reply::GENERAL_FAILURE),
        }
    }

    /// The close reason recorded when this error ends a session.
    pub fn close_reason(&self) -> CloseReason {
        match self {
            BridgeError::Protocol { .. } | BridgeError::HandshakeTimeout(_) => {
                CloseReason::ProtocolError
            }
            BridgeError::DnsResolution { .. } => CloseReason::ResolutionFailed,
            BridgeError::UpstreamUnreachable { .. } | BridgeError::TunnelRejected { .. } => {
                CloseReason::UpstreamUnreachable
            }
            BridgeError::Io(_) => CloseReason::IoError,
            BridgeError::Bind { .. }
            | BridgeError::InvalidTransition { .. }
            | BridgeError::Internal(_) => CloseReason::InternalError,
        }
    }
}
