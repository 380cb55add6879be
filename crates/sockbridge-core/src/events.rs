//! Observable bridge events.
//!
//! Events are pushed to subscribers over a `tokio::sync::broadcast` channel
//! owned by the [`Registry`](crate::Registry). Slow subscribers lag and lose
//! events; the bridge never blocks on them.

use std::net::SocketAddr;

use serde::Serialize;

use crate::session::{SessionId, SessionSummary};
use crate::socks5::TargetAddr;

/// Something observable happened in the bridge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum BridgeEvent {
    /// A client completed the request phase and a session was registered.
    SessionOpened {
        id: SessionId,
        source: SocketAddr,
        target: TargetAddr,
    },

    /// A session ended; the summary is also appended to history.
    SessionClosed { summary: SessionSummary },

    /// Byte counters of a live session changed (at most once per second).
    BytesUpdated {
        id: SessionId,
        bytes_sent: u64,
        bytes_received: u64,
    },

    /// The upstream debugging proxy stopped accepting connections.
    UpstreamUnreachable { upstream: String, reason: String },

    /// The upstream debugging proxy accepted a connection again.
    UpstreamRecovered { upstream: String },

    /// A session was closed because heartbeat probes went unanswered.
    HeartbeatTimeout { id: SessionId, source: SocketAddr },
}

impl BridgeEvent {
    /// Short name used in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            BridgeEvent::SessionOpened { .. } => "session_opened",
            BridgeEvent::SessionClosed { .. } => "session_closed",
            BridgeEvent::BytesUpdated { .. } => "bytes_updated",
            BridgeEvent::UpstreamUnreachable { .. } => "upstream_unreachable",
            BridgeEvent::UpstreamRecovered { .. } => "upstream_recovered",
            BridgeEvent::HeartbeatTimeout { .. } => "heartbeat_timeout",
        }
    }
}
