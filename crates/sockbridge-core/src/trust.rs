//! Source address trust filtering.
//!
//! The bridge listens on every interface, so the first thing each accepted
//! connection goes through is a check that its source address belongs to the
//! local network. Anything else is dropped without a byte written.
//!
//! # Trusted Ranges
//!
//! | Family | Range | Kind |
//! |--------|-------|------|
//! | IPv4 | `10.0.0.0/8` | private |
//! | IPv4 | `172.16.0.0/12` | private |
//! | IPv4 | `192.168.0.0/16` | private |
//! | IPv4 | `169.254.0.0/16` | link-local |
//! | IPv6 | `fe80::/10` | link-local |
//! | IPv6 | `fc00::/7` | unique local |
//! | both | `127.0.0.0/8`, `::1` | loopback (policy controlled) |
//!
//! IPv4-mapped IPv6 addresses (`::ffff:a.b.c.d`) are classified by their
//! embedded IPv4 address.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// Policy knobs for the trust filter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrustPolicy {
    /// Accept loopback sources (same-host clients and local tooling).
    pub allow_loopback: bool,
}

impl Default for TrustPolicy {
    fn default() -> Self {
        Self {
            allow_loopback: true,
        }
    }
}

/// Returns `true` if the address is in a private or link-local range.
///
/// Loopback is not included; see [`is_trusted_source`].
pub fn is_private_or_link_local(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => is_private_v4(v4),
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => is_private_v4(v4),
            None => is_private_v6(v6),
        },
    }
}

/// Returns `true` if a connection from `ip` may proceed to the handshake.
pub fn is_trusted_source(ip: IpAddr, policy: &TrustPolicy) -> bool {
    if is_private_or_link_local(ip) {
        return true;
    }
    policy.allow_loopback && is_loopback(ip)
}

fn is_private_v4(ip: Ipv4Addr) -> bool {
    ip.is_private() || ip.is_link_local()
}

fn is_private_v6(ip: Ipv6Addr) -> bool {
    let first = ip.segments()[0];
    // fe80::/10
    let link_local = (first & 0xffc0) == 0xfe80;
    // fc00::/7
    let unique_local = (first & 0xfe00) == 0xfc00;
    link_local || unique_local
}

fn is_loopback(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_loopback(),
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => v4.is_loopback(),
            None => v6.is_loopback(),
        },
    }
}

/// Hook for an authorization layer in front of the handshake.
///
/// The bridge calls this after the trust filter passes. Pairing or
/// allowlisting layers plug in here; the default accepts every trusted peer.
pub trait PeerAuthorizer: Send + Sync {
    /// Returns `true` if the peer may open a session.
    fn is_authorized(&self, peer: IpAddr) -> bool;
}

/// Authorizer that accepts every peer.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl PeerAuthorizer for AllowAll {
    fn is_authorized(&self, _peer: IpAddr) -> bool {
        true
    }
}

impl<F> PeerAuthorizer for F
where
    F: Fn(IpAddr) -> bool + Send + Sync,
{
    fn is_authorized(&self, peer: IpAddr) -> bool {
        self(peer)
    }
}
