//! SOCKS5 handshake engine.
//!
//! Implements the no-authentication subset of RFC 1928 that the VPN client
//! speaks: a greeting that must offer method `0x00`, followed by a single
//! CONNECT request addressed by IPv4, IPv6 or domain name.
//!
//! Every reply the bridge sends is the fixed 10-byte form with a zero bound
//! address; the client never inspects `BND.ADDR`.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::{BridgeError, Result};

/// SOCKS protocol version byte.
pub const VERSION: u8 = 0x05;

/// Method byte for "no authentication required".
pub const NO_AUTH: u8 = 0x00;

/// Method byte for "no acceptable methods".
pub const NO_ACCEPTABLE_METHODS: u8 = 0xFF;

const CMD_CONNECT: u8 = 0x01;

const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

/// SOCKS5 reply codes (RFC 1928 section 6).
pub mod reply {
    pub const SUCCEEDED: u8 = 0x00;
    pub const GENERAL_FAILURE: u8 = 0x01;
    pub const CONNECTION_NOT_ALLOWED: u8 = 0x02;
    pub const NETWORK_UNREACHABLE: u8 = 0x03;
    pub const HOST_UNREACHABLE: u8 = 0x04;
    pub const CONNECTION_REFUSED: u8 = 0x05;
    pub const TTL_EXPIRED: u8 = 0x06;
    pub const COMMAND_NOT_SUPPORTED: u8 = 0x07;
    pub const ADDRESS_TYPE_NOT_SUPPORTED: u8 = 0x08;
}

/// Destination requested by the client.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TargetAddr {
    /// Literal IPv4 or IPv6 address.
    Ip(SocketAddr),
    /// Domain name to be resolved by the bridge.
    Domain(String, u16),
}

impl TargetAddr {
    /// Destination port.
    pub fn port(&self) -> u16 {
        match self {
            TargetAddr::Ip(addr) => addr.port(),
            TargetAddr::Domain(_, port) => *port,
        }
    }

    /// Host part as it appears in an HTTP `Host` header (IPv6 bracketed).
    pub fn host(&self) -> String {
        match self {
            TargetAddr::Ip(SocketAddr::V4(addr)) => addr.ip().to_string(),
            TargetAddr::Ip(SocketAddr::V6(addr)) => format!("[{}]", addr.ip()),
            TargetAddr::Domain(name, _) => name.clone(),
        }
    }

    /// `host:port` authority for CONNECT lines and absolute-form URIs.
    pub fn authority(&self) -> String {
        format!("{}:{}", self.host(), self.port())
    }
}

impl fmt::Display for TargetAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.authority())
    }
}

impl Serialize for TargetAddr {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.collect_str(self)
    }
}

/// Encode a SOCKS5 reply with a zero IPv4 bound address.
pub fn encode_reply(code: u8) -> [u8; 10] {
    // +----+-----+-------+------+----------+----------+
    // |VER | REP |  RSV  | ATYP | BND.ADDR | BND.PORT |
    // +----+-----+-------+------+----------+----------+
    [
        VERSION, code, 0x00, // Version, reply, reserved
        ATYP_IPV4, 0x00, 0x00, 0x00, 0x00, // 0.0.0.0
        0x00, 0x00, // Port 0
    ]
}

/// Send a reply frame to the client.
pub async fn send_reply<S>(stream: &mut S, code: u8) -> std::io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    stream.write_all(&encode_reply(code)).await?;
    stream.flush().await
}

/// Read the method-selection greeting and accept "no authentication".
///
/// A greeting that does not offer method `0x00` is answered with
/// `05 FF` and fails. A wrong version byte fails without a reply.
pub async fn negotiate_greeting<S>(stream: &mut S) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    // +----+----------+----------+
    // |VER | NMETHODS | METHODS  |
    // +----+----------+----------+
    let mut header = [0u8; 2];
    stream.read_exact(&mut header).await?;

    if header[0] != VERSION {
        return Err(BridgeError::protocol(
            None,
            format!("Invalid SOCKS version in greeting: {:#04x}", header[0]),
        ));
    }

    let nmethods = header[1] as usize;
    if nmethods == 0 {
        return Err(BridgeError::protocol(None, "Greeting offers no methods"));
    }

    let mut methods = vec![0u8; nmethods];
    stream.read_exact(&mut methods).await?;

    if !methods.contains(&NO_AUTH) {
        // Best-effort: the client is told why before we hang up.
        stream
            .write_all(&[VERSION, NO_ACCEPTABLE_METHODS])
            .await
            .ok();
        return Err(BridgeError::protocol(
            None,
            format!("Greeting does not offer no-auth method: {methods:02x?}"),
        ));
    }

    stream.write_all(&[VERSION, NO_AUTH]).await?;
    stream.flush().await?;
    Ok(())
}

/// Read a CONNECT request and return the requested target.
///
/// Errors carry the reply code the caller should send before closing.
pub async fn read_request<S>(stream: &mut S) -> Result<TargetAddr>
where
    S: AsyncRead + Unpin,
{
    // +----+-----+-------+------+----------+----------+
    // |VER | CMD |  RSV  | ATYP | DST.ADDR | DST.PORT |
    // +----+-----+-------+------+----------+----------+
    // | 1  |  1  | X'00' |  1   | Variable |    2     |
    // +----+-----+-------+------+----------+----------+
    let mut header = [0u8; 4];
    stream.read_exact(&mut header).await?;
    let [version, command, reserved, atyp] = header;

    if version != VERSION {
        return Err(BridgeError::protocol(
            Some(reply::GENERAL_FAILURE),
            format!("Invalid SOCKS version in request: {version:#04x}"),
        ));
    }

    if command != CMD_CONNECT {
        return Err(BridgeError::protocol(
            Some(reply::COMMAND_NOT_SUPPORTED),
            format!("Unsupported SOCKS5 command: {command:#04x} (only CONNECT supported)"),
        ));
    }

    if reserved != 0x00 {
        return Err(BridgeError::protocol(
            Some(reply::GENERAL_FAILURE),
            format!("Non-zero reserved byte in request: {reserved:#04x}"),
        ));
    }

    match atyp {
        ATYP_IPV4 => {
            let mut buf = [0u8; 6];
            stream.read_exact(&mut buf).await?;
            let ip = Ipv4Addr::new(buf[0], buf[1], buf[2], buf[3]);
            let port = u16::from_be_bytes([buf[4], buf[5]]);
            Ok(TargetAddr::Ip(SocketAddr::new(IpAddr::V4(ip), port)))
        }
        ATYP_DOMAIN => {
            let len = stream.read_u8().await? as usize;
            if len == 0 {
                return Err(BridgeError::protocol(
                    Some(reply::GENERAL_FAILURE),
                    "Empty domain name in request",
                ));
            }
            let mut buf = vec![0u8; len + 2];
            stream.read_exact(&mut buf).await?;
            let port = u16::from_be_bytes([buf[len], buf[len + 1]]);
            buf.truncate(len);
            let name = String::from_utf8(buf).map_err(|_| {
                BridgeError::protocol(Some(reply::GENERAL_FAILURE), "Invalid domain encoding")
            })?;
            Ok(TargetAddr::Domain(name, port))
        }
        ATYP_IPV6 => {
            let mut buf = [0u8; 18];
            stream.read_exact(&mut buf).await?;
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&buf[..16]);
            let port = u16::from_be_bytes([buf[16], buf[17]]);
            Ok(TargetAddr::Ip(SocketAddr::new(
                IpAddr::V6(Ipv6Addr::from(octets)),
                port,
            )))
        }
        other => Err(BridgeError::protocol(
            Some(reply::ADDRESS_TYPE_NOT_SUPPORTED),
            format!("Unknown address type: {other:#04x}"),
        )),
    }
}

/// Run the full handshake: greeting then CONNECT request.
pub async fn handshake<S>(stream: &mut S) -> Result<TargetAddr>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    negotiate_greeting(stream).await?;
    read_request(stream).await
}

/// Turn a client away after the greeting with a general-failure reply.
///
/// Used when the concurrency ceiling is reached. The request itself is
/// never read.
pub async fn reject<S>(stream: &mut S, code: u8) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    negotiate_greeting(stream).await?;
    send_reply(stream, code).await?;
    Ok(())
}

/// Resolve a target to a socket address.
///
/// Literal addresses resolve to themselves. Domains go through the system
/// resolver; the first answer wins.
pub async fn resolve(target: &TargetAddr) -> Result<SocketAddr> {
    match target {
        TargetAddr::Ip(addr) => Ok(*addr),
        TargetAddr::Domain(name, port) => {
            let mut addrs = tokio::net::lookup_host((name.as_str(), *port))
                .await
                .map_err(|e| BridgeError::DnsResolution {
                    domain: name.clone(),
                    message: e.to_string(),
                })?;
            addrs.next().ok_or_else(|| BridgeError::DnsResolution {
                domain: name.clone(),
                message: "no addresses returned".to_string(),
            })
        }
    }
}
