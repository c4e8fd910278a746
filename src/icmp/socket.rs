use std::future::Future;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::os::fd::FromRawFd;

use tracing::debug;

use super::packet::{decode_reply, encode_request, Family};
use super::ProbeError;

/// Largest datagram we expect back: IPv4 header plus a full echo payload.
const RECV_BUF_LEN: usize = 2048;

/// Transport for echo requests to a single target.
///
/// Implementations only surface echo replies that belong to this socket;
/// everything else is filtered out inside `recv_echo`.
pub trait EchoSocket: Send {
    /// Sends one echo request carrying `seq`.
    fn send_echo(&mut self, seq: u16) -> impl Future<Output = io::Result<()>> + Send;

    /// Waits for the next echo reply and returns its sequence number.
    ///
    /// Must be cancel safe: dropping the future loses no reply that a later
    /// call could have returned.
    fn recv_echo(&mut self) -> impl Future<Output = io::Result<u16>> + Send;
}

/// Kind of ICMP socket that was opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketKind {
    /// Unprivileged `SOCK_DGRAM` ICMP socket. The kernel owns the identifier.
    Datagram,
    /// `SOCK_RAW` socket. Replies are filtered by our identifier.
    Raw,
}

/// ICMP echo socket connected to one target.
pub struct IcmpSocket {
    inner: tokio::net::UdpSocket,
    family: Family,
    kind: SocketKind,
    ident: u16,
    payload_len: usize,
    buf: Vec<u8>,
}

impl std::fmt::Debug for IcmpSocket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IcmpSocket")
            .field("family", &self.family)
            .field("kind", &self.kind)
            .field("ident", &self.ident)
            .finish()
    }
}

impl IcmpSocket {
    /// Opens an ICMP socket to `addr`, trying a datagram socket first and a
    /// raw socket second. Must be called from within a tokio runtime.
    pub fn open(
        target: &str,
        addr: IpAddr,
        ident: u16,
        payload_len: usize,
    ) -> Result<Self, ProbeError> {
        let family = Family::of(addr);

        let (socket, kind) = match open_std(family, SocketKind::Datagram) {
            Ok(s) => (s, SocketKind::Datagram),
            Err(dgram_err) => {
                debug!(
                    host = target,
                    error = %dgram_err,
                    "datagram ICMP socket unavailable, trying raw socket",
                );
                let raw = open_std(family, SocketKind::Raw).map_err(|source| {
                    ProbeError::Socket {
                        target: target.to_string(),
                        source,
                    }
                })?;
                (raw, SocketKind::Raw)
            }
        };

        socket
            .connect(SocketAddr::new(addr, 0))
            .map_err(|source| ProbeError::Socket {
                target: target.to_string(),
                source,
            })?;

        let inner = tokio::net::UdpSocket::from_std(socket).map_err(|source| {
            ProbeError::Socket {
                target: target.to_string(),
                source,
            }
        })?;

        debug!(host = target, %addr, ?kind, ident, "opened ICMP socket");

        Ok(Self {
            inner,
            family,
            kind,
            ident,
            payload_len,
            buf: vec![0u8; RECV_BUF_LEN],
        })
    }

    pub fn kind(&self) -> SocketKind {
        self.kind
    }
}

impl EchoSocket for IcmpSocket {
    async fn send_echo(&mut self, seq: u16) -> io::Result<()> {
        let packet = encode_request(self.family, self.ident, seq, self.payload_len);
        self.inner.send(&packet).await?;
        Ok(())
    }

    async fn recv_echo(&mut self) -> io::Result<u16> {
        loop {
            let n = self.inner.recv(&mut self.buf).await?;
            let Some(reply) = decode_reply(self.family, &self.buf[..n]) else {
                continue;
            };
            if self.kind == SocketKind::Raw && reply.ident != self.ident {
                continue;
            }
            return Ok(reply.seq);
        }
    }
}

fn open_std(family: Family, kind: SocketKind) -> io::Result<std::net::UdpSocket> {
    let (domain, proto) = match family {
        Family::V4 => (libc::AF_INET, libc::IPPROTO_ICMP),
        Family::V6 => (libc::AF_INET6, libc::IPPROTO_ICMPV6),
    };
    let ty = match kind {
        SocketKind::Datagram => libc::SOCK_DGRAM,
        SocketKind::Raw => libc::SOCK_RAW,
    };

    // SAFETY: socket(2) has no memory-safety preconditions.
    let fd = unsafe { libc::socket(domain, ty, proto) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }

    // SAFETY: `fd` was just returned by socket(2) and is owned by nothing
    // else; the UdpSocket takes ownership and closes it on drop.
    let socket = unsafe { std::net::UdpSocket::from_raw_fd(fd) };
    socket.set_nonblocking(true)?;
    Ok(socket)
}
