//! ICMP / ICMPv6 echo message encoding.

use std::net::IpAddr;

/// ICMP echo header size in bytes (type, code, checksum, id, seq).
pub const ECHO_HEADER_LEN: usize = 8;

const ICMPV4_ECHO_REQUEST: u8 = 8;
const ICMPV4_ECHO_REPLY: u8 = 0;
const ICMPV6_ECHO_REQUEST: u8 = 128;
const ICMPV6_ECHO_REPLY: u8 = 129;

/// Address family of an echo exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Family {
    V4,
    V6,
}

impl Family {
    pub fn of(addr: IpAddr) -> Self {
        match addr {
            IpAddr::V4(_) => Self::V4,
            IpAddr::V6(_) => Self::V6,
        }
    }

    const fn request_type(self) -> u8 {
        match self {
            Self::V4 => ICMPV4_ECHO_REQUEST,
            Self::V6 => ICMPV6_ECHO_REQUEST,
        }
    }

    const fn reply_type(self) -> u8 {
        match self {
            Self::V4 => ICMPV4_ECHO_REPLY,
            Self::V6 => ICMPV6_ECHO_REPLY,
        }
    }
}

/// A decoded echo reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EchoReply {
    pub ident: u16,
    pub seq: u16,
}

/// Builds an echo request with a zero-filled payload of `payload_len` bytes.
///
/// The ICMPv6 checksum covers a pseudo-header only the kernel knows, so it
/// is left zero for the kernel to fill in.
pub fn encode_request(family: Family, ident: u16, seq: u16, payload_len: usize) -> Vec<u8> {
    let mut buf = vec![0u8; ECHO_HEADER_LEN + payload_len];
    buf[0] = family.request_type();
    buf[4..6].copy_from_slice(&ident.to_be_bytes());
    buf[6..8].copy_from_slice(&seq.to_be_bytes());

    for (i, b) in buf[ECHO_HEADER_LEN..].iter_mut().enumerate() {
        *b = (i & 0xff) as u8;
    }

    if family == Family::V4 {
        let sum = checksum(&buf);
        buf[2..4].copy_from_slice(&sum.to_be_bytes());
    }

    buf
}

/// Decodes an echo reply, returning `None` for any other message.
///
/// An IPv4 header in front of the ICMP message (raw sockets, BSD datagram
/// sockets) is skipped.
pub fn decode_reply(family: Family, data: &[u8]) -> Option<EchoReply> {
    let icmp = match family {
        Family::V4 => strip_ipv4_header(data)?,
        Family::V6 => data,
    };

    if icmp.len() < ECHO_HEADER_LEN || icmp[0] != family.reply_type() || icmp[1] != 0 {
        return None;
    }

    Some(EchoReply {
        ident: u16::from_be_bytes([icmp[4], icmp[5]]),
        seq: u16::from_be_bytes([icmp[6], icmp[7]]),
    })
}

fn strip_ipv4_header(data: &[u8]) -> Option<&[u8]> {
    let first = *data.first()?;
    if first >> 4 != 4 {
        return Some(data);
    }
    let header_len = usize::from(first & 0x0f) * 4;
    data.get(header_len..)
}

/// RFC 1071 internet checksum.
pub fn checksum(data: &[u8]) -> u16 {
    let mut sum: u32 = 0;
    let mut chunks = data.chunks_exact(2);
    for pair in &mut chunks {
        sum += u32::from(u16::from_be_bytes([pair[0], pair[1]]));
    }
    if let [last] = chunks.remainder() {
        sum += u32::from(*last) << 8;
    }
    while sum >> 16 != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    !(sum as u16)
}
