use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use thiserror::Error;

pub const MAGIC: [u8; 2] = *b"PG";

/// Punch datagrams stay below the KCP header size, so a straggler that
/// reaches a node after it switched to KCP is discarded as too short.
pub const KCP_OVERHEAD: usize = 24;

/// `PG` + kind + family + 16 address bytes + port.
pub const MAX_LEN: usize = 2 + 1 + 1 + 16 + 2;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PunchDatagramError {
    #[error("punch datagram: truncated ({0} bytes)")]
    Truncated(usize),
    #[error("punch datagram: bad magic")]
    BadMagic,
    #[error("punch datagram: unknown kind {0}")]
    UnknownKind(u8),
    #[error("punch datagram: unknown address family {0}")]
    UnknownFamily(u8),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PunchKind {
    Punch,
    Ack,
}

/// One node-to-node punch datagram, carrying the sender's local node address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PunchDatagram {
    pub kind: PunchKind,
    pub local: SocketAddr,
}

impl PunchDatagram {
    pub fn punch(local: SocketAddr) -> Self {
        Self {
            kind: PunchKind::Punch,
            local,
        }
    }

    pub fn ack(local: SocketAddr) -> Self {
        Self {
            kind: PunchKind::Ack,
            local,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut b = Vec::with_capacity(MAX_LEN);
        b.extend_from_slice(&MAGIC);
        b.push(match self.kind {
            PunchKind::Punch => 1,
            PunchKind::Ack => 2,
        });
        match self.local.ip() {
            IpAddr::V4(ip) => {
                b.push(4);
                b.extend_from_slice(&ip.octets());
            }
            IpAddr::V6(ip) => {
                b.push(6);
                b.extend_from_slice(&ip.octets());
            }
        }
        b.extend_from_slice(&self.local.port().to_be_bytes());
        b
    }

    pub fn decode(buf: &[u8]) -> Result<Self, PunchDatagramError> {
        if buf.len() < 4 {
            return Err(PunchDatagramError::Truncated(buf.len()));
        }
        if buf[..2] != MAGIC {
            return Err(PunchDatagramError::BadMagic);
        }
        let kind = match buf[2] {
            1 => PunchKind::Punch,
            2 => PunchKind::Ack,
            k => return Err(PunchDatagramError::UnknownKind(k)),
        };

        let rest = &buf[4..];
        let (ip, rest) = match buf[3] {
            4 if rest.len() == 4 + 2 => {
                let octets: [u8; 4] = [rest[0], rest[1], rest[2], rest[3]];
                (IpAddr::V4(Ipv4Addr::from(octets)), &rest[4..])
            }
            6 if rest.len() == 16 + 2 => {
                let mut octets = [0u8; 16];
                octets.copy_from_slice(&rest[..16]);
                (IpAddr::V6(Ipv6Addr::from(octets)), &rest[16..])
            }
            4 | 6 => return Err(PunchDatagramError::Truncated(buf.len())),
            f => return Err(PunchDatagramError::UnknownFamily(f)),
        };
        let port = u16::from_be_bytes([rest[0], rest[1]]);

        Ok(Self {
            kind,
            local: SocketAddr::new(ip, port),
        })
    }
}
