//! TSMP rejection notices
//!
//! A rejection notice tells a peer that its connection attempt was refused,
//! and why. Unlike a TCP RST it carries a reason code.
//!
//! ```text
//! +--------+--------+--------+--------+--------+--------+--------+
//! | Type   | Proto  | Reason |    Src Port     |    Dst Port     |
//! | '!'    |        | A / S  |   (uint16, BE)  |   (uint16, BE)  |
//! +--------+--------+--------+--------+--------+--------+--------+
//! ```
//!
//! The payload follows an IPv4 or IPv6 header with protocol 99 whose
//! addresses are the reverse of the rejected flow: the rejecting node is the
//! IP source.

use std::net::{IpAddr, SocketAddr};

use crate::ip::{IpProto, Ipv4Header, Ipv6Header, IPV4_HEADER_LEN, IPV6_HEADER_LEN};
use crate::parsed::Parsed;
use crate::{Error, Result, MAX_PACKET_LEN};

/// Length of a rejection notice payload
pub const TSMP_REJECT_PAYLOAD_LEN: usize = 7;

/// TSMP message types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TsmpType {
    RejectedConn,
}

impl TsmpType {
    pub fn as_u8(&self) -> u8 {
        match self {
            TsmpType::RejectedConn => b'!',
        }
    }
}

/// Why a connection was rejected
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    /// Denied by the access control policy
    Acl,
    /// Denied because the node is in shields-up mode
    ShieldsUp,
    Other(u8),
}

impl RejectReason {
    pub fn as_u8(&self) -> u8 {
        match self {
            RejectReason::Acl => b'A',
            RejectReason::ShieldsUp => b'S',
            RejectReason::Other(v) => *v,
        }
    }
}

impl From<u8> for RejectReason {
    fn from(v: u8) -> Self {
        match v {
            b'A' => RejectReason::Acl,
            b'S' => RejectReason::ShieldsUp,
            other => RejectReason::Other(other),
        }
    }
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RejectReason::Acl => write!(f, "acl"),
            RejectReason::ShieldsUp => write!(f, "shields"),
            RejectReason::Other(v) => write!(f, "0x{:02x}", v),
        }
    }
}

/// A rejection notice for one flow
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RejectedHeader {
    /// Initiator of the rejected flow
    pub src: SocketAddr,
    /// Destination that refused the flow
    pub dst: SocketAddr,
    /// Protocol of the rejected flow (TCP or UDP)
    pub proto: IpProto,
    pub reason: RejectReason,
}

impl RejectedHeader {
    fn ip_header_len(&self) -> usize {
        match self.src.ip() {
            IpAddr::V4(_) => IPV4_HEADER_LEN,
            IpAddr::V6(_) => IPV6_HEADER_LEN,
        }
    }

    /// Total packet length: IP header plus the notice payload
    pub fn packet_len(&self) -> usize {
        self.ip_header_len() + TSMP_REJECT_PAYLOAD_LEN
    }

    /// Encode the notice into `buf`, reversed IP header first.
    pub fn marshal(&self, buf: &mut [u8]) -> Result<()> {
        let needed = self.packet_len();
        if buf.len() < needed {
            return Err(Error::BufferTooSmall {
                expected: needed,
                actual: buf.len(),
            });
        }
        if buf.len() > MAX_PACKET_LEN {
            return Err(Error::PacketTooLarge {
                actual: buf.len(),
                max: MAX_PACKET_LEN,
            });
        }

        let header_len = match (self.src.ip(), self.dst.ip()) {
            (IpAddr::V4(src), IpAddr::V4(dst)) => {
                let iph = Ipv4Header {
                    proto: IpProto::Tsmp,
                    id: 0,
                    src: dst,
                    dst: src,
                };
                iph.marshal(buf, needed as u16);
                IPV4_HEADER_LEN
            }
            (IpAddr::V6(src), IpAddr::V6(dst)) => {
                let iph = Ipv6Header {
                    proto: IpProto::Tsmp,
                    src: dst,
                    dst: src,
                };
                iph.marshal(buf, TSMP_REJECT_PAYLOAD_LEN as u16);
                IPV6_HEADER_LEN
            }
            (src, dst) => return Err(Error::AddressFamilyMismatch { src, dst }),
        };

        let payload = &mut buf[header_len..needed];
        payload[0] = TsmpType::RejectedConn.as_u8();
        payload[1] = self.proto.as_u8();
        payload[2] = self.reason.as_u8();
        payload[3..5].copy_from_slice(&self.src.port().to_be_bytes());
        payload[5..7].copy_from_slice(&self.dst.port().to_be_bytes());
        Ok(())
    }

    /// Encode the notice into a freshly allocated packet of exact length
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; self.packet_len()];
        self.marshal(&mut buf)?;
        Ok(buf)
    }
}

/// Parse a TSMP payload (the bytes after the IP header) into `pp`.
///
/// Only the ports of a rejection notice are extracted. Truncated notices and
/// unknown message types leave `pp` untouched.
pub(crate) fn parse_tsmp_payload(pp: &mut Parsed, buf: &[u8]) {
    let Some(&kind) = buf.first() else {
        return;
    };
    if kind == TsmpType::RejectedConn.as_u8() {
        if buf.len() < TSMP_REJECT_PAYLOAD_LEN {
            return;
        }
        pp.src.set_port(u16::from_be_bytes([buf[3], buf[4]]));
        pp.dst.set_port(u16::from_be_bytes([buf[5], buf[6]]));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v4_notice() -> RejectedHeader {
        RejectedHeader {
            src: "100.64.0.1:41000".parse().unwrap(),
            dst: "100.64.0.2:22".parse().unwrap(),
            proto: IpProto::Tcp,
            reason: RejectReason::Acl,
        }
    }

    #[test]
    fn test_packet_len() {
        assert_eq!(v4_notice().packet_len(), 27);

        let v6 = RejectedHeader {
            src: "[fd7a::1]:1".parse().unwrap(),
            dst: "[fd7a::2]:2".parse().unwrap(),
            proto: IpProto::Udp,
            reason: RejectReason::ShieldsUp,
        };
        assert_eq!(v6.packet_len(), 47);
    }

    #[test]
    fn test_marshal_payload_layout() {
        let bytes = v4_notice().to_bytes().unwrap();
        let payload = &bytes[IPV4_HEADER_LEN..];
        assert_eq!(payload, &[b'!', 6, b'A', 0xa0, 0x28, 0x00, 0x16]);
    }

    #[test]
    fn test_marshal_small_buffer() {
        let mut buf = [0u8; 26];
        let err = v4_notice().marshal(&mut buf).unwrap_err();
        assert!(matches!(
            err,
            Error::BufferTooSmall {
                expected: 27,
                actual: 26
            }
        ));
    }

    #[test]
    fn test_marshal_large_buffer() {
        let mut buf = vec![0u8; MAX_PACKET_LEN + 1];
        let err = v4_notice().marshal(&mut buf).unwrap_err();
        assert!(matches!(err, Error::PacketTooLarge { .. }));
    }

    #[test]
    fn test_marshal_mixed_families() {
        let notice = RejectedHeader {
            src: "100.64.0.1:1".parse().unwrap(),
            dst: "[fd7a::2]:2".parse().unwrap(),
            proto: IpProto::Tcp,
            reason: RejectReason::Acl,
        };
        assert!(matches!(
            notice.to_bytes(),
            Err(Error::AddressFamilyMismatch { .. })
        ));
    }

    #[test]
    fn test_reason_codes() {
        assert_eq!(RejectReason::from(b'A'), RejectReason::Acl);
        assert_eq!(RejectReason::from(b'S'), RejectReason::ShieldsUp);
        assert_eq!(RejectReason::from(b'Z').as_u8(), b'Z');
        assert_eq!(RejectReason::ShieldsUp.to_string(), "shields");
    }

    #[test]
    fn test_parse_payload_short_is_ignored() {
        let mut pp = Parsed::default();
        let before = pp.clone();
        parse_tsmp_payload(&mut pp, &[b'!', 6, b'A', 0xa0, 0x28, 0x00]);
        assert_eq!(pp, before);

        parse_tsmp_payload(&mut pp, &[]);
        assert_eq!(pp, before);
    }

    #[test]
    fn test_parse_payload_unknown_type_is_ignored() {
        let mut pp = Parsed::default();
        let before = pp.clone();
        parse_tsmp_payload(&mut pp, &[b'?', 6, b'A', 0xa0, 0x28, 0x00, 0x16]);
        assert_eq!(pp, before);
    }
}
