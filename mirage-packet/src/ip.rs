//! IPv4 and IPv6 header marshaling

use std::net::{Ipv4Addr, Ipv6Addr};

/// IPv4 header length without options
pub const IPV4_HEADER_LEN: usize = 20;

/// Fixed IPv6 header length
pub const IPV6_HEADER_LEN: usize = 40;

const DEFAULT_TTL: u8 = 64;

/// IP protocol numbers the agent cares about
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IpProto {
    Icmp4,
    Tcp,
    Udp,
    Icmp6,
    /// Mirage signaling protocol (IP protocol 99)
    Tsmp,
    /// Packet could not be classified
    Unknown,
    Other(u8),
}

impl IpProto {
    /// Wire value of the protocol
    pub fn as_u8(&self) -> u8 {
        match self {
            IpProto::Icmp4 => 1,
            IpProto::Tcp => 6,
            IpProto::Udp => 17,
            IpProto::Icmp6 => 58,
            IpProto::Tsmp => 99,
            IpProto::Unknown => 0,
            IpProto::Other(v) => *v,
        }
    }
}

impl From<u8> for IpProto {
    fn from(v: u8) -> Self {
        match v {
            1 => IpProto::Icmp4,
            6 => IpProto::Tcp,
            17 => IpProto::Udp,
            58 => IpProto::Icmp6,
            99 => IpProto::Tsmp,
            other => IpProto::Other(other),
        }
    }
}

impl std::fmt::Display for IpProto {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IpProto::Icmp4 => write!(f, "ICMPv4"),
            IpProto::Tcp => write!(f, "TCP"),
            IpProto::Udp => write!(f, "UDP"),
            IpProto::Icmp6 => write!(f, "ICMPv6"),
            IpProto::Tsmp => write!(f, "TSMP"),
            IpProto::Unknown => write!(f, "Unknown"),
            IpProto::Other(v) => write!(f, "IPProto-{}", v),
        }
    }
}

/// IPv4 header without options
///
/// ```text
/// +--------+--------+--------+--------+
/// |Ver/IHL |  TOS   |  Total Length   |
/// +--------+--------+--------+--------+
/// |  Identification |  Flags/Offset   |
/// +--------+--------+--------+--------+
/// |  TTL   | Proto  |    Checksum     |
/// +--------+--------+--------+--------+
/// |          Source Address           |
/// +--------+--------+--------+--------+
/// |        Destination Address        |
/// +--------+--------+--------+--------+
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ipv4Header {
    pub proto: IpProto,
    pub id: u16,
    pub src: Ipv4Addr,
    pub dst: Ipv4Addr,
}

impl Ipv4Header {
    /// Write the header into the first [`IPV4_HEADER_LEN`] bytes of `buf`.
    ///
    /// `total_len` is the length of the whole packet including this header.
    /// The caller guarantees `buf` holds at least a full header.
    pub fn marshal(&self, buf: &mut [u8], total_len: u16) {
        buf[0] = 0x45;
        buf[1] = 0;
        buf[2..4].copy_from_slice(&total_len.to_be_bytes());
        buf[4..6].copy_from_slice(&self.id.to_be_bytes());
        buf[6] = 0;
        buf[7] = 0;
        buf[8] = DEFAULT_TTL;
        buf[9] = self.proto.as_u8();
        buf[10] = 0;
        buf[11] = 0;
        buf[12..16].copy_from_slice(&self.src.octets());
        buf[16..20].copy_from_slice(&self.dst.octets());

        let csum = checksum(&buf[..IPV4_HEADER_LEN]);
        buf[10..12].copy_from_slice(&csum.to_be_bytes());
    }
}

/// Fixed IPv6 header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ipv6Header {
    pub proto: IpProto,
    pub src: Ipv6Addr,
    pub dst: Ipv6Addr,
}

impl Ipv6Header {
    /// Write the header into the first [`IPV6_HEADER_LEN`] bytes of `buf`.
    ///
    /// `payload_len` excludes the header itself.
    pub fn marshal(&self, buf: &mut [u8], payload_len: u16) {
        buf[0] = 0x60;
        buf[1] = 0;
        buf[2] = 0;
        buf[3] = 0;
        buf[4..6].copy_from_slice(&payload_len.to_be_bytes());
        buf[6] = self.proto.as_u8();
        buf[7] = DEFAULT_TTL;
        buf[8..24].copy_from_slice(&self.src.octets());
        buf[24..40].copy_from_slice(&self.dst.octets());
    }
}

/// RFC 1071 internet checksum
pub(crate) fn checksum(data: &[u8]) -> u16 {
    let mut sum: u32 = 0;
    for chunk in data.chunks(2) {
        let word = if chunk.len() == 2 {
            u16::from_be_bytes([chunk[0], chunk[1]])
        } else {
            u16::from_be_bytes([chunk[0], 0])
        };
        sum += u32::from(word);
    }
    while sum >> 16 != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    !(sum as u16)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_proto_round_trip() {
        for v in [1u8, 6, 17, 58, 99, 200] {
            assert_eq!(IpProto::from(v).as_u8(), v);
        }
        assert_eq!(IpProto::from(99), IpProto::Tsmp);
    }

    #[test]
    fn test_ipv4_header_checksum_verifies() {
        let header = Ipv4Header {
            proto: IpProto::Udp,
            id: 0x1c46,
            src: Ipv4Addr::new(172, 16, 10, 99),
            dst: Ipv4Addr::new(172, 16, 10, 12),
        };
        let mut buf = [0u8; IPV4_HEADER_LEN];
        header.marshal(&mut buf, 60);

        // Summing a header with a valid checksum yields zero
        assert_eq!(checksum(&buf), 0);
        assert_eq!(buf[9], 17);
        assert_eq!(u16::from_be_bytes([buf[2], buf[3]]), 60);
    }

    #[test]
    fn test_ipv6_header_layout() {
        let header = Ipv6Header {
            proto: IpProto::Tsmp,
            src: "fd7a::1".parse().unwrap(),
            dst: "fd7a::2".parse().unwrap(),
        };
        let mut buf = [0u8; IPV6_HEADER_LEN];
        header.marshal(&mut buf, 7);

        assert_eq!(buf[0] >> 4, 6);
        assert_eq!(u16::from_be_bytes([buf[4], buf[5]]), 7);
        assert_eq!(buf[6], 99);
        assert_eq!(buf[23], 1);
        assert_eq!(buf[39], 2);
    }
}
