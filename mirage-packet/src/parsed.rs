//! Lightweight packet summary

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use crate::ip::{IpProto, IPV4_HEADER_LEN, IPV6_HEADER_LEN};
use crate::tsmp::parse_tsmp_payload;

/// Summary of an IP packet: addresses, ports and protocol.
///
/// Decoding never fails; packets that cannot be classified come back with
/// [`IpProto::Unknown`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Parsed {
    /// IP version (4 or 6), 0 if unknown
    pub ip_version: u8,
    pub proto: IpProto,
    pub src: SocketAddr,
    pub dst: SocketAddr,
    /// Total length of the decoded buffer
    pub length: usize,
}

impl Default for Parsed {
    fn default() -> Self {
        Self {
            ip_version: 0,
            proto: IpProto::Unknown,
            src: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
            dst: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
            length: 0,
        }
    }
}

impl Parsed {
    /// Decode an IP packet
    pub fn decode(buf: &[u8]) -> Self {
        let mut pp = Parsed {
            length: buf.len(),
            ..Default::default()
        };
        let Some(&first) = buf.first() else {
            return pp;
        };

        match first >> 4 {
            4 => pp.decode_ipv4(buf),
            6 => pp.decode_ipv6(buf),
            _ => {}
        }
        pp
    }

    fn decode_ipv4(&mut self, buf: &[u8]) {
        if buf.len() < IPV4_HEADER_LEN {
            return;
        }
        let ihl = usize::from(buf[0] & 0x0f) * 4;
        if ihl < IPV4_HEADER_LEN || buf.len() < ihl {
            return;
        }

        let src = Ipv4Addr::new(buf[12], buf[13], buf[14], buf[15]);
        let dst = Ipv4Addr::new(buf[16], buf[17], buf[18], buf[19]);
        self.ip_version = 4;
        self.src = SocketAddr::new(IpAddr::V4(src), 0);
        self.dst = SocketAddr::new(IpAddr::V4(dst), 0);
        self.decode_transport(IpProto::from(buf[9]), &buf[ihl..]);
    }

    fn decode_ipv6(&mut self, buf: &[u8]) {
        if buf.len() < IPV6_HEADER_LEN {
            return;
        }

        let mut src = [0u8; 16];
        let mut dst = [0u8; 16];
        src.copy_from_slice(&buf[8..24]);
        dst.copy_from_slice(&buf[24..40]);
        self.ip_version = 6;
        self.src = SocketAddr::new(IpAddr::V6(Ipv6Addr::from(src)), 0);
        self.dst = SocketAddr::new(IpAddr::V6(Ipv6Addr::from(dst)), 0);
        // Extension headers are not walked; anything behind one stays Other.
        self.decode_transport(IpProto::from(buf[6]), &buf[IPV6_HEADER_LEN..]);
    }

    fn decode_transport(&mut self, proto: IpProto, payload: &[u8]) {
        self.proto = proto;
        match proto {
            IpProto::Tcp | IpProto::Udp => {
                if payload.len() < 4 {
                    self.proto = IpProto::Unknown;
                    return;
                }
                self.src.set_port(u16::from_be_bytes([payload[0], payload[1]]));
                self.dst.set_port(u16::from_be_bytes([payload[2], payload[3]]));
            }
            IpProto::Tsmp => parse_tsmp_payload(self, payload),
            _ => {}
        }
    }
}
