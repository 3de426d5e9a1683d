//! Integration tests for TSMP rejection notices
//!
//! These tests build notices the way the transport engine does and decode
//! them the way the receiving peer does.

use std::net::{IpAddr, SocketAddr};

use mirage_packet::{
    IpProto, Parsed, RejectReason, RejectedHeader, IPV4_HEADER_LEN, IPV6_HEADER_LEN,
    TSMP_REJECT_PAYLOAD_LEN,
};

fn notice(src: &str, dst: &str, proto: IpProto, reason: RejectReason) -> RejectedHeader {
    RejectedHeader {
        src: src.parse().unwrap(),
        dst: dst.parse().unwrap(),
        proto,
        reason,
    }
}

#[test]
fn test_ipv4_notice_reverses_addresses_and_keeps_ports() {
    let h = notice(
        "100.64.0.1:41000",
        "100.64.0.2:443",
        IpProto::Tcp,
        RejectReason::Acl,
    );
    let bytes = h.to_bytes().unwrap();
    assert_eq!(bytes.len(), IPV4_HEADER_LEN + TSMP_REJECT_PAYLOAD_LEN);

    let pp = Parsed::decode(&bytes);
    assert_eq!(pp.ip_version, 4);
    assert_eq!(pp.proto, IpProto::Tsmp);

    // The rejecting node is the IP source
    assert_eq!(pp.src.ip(), h.dst.ip());
    assert_eq!(pp.dst.ip(), h.src.ip());

    // Ports come back from the payload in original flow order
    assert_eq!(pp.src.port(), 41000);
    assert_eq!(pp.dst.port(), 443);
}

#[test]
fn test_ipv6_notice_reverses_addresses_and_keeps_ports() {
    let h = notice(
        "[fd7a:115c:a1e0::1]:50000",
        "[fd7a:115c:a1e0::2]:8080",
        IpProto::Udp,
        RejectReason::ShieldsUp,
    );
    let bytes = h.to_bytes().unwrap();
    assert_eq!(bytes.len(), IPV6_HEADER_LEN + TSMP_REJECT_PAYLOAD_LEN);

    let pp = Parsed::decode(&bytes);
    assert_eq!(pp.ip_version, 6);
    assert_eq!(pp.proto, IpProto::Tsmp);
    assert_eq!(pp.src, SocketAddr::new(h.dst.ip(), 50000));
    assert_eq!(pp.dst, SocketAddr::new(h.src.ip(), 8080));

    let payload = &bytes[IPV6_HEADER_LEN..];
    assert_eq!(payload[1], 17);
    assert_eq!(payload[2], b'S');
}

#[test]
fn test_marshal_into_oversized_buffer_leaves_tail_untouched() {
    let h = notice(
        "10.1.1.1:1000",
        "10.1.1.2:2000",
        IpProto::Tcp,
        RejectReason::Acl,
    );
    let mut buf = vec![0xeeu8; 64];
    h.marshal(&mut buf).unwrap();

    assert!(buf[h.packet_len()..].iter().all(|&b| b == 0xee));
    let pp = Parsed::decode(&buf[..h.packet_len()]);
    assert_eq!(pp.src.ip(), "10.1.1.2".parse::<IpAddr>().unwrap());
}

#[test]
fn test_truncated_notice_leaves_ports_unset() {
    let h = notice(
        "100.64.0.1:41000",
        "100.64.0.2:443",
        IpProto::Tcp,
        RejectReason::Acl,
    );
    let bytes = h.to_bytes().unwrap();
    let truncated = &bytes[..bytes.len() - 1];

    let pp = Parsed::decode(truncated);
    assert_eq!(pp.proto, IpProto::Tsmp);
    assert_eq!(pp.src.port(), 0);
    assert_eq!(pp.dst.port(), 0);
}
