//! Packet primitives for the mirage node agent
//!
//! This crate provides:
//! - IPv4/IPv6 header marshaling and a lightweight packet summary ([`Parsed`])
//! - TSMP, a small ICMP-like signaling protocol carried inside the tunnel on
//!   IP protocol 99 ("any private encryption scheme"). TSMP messages never hit
//!   the host network stack.
//!
//! # Example
//!
//! ```rust
//! use mirage_packet::{IpProto, Parsed, RejectReason, RejectedHeader};
//!
//! let notice = RejectedHeader {
//!     src: "100.64.0.1:41000".parse().unwrap(),
//!     dst: "100.64.0.2:22".parse().unwrap(),
//!     proto: IpProto::Tcp,
//!     reason: RejectReason::Acl,
//! };
//!
//! let bytes = notice.to_bytes().unwrap();
//! let parsed = Parsed::decode(&bytes);
//! assert_eq!(parsed.proto, IpProto::Tsmp);
//! assert_eq!(parsed.src.port(), 41000);
//! ```

mod error;
mod ip;
mod parsed;
mod tsmp;

pub use error::{Error, Result};
pub use ip::{IpProto, Ipv4Header, Ipv6Header, IPV4_HEADER_LEN, IPV6_HEADER_LEN};
pub use parsed::Parsed;
pub use tsmp::{RejectReason, RejectedHeader, TsmpType, TSMP_REJECT_PAYLOAD_LEN};

/// Largest packet the tunnel will build or accept
pub const MAX_PACKET_LEN: usize = 65535;
