//! OS networking primitives for the mirage node agent
//!
//! This crate provides the pieces an engine is assembled from:
//!
//! - **Tunnel specs**: parse the ordered candidate list (`mirage0,userspace-networking`)
//! - **Devices**: kernel TUN via `tun-rs`, or an in-memory userspace device
//! - **Routers**: the [`Router`] capability, an `ip`-command implementation and
//!   the [`NetnsRouter`] namespace-switching decorator
//! - **DNS**: the [`DnsConfigurator`] capability and a `resolv.conf` manager
//!
//! # Platform Requirements
//!
//! Kernel devices and the OS router need root or `CAP_NET_ADMIN` and the TUN
//! module (`modprobe tun`). Userspace mode needs neither.
//!
//! # Example
//!
//! ```
//! use mirage_tun::TunSpec;
//!
//! let specs = TunSpec::parse_list("mirage0,userspace-networking").unwrap();
//! assert_eq!(specs.len(), 2);
//! assert!(specs[1].is_userspace());
//! ```

pub mod device;
pub mod dns;
pub mod error;
pub mod router;
pub mod spec;

#[cfg(target_os = "linux")]
pub mod linux;

pub use device::{Device, DeviceKind, KernelTun, UserspaceTun, OUTBOUND_QUEUE};
pub use dns::{DnsConfig, DnsConfigurator, NoopDns, ResolvConf};
pub use error::{Error, Result};
pub use router::{
    is_default_route, NamespaceSwitch, NetnsRouter, NoopRouter, Router, RouterConfig,
};
pub use spec::{TunSpec, USERSPACE_NETWORKING};

/// Default MTU for tunnel devices
pub const DEFAULT_MTU: u16 = 1280;
