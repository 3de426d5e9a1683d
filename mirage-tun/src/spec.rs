//! Tunnel candidate specifications
//!
//! The agent is given an ordered, comma-separated list of tunnel backings to
//! try, for example:
//!
//! ```text
//! mirage0,userspace-networking
//! tap:mirage-tap:br0
//! ```

use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};

/// Name that selects the in-process userspace network stack
pub const USERSPACE_NETWORKING: &str = "userspace-networking";

const TAP_PREFIX: &str = "tap:";

/// One candidate tunnel backing
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TunSpec {
    /// Kernel TUN device with the given interface name
    Kernel(String),
    /// No OS device; packets stay inside the process
    Userspace,
    /// Layer-2 TAP device, optionally attached to a bridge
    Tap { name: String, bridge: Option<String> },
}

impl TunSpec {
    /// Parse a comma-separated candidate list, preserving order
    pub fn parse_list(s: &str) -> Result<Vec<TunSpec>> {
        let specs = s
            .split(',')
            .map(str::trim)
            .filter(|part| !part.is_empty())
            .map(TunSpec::from_str)
            .collect::<Result<Vec<_>>>()?;

        if specs.is_empty() {
            return Err(Error::InvalidSpec("no tunnel specified".into()));
        }
        Ok(specs)
    }

    pub fn is_tap(&self) -> bool {
        matches!(self, TunSpec::Tap { .. })
    }

    pub fn is_userspace(&self) -> bool {
        matches!(self, TunSpec::Userspace)
    }
}

impl FromStr for TunSpec {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if s.is_empty() {
            return Err(Error::InvalidSpec("empty tunnel name".into()));
        }
        if s == USERSPACE_NETWORKING {
            return Ok(TunSpec::Userspace);
        }

        if let Some(rest) = s.strip_prefix(TAP_PREFIX) {
            let mut parts = rest.splitn(2, ':');
            let name = parts.next().unwrap_or_default();
            if name.is_empty() {
                return Err(Error::InvalidSpec(format!("missing TAP name in {:?}", s)));
            }
            let bridge = parts
                .next()
                .filter(|b| !b.is_empty())
                .map(str::to_string);
            return Ok(TunSpec::Tap {
                name: name.to_string(),
                bridge,
            });
        }

        if s.len() >= libc::IFNAMSIZ {
            return Err(Error::InvalidSpec(format!(
                "interface name {:?} longer than {} bytes",
                s,
                libc::IFNAMSIZ - 1
            )));
        }
        Ok(TunSpec::Kernel(s.to_string()))
    }
}

impl fmt::Display for TunSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TunSpec::Kernel(name) => write!(f, "{}", name),
            TunSpec::Userspace => write!(f, "{}", USERSPACE_NETWORKING),
            TunSpec::Tap { name, bridge: None } => write!(f, "{}{}", TAP_PREFIX, name),
            TunSpec::Tap {
                name,
                bridge: Some(bridge),
            } => write!(f, "{}{}:{}", TAP_PREFIX, name, bridge),
        }
    }
}
