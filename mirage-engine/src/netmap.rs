//! Network map snapshots

use ipnet::IpNet;
use mirage_tun::{is_default_route, DnsConfig};
use serde::{Deserialize, Serialize};

/// A peer as seen in the network map
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Peer {
    /// Stable node id
    pub id: String,
    /// Display name
    pub name: String,
    /// Address ranges the peer accepts traffic for
    #[serde(default)]
    pub allowed_ips: Vec<IpNet>,
}

impl Peer {
    /// Whether the peer advertises 0.0.0.0/0 or ::/0
    pub fn advertises_default_route(&self) -> bool {
        self.allowed_ips.iter().any(is_default_route)
    }
}

/// Snapshot of the node's view of the mesh
///
/// A new map replaces the previous one wholesale.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkMap {
    /// This node's own tunnel addresses
    #[serde(default)]
    pub addresses: Vec<IpNet>,
    #[serde(default)]
    pub peers: Vec<Peer>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dns: Option<DnsConfig>,
}

impl NetworkMap {
    pub fn peer(&self, id: &str) -> Option<&Peer> {
        self.peers.iter().find(|p| p.id == id)
    }
}
