//! Network change monitor handle
//!
//! The monitor fans out link-change events to the router and the transport
//! engine. Anything holding a clone can report a change.

use tokio::sync::broadcast;

/// A change in the host's network configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkChange {
    /// Interface that changed, if known
    pub iface: Option<String>,
}

/// Shared monitor handle
#[derive(Debug, Clone)]
pub struct NetMon {
    tx: broadcast::Sender<LinkChange>,
}

impl NetMon {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(16);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LinkChange> {
        self.tx.subscribe()
    }

    /// Report a change; returns how many listeners saw it
    pub fn notify(&self, change: LinkChange) -> usize {
        log::debug!("Link change: {:?}", change.iface);
        self.tx.send(change).unwrap_or(0)
    }
}

impl Default for NetMon {
    fn default() -> Self {
        Self::new()
    }
}
