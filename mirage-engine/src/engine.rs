//! Transport engine contract and the assembled engine bundle
//!
//! An engine is built from four OS primitives: a tunnel device, a router, a
//! DNS configurator and the transport itself. [`Primitives`] is the seam
//! through which the assembler obtains them, so platforms (and tests) can
//! supply their own.

use std::sync::Arc;

use async_trait::async_trait;
use mirage_packet::RejectedHeader;
use mirage_tun::{Device, DnsConfig, DnsConfigurator, Router, RouterConfig, TunSpec};

use crate::error::{Error, Result};
use crate::netmon::NetMon;

/// Settings pushed into a running engine
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EngineSettings {
    pub router: RouterConfig,
    pub dns: DnsConfig,
    /// Reject all inbound flows
    pub shields_up: bool,
}

/// Running transport engine
#[async_trait]
pub trait Engine: Send + Sync {
    /// Apply new routing, DNS and filter settings
    async fn reconfig(&self, settings: &EngineSettings) -> Result<()>;

    /// Liveness probe
    async fn ping(&self) -> Result<()>;

    /// Recover from a stall by re-applying the last settings
    async fn reset(&self) -> Result<()>;

    /// Tell the initiator of a flow that it was refused
    async fn reject(&self, _notice: &RejectedHeader) -> Result<()> {
        Err(Error::Unsupported("engine cannot send rejection notices".into()))
    }

    /// Stop the engine. Does not close the device, router or DNS configurator.
    async fn close(&self) -> Result<()>;
}

/// Inputs to [`Primitives::open_engine`]
#[derive(Clone)]
pub struct EngineConfig {
    pub listen_port: u16,
    pub device: Arc<dyn Device>,
    /// `None` for TAP candidates
    pub router: Option<Arc<dyn Router>>,
    /// `None` for TAP candidates
    pub dns: Option<Arc<dyn DnsConfigurator>>,
    pub monitor: NetMon,
}

/// Constructors for the engine's building blocks
///
/// Each future must be safe to drop before completion: a resource is only
/// acquired once the future returns it.
#[async_trait]
pub trait Primitives: Send + Sync {
    /// Open the tunnel device; returns it with its resolved interface name
    async fn open_tun(&self, spec: &TunSpec) -> Result<(Arc<dyn Device>, String)>;

    async fn open_router(&self, device: Arc<dyn Device>, monitor: &NetMon)
        -> Result<Arc<dyn Router>>;

    async fn open_dns(&self, iface: &str) -> Result<Arc<dyn DnsConfigurator>>;

    async fn open_engine(&self, config: EngineConfig) -> Result<Arc<dyn Engine>>;
}

/// A fully wired engine
///
/// TAP bundles carry neither router nor DNS, and their engine is not wrapped
/// in a watchdog.
pub struct EngineBundle {
    pub spec: TunSpec,
    pub iface: String,
    pub device: Arc<dyn Device>,
    pub router: Option<Arc<dyn Router>>,
    pub dns: Option<Arc<dyn DnsConfigurator>>,
    pub engine: Arc<dyn Engine>,
}

impl EngineBundle {
    /// Release every component, engine first
    pub async fn close(self) -> Result<()> {
        log::info!("Closing engine on {}", self.iface);

        let mut first_err = None;
        if let Err(e) = self.engine.close().await {
            log::warn!("Failed to close engine: {}", e);
            first_err.get_or_insert(e);
        }
        if let Some(dns) = self.dns {
            if let Err(e) = dns.close() {
                log::warn!("Failed to close DNS configurator: {}", e);
                first_err.get_or_insert(e.into());
            }
        }
        if let Some(router) = self.router {
            if let Err(e) = router.close() {
                log::warn!("Failed to close router: {}", e);
                first_err.get_or_insert(e.into());
            }
        }
        if let Err(e) = self.device.close() {
            log::warn!("Failed to close device {}: {}", self.iface, e);
            first_err.get_or_insert(e.into());
        }

        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl std::fmt::Debug for EngineBundle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineBundle")
            .field("spec", &self.spec)
            .field("iface", &self.iface)
            .field("router", &self.router.is_some())
            .field("dns", &self.dns.is_some())
            .finish()
    }
}
