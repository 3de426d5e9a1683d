//! Mock primitives for testing
//!
//! [`MockPrimitives`] hands out devices, routers, DNS configurators and
//! engines that count every open and close, so tests can check that nothing
//! leaks. Failures and delays can be injected per candidate and stage.
//!
//! # Example
//!
//! ```ignore
//! use mirage_engine::mock::{MockPrimitives, Stage};
//!
//! let prims = MockPrimitives::new().fail("mirage0", Stage::Dns);
//! // ... assemble with "mirage0,userspace-networking" ...
//! assert_eq!(prims.counts().leaked(), 0);
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use mirage_packet::RejectedHeader;
use mirage_tun::{Device, DeviceKind, DnsConfig, DnsConfigurator, Router, RouterConfig, TunSpec};

use crate::engine::{Engine, EngineConfig, EngineSettings, Primitives};
use crate::error::{Error, Result};
use crate::netmon::NetMon;

/// Construction stage at which a failure or delay is injected
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Tun,
    Router,
    Dns,
    Engine,
}

/// Open/close counters shared by every mock resource
#[derive(Debug, Default)]
pub struct MockCounts {
    opened: AtomicUsize,
    closed: AtomicUsize,
}

impl MockCounts {
    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    pub fn closed(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }

    /// Resources opened but never closed
    pub fn leaked(&self) -> usize {
        self.opened().saturating_sub(self.closed())
    }

    fn open(&self) {
        self.opened.fetch_add(1, Ordering::SeqCst);
    }
}

/// Tracks a single resource's close so double closes count once
#[derive(Debug)]
struct Handle {
    counts: Option<Arc<MockCounts>>,
    closed: AtomicBool,
}

impl Handle {
    fn new(counts: Option<Arc<MockCounts>>) -> Self {
        if let Some(ref c) = counts {
            c.open();
        }
        Self {
            counts,
            closed: AtomicBool::new(false),
        }
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            if let Some(ref c) = self.counts {
                c.closed.fetch_add(1, Ordering::SeqCst);
            }
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// Device that records written packets
#[derive(Debug)]
pub struct MockDevice {
    name: String,
    kind: DeviceKind,
    written: Mutex<Vec<Vec<u8>>>,
    handle: Handle,
}

impl MockDevice {
    pub fn new(name: impl Into<String>, kind: DeviceKind) -> Self {
        Self::counted(name, kind, None)
    }

    fn counted(name: impl Into<String>, kind: DeviceKind, counts: Option<Arc<MockCounts>>) -> Self {
        Self {
            name: name.into(),
            kind,
            written: Mutex::new(Vec::new()),
            handle: Handle::new(counts),
        }
    }

    pub fn written(&self) -> Vec<Vec<u8>> {
        self.written
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn is_closed(&self) -> bool {
        self.handle.is_closed()
    }
}

impl Device for MockDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> DeviceKind {
        self.kind
    }

    fn mtu(&self) -> u16 {
        mirage_tun::DEFAULT_MTU
    }

    fn write(&self, packet: &[u8]) -> mirage_tun::Result<usize> {
        if self.handle.is_closed() {
            return Err(mirage_tun::Error::Closed(self.name.clone()));
        }
        self.written
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(packet.to_vec());
        Ok(packet.len())
    }

    fn close(&self) -> mirage_tun::Result<()> {
        self.handle.close();
        Ok(())
    }
}

/// Router that records the last configuration
#[derive(Debug)]
pub struct MockRouter {
    current: Mutex<Option<RouterConfig>>,
    handle: Handle,
}

impl MockRouter {
    pub fn current(&self) -> Option<RouterConfig> {
        self.current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl Router for MockRouter {
    fn up(&self) -> mirage_tun::Result<()> {
        Ok(())
    }

    fn set(&self, config: &RouterConfig) -> mirage_tun::Result<()> {
        *self.current.lock().unwrap_or_else(PoisonError::into_inner) = Some(config.clone());
        Ok(())
    }

    fn close(&self) -> mirage_tun::Result<()> {
        self.handle.close();
        Ok(())
    }
}

/// DNS configurator that records the last configuration
#[derive(Debug)]
pub struct MockDns {
    current: Mutex<Option<DnsConfig>>,
    handle: Handle,
}

impl DnsConfigurator for MockDns {
    fn set(&self, config: &DnsConfig) -> mirage_tun::Result<()> {
        *self.current.lock().unwrap_or_else(PoisonError::into_inner) = Some(config.clone());
        Ok(())
    }

    fn close(&self) -> mirage_tun::Result<()> {
        self.handle.close();
        Ok(())
    }
}

/// Engine with controllable health and latency
#[derive(Debug)]
pub struct MockEngine {
    healthy: AtomicBool,
    ping_delay: Mutex<Duration>,
    reconfig_delay: Mutex<Duration>,
    pings: AtomicU64,
    resets: AtomicU64,
    settings: Mutex<Vec<EngineSettings>>,
    rejected: Mutex<Vec<RejectedHeader>>,
    handle: Handle,
}

impl MockEngine {
    pub fn new() -> Self {
        Self::counted(None)
    }

    fn counted(counts: Option<Arc<MockCounts>>) -> Self {
        Self {
            healthy: AtomicBool::new(true),
            ping_delay: Mutex::new(Duration::ZERO),
            reconfig_delay: Mutex::new(Duration::ZERO),
            pings: AtomicU64::new(0),
            resets: AtomicU64::new(0),
            settings: Mutex::new(Vec::new()),
            rejected: Mutex::new(Vec::new()),
            handle: Handle::new(counts),
        }
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }

    pub fn set_ping_delay(&self, delay: Duration) {
        *self.ping_delay.lock().unwrap_or_else(PoisonError::into_inner) = delay;
    }

    pub fn set_reconfig_delay(&self, delay: Duration) {
        *self.reconfig_delay.lock().unwrap_or_else(PoisonError::into_inner) = delay;
    }

    pub fn pings(&self) -> u64 {
        self.pings.load(Ordering::SeqCst)
    }

    pub fn resets(&self) -> u64 {
        self.resets.load(Ordering::SeqCst)
    }

    /// Every settings value passed to `reconfig`, in order
    pub fn settings(&self) -> Vec<EngineSettings> {
        self.settings
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn rejected(&self) -> Vec<RejectedHeader> {
        self.rejected
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn is_closed(&self) -> bool {
        self.handle.is_closed()
    }
}

impl Default for MockEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Engine for MockEngine {
    async fn reconfig(&self, settings: &EngineSettings) -> Result<()> {
        let delay = *self.reconfig_delay.lock().unwrap_or_else(PoisonError::into_inner);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.settings
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(settings.clone());
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        let delay = *self.ping_delay.lock().unwrap_or_else(PoisonError::into_inner);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.pings.fetch_add(1, Ordering::SeqCst);
        if self.healthy.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(Error::Engine("not responding".into()))
        }
    }

    async fn reset(&self) -> Result<()> {
        self.resets.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn reject(&self, notice: &RejectedHeader) -> Result<()> {
        self.rejected
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(notice.clone());
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.handle.close();
        Ok(())
    }
}

/// Primitives whose every resource is counted
#[derive(Default)]
pub struct MockPrimitives {
    counts: Arc<MockCounts>,
    failures: HashMap<(String, Stage), String>,
    delays: HashMap<Stage, Duration>,
    routers: Mutex<Vec<Arc<MockRouter>>>,
    engines: Mutex<Vec<Arc<MockEngine>>>,
}

impl MockPrimitives {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `stage` fail for the candidate written as `spec`
    pub fn fail(self, spec: &str, stage: Stage) -> Self {
        self.fail_with(spec, stage, format!("{:?} failed", stage))
    }

    pub fn fail_with(mut self, spec: &str, stage: Stage, message: impl Into<String>) -> Self {
        self.failures
            .insert((spec.to_string(), stage), message.into());
        self
    }

    /// Delay every call at `stage`
    pub fn delay(mut self, stage: Stage, delay: Duration) -> Self {
        self.delays.insert(stage, delay);
        self
    }

    pub fn counts(&self) -> &MockCounts {
        &self.counts
    }

    /// Most recently opened engine
    pub fn last_engine(&self) -> Option<Arc<MockEngine>> {
        self.engines
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .last()
            .cloned()
    }

    /// Most recently opened router
    pub fn last_router(&self) -> Option<Arc<MockRouter>> {
        self.routers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .last()
            .cloned()
    }

    async fn enter(&self, key: &str, stage: Stage) -> Result<()> {
        if let Some(delay) = self.delays.get(&stage) {
            tokio::time::sleep(*delay).await;
        }
        match self.failures.get(&(key.to_string(), stage)) {
            Some(message) => Err(Error::Engine(message.clone())),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl Primitives for MockPrimitives {
    async fn open_tun(&self, spec: &TunSpec) -> Result<(Arc<dyn Device>, String)> {
        self.enter(&spec.to_string(), Stage::Tun).await?;

        let (name, kind) = match spec {
            TunSpec::Kernel(name) => (name.clone(), DeviceKind::Kernel),
            TunSpec::Userspace => (spec.to_string(), DeviceKind::Userspace),
            TunSpec::Tap { name, .. } => (name.clone(), DeviceKind::Tap),
        };
        let device = MockDevice::counted(name.clone(), kind, Some(self.counts.clone()));
        Ok((Arc::new(device), name))
    }

    async fn open_router(
        &self,
        device: Arc<dyn Device>,
        _monitor: &NetMon,
    ) -> Result<Arc<dyn Router>> {
        self.enter(&spec_key(device.as_ref()), Stage::Router).await?;

        let router = Arc::new(MockRouter {
            current: Mutex::new(None),
            handle: Handle::new(Some(self.counts.clone())),
        });
        self.routers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(router.clone());
        Ok(router)
    }

    async fn open_dns(&self, iface: &str) -> Result<Arc<dyn DnsConfigurator>> {
        self.enter(iface, Stage::Dns).await?;

        Ok(Arc::new(MockDns {
            current: Mutex::new(None),
            handle: Handle::new(Some(self.counts.clone())),
        }))
    }

    async fn open_engine(&self, config: EngineConfig) -> Result<Arc<dyn Engine>> {
        self.enter(&spec_key(config.device.as_ref()), Stage::Engine)
            .await?;

        let engine = Arc::new(MockEngine::counted(Some(self.counts.clone())));
        self.engines
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(engine.clone());
        Ok(engine)
    }
}

/// Failure key for a device: its name, or `tap:NAME` for TAP devices
fn spec_key(device: &dyn Device) -> String {
    match device.kind() {
        DeviceKind::Tap => format!("tap:{}", device.name()),
        _ => device.name().to_string(),
    }
}
