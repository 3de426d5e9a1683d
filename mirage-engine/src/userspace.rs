//! Userspace transport engine and OS-backed primitives
//!
//! [`UserspaceEngine`] owns the UDP listen port, pushes routing and DNS
//! settings to the router and configurator it was built with, and answers
//! liveness probes. Packet encryption lives elsewhere; the engine only
//! filters the packets peers send to its port, delivers the accepted ones to
//! the device and emits TSMP rejection notices for the ones it refuses.

use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};

use async_trait::async_trait;
use mirage_packet::{IpProto, Parsed, RejectReason, RejectedHeader};
use mirage_tun::{
    Device, DeviceKind, DnsConfigurator, KernelTun, NoopDns, NoopRouter, ResolvConf, Router,
    TunSpec, UserspaceTun, USERSPACE_NETWORKING,
};
use tokio::net::UdpSocket;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;

use crate::engine::{Engine, EngineConfig, EngineSettings, Primitives};
use crate::error::{Error, Result};
use crate::netmon::NetMon;

const MAX_DATAGRAM: usize = 65535;

/// What to do with an inbound packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Accept,
    Drop,
    /// Dropped, and the initiator was sent a rejection notice
    Reject,
}

/// Engine running entirely in this process
pub struct UserspaceEngine {
    socket: Mutex<Option<Arc<UdpSocket>>>,
    local_addr: SocketAddr,
    device: Arc<dyn Device>,
    router: Option<Arc<dyn Router>>,
    dns: Option<Arc<dyn DnsConfigurator>>,
    settings: tokio::sync::Mutex<Option<EngineSettings>>,
    shields_up: AtomicBool,
    cancel: CancellationToken,
}

impl UserspaceEngine {
    /// Bind the listen port and start following link changes
    ///
    /// A port already in use is an error.
    pub async fn bind(config: EngineConfig) -> Result<Arc<Self>> {
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, config.listen_port))
            .await
            .map_err(|e| Error::Engine(format!("listen port {}: {}", config.listen_port, e)))?;
        let local_addr = socket.local_addr()?;
        log::info!(
            "Engine listening on {} (device {})",
            local_addr,
            config.device.name()
        );

        let socket = Arc::new(socket);
        let engine = Arc::new(Self {
            socket: Mutex::new(Some(socket.clone())),
            local_addr,
            device: config.device,
            router: config.router,
            dns: config.dns,
            settings: tokio::sync::Mutex::new(None),
            shields_up: AtomicBool::new(false),
            cancel: CancellationToken::new(),
        });

        tokio::spawn(follow_link_changes(
            Arc::downgrade(&engine),
            config.monitor,
            engine.cancel.clone(),
        ));
        tokio::spawn(receive_loop(
            Arc::downgrade(&engine),
            socket,
            engine.cancel.clone(),
        ));

        Ok(engine)
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    async fn apply(&self, settings: &EngineSettings) -> Result<()> {
        let router = self.router.clone();
        let dns = self.dns.clone();
        let settings_owned = settings.clone();

        tokio::task::spawn_blocking(move || -> Result<()> {
            if let Some(router) = router {
                router.set(&settings_owned.router)?;
            }
            if let Some(dns) = dns {
                dns.set(&settings_owned.dns)?;
            }
            Ok(())
        })
        .await
        .map_err(|e| Error::Engine(format!("reconfig task failed: {}", e)))??;

        self.shields_up.store(settings.shields_up, Ordering::SeqCst);
        Ok(())
    }

    /// Filter one packet arriving from a peer
    pub async fn filter_inbound(&self, packet: &[u8]) -> Verdict {
        if !self.shields_up.load(Ordering::SeqCst) {
            return Verdict::Accept;
        }

        let pp = Parsed::decode(packet);
        if !matches!(pp.proto, IpProto::Tcp | IpProto::Udp) {
            return Verdict::Drop;
        }

        let notice = RejectedHeader {
            src: pp.src,
            dst: pp.dst,
            proto: pp.proto,
            reason: RejectReason::ShieldsUp,
        };
        match self.reject(&notice).await {
            Ok(()) => Verdict::Reject,
            Err(e) => {
                log::debug!("Failed to send rejection to {}: {}", pp.src, e);
                Verdict::Drop
            }
        }
    }
}

async fn receive_loop(
    engine: Weak<UserspaceEngine>,
    socket: Arc<UdpSocket>,
    cancel: CancellationToken,
) {
    let mut buf = vec![0u8; MAX_DATAGRAM];
    loop {
        let received = tokio::select! {
            _ = cancel.cancelled() => break,
            r = socket.recv_from(&mut buf) => r,
        };
        let (len, from) = match received {
            Ok(r) => r,
            Err(e) => {
                log::debug!("Receive error: {}", e);
                continue;
            }
        };
        let Some(engine) = engine.upgrade() else {
            break;
        };

        let packet = &buf[..len];
        if engine.filter_inbound(packet).await == Verdict::Accept {
            if let Err(e) = engine.device.write(packet) {
                log::debug!("Dropped {} bytes from {}: {}", len, from, e);
            }
        }
    }
}

async fn follow_link_changes(
    engine: Weak<UserspaceEngine>,
    monitor: NetMon,
    cancel: CancellationToken,
) {
    let mut rx = monitor.subscribe();
    loop {
        let change = tokio::select! {
            _ = cancel.cancelled() => break,
            r = rx.recv() => r,
        };
        match change {
            Ok(change) => {
                let Some(engine) = engine.upgrade() else {
                    break;
                };
                log::info!("Link change on {:?}, re-applying settings", change.iface);
                if let Err(e) = engine.reset().await {
                    log::warn!("Failed to re-apply settings: {}", e);
                }
            }
            Err(RecvError::Lagged(n)) => log::debug!("Missed {} link changes", n),
            Err(RecvError::Closed) => break,
        }
    }
}

#[async_trait]
impl Engine for UserspaceEngine {
    async fn reconfig(&self, settings: &EngineSettings) -> Result<()> {
        if self.is_closed() {
            return Err(Error::Engine("engine is closed".into()));
        }
        let mut current = self.settings.lock().await;
        self.apply(settings).await?;
        *current = Some(settings.clone());
        log::debug!(
            "Engine reconfigured: {} routes, shields {}",
            settings.router.routes.len(),
            if settings.shields_up { "up" } else { "down" }
        );
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        let socket = self
            .socket
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        match socket {
            Some(socket) => {
                socket.local_addr()?;
                Ok(())
            }
            None => Err(Error::Engine("engine is closed".into())),
        }
    }

    async fn reset(&self) -> Result<()> {
        let current = self.settings.lock().await;
        if let Some(ref settings) = *current {
            self.apply(settings).await?;
        }
        Ok(())
    }

    async fn reject(&self, notice: &RejectedHeader) -> Result<()> {
        let packet = notice.to_bytes()?;
        self.device.write(&packet)?;
        log::debug!(
            "Rejected {} flow {} -> {} ({})",
            notice.proto,
            notice.src,
            notice.dst,
            notice.reason
        );
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.cancel.cancel();
        self.socket
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        log::info!("Engine on {} closed", self.local_addr);
        Ok(())
    }
}

/// Primitives backed by the operating system
#[derive(Debug, Clone)]
pub struct OsPrimitives {
    mtu: u16,
    netns: Option<String>,
    resolv_conf: PathBuf,
}

impl OsPrimitives {
    pub fn new(mtu: u16) -> Self {
        Self {
            mtu,
            netns: None,
            resolv_conf: PathBuf::from(mirage_tun::dns::RESOLV_CONF),
        }
    }

    /// Configure routes inside the named network namespace
    pub fn with_netns(mut self, netns: Option<String>) -> Self {
        self.netns = netns;
        self
    }

    pub fn with_resolv_conf(mut self, path: impl Into<PathBuf>) -> Self {
        self.resolv_conf = path.into();
        self
    }

    #[cfg(target_os = "linux")]
    fn os_router(&self, iface: &str) -> Result<Arc<dyn Router>> {
        use mirage_tun::linux::{LinuxNetns, OsRouter};
        use mirage_tun::NetnsRouter;

        let router: Arc<dyn Router> = match self.netns {
            Some(ref ns) => Arc::new(NetnsRouter::new(
                OsRouter::new(iface),
                LinuxNetns::new()?,
                ns.clone(),
            )),
            None => Arc::new(OsRouter::new(iface)),
        };
        if let Err(e) = router.up() {
            let _ = router.close();
            return Err(e.into());
        }
        Ok(router)
    }

    #[cfg(not(target_os = "linux"))]
    fn os_router(&self, iface: &str) -> Result<Arc<dyn Router>> {
        Err(Error::Unsupported(format!("OS router for {}", iface)))
    }
}

#[async_trait]
impl Primitives for OsPrimitives {
    async fn open_tun(&self, spec: &TunSpec) -> Result<(Arc<dyn Device>, String)> {
        match spec {
            TunSpec::Kernel(name) => {
                let name = name.clone();
                let mtu = self.mtu;
                let device = tokio::task::spawn_blocking(move || KernelTun::create(&name, mtu))
                    .await
                    .map_err(|e| Error::Engine(format!("device task failed: {}", e)))??;
                let iface = device.name().to_string();
                Ok((Arc::new(device), iface))
            }
            TunSpec::Userspace => Ok((
                Arc::new(UserspaceTun::new(USERSPACE_NETWORKING, self.mtu)),
                USERSPACE_NETWORKING.to_string(),
            )),
            TunSpec::Tap { .. } => Err(Error::Unsupported("TAP devices".into())),
        }
    }

    async fn open_router(
        &self,
        device: Arc<dyn Device>,
        _monitor: &NetMon,
    ) -> Result<Arc<dyn Router>> {
        match device.kind() {
            DeviceKind::Userspace => Ok(Arc::new(NoopRouter::new())),
            _ => {
                let this = self.clone();
                let iface = device.name().to_string();
                tokio::task::spawn_blocking(move || this.os_router(&iface))
                    .await
                    .map_err(|e| Error::Engine(format!("router task failed: {}", e)))?
            }
        }
    }

    async fn open_dns(&self, iface: &str) -> Result<Arc<dyn DnsConfigurator>> {
        if iface == USERSPACE_NETWORKING {
            return Ok(Arc::new(NoopDns::new()));
        }
        Ok(Arc::new(ResolvConf::with_path(iface, &self.resolv_conf)))
    }

    async fn open_engine(&self, config: EngineConfig) -> Result<Arc<dyn Engine>> {
        let engine: Arc<dyn Engine> = UserspaceEngine::bind(config).await?;
        Ok(engine)
    }
}
