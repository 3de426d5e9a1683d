//! Tunnel device abstraction
//!
//! A [`Device`] is the packet endpoint the transport engine reads from and
//! writes to. Two backings are provided:
//!
//! - [`KernelTun`]: a thin wrapper around a `tun-rs` device
//! - [`UserspaceTun`]: an in-memory device used when no OS interface is wanted
//!
//! Both are safe to share across tasks behind an `Arc`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use crate::error::{Error, Result};

/// Packets a [`UserspaceTun`] holds before writes start failing
pub const OUTBOUND_QUEUE: usize = 256;

/// What backs a device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceKind {
    Kernel,
    Userspace,
    Tap,
}

/// A packet endpoint
pub trait Device: Send + Sync {
    /// Interface name
    fn name(&self) -> &str;

    fn kind(&self) -> DeviceKind;

    fn mtu(&self) -> u16;

    /// Write one packet
    fn write(&self, packet: &[u8]) -> Result<usize>;

    /// Release the device. Closing twice is a no-op.
    fn close(&self) -> Result<()>;
}

/// Kernel TUN device
pub struct KernelTun {
    name: String,
    mtu: u16,
    inner: Mutex<Option<tun_rs::SyncDevice>>,
}

impl KernelTun {
    /// Create a TUN interface named `name`
    ///
    /// Requires root or `CAP_NET_ADMIN`.
    pub fn create(name: &str, mtu: u16) -> Result<Self> {
        let device = tun_rs::DeviceBuilder::new()
            .name(name)
            .mtu(mtu)
            .build_sync()
            .map_err(|e| Error::DeviceCreation(format!("{}: {}", name, e)))?;

        let name = device
            .name()
            .map_err(|e| Error::DeviceCreation(e.to_string()))?;

        log::info!("Created TUN device: {} (MTU: {})", name, mtu);

        Ok(Self {
            name,
            mtu,
            inner: Mutex::new(Some(device)),
        })
    }
}

impl Device for KernelTun {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> DeviceKind {
        DeviceKind::Kernel
    }

    fn mtu(&self) -> u16 {
        self.mtu
    }

    fn write(&self, packet: &[u8]) -> Result<usize> {
        let guard = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        match guard.as_ref() {
            Some(device) => device.send(packet).map_err(Error::Io),
            None => Err(Error::Closed(self.name.clone())),
        }
    }

    fn close(&self) -> Result<()> {
        let mut guard = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        if guard.take().is_some() {
            log::info!("Closed TUN device: {}", self.name);
        }
        Ok(())
    }
}

impl std::fmt::Debug for KernelTun {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KernelTun")
            .field("name", &self.name)
            .field("mtu", &self.mtu)
            .finish()
    }
}

/// In-memory device for userspace networking
///
/// Written packets go to a bounded queue. A consumer takes the receiving end
/// with [`UserspaceTun::take_outbound`]; once the queue is full, writes fail
/// until it reads.
#[derive(Debug)]
pub struct UserspaceTun {
    name: String,
    mtu: u16,
    tx: mpsc::Sender<Vec<u8>>,
    rx: Mutex<Option<mpsc::Receiver<Vec<u8>>>>,
    closed: AtomicBool,
}

impl UserspaceTun {
    pub fn new(name: impl Into<String>, mtu: u16) -> Self {
        Self::with_capacity(name, mtu, OUTBOUND_QUEUE)
    }

    pub fn with_capacity(name: impl Into<String>, mtu: u16, capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        Self {
            name: name.into(),
            mtu,
            tx,
            rx: Mutex::new(Some(rx)),
            closed: AtomicBool::new(false),
        }
    }

    /// Receiving end of the outbound queue; only the first call gets it
    pub fn take_outbound(&self) -> Option<mpsc::Receiver<Vec<u8>>> {
        self.rx.lock().unwrap_or_else(PoisonError::into_inner).take()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl Device for UserspaceTun {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> DeviceKind {
        DeviceKind::Userspace
    }

    fn mtu(&self) -> u16 {
        self.mtu
    }

    fn write(&self, packet: &[u8]) -> Result<usize> {
        if self.is_closed() {
            return Err(Error::Closed(self.name.clone()));
        }
        if packet.len() > usize::from(self.mtu) {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("packet of {} bytes exceeds MTU {}", packet.len(), self.mtu),
            )));
        }
        match self.tx.try_send(packet.to_vec()) {
            Ok(()) => Ok(packet.len()),
            Err(TrySendError::Full(_)) => Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::WouldBlock,
                format!("{} outbound queue is full", self.name),
            ))),
            // The consumer went away; the packet goes nowhere
            Err(TrySendError::Closed(_)) => {
                log::trace!("{}: no reader, dropped {} bytes", self.name, packet.len());
                Ok(packet.len())
            }
        }
    }

    fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}
