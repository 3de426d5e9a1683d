//! Router capability and the namespace-switching decorator
//!
//! A router owns the addresses and routes installed on the tunnel interface.
//! Callers hand it a complete [`RouterConfig`]; implementations work out the
//! difference from what is currently applied.

use std::collections::BTreeSet;
use std::sync::Mutex;

use ipnet::IpNet;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Desired interface addressing and routing
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouterConfig {
    /// Addresses assigned to the interface
    pub local_addrs: Vec<IpNet>,
    /// Destinations routed through the interface
    pub routes: Vec<IpNet>,
}

impl RouterConfig {
    pub fn is_empty(&self) -> bool {
        self.local_addrs.is_empty() && self.routes.is_empty()
    }

    /// Whether any route is a default route
    pub fn has_default_route(&self) -> bool {
        self.routes.iter().any(is_default_route)
    }

    pub(crate) fn addr_set(&self) -> BTreeSet<IpNet> {
        self.local_addrs.iter().copied().collect()
    }

    pub(crate) fn route_set(&self) -> BTreeSet<IpNet> {
        self.routes.iter().copied().collect()
    }
}

/// `0.0.0.0/0` or `::/0`
pub fn is_default_route(net: &IpNet) -> bool {
    net.prefix_len() == 0 && net.addr().is_unspecified()
}

/// Router capability: `up`, `set`, `close`
pub trait Router: Send + Sync {
    /// Bring the interface up
    fn up(&self) -> Result<()>;

    /// Replace the applied configuration with `config`
    fn set(&self, config: &RouterConfig) -> Result<()>;

    /// Remove everything this router installed
    fn close(&self) -> Result<()>;
}

impl<R: Router + ?Sized> Router for Box<R> {
    fn up(&self) -> Result<()> {
        (**self).up()
    }

    fn set(&self, config: &RouterConfig) -> Result<()> {
        (**self).set(config)
    }

    fn close(&self) -> Result<()> {
        (**self).close()
    }
}

/// Router that records its configuration without touching the OS
#[derive(Debug, Default)]
pub struct NoopRouter {
    current: Mutex<Option<RouterConfig>>,
}

impl NoopRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Last configuration passed to `set`
    pub fn current(&self) -> Option<RouterConfig> {
        self.current
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }
}

impl Router for NoopRouter {
    fn up(&self) -> Result<()> {
        Ok(())
    }

    fn set(&self, config: &RouterConfig) -> Result<()> {
        *self
            .current
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = Some(config.clone());
        Ok(())
    }

    fn close(&self) -> Result<()> {
        self.current
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take();
        Ok(())
    }
}

/// Moves the calling thread into a network namespace and back
pub trait NamespaceSwitch: Send + Sync {
    /// Enter the namespace named `ns`
    fn enter(&self, ns: &str) -> Result<()>;

    /// Return to the namespace the process started in
    fn restore(&self) -> Result<()>;
}

/// Router decorator that runs every call inside a network namespace
///
/// The original namespace is restored after every call, whether the inner
/// router succeeded or not.
pub struct NetnsRouter<R, S> {
    inner: R,
    switch: S,
    netns: String,
    // setns(2) changes the calling thread; concurrent calls must not interleave.
    lock: Mutex<()>,
}

impl<R: Router, S: NamespaceSwitch> NetnsRouter<R, S> {
    pub fn new(inner: R, switch: S, netns: impl Into<String>) -> Self {
        Self {
            inner,
            switch,
            netns: netns.into(),
            lock: Mutex::new(()),
        }
    }

    fn within<T>(&self, op: impl FnOnce(&R) -> Result<T>) -> Result<T> {
        let _guard = self
            .lock
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);

        self.switch.enter(&self.netns)?;
        let result = op(&self.inner);
        let restored = self.switch.restore();

        match (result, restored) {
            (Ok(value), Ok(())) => Ok(value),
            (Err(e), Ok(())) => Err(e),
            (Ok(_), Err(e)) => Err(e),
            (Err(e), Err(restore_err)) => {
                log::error!(
                    "Failed to restore namespace after error in {}: {}",
                    self.netns,
                    restore_err
                );
                Err(e)
            }
        }
    }
}

impl<R: Router, S: NamespaceSwitch> Router for NetnsRouter<R, S> {
    fn up(&self) -> Result<()> {
        self.within(|r| r.up())
    }

    fn set(&self, config: &RouterConfig) -> Result<()> {
        self.within(|r| r.set(config))
    }

    fn close(&self) -> Result<()> {
        self.within(|r| r.close())
    }
}
