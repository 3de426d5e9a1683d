//! Liveness watchdog around a transport engine

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use mirage_packet::RejectedHeader;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::WatchdogSettings;
use crate::engine::{Engine, EngineSettings};
use crate::error::{Error, Result};

/// Probe timing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WatchdogConfig {
    pub interval: Duration,
    pub max_stall: Duration,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        WatchdogConfig::from(&WatchdogSettings::default())
    }
}

impl From<&WatchdogSettings> for WatchdogConfig {
    fn from(s: &WatchdogSettings) -> Self {
        Self {
            interval: s.interval(),
            max_stall: s.max_stall(),
        }
    }
}

/// Engine wrapper that probes the inner engine and resets it on stall
pub struct Watchdog {
    inner: Arc<dyn Engine>,
    config: WatchdogConfig,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
    stalls: Arc<AtomicU64>,
}

impl Watchdog {
    /// Wrap `inner` and start probing. The probe task stops on `close` or
    /// when `cancel` fires.
    pub fn spawn(
        inner: Arc<dyn Engine>,
        config: WatchdogConfig,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        let stalls = Arc::new(AtomicU64::new(0));
        let task = tokio::spawn(probe_loop(
            inner.clone(),
            config,
            cancel.clone(),
            stalls.clone(),
        ));

        Arc::new(Self {
            inner,
            config,
            cancel,
            task: Mutex::new(Some(task)),
            stalls,
        })
    }

    /// Number of stalls detected so far
    pub fn stalls(&self) -> u64 {
        self.stalls.load(Ordering::Relaxed)
    }
}

async fn probe_loop(
    engine: Arc<dyn Engine>,
    config: WatchdogConfig,
    cancel: CancellationToken,
    stalls: Arc<AtomicU64>,
) {
    let mut ticker = tokio::time::interval(config.interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick completes immediately
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let probe = tokio::select! {
            _ = cancel.cancelled() => break,
            r = tokio::time::timeout(config.max_stall, engine.ping()) => r,
        };

        let reason = match probe {
            Ok(Ok(())) => continue,
            Ok(Err(e)) => e.to_string(),
            Err(_) => format!("no response in {:?}", config.max_stall),
        };

        stalls.fetch_add(1, Ordering::Relaxed);
        log::warn!("Engine stalled ({}), resetting", reason);
        let reset = tokio::select! {
            _ = cancel.cancelled() => break,
            r = tokio::time::timeout(config.max_stall, engine.reset()) => r,
        };
        match reset {
            Ok(Ok(())) => {}
            Ok(Err(e)) => log::error!("Engine reset failed: {}", e),
            Err(_) => log::error!("Engine reset failed: no response in {:?}", config.max_stall),
        }
    }

    log::debug!("Watchdog stopped");
}

#[async_trait]
impl Engine for Watchdog {
    async fn reconfig(&self, settings: &EngineSettings) -> Result<()> {
        tokio::time::timeout(self.config.max_stall, self.inner.reconfig(settings))
            .await
            .map_err(|_| {
                Error::Timeout(format!("reconfig took longer than {:?}", self.config.max_stall))
            })?
    }

    async fn ping(&self) -> Result<()> {
        self.inner.ping().await
    }

    async fn reset(&self) -> Result<()> {
        self.inner.reset().await
    }

    async fn reject(&self, notice: &RejectedHeader) -> Result<()> {
        self.inner.reject(notice).await
    }

    async fn close(&self) -> Result<()> {
        self.cancel.cancel();
        let task = self.task.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(task) = task {
            let _ = task.await;
        }
        self.inner.close().await
    }
}
