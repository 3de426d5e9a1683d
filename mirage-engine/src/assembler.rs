//! Engine assembly with ordered fallback
//!
//! Candidates are tried in order. For each one the device, router, DNS
//! configurator and engine are opened in turn; a failure at any step releases
//! what that candidate had acquired and moves on to the next. The first
//! candidate that assembles wins.

use std::future::Future;
use std::sync::Arc;

use mirage_tun::{Device, DnsConfigurator, Router, TunSpec};
use tokio_util::sync::CancellationToken;

use crate::engine::{Engine, EngineBundle, EngineConfig, Primitives};
use crate::error::{CandidateError, Error, Result};
use crate::netmon::NetMon;
use crate::watchdog::{Watchdog, WatchdogConfig};

/// Settings shared by every candidate
#[derive(Debug, Clone, Copy)]
pub struct AssembleOptions {
    pub listen_port: u16,
    pub watchdog: WatchdogConfig,
}

/// Build one engine bundle from the first candidate that works.
///
/// Fails with [`Error::Assembly`] holding one entry per candidate, in order,
/// or with [`Error::Cancelled`] if `cancel` fires first.
pub async fn assemble(
    specs: &[TunSpec],
    primitives: &dyn Primitives,
    monitor: &NetMon,
    options: &AssembleOptions,
    cancel: &CancellationToken,
) -> Result<EngineBundle> {
    if specs.is_empty() {
        return Err(Error::Config("no tunnel specified".into()));
    }

    let mut failures = Vec::with_capacity(specs.len());

    for spec in specs {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        log::info!("Trying tunnel {}", spec);
        match try_candidate(spec, primitives, monitor, options, cancel).await {
            Ok(bundle) => {
                log::info!("Engine assembled on {} ({})", bundle.iface, spec);
                return Ok(bundle);
            }
            Err(Error::Cancelled) => {
                log::info!("Assembly of {} cancelled", spec);
                return Err(Error::Cancelled);
            }
            Err(error) => {
                log::warn!("Tunnel {} failed: {}", spec, error);
                failures.push(CandidateError {
                    spec: spec.clone(),
                    error,
                });
            }
        }
    }

    Err(Error::Assembly(failures))
}

/// Resources acquired so far for one candidate
#[derive(Default)]
struct Acquired {
    device: Option<Arc<dyn Device>>,
    router: Option<Arc<dyn Router>>,
    dns: Option<Arc<dyn DnsConfigurator>>,
    engine: Option<Arc<dyn Engine>>,
}

impl Acquired {
    /// Close everything, newest first
    async fn release(self) {
        if let Some(engine) = self.engine {
            if let Err(e) = engine.close().await {
                log::warn!("Failed to close engine: {}", e);
            }
        }
        if let Some(dns) = self.dns {
            if let Err(e) = dns.close() {
                log::warn!("Failed to close DNS configurator: {}", e);
            }
        }
        if let Some(router) = self.router {
            if let Err(e) = router.close() {
                log::warn!("Failed to close router: {}", e);
            }
        }
        if let Some(device) = self.device {
            if let Err(e) = device.close() {
                log::warn!("Failed to close device {}: {}", device.name(), e);
            }
        }
    }
}

/// Run one construction step unless cancellation wins the race
async fn step<T>(cancel: &CancellationToken, fut: impl Future<Output = Result<T>>) -> Result<T> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(Error::Cancelled),
        r = fut => r,
    }
}

async fn try_candidate(
    spec: &TunSpec,
    primitives: &dyn Primitives,
    monitor: &NetMon,
    options: &AssembleOptions,
    cancel: &CancellationToken,
) -> Result<EngineBundle> {
    let mut acquired = Acquired::default();
    match build(spec, primitives, monitor, options, cancel, &mut acquired).await {
        Ok(bundle) => Ok(bundle),
        Err(e) => {
            acquired.release().await;
            Err(e)
        }
    }
}

async fn build(
    spec: &TunSpec,
    primitives: &dyn Primitives,
    monitor: &NetMon,
    options: &AssembleOptions,
    cancel: &CancellationToken,
    acquired: &mut Acquired,
) -> Result<EngineBundle> {
    let (device, iface) = step(cancel, primitives.open_tun(spec)).await?;
    acquired.device = Some(device.clone());

    if spec.is_tap() {
        let engine = step(
            cancel,
            primitives.open_engine(EngineConfig {
                listen_port: options.listen_port,
                device: device.clone(),
                router: None,
                dns: None,
                monitor: monitor.clone(),
            }),
        )
        .await?;
        acquired.engine = Some(engine.clone());
        return finish(spec, iface, acquired, cancel);
    }

    let router = step(cancel, primitives.open_router(device.clone(), monitor)).await?;
    acquired.router = Some(router.clone());

    let dns = step(cancel, primitives.open_dns(&iface)).await?;
    acquired.dns = Some(dns.clone());

    let engine = step(
        cancel,
        primitives.open_engine(EngineConfig {
            listen_port: options.listen_port,
            device,
            router: Some(router),
            dns: Some(dns),
            monitor: monitor.clone(),
        }),
    )
    .await?;

    let engine: Arc<dyn Engine> = Watchdog::spawn(engine, options.watchdog, cancel.child_token());
    acquired.engine = Some(engine);

    finish(spec, iface, acquired, cancel)
}

/// Hand the acquired resources over as a bundle
fn finish(
    spec: &TunSpec,
    iface: String,
    acquired: &mut Acquired,
    cancel: &CancellationToken,
) -> Result<EngineBundle> {
    if cancel.is_cancelled() {
        return Err(Error::Cancelled);
    }

    let taken = std::mem::take(acquired);
    match (taken.device, taken.engine) {
        (Some(device), Some(engine)) => Ok(EngineBundle {
            spec: spec.clone(),
            iface,
            device,
            router: taken.router,
            dns: taken.dns,
            engine,
        }),
        (device, engine) => {
            // Put back whatever was there so the caller releases it
            acquired.device = device;
            acquired.engine = engine;
            acquired.router = taken.router;
            acquired.dns = taken.dns;
            Err(Error::InvalidState("incomplete engine bundle".into()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockPrimitives, Stage};
    use std::time::Duration;

    fn options() -> AssembleOptions {
        AssembleOptions {
            listen_port: 0,
            watchdog: WatchdogConfig {
                interval: Duration::from_secs(60),
                max_stall: Duration::from_secs(5),
            },
        }
    }

    fn specs(s: &str) -> Vec<TunSpec> {
        TunSpec::parse_list(s).unwrap()
    }

    #[tokio::test]
    async fn test_first_candidate_wins() {
        let prims = MockPrimitives::new();
        let bundle = assemble(
            &specs("mirage0,userspace-networking"),
            &prims,
            &NetMon::new(),
            &options(),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        assert_eq!(bundle.iface, "mirage0");
        assert!(bundle.router.is_some());
        assert!(bundle.dns.is_some());
        // device, router, dns, engine
        assert_eq!(prims.counts().opened(), 4);

        bundle.close().await.unwrap();
        assert_eq!(prims.counts().leaked(), 0);
    }

    #[tokio::test]
    async fn test_failure_at_each_stage_releases_everything() {
        for stage in [Stage::Tun, Stage::Router, Stage::Dns, Stage::Engine] {
            let prims = MockPrimitives::new().fail("mirage0", stage);
            let bundle = assemble(
                &specs("mirage0,userspace-networking"),
                &prims,
                &NetMon::new(),
                &options(),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

            assert_eq!(bundle.spec, TunSpec::Userspace, "stage {:?}", stage);
            // Only the winning candidate's four resources remain open
            assert_eq!(prims.counts().leaked(), 4, "stage {:?}", stage);
            bundle.close().await.unwrap();
            assert_eq!(prims.counts().leaked(), 0, "stage {:?}", stage);
        }
    }

    #[tokio::test]
    async fn test_tap_bundle_has_no_router_or_dns() {
        let prims = MockPrimitives::new();
        let bundle = assemble(
            &specs("tap:tap0:br0"),
            &prims,
            &NetMon::new(),
            &options(),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        assert!(bundle.router.is_none());
        assert!(bundle.dns.is_none());
        assert_eq!(prims.counts().opened(), 2);
        bundle.close().await.unwrap();
        assert_eq!(prims.counts().leaked(), 0);
    }

    #[tokio::test]
    async fn test_tap_engine_failure_closes_device() {
        let prims = MockPrimitives::new().fail("tap:tap0", Stage::Engine);
        let err = assemble(
            &specs("tap:tap0"),
            &prims,
            &NetMon::new(),
            &options(),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();

        assert_eq!(err.candidates().len(), 1);
        assert_eq!(prims.counts().opened(), 1);
        assert_eq!(prims.counts().leaked(), 0);
    }

    #[tokio::test]
    async fn test_all_fail_in_order() {
        let prims = MockPrimitives::new()
            .fail_with("a0", Stage::Tun, "no such device")
            .fail_with("b0", Stage::Engine, "address in use")
            .fail_with("userspace-networking", Stage::Dns, "dns down");

        let err = assemble(
            &specs("a0,b0,userspace-networking"),
            &prims,
            &NetMon::new(),
            &options(),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();

        let spec_names: Vec<String> = err.candidates().iter().map(|c| c.spec.to_string()).collect();
        assert_eq!(spec_names, vec!["a0", "b0", "userspace-networking"]);
        assert!(err.candidates()[1].error.to_string().contains("address in use"));
        assert_eq!(prims.counts().leaked(), 0);
    }

    #[tokio::test]
    async fn test_cancel_mid_candidate() {
        let prims = MockPrimitives::new().delay(Stage::Dns, Duration::from_secs(30));
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let started = std::time::Instant::now();
        let err = assemble(
            &specs("mirage0,userspace-networking"),
            &prims,
            &NetMon::new(),
            &options(),
            &cancel,
        )
        .await
        .unwrap_err();

        assert!(err.is_cancelled());
        assert!(started.elapsed() < Duration::from_secs(5));
        // device and router were open when cancellation hit
        assert_eq!(prims.counts().opened(), 2);
        assert_eq!(prims.counts().leaked(), 0);
    }

    #[tokio::test]
    async fn test_empty_spec_list() {
        let prims = MockPrimitives::new();
        let err = assemble(&[], &prims, &NetMon::new(), &options(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.is_config_error());
    }
}
