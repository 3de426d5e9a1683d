//! Assembly with the OS primitives in userspace mode, which needs no
//! privileges.

use std::time::Duration;

use mirage_engine::{assemble, AssembleOptions, EngineSettings, NetMon, OsPrimitives, WatchdogConfig};
use mirage_tun::{DeviceKind, TunSpec};
use tokio_util::sync::CancellationToken;

fn options(port: u16) -> AssembleOptions {
    AssembleOptions {
        listen_port: port,
        watchdog: WatchdogConfig {
            interval: Duration::from_millis(50),
            max_stall: Duration::from_secs(2),
        },
    }
}

#[tokio::test]
async fn test_userspace_bundle() {
    let prims = OsPrimitives::new(1280);
    let bundle = assemble(
        &[TunSpec::Userspace],
        &prims,
        &NetMon::new(),
        &options(0),
        &CancellationToken::new(),
    )
    .await
    .unwrap();

    assert_eq!(bundle.iface, "userspace-networking");
    assert_eq!(bundle.device.kind(), DeviceKind::Userspace);
    assert!(bundle.router.is_some());
    assert!(bundle.dns.is_some());

    bundle.engine.reconfig(&EngineSettings::default()).await.unwrap();
    // Let the watchdog probe a few times
    tokio::time::sleep(Duration::from_millis(200)).await;
    bundle.engine.ping().await.unwrap();

    bundle.close().await.unwrap();
}

#[tokio::test]
async fn test_port_collision_fails_the_candidate() {
    let taken = std::net::UdpSocket::bind("0.0.0.0:0").unwrap();
    let port = taken.local_addr().unwrap().port();

    let err = assemble(
        &[TunSpec::Userspace],
        &OsPrimitives::new(1280),
        &NetMon::new(),
        &options(port),
        &CancellationToken::new(),
    )
    .await
    .unwrap_err();

    let failures = err.candidates();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].spec, TunSpec::Userspace);
    assert!(failures[0].error.to_string().contains(&port.to_string()));
}

#[tokio::test]
async fn test_tap_is_unsupported_then_falls_back() {
    let bundle = assemble(
        &TunSpec::parse_list("tap:tap0,userspace-networking").unwrap(),
        &OsPrimitives::new(1280),
        &NetMon::new(),
        &options(0),
        &CancellationToken::new(),
    )
    .await
    .unwrap();

    assert_eq!(bundle.spec, TunSpec::Userspace);
    bundle.close().await.unwrap();
}
