//! The single authoritative backend
//!
//! The backend owns preferences, connection state, the last network map and
//! the engine bundle. Every mutation happens under one lock and publishes
//! exactly one [`Notify`] before the lock is released, so every session sees
//! fully applied changes in the same order.
//!
//! Engine reconfiguration runs after the lock is dropped. Each change carries
//! a generation number and stale generations are skipped, so a slow
//! reconfigure never applies older settings over newer ones.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use ipnet::IpNet;
use mirage_tun::{DnsConfig, RouterConfig};

use crate::bus::{NotifyBus, SessionId};
use crate::engine::{Engine, EngineBundle, EngineSettings};
use crate::error::Result;
use crate::event::{Notify, State};
use crate::exitnode::{self, ExitNodeStatus};
use crate::netmap::NetworkMap;
use crate::prefs::{Prefs, PrefsEdit};
use crate::store::{self, StateStore, LOGIN_KEY, PREFS_KEY};

/// Coordination server the node logs in to
#[async_trait]
pub trait ControlPlane: Send + Sync {
    /// Begin an interactive login; returns the URL the user must visit
    async fn start_login(&self, prefs: &Prefs) -> Result<String>;

    async fn logout(&self, prefs: &Prefs) -> Result<()>;
}

/// Control plane used when no coordination server is wired in
///
/// Login URLs point at the configured control URL; completing the login is
/// up to whoever calls [`Backend::finish_login`].
#[derive(Debug, Default)]
pub struct OfflineControl;

#[async_trait]
impl ControlPlane for OfflineControl {
    async fn start_login(&self, prefs: &Prefs) -> Result<String> {
        Ok(format!("{}/login", prefs.control_url.trim_end_matches('/')))
    }

    async fn logout(&self, _prefs: &Prefs) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug, Default)]
struct Inner {
    prefs: Prefs,
    state: State,
    netmap: Option<NetworkMap>,
    logged_in: bool,
    browse_to_url: Option<String>,
    generation: u64,
}

impl Inner {
    fn derive_state(&self) -> State {
        if !self.logged_in {
            State::NeedsLogin
        } else if !self.prefs.want_running {
            State::Stopped
        } else if self.netmap.is_none() {
            State::Starting
        } else {
            State::Running
        }
    }

    fn exit_nodes(&self) -> ExitNodeStatus {
        exitnode::select(&self.prefs, self.netmap.as_ref())
    }

    fn snapshot(&self) -> Notify {
        Notify {
            state: Some(self.state),
            prefs: Some(self.prefs.clone()),
            netmap: self.netmap.clone(),
            browse_to_url: self.browse_to_url.clone(),
            exit_nodes: Some(self.exit_nodes()),
            error: None,
        }
    }

    fn engine_settings(&self) -> EngineSettings {
        let mut settings = EngineSettings {
            shields_up: self.prefs.shields_up,
            ..Default::default()
        };
        let Some(ref nm) = self.netmap else {
            return settings;
        };
        if !self.state.is_active() {
            return settings;
        }

        let exit_id = self.prefs.exit_node_id.as_deref();
        let mut routes = BTreeSet::new();
        for peer in &nm.peers {
            for net in &peer.allowed_ips {
                // Any /0 covers everything, so only the selected exit may install one
                let wanted = if net.prefix_len() == 0 {
                    exit_id == Some(peer.id.as_str())
                } else if is_host_route(net) {
                    true
                } else {
                    self.prefs.route_all
                };
                if wanted {
                    routes.insert(*net);
                }
            }
        }

        settings.router = RouterConfig {
            local_addrs: nm.addresses.clone(),
            routes: routes.into_iter().collect(),
        };
        if self.prefs.corp_dns {
            settings.dns = nm.dns.clone().unwrap_or_default();
        } else {
            settings.dns = DnsConfig::default();
        }
        settings
    }
}

fn is_host_route(net: &IpNet) -> bool {
    net.prefix_len() == net.max_prefix_len()
}

/// Pending engine update produced by a committed change
struct Pending {
    generation: u64,
    settings: EngineSettings,
}

/// The backend instance
pub struct Backend {
    inner: tokio::sync::Mutex<Inner>,
    applied: tokio::sync::Mutex<u64>,
    bus: Arc<NotifyBus>,
    store: Arc<dyn StateStore>,
    control: Arc<dyn ControlPlane>,
    engine: Arc<dyn Engine>,
    bundle: Mutex<Option<EngineBundle>>,
}

impl Backend {
    /// Take ownership of an assembled bundle
    pub fn new(
        bundle: EngineBundle,
        store: Arc<dyn StateStore>,
        bus: Arc<NotifyBus>,
        control: Arc<dyn ControlPlane>,
    ) -> Self {
        Self {
            inner: tokio::sync::Mutex::new(Inner::default()),
            applied: tokio::sync::Mutex::new(0),
            bus,
            store,
            control,
            engine: bundle.engine.clone(),
            bundle: Mutex::new(Some(bundle)),
        }
    }

    /// Load saved state and publish the initial state.
    ///
    /// `initial` is applied only when no preferences were saved yet.
    pub async fn start(&self, initial: &PrefsEdit) -> Result<()> {
        let pending = {
            let mut inner = self.inner.lock().await;

            let saved: Option<Prefs> = store::load(self.store.as_ref(), PREFS_KEY)?;
            inner.prefs = match saved {
                Some(prefs) => prefs,
                None => {
                    let mut prefs = Prefs::default();
                    prefs.apply(initial);
                    store::save(self.store.as_ref(), PREFS_KEY, &prefs)?;
                    prefs
                }
            };
            inner.logged_in = store::load(self.store.as_ref(), LOGIN_KEY)?.unwrap_or(false);

            let notify = Notify {
                prefs: Some(inner.prefs.clone()),
                exit_nodes: Some(inner.exit_nodes()),
                ..Default::default()
            };
            self.commit(&mut inner, notify)
        };

        log::info!("Backend started");
        self.apply(pending).await
    }

    pub async fn state(&self) -> State {
        self.inner.lock().await.state
    }

    pub async fn prefs(&self) -> Prefs {
        self.inner.lock().await.prefs.clone()
    }

    pub async fn exit_node_status(&self) -> ExitNodeStatus {
        self.inner.lock().await.exit_nodes()
    }

    /// Consistent prefs + state + netmap + exit-node posture
    pub async fn snapshot(&self) -> Notify {
        self.inner.lock().await.snapshot()
    }

    /// Queue a snapshot to one session, ordered with respect to broadcasts
    pub async fn send_snapshot(&self, session: SessionId) -> bool {
        let inner = self.inner.lock().await;
        self.bus.send_to(session, inner.snapshot())
    }

    /// Apply a masked preference edit
    pub async fn edit_prefs(&self, edit: &PrefsEdit) -> Result<Prefs> {
        let (prefs, pending) = {
            let mut inner = self.inner.lock().await;

            let mut next = inner.prefs.clone();
            if !next.apply(edit) {
                return Ok(next);
            }
            store::save(self.store.as_ref(), PREFS_KEY, &next)?;
            inner.prefs = next;

            log::info!("Preferences updated (version {})", inner.prefs.version);
            let notify = Notify {
                prefs: Some(inner.prefs.clone()),
                exit_nodes: Some(inner.exit_nodes()),
                ..Default::default()
            };
            (inner.prefs.clone(), self.commit(&mut inner, notify))
        };

        self.apply(pending).await?;
        Ok(prefs)
    }

    /// `up`: start when stopped, log in when logged out, otherwise nothing
    pub async fn up(&self) -> Result<()> {
        let state = self.state().await;
        match state {
            State::Stopped => self.edit_prefs(&PrefsEdit::want_running(true)).await.map(|_| ()),
            State::NeedsLogin => self.start_login_interactive().await,
            _ => {
                log::debug!("up: nothing to do in state {:?}", state);
                Ok(())
            }
        }
    }

    pub async fn down(&self) -> Result<()> {
        self.edit_prefs(&PrefsEdit::want_running(false)).await.map(|_| ())
    }

    /// Select (or with an empty id, clear) the exit node
    pub async fn set_exit_node(&self, id: &str) -> Result<ExitNodeStatus> {
        self.edit_prefs(&PrefsEdit::exit_node(id)).await?;
        Ok(self.exit_node_status().await)
    }

    /// Ask the control plane for a login URL and publish it
    pub async fn start_login_interactive(&self) -> Result<()> {
        let prefs = self.prefs().await;
        let url = self.control.start_login(&prefs).await?;

        let mut inner = self.inner.lock().await;
        inner.browse_to_url = Some(url.clone());
        log::info!("Login required, visit {}", url);
        self.bus.publish(Notify {
            browse_to_url: Some(url),
            ..Default::default()
        });
        Ok(())
    }

    /// Record a completed login and start running
    pub async fn finish_login(&self) -> Result<()> {
        let pending = {
            let mut inner = self.inner.lock().await;

            let mut next = inner.prefs.clone();
            next.apply(&PrefsEdit::want_running(true));
            store::save(self.store.as_ref(), PREFS_KEY, &next)?;
            store::save(self.store.as_ref(), LOGIN_KEY, &true)?;
            inner.prefs = next;
            inner.logged_in = true;
            inner.browse_to_url = None;

            let notify = Notify {
                prefs: Some(inner.prefs.clone()),
                exit_nodes: Some(inner.exit_nodes()),
                ..Default::default()
            };
            self.commit(&mut inner, notify)
        };

        log::info!("Logged in");
        self.apply(pending).await
    }

    pub async fn logout(&self) -> Result<()> {
        let prefs = self.prefs().await;
        self.control.logout(&prefs).await?;

        let pending = {
            let mut inner = self.inner.lock().await;

            let mut next = inner.prefs.clone();
            next.apply(&PrefsEdit::want_running(false));
            store::save(self.store.as_ref(), PREFS_KEY, &next)?;
            store::save(self.store.as_ref(), LOGIN_KEY, &false)?;
            inner.prefs = next;
            inner.logged_in = false;
            inner.netmap = None;
            inner.browse_to_url = None;

            let notify = Notify {
                prefs: Some(inner.prefs.clone()),
                netmap: Some(NetworkMap::default()),
                exit_nodes: Some(inner.exit_nodes()),
                ..Default::default()
            };
            self.commit(&mut inner, notify)
        };

        log::info!("Logged out");
        self.apply(pending).await
    }

    /// Replace the network map
    pub async fn set_netmap(&self, netmap: NetworkMap) -> Result<()> {
        let pending = {
            let mut inner = self.inner.lock().await;
            log::info!("New network map with {} peers", netmap.peers.len());
            inner.netmap = Some(netmap.clone());

            let notify = Notify {
                netmap: Some(netmap),
                exit_nodes: Some(inner.exit_nodes()),
                ..Default::default()
            };
            self.commit(&mut inner, notify)
        };

        self.apply(pending).await
    }

    /// Recompute state, publish, and stamp the change. Lock must be held.
    fn commit(&self, inner: &mut Inner, mut notify: Notify) -> Pending {
        let state = inner.derive_state();
        if state != inner.state {
            log::info!("State: {} -> {}", inner.state, state);
            inner.state = state;
            notify.state = Some(state);
        }
        if !notify.is_empty() {
            self.bus.publish(notify);
        }

        inner.generation += 1;
        Pending {
            generation: inner.generation,
            settings: inner.engine_settings(),
        }
    }

    async fn apply(&self, pending: Pending) -> Result<()> {
        let mut applied = self.applied.lock().await;
        if pending.generation <= *applied {
            return Ok(());
        }
        self.engine.reconfig(&pending.settings).await?;
        *applied = pending.generation;
        Ok(())
    }

    /// Release the engine bundle. Later calls do nothing.
    pub async fn shutdown(&self) -> Result<()> {
        let bundle = self
            .bundle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        match bundle {
            Some(bundle) => bundle.close().await,
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockDevice, MockEngine};
    use crate::netmap::Peer;
    use crate::store::MemStore;
    use mirage_tun::{DeviceKind, TunSpec};
    use tokio::sync::mpsc;

    struct Fixture {
        backend: Backend,
        engine: Arc<MockEngine>,
        rx: mpsc::Receiver<Arc<Notify>>,
        store: Arc<MemStore>,
    }

    fn fixture_with_store(store: Arc<MemStore>) -> Fixture {
        let engine = Arc::new(MockEngine::new());
        let bundle = EngineBundle {
            spec: TunSpec::Userspace,
            iface: "userspace-networking".into(),
            device: Arc::new(MockDevice::new("userspace-networking", DeviceKind::Userspace)),
            router: None,
            dns: None,
            engine: engine.clone(),
        };
        let bus = Arc::new(NotifyBus::new(64));
        let sub = bus.subscribe();
        let backend = Backend::new(bundle, store.clone(), bus, Arc::new(OfflineControl));
        Fixture {
            backend,
            engine,
            rx: sub.rx,
            store,
        }
    }

    fn fixture() -> Fixture {
        fixture_with_store(Arc::new(MemStore::default()))
    }

    fn netmap() -> NetworkMap {
        NetworkMap {
            addresses: vec!["100.64.0.1/32".parse().unwrap()],
            peers: vec![
                Peer {
                    id: "exit1".into(),
                    name: "exit".into(),
                    allowed_ips: vec![
                        "100.64.0.2/32".parse().unwrap(),
                        "0.0.0.0/0".parse().unwrap(),
                    ],
                },
                Peer {
                    id: "lan".into(),
                    name: "subnet-router".into(),
                    allowed_ips: vec![
                        "100.64.0.3/32".parse().unwrap(),
                        "192.168.1.0/24".parse().unwrap(),
                    ],
                },
            ],
            dns: Some(DnsConfig {
                nameservers: vec!["100.100.100.100".parse().unwrap()],
                search_domains: vec![],
            }),
        }
    }

    async fn running(f: &mut Fixture) {
        f.backend.start(&PrefsEdit::default()).await.unwrap();
        f.backend.finish_login().await.unwrap();
        f.backend.set_netmap(netmap()).await.unwrap();
        while f.rx.try_recv().is_ok() {}
    }

    #[tokio::test]
    async fn test_starts_in_needs_login() {
        let mut f = fixture();
        f.backend.start(&PrefsEdit::default()).await.unwrap();

        let first = f.rx.recv().await.unwrap();
        assert_eq!(first.state, Some(State::NeedsLogin));
        assert!(first.prefs.is_some());
        assert_eq!(f.backend.state().await, State::NeedsLogin);
    }

    #[tokio::test]
    async fn test_up_when_logged_out_publishes_login_url() {
        let mut f = fixture();
        f.backend.start(&PrefsEdit::default()).await.unwrap();
        f.rx.recv().await.unwrap();

        f.backend.up().await.unwrap();
        let n = f.rx.recv().await.unwrap();
        assert_eq!(
            n.browse_to_url.as_deref(),
            Some("https://controlplane.tailscale.com/login")
        );
        assert_eq!(n.state, None);
    }

    #[tokio::test]
    async fn test_login_then_netmap_reaches_running() {
        let mut f = fixture();
        f.backend.start(&PrefsEdit::default()).await.unwrap();
        f.backend.finish_login().await.unwrap();
        assert_eq!(f.backend.state().await, State::Starting);

        f.backend.set_netmap(netmap()).await.unwrap();
        assert_eq!(f.backend.state().await, State::Running);

        let settings = f.engine.settings().last().cloned().unwrap();
        // Host routes and subnet routes, but no default route without an exit node
        assert!(settings.router.routes.contains(&"192.168.1.0/24".parse().unwrap()));
        assert!(!settings.router.has_default_route());
        assert_eq!(settings.dns.nameservers.len(), 1);
        while f.rx.try_recv().is_ok() {}
    }

    #[tokio::test]
    async fn test_edit_publishes_once_with_new_version() {
        let mut f = fixture();
        running(&mut f).await;
        let before = f.backend.prefs().await.version;

        f.backend
            .edit_prefs(&PrefsEdit {
                shields_up: Some(true),
                ..Default::default()
            })
            .await
            .unwrap();

        let n = f.rx.recv().await.unwrap();
        let prefs = n.prefs.as_ref().unwrap();
        assert!(prefs.shields_up);
        assert_eq!(prefs.version, before + 1);
        assert!(f.rx.try_recv().is_err());
        assert!(f.engine.settings().last().unwrap().shields_up);
    }

    #[tokio::test]
    async fn test_down_stops_and_clears_routes() {
        let mut f = fixture();
        running(&mut f).await;

        f.backend.down().await.unwrap();
        let n = f.rx.recv().await.unwrap();
        assert_eq!(n.state, Some(State::Stopped));
        assert!(f.engine.settings().last().unwrap().router.is_empty());

        f.backend.up().await.unwrap();
        assert_eq!(f.backend.state().await, State::Running);
    }

    #[tokio::test]
    async fn test_exit_node_adds_default_route() {
        let mut f = fixture();
        running(&mut f).await;

        let status = f.backend.set_exit_node("exit1").await.unwrap();
        assert_eq!(status.status, exitnode::ExitStatus::Online);
        assert!(f.engine.settings().last().unwrap().router.has_default_route());

        let n = f.rx.recv().await.unwrap();
        let exit = n.exit_nodes.as_ref().and_then(|x| x.exit.as_ref());
        assert_eq!(exit.map(|e| e.id.as_str()), Some("exit1"));
        assert!(n.prefs.as_ref().unwrap().exit_node_allow_lan_access);
    }

    #[tokio::test]
    async fn test_route_all_off_drops_subnets() {
        let mut f = fixture();
        running(&mut f).await;

        f.backend
            .edit_prefs(&PrefsEdit {
                route_all: Some(false),
                corp_dns: Some(false),
                ..Default::default()
            })
            .await
            .unwrap();
        let settings = f.engine.settings().last().cloned().unwrap();
        assert!(!settings.router.routes.contains(&"192.168.1.0/24".parse().unwrap()));
        assert!(settings.router.routes.contains(&"100.64.0.3/32".parse().unwrap()));
        assert!(settings.dns.nameservers.is_empty());
    }

    #[tokio::test]
    async fn test_logout_returns_to_needs_login() {
        let mut f = fixture();
        running(&mut f).await;

        f.backend.logout().await.unwrap();
        let n = f.rx.recv().await.unwrap();
        assert_eq!(n.state, Some(State::NeedsLogin));
        assert_eq!(n.netmap, Some(NetworkMap::default()));
        assert!(f.backend.snapshot().await.netmap.is_none());
    }

    #[tokio::test]
    async fn test_state_survives_restart() {
        let store = Arc::new(MemStore::default());
        {
            let mut f = fixture_with_store(store.clone());
            running(&mut f).await;
            f.backend.set_exit_node("exit1").await.unwrap();
            f.backend.shutdown().await.unwrap();
        }

        let f = fixture_with_store(store);
        f.backend
            .start(&PrefsEdit {
                hostname: Some("ignored".into()),
                ..Default::default()
            })
            .await
            .unwrap();
        let prefs = f.backend.prefs().await;
        assert_eq!(prefs.exit_node_id.as_deref(), Some("exit1"));
        assert_eq!(prefs.hostname, "");
        // Logged in and wants to run, but no map yet
        assert_eq!(f.backend.state().await, State::Starting);
        drop(f.store);
    }

    #[tokio::test]
    async fn test_shutdown_closes_bundle_once() {
        let f = fixture();
        f.backend.shutdown().await.unwrap();
        assert!(f.engine.is_closed());
        f.backend.shutdown().await.unwrap();
    }
}
