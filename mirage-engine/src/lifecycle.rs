//! Daemon lifecycle
//!
//! The coordinator walks `Init -> Starting -> Running -> ShuttingDown ->
//! Stopped`. Engine assembly runs concurrently with the control socket accept
//! loop, so clients can connect (and are told the backend is starting) while
//! the tunnel is still being built. Every task shares one cancellation token;
//! a signal, the parent going away, or a fatal error cancels it.

use std::fs::File;
use std::io::Read;
use std::os::fd::{FromRawFd, RawFd};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use mirage_tun::TunSpec;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::assembler::{assemble, AssembleOptions};
use crate::backend::{Backend, ControlPlane, OfflineControl};
use crate::bus::NotifyBus;
use crate::config::Config;
use crate::control::ControlServer;
use crate::engine::Primitives;
use crate::error::{Error, Result};
use crate::netmon::NetMon;
use crate::prefs::PrefsEdit;
use crate::store::open_store;
use crate::watchdog::WatchdogConfig;

/// Environment variable naming the parent-death file descriptor
pub const PARENT_DEATH_FD_ENV: &str = "MIRAGE_PARENT_DEATH_FD";

/// Upper bound on the log flush at shutdown
pub const FLUSH_TIMEOUT: Duration = Duration::from_secs(1);

/// Coordinator phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Phase {
    Init,
    Starting,
    Running,
    ShuttingDown,
    Stopped,
}

/// Everything the daemon needs to run
#[derive(Debug, Clone)]
pub struct DaemonOptions {
    pub specs: Vec<TunSpec>,
    pub listen_port: u16,
    pub socket: PathBuf,
    /// State store location (`mem:` or a file path)
    pub state: String,
    pub max_sessions: usize,
    pub session_queue: usize,
    pub watchdog: WatchdogConfig,
    /// Applied on first start only
    pub initial_prefs: PrefsEdit,
    pub parent_death_fd: Option<RawFd>,
    /// Install SIGINT/SIGTERM handlers
    pub handle_signals: bool,
}

impl DaemonOptions {
    pub fn from_config(config: &Config) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            specs: config.daemon.tun_specs()?,
            listen_port: config.daemon.port,
            socket: config.daemon.socket.clone(),
            state: config.daemon.state_path(),
            max_sessions: config.daemon.max_sessions,
            session_queue: config.daemon.session_queue,
            watchdog: WatchdogConfig::from(&config.watchdog),
            initial_prefs: config.prefs.to_edit(),
            parent_death_fd: None,
            handle_signals: true,
        })
    }
}

/// Parse the parent-death descriptor. Standard streams are rejected.
pub fn parse_parent_death_fd(value: Option<&str>) -> Result<Option<RawFd>> {
    let Some(value) = value.map(str::trim).filter(|v| !v.is_empty()) else {
        return Ok(None);
    };
    let fd: RawFd = value
        .parse()
        .map_err(|_| Error::Config(format!("{} is not a file descriptor: {:?}", PARENT_DEATH_FD_ENV, value)))?;
    if fd <= 2 {
        return Err(Error::Config(format!(
            "{} must be greater than 2, got {}",
            PARENT_DEATH_FD_ENV, fd
        )));
    }
    Ok(Some(fd))
}

/// Owns the daemon's tasks from start to shutdown
pub struct Coordinator {
    options: DaemonOptions,
    primitives: Arc<dyn Primitives>,
    control: Arc<dyn ControlPlane>,
    monitor: NetMon,
    cancel: CancellationToken,
    phase: watch::Sender<Phase>,
    backend: Mutex<Option<Arc<Backend>>>,
}

impl Coordinator {
    pub fn new(options: DaemonOptions, primitives: Arc<dyn Primitives>) -> Self {
        let (phase, _) = watch::channel(Phase::Init);
        Self {
            options,
            primitives,
            control: Arc::new(OfflineControl),
            monitor: NetMon::new(),
            cancel: CancellationToken::new(),
            phase,
            backend: Mutex::new(None),
        }
    }

    pub fn with_control(mut self, control: Arc<dyn ControlPlane>) -> Self {
        self.control = control;
        self
    }

    /// Cancelling this token shuts the daemon down
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn phase(&self) -> watch::Receiver<Phase> {
        self.phase.subscribe()
    }

    pub fn monitor(&self) -> &NetMon {
        &self.monitor
    }

    /// The backend, once assembly has succeeded
    pub fn backend(&self) -> Option<Arc<Backend>> {
        self.backend
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn set_phase(&self, phase: Phase) {
        log::debug!("Lifecycle phase: {:?}", phase);
        self.phase.send_replace(phase);
    }

    /// Run until shutdown.
    ///
    /// Returns the assembly error if no candidate worked, the accept loop's
    /// error if it failed, or [`Error::ParentDied`] if the parent went away.
    /// A signal-triggered shutdown returns `Ok`.
    pub async fn run(&self) -> Result<()> {
        ignore_sigpipe();

        let result = self.run_inner().await;
        self.set_phase(Phase::Stopped);
        match result {
            Ok(()) => log::info!("Daemon stopped"),
            Err(ref e) => log::error!("Daemon stopped: {}", e),
        }
        result
    }

    async fn run_inner(&self) -> Result<()> {
        let opts = &self.options;

        let store = open_store(&opts.state)?;
        let bus = Arc::new(NotifyBus::new(opts.session_queue));
        let server = Arc::new(ControlServer::new(&opts.socket, bus.clone(), opts.max_sessions));
        let listener = server.bind()?;

        if opts.handle_signals {
            let cancel = self.cancel.clone();
            tokio::spawn(async move {
                if let Err(e) = watch_signals(cancel).await {
                    log::error!("Failed to install signal handlers: {}", e);
                }
            });
        }

        let parent_died = Arc::new(AtomicBool::new(false));
        if let Some(fd) = opts.parent_death_fd {
            watch_parent(fd, self.cancel.clone(), parent_died.clone())?;
        }

        self.set_phase(Phase::Starting);
        log::info!("Starting, tunnel candidates: {}", join_specs(&opts.specs));

        let accept = tokio::spawn({
            let server = server.clone();
            let cancel = self.cancel.clone();
            async move {
                let result = server.serve(listener, cancel.child_token()).await;
                if result.is_err() {
                    cancel.cancel();
                }
                result
            }
        });

        let assemble_options = AssembleOptions {
            listen_port: opts.listen_port,
            watchdog: opts.watchdog,
        };
        let assembled = assemble(
            &opts.specs,
            self.primitives.as_ref(),
            &self.monitor,
            &assemble_options,
            &self.cancel,
        )
        .await;

        let mut terminal = None;
        let backend = match assembled {
            Ok(bundle) => {
                self.set_phase(Phase::Running);
                log::info!("Running on {}", bundle.iface);

                let backend = Arc::new(Backend::new(
                    bundle,
                    store,
                    bus.clone(),
                    self.control.clone(),
                ));
                *self.backend.lock().unwrap_or_else(PoisonError::into_inner) = Some(backend.clone());
                server.install(backend.clone()).await;

                match backend.start(&opts.initial_prefs).await {
                    Ok(()) => self.cancel.cancelled().await,
                    Err(e) => {
                        log::error!("Backend failed to start: {}", e);
                        terminal = Some(e);
                    }
                }
                Some(backend)
            }
            Err(e) if e.is_cancelled() => None,
            Err(e) => {
                log::error!("{}", e);
                terminal = Some(e);
                None
            }
        };

        self.set_phase(Phase::ShuttingDown);
        log::info!("Shutting down");
        self.cancel.cancel();

        match accept.await {
            Ok(Err(e)) => {
                terminal.get_or_insert(e);
            }
            Err(e) => log::warn!("Control accept loop panicked: {}", e),
            Ok(Ok(())) => {}
        }

        flush_logs().await;

        if let Some(backend) = backend {
            if let Err(e) = backend.shutdown().await {
                log::warn!("Error releasing engine: {}", e);
            }
        }
        server.cleanup();

        if let Some(e) = terminal {
            return Err(e);
        }
        if parent_died.load(Ordering::SeqCst) {
            return Err(Error::ParentDied);
        }
        Ok(())
    }
}

fn join_specs(specs: &[TunSpec]) -> String {
    specs
        .iter()
        .map(|s| s.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

fn ignore_sigpipe() {
    // SAFETY: installing SIG_IGN has no preconditions
    unsafe {
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
    }
}

async fn watch_signals(cancel: CancellationToken) -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    tokio::select! {
        _ = sigterm.recv() => log::info!("Received SIGTERM"),
        _ = sigint.recv() => log::info!("Received SIGINT"),
        _ = cancel.cancelled() => return Ok(()),
    }
    cancel.cancel();
    Ok(())
}

/// Block a dedicated thread on `fd`; readable (data or EOF) means the parent
/// is gone
fn watch_parent(fd: RawFd, cancel: CancellationToken, died: Arc<AtomicBool>) -> Result<()> {
    // SAFETY: F_GETFD only queries the descriptor table
    if unsafe { libc::fcntl(fd, libc::F_GETFD) } < 0 {
        return Err(Error::Config(format!(
            "{}={} is not an open descriptor: {}",
            PARENT_DEATH_FD_ENV,
            fd,
            std::io::Error::last_os_error()
        )));
    }
    // SAFETY: the descriptor is open, handed to us by the parent and owned by
    // this process from here on
    let mut file = unsafe { File::from_raw_fd(fd) };

    std::thread::Builder::new()
        .name("parent-death".into())
        .spawn(move || {
            let mut buf = [0u8; 1];
            loop {
                match file.read(&mut buf) {
                    Ok(0) => break,
                    Ok(_) => {
                        log::debug!("Parent wrote to descriptor {}", fd);
                        break;
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                    Err(e) => {
                        log::warn!("Reading parent-death descriptor {} failed: {}", fd, e);
                        break;
                    }
                }
            }
            if cancel.is_cancelled() {
                return;
            }
            log::warn!("Parent process went away, shutting down");
            died.store(true, Ordering::SeqCst);
            cancel.cancel();
        })?;
    Ok(())
}

async fn flush_logs() {
    let flush = tokio::task::spawn_blocking(|| log::logger().flush());
    if tokio::time::timeout(FLUSH_TIMEOUT, flush).await.is_err() {
        log::warn!("Log flush did not finish within {:?}", FLUSH_TIMEOUT);
    }
}
