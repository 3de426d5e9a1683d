//! Control socket for local clients
//!
//! Clients connect to a Unix domain socket and exchange newline-delimited
//! JSON. Requests are [`Command`] objects; everything the server writes back
//! is a [`Notify`]. Every connection is a session subscribed to the
//! notification bus, so it sees every backend change as well as the replies
//! to its own commands.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;

use crate::backend::Backend;
use crate::bus::{NotifyBus, SessionId};
use crate::error::{Error, Result};
use crate::event::Notify;

pub use crate::config::DEFAULT_SOCKET_PATH;

/// How long the client waits for each reply
pub const CLIENT_TIMEOUT: Duration = Duration::from_secs(5);

/// A request line
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    pub cmd: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub data: Value,
}

impl Command {
    pub fn new(cmd: impl Into<String>) -> Self {
        Self {
            cmd: cmd.into(),
            data: Value::Null,
        }
    }

    pub fn with_data(cmd: impl Into<String>, data: impl Into<Value>) -> Self {
        Self {
            cmd: cmd.into(),
            data: data.into(),
        }
    }
}

type BackendSlot = Arc<RwLock<Option<Arc<Backend>>>>;

/// Decrements the live session count when the session ends
struct SessionGuard(Arc<AtomicUsize>);

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Control socket server
pub struct ControlServer {
    socket_path: PathBuf,
    bus: Arc<NotifyBus>,
    backend: BackendSlot,
    max_sessions: usize,
    active: Arc<AtomicUsize>,
}

impl ControlServer {
    pub fn new(socket_path: impl AsRef<Path>, bus: Arc<NotifyBus>, max_sessions: usize) -> Self {
        Self {
            socket_path: socket_path.as_ref().to_path_buf(),
            bus,
            backend: Arc::new(RwLock::new(None)),
            max_sessions: max_sessions.max(1),
            active: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Number of connected sessions
    pub fn sessions(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Route commands to `backend` from now on
    pub async fn install(&self, backend: Arc<Backend>) {
        *self.backend.write().await = Some(backend);
        log::debug!("Backend installed into control server");
    }

    /// Create the socket file, replacing any stale one
    pub fn bind(&self) -> Result<UnixListener> {
        let _ = std::fs::remove_file(&self.socket_path);

        if let Some(parent) = self.socket_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let listener = UnixListener::bind(&self.socket_path).map_err(|e| {
            Error::Control(format!(
                "failed to bind control socket {}: {}",
                self.socket_path.display(),
                e
            ))
        })?;

        {
            use std::os::unix::fs::PermissionsExt;
            let perms = std::fs::Permissions::from_mode(0o600);
            std::fs::set_permissions(&self.socket_path, perms)?;
        }

        log::info!("Control socket listening on {:?}", self.socket_path);
        Ok(listener)
    }

    /// Accept sessions until `cancel` fires.
    ///
    /// Returns `Ok` on cancellation; an accept error ends the loop with that
    /// error. Open sessions are ended when `cancel` fires.
    pub async fn serve(&self, listener: UnixListener, cancel: CancellationToken) -> Result<()> {
        loop {
            let stream = tokio::select! {
                _ = cancel.cancelled() => {
                    log::debug!("Control accept loop stopped");
                    return Ok(());
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, _)) => stream,
                    Err(e) => {
                        log::error!("Control socket accept failed: {}", e);
                        return Err(e.into());
                    }
                },
            };

            if self.active.fetch_add(1, Ordering::SeqCst) >= self.max_sessions {
                self.active.fetch_sub(1, Ordering::SeqCst);
                log::warn!("Rejecting control session: limit of {} reached", self.max_sessions);
                tokio::spawn(reject_session(stream, self.max_sessions));
                continue;
            }

            let guard = SessionGuard(self.active.clone());
            let bus = self.bus.clone();
            let backend = self.backend.clone();
            let cancel = cancel.child_token();
            tokio::spawn(async move {
                let _guard = guard;
                if let Err(e) = run_session(stream, bus, backend, cancel).await {
                    log::debug!("Control session error: {}", e);
                }
            });
        }
    }

    /// Bind and serve in one call
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        let listener = self.bind()?;
        self.serve(listener, cancel).await
    }

    /// Remove the socket file
    pub fn cleanup(&self) {
        let _ = std::fs::remove_file(&self.socket_path);
    }
}

impl Drop for ControlServer {
    fn drop(&mut self) {
        self.cleanup();
    }
}

async fn reject_session(mut stream: UnixStream, limit: usize) {
    let notify = Notify::error(format!("too many control sessions (limit {})", limit));
    if let Ok(mut line) = serde_json::to_string(&notify) {
        line.push('\n');
        let _ = stream.write_all(line.as_bytes()).await;
    }
    let _ = stream.shutdown().await;
}

async fn run_session(
    stream: UnixStream,
    bus: Arc<NotifyBus>,
    backend: BackendSlot,
    cancel: CancellationToken,
) -> Result<()> {
    let sub = bus.subscribe();
    let id = sub.id;
    log::info!("Control session {} connected", id);

    let (reader, writer) = stream.into_split();

    // The writer ends when the bus drops the session or the peer goes away
    let writer_task = tokio::spawn({
        let cancel = cancel.clone();
        async move {
            let result = write_notifications(writer, sub.rx, &cancel).await;
            cancel.cancel();
            result
        }
    });

    let result = read_commands(reader, id, &bus, &backend, &cancel).await;

    bus.unsubscribe(id);
    cancel.cancel();
    match writer_task.await {
        Ok(Err(e)) => log::debug!("Control session {} write error: {}", id, e),
        Err(e) => log::debug!("Control session {} writer panicked: {}", id, e),
        Ok(Ok(())) => {}
    }

    log::info!("Control session {} disconnected", id);
    result
}

async fn write_notifications(
    mut writer: OwnedWriteHalf,
    mut rx: mpsc::Receiver<Arc<Notify>>,
    cancel: &CancellationToken,
) -> Result<()> {
    loop {
        let notify = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            next = rx.recv() => match next {
                Some(notify) => notify,
                None => break,
            },
        };
        let mut line = serde_json::to_string(notify.as_ref())?;
        line.push('\n');
        // A peer that stops reading must not hold the session past cancel
        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            written = writer.write_all(line.as_bytes()) => written?,
        }
    }
    writer.shutdown().await?;
    Ok(())
}

async fn read_commands(
    reader: OwnedReadHalf,
    id: SessionId,
    bus: &NotifyBus,
    backend: &BackendSlot,
    cancel: &CancellationToken,
) -> Result<()> {
    let mut reader = BufReader::new(reader);
    let mut line = String::new();

    loop {
        line.clear();
        let n = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            read = reader.read_line(&mut line) => read?,
        };
        if n == 0 {
            return Ok(());
        }

        let request = line.trim();
        if request.is_empty() {
            continue;
        }

        match serde_json::from_str::<Command>(request) {
            Ok(command) => {
                if let Err(e) = dispatch(command, id, backend).await {
                    log::debug!("Control session {} command failed: {}", id, e);
                    bus.send_to(id, Notify::error(e.to_string()));
                }
            }
            Err(e) => {
                bus.send_to(id, Notify::error(format!("invalid command: {}", e)));
            }
        }
    }
}

async fn dispatch(command: Command, id: SessionId, slot: &BackendSlot) -> Result<()> {
    let backend = slot.read().await.clone();
    let Some(backend) = backend else {
        return Err(Error::BackendStarting);
    };

    log::debug!("Control session {} command {:?}", id, command.cmd);
    match command.cmd.as_str() {
        "init" => {
            if !backend.send_snapshot(id).await {
                log::debug!("Control session {} gone before snapshot", id);
            }
            Ok(())
        }
        "up" => backend.up().await,
        "down" => backend.down().await,
        "set-exit-node" | "exitNode" => {
            let node = match &command.data {
                Value::String(s) => s.as_str(),
                Value::Null => "",
                other => {
                    return Err(Error::Control(format!("exit node id must be a string, got {}", other)))
                }
            };
            backend.set_exit_node(node).await.map(|_| ())
        }
        "logout" => backend.logout().await,
        other => Err(Error::Control(format!("unknown command {:?}", other))),
    }
}

/// Control socket client for a running daemon
pub struct ControlClient {
    socket_path: PathBuf,
    timeout: Duration,
}

impl ControlClient {
    pub fn new(socket_path: impl AsRef<Path>) -> Self {
        Self {
            socket_path: socket_path.as_ref().to_path_buf(),
            timeout: CLIENT_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Open a session
    pub async fn connect(&self) -> Result<ControlConnection> {
        let stream = UnixStream::connect(&self.socket_path).await.map_err(|e| {
            Error::Control(format!(
                "failed to connect to control socket at {:?}: {}. Is the daemon running?",
                self.socket_path, e
            ))
        })?;
        let (reader, writer) = stream.into_split();
        Ok(ControlConnection {
            reader: BufReader::new(reader),
            writer,
            timeout: self.timeout,
        })
    }

    /// Current prefs, state, netmap and exit-node posture
    pub async fn status(&self) -> Result<Notify> {
        let mut conn = self.connect().await?;
        conn.send(&Command::new("init")).await?;
        conn.wait_snapshot().await
    }

    /// Run `command`, then return the resulting snapshot
    pub async fn command(&self, command: Command) -> Result<Notify> {
        let mut conn = self.connect().await?;
        conn.send(&command).await?;
        conn.send(&Command::new("init")).await?;
        conn.wait_snapshot().await
    }

    pub async fn up(&self) -> Result<Notify> {
        self.command(Command::new("up")).await
    }

    pub async fn down(&self) -> Result<Notify> {
        self.command(Command::new("down")).await
    }

    pub async fn set_exit_node(&self, id: &str) -> Result<Notify> {
        self.command(Command::with_data("set-exit-node", id)).await
    }

    pub async fn logout(&self) -> Result<Notify> {
        self.command(Command::new("logout")).await
    }

    /// Open a session that has asked for the initial snapshot
    pub async fn watch(&self) -> Result<ControlConnection> {
        let mut conn = self.connect().await?;
        conn.send(&Command::new("init")).await?;
        Ok(conn)
    }
}

/// One open session on the client side
pub struct ControlConnection {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    timeout: Duration,
}

impl ControlConnection {
    pub async fn send(&mut self, command: &Command) -> Result<()> {
        let mut line = serde_json::to_string(command)?;
        line.push('\n');
        self.writer.write_all(line.as_bytes()).await?;
        Ok(())
    }

    /// Next message, or `None` once the server closed the session
    pub async fn recv(&mut self) -> Result<Option<Notify>> {
        let mut line = String::new();
        loop {
            line.clear();
            if self.reader.read_line(&mut line).await? == 0 {
                return Ok(None);
            }
            if !line.trim().is_empty() {
                return Ok(Some(serde_json::from_str(line.trim())?));
            }
        }
    }

    /// Like [`recv`](Self::recv), bounded by the client timeout
    pub async fn recv_timeout(&mut self) -> Result<Option<Notify>> {
        let timeout = self.timeout;
        tokio::time::timeout(timeout, self.recv())
            .await
            .map_err(|_| Error::Timeout("waiting for control reply".into()))?
    }

    /// Read until a full snapshot arrives; an error message fails the call
    async fn wait_snapshot(&mut self) -> Result<Notify> {
        loop {
            match self.recv_timeout().await? {
                None => return Err(Error::Control("daemon closed the session".into())),
                Some(n) => {
                    if let Some(msg) = n.error {
                        return Err(Error::Control(msg));
                    }
                    if n.state.is_some() && n.prefs.is_some() {
                        return Ok(n);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_json() {
        let json = serde_json::to_string(&Command::new("up")).unwrap();
        assert_eq!(json, r#"{"cmd":"up"}"#);

        let cmd: Command = serde_json::from_str(r#"{"cmd":"exitNode","data":"n1"}"#).unwrap();
        assert_eq!(cmd, Command::with_data("exitNode", "n1"));
    }

    #[tokio::test]
    async fn test_commands_before_install_report_starting() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("control.sock");
        let server = Arc::new(ControlServer::new(&path, Arc::new(NotifyBus::new(8)), 4));
        let listener = server.bind().unwrap();
        let cancel = CancellationToken::new();
        let task = tokio::spawn({
            let server = server.clone();
            let cancel = cancel.clone();
            async move { server.serve(listener, cancel).await }
        });

        let err = ControlClient::new(&path).status().await.unwrap_err();
        assert!(err.to_string().contains("backend is starting"));

        cancel.cancel();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_bind_sets_owner_only_mode() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("control.sock");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, b"stale").unwrap();

        let server = ControlServer::new(&path, Arc::new(NotifyBus::new(8)), 4);
        let _listener = server.bind().unwrap();
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);

        drop(server);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_writer_stops_on_cancel_when_peer_stops_reading() {
        let (server_side, _peer) = UnixStream::pair().unwrap();
        let (_reader, writer) = server_side.into_split();

        let (tx, rx) = mpsc::channel(64);
        for _ in 0..64 {
            tx.try_send(Arc::new(Notify::error("x".repeat(64 * 1024))))
                .unwrap();
        }

        let cancel = CancellationToken::new();
        let task = tokio::spawn({
            let cancel = cancel.clone();
            async move { write_notifications(writer, rx, &cancel).await }
        });

        // The socket buffer fills long before 4 MiB is written
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!task.is_finished());

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .expect("writer ignored cancellation")
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_client_without_daemon() {
        let dir = tempfile::tempdir().unwrap();
        let err = ControlClient::new(dir.path().join("missing.sock"))
            .status()
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Is the daemon running?"));
    }
}
