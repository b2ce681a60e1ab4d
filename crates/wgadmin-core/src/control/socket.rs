//! Per-interface control socket speaking the text configuration protocol.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::oneshot;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info};

use super::uapi::{self, Pairs};
use crate::client::LogLevel;
use crate::engine::{DeviceSnapshot, DeviceUpdate, Engine};
use crate::error::{Result, TunnelError};

/// Path of the control socket for `interface` under `dir`.
#[must_use]
pub fn socket_path(dir: &Path, interface: &str) -> PathBuf {
    dir.join(format!("{interface}.sock"))
}

/// Listening control socket serving one engine.
///
/// Each connection carries a single `get` or `set` exchange. Closing the
/// socket stops accepting, cancels in-flight connections and removes the
/// socket file.
#[derive(Debug)]
pub struct ControlSocket {
    path: PathBuf,
    shutdown: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl ControlSocket {
    /// Binds `<dir>/<interface>.sock` and starts serving `engine`.
    ///
    /// A stale socket file left by a crashed process is replaced.
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns `TunnelError::ControlSocket` if the directory cannot be
    /// created or the socket cannot be bound.
    pub fn bind<E: Engine + ?Sized>(
        dir: &Path,
        interface: &str,
        engine: Arc<E>,
        log_level: LogLevel,
    ) -> Result<Self> {
        let path = socket_path(dir, interface);
        let fail = |reason: String| TunnelError::control_socket(path.clone(), reason);

        create_socket_dir(dir).map_err(|e| fail(format!("cannot create {}: {e}", dir.display())))?;
        match fs::remove_file(&path) {
            Ok(()) => debug!(path = %path.display(), "removed stale control socket"),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(fail(format!("cannot remove stale socket: {e}"))),
        }

        let listener = UnixListener::bind(&path).map_err(|e| fail(e.to_string()))?;
        restrict_permissions(&path).map_err(|e| fail(format!("cannot set permissions: {e}")))?;

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let task = tokio::spawn(accept_loop(listener, engine, shutdown_rx, log_level));

        if log_level.logs_verbose() {
            info!(path = %path.display(), "control socket listening");
        }
        Ok(Self {
            path,
            shutdown: Some(shutdown_tx),
            task: Some(task),
        })
    }

    /// Socket file path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Stops the listener, waits for it to finish and removes the socket file.
    ///
    /// # Errors
    ///
    /// Returns `TunnelError::ControlSocket` if the listener task panicked
    /// or the socket file cannot be removed.
    pub async fn close(mut self) -> Result<()> {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(task) = self.task.take() {
            task.await
                .map_err(|e| TunnelError::control_socket(self.path.clone(), format!("listener task failed: {e}")))?;
        }
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(TunnelError::control_socket(self.path.clone(), format!("cannot remove socket: {e}"))),
        }
    }
}

impl Drop for ControlSocket {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
            if let Some(task) = self.task.take() {
                task.abort();
            }
            let _ = fs::remove_file(&self.path);
        }
    }
}

async fn accept_loop<E: Engine + ?Sized>(
    listener: UnixListener,
    engine: Arc<E>,
    mut shutdown: oneshot::Receiver<()>,
    log_level: LogLevel,
) {
    let mut connections = JoinSet::new();
    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            accept = listener.accept() => match accept {
                Ok((stream, _)) => {
                    let engine = Arc::clone(&engine);
                    connections.spawn(async move {
                        if let Err(e) = uapi::serve(stream, engine.as_ref()).await {
                            if log_level.logs_verbose() {
                                debug!(error = %e, "control connection ended");
                            }
                        }
                    });
                }
                Err(e) => {
                    if log_level.logs_errors() {
                        error!(error = %e, "control socket accept failed");
                    }
                }
            },
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
        }
    }
    connections.shutdown().await;
}

/// Client side of the control socket.
#[derive(Debug, Clone)]
pub struct ControlClient {
    path: PathBuf,
}

impl ControlClient {
    /// Client for the socket at `path`.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Client for `<dir>/<interface>.sock`.
    #[must_use]
    pub fn for_interface(dir: &Path, interface: &str) -> Self {
        Self::new(socket_path(dir, interface))
    }

    /// Socket file path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Pushes a configuration change.
    ///
    /// # Errors
    ///
    /// Returns `TunnelError::EngineConfig` if the engine answers with a
    /// non-zero errno, or `TunnelError::ControlSocket` on transport failure.
    pub async fn set(&self, update: &DeviceUpdate) -> Result<()> {
        self.request(&uapi::encode_set(update)).await.map(drop)
    }

    /// Reads the live device state.
    ///
    /// # Errors
    ///
    /// Same as [`ControlClient::set`], plus `ControlSocket` for a reply
    /// that cannot be decoded.
    pub async fn get(&self) -> Result<DeviceSnapshot> {
        let pairs = self.request("get=1\n\n").await?;
        uapi::decode_snapshot(&pairs).map_err(|e| self.error(format!("bad reply: {e}")))
    }

    async fn request(&self, message: &str) -> Result<Pairs> {
        let mut stream = UnixStream::connect(&self.path)
            .await
            .map_err(|e| self.error(format!("connect failed: {e}")))?;
        stream
            .write_all(message.as_bytes())
            .await
            .map_err(|e| self.error(format!("write failed: {e}")))?;

        let mut reader = BufReader::new(stream);
        let lines = uapi::read_message(&mut reader)
            .await
            .map_err(|e| self.error(format!("read failed: {e}")))?;
        let mut pairs = uapi::parse_pairs(lines.iter().map(String::as_str))
            .map_err(|e| self.error(format!("bad reply: {e}")))?;

        match pairs.pop() {
            Some((key, value)) if key == "errno" => {
                let errno: i32 = value
                    .parse()
                    .map_err(|_| self.error(format!("bad errno {value:?}")))?;
                if errno != 0 {
                    return Err(TunnelError::engine_config(format!("engine returned errno {errno}")));
                }
                Ok(pairs)
            }
            _ => Err(self.error("reply has no errno")),
        }
    }

    fn error(&self, reason: impl Into<String>) -> TunnelError {
        TunnelError::control_socket(self.path.clone(), reason)
    }
}

fn create_socket_dir(dir: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::DirBuilderExt;
    fs::DirBuilder::new().recursive(true).mode(0o755).create(dir)
}

fn restrict_permissions(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600))
}
