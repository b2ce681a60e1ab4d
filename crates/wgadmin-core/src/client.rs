//! Lifecycle of one tunnel: ordered start, reverse-order rollback and stop.

use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::backend::Backend;
use crate::config::{validate, validate_tunnel_name, Config};
use crate::control::{ControlClient, ControlSocket};
use crate::engine::{DeviceUpdate, Engine, TunDevice};
use crate::error::{CleanupErrors, Result, TunnelError};
use crate::hook::{HookRunner, HookStage};
use crate::net::NetworkConfigurator;
use crate::status::{PeerStats, TunnelState, TunnelStatus};

/// Default directory for control sockets.
pub const DEFAULT_SOCKET_DIR: &str = "/var/run/wireguard";

/// Default interface name when none is given.
pub const DEFAULT_INTERFACE_NAME: &str = "wg0";

/// How much a tunnel reports about itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    /// Nothing.
    Silent,
    /// Failures only.
    #[default]
    Error,
    /// Failures and progress.
    Verbose,
}

impl LogLevel {
    /// True if failures should be logged.
    #[must_use]
    pub const fn logs_errors(self) -> bool {
        !matches!(self, Self::Silent)
    }

    /// True if progress should be logged.
    #[must_use]
    pub const fn logs_verbose(self) -> bool {
        matches!(self, Self::Verbose)
    }
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "silent" => Ok(Self::Silent),
            "error" => Ok(Self::Error),
            "verbose" => Ok(Self::Verbose),
            other => Err(format!("unknown log level {other:?}")),
        }
    }
}

/// Settings for a [`TunnelClient`], fixed at construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientOptions {
    /// Interface name to request from the platform.
    pub interface_name: String,
    /// Directory holding the control socket.
    pub socket_dir: PathBuf,
    /// Reporting level.
    pub log_level: LogLevel,
    /// Shell used for hook scripts.
    pub hook_shell: String,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            interface_name: DEFAULT_INTERFACE_NAME.to_string(),
            socket_dir: PathBuf::from(DEFAULT_SOCKET_DIR),
            log_level: LogLevel::default(),
            hook_shell: "sh".to_string(),
        }
    }
}

impl ClientOptions {
    /// Sets the interface name.
    #[must_use]
    pub fn with_interface_name(mut self, name: impl Into<String>) -> Self {
        self.interface_name = name.into();
        self
    }

    /// Sets the control-socket directory.
    #[must_use]
    pub fn with_socket_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.socket_dir = dir.into();
        self
    }

    /// Sets the reporting level.
    #[must_use]
    pub fn with_log_level(mut self, level: LogLevel) -> Self {
        self.log_level = level;
        self
    }

    /// Sets the hook shell.
    #[must_use]
    pub fn with_hook_shell(mut self, shell: impl Into<String>) -> Self {
        self.hook_shell = shell.into();
        self
    }
}

/// Resources acquired during start. Released in reverse field order.
struct Resources<B: Backend> {
    interface: String,
    device: Option<B::Device>,
    engine: Option<Arc<B::Engine>>,
    control: Option<ControlSocket>,
    network: Option<B::Network>,
}

impl<B: Backend> Resources<B> {
    fn new(interface: String) -> Self {
        Self {
            interface,
            device: None,
            engine: None,
            control: None,
            network: None,
        }
    }

    /// Releases whatever was acquired, continuing past failures.
    async fn release(&mut self) -> CleanupErrors {
        let mut errors = CleanupErrors::default();

        if let Some(mut network) = self.network.take() {
            if let Err(e) = network.remove().await {
                errors.push(e.into());
            }
        }
        if let Some(engine) = self.engine.take() {
            if let Err(e) = engine.close() {
                errors.push(TunnelError::engine_config(format!("close: {e}")));
            }
        }
        if let Some(control) = self.control.take() {
            if let Err(e) = control.close().await {
                errors.push(e);
            }
        }
        if let Some(mut device) = self.device.take() {
            if let Err(e) = device.close() {
                errors.push(TunnelError::device(self.interface.clone(), e.0));
            }
        }
        errors
    }
}

/// One tunnel's run-time state.
///
/// Start and stop are serialized per client; different clients run fully
/// in parallel.
pub struct TunnelClient<B: Backend> {
    config: Arc<Config>,
    backend: Arc<B>,
    options: ClientOptions,
    hooks: HookRunner,
    live: Mutex<Option<Resources<B>>>,
    state: watch::Sender<TunnelState>,
    interface: parking_lot::Mutex<String>,
}

impl<B: Backend> std::fmt::Debug for TunnelClient<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelClient")
            .field("name", &self.config.name)
            .field("interface", &*self.interface.lock())
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

fn ensure_not_cancelled(cancel: &CancellationToken) -> Result<()> {
    if cancel.is_cancelled() {
        Err(TunnelError::Cancelled)
    } else {
        Ok(())
    }
}

impl<B: Backend> TunnelClient<B> {
    /// Creates a stopped client for `config`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` with every violation if `config` fails
    /// validation, or `InvalidName` for a bad interface name.
    pub fn new(config: Config, backend: Arc<B>, options: ClientOptions) -> Result<Self> {
        let errors = validate(&config);
        if !errors.is_empty() {
            return Err(TunnelError::InvalidConfig(errors));
        }
        validate_tunnel_name(&options.interface_name)?;

        let (state, _) = watch::channel(TunnelState::Stopped);
        Ok(Self {
            interface: parking_lot::Mutex::new(options.interface_name.clone()),
            hooks: HookRunner::new(options.hook_shell.clone()),
            config: Arc::new(config),
            backend,
            options,
            live: Mutex::new(None),
            state,
        })
    }

    /// The config this client runs.
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Options fixed at construction.
    #[must_use]
    pub fn options(&self) -> &ClientOptions {
        &self.options
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> TunnelState {
        *self.state.borrow()
    }

    /// True while fully up.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.state() == TunnelState::Running
    }

    /// Live interface name once started, the requested name before.
    #[must_use]
    pub fn interface_name(&self) -> String {
        self.interface.lock().clone()
    }

    /// Receiver that sees every state change.
    #[must_use]
    pub fn watch_state(&self) -> watch::Receiver<TunnelState> {
        self.state.subscribe()
    }

    /// Resolves once the tunnel is `Stopped`, after teardown has finished.
    /// Returns at once if it is not running.
    pub async fn wait(&self) {
        let mut rx = self.state.subscribe();
        let _ = rx.wait_for(|s| *s == TunnelState::Stopped).await;
    }

    fn set_state(&self, state: TunnelState) {
        self.state.send_replace(state);
    }

    /// Brings the tunnel up.
    ///
    /// Steps run in order: `PreUp` hook, device, engine and control socket,
    /// engine configuration, network configuration, `PostUp` hook, engine up.
    /// If any step fails, everything acquired so far is released in reverse
    /// order before the error is returned. Cancellation is checked between
    /// steps and triggers the same rollback.
    ///
    /// # Errors
    ///
    /// `AlreadyRunning` if starting or running; otherwise the failing
    /// step's error, wrapped in `RolledBack` if the rollback also failed.
    pub async fn start(&self, cancel: &CancellationToken) -> Result<()> {
        if matches!(self.state(), TunnelState::Starting | TunnelState::Running) {
            return Err(TunnelError::already_running(self.interface_name()));
        }
        let mut live = self.live.lock().await;
        if live.is_some() {
            return Err(TunnelError::already_running(self.interface_name()));
        }

        self.set_state(TunnelState::Starting);
        match self.bring_up(cancel).await {
            Ok(resources) => {
                *self.interface.lock() = resources.interface.clone();
                if self.options.log_level.logs_verbose() {
                    info!(tunnel = %self.config.name, interface = %resources.interface, "tunnel running");
                }
                *live = Some(resources);
                self.set_state(TunnelState::Running);
                Ok(())
            }
            Err(e) => {
                if self.options.log_level.logs_errors() {
                    error!(tunnel = %self.config.name, error = %e, "tunnel start failed");
                }
                self.set_state(TunnelState::Stopped);
                Err(e)
            }
        }
    }

    async fn bring_up(&self, cancel: &CancellationToken) -> Result<Resources<B>> {
        let requested = self.options.interface_name.clone();
        ensure_not_cancelled(cancel)?;

        if let Some(script) = self.config.interface.hook(HookStage::PreUp) {
            self.hooks.run(HookStage::PreUp, script, &requested).await?;
        }
        ensure_not_cancelled(cancel)?;

        let mut resources = Resources::<B>::new(requested);
        match self.acquire(&mut resources, cancel).await {
            Ok(()) => Ok(resources),
            Err(cause) => {
                if self.options.log_level.logs_verbose() {
                    debug!(interface = %resources.interface, error = %cause, "rolling back");
                }
                let cleanup = resources.release().await;
                if cleanup.is_empty() {
                    Err(cause)
                } else {
                    Err(TunnelError::RolledBack {
                        cause: Box::new(cause),
                        cleanup,
                    })
                }
            }
        }
    }

    async fn acquire(&self, resources: &mut Resources<B>, cancel: &CancellationToken) -> Result<()> {
        let device = self
            .backend
            .create_device(&resources.interface, self.config.interface.mtu)
            .map_err(|e| TunnelError::device(resources.interface.clone(), e.0))?;
        if device.name() != resources.interface {
            debug!(requested = %resources.interface, actual = %device.name(), "platform renamed interface");
            resources.interface = device.name().to_string();
        }
        let engine = self.backend.create_engine(&device);
        resources.device = Some(device);
        let engine = Arc::new(engine.map_err(|e| TunnelError::device(resources.interface.clone(), format!("engine: {e}")))?);
        resources.engine = Some(Arc::clone(&engine));

        let control = ControlSocket::bind(
            &self.options.socket_dir,
            &resources.interface,
            Arc::clone(&engine),
            self.options.log_level,
        )?;
        resources.control = Some(control);
        ensure_not_cancelled(cancel)?;

        ControlClient::for_interface(&self.options.socket_dir, &resources.interface)
            .set(&DeviceUpdate::from_config(&self.config))
            .await?;
        ensure_not_cancelled(cancel)?;

        let mut network = self.backend.network(&resources.interface, Arc::clone(&self.config));
        let applied = network.apply().await;
        resources.network = Some(network);
        applied?;
        ensure_not_cancelled(cancel)?;

        if let Some(script) = self.config.interface.hook(HookStage::PostUp) {
            self.hooks.run(HookStage::PostUp, script, &resources.interface).await?;
        }

        engine
            .up()
            .map_err(|e| TunnelError::device(resources.interface.clone(), format!("engine up: {e}")))
    }

    /// Tears the tunnel down. A stopped tunnel is left alone.
    ///
    /// Every step runs even if an earlier one fails. Down-side hook
    /// failures are only logged.
    ///
    /// # Errors
    ///
    /// `Cleanup` with every failed step.
    pub async fn stop(&self) -> Result<()> {
        let mut live = self.live.lock().await;
        let Some(mut resources) = live.take() else {
            debug!(tunnel = %self.config.name, "already stopped");
            return Ok(());
        };
        self.set_state(TunnelState::Stopping);
        let interface = resources.interface.clone();

        if let Some(script) = self.config.interface.hook(HookStage::PreDown) {
            if let Err(e) = self.hooks.run(HookStage::PreDown, script, &interface).await {
                if self.options.log_level.logs_errors() {
                    warn!(interface = %interface, error = %e, "PreDown hook failed; continuing");
                }
            }
        }

        let errors = resources.release().await;

        if let Some(script) = self.config.interface.hook(HookStage::PostDown) {
            if let Err(e) = self.hooks.run(HookStage::PostDown, script, &interface).await {
                if self.options.log_level.logs_errors() {
                    warn!(interface = %interface, error = %e, "PostDown hook failed");
                }
            }
        }

        self.set_state(TunnelState::Stopped);
        if errors.is_empty() {
            if self.options.log_level.logs_verbose() {
                info!(tunnel = %self.config.name, interface = %interface, "tunnel stopped");
            }
            Ok(())
        } else {
            if self.options.log_level.logs_errors() {
                error!(interface = %interface, failures = errors.len(), "tunnel stopped with cleanup errors");
            }
            Err(TunnelError::Cleanup(errors))
        }
    }

    /// Live status read from the engine.
    ///
    /// # Errors
    ///
    /// `NotRunning` unless running; control-socket errors otherwise.
    pub async fn status(&self) -> Result<TunnelStatus> {
        if !self.is_running() {
            return Err(TunnelError::not_running(self.interface_name()));
        }
        let interface = self.interface_name();
        let snapshot = ControlClient::for_interface(&self.options.socket_dir, &interface)
            .get()
            .await?;
        Ok(TunnelStatus::from_snapshot(
            &interface,
            self.state(),
            &snapshot,
            &self.config,
            SystemTime::now(),
        ))
    }

    /// Per-peer statistics read from the engine.
    ///
    /// # Errors
    ///
    /// Same as [`TunnelClient::status`].
    pub async fn stats(&self) -> Result<Vec<PeerStats>> {
        self.status().await.map(|status| status.peers)
    }
}
