//! Per-interface control socket speaking the `WireGuard` text protocol.
//!
//! The running tunnel exposes its engine at `<socket_dir>/<iface>.sock` so
//! external tools (and the client itself) can push configuration and read
//! statistics.

pub mod uapi;

#[cfg(unix)]
mod socket;

#[cfg(unix)]
pub use socket::{socket_path, ControlClient, ControlSocket};

#[cfg(not(unix))]
mod unsupported {
    use std::path::{Path, PathBuf};
    use std::sync::Arc;

    use crate::client::LogLevel;
    use crate::engine::{DeviceSnapshot, DeviceUpdate, Engine};
    use crate::error::{Result, TunnelError};

    fn unavailable() -> TunnelError {
        TunnelError::UnsupportedPlatform {
            platform: format!("control sockets on {}", std::env::consts::OS),
        }
    }

    /// Path of the control socket for `interface` under `dir`.
    #[must_use]
    pub fn socket_path(dir: &Path, interface: &str) -> PathBuf {
        dir.join(format!("{interface}.sock"))
    }

    /// Control socket placeholder for targets without Unix sockets.
    #[derive(Debug)]
    pub struct ControlSocket;

    impl ControlSocket {
        /// Always fails.
        pub fn bind<E: Engine + ?Sized>(_: &Path, _: &str, _: Arc<E>, _: LogLevel) -> Result<Self> {
            Err(unavailable())
        }

        /// Nothing to close.
        pub async fn close(self) -> Result<()> {
            Ok(())
        }
    }

    /// Control client placeholder for targets without Unix sockets.
    #[derive(Debug, Clone)]
    pub struct ControlClient;

    impl ControlClient {
        /// Client for `<dir>/<interface>.sock`.
        #[must_use]
        pub fn for_interface(_: &Path, _: &str) -> Self {
            Self
        }

        /// Always fails.
        pub async fn set(&self, _: &DeviceUpdate) -> Result<()> {
            Err(unavailable())
        }

        /// Always fails.
        pub async fn get(&self) -> Result<DeviceSnapshot> {
            Err(unavailable())
        }
    }
}

#[cfg(not(unix))]
pub use unsupported::{socket_path, ControlClient, ControlSocket};
