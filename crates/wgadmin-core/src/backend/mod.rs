//! Platform backends: what a tunnel is built from.
//!
//! A [`Backend`] creates the device, binds an engine to it and hands out a
//! network configurator for it. [`fake::FakeBackend`] keeps everything in
//! memory; `KernelBackend` (feature `linux`) drives the kernel module;
//! [`UnsupportedBackend`] refuses every start.

use std::sync::Arc;

use crate::config::Config;
use crate::engine::{DeviceError, Engine, EngineError, TunDevice};
use crate::net::NetworkConfigurator;

pub mod fake;
#[cfg(all(feature = "linux", target_os = "linux"))]
mod kernel;
mod unsupported;

pub use fake::FakeBackend;
#[cfg(all(feature = "linux", target_os = "linux"))]
pub use kernel::{KernelBackend, KernelDevice, KernelEngine};
pub use unsupported::{NoDevice, NoEngine, UnsupportedBackend};

/// Factory for the live resources of a tunnel.
pub trait Backend: Send + Sync + 'static {
    /// Network device type.
    type Device: TunDevice;
    /// Engine type.
    type Engine: Engine;
    /// Network configurator type.
    type Network: NetworkConfigurator;

    /// Creates a device named `name` (or the closest name the platform allows).
    ///
    /// # Errors
    ///
    /// Returns `DeviceError` if the device cannot be created.
    fn create_device(&self, name: &str, mtu: u32) -> Result<Self::Device, DeviceError>;

    /// Binds a new engine to `device`.
    ///
    /// # Errors
    ///
    /// Returns `EngineError` if the engine cannot attach to the device.
    fn create_engine(&self, device: &Self::Device) -> Result<Self::Engine, EngineError>;

    /// Network configurator for the live `interface`.
    fn network(&self, interface: &str, config: Arc<Config>) -> Self::Network;
}
