//! Backend for builds without a tunnel implementation.

use std::sync::Arc;

use super::Backend;
use crate::config::Config;
use crate::engine::{DeviceError, DeviceSnapshot, DeviceUpdate, Engine, EngineError, TunDevice};
use crate::net::UnsupportedNetwork;

/// Backend whose devices can never be created. Tunnel files can still be
/// listed, edited and deleted through it.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnsupportedBackend;

/// Device type of [`UnsupportedBackend`]; has no values.
#[derive(Debug)]
pub enum NoDevice {}

/// Engine type of [`UnsupportedBackend`]; has no values.
#[derive(Debug)]
pub enum NoEngine {}

impl TunDevice for NoDevice {
    fn name(&self) -> &str {
        match *self {}
    }

    fn close(&mut self) -> Result<(), DeviceError> {
        match *self {}
    }
}

impl Engine for NoEngine {
    fn apply(&self, _update: &DeviceUpdate) -> Result<(), EngineError> {
        match *self {}
    }

    fn snapshot(&self) -> Result<DeviceSnapshot, EngineError> {
        match *self {}
    }

    fn up(&self) -> Result<(), EngineError> {
        match *self {}
    }

    fn close(&self) -> Result<(), EngineError> {
        match *self {}
    }
}

impl Backend for UnsupportedBackend {
    type Device = NoDevice;
    type Engine = NoEngine;
    type Network = UnsupportedNetwork;

    fn create_device(&self, name: &str, _mtu: u32) -> Result<NoDevice, DeviceError> {
        Err(DeviceError(format!(
            "cannot create {name}: tunnels are not supported on {} in this build",
            std::env::consts::OS
        )))
    }

    fn create_engine(&self, device: &NoDevice) -> Result<NoEngine, EngineError> {
        match *device {}
    }

    fn network(&self, _interface: &str, _config: Arc<Config>) -> UnsupportedNetwork {
        UnsupportedNetwork
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_creation_fails() {
        let err = UnsupportedBackend.create_device("wg0", 1420).expect_err("unsupported");
        assert!(err.0.contains("wg0"));
    }
}
