//! Linux kernel backend using netlink through `defguard_wireguard_rs`.

use std::str::FromStr;
use std::sync::Arc;

use defguard_wireguard_rs::host::{Host, Peer as DgPeer};
use defguard_wireguard_rs::key::Key;
use defguard_wireguard_rs::net::IpAddrMask;
use defguard_wireguard_rs::{InterfaceConfiguration, Kernel, WGApi, WireguardInterfaceApi};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use super::Backend;
use crate::config::Config;
use crate::engine::{DeviceError, DeviceSnapshot, DeviceUpdate, Engine, EngineError, PeerSnapshot, TunDevice};
use crate::keys::{PresharedKey, PrivateKey, PublicKey};
use crate::net::linux::{IpRoute2, ResolvedBus};
use crate::net::{NetworkPaths, SystemNetwork};

/// Backend for the in-kernel `WireGuard` module. Needs `CAP_NET_ADMIN`.
#[derive(Debug, Clone, Default)]
pub struct KernelBackend {
    paths: NetworkPaths,
}

impl KernelBackend {
    /// Creates a backend using the default system paths.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Overrides the resolver file and table registry locations.
    #[must_use]
    pub fn with_paths(mut self, paths: NetworkPaths) -> Self {
        self.paths = paths;
        self
    }
}

impl Backend for KernelBackend {
    type Device = KernelDevice;
    type Engine = KernelEngine;
    type Network = SystemNetwork<IpRoute2, ResolvedBus>;

    fn create_device(&self, name: &str, _mtu: u32) -> Result<KernelDevice, DeviceError> {
        let mut api = WGApi::<Kernel>::new(name.to_string()).map_err(|e| DeviceError(format!("WGApi::new: {e}")))?;
        api.create_interface()
            .map_err(|e| DeviceError(format!("create_interface: {e}")))?;
        info!(interface = %name, "created kernel interface");
        Ok(KernelDevice {
            name: name.to_string(),
            api: Some(api),
        })
    }

    fn create_engine(&self, device: &KernelDevice) -> Result<KernelEngine, EngineError> {
        let api = WGApi::<Kernel>::new(device.name.clone()).map_err(|e| EngineError::io(format!("WGApi::new: {e}")))?;
        Ok(KernelEngine {
            interface: device.name.clone(),
            api,
            desired: Mutex::new(DeviceSnapshot::default()),
        })
    }

    fn network(&self, interface: &str, config: Arc<Config>) -> Self::Network {
        SystemNetwork::new(interface, config, IpRoute2::new(), ResolvedBus).with_paths(self.paths.clone())
    }
}

/// A kernel `WireGuard` link.
pub struct KernelDevice {
    name: String,
    api: Option<WGApi<Kernel>>,
}

impl std::fmt::Debug for KernelDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KernelDevice")
            .field("name", &self.name)
            .field("open", &self.api.is_some())
            .finish()
    }
}

impl TunDevice for KernelDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn close(&mut self) -> Result<(), DeviceError> {
        let api = self
            .api
            .take()
            .ok_or_else(|| DeviceError(format!("{} already closed", self.name)))?;
        api.remove_interface()
            .map_err(|e| DeviceError(format!("remove_interface: {e}")))?;
        info!(interface = %self.name, "removed kernel interface");
        Ok(())
    }
}

/// Kernel engine: keeps the desired state and pushes all of it on every change.
pub struct KernelEngine {
    interface: String,
    api: WGApi<Kernel>,
    desired: Mutex<DeviceSnapshot>,
}

impl std::fmt::Debug for KernelEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KernelEngine").field("interface", &self.interface).finish_non_exhaustive()
    }
}

fn to_key(bytes: &[u8]) -> Result<Key, EngineError> {
    Key::try_from(bytes).map_err(|e| EngineError::invalid(format!("key conversion: {e}")))
}

fn to_peer(peer: &PeerSnapshot) -> Result<DgPeer, EngineError> {
    let mut out = DgPeer::new(to_key(peer.public_key.as_bytes())?);
    out.endpoint = peer.endpoint;
    out.persistent_keepalive_interval = (peer.persistent_keepalive > 0).then_some(peer.persistent_keepalive);
    if let Some(ref psk) = peer.preshared_key {
        out.preshared_key = Some(to_key(psk.as_bytes())?);
    }
    for range in &peer.allowed_ips {
        out.allowed_ips.push(
            IpAddrMask::from_str(&range.to_string())
                .map_err(|e| EngineError::invalid(format!("allowed ip {range}: {e}")))?,
        );
    }
    Ok(out)
}

fn from_host(host: &Host, fwmark: u32) -> DeviceSnapshot {
    let peers = host
        .peers
        .values()
        .filter_map(|peer| {
            let mut out = PeerSnapshot::new(PublicKey::from_bytes(&peer.public_key.as_array()).ok()?);
            out.preshared_key = peer
                .preshared_key
                .as_ref()
                .and_then(|k| PresharedKey::from_bytes(&k.as_array()).ok())
                .filter(|k| !k.is_zero());
            out.endpoint = peer.endpoint;
            out.persistent_keepalive = peer.persistent_keepalive_interval.unwrap_or(0);
            out.last_handshake = peer.last_handshake;
            out.rx_bytes = peer.rx_bytes;
            out.tx_bytes = peer.tx_bytes;
            out.allowed_ips = peer
                .allowed_ips
                .iter()
                .filter_map(|mask| mask.to_string().parse().ok())
                .collect();
            Some(out)
        })
        .collect();

    DeviceSnapshot {
        private_key: host
            .private_key
            .as_ref()
            .and_then(|k| PrivateKey::from_bytes(&k.as_array()).ok()),
        listen_port: u16::try_from(host.listen_port).unwrap_or(0),
        fwmark,
        peers,
    }
}

impl Engine for KernelEngine {
    fn apply(&self, update: &DeviceUpdate) -> Result<(), EngineError> {
        let mut desired = self.desired.lock();
        let mut next = desired.clone();
        next.merge(update)?;

        let Some(ref private_key) = next.private_key else {
            return Err(EngineError::invalid("no private key configured"));
        };
        if next.fwmark != 0 {
            warn!(interface = %self.interface, fwmark = next.fwmark, "firewall marks are not supported by the kernel backend; ignoring");
        }

        let peers = next.peers.iter().map(to_peer).collect::<Result<Vec<_>, _>>()?;
        let config = InterfaceConfiguration {
            name: self.interface.clone(),
            prvkey: private_key.to_base64(),
            addresses: Vec::new(),
            port: next.listen_port,
            peers,
            mtu: None,
        };
        self.api
            .configure_interface(&config)
            .map_err(|e| EngineError::io(format!("configure_interface: {e}")))?;

        debug!(interface = %self.interface, peers = next.peers.len(), "kernel configuration applied");
        *desired = next;
        Ok(())
    }

    fn snapshot(&self) -> Result<DeviceSnapshot, EngineError> {
        let host = self
            .api
            .read_interface_data()
            .map_err(|e| EngineError::io(format!("read_interface_data: {e}")))?;
        Ok(from_host(&host, self.desired.lock().fwmark))
    }

    fn up(&self) -> Result<(), EngineError> {
        // The kernel moves packets as soon as the link is up.
        Ok(())
    }

    fn close(&self) -> Result<(), EngineError> {
        let mut desired = self.desired.lock();
        *desired = DeviceSnapshot::default();
        Ok(())
    }
}
