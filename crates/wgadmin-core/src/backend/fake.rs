//! In-memory backend.
//!
//! Devices, engines, links, routes and the resolver daemon all live in
//! shared state that tests can inspect and sabotage. Network changes go
//! through the real [`SystemNetwork`] logic on top of [`FakeLinks`] and
//! [`FakeResolver`].

use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::SystemTime;

use ipnet::IpNet;
use parking_lot::Mutex;

use super::Backend;
use crate::config::Config;
use crate::engine::{DeviceError, DeviceSnapshot, DeviceUpdate, Engine, EngineError, TunDevice};
use crate::error::NetworkError;
use crate::keys::PublicKey;
use crate::net::{AddOutcome, DeleteOutcome, LinkOps, NetworkPaths, ResolverDaemon, RouteSpec, SystemNetwork};
use crate::probe::InterfaceProbe;

/// Lifecycle step recorded by [`FakeBackend`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FakeEvent {
    /// A device was created under this name.
    DeviceCreated(String),
    /// An engine was bound to this device.
    EngineCreated(String),
    /// The engine for this device went up.
    EngineUp(String),
    /// The engine for this device was closed.
    EngineClosed(String),
    /// The device was destroyed.
    DeviceClosed(String),
}

#[derive(Debug, Default)]
struct EngineState {
    snapshot: DeviceSnapshot,
    up: bool,
    closed: bool,
}

#[derive(Debug, Default)]
struct BackendState {
    events: Vec<FakeEvent>,
    devices: HashSet<String>,
    engines: HashMap<String, Arc<Mutex<EngineState>>>,
    fail_device: Option<String>,
    fail_engine: Option<String>,
    fail_engine_up: bool,
    fail_engine_close: bool,
    fail_device_close: bool,
    assigned_name: Option<String>,
    external: HashMap<String, Option<Ipv4Addr>>,
}

/// Backend that keeps every resource in memory.
#[derive(Debug, Clone, Default)]
pub struct FakeBackend {
    state: Arc<Mutex<BackendState>>,
    links: FakeLinks,
    resolver: FakeResolver,
    paths: NetworkPaths,
}

impl FakeBackend {
    /// Creates an empty backend.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Points DNS and table lookups at other files.
    #[must_use]
    pub fn with_paths(mut self, paths: NetworkPaths) -> Self {
        self.paths = paths;
        self
    }

    /// Link and route state.
    #[must_use]
    pub fn links(&self) -> &FakeLinks {
        &self.links
    }

    /// Resolver daemon state.
    #[must_use]
    pub fn resolver(&self) -> &FakeResolver {
        &self.resolver
    }

    /// Makes the next device creations fail with `reason`.
    pub fn fail_device_creation(&self, reason: impl Into<String>) {
        self.state.lock().fail_device = Some(reason.into());
    }

    /// Makes the next engine creations fail with `reason`.
    pub fn fail_engine_creation(&self, reason: impl Into<String>) {
        self.state.lock().fail_engine = Some(reason.into());
    }

    /// Makes engines fail to go up.
    pub fn fail_engine_up(&self) {
        self.state.lock().fail_engine_up = true;
    }

    /// Makes closing an engine fail. The engine stays open.
    pub fn fail_engine_close(&self) {
        self.state.lock().fail_engine_close = true;
    }

    /// Makes closing a device fail. The device stays live.
    pub fn fail_device_close(&self) {
        self.state.lock().fail_device_close = true;
    }

    /// Clears every injected failure.
    pub fn heal(&self) {
        let mut state = self.state.lock();
        state.fail_device = None;
        state.fail_engine = None;
        state.fail_engine_up = false;
        state.fail_engine_close = false;
        state.fail_device_close = false;
        self.links.heal();
        self.resolver.heal();
    }

    /// Makes the platform hand out `name` instead of the requested name.
    pub fn assign_device_name(&self, name: impl Into<String>) {
        self.state.lock().assigned_name = Some(name.into());
    }

    /// Registers an interface created outside this process.
    pub fn add_external_interface(&self, name: impl Into<String>, ipv4: Option<Ipv4Addr>) {
        self.state.lock().external.insert(name.into(), ipv4);
    }

    /// Every lifecycle step so far, oldest first.
    #[must_use]
    pub fn events(&self) -> Vec<FakeEvent> {
        self.state.lock().events.clone()
    }

    /// Names of devices not yet closed, sorted.
    #[must_use]
    pub fn live_devices(&self) -> Vec<String> {
        let mut names: Vec<String> = self.state.lock().devices.iter().cloned().collect();
        names.sort();
        names
    }

    /// True if the engine bound to `interface` is up.
    #[must_use]
    pub fn engine_is_up(&self, interface: &str) -> bool {
        self.engine(interface).is_some_and(|engine| engine.lock().up)
    }

    /// Engine-side state for `interface`, if an engine is live.
    #[must_use]
    pub fn engine_snapshot(&self, interface: &str) -> Option<DeviceSnapshot> {
        self.engine(interface).map(|engine| engine.lock().snapshot.clone())
    }

    /// Records a completed handshake with `peer`. Returns false if unknown.
    pub fn simulate_handshake(&self, interface: &str, peer: &PublicKey, at: SystemTime) -> bool {
        self.with_peer(interface, peer, |p| p.last_handshake = Some(at))
    }

    /// Adds transfer counters for `peer`. Returns false if unknown.
    pub fn simulate_traffic(&self, interface: &str, peer: &PublicKey, rx: u64, tx: u64) -> bool {
        self.with_peer(interface, peer, |p| {
            p.rx_bytes += rx;
            p.tx_bytes += tx;
        })
    }

    fn engine(&self, interface: &str) -> Option<Arc<Mutex<EngineState>>> {
        self.state.lock().engines.get(interface).cloned()
    }

    fn with_peer(&self, interface: &str, peer: &PublicKey, f: impl FnOnce(&mut crate::engine::PeerSnapshot)) -> bool {
        let Some(engine) = self.engine(interface) else {
            return false;
        };
        let mut engine = engine.lock();
        match engine.snapshot.peers.iter_mut().find(|p| p.public_key == *peer) {
            Some(p) => {
                f(p);
                true
            }
            None => false,
        }
    }
}

impl Backend for FakeBackend {
    type Device = FakeDevice;
    type Engine = FakeEngine;
    type Network = SystemNetwork<FakeLinks, FakeResolver>;

    fn create_device(&self, name: &str, _mtu: u32) -> Result<FakeDevice, DeviceError> {
        let mut state = self.state.lock();
        if let Some(ref reason) = state.fail_device {
            return Err(DeviceError(reason.clone()));
        }
        let actual = state.assigned_name.clone().unwrap_or_else(|| name.to_string());
        if !state.devices.insert(actual.clone()) {
            return Err(DeviceError(format!("device {actual} already exists")));
        }
        state.events.push(FakeEvent::DeviceCreated(actual.clone()));
        Ok(FakeDevice {
            name: actual,
            state: Arc::clone(&self.state),
            closed: false,
        })
    }

    fn create_engine(&self, device: &FakeDevice) -> Result<FakeEngine, EngineError> {
        let mut state = self.state.lock();
        if let Some(ref reason) = state.fail_engine {
            return Err(EngineError::io(reason.clone()));
        }
        let engine = Arc::new(Mutex::new(EngineState::default()));
        state.engines.insert(device.name.clone(), Arc::clone(&engine));
        state.events.push(FakeEvent::EngineCreated(device.name.clone()));
        Ok(FakeEngine {
            interface: device.name.clone(),
            engine,
            backend: Arc::clone(&self.state),
            fail_up: state.fail_engine_up,
        })
    }

    fn network(&self, interface: &str, config: Arc<Config>) -> Self::Network {
        SystemNetwork::new(interface, config, self.links.clone(), self.resolver.clone()).with_paths(self.paths.clone())
    }
}

impl InterfaceProbe for FakeBackend {
    fn exists(&self, name: &str) -> bool {
        let state = self.state.lock();
        state.devices.contains(name) || state.external.contains_key(name)
    }

    fn ipv4_address(&self, name: &str) -> Option<Ipv4Addr> {
        if let Some(ip) = self.state.lock().external.get(name) {
            return *ip;
        }
        self.links.addresses(name).into_iter().find_map(|net| match net {
            IpNet::V4(v4) => Some(v4.addr()),
            IpNet::V6(_) => None,
        })
    }
}

/// Device created by [`FakeBackend`].
#[derive(Debug)]
pub struct FakeDevice {
    name: String,
    state: Arc<Mutex<BackendState>>,
    closed: bool,
}

impl TunDevice for FakeDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn close(&mut self) -> Result<(), DeviceError> {
        if self.closed {
            return Err(DeviceError(format!("device {} already closed", self.name)));
        }
        let mut state = self.state.lock();
        if state.fail_device_close {
            return Err(DeviceError(format!("device {} is busy", self.name)));
        }
        self.closed = true;
        state.devices.remove(&self.name);
        state.events.push(FakeEvent::DeviceClosed(self.name.clone()));
        Ok(())
    }
}

/// Engine created by [`FakeBackend`].
#[derive(Debug)]
pub struct FakeEngine {
    interface: String,
    engine: Arc<Mutex<EngineState>>,
    backend: Arc<Mutex<BackendState>>,
    fail_up: bool,
}

impl Engine for FakeEngine {
    fn apply(&self, update: &DeviceUpdate) -> Result<(), EngineError> {
        let mut engine = self.engine.lock();
        if engine.closed {
            return Err(EngineError::io("engine closed"));
        }
        engine.snapshot.merge(update)
    }

    fn snapshot(&self) -> Result<DeviceSnapshot, EngineError> {
        let engine = self.engine.lock();
        if engine.closed {
            return Err(EngineError::io("engine closed"));
        }
        Ok(engine.snapshot.clone())
    }

    fn up(&self) -> Result<(), EngineError> {
        if self.fail_up {
            return Err(EngineError::io("engine refused to start"));
        }
        self.engine.lock().up = true;
        self.backend.lock().events.push(FakeEvent::EngineUp(self.interface.clone()));
        Ok(())
    }

    fn close(&self) -> Result<(), EngineError> {
        if self.backend.lock().fail_engine_close {
            return Err(EngineError::io("engine did not shut down"));
        }
        let mut engine = self.engine.lock();
        engine.closed = true;
        engine.up = false;
        drop(engine);

        let mut backend = self.backend.lock();
        backend.engines.remove(&self.interface);
        backend.events.push(FakeEvent::EngineClosed(self.interface.clone()));
        Ok(())
    }
}

#[derive(Debug, Default)]
struct LinkState {
    indexes: Vec<String>,
    mtu: HashMap<String, u32>,
    addresses: Vec<(String, IpNet)>,
    up: HashSet<String>,
    routes: Vec<RouteSpec>,
    deleted: Vec<RouteSpec>,
    route_attempts: usize,
    fail_route_at: Option<usize>,
    fail_route_delete: HashSet<IpNet>,
    fail_mtu: bool,
}

/// In-memory links, addresses and routes.
#[derive(Debug, Clone, Default)]
pub struct FakeLinks {
    state: Arc<Mutex<LinkState>>,
}

impl FakeLinks {
    /// Makes the `n`th route add (0-based, counted from now) fail.
    pub fn fail_route_at(&self, n: usize) {
        let mut state = self.state.lock();
        state.fail_route_at = Some(state.route_attempts + n);
    }

    /// Makes every MTU change fail.
    pub fn fail_mtu(&self) {
        self.state.lock().fail_mtu = true;
    }

    /// Makes deleting the route to `destination` fail.
    pub fn fail_route_delete(&self, destination: IpNet) {
        self.state.lock().fail_route_delete.insert(destination);
    }

    /// Clears injected failures.
    pub fn heal(&self) {
        let mut state = self.state.lock();
        state.fail_route_at = None;
        state.fail_route_delete.clear();
        state.fail_mtu = false;
    }

    /// Index handed out for `interface`, if it was ever looked up.
    #[must_use]
    pub fn index_of(&self, interface: &str) -> Option<u32> {
        self.state
            .lock()
            .indexes
            .iter()
            .position(|name| name == interface)
            .and_then(|i| u32::try_from(i + 1).ok())
    }

    /// Current MTU of `interface`.
    #[must_use]
    pub fn mtu(&self, interface: &str) -> Option<u32> {
        self.state.lock().mtu.get(interface).copied()
    }

    /// True if `interface` was brought up.
    #[must_use]
    pub fn is_up(&self, interface: &str) -> bool {
        self.state.lock().up.contains(interface)
    }

    /// Addresses on `interface` in assignment order.
    #[must_use]
    pub fn addresses(&self, interface: &str) -> Vec<IpNet> {
        self.state
            .lock()
            .addresses
            .iter()
            .filter(|(name, _)| name == interface)
            .map(|(_, net)| *net)
            .collect()
    }

    /// Routes currently installed, in insertion order.
    #[must_use]
    pub fn routes(&self) -> Vec<RouteSpec> {
        self.state.lock().routes.clone()
    }

    /// Routes deleted so far, in deletion order.
    #[must_use]
    pub fn deleted_routes(&self) -> Vec<RouteSpec> {
        self.state.lock().deleted.clone()
    }

    /// Assigns an address as if someone else had.
    pub fn preassign_address(&self, interface: &str, address: IpNet) {
        self.state.lock().addresses.push((interface.to_string(), address));
    }

    /// Installs a route as if someone else had.
    pub fn preexisting_route(&self, route: RouteSpec) {
        self.state.lock().routes.push(route);
    }
}

impl LinkOps for FakeLinks {
    async fn link_index(&self, interface: &str) -> Result<u32, NetworkError> {
        let mut state = self.state.lock();
        let position = match state.indexes.iter().position(|name| name == interface) {
            Some(i) => i,
            None => {
                state.indexes.push(interface.to_string());
                state.indexes.len() - 1
            }
        };
        u32::try_from(position + 1).map_err(|_| NetworkError::link(interface, "out of indexes"))
    }

    async fn set_mtu(&self, interface: &str, mtu: u32) -> Result<(), NetworkError> {
        let mut state = self.state.lock();
        if state.fail_mtu {
            return Err(NetworkError::link(interface, "mtu rejected"));
        }
        state.mtu.insert(interface.to_string(), mtu);
        Ok(())
    }

    async fn add_address(&self, interface: &str, address: &IpNet) -> Result<AddOutcome, NetworkError> {
        let mut state = self.state.lock();
        let entry = (interface.to_string(), *address);
        if state.addresses.contains(&entry) {
            return Ok(AddOutcome::AlreadyExists);
        }
        state.addresses.push(entry);
        Ok(AddOutcome::Added)
    }

    async fn set_up(&self, interface: &str) -> Result<(), NetworkError> {
        self.state.lock().up.insert(interface.to_string());
        Ok(())
    }

    async fn add_route(&self, route: &RouteSpec) -> Result<AddOutcome, NetworkError> {
        let mut state = self.state.lock();
        let attempt = state.route_attempts;
        state.route_attempts += 1;
        if state.fail_route_at == Some(attempt) {
            return Err(NetworkError::route(route.destination, "injected failure"));
        }
        if state.routes.contains(route) {
            return Ok(AddOutcome::AlreadyExists);
        }
        state.routes.push(route.clone());
        Ok(AddOutcome::Added)
    }

    async fn delete_route(&self, route: &RouteSpec) -> Result<DeleteOutcome, NetworkError> {
        let mut state = self.state.lock();
        if state.fail_route_delete.contains(&route.destination) {
            return Err(NetworkError::route(route.destination, "injected failure"));
        }
        match state.routes.iter().position(|r| r == route) {
            Some(i) => {
                let removed = state.routes.remove(i);
                state.deleted.push(removed);
                Ok(DeleteOutcome::Deleted)
            }
            None => Ok(DeleteOutcome::NotFound),
        }
    }
}

#[derive(Debug)]
struct ResolverState {
    available: bool,
    fail_revert: bool,
    links: HashMap<u32, Vec<IpAddr>>,
    default_route: HashSet<u32>,
}

/// In-memory resolver daemon.
#[derive(Debug, Clone)]
pub struct FakeResolver {
    state: Arc<Mutex<ResolverState>>,
}

impl Default for FakeResolver {
    fn default() -> Self {
        Self {
            state: Arc::new(Mutex::new(ResolverState {
                available: true,
                fail_revert: false,
                links: HashMap::new(),
                default_route: HashSet::new(),
            })),
        }
    }
}

impl FakeResolver {
    /// Simulates the daemon running or not.
    pub fn set_available(&self, available: bool) {
        self.state.lock().available = available;
    }

    /// Makes reverting a link fail.
    pub fn fail_revert(&self) {
        self.state.lock().fail_revert = true;
    }

    fn heal(&self) {
        self.state.lock().fail_revert = false;
    }

    /// Servers registered for link `ifindex`.
    #[must_use]
    pub fn servers(&self, ifindex: u32) -> Vec<IpAddr> {
        self.state.lock().links.get(&ifindex).cloned().unwrap_or_default()
    }

    /// True if link `ifindex` is the default DNS route.
    #[must_use]
    pub fn is_default_route(&self, ifindex: u32) -> bool {
        self.state.lock().default_route.contains(&ifindex)
    }
}

impl ResolverDaemon for FakeResolver {
    async fn set_link_dns(&self, ifindex: u32, servers: &[IpAddr]) -> Result<(), NetworkError> {
        let mut state = self.state.lock();
        if !state.available {
            return Err(NetworkError::Dns("resolver daemon not running".to_string()));
        }
        state.links.insert(ifindex, servers.to_vec());
        Ok(())
    }

    async fn set_link_default_route(&self, ifindex: u32, enable: bool) -> Result<(), NetworkError> {
        let mut state = self.state.lock();
        if !state.available {
            return Err(NetworkError::Dns("resolver daemon not running".to_string()));
        }
        if enable {
            state.default_route.insert(ifindex);
        } else {
            state.default_route.remove(&ifindex);
        }
        Ok(())
    }

    async fn revert_link(&self, ifindex: u32) -> Result<(), NetworkError> {
        let mut state = self.state.lock();
        if state.fail_revert {
            return Err(NetworkError::Dns(format!("cannot revert link {ifindex}")));
        }
        state.links.remove(&ifindex);
        state.default_route.remove(&ifindex);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::PeerUpdate;
    use crate::keys::PrivateKey;

    #[test]
    fn device_lifecycle_is_recorded() {
        let backend = FakeBackend::new();
        let mut device = backend.create_device("wg0", 1420).expect("device");
        let engine = backend.create_engine(&device).expect("engine");
        engine.up().expect("up");
        engine.close().expect("close engine");
        device.close().expect("close device");

        assert_eq!(
            backend.events(),
            [
                FakeEvent::DeviceCreated("wg0".into()),
                FakeEvent::EngineCreated("wg0".into()),
                FakeEvent::EngineUp("wg0".into()),
                FakeEvent::EngineClosed("wg0".into()),
                FakeEvent::DeviceClosed("wg0".into()),
            ]
        );
        assert!(backend.live_devices().is_empty());
    }

    #[test]
    fn duplicate_device_rejected() {
        let backend = FakeBackend::new();
        let _first = backend.create_device("wg0", 1420).expect("device");
        assert!(backend.create_device("wg0", 1420).is_err());
    }

    #[test]
    fn assigned_name_overrides_request() {
        let backend = FakeBackend::new();
        backend.assign_device_name("utun4");
        let device = backend.create_device("wg0", 1420).expect("device");
        assert_eq!(device.name(), "utun4");
    }

    #[test]
    fn traffic_shows_in_snapshot() {
        let backend = FakeBackend::new();
        let device = backend.create_device("wg0", 1420).expect("device");
        let engine = backend.create_engine(&device).expect("engine");
        let key = PrivateKey::generate().public_key();
        engine
            .apply(&DeviceUpdate {
                peers: vec![PeerUpdate::new(key)],
                ..DeviceUpdate::default()
            })
            .expect("apply");

        assert!(backend.simulate_traffic("wg0", &key, 100, 50));
        let snapshot = engine.snapshot().expect("snapshot");
        assert_eq!((snapshot.peers[0].rx_bytes, snapshot.peers[0].tx_bytes), (100, 50));
        assert!(!backend.simulate_traffic("wg0", &PrivateKey::generate().public_key(), 1, 1));
    }

    #[test]
    fn closed_engine_rejects_requests() {
        let backend = FakeBackend::new();
        let device = backend.create_device("wg0", 1420).expect("device");
        let engine = backend.create_engine(&device).expect("engine");
        engine.close().expect("close");
        assert!(engine.snapshot().is_err());
        assert!(engine.apply(&DeviceUpdate::default()).is_err());
    }

    #[test]
    fn injected_close_failures_keep_resources_live() {
        let backend = FakeBackend::new();
        let mut device = backend.create_device("wg0", 1420).expect("device");
        let engine = backend.create_engine(&device).expect("engine");
        backend.fail_engine_close();
        backend.fail_device_close();

        assert!(engine.close().is_err());
        assert!(device.close().is_err());
        assert_eq!(backend.live_devices(), ["wg0"]);
        assert!(backend.engine_snapshot("wg0").is_some());

        backend.heal();
        engine.close().expect("close engine");
        device.close().expect("close device");
        assert!(backend.live_devices().is_empty());
    }

    #[test]
    fn probe_sees_devices_and_external_interfaces() {
        let backend = FakeBackend::new();
        let _device = backend.create_device("wg0", 1420).expect("device");
        backend.add_external_interface("wg9", Some(Ipv4Addr::new(10, 9, 0, 1)));
        assert!(backend.exists("wg0"));
        assert!(backend.exists("wg9"));
        assert!(!backend.exists("wg5"));
        assert_eq!(backend.ipv4_address("wg9"), Some(Ipv4Addr::new(10, 9, 0, 1)));
    }
}
