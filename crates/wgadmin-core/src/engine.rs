//! Seams to the secure-tunnel engine and its network device.
//!
//! The handshake and packet crypto live in an external engine. This crate
//! only hands it keys and peers ([`DeviceUpdate`]) and reads back live
//! transfer statistics ([`DeviceSnapshot`]).

use std::collections::HashSet;
use std::net::SocketAddr;
use std::time::SystemTime;

use ipnet::IpNet;
use thiserror::Error;

use crate::config::Config;
use crate::keys::{PresharedKey, PrivateKey, PublicKey};

/// `EINVAL`: malformed or conflicting configuration.
pub const EINVAL: i32 = 22;

/// `EIO`: the engine could not carry out the request.
pub const EIO: i32 = 5;

/// Engine-side failure, reported over the control protocol as an errno.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message} (errno {errno})")]
pub struct EngineError {
    /// Errno reported to control-socket clients.
    pub errno: i32,
    /// Description for logs.
    pub message: String,
}

impl EngineError {
    /// A rejected request.
    #[must_use]
    pub fn invalid(message: impl Into<String>) -> Self {
        Self {
            errno: EINVAL,
            message: message.into(),
        }
    }

    /// An engine-side I/O failure.
    #[must_use]
    pub fn io(message: impl Into<String>) -> Self {
        Self {
            errno: EIO,
            message: message.into(),
        }
    }
}

/// Network device creation or teardown failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct DeviceError(pub String);

/// A configuration change pushed into the engine.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceUpdate {
    /// New private key.
    pub private_key: Option<PrivateKey>,
    /// New listen port.
    pub listen_port: Option<u16>,
    /// New firewall mark; `Some(0)` clears it.
    pub fwmark: Option<u32>,
    /// Drop every existing peer before applying `peers`.
    pub replace_peers: bool,
    /// Peers to add, change or remove.
    pub peers: Vec<PeerUpdate>,
}

impl DeviceUpdate {
    /// Full replacement of the engine's configuration from a tunnel config.
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        let iface = &config.interface;
        Self {
            private_key: iface.private_key.clone(),
            listen_port: iface.listen_port,
            fwmark: Some(iface.fwmark.unwrap_or(0)),
            replace_peers: true,
            peers: config
                .peers
                .iter()
                .filter_map(|peer| {
                    let mut update = PeerUpdate::new(peer.public_key?);
                    update.preshared_key.clone_from(&peer.preshared_key);
                    update.endpoint = peer.endpoint;
                    update.persistent_keepalive = Some(peer.persistent_keepalive.unwrap_or(0));
                    update.replace_allowed_ips = true;
                    update.allowed_ips.clone_from(&peer.allowed_ips);
                    Some(update)
                })
                .collect(),
        }
    }
}

/// One peer's part of a [`DeviceUpdate`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerUpdate {
    /// Peer identity.
    pub public_key: PublicKey,
    /// Remove this peer instead of updating it.
    pub remove: bool,
    /// New preshared key; the all-zero key clears it.
    pub preshared_key: Option<PresharedKey>,
    /// New endpoint.
    pub endpoint: Option<SocketAddr>,
    /// New keepalive in seconds; `Some(0)` disables it.
    pub persistent_keepalive: Option<u16>,
    /// Drop existing allowed ranges before adding `allowed_ips`.
    pub replace_allowed_ips: bool,
    /// Allowed ranges to add.
    pub allowed_ips: Vec<IpNet>,
}

impl PeerUpdate {
    /// An update that touches nothing but names the peer.
    #[must_use]
    pub fn new(public_key: PublicKey) -> Self {
        Self {
            public_key,
            remove: false,
            preshared_key: None,
            endpoint: None,
            persistent_keepalive: None,
            replace_allowed_ips: false,
            allowed_ips: Vec::new(),
        }
    }
}

/// Live engine state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceSnapshot {
    /// Configured private key.
    pub private_key: Option<PrivateKey>,
    /// Bound UDP port, 0 if none.
    pub listen_port: u16,
    /// Firewall mark, 0 if none.
    pub fwmark: u32,
    /// Peers with live counters.
    pub peers: Vec<PeerSnapshot>,
}

impl DeviceSnapshot {
    /// Public key of the configured private key.
    #[must_use]
    pub fn public_key(&self) -> Option<PublicKey> {
        self.private_key.as_ref().map(PrivateKey::public_key)
    }

    /// Applies `update` to this state, all or nothing.
    ///
    /// # Errors
    ///
    /// Returns `EINVAL` if the update names the same peer twice.
    pub fn merge(&mut self, update: &DeviceUpdate) -> Result<(), EngineError> {
        let mut seen = HashSet::new();
        if let Some(dup) = update.peers.iter().find(|p| !seen.insert(p.public_key)) {
            return Err(EngineError::invalid(format!("duplicate peer {}", dup.public_key)));
        }

        let mut next = self.clone();
        if let Some(ref key) = update.private_key {
            next.private_key = Some(key.clone());
        }
        if let Some(port) = update.listen_port {
            next.listen_port = port;
        }
        if let Some(mark) = update.fwmark {
            next.fwmark = mark;
        }
        if update.replace_peers {
            next.peers.clear();
        }

        for change in &update.peers {
            let existing = next.peers.iter().position(|p| p.public_key == change.public_key);
            if change.remove {
                if let Some(i) = existing {
                    next.peers.remove(i);
                }
                continue;
            }
            let i = existing.unwrap_or_else(|| {
                next.peers.push(PeerSnapshot::new(change.public_key));
                next.peers.len() - 1
            });
            let peer = &mut next.peers[i];
            if let Some(ref psk) = change.preshared_key {
                peer.preshared_key = (!psk.is_zero()).then(|| psk.clone());
            }
            if change.endpoint.is_some() {
                peer.endpoint = change.endpoint;
            }
            if let Some(keepalive) = change.persistent_keepalive {
                peer.persistent_keepalive = keepalive;
            }
            if change.replace_allowed_ips {
                peer.allowed_ips.clear();
            }
            for range in &change.allowed_ips {
                if !peer.allowed_ips.contains(range) {
                    peer.allowed_ips.push(*range);
                }
            }
        }

        *self = next;
        Ok(())
    }
}

/// One peer's live state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerSnapshot {
    /// Peer identity.
    pub public_key: PublicKey,
    /// Preshared key, if any.
    pub preshared_key: Option<PresharedKey>,
    /// Current endpoint (may roam).
    pub endpoint: Option<SocketAddr>,
    /// Keepalive in seconds, 0 if disabled.
    pub persistent_keepalive: u16,
    /// Last completed handshake.
    pub last_handshake: Option<SystemTime>,
    /// Bytes received from the peer.
    pub rx_bytes: u64,
    /// Bytes sent to the peer.
    pub tx_bytes: u64,
    /// Allowed ranges.
    pub allowed_ips: Vec<IpNet>,
}

impl PeerSnapshot {
    /// A peer with no traffic yet.
    #[must_use]
    pub fn new(public_key: PublicKey) -> Self {
        Self {
            public_key,
            preshared_key: None,
            endpoint: None,
            persistent_keepalive: 0,
            last_handshake: None,
            rx_bytes: 0,
            tx_bytes: 0,
            allowed_ips: Vec::new(),
        }
    }
}

/// The external secure-tunnel engine bound to one device.
///
/// Methods are synchronous and may block on OS calls. The control socket
/// serves them from its per-connection tasks.
pub trait Engine: Send + Sync + 'static {
    /// Applies a configuration change atomically.
    fn apply(&self, update: &DeviceUpdate) -> Result<(), EngineError>;

    /// Reads the live device state.
    fn snapshot(&self) -> Result<DeviceSnapshot, EngineError>;

    /// Starts moving packets.
    fn up(&self) -> Result<(), EngineError>;

    /// Stops the engine. Called once during teardown.
    fn close(&self) -> Result<(), EngineError>;
}

/// A created network device.
pub trait TunDevice: Send + Sync + 'static {
    /// Name the platform actually assigned.
    fn name(&self) -> &str;

    /// Destroys the device. Called once during teardown.
    fn close(&mut self) -> Result<(), DeviceError>;
}
