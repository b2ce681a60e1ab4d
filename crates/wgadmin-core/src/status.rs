//! Live tunnel status and per-peer health.
//!
//! Everything here is computed from an engine snapshot at query time;
//! nothing is cached between calls.

use std::fmt;
use std::net::SocketAddr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use ipnet::IpNet;
use serde::{Serialize, Serializer};

use crate::config::Config;
use crate::engine::{DeviceSnapshot, PeerSnapshot};
use crate::keys::PublicKey;

/// Handshake age after which a peer is no longer considered healthy.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(180);

/// Lifecycle state of a tunnel client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TunnelState {
    /// Nothing acquired.
    #[default]
    Stopped,
    /// Resources are being acquired.
    Starting,
    /// Fully up.
    Running,
    /// Resources are being released.
    Stopping,
}

impl fmt::Display for TunnelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stopped => write!(f, "stopped"),
            Self::Starting => write!(f, "starting"),
            Self::Running => write!(f, "running"),
            Self::Stopping => write!(f, "stopping"),
        }
    }
}

/// Health of a peer judged by its last handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PeerHealth {
    /// Handshake within the last third of the timeout.
    Healthy,
    /// Handshake within the timeout but not recent.
    Degraded,
    /// No handshake within the timeout.
    Unhealthy,
    /// Never completed a handshake.
    #[default]
    Unreachable,
}

impl PeerHealth {
    /// Health for a peer whose last handshake was at `last`.
    #[must_use]
    pub fn at(last: Option<SystemTime>, now: SystemTime, timeout: Duration) -> Self {
        let Some(last) = last else {
            return Self::Unreachable;
        };
        // A handshake stamped in the future counts as just now.
        let elapsed = now.duration_since(last).unwrap_or_default();
        if elapsed < timeout / 3 {
            Self::Healthy
        } else if elapsed < timeout {
            Self::Degraded
        } else {
            Self::Unhealthy
        }
    }
}

impl fmt::Display for PeerHealth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Healthy => write!(f, "healthy"),
            Self::Degraded => write!(f, "degraded"),
            Self::Unhealthy => write!(f, "unhealthy"),
            Self::Unreachable => write!(f, "unreachable"),
        }
    }
}

fn unix_seconds<S: Serializer>(time: &Option<SystemTime>, serializer: S) -> Result<S::Ok, S::Error> {
    match time.and_then(|t| t.duration_since(UNIX_EPOCH).ok()) {
        Some(d) => serializer.serialize_some(&d.as_secs()),
        None => serializer.serialize_none(),
    }
}

/// Live statistics for one peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PeerStats {
    /// Peer identity.
    pub public_key: PublicKey,
    /// Display name from the tunnel file, empty if none.
    pub name: String,
    /// Current endpoint.
    pub endpoint: Option<SocketAddr>,
    /// Allowed ranges.
    pub allowed_ips: Vec<IpNet>,
    /// Last completed handshake, serialized as Unix seconds.
    #[serde(serialize_with = "unix_seconds")]
    pub last_handshake: Option<SystemTime>,
    /// Bytes received from the peer.
    pub rx_bytes: u64,
    /// Bytes sent to the peer.
    pub tx_bytes: u64,
    /// Health at query time.
    pub health: PeerHealth,
}

impl PeerStats {
    /// Builds stats for `peer`, naming it from `config` when possible.
    #[must_use]
    pub fn from_snapshot(peer: &PeerSnapshot, config: &Config, now: SystemTime) -> Self {
        Self {
            public_key: peer.public_key,
            name: config
                .peer_by_key(&peer.public_key)
                .map(|p| p.name.clone())
                .unwrap_or_default(),
            endpoint: peer.endpoint,
            allowed_ips: peer.allowed_ips.clone(),
            last_handshake: peer.last_handshake,
            rx_bytes: peer.rx_bytes,
            tx_bytes: peer.tx_bytes,
            health: PeerHealth::at(peer.last_handshake, now, DEFAULT_HANDSHAKE_TIMEOUT),
        }
    }

    /// Time since the last handshake, if there was one.
    #[must_use]
    pub fn since_handshake(&self, now: SystemTime) -> Option<Duration> {
        self.last_handshake.and_then(|t| now.duration_since(t).ok())
    }
}

/// Status of a running tunnel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TunnelStatus {
    /// Tunnel name from the tunnel file.
    pub name: String,
    /// Live interface name.
    pub interface: String,
    /// Lifecycle state.
    pub state: TunnelState,
    /// Our public key.
    pub public_key: Option<PublicKey>,
    /// Bound UDP port.
    pub listen_port: u16,
    /// Firewall mark, 0 if unset.
    pub fwmark: u32,
    /// Per-peer statistics in engine order.
    pub peers: Vec<PeerStats>,
}

impl TunnelStatus {
    /// Builds a status from a live snapshot.
    #[must_use]
    pub fn from_snapshot(
        interface: &str,
        state: TunnelState,
        snapshot: &DeviceSnapshot,
        config: &Config,
        now: SystemTime,
    ) -> Self {
        Self {
            name: config.name.clone(),
            interface: interface.to_string(),
            state,
            public_key: snapshot.public_key(),
            listen_port: snapshot.listen_port,
            fwmark: snapshot.fwmark,
            peers: snapshot
                .peers
                .iter()
                .map(|peer| PeerStats::from_snapshot(peer, config, now))
                .collect(),
        }
    }

    /// Total bytes received over all peers.
    #[must_use]
    pub fn total_rx(&self) -> u64 {
        self.peers.iter().map(|p| p.rx_bytes).sum()
    }

    /// Total bytes sent over all peers.
    #[must_use]
    pub fn total_tx(&self) -> u64 {
        self.peers.iter().map(|p| p.tx_bytes).sum()
    }

    /// Number of peers currently healthy.
    #[must_use]
    pub fn healthy_peer_count(&self) -> usize {
        self.peers.iter().filter(|p| p.health == PeerHealth::Healthy).count()
    }

    /// Finds a peer by public key.
    #[must_use]
    pub fn find_peer(&self, public_key: &PublicKey) -> Option<&PeerStats> {
        self.peers.iter().find(|p| &p.public_key == public_key)
    }
}
